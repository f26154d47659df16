//! Policy merge algebra and extends-chain resolution.
//!
//! Merging an override policy over a base: sequences append (base first)
//! and deduplicate keeping the first occurrence; booleans OR; tri-states
//! keep the override when set; integers keep the override when non-zero.
//! `extends` never survives a merge.

use tracing::debug;

use crate::config::{
    CommandConfig, Config, FilesystemConfig, MAX_EXTENDS_DEPTH, NetworkConfig, SshConfig,
};
use crate::errors::FenceError;

/// A parsed `extends` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendsRef {
    /// Bare identifier, resolved against the template catalog.
    Template(String),
    /// Filesystem path (contains a separator or begins with `.`).
    Path(String),
}

impl ExtendsRef {
    pub fn parse(raw: &str) -> ExtendsRef {
        if raw.contains('/') || raw.contains('\\') || raw.starts_with('.') {
            ExtendsRef::Path(raw.to_string())
        } else {
            ExtendsRef::Template(raw.to_string())
        }
    }

    /// The raw reference text, used for cycle detection.
    pub fn key(&self) -> &str {
        match self {
            ExtendsRef::Template(s) | ExtendsRef::Path(s) => s,
        }
    }
}

/// Merge `over` onto `base`, producing a new policy.
pub fn merge(base: &Config, over: &Config) -> Config {
    Config {
        schema: over.schema.clone().or_else(|| base.schema.clone()),
        // Cleared: a merged policy has no unresolved parent.
        extends: None,
        allow_pty: base.allow_pty || over.allow_pty,
        network: merge_network(&base.network, &over.network),
        filesystem: merge_filesystem(&base.filesystem, &over.filesystem),
        command: merge_command(&base.command, &over.command),
        ssh: merge_ssh(&base.ssh, &over.ssh),
    }
}

fn merge_network(base: &NetworkConfig, over: &NetworkConfig) -> NetworkConfig {
    NetworkConfig {
        allowed_domains: merge_seq(&base.allowed_domains, &over.allowed_domains),
        denied_domains: merge_seq(&base.denied_domains, &over.denied_domains),
        allow_unix_sockets: merge_seq(&base.allow_unix_sockets, &over.allow_unix_sockets),
        allow_all_unix_sockets: base.allow_all_unix_sockets || over.allow_all_unix_sockets,
        allow_local_binding: base.allow_local_binding || over.allow_local_binding,
        allow_local_outbound: over.allow_local_outbound.or(base.allow_local_outbound),
        http_proxy_port: merge_port(base.http_proxy_port, over.http_proxy_port),
        socks_proxy_port: merge_port(base.socks_proxy_port, over.socks_proxy_port),
    }
}

fn merge_filesystem(base: &FilesystemConfig, over: &FilesystemConfig) -> FilesystemConfig {
    FilesystemConfig {
        default_deny_read: base.default_deny_read || over.default_deny_read,
        wsl_interop: over.wsl_interop.or(base.wsl_interop),
        allow_read: merge_seq(&base.allow_read, &over.allow_read),
        allow_execute: merge_seq(&base.allow_execute, &over.allow_execute),
        deny_read: merge_seq(&base.deny_read, &over.deny_read),
        allow_write: merge_seq(&base.allow_write, &over.allow_write),
        deny_write: merge_seq(&base.deny_write, &over.deny_write),
        allow_git_config: base.allow_git_config || over.allow_git_config,
    }
}

fn merge_command(base: &CommandConfig, over: &CommandConfig) -> CommandConfig {
    CommandConfig {
        deny: merge_seq(&base.deny, &over.deny),
        allow: merge_seq(&base.allow, &over.allow),
        use_defaults: over.use_defaults.or(base.use_defaults),
    }
}

fn merge_ssh(base: &SshConfig, over: &SshConfig) -> SshConfig {
    SshConfig {
        allowed_hosts: merge_seq(&base.allowed_hosts, &over.allowed_hosts),
        denied_hosts: merge_seq(&base.denied_hosts, &over.denied_hosts),
        allowed_commands: merge_seq(&base.allowed_commands, &over.allowed_commands),
        denied_commands: merge_seq(&base.denied_commands, &over.denied_commands),
        allow_all_commands: base.allow_all_commands || over.allow_all_commands,
        inherit_deny: base.inherit_deny || over.inherit_deny,
    }
}

/// Append base then override; dedupe preserving first occurrence.
fn merge_seq(base: &[String], over: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(base.len() + over.len());
    for item in base.iter().chain(over.iter()) {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

fn merge_port(base: u16, over: u16) -> u16 {
    if over != 0 { over } else { base }
}

/// Resolve the extends chain of `config` depth-first and return the fully
/// merged policy. `resolver` maps a reference to its parent policy (template
/// catalog lookup or file read). Chains deeper than [`MAX_EXTENDS_DEPTH`]
/// and cycles are rejected.
pub fn resolve_extends<R>(config: Config, resolver: &mut R) -> Result<Config, FenceError>
where
    R: FnMut(&ExtendsRef) -> Result<Config, FenceError>,
{
    let mut visited = Vec::new();
    resolve_inner(config, resolver, &mut visited)
}

fn resolve_inner<R>(
    config: Config,
    resolver: &mut R,
    visited: &mut Vec<String>,
) -> Result<Config, FenceError>
where
    R: FnMut(&ExtendsRef) -> Result<Config, FenceError>,
{
    let Some(raw) = config.extends.clone() else {
        return Ok(config);
    };

    if visited.len() >= MAX_EXTENDS_DEPTH {
        return Err(FenceError::PolicyInvalid(format!(
            "extends chain deeper than {} levels",
            MAX_EXTENDS_DEPTH
        )));
    }
    if visited.iter().any(|seen| seen == &raw) {
        return Err(FenceError::PolicyInvalid(format!(
            "cyclic extends chain: {} -> {}",
            visited.join(" -> "),
            raw
        )));
    }

    let reference = ExtendsRef::parse(&raw);
    debug!(extends = %raw, depth = visited.len(), "resolving extends");
    visited.push(raw);

    let base = resolver(&reference)?;
    let base = resolve_inner(base, resolver, visited)?;
    Ok(merge(&base, &config))
}
