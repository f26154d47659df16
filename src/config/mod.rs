//! Declarative sandbox policy: data model, loading, and validation.
//!
//! Policies are JSON files (C/C++-style comments permitted) with top-level
//! `extends`, `allowPty`, `network`, `filesystem`, `command`, and `ssh`
//! blocks. A policy is constructed once at launcher startup by resolving its
//! extends chain and merging, validated, and immutable afterwards.

mod defaults;
mod merge;
pub mod schema;

pub use defaults::{DEFAULT_DENIED_COMMANDS, default_config_paths, template_path};
pub use merge::{ExtendsRef, merge, resolve_extends};

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::FenceError;

/// Maximum depth of an `extends` chain.
pub const MAX_EXTENDS_DEPTH: usize = 10;

/// Network egress policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkConfig {
    /// Host patterns permitted for outbound connections. The literal `*`
    /// allows any host and disables network namespace isolation.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_domains: Vec<String>,

    /// Host patterns always refused, evaluated before `allowed_domains`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub denied_domains: Vec<String>,

    /// Unix socket paths reachable from inside the sandbox.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allow_unix_sockets: Vec<String>,

    #[serde(skip_serializing_if = "is_false")]
    pub allow_all_unix_sockets: bool,

    /// Permit binding/listening on localhost inside the sandbox.
    #[serde(skip_serializing_if = "is_false")]
    pub allow_local_binding: bool,

    /// Permit outbound connections to localhost. Unset inherits
    /// `allow_local_binding`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_local_outbound: Option<bool>,

    /// Fixed HTTP proxy port; 0 picks an ephemeral port.
    #[serde(skip_serializing_if = "is_zero")]
    pub http_proxy_port: u16,

    /// Fixed SOCKS proxy port; 0 picks an ephemeral port.
    #[serde(skip_serializing_if = "is_zero")]
    pub socks_proxy_port: u16,
}

impl NetworkConfig {
    /// Effective policy for outbound connections to loopback addresses.
    pub fn local_outbound_allowed(&self) -> bool {
        self.allow_local_outbound.unwrap_or(self.allow_local_binding)
    }

    /// True when `allowed_domains` contains the literal `*`, meaning direct
    /// network access is permitted and namespace isolation is skipped.
    pub fn has_wildcard_allow(&self) -> bool {
        self.allowed_domains.iter().any(|d| d == "*")
    }

    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Filesystem visibility policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilesystemConfig {
    /// Deny all reads except the essential catalog and `allow_read`.
    #[serde(skip_serializing_if = "is_false")]
    pub default_deny_read: bool,

    /// Bind /init for WSL interop. Unset auto-detects on Linux.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wsl_interop: Option<bool>,

    /// Paths readable including directory listing.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allow_read: Vec<String>,

    /// Paths executable (and readable as files) but not listable.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allow_execute: Vec<String>,

    /// Paths hidden from the sandbox entirely.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deny_read: Vec<String>,

    /// Writable paths (write implies read).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allow_write: Vec<String>,

    /// Paths forced read-only, taking precedence over `allow_write`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deny_write: Vec<String>,

    /// Permit writes to `.git/config` (otherwise mandatory-denied).
    #[serde(skip_serializing_if = "is_false")]
    pub allow_git_config: bool,
}

impl FilesystemConfig {
    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Command preflight policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandConfig {
    /// Command prefix patterns to reject.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,

    /// Exception prefixes that override individual deny matches.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,

    /// Mix the built-in dangerous-command catalog into `deny`.
    /// Unset is treated as true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_defaults: Option<bool>,
}

impl CommandConfig {
    /// Whether the built-in dangerous-command catalog applies.
    pub fn use_default_denied_commands(&self) -> bool {
        self.use_defaults.unwrap_or(true)
    }

    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// SSH usage policy, enforced by the SOCKS-layer inspector and preflight.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SshConfig {
    /// Host patterns SSH may connect to.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_hosts: Vec<String>,

    /// Host patterns SSH may never connect to.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub denied_hosts: Vec<String>,

    /// Remote command prefixes permitted.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_commands: Vec<String>,

    /// Remote command prefixes refused.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub denied_commands: Vec<String>,

    /// Switch from allow-list to deny-list mode for remote commands.
    #[serde(skip_serializing_if = "is_false")]
    pub allow_all_commands: bool,

    /// Also apply the global `command.deny` rules to SSH payloads.
    #[serde(skip_serializing_if = "is_false")]
    pub inherit_deny: bool,
}

impl SshConfig {
    /// True when no SSH rules are configured at all; SSH enforcement is
    /// opt-in by writing any field of the block.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// A complete sandbox policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Editor hint; accepted and ignored.
    #[serde(rename = "$schema", skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Parent policy: a template name (bare identifier) or a file path
    /// (contains a separator or begins with `.`). Cleared once resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,

    /// Allow pseudo-terminal allocation (macOS profile toggle).
    #[serde(skip_serializing_if = "is_false")]
    pub allow_pty: bool,

    #[serde(skip_serializing_if = "NetworkConfig::is_empty")]
    pub network: NetworkConfig,

    #[serde(skip_serializing_if = "FilesystemConfig::is_empty")]
    pub filesystem: FilesystemConfig,

    #[serde(skip_serializing_if = "CommandConfig::is_empty")]
    pub command: CommandConfig,

    #[serde(skip_serializing_if = "SshConfig::is_empty")]
    pub ssh: SshConfig,
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &u16) -> bool {
    *n == 0
}

impl Config {
    /// Load and strictly validate a policy file. Unknown keys are rejected.
    pub fn load(path: &Path) -> Result<Config, FenceError> {
        Self::load_inner(path, true)
    }

    /// Load a policy file tolerating unknown keys. Used for merge bases
    /// (templates written by newer versions of the tool).
    pub fn load_lenient(path: &Path) -> Result<Config, FenceError> {
        Self::load_inner(path, false)
    }

    fn load_inner(path: &Path, strict: bool) -> Result<Config, FenceError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            FenceError::PolicyInvalid(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::parse_inner(&text, strict)
            .map_err(|e| FenceError::PolicyInvalid(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), strict, "loaded policy file");
        Ok(config)
    }

    /// Parse policy text (JSON with comments) with strict key checking.
    pub fn parse(text: &str) -> Result<Config, FenceError> {
        Self::parse_inner(text, true).map_err(FenceError::PolicyInvalid)
    }

    fn parse_inner(text: &str, strict: bool) -> Result<Config, String> {
        // json5 is a superset of JSON that accepts // and /* */ comments.
        let value: serde_json::Value =
            json5::from_str(text).map_err(|e| format!("parse error: {}", e))?;
        if strict {
            validate_known_keys(&value)?;
        }
        let config: Config =
            serde_json::from_value(value).map_err(|e| format!("invalid value: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to clean JSON, omitting empty blocks and fields.
    pub fn to_json(&self) -> Result<String, FenceError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| FenceError::Internal(format!("serialize config: {}", e)))
    }

    /// Structural validation beyond shape: pattern sanity.
    fn validate(&self) -> Result<(), String> {
        for (field, patterns) in [
            ("network.allowedDomains", &self.network.allowed_domains),
            ("network.deniedDomains", &self.network.denied_domains),
            ("ssh.allowedHosts", &self.ssh.allowed_hosts),
            ("ssh.deniedHosts", &self.ssh.denied_hosts),
        ] {
            for p in patterns {
                validate_host_pattern(p)
                    .map_err(|e| format!("{}: invalid pattern '{}': {}", field, p, e))?;
            }
        }
        for p in &self.network.allow_unix_sockets {
            if !p.starts_with('/') {
                return Err(format!(
                    "network.allowUnixSockets: path must be absolute, got '{}'",
                    p
                ));
            }
        }
        Ok(())
    }
}

/// Host patterns may contain label-safe characters and `*` wildcards.
fn validate_host_pattern(pattern: &str) -> Result<(), String> {
    if pattern.is_empty() {
        return Err("empty pattern".into());
    }
    for c in pattern.chars() {
        if !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '*')) {
            return Err(format!("unexpected character '{}'", c));
        }
    }
    Ok(())
}

/// Reject unknown keys with an error naming the offending option.
///
/// Checking the raw JSON value (rather than serde's `deny_unknown_fields`)
/// lets the lenient merge-base path reuse the same model and produces
/// errors that name the full dotted key.
fn validate_known_keys(value: &serde_json::Value) -> Result<(), String> {
    const TOP: &[&str] = &[
        "$schema",
        "extends",
        "allowPty",
        "network",
        "filesystem",
        "command",
        "ssh",
    ];
    const NETWORK: &[&str] = &[
        "allowedDomains",
        "deniedDomains",
        "allowUnixSockets",
        "allowAllUnixSockets",
        "allowLocalBinding",
        "allowLocalOutbound",
        "httpProxyPort",
        "socksProxyPort",
    ];
    const FILESYSTEM: &[&str] = &[
        "defaultDenyRead",
        "wslInterop",
        "allowRead",
        "allowExecute",
        "denyRead",
        "allowWrite",
        "denyWrite",
        "allowGitConfig",
    ];
    const COMMAND: &[&str] = &["deny", "allow", "useDefaults"];
    const SSH: &[&str] = &[
        "allowedHosts",
        "deniedHosts",
        "allowedCommands",
        "deniedCommands",
        "allowAllCommands",
        "inheritDeny",
    ];

    let obj = value
        .as_object()
        .ok_or_else(|| "policy must be a JSON object".to_string())?;

    check_keys(obj, TOP, "")?;
    for (section, known) in [
        ("network", NETWORK),
        ("filesystem", FILESYSTEM),
        ("command", COMMAND),
        ("ssh", SSH),
    ] {
        if let Some(sub) = obj.get(section) {
            let sub_obj = sub
                .as_object()
                .ok_or_else(|| format!("'{}' must be an object", section))?;
            check_keys(sub_obj, known, section)?;
        }
    }
    Ok(())
}

fn check_keys(
    obj: &serde_json::Map<String, serde_json::Value>,
    known: &[&str],
    prefix: &str,
) -> Result<(), String> {
    for key in obj.keys() {
        if !known.contains(&key.as_str()) {
            let dotted = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", prefix, key)
            };
            return Err(format!("unknown option '{}'", dotted));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_policy() {
        let cfg = Config::parse("{}").unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn parse_full_policy() {
        let cfg = Config::parse(
            r#"{
                "extends": "base",
                "allowPty": true,
                "network": {
                    "allowedDomains": ["example.com", "*.github.com"],
                    "httpProxyPort": 3128
                },
                "filesystem": {
                    "defaultDenyRead": true,
                    "allowWrite": ["."]
                },
                "command": {"deny": ["git push"], "useDefaults": false},
                "ssh": {"allowedHosts": ["*.internal"], "inheritDeny": true}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.extends.as_deref(), Some("base"));
        assert!(cfg.allow_pty);
        assert_eq!(cfg.network.http_proxy_port, 3128);
        assert!(cfg.filesystem.default_deny_read);
        assert_eq!(cfg.command.use_defaults, Some(false));
        assert!(cfg.ssh.inherit_deny);
    }

    #[test]
    fn parse_accepts_comments() {
        let cfg = Config::parse(
            r#"{
                // network rules
                "network": {
                    /* only example.com */
                    "allowedDomains": ["example.com"]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.network.allowed_domains, vec!["example.com"]);
    }

    #[test]
    fn parse_rejects_unknown_top_level_key() {
        let err = Config::parse(r#"{"netwerk": {}}"#).unwrap_err();
        assert!(err.to_string().contains("unknown option 'netwerk'"), "{err}");
    }

    #[test]
    fn parse_rejects_unknown_nested_key() {
        let err = Config::parse(r#"{"network": {"alowedDomains": []}}"#).unwrap_err();
        assert!(
            err.to_string().contains("unknown option 'network.alowedDomains'"),
            "{err}"
        );
    }

    #[test]
    fn parse_tolerates_schema_key() {
        let cfg = Config::parse(r#"{"$schema": "https://example.com/fence.schema.json"}"#).unwrap();
        assert!(cfg.schema.is_some());
    }

    #[test]
    fn parse_rejects_bad_host_pattern() {
        let err = Config::parse(r#"{"network": {"allowedDomains": ["exa mple.com"]}}"#).unwrap_err();
        assert!(err.to_string().contains("invalid pattern"), "{err}");
    }

    #[test]
    fn parse_rejects_relative_unix_socket() {
        let err =
            Config::parse(r#"{"network": {"allowUnixSockets": ["tmp/x.sock"]}}"#).unwrap_err();
        assert!(err.to_string().contains("must be absolute"), "{err}");
    }

    #[test]
    fn tri_state_defaults() {
        let cfg = Config::default();
        assert!(cfg.command.use_default_denied_commands());
        assert!(!cfg.network.local_outbound_allowed());

        let mut cfg = Config::default();
        cfg.network.allow_local_binding = true;
        assert!(cfg.network.local_outbound_allowed());
        cfg.network.allow_local_outbound = Some(false);
        assert!(!cfg.network.local_outbound_allowed());
    }

    #[test]
    fn wildcard_allow_detection() {
        let mut cfg = Config::default();
        assert!(!cfg.network.has_wildcard_allow());
        cfg.network.allowed_domains = vec!["example.com".into(), "*".into()];
        assert!(cfg.network.has_wildcard_allow());
    }

    #[test]
    fn round_trip_ignoring_field_order() {
        let cfg = Config::parse(
            r#"{
                "ssh": {"deniedHosts": ["bad.host"]},
                "network": {"allowedDomains": ["a.com"], "allowLocalOutbound": false},
                "allowPty": true
            }"#,
        )
        .unwrap();
        let json = cfg.to_json().unwrap();
        let back = Config::parse(&json).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn clean_serialization_omits_empty_blocks() {
        let json = Config::default().to_json().unwrap();
        assert_eq!(json.trim(), "{}");

        let mut cfg = Config::default();
        cfg.network.allowed_domains = vec!["a.com".into()];
        let json = cfg.to_json().unwrap();
        assert!(json.contains("allowedDomains"));
        assert!(!json.contains("filesystem"));
        assert!(!json.contains("ssh"));
    }

    #[test]
    fn lenient_parse_tolerates_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.json");
        std::fs::write(&path, r#"{"futureOption": 1, "allowPty": true}"#).unwrap();
        let cfg = Config::load_lenient(&path).unwrap();
        assert!(cfg.allow_pty);
        assert!(Config::load(&path).is_err());
    }
}
