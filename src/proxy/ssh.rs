//! SSH inspector: host and remote-command rules for SSH-over-SOCKS.
//!
//! Post-handshake SSH traffic is opaque, so enforcement is layered: the
//! host check runs at connect time inside the SOCKS proxy, and remote
//! commands are checked against the client invocation the preflight
//! analyzer already parsed (`ssh host cmd args`).

use crate::analyzer;
use crate::config::{CommandConfig, SshConfig};
use crate::hosts::any_host_matches;

/// Verdict for an SSH invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshVerdict {
    Allow,
    Deny(String),
}

impl SshVerdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, SshVerdict::Allow)
    }
}

/// Connect-time host check: `deniedHosts` first, then `allowedHosts`
/// (exclusive when non-empty).
pub fn check_host(ssh: &SshConfig, host: &str) -> Result<(), String> {
    if let Some(rule) = ssh
        .denied_hosts
        .iter()
        .find(|p| crate::hosts::host_matches(p, host))
    {
        return Err(format!("denied by rule '{}'", rule));
    }
    if !ssh.allowed_hosts.is_empty() && !any_host_matches(&ssh.allowed_hosts, host) {
        return Err("not in allowedHosts".into());
    }
    Ok(())
}

/// Evaluate a full `ssh host [command]` invocation.
///
/// Order: deniedHosts → allowedHosts → no remote command ⇒ allow
/// interactive → deniedCommands → (inheritDeny) global command.deny →
/// (allowAllCommands) allow → allowedCommands prefix → default deny.
pub fn evaluate_command(
    ssh: &SshConfig,
    global: &CommandConfig,
    host: &str,
    command: Option<&str>,
) -> SshVerdict {
    if let Err(reason) = check_host(ssh, host) {
        return SshVerdict::Deny(format!("host {}", reason));
    }

    let Some(command) = command else {
        // Interactive session: nothing further to match.
        return SshVerdict::Allow;
    };
    let command = analyzer::normalize_command(command);

    if let Some(rule) = ssh
        .denied_commands
        .iter()
        .find(|p| analyzer::command_prefix_matches(p, &command))
    {
        return SshVerdict::Deny(format!("command denied by rule '{}'", rule));
    }

    if ssh.inherit_deny
        && let analyzer::Verdict::Deny { pattern, .. } = analyzer::analyze(&command, global)
    {
        return SshVerdict::Deny(format!("command denied by global rule '{}'", pattern));
    }

    if ssh.allow_all_commands {
        return SshVerdict::Allow;
    }

    if ssh
        .allowed_commands
        .iter()
        .any(|p| analyzer::command_prefix_matches(p, &command))
    {
        return SshVerdict::Allow;
    }

    SshVerdict::Deny("command not in allowedCommands".into())
}
