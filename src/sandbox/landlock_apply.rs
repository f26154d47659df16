//! In-sandbox Landlock wrapper: apply the filesystem ruleset, then exec.
//!
//! bwrap re-invokes fence as `fence --landlock-apply -- <cmd...>` inside the
//! sandbox; the policy arrives serialized in `FENCE_CONFIG_JSON`. Landlock
//! rules are additive over a default-deny for the handled access types, so
//! `denyWrite` is enforced by omission (the read-only binds outside this
//! wrapper mask anything nested inside granted trees). Any failure here is
//! fatal: the wrapper never falls back to an unconfined exec.

use landlock::{
    ABI, Access, AccessFs, CompatLevel, Compatible, PathBeneath, PathFd, Ruleset, RulesetAttr,
    RulesetCreated, RulesetCreatedAttr, RulesetStatus,
};
use tracing::debug;

use crate::config::Config;
use crate::errors::FenceError;
use crate::paths::{
    contains_glob_chars, default_readable_paths, default_write_paths, expand_glob_patterns,
    normalize_path,
};
use crate::sandbox::do_exec;

/// Environment variable carrying the serialized policy into the sandbox.
pub const CONFIG_ENV: &str = "FENCE_CONFIG_JSON";

/// Read the policy from the environment, restrict self, exec the command.
pub fn apply_and_exec(command: &[String]) -> Result<std::convert::Infallible, FenceError> {
    if command.is_empty() {
        return Err(FenceError::Internal(
            "--landlock-apply requires a command".into(),
        ));
    }

    let config_json = std::env::var(CONFIG_ENV)
        .map_err(|_| FenceError::Internal(format!("{CONFIG_ENV} not set")))?;
    let config: Config = serde_json::from_str(&config_json)
        .map_err(|e| FenceError::Internal(format!("invalid {CONFIG_ENV}: {e}")))?;

    set_no_new_privs()?;
    install_rules(&config)?;
    debug!(command = ?command, "landlock applied, exec'ing");
    do_exec(command)
}

/// Privilege escalation via setuid binaries stays off inside the sandbox.
fn set_no_new_privs() -> Result<(), FenceError> {
    let result = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if result != 0 {
        return Err(FenceError::Internal(format!(
            "prctl(PR_SET_NO_NEW_PRIVS) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn install_rules(config: &Config) -> Result<(), FenceError> {
    let fs = &config.filesystem;
    let abi = ABI::V5;

    let read_access = AccessFs::ReadFile | AccessFs::ReadDir;
    let execute_access = AccessFs::ReadFile | AccessFs::Execute;
    let write_access = AccessFs::from_all(abi);

    let mut ruleset = Ruleset::default()
        .set_compatibility(CompatLevel::BestEffort)
        .handle_access(AccessFs::from_all(abi))
        .map_err(|e| FenceError::Internal(format!("landlock handle_access: {e}")))?
        .create()
        .map_err(|e| FenceError::Internal(format!("landlock create: {e}")))?;

    if fs.default_deny_read {
        for path in default_readable_paths() {
            ruleset = add_rule(ruleset, &path, read_access | AccessFs::Execute)?;
        }
    } else {
        ruleset = add_rule(ruleset, "/", read_access | AccessFs::Execute)?;
    }

    for path in policy_paths(&fs.allow_read) {
        ruleset = add_rule(ruleset, &path, read_access)?;
    }
    for path in policy_paths(&fs.allow_execute) {
        ruleset = add_rule(ruleset, &path, execute_access)?;
    }
    for path in policy_paths(&fs.allow_write).into_iter().chain(default_write_paths()) {
        ruleset = add_rule(ruleset, &path, write_access)?;
    }

    // Baseline writability every process needs.
    ruleset = add_rule(
        ruleset,
        "/dev/null",
        AccessFs::WriteFile | AccessFs::Truncate | AccessFs::ReadFile,
    )?;
    ruleset = add_rule(ruleset, "/tmp", write_access)?;

    let status = ruleset
        .restrict_self()
        .map_err(|e| FenceError::Internal(format!("landlock restrict_self: {e}")))?;

    if status.ruleset == RulesetStatus::NotEnforced {
        return Err(FenceError::PrerequisiteMissing(
            "landlock ruleset not enforced (kernel may lack Landlock support)".into(),
        ));
    }
    Ok(())
}

/// Grant `access` beneath `path`. Missing paths are skipped: the sandbox
/// must not fail because an optional tool directory is absent.
fn add_rule(
    ruleset: RulesetCreated,
    path: &str,
    access: landlock::BitFlags<AccessFs>,
) -> Result<RulesetCreated, FenceError> {
    match PathFd::new(path) {
        Ok(fd) => ruleset
            .add_rule(PathBeneath::new(fd, access))
            .map_err(|e| FenceError::Internal(format!("landlock add_rule for '{path}': {e}"))),
        Err(_) => Ok(ruleset),
    }
}

fn policy_paths(patterns: &[String]) -> Vec<String> {
    let mut out = expand_glob_patterns(patterns);
    for p in patterns {
        let normalized = normalize_path(p);
        if !contains_glob_chars(&normalized) {
            out.push(normalized);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_config_env() {
        // SAFETY: no other test in this module mutates this variable.
        unsafe { std::env::remove_var(CONFIG_ENV) };
        let err = apply_and_exec(&["true".into()]).unwrap_err();
        assert!(err.to_string().contains(CONFIG_ENV), "{err}");
    }

    #[test]
    fn rejects_empty_command() {
        let err = apply_and_exec(&[]).unwrap_err();
        assert!(err.to_string().contains("requires a command"), "{err}");
    }

    #[test]
    fn policy_paths_mixes_globs_and_plain() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "").unwrap();
        let got = policy_paths(&[
            format!("{}/*.txt", dir.path().display()),
            "/nonexistent/plain".into(),
        ]);
        assert!(got.iter().any(|p| p.ends_with("a.txt")), "{got:?}");
        assert!(got.contains(&"/nonexistent/plain".to_string()));
    }
}
