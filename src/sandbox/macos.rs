//! macOS confinement builder: Seatbelt (SBPL) profile + sandbox-exec line.
//!
//! The profile is default-deny with carve-outs driven by the policy. On
//! macOS `/tmp` is a symlink to `/private/tmp`, so every user-supplied tmp
//! path is mirrored into both spellings. Network access is limited to the
//! loopback proxy ports unless the wildcard domain is present.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::Config;
use crate::errors::FenceError;
use crate::manager::proxy_env_vars;
use crate::paths::{
    DEFAULT_MAX_DANGEROUS_FILE_DEPTH, contains_glob_chars, default_readable_paths,
    expand_glob_patterns, find_dangerous_files, mandatory_deny_paths, normalize_path,
};
use crate::sandbox::ConfinementBuilder;
use crate::sandbox::shell::{ShellMode, quote, resolve_execution_shell};

/// Builder holding the host-side proxy ports the profile references.
pub struct MacosBuilder {
    pub http_port: u16,
    pub socks_port: u16,
}

impl ConfinementBuilder for MacosBuilder {
    fn wrap(&self, config: &Config, command: &str) -> Result<String, FenceError> {
        if !Path::new("/usr/bin/sandbox-exec").exists() {
            return Err(FenceError::PrerequisiteMissing(
                "/usr/bin/sandbox-exec not found".into(),
            ));
        }

        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let profile = compile_profile(config, &cwd, self.http_port, self.socks_port);
        let (shell_path, shell_flag) = resolve_execution_shell(ShellMode::Default, false)?;

        let mut parts: Vec<String> = vec!["env".into()];
        for (key, value) in proxy_env_vars(self.http_port, self.socks_port) {
            parts.push(quote(&format!("{key}={value}")));
        }
        parts.extend([
            "/usr/bin/sandbox-exec".into(),
            "-p".into(),
            quote(&profile),
            "--".into(),
            shell_path.to_string_lossy().into_owned(),
            shell_flag.into(),
            quote(command),
        ]);

        let wrapped = parts.join(" ");
        debug!(profile_lines = profile.lines().count(), "composed seatbelt invocation");
        Ok(wrapped)
    }
}

/// Compile the policy into an SBPL profile string.
pub fn compile_profile(config: &Config, cwd: &Path, http_port: u16, socks_port: u16) -> String {
    let fs = &config.filesystem;
    let mut p = String::from("(version 1)\n(deny default)\n");

    // Baseline process operation.
    p += "(allow process-fork)\n";
    p += "(allow process-exec)\n";
    p += "(allow signal (target same-sandbox))\n";
    p += "(allow sysctl-read)\n";
    p += "(allow mach-lookup)\n";
    p += "(allow mach-register)\n";

    // -- Reads -------------------------------------------------------------
    if fs.default_deny_read {
        for path in default_readable_paths() {
            if Path::new(&path).exists() {
                p += &format!("(allow file-read* (subpath {}))\n", sbpl_string(&path));
            }
        }
        for path in policy_paths(&fs.allow_read).into_iter().chain(policy_paths(&fs.allow_execute)) {
            for mirrored in mirror_tmp(&path) {
                p += &format!("(allow file-read* (subpath {}))\n", sbpl_string(&mirrored));
            }
        }
    } else {
        p += "(allow file-read*)\n";
    }

    for path in policy_paths(&fs.deny_read) {
        for mirrored in mirror_tmp(&path) {
            p += &format!("(deny file-read* (subpath {}))\n", sbpl_string(&mirrored));
        }
    }

    // -- Writes ------------------------------------------------------------
    // Essential device nodes and the fence tmp subtree.
    for dev in ["/dev/null", "/dev/stdout", "/dev/stderr", "/dev/tty", "/dev/dtracehelper"] {
        p += &format!("(allow file-write-data (literal {}))\n", sbpl_string(dev));
        p += &format!("(allow file-read-data (literal {}))\n", sbpl_string(dev));
    }
    for tmp in ["/tmp/fence", "/private/tmp/fence"] {
        p += &format!("(allow file-write* (subpath {}))\n", sbpl_string(tmp));
    }

    for path in policy_paths(&fs.allow_write) {
        for mirrored in mirror_tmp(&path) {
            p += &format!("(allow file-write* (subpath {}))\n", sbpl_string(&mirrored));
        }
    }

    // Mandatory dangerous paths stay unwritable regardless of the allow
    // list; the bounded walk catches instances in subdirectories too.
    let mut deny_writes: Vec<PathBuf> = mandatory_deny_paths(cwd);
    deny_writes.extend(find_dangerous_files(cwd, DEFAULT_MAX_DANGEROUS_FILE_DEPTH));
    for path in deny_writes {
        if fs.allow_git_config && path.ends_with(".git/config") {
            continue;
        }
        let path = path.to_string_lossy();
        let filter = if Path::new(path.as_ref()).is_dir() {
            "subpath"
        } else {
            "literal"
        };
        p += &format!("(deny file-write* ({} {}))\n", filter, sbpl_string(&path));
    }

    for path in policy_paths(&fs.deny_write) {
        for mirrored in mirror_tmp(&path) {
            p += &format!("(deny file-write* (subpath {}))\n", sbpl_string(&mirrored));
        }
    }

    // -- Network -----------------------------------------------------------
    if config.network.has_wildcard_allow() {
        p += "(allow network*)\n";
    } else {
        // Outbound only to the host-side proxies.
        p += &format!(
            "(allow network-outbound (remote ip \"localhost:{}\"))\n",
            http_port
        );
        p += &format!(
            "(allow network-outbound (remote ip \"localhost:{}\"))\n",
            socks_port
        );
        if config.network.allow_local_binding {
            p += "(allow network-bind (local ip \"localhost:*\"))\n";
            p += "(allow network-inbound (local ip \"localhost:*\"))\n";
        }
        if config.network.local_outbound_allowed() {
            p += "(allow network-outbound (remote ip \"localhost:*\"))\n";
        }
        if config.network.allow_all_unix_sockets {
            p += "(allow network-outbound (remote unix-socket))\n";
        } else {
            for socket in &config.network.allow_unix_sockets {
                p += &format!(
                    "(allow network-outbound (literal {}))\n",
                    sbpl_string(socket)
                );
            }
        }
    }

    // -- PTY ---------------------------------------------------------------
    if config.allow_pty {
        p += "(allow pseudo-tty)\n";
        p += "(allow file-read* file-write* (regex #\"^/dev/ttys[0-9]*\"))\n";
    }

    p
}

/// Concrete paths for a policy list: glob expansion plus normalized
/// non-glob entries.
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

/// `/tmp` is a symlink to `/private/tmp`; a policy path under either must
/// appear in the profile under both.
fn mirror_tmp(path: &str) -> Vec<String> {
    if let Some(rest) = path.strip_prefix("/private/tmp") {
        vec![path.to_string(), format!("/tmp{rest}")]
    } else if let Some(rest) = path.strip_prefix("/tmp") {
        vec![path.to_string(), format!("/private/tmp{rest}")]
    } else {
        vec![path.to_string()]
    }
}

/// Quote a string literal for SBPL.
fn sbpl_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_for(config: &Config) -> String {
        compile_profile(config, Path::new("/work/project"), 3128, 1080)
    }

    #[test]
    fn default_profile_shape() {
        let p = profile_for(&Config::default());
        assert!(p.starts_with("(version 1)\n(deny default)\n"));
        assert!(p.contains("(allow file-read*)\n"));
        assert!(p.contains("(allow file-write* (subpath \"/tmp/fence\"))"));
        assert!(p.contains("network-outbound (remote ip \"localhost:3128\")"));
        assert!(p.contains("network-outbound (remote ip \"localhost:1080\")"));
        assert!(!p.contains("(allow network*)"));
        assert!(!p.contains("pseudo-tty"));
    }

    #[test]
    fn wildcard_domains_allow_all_network() {
        let mut config = Config::default();
        config.network.allowed_domains = vec!["*".into()];
        let p = profile_for(&config);
        assert!(p.contains("(allow network*)\n"));
        assert!(!p.contains("localhost:3128"));
    }

    #[test]
    fn default_deny_read_lists_catalog() {
        let mut config = Config::default();
        config.filesystem.default_deny_read = true;
        config.filesystem.allow_read = vec!["/work/data".into()];
        let p = profile_for(&config);
        assert!(!p.contains("(allow file-read*)\n"));
        assert!(p.contains("(allow file-read* (subpath \"/work/data\"))"));
    }

    #[test]
    fn mandatory_deny_write_includes_git_config() {
        let p = profile_for(&Config::default());
        assert!(p.contains("(deny file-write* (literal \"/work/project/.git/config\"))")
            || p.contains("(deny file-write* (subpath \"/work/project/.git/config\"))"));
        assert!(p.contains("/work/project/.git/hooks"));
        assert!(p.contains("/work/project/.bashrc"));
    }

    #[test]
    fn allow_git_config_lifts_only_git_config() {
        let mut config = Config::default();
        config.filesystem.allow_git_config = true;
        let p = profile_for(&config);
        assert!(!p.contains("/work/project/.git/config"));
        assert!(p.contains("/work/project/.git/hooks"));
    }

    #[test]
    fn mandatory_deny_survives_allow_write_of_parent() {
        let mut config = Config::default();
        config.filesystem.allow_write = vec!["/work/project".into()];
        let p = profile_for(&config);
        assert!(p.contains("(allow file-write* (subpath \"/work/project\"))"));
        assert!(p.contains("/work/project/.bashrc"));
        assert!(p.contains("/work/project/.git/hooks"));
    }

    #[test]
    fn tmp_paths_are_mirrored() {
        let mut config = Config::default();
        config.filesystem.allow_write = vec!["/tmp/build".into()];
        let p = profile_for(&config);
        // The normalized path may resolve /tmp to /private/tmp on a real
        // mac; both spellings must appear either way.
        assert!(p.contains("/tmp/build"), "{p}");
        assert!(p.contains("/private/tmp/build"), "{p}");
    }

    #[test]
    fn local_binding_and_outbound_toggles() {
        let mut config = Config::default();
        config.network.allow_local_binding = true;
        let p = profile_for(&config);
        assert!(p.contains("(allow network-bind (local ip \"localhost:*\"))"));
        assert!(p.contains("(allow network-inbound (local ip \"localhost:*\"))"));
        // local_outbound inherits from binding when unset.
        assert!(p.contains("(allow network-outbound (remote ip \"localhost:*\"))"));

        config.network.allow_local_outbound = Some(false);
        let p = profile_for(&config);
        assert!(!p.contains("(allow network-outbound (remote ip \"localhost:*\"))"));
    }

    #[test]
    fn unix_sockets_listed_or_blanket() {
        let mut config = Config::default();
        config.network.allow_unix_sockets = vec!["/var/run/docker.sock".into()];
        let p = profile_for(&config);
        assert!(p.contains("(allow network-outbound (literal \"/var/run/docker.sock\"))"));

        config.network.allow_all_unix_sockets = true;
        let p = profile_for(&config);
        assert!(p.contains("(allow network-outbound (remote unix-socket))"));
        assert!(!p.contains("docker.sock"));
    }

    #[test]
    fn pty_toggle() {
        let mut config = Config::default();
        config.allow_pty = true;
        let p = profile_for(&config);
        assert!(p.contains("(allow pseudo-tty)"));
    }

    #[test]
    fn sbpl_string_escaping() {
        assert_eq!(sbpl_string("/plain"), "\"/plain\"");
        assert_eq!(sbpl_string("a\"b"), "\"a\\\"b\"");
    }

    #[test]
    fn mirror_tmp_both_directions() {
        assert_eq!(
            mirror_tmp("/tmp/x"),
            vec!["/tmp/x".to_string(), "/private/tmp/x".to_string()]
        );
        assert_eq!(
            mirror_tmp("/private/tmp/x"),
            vec!["/private/tmp/x".to_string(), "/tmp/x".to_string()]
        );
        assert_eq!(mirror_tmp("/home/x"), vec!["/home/x".to_string()]);
    }
}
