//! Linux confinement builder: bubblewrap argv, mount plan, and inner script.
//!
//! Layer order matters: namespaces first, seccomp fd next, then the mount
//! plan from coarsest (`--ro-bind / /`) to finest (per-file masks), so later
//! mounts override earlier ones. The inner script wires the in-namespace
//! socat relays to the bridge sockets, exports proxy env, and finally execs
//! either the Landlock wrapper or the user command.

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::FenceError;
use crate::paths::{
    contains_glob_chars, default_readable_paths, default_write_paths, expand_glob_patterns,
    mandatory_deny_paths, normalize_path,
};
use crate::sandbox::bridge::{LinuxBridge, ReverseBridge};
use crate::sandbox::features::LinuxFeatures;
use crate::sandbox::shell::{ShellMode, quote, quote_args, resolve_execution_shell};
use crate::sandbox::{ConfinementBuilder, seccomp};

/// In-sandbox TCP ports the relays listen on.
const INNER_HTTP_PORT: u16 = 3128;
const INNER_SOCKS_PORT: u16 = 1080;

/// Tunable sandbox layers; everything defaults on and downgrades per the
/// feature probe.
#[derive(Debug, Clone)]
pub struct LinuxSandboxOptions {
    pub use_landlock: bool,
    pub use_seccomp: bool,
    pub debug: bool,
}

impl Default for LinuxSandboxOptions {
    fn default() -> Self {
        Self {
            use_landlock: true,
            use_seccomp: true,
            debug: false,
        }
    }
}

/// Builder carrying the per-invocation context needed to wrap commands.
pub struct LinuxBuilder<'a> {
    pub features: LinuxFeatures,
    pub options: LinuxSandboxOptions,
    pub bridge: Option<&'a LinuxBridge>,
    pub reverse_bridge: Option<&'a ReverseBridge>,
    /// Temp files referenced by the wrapped command (seccomp filter);
    /// owned by the manager for deletion after the sandbox exits.
    pub artifacts: RefCell<Vec<PathBuf>>,
}

impl<'a> LinuxBuilder<'a> {
    pub fn new(
        features: LinuxFeatures,
        options: LinuxSandboxOptions,
        bridge: Option<&'a LinuxBridge>,
        reverse_bridge: Option<&'a ReverseBridge>,
    ) -> Self {
        Self {
            features,
            options,
            bridge,
            reverse_bridge,
            artifacts: RefCell::new(Vec::new()),
        }
    }

    pub fn take_artifacts(&self) -> Vec<PathBuf> {
        std::mem::take(&mut self.artifacts.borrow_mut())
    }
}

impl ConfinementBuilder for LinuxBuilder<'_> {
    fn wrap(&self, config: &Config, command: &str) -> Result<String, FenceError> {
        if !self.features.has_bwrap {
            return Err(FenceError::PrerequisiteMissing(
                "bubblewrap (bwrap) is required on Linux but not found on PATH".into(),
            ));
        }

        let (shell_path, shell_flag) = resolve_execution_shell(ShellMode::Default, false)?;
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let wildcard = config.network.has_wildcard_allow();

        if self.options.debug {
            debug!(features = %self.features.summary(), "available features");
            if wildcard {
                debug!("wildcard allowedDomains: direct network permitted, deniedDomains enforced only for proxy-respecting clients");
            }
        }

        let mut args: Vec<String> = vec![
            "bwrap".into(),
            "--new-session".into(),
            "--die-with-parent".into(),
        ];

        // Network namespace only when the kernel allows it and the policy
        // does not require direct network access.
        if self.features.can_unshare_net && !wildcard {
            args.push("--unshare-net".into());
        } else if !self.features.can_unshare_net {
            debug!("skipping --unshare-net (network namespace unavailable in this environment)");
        }
        args.push("--unshare-pid".into());

        // Seccomp filter arrives on fd 3.
        let mut seccomp_filter_path = None;
        if self.options.use_seccomp && self.features.has_seccomp {
            match seccomp::generate_bpf_filter() {
                Ok(path) => {
                    args.push("--seccomp".into());
                    args.push("3".into());
                    self.artifacts.borrow_mut().push(path.clone());
                    seccomp_filter_path = Some(path);
                }
                Err(e) => warn!(error = %e, "seccomp filter generation failed; continuing without"),
            }
        }

        self.push_mount_plan(&mut args, config, &cwd);

        // Bridge sockets must be visible (and connectable) inside.
        if let Some(bridge) = self.bridge {
            for path in [&bridge.http_socket_path, &bridge.socks_socket_path] {
                let p = path.to_string_lossy().into_owned();
                args.extend(["--bind".into(), p.clone(), p]);
            }
        }
        if let Some(reverse) = self.reverse_bridge
            && let Some(first) = reverse.socket_paths.first()
            && let Some(tmp_dir) = first.parent()
        {
            // The sandbox-side socat creates these sockets, so the whole
            // temp dir is bound writable.
            let p = tmp_dir.to_string_lossy().into_owned();
            args.extend(["--bind".into(), p.clone(), p]);
        }

        let use_landlock_wrapper = self.landlock_wrapper_usable();
        let inner = self.build_inner_script(config, command, use_landlock_wrapper)?;

        args.push("--".into());
        args.push(shell_path.to_string_lossy().into_owned());
        args.push(shell_flag.into());
        args.push(inner);

        let bwrap_cmd = quote_args(args.iter().map(String::as_str));
        let wrapped = match seccomp_filter_path {
            Some(path) => format!("exec 3<{}; {}", quote(&path.to_string_lossy()), bwrap_cmd),
            None => bwrap_cmd,
        };

        if self.options.debug {
            debug!(command = %wrapped, "composed launcher command");
        }
        Ok(wrapped)
    }
}

impl LinuxBuilder<'_> {
    /// Mount plan: visibility first, then writability, then masking.
    fn push_mount_plan(&self, args: &mut Vec<String>, config: &Config, cwd: &Path) {
        let fs = &config.filesystem;
        let default_deny_read = fs.default_deny_read;

        if default_deny_read {
            let mut bound = PathSet::default();
            // Only the essential catalog plus explicit allow lists exist.
            for system_path in default_readable_paths() {
                if matches!(system_path.as_str(), "/dev" | "/proc" | "/tmp" | "/private/tmp") {
                    continue; // special mounts below
                }
                if file_exists(&system_path) {
                    push_bind(args, "--ro-bind", &system_path);
                }
            }

            for p in effective_paths(&fs.allow_read)
                .into_iter()
                .chain(effective_paths(&fs.allow_execute))
            {
                if file_exists(&p)
                    && !p.starts_with("/dev/")
                    && !p.starts_with("/proc/")
                    && bound.insert(&p)
                {
                    push_bind(args, "--ro-bind", &p);
                }
            }

            // WSL interop needs /init visible for binfmt_misc exec.
            let wsl = fs.wsl_interop.unwrap_or(self.features.is_wsl);
            if wsl && file_exists("/init") && bound.insert("/init") {
                push_bind(args, "--ro-bind", "/init");
            }
        } else {
            args.extend(["--ro-bind".into(), "/".into(), "/".into()]);
        }

        // --dev-bind preserves host device permissions (the minimal --dev
        // devtmpfs misbehaves when bwrap is setuid).
        args.extend(["--dev-bind".into(), "/dev".into(), "/dev".into()]);
        args.extend(["--proc".into(), "/proc".into()]);
        args.extend(["--tmpfs".into(), "/tmp".into()]);

        self.push_resolv_conf_fix(args, default_deny_read);

        // Writable paths: defaults plus allowWrite.
        let mut writable = PathSet::default();
        for p in default_write_paths() {
            if p.starts_with("/dev/") || p.starts_with("/tmp/") || p.starts_with("/private/tmp/") {
                continue; // covered by --dev-bind / --tmpfs
            }
            writable.insert(&p);
        }
        for p in effective_paths(&fs.allow_write) {
            writable.insert(&p);
        }
        for p in writable.iter() {
            if file_exists(p) {
                push_bind(args, "--bind", p);
            }
        }

        // `--ro-bind / /` is non-recursive: allow-listed paths on other
        // devices (WSL drvfs mounts) need explicit cross-mount binds.
        if !default_deny_read {
            self.push_cross_mount_binds(args, config);
        }

        // denyRead: directories become empty tmpfs, files are masked with
        // /dev/null. Symlinks are skipped.
        let mut deny_read = PathSet::default();
        for p in effective_paths(&fs.deny_read) {
            deny_read.insert(&p);
            if can_mount_over(&p) {
                if is_directory(&p) {
                    args.extend(["--tmpfs".into(), p]);
                } else {
                    args.extend(["--ro-bind".into(), "/dev/null".into(), p]);
                }
            }
        }

        // Mandatory dangerous-path write protection. Under defaultDenyRead
        // the real path must never be rebound (it would become readable);
        // mask instead.
        let mut seen = PathSet::default();
        for p in mandatory_deny_paths(cwd) {
            if fs.allow_git_config && p.ends_with(".git/config") {
                continue;
            }
            let p = p.to_string_lossy().into_owned();
            if deny_read.contains(&p) {
                continue; // explicit denyRead already hides it
            }
            if seen.insert(&p) && file_exists(&p) {
                if default_deny_read {
                    if is_directory(&p) {
                        args.extend(["--tmpfs".into(), p]);
                    } else {
                        args.extend(["--ro-bind".into(), "/dev/null".into(), p]);
                    }
                } else {
                    push_bind(args, "--ro-bind", &p);
                }
            }
        }

        // Explicit denyWrite paths stay visible but read-only.
        for p in effective_paths(&fs.deny_write) {
            if file_exists(&p) && seen.insert(&p) {
                push_bind(args, "--ro-bind", &p);
            }
        }
    }

    /// On systems where /etc/resolv.conf is a symlink onto another device
    /// (WSL), make the target reachable: walk down from /, tmpfs the first
    /// cross-device boundary, stub deeper dirs, then bind the real file.
    fn push_resolv_conf_fix(&self, args: &mut Vec<String>, default_deny_read: bool) {
        let Ok(target) = std::fs::canonicalize("/etc/resolv.conf") else {
            return;
        };
        let target_str = target.to_string_lossy().into_owned();
        if target_str == "/etc/resolv.conf" {
            return;
        }

        // A tmpfs under a specially-mounted dir would clobber those mounts.
        let mut under_special = target_str.starts_with("/dev/")
            || target_str.starts_with("/proc/")
            || target_str.starts_with("/tmp/");
        if default_deny_read {
            // Under an already-bound catalog path, the bind covers it.
            for p in default_readable_paths() {
                if target_str.starts_with(&format!("{p}/")) {
                    under_special = true;
                    break;
                }
            }
        }
        if !file_exists(&target_str) || same_device("/", &target_str) || under_special {
            return;
        }

        let target_dir = target
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".into());
        let mut boundary_found = false;
        for dir in intermediary_dirs("/", &target_dir) {
            if !boundary_found {
                if !same_device("/", &dir) {
                    args.extend(["--tmpfs".into(), dir]);
                    boundary_found = true;
                }
                // dirs still on the root device have real content; skip
            } else {
                args.extend(["--dir".into(), dir]);
            }
        }
        if boundary_found {
            push_bind(args, "--ro-bind", &target_str);
            debug!(target = %target_str, "resolv.conf symlink target bound cross-mount");
        }
    }

    /// Bind allowExecute/allowRead (read-only) and allowWrite (writable)
    /// paths living on a different device than /.
    fn push_cross_mount_binds(&self, args: &mut Vec<String>, config: &Config) {
        let fs = &config.filesystem;
        let mut bound = PathSet::default();
        let mut writable = PathSet::default();

        let mut candidates: Vec<String> = Vec::new();
        candidates.extend(effective_paths(&fs.allow_execute));
        candidates.extend(effective_paths(&fs.allow_read));
        for p in effective_paths(&fs.allow_write) {
            writable.insert(&p);
            candidates.push(p);
        }

        for p in candidates {
            if !file_exists(&p) || same_device("/", &p) || bound.contains(&p) {
                continue;
            }
            bound.insert(&p);

            let target_dir = if is_directory(&p) {
                p.clone()
            } else {
                Path::new(&p)
                    .parent()
                    .map(|d| d.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "/".into())
            };

            let mut boundary_found = false;
            for dir in intermediary_dirs("/", &target_dir) {
                if bound.contains(&dir) {
                    boundary_found = true;
                    continue;
                }
                if !boundary_found {
                    if !same_device("/", &dir) {
                        args.extend(["--tmpfs".into(), dir.clone()]);
                        bound.insert(&dir);
                        boundary_found = true;
                    }
                } else {
                    args.extend(["--dir".into(), dir.clone()]);
                    bound.insert(&dir);
                }
            }
            if boundary_found {
                let mode = if writable.contains(&p) { "--bind" } else { "--ro-bind" };
                push_bind(args, mode, &p);
                debug!(path = %p, writable = writable.contains(&p), "cross-mount bind");
            }
        }
    }

    /// The Landlock wrapper re-execs this binary, so it must actually be
    /// fence (not a test harness or library consumer) and must survive the
    /// `--tmpfs /tmp` mount.
    fn landlock_wrapper_usable(&self) -> bool {
        if !self.options.use_landlock || !self.features.can_use_landlock() {
            return false;
        }
        let Ok(exe) = std::env::current_exe() else {
            return false;
        };
        let exe_str = exe.to_string_lossy();
        if exe_str.starts_with("/tmp/") {
            debug!("skipping landlock wrapper (executable under /tmp)");
            return false;
        }
        let is_fence = exe
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.contains("fence"));
        if !is_fence {
            debug!("skipping landlock wrapper (running as library, not the fence CLI)");
        }
        is_fence
    }

    /// The script bwrap's shell runs: relays, env, cleanup trap, then the
    /// user command (possibly via the Landlock wrapper).
    fn build_inner_script(
        &self,
        config: &Config,
        command: &str,
        use_landlock_wrapper: bool,
    ) -> Result<String, FenceError> {
        let mut script = String::new();

        if let Some(bridge) = self.bridge {
            script.push_str(&format!(
                "# relays: in-sandbox TCP -> bridge sockets -> host proxies\n\
                 socat TCP-LISTEN:{http},fork,reuseaddr UNIX-CONNECT:{http_sock} >/dev/null 2>&1 &\n\
                 socat TCP-LISTEN:{socks},fork,reuseaddr UNIX-CONNECT:{socks_sock} >/dev/null 2>&1 &\n\
                 \n\
                 export HTTP_PROXY=http://127.0.0.1:{http}\n\
                 export HTTPS_PROXY=http://127.0.0.1:{http}\n\
                 export http_proxy=http://127.0.0.1:{http}\n\
                 export https_proxy=http://127.0.0.1:{http}\n\
                 export ALL_PROXY=socks5h://127.0.0.1:{socks}\n\
                 export all_proxy=socks5h://127.0.0.1:{socks}\n\
                 export NO_PROXY=localhost,127.0.0.1\n\
                 export no_proxy=localhost,127.0.0.1\n\
                 export GIT_SSH_COMMAND={git_ssh}\n\
                 export FENCE_SANDBOX=1\n\n",
                http = INNER_HTTP_PORT,
                socks = INNER_SOCKS_PORT,
                http_sock = quote(&bridge.http_socket_path.to_string_lossy()),
                socks_sock = quote(&bridge.socks_socket_path.to_string_lossy()),
                git_ssh = quote(&format!(
                    "ssh -o ProxyCommand='nc -X 5 -x 127.0.0.1:{} %h %p'",
                    INNER_SOCKS_PORT
                )),
            ));
        }

        if let Some(reverse) = self.reverse_bridge {
            script.push_str("# reverse relays: bridge sockets -> in-sandbox services\n");
            for (port, socket_path) in reverse.ports.iter().zip(&reverse.socket_paths) {
                script.push_str(&format!(
                    "socat UNIX-LISTEN:{},fork,reuseaddr TCP:127.0.0.1:{} >/dev/null 2>&1 &\n",
                    quote(&socket_path.to_string_lossy()),
                    port
                ));
            }
            script.push('\n');
        }

        script.push_str(
            "cleanup() {\n    jobs -p | xargs -r kill 2>/dev/null\n}\ntrap cleanup EXIT\n\n\
             # give the relays a beat to start listening\nsleep 0.1\n\n",
        );

        if use_landlock_wrapper {
            let config_json = serde_json::to_string(config)
                .map_err(|e| FenceError::Internal(format!("serialize config for wrapper: {e}")))?;
            script.push_str(&format!(
                "export FENCE_CONFIG_JSON={}\n",
                quote(&config_json)
            ));

            let exe = std::env::current_exe().map_err(FenceError::Io)?;
            let mut wrapper: Vec<String> = vec![
                exe.to_string_lossy().into_owned(),
                "--landlock-apply".into(),
            ];
            if self.options.debug {
                wrapper.push("--debug".into());
            }
            wrapper.extend(["--".into(), "bash".into(), "-c".into(), command.into()]);
            script.push_str(&format!(
                "exec {}\n",
                quote_args(wrapper.iter().map(String::as_str))
            ));
        } else {
            script.push_str(command);
            script.push('\n');
        }

        Ok(script)
    }
}

// ---------------------------------------------------------------------------
// Filesystem helpers
// ---------------------------------------------------------------------------

/// Normalized concrete paths for a policy list: glob expansions plus
/// normalized non-glob entries.
fn effective_paths(patterns: &[String]) -> Vec<String> {
    let mut out = expand_glob_patterns(patterns);
    for p in patterns {
        let normalized = normalize_path(p);
        if !contains_glob_chars(&normalized) {
            out.push(normalized);
        }
    }
    out
}

#[derive(Default)]
struct PathSet(Vec<String>);

impl PathSet {
    fn insert(&mut self, p: &str) -> bool {
        if self.contains(p) {
            false
        } else {
            self.0.push(p.to_string());
            true
        }
    }
    fn contains(&self, p: &str) -> bool {
        self.0.iter().any(|x| x == p)
    }
    fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }
}

fn push_bind(args: &mut Vec<String>, mode: &str, path: &str) {
    args.extend([mode.to_string(), path.to_string(), path.to_string()]);
}

fn file_exists(path: &str) -> bool {
    Path::new(path).exists()
}

fn is_directory(path: &str) -> bool {
    Path::new(path).is_dir()
}

fn is_symlink(path: &str) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// bwrap cannot safely mount over symlinks (the target may not exist
/// inside the sandbox).
fn can_mount_over(path: &str) -> bool {
    !is_symlink(path) && file_exists(path)
}

/// True when both paths live on the same filesystem device. Errs on the
/// side of "same" when either stat fails.
fn same_device(a: &str, b: &str) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(ma), Ok(mb)) => ma.dev() == mb.dev(),
        _ => true,
    }
}

/// Chain of directories between `root` and `target_dir`, shallowest first.
///
/// `intermediary_dirs("/", "/run/systemd/resolve")` →
/// `["/run", "/run/systemd", "/run/systemd/resolve"]`.
fn intermediary_dirs(root: &str, target_dir: &str) -> Vec<String> {
    let Ok(rel) = Path::new(target_dir).strip_prefix(root) else {
        return vec![target_dir.to_string()];
    };
    let mut dirs = Vec::new();
    let mut current = PathBuf::from(root);
    for part in rel.components() {
        current.push(part);
        dirs.push(current.to_string_lossy().into_owned());
    }
    dirs
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_features() -> LinuxFeatures {
        LinuxFeatures {
            kernel_major: 6,
            kernel_minor: 8,
            has_bwrap: true,
            has_socat: true,
            can_unshare_net: true,
            has_seccomp: false, // keep wrap() free of temp-file side effects
            has_landlock: true,
            landlock_abi: 4,
            ..Default::default()
        }
    }

    fn builder(features: LinuxFeatures) -> LinuxBuilder<'static> {
        LinuxBuilder::new(features, LinuxSandboxOptions::default(), None, None)
    }

    #[test]
    fn intermediary_dirs_chain() {
        assert_eq!(
            intermediary_dirs("/", "/run/systemd/resolve"),
            vec!["/run", "/run/systemd", "/run/systemd/resolve"]
        );
        assert_eq!(intermediary_dirs("/", "/"), Vec::<String>::new());
    }

    #[test]
    fn baseline_argv_shape() {
        let b = builder(test_features());
        let wrapped = b.wrap(&Config::default(), "echo hi").unwrap();
        assert!(wrapped.starts_with("bwrap --new-session --die-with-parent"), "{wrapped}");
        assert!(wrapped.contains("--unshare-net"));
        assert!(wrapped.contains("--unshare-pid"));
        assert!(wrapped.contains("--ro-bind / /"));
        assert!(wrapped.contains("--dev-bind /dev /dev"));
        assert!(wrapped.contains("--proc /proc"));
        assert!(wrapped.contains("--tmpfs /tmp"));
        assert!(wrapped.contains("echo hi"));
    }

    #[test]
    fn wildcard_domains_skip_network_namespace() {
        let mut config = Config::default();
        config.network.allowed_domains = vec!["*".into()];
        let b = builder(test_features());
        let wrapped = b.wrap(&config, "true").unwrap();
        assert!(!wrapped.contains("--unshare-net"), "{wrapped}");
        // Everything else stays engaged.
        assert!(wrapped.contains("--unshare-pid"));
    }

    #[test]
    fn missing_net_admin_skips_network_namespace() {
        let mut features = test_features();
        features.can_unshare_net = false;
        let b = builder(features);
        let wrapped = b.wrap(&Config::default(), "true").unwrap();
        assert!(!wrapped.contains("--unshare-net"));
    }

    #[test]
    fn missing_bwrap_is_a_hard_error() {
        let mut features = test_features();
        features.has_bwrap = false;
        let b = builder(features);
        let err = b.wrap(&Config::default(), "true").unwrap_err();
        assert!(matches!(err, FenceError::PrerequisiteMissing(_)), "{err}");
    }

    #[test]
    fn default_deny_read_binds_catalog_not_root() {
        let mut config = Config::default();
        config.filesystem.default_deny_read = true;
        let b = builder(test_features());
        let wrapped = b.wrap(&config, "true").unwrap();
        assert!(!wrapped.contains("--ro-bind / /"), "{wrapped}");
        assert!(wrapped.contains("--ro-bind /usr /usr"));
        assert!(wrapped.contains("--ro-bind /etc /etc"));
    }

    #[test]
    fn deny_write_paths_are_rebound_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("frozen.txt");
        std::fs::write(&target, "x").unwrap();

        let mut config = Config::default();
        config.filesystem.deny_write = vec![target.to_string_lossy().into_owned()];
        let b = builder(test_features());
        let wrapped = b.wrap(&config, "true").unwrap();
        let canonical = std::fs::canonicalize(&target).unwrap();
        assert!(
            wrapped.contains(&format!(
                "--ro-bind {} {}",
                canonical.display(),
                canonical.display()
            )),
            "{wrapped}"
        );
    }

    #[test]
    fn deny_read_masks_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let secret_file = dir.path().join("secret.txt");
        std::fs::write(&secret_file, "x").unwrap();
        let secret_dir = dir.path().join("secrets");
        std::fs::create_dir(&secret_dir).unwrap();

        let mut config = Config::default();
        config.filesystem.deny_read = vec![
            secret_file.to_string_lossy().into_owned(),
            secret_dir.to_string_lossy().into_owned(),
        ];
        let b = builder(test_features());
        let wrapped = b.wrap(&config, "true").unwrap();

        let file_canon = std::fs::canonicalize(&secret_file).unwrap();
        let dir_canon = std::fs::canonicalize(&secret_dir).unwrap();
        assert!(
            wrapped.contains(&format!("--ro-bind /dev/null {}", file_canon.display())),
            "{wrapped}"
        );
        assert!(
            wrapped.contains(&format!("--tmpfs {}", dir_canon.display())),
            "{wrapped}"
        );
    }

    #[test]
    fn deny_read_symlinks_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("real");
        std::fs::write(&target, "x").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let mut config = Config::default();
        config.filesystem.deny_read = vec![link.to_string_lossy().into_owned()];
        let b = builder(test_features());
        let wrapped = b.wrap(&config, "true").unwrap();
        // normalize_path resolves the symlink; neither the link nor a mask
        // over the link path may appear.
        assert!(!wrapped.contains(&link.to_string_lossy().into_owned()), "{wrapped}");
    }

    #[test]
    fn mandatory_deny_rebinds_in_default_mode() {
        let b = builder(test_features());
        let wrapped = b.wrap(&Config::default(), "true").unwrap();
        // Home-level dangerous files that exist get read-only rebinds.
        if let Some(home) = dirs::home_dir() {
            let gitconfig = home.join(".gitconfig");
            if gitconfig.exists() && !is_symlink(&gitconfig.to_string_lossy()) {
                assert!(
                    wrapped.contains(&format!(
                        "--ro-bind {} {}",
                        gitconfig.display(),
                        gitconfig.display()
                    )),
                    "{wrapped}"
                );
            }
        }
    }

    #[test]
    fn inner_script_exports_proxy_env_with_bridge() {
        let features = test_features();
        let bridge = LinuxBridge::fake(
            PathBuf::from("/tmp/fence-http-00.sock"),
            PathBuf::from("/tmp/fence-socks-00.sock"),
        );
        let b = LinuxBuilder::new(features, LinuxSandboxOptions::default(), Some(&bridge), None);
        let wrapped = b.wrap(&Config::default(), "curl https://example.com").unwrap();
        assert!(wrapped.contains("HTTP_PROXY=http://127.0.0.1:3128"));
        assert!(wrapped.contains("ALL_PROXY=socks5h://127.0.0.1:1080"));
        assert!(wrapped.contains("FENCE_SANDBOX=1"));
        assert!(wrapped.contains("GIT_SSH_COMMAND"));
        assert!(wrapped.contains("trap cleanup EXIT"));
    }
}
