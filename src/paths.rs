//! Path normalization, glob expansion, and the dangerous-file catalog.
//!
//! Policy paths are normalized on load (tilde, relative, best-effort symlink
//! resolution). Glob expansion happens only at confinement-build time, never
//! during proxy-side policy matching.

use std::path::{Path, PathBuf};

use tracing::trace;
use walkdir::WalkDir;

/// Files always protected from writes, wherever they appear. Writable shell
/// rc files and tool configs are code-execution vectors.
pub const DANGEROUS_FILES: &[&str] = &[
    ".gitconfig",
    ".gitmodules",
    ".bashrc",
    ".bash_profile",
    ".zshrc",
    ".zprofile",
    ".profile",
    ".ripgreprc",
    ".mcp.json",
];

/// Directories always protected from writes. `.git` itself stays writable
/// for normal git operations; `hooks/` and `config` are handled separately.
pub const DANGEROUS_DIRECTORIES: &[&str] =
    &[".vscode", ".idea", ".claude/commands", ".claude/agents"];

/// Default depth limit for [`find_dangerous_files`].
pub const DEFAULT_MAX_DANGEROUS_FILE_DEPTH: usize = 3;

/// Returns true if a path pattern contains glob characters.
pub fn contains_glob_chars(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', ']'])
}

/// Remove a trailing `/**` from a path pattern.
pub fn remove_trailing_glob_suffix(pattern: &str) -> &str {
    pattern.strip_suffix("/**").unwrap_or(pattern)
}

/// Normalize a policy path: expand `~`, make relatives absolute against the
/// current directory, and resolve symlinks best-effort for non-glob paths
/// (the original spelling is kept when resolution fails).
pub fn normalize_path(pattern: &str) -> String {
    let home = dirs::home_dir().unwrap_or_default();
    let cwd = std::env::current_dir().unwrap_or_default();

    let normalized = if pattern == "~" {
        home.to_string_lossy().into_owned()
    } else if let Some(rest) = pattern.strip_prefix("~/") {
        home.join(rest).to_string_lossy().into_owned()
    } else if pattern.starts_with("./") || pattern.starts_with("../") {
        lexical_join(&cwd, pattern)
    } else if !Path::new(pattern).is_absolute() && !contains_glob_chars(pattern) {
        lexical_join(&cwd, pattern)
    } else {
        pattern.to_string()
    };

    if !contains_glob_chars(&normalized)
        && let Ok(resolved) = std::fs::canonicalize(&normalized)
    {
        return resolved.to_string_lossy().into_owned();
    }

    normalized
}

/// Join and lexically clean `..`/`.` components without touching the fs.
fn lexical_join(base: &Path, rel: &str) -> String {
    let mut parts: Vec<std::ffi::OsString> = base
        .components()
        .map(|c| c.as_os_str().to_os_string())
        .collect();
    for comp in Path::new(rel).components() {
        match comp {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                if parts.len() > 1 {
                    parts.pop();
                }
            }
            other => parts.push(other.as_os_str().to_os_string()),
        }
    }
    parts
        .iter()
        .collect::<PathBuf>()
        .to_string_lossy()
        .into_owned()
}

/// Expand glob patterns into concrete filesystem paths. Non-glob entries are
/// skipped (callers bind those via [`normalize_path`] directly).
pub fn expand_glob_patterns(patterns: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for pattern in patterns {
        let normalized = normalize_path(pattern);
        if !contains_glob_chars(&normalized) {
            continue;
        }
        let Ok(paths) = glob::glob(&normalized) else {
            trace!(pattern = %normalized, "skipping malformed glob pattern");
            continue;
        };
        for path in paths.flatten() {
            out.push(path.to_string_lossy().into_owned());
        }
    }
    out
}

/// Walk the tree under `root` up to `max_depth` levels of subdirectories and
/// return dangerous files, directories, and `.git` hooks/config found there.
///
/// Items directly in `root` are not returned; the caller adds those
/// separately. `node_modules` is skipped. Multi-component entries like
/// `.claude/commands` match only on path-component boundaries, so
/// `not.claude/commands` is not a hit.
pub fn find_dangerous_files(root: &Path, max_depth: usize) -> Vec<PathBuf> {
    if max_depth == 0 {
        return Vec::new();
    }

    let mut results = Vec::new();
    // Descend one level past max_depth so entries *at* that level are seen.
    let mut it = WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth + 1)
        .into_iter();

    while let Some(entry) = it.next() {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        let name = entry.file_name().to_string_lossy();
        let depth = entry.depth(); // components below root
        let subdir_level = depth.saturating_sub(1);

        if entry.file_type().is_dir() && name == "node_modules" {
            it.skip_current_dir();
            continue;
        }

        // .git directories: peek inside for hooks/ and config without
        // counting .git internals against the depth limit. Root-level .git
        // is the caller's responsibility.
        if entry.file_type().is_dir() && name == ".git" {
            if (1..=max_depth).contains(&subdir_level) {
                let hooks = path.join("hooks");
                if hooks.is_dir() {
                    results.push(hooks);
                }
                let config = path.join("config");
                if config.is_file() {
                    results.push(config);
                }
            }
            it.skip_current_dir();
            continue;
        }

        // Direct children of root are handled by the caller; still descend.
        if depth == 1 {
            continue;
        }
        if subdir_level > max_depth {
            if entry.file_type().is_dir() {
                it.skip_current_dir();
            }
            continue;
        }

        if !entry.file_type().is_dir() {
            if DANGEROUS_FILES.contains(&name.as_ref()) {
                results.push(path.to_path_buf());
            }
            continue;
        }

        if DANGEROUS_DIRECTORIES.contains(&name.as_ref()) {
            results.push(path.to_path_buf());
            it.skip_current_dir();
            continue;
        }

        // Multi-component entries (".claude/commands"): compare the
        // root-relative suffix on a component boundary.
        if let Ok(rel) = path.strip_prefix(root) {
            let rel_str = rel.to_string_lossy();
            for dd in DANGEROUS_DIRECTORIES {
                if dd.contains('/')
                    && rel_str.ends_with(dd)
                    && (rel_str.len() == dd.len()
                        || rel_str.as_bytes()[rel_str.len() - dd.len() - 1] == b'/')
                {
                    results.push(path.to_path_buf());
                    it.skip_current_dir();
                    break;
                }
            }
        }
    }

    results
}

/// Concrete paths (not globs) that must be protected from writes: dangerous
/// files and directories in `cwd`, `.git/hooks` and `.git/config` in `cwd`,
/// and dangerous files in the home directory.
pub fn mandatory_deny_paths(cwd: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    for f in DANGEROUS_FILES {
        paths.push(cwd.join(f));
    }
    for d in DANGEROUS_DIRECTORIES {
        paths.push(cwd.join(d));
    }
    paths.push(cwd.join(".git/hooks"));
    paths.push(cwd.join(".git/config"));

    if let Some(home) = dirs::home_dir() {
        for f in DANGEROUS_FILES {
            paths.push(home.join(f));
        }
    }

    paths
}

/// System paths that should be writable for ordinary commands to work.
pub fn default_write_paths() -> Vec<String> {
    let mut paths: Vec<String> = [
        "/dev/stdout",
        "/dev/stderr",
        "/dev/null",
        "/dev/tty",
        "/tmp/fence",
        "/private/tmp/fence",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".npm/_logs").to_string_lossy().into_owned());
        paths.push(home.join(".fence/debug").to_string_lossy().into_owned());
    }

    paths
}

/// Paths that stay readable under `defaultDenyRead`. Essential system paths
/// plus user tooling roots: version managers need their whole installation
/// readable (runtimes load libraries and modules from them, not just bin/).
pub fn default_readable_paths() -> Vec<String> {
    let mut paths: Vec<String> = [
        // Core system paths
        "/bin",
        "/sbin",
        "/usr",
        "/lib",
        "/lib64",
        // System configuration (DNS, SSL, locale)
        "/etc",
        "/proc",
        "/sys",
        "/dev",
        // macOS
        "/System",
        "/Library",
        "/Applications",
        "/private/etc",
        "/private/var/db",
        "/private/var/run",
        // Distribution-specific
        "/opt",
        "/run",
        // Temp
        "/tmp",
        "/private/tmp",
        // Package managers
        "/usr/local",
        "/opt/homebrew",
        "/nix",
        "/snap",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if let Some(home) = dirs::home_dir() {
        for rel in [
            ".nvm",
            ".fnm",
            ".volta",
            ".n",
            ".pyenv",
            ".local/pipx",
            ".rbenv",
            ".rvm",
            ".cargo/bin",
            ".rustup",
            "go/bin",
            ".go",
            ".local/bin",
            "bin",
            ".bun/bin",
            ".deno/bin",
        ] {
            paths.push(home.join(rel).to_string_lossy().into_owned());
        }
    }

    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_chars_detection() {
        assert!(contains_glob_chars("src/**/*.rs"));
        assert!(contains_glob_chars("file?.txt"));
        assert!(contains_glob_chars("[ab].txt"));
        assert!(!contains_glob_chars("/plain/path"));
    }

    #[test]
    fn trailing_glob_suffix_removal() {
        assert_eq!(remove_trailing_glob_suffix("/a/b/**"), "/a/b");
        assert_eq!(remove_trailing_glob_suffix("/a/b"), "/a/b");
    }

    #[test]
    fn normalize_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(normalize_path("~"), home.to_string_lossy());
        assert!(normalize_path("~/nonexistent-fence-test").starts_with(&*home.to_string_lossy()));
    }

    #[test]
    fn normalize_relative_against_cwd() {
        let cwd = std::env::current_dir().unwrap();
        let got = normalize_path("./some-relative-file");
        assert!(got.starts_with(&*cwd.to_string_lossy()), "{got}");
        assert!(got.ends_with("some-relative-file"));

        let bare = normalize_path("another-file");
        assert!(bare.starts_with(&*cwd.to_string_lossy()), "{bare}");
    }

    #[test]
    fn normalize_keeps_glob_patterns_relative_form_absolute() {
        // Glob patterns are not resolved through the filesystem.
        let got = normalize_path("/some/dir/**/*.log");
        assert_eq!(got, "/some/dir/**/*.log");
    }

    #[test]
    fn normalize_resolves_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("real.txt");
        std::fs::write(&target, "x").unwrap();
        let link = dir.path().join("link.txt");
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, &link).unwrap();
        #[cfg(unix)]
        {
            let got = normalize_path(&link.to_string_lossy());
            let want = std::fs::canonicalize(&target).unwrap();
            assert_eq!(got, want.to_string_lossy());
        }
    }

    #[test]
    fn expand_globs_skips_non_glob_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.log"), "").unwrap();
        std::fs::write(dir.path().join("b.log"), "").unwrap();
        std::fs::write(dir.path().join("c.txt"), "").unwrap();

        let pattern = format!("{}/*.log", dir.path().display());
        let plain = format!("{}/c.txt", dir.path().display());
        let mut got = expand_glob_patterns(&[pattern, plain]);
        got.sort();
        assert_eq!(got.len(), 2);
        assert!(got[0].ends_with("a.log"));
        assert!(got[1].ends_with("b.log"));
    }

    #[test]
    fn find_dangerous_skips_root_level_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".bashrc"), "").unwrap();
        let hits = find_dangerous_files(dir.path(), 3);
        assert!(hits.is_empty(), "{hits:?}");
    }

    #[test]
    fn find_dangerous_in_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("project");
        std::fs::create_dir_all(sub.join(".vscode")).unwrap();
        std::fs::write(sub.join(".bashrc"), "").unwrap();

        let mut hits = find_dangerous_files(dir.path(), 3);
        hits.sort();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].ends_with("project/.bashrc"));
        assert!(hits[1].ends_with("project/.vscode"));
    }

    #[test]
    fn find_dangerous_respects_depth_limit() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("a/b/c/d");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::write(deep.join(".bashrc"), "").unwrap();

        // .bashrc sits at subdir level 4; a depth-3 walk must not see it.
        assert!(find_dangerous_files(dir.path(), 3).is_empty());
        assert_eq!(find_dangerous_files(dir.path(), 4).len(), 1);
    }

    #[test]
    fn find_dangerous_skips_node_modules() {
        let dir = tempfile::tempdir().unwrap();
        let nm = dir.path().join("node_modules/pkg");
        std::fs::create_dir_all(&nm).unwrap();
        std::fs::write(nm.join(".bashrc"), "").unwrap();
        assert!(find_dangerous_files(dir.path(), 3).is_empty());
    }

    #[test]
    fn find_dangerous_component_boundary() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("p/not.claude/commands")).unwrap();
        std::fs::create_dir_all(dir.path().join("p/.claude/commands")).unwrap();

        let hits = find_dangerous_files(dir.path(), 3);
        assert_eq!(hits.len(), 1, "{hits:?}");
        assert!(hits[0].ends_with("p/.claude/commands"));
        assert!(!hits[0].to_string_lossy().contains("not.claude"));
    }

    #[test]
    fn find_dangerous_git_peek() {
        let dir = tempfile::tempdir().unwrap();
        let git = dir.path().join("repo/.git");
        std::fs::create_dir_all(git.join("hooks")).unwrap();
        std::fs::write(git.join("config"), "").unwrap();
        // Internals below hooks/ must not count against depth.
        std::fs::create_dir_all(git.join("objects/aa/bb/cc/dd")).unwrap();

        let mut hits = find_dangerous_files(dir.path(), 1);
        hits.sort();
        assert_eq!(hits.len(), 2, "{hits:?}");
        assert!(hits[0].ends_with(".git/config"));
        assert!(hits[1].ends_with(".git/hooks"));
    }

    #[test]
    fn mandatory_deny_includes_git_paths_and_home() {
        let cwd = Path::new("/work/project");
        let paths = mandatory_deny_paths(cwd);
        assert!(paths.contains(&cwd.join(".git/hooks")));
        assert!(paths.contains(&cwd.join(".git/config")));
        assert!(paths.contains(&cwd.join(".bashrc")));
        if let Some(home) = dirs::home_dir() {
            assert!(paths.contains(&home.join(".gitconfig")));
        }
    }

    #[test]
    fn mandatory_deny_present_even_when_parent_writable() {
        // allow_write on the cwd never removes catalog entries.
        let cwd = Path::new("/work/project");
        let paths = mandatory_deny_paths(cwd);
        for f in DANGEROUS_FILES {
            assert!(paths.contains(&cwd.join(f)), "missing {f}");
        }
        for d in DANGEROUS_DIRECTORIES {
            assert!(paths.contains(&cwd.join(d)), "missing {d}");
        }
    }
}
