//! Execution shell selection and POSIX shell quoting.
//!
//! The confinement builders compose shell command strings that are handed
//! back to the caller for execution, so everything user-controlled must be
//! quoted, and the shell itself comes from a small allow-list.

use std::path::{Path, PathBuf};

use crate::errors::FenceError;

/// How the execution shell is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShellMode {
    /// Deterministic bash.
    #[default]
    Default,
    /// The caller's `$SHELL`, validated against the allow-list.
    User,
}

/// Shells acceptable for `ShellMode::User`.
const ALLOWED_USER_SHELLS: &[&str] = &["sh", "bash", "zsh", "ksh", "dash", "fish"];

/// Resolve the shell executable and its invocation flag (`-c` / `-lc`).
pub fn resolve_execution_shell(
    mode: ShellMode,
    login: bool,
) -> Result<(PathBuf, &'static str), FenceError> {
    let shell_path = match mode {
        ShellMode::Default => which::which("bash")
            .map_err(|e| FenceError::PrerequisiteMissing(format!("shell 'bash' not found: {e}")))?,
        ShellMode::User => {
            let env_shell = std::env::var("SHELL").unwrap_or_default();
            let env_shell = env_shell.trim();
            if env_shell.is_empty() {
                return Err(FenceError::PolicyInvalid(
                    "shell mode 'user' requires $SHELL to be set".into(),
                ));
            }
            let path = Path::new(env_shell);
            if !path.is_absolute() {
                return Err(FenceError::PolicyInvalid(format!(
                    "shell mode 'user' requires an absolute $SHELL path, got '{env_shell}'"
                )));
            }
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !ALLOWED_USER_SHELLS.contains(&name) {
                return Err(FenceError::PolicyInvalid(format!(
                    "shell '{name}' from $SHELL is not allowed"
                )));
            }
            let metadata = std::fs::metadata(path).map_err(|e| {
                FenceError::PrerequisiteMissing(format!("shell from $SHELL not found: {e}"))
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if metadata.is_dir() || metadata.permissions().mode() & 0o111 == 0 {
                    return Err(FenceError::PolicyInvalid(format!(
                        "shell from $SHELL is not executable: '{env_shell}'"
                    )));
                }
            }
            path.to_path_buf()
        }
    };

    Ok((shell_path, if login { "-lc" } else { "-c" }))
}

/// Quote a single string for POSIX shell use.
pub fn quote(s: &str) -> String {
    if !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'+' | b'.' | b'/' | b':' | b'=' | b',' | b'@' | b'%')
        })
    {
        return s.to_string();
    }
    // Single-quote, closing around embedded single quotes.
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Quote an argument vector into a single shell command string.
pub fn quote_args<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|a| quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
