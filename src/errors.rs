//! Error taxonomy and user-facing error display.
//!
//! Setup failures (invalid policy, missing prerequisites) abort before any
//! child is spawned. Network violations are recorded but never abort the
//! sandbox. Child failures forward the child's exit code verbatim.

use std::io::{IsTerminal, Write};

/// Error kinds produced by the policy engine and confinement assemblers.
#[derive(Debug, thiserror::Error)]
pub enum FenceError {
    /// Policy file is malformed, has an unknown option, or its extends
    /// chain is cyclic or too deep.
    #[error("invalid policy: {0}")]
    PolicyInvalid(String),

    /// A required external tool or platform feature is absent.
    #[error("missing prerequisite: {0}")]
    PrerequisiteMissing(String),

    /// The preflight analyzer rejected the command.
    #[error("command blocked by policy: {command}")]
    CommandDenied {
        /// The simple command that matched a deny rule.
        command: String,
        /// The deny pattern that matched.
        pattern: String,
    },

    /// A port, socket path, or other exclusive resource could not be acquired.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// The confined child exited non-zero; the code is forwarded verbatim.
    #[error("sandboxed command exited with status {0}")]
    ChildFailure(i32),

    /// Assertion failure or unexpected state during setup.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FenceError {
    /// Return an actionable help message for this error, if applicable.
    pub fn help(&self) -> Option<String> {
        match self {
            FenceError::CommandDenied { pattern, .. } => Some(format!(
                "the deny rule '{}' matched; add a more specific entry to command.allow \
                 or remove the rule from command.deny",
                pattern
            )),
            FenceError::PrerequisiteMissing(what) if what.contains("bwrap") => Some(
                "install bubblewrap (e.g. `apt install bubblewrap` or `dnf install bubblewrap`)"
                    .into(),
            ),
            FenceError::PrerequisiteMissing(what) if what.contains("socat") => {
                Some("install socat (e.g. `apt install socat`)".into())
            }
            FenceError::PolicyInvalid(msg) if msg.contains("unknown option") => Some(
                "run with --schema to print the full configuration schema".into(),
            ),
            _ => None,
        }
    }

    /// Process exit code for this error when it aborts the launcher.
    pub fn exit_code(&self) -> i32 {
        match self {
            FenceError::ChildFailure(code) => *code,
            FenceError::CommandDenied { .. } => 2,
            _ => 1,
        }
    }
}

/// Display a user-facing error to stderr with optional verbose output.
///
/// Format:
///   error: top-level message
///     caused by: chain item
///
///   hint: actionable suggestion (if available)
pub fn display_error(err: &anyhow::Error, verbose: bool) {
    let color = use_color();
    let mut stderr = std::io::stderr().lock();

    if color {
        let _ = write!(stderr, "\x1b[1;31merror\x1b[0m: {}", err);
    } else {
        let _ = write!(stderr, "error: {}", err);
    }
    let _ = writeln!(stderr);

    let chain: Vec<_> = err.chain().skip(1).collect();
    for (i, cause) in chain.iter().enumerate() {
        if color {
            let _ = writeln!(stderr, "  \x1b[2m{}: {}\x1b[0m", i + 1, cause);
        } else {
            let _ = writeln!(stderr, "  {}: {}", i + 1, cause);
        }
    }

    // Extract a hint from the first FenceError in the chain.
    let hint = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<FenceError>().and_then(FenceError::help));

    if let Some(hint) = hint {
        if color {
            let _ = writeln!(stderr, "\n  \x1b[1;36mhint\x1b[0m: {}", hint);
        } else {
            let _ = writeln!(stderr, "\n  hint: {}", hint);
        }
    }

    if verbose {
        let _ = writeln!(stderr, "\nFull error chain:\n{:?}", err);
    } else if !chain.is_empty() {
        let _ = writeln!(stderr, "\n  run with --debug for full details");
    }
}

fn use_color() -> bool {
    std::env::var("NO_COLOR").is_err() && std::io::stderr().is_terminal()
}
