//! Platform confinement builders.
//!
//! Each platform translates a policy plus a shell command into a fully
//! quoted launcher invocation: bubblewrap with seccomp and Landlock layers
//! on Linux, a Seatbelt profile under `sandbox-exec` on macOS. Platform
//! selection is compile-time; the caller executes the returned string via a
//! shell and inherits the child's exit code.

#[cfg(target_os = "linux")]
pub mod bridge;
#[cfg(target_os = "linux")]
pub mod features;
#[cfg(target_os = "linux")]
pub mod landlock_apply;
#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "linux")]
pub mod monitor;
#[cfg(target_os = "linux")]
pub mod seccomp;
pub mod shell;

use crate::config::Config;
use crate::errors::FenceError;

/// Translates a policy plus a user command into a confined invocation.
pub trait ConfinementBuilder {
    /// Produce a fully shell-quoted command string that runs `command`
    /// inside the confinement described by `config`.
    fn wrap(&self, config: &Config, command: &str) -> Result<String, FenceError>;
}

/// Exec a command, replacing the current process. The final step after
/// in-process confinement (Landlock wrapper) is applied.
#[cfg(unix)]
pub(crate) fn do_exec(command: &[String]) -> Result<std::convert::Infallible, FenceError> {
    use std::ffi::CString;

    let c_command = CString::new(command[0].as_str())
        .map_err(|e| FenceError::Internal(format!("invalid command: {e}")))?;
    let c_args: Vec<CString> = command
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<_, _>>()
        .map_err(|e| FenceError::Internal(format!("invalid argument: {e}")))?;
    let c_arg_ptrs: Vec<*const libc::c_char> = c_args
        .iter()
        .map(|arg| arg.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    unsafe {
        libc::execvp(c_command.as_ptr(), c_arg_ptrs.as_ptr());
    }

    // execvp only returns on error.
    Err(FenceError::Io(std::io::Error::last_os_error()))
}
