//! seccomp-BPF filter generation for the bubblewrap launcher.
//!
//! The filter denies a catalog of dangerous syscalls with
//! `SECCOMP_RET_ERRNO(EPERM)` and allows everything else. bwrap receives
//! the compiled program on fd 3 (`--seccomp 3`), so the raw BPF bytes are
//! written to a temporary file the wrapped command opens before exec.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};
use tracing::debug;

use crate::errors::FenceError;

/// Syscalls denied inside the sandbox: debugger/cross-memory access,
/// keyrings, odd personalities, kernel-facing loaders, and mount-table
/// manipulation.
pub const DANGEROUS_SYSCALLS: &[libc::c_long] = &[
    libc::SYS_ptrace,
    libc::SYS_process_vm_readv,
    libc::SYS_process_vm_writev,
    libc::SYS_add_key,
    libc::SYS_request_key,
    libc::SYS_keyctl,
    libc::SYS_personality,
    libc::SYS_userfaultfd,
    libc::SYS_perf_event_open,
    libc::SYS_bpf,
    libc::SYS_kexec_load,
    libc::SYS_kexec_file_load,
    libc::SYS_mount,
    libc::SYS_umount2,
    libc::SYS_pivot_root,
    libc::SYS_init_module,
    libc::SYS_finit_module,
    libc::SYS_delete_module,
    libc::SYS_move_mount,
    libc::SYS_open_tree,
    libc::SYS_fsconfig,
    libc::SYS_fsmount,
    libc::SYS_fsopen,
    libc::SYS_fspick,
];

/// Compile the deny filter and write it to a temp file.
///
/// Returns the file path; the caller owns deletion (after the sandbox
/// exits). The wrapped command opens it as `exec 3<path` before bwrap.
pub fn generate_bpf_filter() -> Result<PathBuf, FenceError> {
    let program = compile_filter()?;
    let bytes = program_bytes(&program);

    let mut file = tempfile::Builder::new()
        .prefix("fence-seccomp-")
        .suffix(".bpf")
        .tempfile()
        .map_err(|e| FenceError::Internal(format!("seccomp filter temp file: {e}")))?;
    file.write_all(&bytes)
        .map_err(|e| FenceError::Internal(format!("seccomp filter write: {e}")))?;

    let (_file, path) = file
        .keep()
        .map_err(|e| FenceError::Internal(format!("seccomp filter persist: {e}")))?;
    debug!(path = %path.display(), syscalls = DANGEROUS_SYSCALLS.len(), "seccomp filter compiled");
    Ok(path)
}

fn compile_filter() -> Result<BpfProgram, FenceError> {
    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
    for &syscall in DANGEROUS_SYSCALLS {
        // Empty rule list: deny unconditionally.
        rules.insert(syscall, vec![]);
    }

    let arch = if cfg!(target_arch = "x86_64") {
        TargetArch::x86_64
    } else if cfg!(target_arch = "aarch64") {
        TargetArch::aarch64
    } else {
        return Err(FenceError::PrerequisiteMissing(
            "seccomp: unsupported architecture".into(),
        ));
    };

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::Allow,                       // default: allow
        SeccompAction::Errno(libc::EPERM as u32),   // filtered: fail with EPERM
        arch,
    )
    .map_err(|e| FenceError::Internal(format!("seccomp filter: {e}")))?;

    filter
        .try_into()
        .map_err(|e| FenceError::Internal(format!("seccomp compile: {e}")))
}

/// Serialize the program as raw `sock_filter` entries (little-endian
/// `code:u16 jt:u8 jf:u8 k:u32`), the layout bwrap's `--seccomp` fd expects.
fn program_bytes(program: &BpfProgram) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(program.len() * 8);
    for insn in program {
        bytes.extend_from_slice(&insn.code.to_le_bytes());
        bytes.push(insn.jt);
        bytes.push(insn.jf);
        bytes.extend_from_slice(&insn.k.to_le_bytes());
    }
    bytes
}
