//! eBPF violation monitor: descendant-PID EACCES/EPERM syscall logging.
//!
//! Runs a bpftrace program attached to the raw syscall exit tracepoint,
//! filtered to `pid >= sandbox_root_pid` so pre-existing system processes
//! stay out of the report. Purely observational; lifetime is coterminous
//! with the sandbox.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use crate::errors::FenceError;
use crate::proxy::ViolationLog;

pub struct EbpfMonitor {
    child: Option<Child>,
    reader_thread: Option<thread::JoinHandle<()>>,
    pub root_pid: u32,
}

impl EbpfMonitor {
    /// Start monitoring descendants of `root_pid`. Requires bpftrace and
    /// CAP_BPF (or root); the caller gates on the feature probe.
    pub fn start(root_pid: u32, violations: Arc<ViolationLog>) -> Result<EbpfMonitor, FenceError> {
        let bpftrace = which::which("bpftrace").map_err(|e| {
            FenceError::PrerequisiteMissing(format!("bpftrace not found for eBPF monitor: {e}"))
        })?;

        let program = format!(
            "tracepoint:raw_syscalls:sys_exit \
             /pid >= {root_pid} && (args->ret == -{eacces} || args->ret == -{eperm})/ \
             {{ printf(\"%d %s %d %d\\n\", pid, comm, args->id, args->ret); }}",
            eacces = libc::EACCES,
            eperm = libc::EPERM,
        );

        let mut child = Command::new(bpftrace)
            .arg("-e")
            .arg(&program)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                FenceError::ResourceUnavailable(format!("failed to start eBPF monitor: {e}"))
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            FenceError::Internal("eBPF monitor stdout not captured".into())
        })?;

        let reader_thread = thread::Builder::new()
            .name("ebpf-monitor".into())
            .spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                    if let Some(record) = parse_event(&line) {
                        violations.record(
                            "syscall",
                            &record.comm,
                            format!(
                                "pid {} syscall {} returned {}",
                                record.pid, record.syscall, record.errno_name
                            ),
                        );
                    }
                }
                debug!("eBPF monitor reader exiting");
            })
            .map_err(FenceError::Io)?;

        debug!(root_pid, "eBPF monitor started");
        Ok(EbpfMonitor {
            child: Some(child),
            reader_thread: Some(reader_thread),
            root_pid,
        })
    }

    /// Kill bpftrace and reap the reader.
    pub fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                warn!(error = %e, "failed to kill eBPF monitor");
            }
            let _ = child.wait();
        }
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EbpfMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SyscallEvent {
    pid: u32,
    comm: String,
    syscall: i64,
    errno_name: &'static str,
}

/// Parse a `pid comm syscall ret` line from the bpftrace program.
fn parse_event(line: &str) -> Option<SyscallEvent> {
    let mut parts = line.split_whitespace();
    let pid = parts.next()?.parse().ok()?;
    let comm = parts.next()?.to_string();
    let syscall = parts.next()?.parse().ok()?;
    let ret: i64 = parts.next()?.parse().ok()?;
    let errno_name = match -ret as i32 {
        libc::EACCES => "EACCES",
        libc::EPERM => "EPERM",
        _ => return None,
    };
    Some(SyscallEvent {
        pid,
        comm,
        syscall,
        errno_name,
    })
}
