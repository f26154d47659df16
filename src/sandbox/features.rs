//! Linux kernel capability detection and downgrade decisions.
//!
//! Probed once per invocation. Missing bwrap/socat is a hard error; every
//! other gap downgrades a single layer (network namespace, Landlock,
//! seccomp, eBPF monitoring) while the rest of the sandbox stays engaged.

use std::fmt::Write as _;

/// Kernel version that introduced Landlock.
const LANDLOCK_MIN_KERNEL: (u32, u32) = (5, 13);

/// CapEff bit positions (see capability.h).
const CAP_NET_ADMIN: u32 = 12;
const CAP_BPF: u32 = 39;

/// Snapshot of the sandbox-relevant capabilities of this host.
#[derive(Debug, Clone, Default)]
pub struct LinuxFeatures {
    pub kernel_major: u32,
    pub kernel_minor: u32,
    pub has_bwrap: bool,
    pub has_socat: bool,
    pub can_unshare_net: bool,
    pub has_seccomp: bool,
    pub seccomp_log_level: u8,
    pub has_landlock: bool,
    pub landlock_abi: u32,
    pub has_cap_bpf: bool,
    pub is_root: bool,
    pub is_wsl: bool,
}

impl LinuxFeatures {
    /// Probe the current host.
    pub fn detect() -> LinuxFeatures {
        let (kernel_major, kernel_minor) = kernel_version();
        let cap_eff = effective_capabilities();
        let is_root = unsafe { libc::geteuid() } == 0;
        let landlock_abi = landlock_abi_for_kernel(kernel_major, kernel_minor);

        LinuxFeatures {
            kernel_major,
            kernel_minor,
            has_bwrap: which::which("bwrap").is_ok(),
            has_socat: which::which("socat").is_ok(),
            can_unshare_net: is_root || cap_bit(cap_eff, CAP_NET_ADMIN),
            has_seccomp: std::path::Path::new("/proc/sys/kernel/seccomp").exists(),
            seccomp_log_level: seccomp_log_level(),
            has_landlock: landlock_abi > 0,
            landlock_abi,
            has_cap_bpf: cap_bit(cap_eff, CAP_BPF),
            is_root,
            is_wsl: detect_wsl(),
        }
    }

    /// bwrap and socat are the floor; without them Linux is unsupported.
    pub fn minimum_viable(&self) -> bool {
        self.has_bwrap && self.has_socat
    }

    pub fn can_use_landlock(&self) -> bool {
        self.has_landlock
            && (self.kernel_major, self.kernel_minor) >= LANDLOCK_MIN_KERNEL
    }

    pub fn has_ebpf(&self) -> bool {
        self.has_cap_bpf || self.is_root
    }

    /// One-line summary for debug output.
    pub fn summary(&self) -> String {
        let mut s = format!(
            "kernel {}.{}, bwrap={}, socat={}, unshare-net={}, seccomp={}",
            self.kernel_major,
            self.kernel_minor,
            self.has_bwrap,
            self.has_socat,
            self.can_unshare_net,
            self.has_seccomp,
        );
        let _ = write!(
            s,
            ", landlock=v{}, ebpf={}, wsl={}",
            self.landlock_abi,
            self.has_ebpf(),
            self.is_wsl
        );
        s
    }
}

/// Print the feature report for `fence --linux-features`.
pub fn print_features() {
    let features = LinuxFeatures::detect();
    println!("Linux sandbox features:");
    println!("  Kernel: {}.{}", features.kernel_major, features.kernel_minor);
    println!("  Bubblewrap (bwrap): {}", features.has_bwrap);
    println!("  Socat: {}", features.has_socat);
    println!(
        "  Network namespace (--unshare-net): {}",
        features.can_unshare_net
    );
    println!(
        "  Seccomp: {} (log level: {})",
        features.has_seccomp, features.seccomp_log_level
    );
    println!(
        "  Landlock: {} (ABI v{})",
        features.has_landlock, features.landlock_abi
    );
    println!(
        "  eBPF: {} (CAP_BPF: {}, root: {})",
        features.has_ebpf(),
        features.has_cap_bpf,
        features.is_root
    );

    println!();
    if features.minimum_viable() {
        println!("  minimum requirements met (bwrap + socat)");
    } else {
        let mut missing = Vec::new();
        if !features.has_bwrap {
            missing.push("bwrap");
        }
        if !features.has_socat {
            missing.push("socat");
        }
        println!("  missing requirements: {}", missing.join(", "));
    }
    if !features.can_unshare_net && features.has_bwrap {
        println!("  network namespace unavailable (containerized environment?)");
        println!("  the sandbox still works with reduced network isolation");
    }
    if !features.can_use_landlock() {
        println!("  landlock unavailable (kernel 5.13+ required)");
    }
    if !features.has_ebpf() {
        println!("  ebpf monitoring unavailable (needs CAP_BPF or root)");
    }
}

fn kernel_version() -> (u32, u32) {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease").unwrap_or_default();
    parse_kernel_version(&release)
}

fn parse_kernel_version(release: &str) -> (u32, u32) {
    let mut parts = release.trim().split('.');
    let major = parts
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or_default();
    let minor = parts
        .next()
        .map(|p| p.chars().take_while(|c| c.is_ascii_digit()).collect::<String>())
        .and_then(|p| p.parse().ok())
        .unwrap_or_default();
    (major, minor)
}

/// Landlock ABI version shipped by this kernel line.
fn landlock_abi_for_kernel(major: u32, minor: u32) -> u32 {
    match (major, minor) {
        v if v >= (6, 10) => 5,
        v if v >= (6, 7) => 4,
        v if v >= (6, 2) => 3,
        v if v >= (5, 19) => 2,
        v if v >= (5, 13) => 1,
        _ => 0,
    }
}

/// Parse the CapEff bitmask from /proc/self/status.
fn effective_capabilities() -> u64 {
    let status = std::fs::read_to_string("/proc/self/status").unwrap_or_default();
    status
        .lines()
        .find_map(|line| line.strip_prefix("CapEff:"))
        .and_then(|hex| u64::from_str_radix(hex.trim(), 16).ok())
        .unwrap_or(0)
}

fn cap_bit(caps: u64, bit: u32) -> bool {
    caps & (1u64 << bit) != 0
}

fn seccomp_log_level() -> u8 {
    match std::fs::read_to_string("/proc/sys/kernel/seccomp/actions_logged") {
        Ok(actions) if actions.contains("log") => 2,
        Ok(_) => 1,
        Err(_) => 0,
    }
}

fn detect_wsl() -> bool {
    if std::path::Path::new("/proc/sys/fs/binfmt_misc/WSLInterop").exists() {
        return true;
    }
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|r| r.to_ascii_lowercase().contains("microsoft"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_version_parsing() {
        assert_eq!(parse_kernel_version("6.8.0-39-generic"), (6, 8));
        assert_eq!(parse_kernel_version("5.15.153.1-microsoft-standard-WSL2"), (5, 15));
        assert_eq!(parse_kernel_version("garbage"), (0, 0));
    }

    #[test]
    fn landlock_abi_mapping() {
        assert_eq!(landlock_abi_for_kernel(5, 12), 0);
        assert_eq!(landlock_abi_for_kernel(5, 13), 1);
        assert_eq!(landlock_abi_for_kernel(5, 19), 2);
        assert_eq!(landlock_abi_for_kernel(6, 2), 3);
        assert_eq!(landlock_abi_for_kernel(6, 7), 4);
        assert_eq!(landlock_abi_for_kernel(6, 12), 5);
    }

    #[test]
    fn cap_bit_extraction() {
        assert!(cap_bit(1 << 12, 12));
        assert!(!cap_bit(1 << 12, 39));
        // Full bitmask as granted to root.
        assert!(cap_bit(0x1ffffffffff, 39));
    }

    #[test]
    fn detect_does_not_panic() {
        let features = LinuxFeatures::detect();
        // Landlock support implies the kernel floor.
        if features.can_use_landlock() {
            assert!((features.kernel_major, features.kernel_minor) >= (5, 13));
        }
        let _ = features.summary();
    }
}
