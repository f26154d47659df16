//! Built-in catalogs and default policy locations.

use std::path::PathBuf;

/// Command prefixes denied by default (mixed into `command.deny` unless
/// `useDefaults` is false). Grouped by failure mode: machine state, kernel
/// modules, raw disk access, container escapes.
pub const DEFAULT_DENIED_COMMANDS: &[&str] = &[
    // Machine state
    "shutdown",
    "reboot",
    "halt",
    "poweroff",
    "init 0",
    "init 6",
    "systemctl poweroff",
    "systemctl reboot",
    "systemctl halt",
    // Kernel modules
    "insmod",
    "rmmod",
    "modprobe",
    // Raw disk writers
    "mkfs",
    "mkswap",
    "fdisk",
    "parted",
    "dd if=",
    "dd of=/dev/",
    "shred /dev/",
    "wipefs",
    // Container / namespace escapes
    "nsenter",
    "machinectl shell",
    "docker run --privileged",
    "docker exec --privileged",
];

/// Default policy file locations, most-preferred first.
///
/// Linux: `~/.config/fence/fence.json`; macOS:
/// `~/Library/Application Support/fence/fence.json`; both platforms fall
/// back to the legacy dotfile `~/.fence.json`.
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if cfg!(target_os = "macos") {
        if let Some(home) = dirs::home_dir() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join("fence")
                    .join("fence.json"),
            );
        }
    } else if let Some(config) = dirs::config_dir() {
        paths.push(config.join("fence").join("fence.json"));
    }

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".fence.json"));
    }

    paths
}

/// Path of a named template in the user's template catalog.
pub fn template_path(name: &str) -> Option<PathBuf> {
    let base = if cfg!(target_os = "macos") {
        dirs::home_dir().map(|h| h.join("Library").join("Application Support").join("fence"))
    } else {
        dirs::config_dir().map(|c| c.join("fence"))
    };
    base.map(|b| b.join("templates").join(format!("{}.json", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_end_with_legacy_dotfile() {
        let paths = default_config_paths();
        assert!(!paths.is_empty());
        assert!(
            paths
                .last()
                .unwrap()
                .to_string_lossy()
                .ends_with(".fence.json")
        );
    }

    #[test]
    fn template_path_uses_catalog_dir() {
        let path = template_path("strict").unwrap();
        let s = path.to_string_lossy();
        assert!(s.ends_with("templates/strict.json"), "{s}");
    }

    #[test]
    fn dangerous_catalog_covers_spec_families() {
        assert!(DEFAULT_DENIED_COMMANDS.contains(&"reboot"));
        assert!(DEFAULT_DENIED_COMMANDS.contains(&"insmod"));
        assert!(DEFAULT_DENIED_COMMANDS.contains(&"dd if="));
        assert!(DEFAULT_DENIED_COMMANDS.contains(&"nsenter"));
    }
}
