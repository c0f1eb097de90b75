//! Process-wide settings: boot-image path, kernel-library path,
//! verbosity level. Written once at startup (by the CLI entry point,
//! before any heap operation) and read thereafter — the same
//! set-once-read-many `OnceLock` convention the teacher uses for its
//! command-line argument vector.

use std::sync::OnceLock;

static BOOT_PATH: OnceLock<String> = OnceLock::new();
static KERNEL_PATH: OnceLock<String> = OnceLock::new();
static VERBOSITY: OnceLock<u8> = OnceLock::new();

/// Parsed from `--boot <path>`. Ignored if called more than once.
pub fn set_boot_path(path: impl Into<String>) {
    let _ = BOOT_PATH.set(path.into());
}

pub fn boot_path() -> Option<&'static str> {
    BOOT_PATH.get().map(String::as_str)
}

/// Parsed from `--kernel <path>`. Ignored if called more than once.
pub fn set_kernel_path(path: impl Into<String>) {
    let _ = KERNEL_PATH.set(path.into());
}

pub fn kernel_path() -> Option<&'static str> {
    KERNEL_PATH.get().map(String::as_str)
}

/// Parsed from `--verbose <level>`. Ignored if called more than once.
pub fn set_verbosity(level: u8) {
    let _ = VERBOSITY.set(level);
}

pub fn verbosity() -> u8 {
    VERBOSITY.get().copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    // These globals are process-wide and `OnceLock`-latched, so (as with
    // the teacher's own `ARGS` tests) order between these three is not
    // meaningful in isolation; `#[serial]` only keeps them from racing
    // each other. Each test only checks the write it itself performed.

    #[test]
    #[serial]
    fn set_is_idempotent_after_first_call() {
        set_boot_path("/boot/a.bowl");
        set_boot_path("/boot/b.bowl");
        assert_eq!(boot_path(), Some("/boot/a.bowl"));
    }

    #[test]
    #[serial]
    fn verbosity_round_trips_once_set() {
        set_verbosity(3);
        assert_eq!(verbosity(), 3);
    }

    #[test]
    #[serial]
    fn kernel_path_round_trips_once_set() {
        set_kernel_path("/lib/kernel.bowl");
        assert_eq!(kernel_path(), Some("/lib/kernel.bowl"));
    }
}
