//! Launch host checks: can this machine kexec into the image right now.
//!
//! Kernel state is read below `root` (normally `/`) so the parsers run
//! against fixture trees in tests.

use std::fs;
use std::path::Path;

use crate::config::host_path;

use super::types::CheckResult;

pub const CHECK_KEXEC: &str = "kexec";
pub const CHECK_SCRATCH: &str = "scratch space";

const SECURE_BOOT_VAR: &str =
    "/sys/firmware/efi/efivars/SecureBoot-8be4df61-93ca-11d2-aa0d-00e098032b8c";
const LOCKDOWN: &str = "/sys/kernel/security/lockdown";
const MEMINFO: &str = "/proc/meminfo";

/// Headroom over the unpacked image for the kernel and the running system.
pub const MEMORY_MARGIN_MIB: u64 = 256;

/// Secure Boot state from the efivar contents: 4 attribute bytes, then the value.
pub fn parse_secure_boot(bytes: &[u8]) -> Option<bool> {
    bytes.get(4).map(|value| *value == 1)
}

/// The bracketed mode of `none [integrity] confidentiality`.
pub fn parse_lockdown(text: &str) -> Option<&str> {
    let start = text.find('[')? + 1;
    let end = start + text[start..].find(']')?;
    Some(&text[start..end])
}

/// `MemAvailable` in MiB.
pub fn parse_mem_available(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemAvailable:")?;
        let kib: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
        Some(kib / 1024)
    })
}

/// Hard: some kexec must be runnable, from the host or the image.
pub fn check_kexec(kexec: Option<&Path>) -> CheckResult {
    match kexec {
        Some(path) => CheckResult::pass_with(CHECK_KEXEC, &path.display().to_string()),
        None => CheckResult::fail(
            CHECK_KEXEC,
            "Not on the host and not extractable from the image - install kexec-tools",
        ),
    }
}

/// Whether firmware reports Secure Boot on.
pub fn secure_boot_enabled(root: &Path) -> bool {
    fs::read(host_path(root, Path::new(SECURE_BOOT_VAR)))
        .ok()
        .and_then(|bytes| parse_secure_boot(&bytes))
        .unwrap_or(false)
}

pub fn check_secure_boot(root: &Path) -> CheckResult {
    let name = "secure boot";
    match fs::read(host_path(root, Path::new(SECURE_BOOT_VAR))) {
        Err(_) => CheckResult::skip(name, "No EFI variable (legacy boot or efivarfs not mounted)"),
        Ok(bytes) => match parse_secure_boot(&bytes) {
            Some(true) => CheckResult::warn(
                name,
                "Enabled - the kernel must be signed and kexec_file_load is used",
            ),
            Some(false) => CheckResult::pass_with(name, "disabled"),
            None => CheckResult::warn(name, "Unreadable SecureBoot variable"),
        },
    }
}

pub fn check_lockdown(root: &Path) -> CheckResult {
    let name = "kernel lockdown";
    match fs::read_to_string(host_path(root, Path::new(LOCKDOWN))) {
        Err(_) => CheckResult::skip(name, "No lockdown interface"),
        Ok(text) => match parse_lockdown(&text) {
            Some("none") => CheckResult::pass_with(name, "none"),
            Some(mode) => CheckResult::warn(
                name,
                &format!("Mode '{}' - unsigned kernels will be refused", mode),
            ),
            None => CheckResult::warn(name, "Unrecognised lockdown state"),
        },
    }
}

/// Minimum memory for an image that unpacks to `unpacked_bytes`.
pub fn image_memory_mib(unpacked_bytes: u64) -> u64 {
    unpacked_bytes.div_ceil(1024 * 1024) + MEMORY_MARGIN_MIB
}

/// Warn below `min_mib`; no minimum means no check.
pub fn check_memory(root: &Path, min_mib: Option<u64>) -> CheckResult {
    let name = "available memory";
    let Some(min_mib) = min_mib else {
        return CheckResult::skip(name, "No minimum configured");
    };
    let available = fs::read_to_string(host_path(root, Path::new(MEMINFO)))
        .ok()
        .as_deref()
        .and_then(parse_mem_available);
    match available {
        Some(mib) if mib >= min_mib => {
            CheckResult::pass_with(name, &format!("{} MiB (minimum {} MiB)", mib, min_mib))
        }
        Some(mib) => CheckResult::warn(
            name,
            &format!("{} MiB available, below the {} MiB minimum", mib, min_mib),
        ),
        None => CheckResult::warn(name, "MemAvailable not reported"),
    }
}

/// Hard: the scratch directory must accept writes.
pub fn check_scratch(scratch: &Path) -> CheckResult {
    if let Err(e) = fs::create_dir_all(scratch) {
        return CheckResult::fail(
            CHECK_SCRATCH,
            &format!("Cannot create {}: {}", scratch.display(), e),
        );
    }
    let probe = scratch.join(".preflight-test");
    match fs::write(&probe, "test") {
        Ok(()) => {
            let _ = fs::remove_file(&probe);
            CheckResult::pass_with(CHECK_SCRATCH, &scratch.display().to_string())
        }
        Err(e) => CheckResult::fail(
            CHECK_SCRATCH,
            &format!("Cannot write to {}: {}", scratch.display(), e),
        ),
    }
}

pub fn check_launch_environment(
    root: &Path,
    scratch: &Path,
    min_memory_mib: Option<u64>,
    kexec: Option<&Path>,
) -> Vec<CheckResult> {
    vec![
        check_kexec(kexec),
        check_secure_boot(root),
        check_lockdown(root),
        check_memory(root, min_memory_mib),
        check_scratch(scratch),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preflight::types::CheckStatus;
    use tempfile::TempDir;

    #[test]
    fn test_parsers() {
        assert_eq!(parse_secure_boot(&[6, 0, 0, 0, 1]), Some(true));
        assert_eq!(parse_secure_boot(&[6, 0, 0, 0, 0]), Some(false));
        assert_eq!(parse_secure_boot(&[6, 0]), None);

        assert_eq!(parse_lockdown("[none] integrity confidentiality\n"), Some("none"));
        assert_eq!(parse_lockdown("none [integrity] confidentiality\n"), Some("integrity"));
        assert_eq!(parse_lockdown("garbage"), None);

        let meminfo = "MemTotal:       16318504 kB\nMemFree:  1000 kB\nMemAvailable:    8159252 kB\n";
        assert_eq!(parse_mem_available(meminfo), Some(7968));
    }

    #[test]
    fn test_memory_check() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("proc")).unwrap();
        fs::write(root.path().join("proc/meminfo"), "MemAvailable: 1048576 kB\n").unwrap();

        assert_eq!(check_memory(root.path(), None).status, CheckStatus::Skip);
        assert_eq!(check_memory(root.path(), Some(512)).status, CheckStatus::Pass);
        assert_eq!(check_memory(root.path(), Some(4096)).status, CheckStatus::Warn);
    }

    #[test]
    fn test_memory_below_image_size_warns() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("proc")).unwrap();
        fs::write(root.path().join("proc/meminfo"), "MemAvailable: 524288 kB
").unwrap();

        let min = image_memory_mib(600 * 1024 * 1024);
        assert_eq!(min, 600 + MEMORY_MARGIN_MIB);
        let result = check_memory(root.path(), Some(min));
        assert_eq!(result.status, CheckStatus::Warn);

        let small = image_memory_mib(64 * 1024 * 1024 + 1);
        assert_eq!(small, 65 + MEMORY_MARGIN_MIB);
        assert_eq!(check_memory(root.path(), Some(small)).status, CheckStatus::Pass);
    }

    #[test]
    fn test_secure_boot_from_efivar() {
        let root = TempDir::new().unwrap();
        assert!(!secure_boot_enabled(root.path()));
        assert_eq!(check_secure_boot(root.path()).status, CheckStatus::Skip);

        let vars = root.path().join("sys/firmware/efi/efivars");
        fs::create_dir_all(&vars).unwrap();
        fs::write(
            vars.join("SecureBoot-8be4df61-93ca-11d2-aa0d-00e098032b8c"),
            [6u8, 0, 0, 0, 1],
        )
        .unwrap();
        assert!(secure_boot_enabled(root.path()));
        assert_eq!(check_secure_boot(root.path()).status, CheckStatus::Warn);
    }

    #[test]
    fn test_lockdown_warns() {
        let root = TempDir::new().unwrap();
        assert_eq!(check_lockdown(root.path()).status, CheckStatus::Skip);
        fs::create_dir_all(root.path().join("sys/kernel/security")).unwrap();
        fs::write(
            root.path().join("sys/kernel/security/lockdown"),
            "none [integrity] confidentiality\n",
        )
        .unwrap();
        assert_eq!(check_lockdown(root.path()).status, CheckStatus::Warn);
    }

    #[test]
    fn test_hard_checks() {
        assert_eq!(check_kexec(None).status, CheckStatus::Fail);
        assert_eq!(
            check_kexec(Some(Path::new("/sbin/kexec"))).status,
            CheckStatus::Pass
        );

        let scratch = TempDir::new().unwrap();
        let dir = scratch.path().join("work");
        assert_eq!(check_scratch(&dir).status, CheckStatus::Pass);
        assert!(dir.is_dir());
    }
}
