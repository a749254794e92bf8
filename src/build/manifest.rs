//! Binary manifest and host search.
//!
//! Each logical tool names the executables that can provide it and whether
//! the environment is useless without it. Critical misses stop the build;
//! optional misses only degrade it.

use anyhow::Result;
use std::collections::BTreeSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config::host_path;
use crate::error::BuildError;
use crate::prompt::Prompter;

/// Directories searched in the host root, in order.
pub const BIN_DIRS: &[&str] = &[
    "/usr/local/sbin",
    "/usr/local/bin",
    "/usr/sbin",
    "/usr/bin",
    "/sbin",
    "/bin",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Critical,
    Optional,
}

/// One logical tool: a name, the executables that provide it, its class.
#[derive(Debug, Clone, Copy)]
pub struct ManifestEntry {
    pub name: &'static str,
    pub candidates: &'static [&'static str],
    pub class: Class,
}

const fn critical(name: &'static str, candidates: &'static [&'static str]) -> ManifestEntry {
    ManifestEntry {
        name,
        candidates,
        class: Class::Critical,
    }
}

const fn optional(name: &'static str) -> ManifestEntry {
    ManifestEntry {
        name,
        candidates: &[],
        class: Class::Optional,
    }
}

/// The tool manifest. Empty candidate lists search for the logical name.
pub const MANIFEST: &[ManifestEntry] = &[
    // Multi-call base
    critical("busybox", &["busybox", "busybox.static"]),
    // Partitioning
    critical("sgdisk", &["sgdisk"]),
    // Storage pools
    critical("zpool", &["zpool"]),
    critical("zfs", &["zfs"]),
    // OS bootstrap
    critical("debootstrap", &["debootstrap"]),
    // Environment switch
    critical("kexec", &["kexec"]),
    // Shell and remote access
    optional("bash"),
    optional("dropbear"),
    optional("dropbearkey"),
    optional("dropbearconvert"),
    // Network
    optional("ip"),
    optional("wget"),
    optional("curl"),
    // Disks
    optional("parted"),
    optional("wipefs"),
    optional("mkfs.vfat"),
    optional("mkfs.ext4"),
    optional("blkid"),
    optional("lsblk"),
    optional("mdadm"),
    optional("cryptsetup"),
    optional("zdb"),
    // Packages
    optional("dpkg"),
    optional("ar"),
    optional("gpgv"),
    optional("perl"),
    // Kernel modules and devices
    optional("modprobe"),
    optional("depmod"),
    optional("udevadm"),
    // Convenience
    optional("chroot"),
    optional("less"),
    optional("nano"),
    optional("rsync"),
    optional("ssh"),
    optional("scp"),
    optional("ssh-keygen"),
];

impl ManifestEntry {
    pub fn candidates(&self) -> Vec<&'static str> {
        if self.candidates.is_empty() {
            vec![self.name]
        } else {
            self.candidates.to_vec()
        }
    }
}

/// A tool found on the host, with its libraries once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryArtifact {
    pub name: String,
    /// Absolute path in the host namespace (not prefixed with the host root).
    pub path: PathBuf,
    pub class: Class,
    pub libraries: BTreeSet<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub found: Vec<BinaryArtifact>,
    pub missing_critical: Vec<String>,
    pub missing_optional: Vec<String>,
}

/// Find an executable by name in [`BIN_DIRS`] under `host_root`.
pub fn find_binary(host_root: &Path, name: &str) -> Option<PathBuf> {
    BIN_DIRS
        .iter()
        .map(|dir| Path::new(dir).join(name))
        .find(|path| is_executable(&host_path(host_root, path)))
}

fn is_executable(path: &Path) -> bool {
    // Follows symlinks, so a dangling link does not count
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Search the host for every manifest entry. All misses are collected.
pub fn search(host_root: &Path, manifest: &[ManifestEntry], busybox: Option<&Path>) -> SearchOutcome {
    let mut outcome = SearchOutcome::default();

    for entry in manifest {
        let explicit = match (entry.name, busybox) {
            ("busybox", Some(path)) => {
                Some(path.to_path_buf()).filter(|p| is_executable(&host_path(host_root, p)))
            }
            _ => None,
        };
        let found = explicit.or_else(|| {
            entry
                .candidates()
                .into_iter()
                .find_map(|name| find_binary(host_root, name))
        });

        match (found, entry.class) {
            (Some(path), class) => outcome.found.push(BinaryArtifact {
                name: entry.name.to_string(),
                path,
                class,
                libraries: BTreeSet::new(),
            }),
            (None, Class::Critical) => outcome.missing_critical.push(entry.name.to_string()),
            (None, Class::Optional) => outcome.missing_optional.push(entry.name.to_string()),
        }
    }

    outcome
}

/// Search until every critical tool is present or the operator gives up.
///
/// Missing optional tools are logged and tolerated.
pub fn search_with_remediation(
    host_root: &Path,
    manifest: &[ManifestEntry],
    busybox: Option<&Path>,
    prompter: &mut dyn Prompter,
) -> Result<SearchOutcome> {
    loop {
        let outcome = search(host_root, manifest, busybox);

        for name in &outcome.missing_optional {
            tracing::warn!(binary = %name, "optional binary not found; related features unavailable");
        }
        if outcome.missing_critical.is_empty() {
            return Ok(outcome);
        }

        println!();
        println!("  Missing critical binaries:");
        for name in &outcome.missing_critical {
            println!("    - {}", name);
        }
        println!();

        let answer = prompter.ask(
            "Install the packages providing them, then type 'retry' (anything else aborts):",
        )?;
        if answer.trim() != "retry" {
            return Err(BuildError::MissingCritical {
                names: outcome.missing_critical,
            }
            .into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::ScriptedPrompter;
    use std::fs;
    use tempfile::TempDir;

    fn executable(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_find_binary_search_order() {
        let host = TempDir::new().unwrap();
        executable(host.path(), "usr/bin/bash");
        executable(host.path(), "bin/bash");
        assert_eq!(
            find_binary(host.path(), "bash"),
            Some(PathBuf::from("/usr/bin/bash"))
        );
    }

    #[test]
    fn test_non_executable_is_ignored() {
        let host = TempDir::new().unwrap();
        fs::create_dir_all(host.path().join("usr/sbin")).unwrap();
        fs::write(host.path().join("usr/sbin/zpool"), "data").unwrap();
        assert_eq!(find_binary(host.path(), "zpool"), None);
    }

    #[test]
    fn test_search_collects_all_misses() {
        let host = TempDir::new().unwrap();
        executable(host.path(), "bin/busybox");
        executable(host.path(), "usr/sbin/zfs");

        let outcome = search(host.path(), MANIFEST, None);
        assert_eq!(
            outcome.missing_critical,
            vec!["sgdisk", "zpool", "debootstrap", "kexec"]
        );
        assert!(outcome.missing_optional.contains(&"bash".to_string()));
        assert_eq!(outcome.found.len(), 2);
    }

    #[test]
    fn test_busybox_override() {
        let host = TempDir::new().unwrap();
        executable(host.path(), "opt/bb/busybox");
        let outcome = search(host.path(), &MANIFEST[..1], Some(Path::new("/opt/bb/busybox")));
        assert_eq!(outcome.found[0].path, PathBuf::from("/opt/bb/busybox"));
    }

    #[test]
    fn test_remediation_retry_then_abort() {
        let host = TempDir::new().unwrap();
        let mut prompter = ScriptedPrompter::new(["retry", "abort"]);
        let err = search_with_remediation(host.path(), &MANIFEST[..2], None, &mut prompter)
            .unwrap_err();
        assert_eq!(prompter.questions.len(), 2);
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::MissingCritical { names }) => {
                assert_eq!(names, &vec!["busybox".to_string(), "sgdisk".to_string()])
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
