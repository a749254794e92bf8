//! Shared test utilities for ramroot tests.
#![allow(dead_code)]

use anyhow::Result;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use ramroot::config::BuildConfig;
use ramroot::resolve::{LibraryResolver, Resolution};

pub const RELEASE: &str = "6.1.0-test";

/// Libraries every mock binary links against, host namespace.
pub const MOCK_LIBRARIES: &[&str] = &[
    "/lib/x86_64-linux-gnu/libc.so.6",
    "/lib64/ld-linux-x86-64.so.2",
];

/// Critical tools besides busybox.
pub const MOCK_CRITICAL: &[&str] = &[
    "/usr/sbin/sgdisk",
    "/usr/sbin/zpool",
    "/usr/sbin/zfs",
    "/usr/sbin/debootstrap",
    "/usr/sbin/kexec",
];

/// Test environment: a mock host root and an output directory.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Mock host filesystem binaries are harvested from
    pub host_root: PathBuf,
    /// Base directory (.env location)
    pub base_dir: PathBuf,
    pub output_dir: PathBuf,
    pub init_binary: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base = temp_dir.path();

        let host_root = base.join("host");
        let output_dir = base.join("output");
        let init_binary = base.join("ramroot-init");
        fs::create_dir_all(&host_root).expect("Failed to create host root");
        create_mock_binary(&init_binary);

        Self {
            host_root,
            output_dir,
            init_binary,
            base_dir: base.to_path_buf(),
            _temp_dir: temp_dir,
        }
    }

    /// Build configuration pointed at the mock host.
    pub fn config(&self, extra: &[(&str, &str)]) -> BuildConfig {
        let mut vars: HashMap<String, String> = HashMap::new();
        vars.insert(
            "RAMROOT_HOST_ROOT".into(),
            self.host_root.display().to_string(),
        );
        vars.insert(
            "RAMROOT_OUTPUT".into(),
            self.output_dir.display().to_string(),
        );
        vars.insert("RAMROOT_KERNEL_RELEASE".into(), RELEASE.into());
        for (key, value) in extra {
            vars.insert(key.to_string(), value.to_string());
        }
        BuildConfig::from_vars(&vars, &self.base_dir, RELEASE, self.init_binary.clone())
            .expect("Failed to build config")
    }
}

/// Populate a host root with every critical tool, a busybox that lists a
/// few applets, mock libraries and a module tree.
pub fn create_mock_host(root: &Path) {
    for dir in ["bin", "sbin", "usr/bin", "usr/sbin", "etc", "root/.ssh"] {
        fs::create_dir_all(root.join(dir)).expect("Failed to create mock host dir");
    }

    write_executable(
        &root.join("bin/busybox"),
        "#!/bin/sh\nprintf 'ls\\ncat\\nsh\\nreboot\\nip\\nudhcpc\\n'\n",
    );
    for path in MOCK_CRITICAL {
        create_mock_binary(&host(root, path));
    }
    create_mock_binary(&root.join("usr/sbin/dropbear"));

    for lib in MOCK_LIBRARIES {
        create_mock_library(&host(root, lib));
    }

    fs::write(
        root.join("etc/passwd"),
        "root:x:0:0:root:/root:/bin/bash\nop:x:1000:1000::/home/op:/bin/bash\n",
    )
    .expect("Failed to create passwd");

    create_module_tree(root, true);
}

/// Module tree for [`RELEASE`], with or without the pool modules.
pub fn create_module_tree(root: &Path, with_pool: bool) {
    let release = root.join("lib/modules").join(RELEASE);
    let nvme = release.join("kernel/drivers/nvme/host");
    fs::create_dir_all(&nvme).expect("Failed to create module dir");
    fs::write(nvme.join("nvme.ko"), b"nvme module").expect("Failed to write module");
    fs::write(release.join("modules.order"), "kernel/drivers/nvme/host/nvme.ko\n")
        .expect("Failed to write modules.order");

    let pool = release.join("updates/dkms");
    if with_pool {
        fs::create_dir_all(&pool).expect("Failed to create pool module dir");
        fs::write(pool.join("zfs.ko"), b"zfs module").expect("Failed to write module");
        fs::write(pool.join("spl.ko"), b"spl module").expect("Failed to write module");
    } else if pool.exists() {
        fs::remove_dir_all(&pool).expect("Failed to remove pool modules");
    }
}

/// Map an absolute host path into the mock root.
pub fn host(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}

pub fn write_executable(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent dir for binary");
    }
    fs::write(path, contents).expect("Failed to write executable");
    let mut perms = fs::metadata(path).expect("Failed to get metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("Failed to set permissions");
}

/// Create a mock executable binary file.
pub fn create_mock_binary(path: &Path) {
    write_executable(path, "#!/bin/sh\necho mock\n");
}

/// Create a mock shared library file.
pub fn create_mock_library(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent dir for library");
    }
    fs::write(path, b"\x7fELF mock library").expect("Failed to create mock library");
}

/// Resolver answering from a fixed table; every other binary gets
/// [`MOCK_LIBRARIES`] under the mock root's namespace.
pub struct FakeResolver {
    pub host_root: PathBuf,
    pub overrides: HashMap<PathBuf, BTreeSet<PathBuf>>,
}

impl FakeResolver {
    pub fn new(host_root: &Path) -> Self {
        Self {
            host_root: host_root.to_path_buf(),
            overrides: HashMap::new(),
        }
    }
}

impl LibraryResolver for FakeResolver {
    fn resolve(&self, binary: &Path) -> Result<Resolution> {
        let libraries = match self.overrides.get(binary) {
            Some(libs) => libs.clone(),
            None => MOCK_LIBRARIES.iter().map(PathBuf::from).collect(),
        };
        Ok(Resolution {
            binary: binary.to_path_buf(),
            libraries,
            missing: Vec::new(),
        })
    }
}

/// Assert that a symlink exists and points to the expected target.
pub fn assert_symlink(path: &Path, expected_target: &str) {
    assert!(
        path.is_symlink(),
        "Expected symlink at {}, but it's not a symlink",
        path.display()
    );

    let target = fs::read_link(path).expect("Failed to read symlink");
    assert_eq!(
        target.to_string_lossy(),
        expected_target,
        "Symlink {} points to {:?}, expected {}",
        path.display(),
        target,
        expected_target
    );
}

/// Assert that a file contains expected content.
pub fn assert_file_contains(path: &Path, expected: &str) {
    let content = fs::read_to_string(path)
        .unwrap_or_else(|_| panic!("Failed to read file: {}", path.display()));
    assert!(
        content.contains(expected),
        "File {} does not contain expected content.\nExpected to find: {}\nActual content: {}",
        path.display(),
        expected,
        content
    );
}

/// Assert that a file exists.
pub fn assert_file_exists(path: &Path) {
    assert!(path.exists(), "Expected file to exist: {}", path.display());
}
