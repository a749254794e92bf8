//! Assembly and packaging against a mock host root.
//!
//! These tests run the whole assembler with a fake library resolver; the
//! only external tools used are the mock busybox script and gzip.

mod helpers;

use helpers::{
    assert_file_contains, assert_file_exists, assert_symlink, create_mock_host,
    create_module_tree, host, FakeResolver, TestEnv, MOCK_LIBRARIES,
};
use ramroot::build::{self, WRAPPER_DIRS, WRAPPER_NAMES};
use ramroot::commands::cmd_build;
use ramroot::config::BOOT_CONFIG_PATH;
use ramroot::error::BuildError;
use ramroot::image::{self, find_file, read_image};
use ramroot::prompt::ScriptedPrompter;
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn assemble(env: &TestEnv, extra: &[(&str, &str)]) -> anyhow::Result<build::Assembly> {
    let config = env.config(extra);
    let mut prompter = ScriptedPrompter::new(Vec::<String>::new());
    build::assemble(
        &config,
        Arc::new(FakeResolver::new(&env.host_root)),
        &mut prompter,
    )
}

#[test]
fn test_every_resolved_library_is_in_the_tree() {
    let env = TestEnv::new();
    create_mock_host(&env.host_root);

    let assembly = assemble(&env, &[]).unwrap();
    let root = assembly.tree.root();

    for artifact in &assembly.artifacts {
        assert_file_exists(&host(root, &artifact.path.to_string_lossy()));
        for library in &artifact.libraries {
            assert!(
                host(root, &library.to_string_lossy()).is_file(),
                "{} needs {}",
                artifact.name,
                library.display()
            );
        }
    }
    for library in MOCK_LIBRARIES {
        assert_file_exists(&host(root, library));
    }
}

#[test]
fn test_init_wrappers_and_applets() {
    let env = TestEnv::new();
    create_mock_host(&env.host_root);

    let assembly = assemble(&env, &[]).unwrap();
    let root = assembly.tree.root();

    assert_file_exists(&root.join("init"));
    for dir in WRAPPER_DIRS {
        for name in WRAPPER_NAMES {
            assert_symlink(&host(root, &format!("{}/{}", dir, name)), "/init");
        }
    }

    // Applets link to busybox unless excluded or provided by a real binary
    assert_symlink(&root.join("bin/ls"), "/bin/busybox");
    assert!(root.join("bin/sh").is_symlink());
    assert!(assembly.applets >= 2);

    assert_file_contains(&host(root, BOOT_CONFIG_PATH), "\"hostname\": \"ramroot\"");
}

#[test]
fn test_assembly_is_idempotent() {
    let env = TestEnv::new();
    create_mock_host(&env.host_root);

    let first = assemble(&env, &[]).unwrap().tree.digest().unwrap();
    let second = assemble(&env, &[]).unwrap().tree.digest().unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_missing_zpool_halts_naming_it() {
    let env = TestEnv::new();
    create_mock_host(&env.host_root);
    fs::remove_file(env.host_root.join("usr/sbin/zpool")).unwrap();

    let config = env.config(&[]);
    let mut prompter = ScriptedPrompter::new(["no"]);
    let err = build::assemble(
        &config,
        Arc::new(FakeResolver::new(&env.host_root)),
        &mut prompter,
    )
    .unwrap_err();

    match err.downcast_ref::<BuildError>() {
        Some(BuildError::MissingCritical { names }) => assert_eq!(names, &["zpool"]),
        other => panic!("expected MissingCritical, got {:?}", other),
    }
    assert_eq!(prompter.questions.len(), 1);
    assert!(prompter.questions[0].contains("retry"));
    // Nothing was staged
    assert!(!config.staging_dir().exists());
}

#[test]
fn test_zero_pool_modules_needs_override() {
    let env = TestEnv::new();
    create_mock_host(&env.host_root);
    create_module_tree(&env.host_root, false);

    let err = assemble(&env, &[]).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BuildError>(),
        Some(BuildError::NoPoolModules { .. })
    ));

    let assembly = assemble(&env, &[("RAMROOT_ALLOW_MISSING_POOL_MODULES", "1")]).unwrap();
    assert!(assembly.modules.pool_modules.is_empty());
    assert_eq!(assembly.modules.driver_modules, 1);
}

#[test]
fn test_pool_modules_harvested() {
    let env = TestEnv::new();
    create_mock_host(&env.host_root);

    let assembly = assemble(&env, &[]).unwrap();
    assert_eq!(assembly.modules.pool_modules, ["spl", "zfs"]);
    let modules = assembly
        .tree
        .root()
        .join("lib/modules")
        .join(helpers::RELEASE);
    assert_file_exists(&modules.join("updates/dkms/zfs.ko"));
    assert_file_exists(&modules.join("kernel/drivers/nvme/host/nvme.ko"));
}

#[test]
fn test_packaged_image_reads_back() {
    let env = TestEnv::new();
    create_mock_host(&env.host_root);
    let config = env.config(&[]);

    let assembly = assemble(&env, &[]).unwrap();
    let packaged = image::package(&assembly.tree, &config.image_path()).unwrap();
    assert!(packaged.compressed_bytes > 0);

    let entries = read_image(&packaged.path).unwrap();
    assert!(entries.iter().any(|e| e.name == "init" && e.is_file()));
    assert!(entries.iter().any(|e| e.name == "dev/console"));
    let kexec = find_file(&entries, &["usr/sbin"], "kexec").unwrap();
    assert_eq!(kexec.data, b"#!/bin/sh\necho mock\n");

    // Same tree packages to the same bytes
    let again = env.output_dir.join("again.cpio.gz");
    image::package(&assembly.tree, &again).unwrap();
    assert_eq!(
        fs::read(&packaged.path).unwrap(),
        fs::read(Path::new(&again)).unwrap()
    );
}

#[test]
fn test_build_stops_on_failed_preflight() {
    // Empty host root: no critical tools, no pool modules
    let env = TestEnv::new();
    let config = env.config(&[]);
    let mut prompter = ScriptedPrompter::new(Vec::<String>::new());

    let err = cmd_build(&config, &mut prompter).unwrap_err();
    assert!(err.to_string().contains("Preflight failed"));
    assert!(prompter.questions.is_empty());
    assert!(!config.staging_dir().exists());
    assert!(!config.image_path().exists());
}
