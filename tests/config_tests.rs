//! Configuration loading from `.env` and the process environment.
//!
//! These tests mutate process environment variables and run serially.

mod helpers;

use helpers::TestEnv;
use ramroot::config::BuildConfig;
use serial_test::serial;
use std::fs;

const KEYS: &[&str] = &[
    "RAMROOT_HOSTNAME",
    "RAMROOT_TMP_SIZE",
    "RAMROOT_MIN_MEMORY_MIB",
    "RAMROOT_OUTPUT",
];

fn clear_env() {
    for key in KEYS {
        std::env::remove_var(key);
    }
}

#[test]
#[serial]
fn test_env_file_is_read() {
    clear_env();
    let env = TestEnv::new();
    fs::write(
        env.base_dir.join(".env"),
        "RAMROOT_HOSTNAME=rescue-7\nRAMROOT_MIN_MEMORY_MIB=1024\n",
    )
    .unwrap();

    let config = BuildConfig::load(&env.base_dir).unwrap();
    assert_eq!(config.boot.hostname, "rescue-7");
    assert_eq!(config.min_memory_mib, Some(1024));
    assert_eq!(config.output_dir, env.base_dir.join("output"));
}

#[test]
#[serial]
fn test_environment_overrides_env_file() {
    clear_env();
    let env = TestEnv::new();
    fs::write(
        env.base_dir.join(".env"),
        "RAMROOT_TMP_SIZE=1g\nRAMROOT_OUTPUT=from-file\n",
    )
    .unwrap();
    std::env::set_var("RAMROOT_TMP_SIZE", "50%");

    let config = BuildConfig::load(&env.base_dir).unwrap();
    clear_env();

    assert_eq!(config.boot.tmp_size.as_deref(), Some("50%"));
    assert_eq!(config.output_dir, env.base_dir.join("from-file"));
}

#[test]
#[serial]
fn test_missing_env_file_uses_defaults() {
    clear_env();
    let env = TestEnv::new();
    let config = BuildConfig::load(&env.base_dir).unwrap();
    assert_eq!(config.boot.hostname, "ramroot");
    assert_eq!(config.boot.tmp_size, None);
}
