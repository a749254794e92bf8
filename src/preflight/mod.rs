//! Preflight checks.
//!
//! `ramroot preflight` checks the build host; `ramroot launch` runs the launch
//! host checks before touching anything. Failures are hard stops, warnings
//! are reported and the operation continues.

pub mod environment;
mod host_tools;
pub mod types;

use std::path::Path;

use anyhow::{bail, Result};

use crate::config::BuildConfig;

pub use types::{CheckResult, CheckStatus, PreflightReport};

/// Run all build host checks.
pub fn run_preflight(config: &BuildConfig) -> PreflightReport {
    let mut checks = Vec::new();

    println!("Running preflight checks...\n");

    println!("Checking host tools...");
    checks.extend(host_tools::check_host_tools());

    println!("Checking harvest sources...");
    checks.extend(host_tools::check_harvest_sources(config));

    println!("Checking build environment...");
    checks.push(environment::check_scratch(&config.output_dir));

    println!();

    PreflightReport {
        title: "Preflight Check Results",
        checks,
    }
}

/// Run preflight and bail if any checks fail.
pub fn run_preflight_or_fail(config: &BuildConfig) -> Result<()> {
    let report = run_preflight(config);
    report.print();

    if !report.all_passed() {
        bail!(
            "Preflight failed: {} check(s) failed. Fix the issues above before building.",
            report.fail_count()
        );
    }

    println!("All preflight checks passed!\n");
    Ok(())
}

/// Launch host checks, with kernel state read below `host_root`.
pub fn run_launch_preflight(
    host_root: &Path,
    scratch: &Path,
    min_memory_mib: Option<u64>,
    kexec: Option<&Path>,
) -> PreflightReport {
    PreflightReport {
        title: "Launch Preflight",
        checks: environment::check_launch_environment(
            host_root,
            scratch,
            min_memory_mib,
            kexec,
        ),
    }
}
