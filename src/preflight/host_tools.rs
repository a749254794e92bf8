//! Build host checks: tools the assembler drives and the binaries it harvests.

use std::path::Path;

use crate::build::manifest::{self, Class, MANIFEST};
use crate::build::modules::scan_pool_modules;
use crate::config::BuildConfig;
use crate::process;

use super::types::CheckResult;

/// Check host tools are installed.
pub fn check_host_tools() -> Vec<CheckResult> {
    let mut results = Vec::new();

    let required_tools = [
        ("ldd", "libc-bin", "Required to resolve shared library closures"),
        ("gzip", "gzip", "Required to compress the image"),
    ];
    for (tool, package, purpose) in required_tools {
        results.push(check_tool_exists(tool, package, purpose, true));
    }

    let optional_tools = [
        ("depmod", "kmod", "Without it modprobe cannot resolve module dependencies"),
        ("xz", "xz-utils", "Required for .ko.xz modules"),
        ("zstd", "zstd", "Required for .ko.zst modules"),
    ];
    for (tool, package, purpose) in optional_tools {
        results.push(check_tool_exists(tool, package, purpose, false));
    }

    results
}

/// Check the binaries the image is assembled from.
pub fn check_harvest_sources(config: &BuildConfig) -> Vec<CheckResult> {
    let mut results = Vec::new();

    for entry in MANIFEST {
        let name = format!("host binary {}", entry.name);
        let explicit = (entry.name == "busybox")
            .then(|| config.busybox.clone())
            .flatten()
            .filter(|p| p.is_file());
        let found = explicit.or_else(|| {
            entry
                .candidates()
                .into_iter()
                .find_map(|candidate| manifest::find_binary(&config.host_root, candidate))
        });
        results.push(match (found, entry.class) {
            (Some(path), _) => CheckResult::pass_with(&name, &path.display().to_string()),
            (None, Class::Critical) => {
                CheckResult::fail(&name, "Not found - install it before building")
            }
            (None, Class::Optional) => {
                CheckResult::warn(&name, "Not found - the environment will lack it")
            }
        });
    }

    let pool = scan_pool_modules(&config.host_root, &config.kernel_release);
    let name = format!("pool modules ({})", config.kernel_release);
    results.push(if !pool.is_empty() {
        CheckResult::pass_with(&name, &pool.join(" "))
    } else if config.allow_missing_pool_modules {
        CheckResult::warn(&name, "None found - building without pool support (override set)")
    } else {
        CheckResult::fail(
            &name,
            "None found - install the pool module package or set RAMROOT_ALLOW_MISSING_POOL_MODULES",
        )
    });

    results.push(check_file(
        "kernel image",
        &config.kernel_image,
        "Not found - set RAMROOT_KERNEL_IMAGE (needed by `ramroot bundle`)",
        false,
    ));
    results.push(check_file(
        "init binary",
        &config.init_binary,
        "Not found - build ramroot-init or set RAMROOT_INIT_BINARY",
        true,
    ));

    results
}

fn check_file(name: &str, path: &Path, missing: &str, required: bool) -> CheckResult {
    if path.is_file() {
        CheckResult::pass_with(name, &path.display().to_string())
    } else if required {
        CheckResult::fail(name, &format!("{}: {}", path.display(), missing))
    } else {
        CheckResult::warn(name, &format!("{}: {}", path.display(), missing))
    }
}

/// Check if a tool exists in PATH.
fn check_tool_exists(tool: &str, package: &str, purpose: &str, required: bool) -> CheckResult {
    match process::which(tool) {
        Some(path) => CheckResult::pass_with(tool, &path.display().to_string()),
        None => {
            let msg = format!("Not found. Install '{}' package. {}", package, purpose);
            if required {
                CheckResult::fail(tool, &msg)
            } else {
                CheckResult::warn(tool, &msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preflight::types::CheckStatus;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn config(host: &Path, allow: bool) -> BuildConfig {
        let mut vars = HashMap::new();
        vars.insert("RAMROOT_HOST_ROOT".to_string(), host.display().to_string());
        vars.insert("RAMROOT_KERNEL_RELEASE".to_string(), "6.1.0-test".to_string());
        if allow {
            vars.insert("RAMROOT_ALLOW_MISSING_POOL_MODULES".to_string(), "1".to_string());
        }
        BuildConfig::from_vars(&vars, host, "6.1.0-test", PathBuf::from("/nonexistent/init"))
            .unwrap()
    }

    #[test]
    fn test_empty_host_fails_critical_only() {
        let host = TempDir::new().unwrap();
        let results = check_harvest_sources(&config(host.path(), false));

        let status = |name: &str| results.iter().find(|r| r.name == name).unwrap().status;
        assert_eq!(status("host binary zpool"), CheckStatus::Fail);
        assert_eq!(status("host binary rsync"), CheckStatus::Warn);
        assert_eq!(status("pool modules (6.1.0-test)"), CheckStatus::Fail);
        assert_eq!(status("init binary"), CheckStatus::Fail);
    }

    #[test]
    fn test_pool_override_downgrades_to_warning() {
        let host = TempDir::new().unwrap();
        let results = check_harvest_sources(&config(host.path(), true));
        let pool = results
            .iter()
            .find(|r| r.name.starts_with("pool modules"))
            .unwrap();
        assert_eq!(pool.status, CheckStatus::Warn);
    }
}
