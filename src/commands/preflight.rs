//! Preflight command - runs preflight checks.

use anyhow::Result;
use std::path::Path;

use crate::config::BuildConfig;
use crate::image::{read_image, unpacked_size};
use crate::preflight;
use crate::preflight::environment::image_memory_mib;

/// Execute the preflight command.
///
/// `launch_scratch` switches to the target-host checks.
pub fn cmd_preflight(config: &BuildConfig, strict: bool, launch_scratch: Option<&Path>) -> Result<()> {
    if let Some(scratch) = launch_scratch {
        let kexec = crate::process::which("kexec");
        let image = config.image_path();
        let min_memory_mib = match config.min_memory_mib {
            Some(mib) => Some(mib),
            None if image.is_file() => Some(image_memory_mib(unpacked_size(&read_image(&image)?))),
            None => None,
        };
        let report = preflight::run_launch_preflight(
            Path::new("/"),
            scratch,
            min_memory_mib,
            kexec.as_deref(),
        );
        report.print();
        if strict && !report.all_passed() {
            anyhow::bail!("Launch preflight failed: {} check(s) failed", report.fail_count());
        }
        return Ok(());
    }

    if strict {
        preflight::run_preflight_or_fail(config)?;
    } else {
        let report = preflight::run_preflight(config);
        report.print();
        if !report.all_passed() {
            println!("Some checks failed. Use --strict to fail the build.");
        }
    }
    Ok(())
}
