//! Build command - assembles the tree and packages the image.

use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Instant;

use crate::build;
use crate::config::BuildConfig;
use crate::image::{self, PackagedImage};
use crate::preflight;
use crate::prompt::Prompter;
use crate::resolve::LddResolver;
use crate::timing::format_duration;

/// Execute the build command.
pub fn cmd_build(config: &BuildConfig, prompter: &mut dyn Prompter) -> Result<PackagedImage> {
    println!("=== ramroot build ({}) ===\n", config.kernel_release);
    let build_start = Instant::now();

    let report = preflight::run_preflight(config);
    if !report.all_passed() {
        report.print();
        bail!(
            "Preflight failed: {} check(s) failed. Nothing was built.",
            report.fail_count()
        );
    }

    let assembly = build::assemble(config, Arc::new(LddResolver::new(&config.host_root)), prompter)?;
    if !assembly.missing_optional.is_empty() {
        println!(
            "  Optional tools not included: {}",
            assembly.missing_optional.join(", ")
        );
    }
    if assembly.modules.pool_modules.is_empty() {
        println!("  WARNING: image has no pool modules; pools cannot be imported");
    }

    let image = image::package(&assembly.tree, &config.image_path())?;
    tracing::info!(digest = %assembly.tree.digest()?, "tree digest");

    println!(
        "\n=== Build complete ({}) ===",
        format_duration(build_start.elapsed())
    );
    println!("  Image: {}", image.path.display());
    println!("  Next:  ramroot bundle");
    Ok(image)
}
