//! Bundle command - writes the self-extracting artifact.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use crate::config::BuildConfig;
use crate::launch::artifact;

/// Execute the bundle command. Returns the artifact path.
pub fn cmd_bundle(config: &BuildConfig, output: Option<&Path>) -> Result<PathBuf> {
    let image = config.image_path();
    if !image.is_file() {
        bail!(
            "Image not found at {}. Run 'ramroot build' first.",
            image.display()
        );
    }
    if !config.kernel_image.is_file() {
        bail!(
            "Kernel not found at {} (set RAMROOT_KERNEL_IMAGE)",
            config.kernel_image.display()
        );
    }
    let launcher = std::env::current_exe().context("Cannot locate the ramroot executable")?;

    let dest = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.artifact_path());
    println!("=== Bundling {} ===", dest.display());
    println!("  Kernel:   {}", config.kernel_image.display());
    println!("  Image:    {}", image.display());
    println!("  Launcher: {}", launcher.display());

    artifact::bundle(
        &dest,
        &config.kernel_release,
        &config.kernel_image,
        &image,
        &launcher,
    )?;

    let size = std::fs::metadata(&dest)?.len();
    println!("  Artifact: {} ({} MiB)", dest.display(), size / (1024 * 1024));
    println!("\nCopy it to the target host and run it as root.");
    Ok(dest)
}
