//! The self-extracting artifact.
//!
//! Layout: a `/bin/sh` preamble, the marker line, then an uncompressed tar
//! holding `vmlinuz-<release>`, `initramfs-<release>.cpio.gz` and the
//! `ramroot` launcher.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::LaunchError;

pub const PAYLOAD_MARKER: &str = "__RAMROOT_PAYLOAD__";
pub const LAUNCHER_NAME: &str = "ramroot";

const PREAMBLE: &str = r#"#!/bin/sh
# ramroot self-extracting launcher
set -eu
if [ "$(id -u)" -ne 0 ]; then
    echo "ramroot: must be run as root" >&2
    exit 1
fi
scratch="${RAMROOT_SCRATCH:-$(mktemp -d /tmp/ramroot.XXXXXX)}"
mkdir -p "$scratch"
line=$(awk '$0 == "__RAMROOT_PAYLOAD__" { print NR + 1; exit }' "$0")
tail -n +"$line" "$0" | tar -x -C "$scratch"
exec "$scratch/ramroot" launch --scratch "$scratch" "$@"
"#;

/// Everything `launch` needs, located in an extracted payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadLayout {
    pub dir: PathBuf,
    pub kernel: PathBuf,
    pub image: PathBuf,
}

impl PayloadLayout {
    pub fn locate(dir: &Path) -> Result<Self> {
        let mut kernel = None;
        let mut image = None;
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("Failed to read {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        entries.sort();

        for path in entries {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !path.is_file() {
                continue;
            }
            if kernel.is_none() && name.starts_with("vmlinuz-") {
                kernel = Some(path);
            } else if image.is_none()
                && name.starts_with("initramfs-")
                && name.ends_with(".cpio.gz")
            {
                image = Some(path);
            }
        }

        let missing = |what| LaunchError::MissingPayload {
            what,
            dir: dir.to_path_buf(),
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            kernel: kernel.ok_or_else(|| missing("kernel (vmlinuz-*)"))?,
            image: image.ok_or_else(|| missing("image (initramfs-*.cpio.gz)"))?,
        })
    }
}

/// Write the artifact. The kernel is stored as `vmlinuz-<release>`.
pub fn bundle(
    dest: &Path,
    release: &str,
    kernel: &Path,
    image: &Path,
    launcher: &Path,
) -> Result<()> {
    let image_name = image
        .file_name()
        .with_context(|| format!("{} has no file name", image.display()))?;

    let mut out =
        File::create(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    out.write_all(PREAMBLE.as_bytes())?;
    writeln!(out, "{}", PAYLOAD_MARKER)?;

    let mut tar = tar::Builder::new(out);
    tar.follow_symlinks(true);
    tar.append_path_with_name(kernel, format!("vmlinuz-{}", release))
        .with_context(|| format!("Failed to add {}", kernel.display()))?;
    tar.append_path_with_name(image, image_name)
        .with_context(|| format!("Failed to add {}", image.display()))?;
    tar.append_path_with_name(launcher, LAUNCHER_NAME)
        .with_context(|| format!("Failed to add {}", launcher.display()))?;
    let out = tar.into_inner().context("Failed to finish payload")?;
    out.sync_all()?;

    fs::set_permissions(dest, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

/// The tar payload following the marker line.
pub fn split_payload(bytes: &[u8]) -> Option<&[u8]> {
    let marker = format!("\n{}\n", PAYLOAD_MARKER);
    let marker = marker.as_bytes();
    bytes
        .windows(marker.len())
        .position(|w| w == marker)
        .map(|at| &bytes[at + marker.len()..])
}

/// Extract the payload of `artifact` into `scratch`.
pub fn extract(artifact: &Path, scratch: &Path) -> Result<PayloadLayout> {
    let bytes =
        fs::read(artifact).with_context(|| format!("Failed to read {}", artifact.display()))?;
    let payload = split_payload(&bytes).ok_or_else(|| LaunchError::MarkerNotFound {
        path: artifact.to_path_buf(),
    })?;
    fs::create_dir_all(scratch)
        .with_context(|| format!("Failed to create {}", scratch.display()))?;
    tar::Archive::new(payload)
        .unpack(scratch)
        .with_context(|| format!("Failed to unpack payload into {}", scratch.display()))?;
    PayloadLayout::locate(scratch)
}
