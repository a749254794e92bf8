//! Kernel module harvesting.
//!
//! Copies the storage-pool module family (found by name anywhere in the
//! release's module tree) and the block/network driver subtrees, stores
//! every module uncompressed, and rebuilds the dependency index with
//! `depmod -b` against the scratch tree.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::tree::TreeBuilder;
use crate::config::host_path;
use crate::error::BuildError;
use crate::process::Cmd;

/// Storage pool module family.
pub const POOL_MODULES: &[&str] = &[
    "zfs", "spl", "znvpair", "zcommon", "zunicode", "zavl", "icp", "zlua", "zzstd",
];

/// Driver subtrees copied whole, relative to the release directory.
pub const DRIVER_SUBTREES: &[&str] = &[
    "kernel/drivers/ata",
    "kernel/drivers/scsi",
    "kernel/drivers/nvme",
    "kernel/drivers/block",
    "kernel/drivers/md",
    "kernel/drivers/virtio",
    "kernel/drivers/net/ethernet",
    "kernel/drivers/net/phy",
    "kernel/drivers/usb/storage",
];

/// Metadata copied verbatim; depmod regenerates the rest.
const MODULE_METADATA_FILES: &[&str] = &["modules.order", "modules.builtin", "modules.builtin.modinfo"];

/// Module roots tried on the host, merged-/usr layout last.
const MODULE_ROOTS: &[&str] = &["/lib/modules", "/usr/lib/modules"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Xz,
    Zstd,
    Gzip,
}

impl Compression {
    fn decompressor(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Xz => Some("xz"),
            Compression::Zstd => Some("zstd"),
            Compression::Gzip => Some("gzip"),
        }
    }
}

/// Split a module file name into its stem and compression.
///
/// `zfs.ko.zst` -> `("zfs", Zstd)`. Non-module files return `None`.
pub fn module_stem(file_name: &str) -> Option<(&str, Compression)> {
    let (base, compression) = if let Some(b) = file_name.strip_suffix(".xz") {
        (b, Compression::Xz)
    } else if let Some(b) = file_name.strip_suffix(".zst") {
        (b, Compression::Zstd)
    } else if let Some(b) = file_name.strip_suffix(".gz") {
        (b, Compression::Gzip)
    } else {
        (file_name, Compression::None)
    };
    base.strip_suffix(".ko").map(|stem| (stem, compression))
}

/// What the harvest installed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleHarvest {
    pub kernel_release: String,
    /// Pool modules found, by stem, sorted.
    pub pool_modules: Vec<String>,
    pub driver_modules: usize,
}

/// Host directory holding the modules of `release`.
pub fn find_module_dir(host_root: &Path, release: &str) -> Option<PathBuf> {
    MODULE_ROOTS
        .iter()
        .map(|root| Path::new(root).join(release))
        .find(|dir| host_path(host_root, dir).is_dir())
}

/// Stems of the pool modules available for `release`, sorted.
pub fn scan_pool_modules(host_root: &Path, release: &str) -> Vec<String> {
    let Some(module_dir) = find_module_dir(host_root, release) else {
        return Vec::new();
    };
    let mut found: Vec<String> = WalkDir::new(host_path(host_root, &module_dir))
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            module_stem(&name)
                .map(|(stem, _)| stem.to_string())
                .filter(|stem| POOL_MODULES.contains(&stem.as_str()))
        })
        .collect();
    found.sort();
    found.dedup();
    found
}

pub fn harvest_modules(
    tree: &mut TreeBuilder,
    host_root: &Path,
    release: &str,
    allow_missing_pool: bool,
) -> Result<ModuleHarvest> {
    let mut harvest = ModuleHarvest {
        kernel_release: release.to_string(),
        ..ModuleHarvest::default()
    };

    let Some(module_dir) = find_module_dir(host_root, release) else {
        let expected = host_path(host_root, &Path::new("/lib/modules").join(release));
        if allow_missing_pool {
            tracing::warn!(path = %expected.display(), "no module tree for this kernel, image carries no modules");
            return Ok(harvest);
        }
        return Err(BuildError::NoPoolModules { path: expected }.into());
    };
    let source = host_path(host_root, &module_dir);
    let dest_root = Path::new("/lib/modules").join(release);

    for entry in WalkDir::new(&source).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        let Some((stem, compression)) = module_stem(&name) else {
            continue;
        };
        let relative = entry.path().strip_prefix(&source)?;

        let is_pool = POOL_MODULES.contains(&stem);
        let is_driver = DRIVER_SUBTREES.iter().any(|sub| relative.starts_with(sub));
        if !is_pool && !is_driver {
            continue;
        }

        let dest = dest_root
            .join(relative.parent().unwrap_or(Path::new("")))
            .join(format!("{}.ko", stem));
        install_module(tree, entry.path(), &dest, compression)?;

        if is_pool {
            harvest.pool_modules.push(stem.to_string());
        } else {
            harvest.driver_modules += 1;
        }
    }
    harvest.pool_modules.sort();
    harvest.pool_modules.dedup();

    if harvest.pool_modules.is_empty() {
        if !allow_missing_pool {
            return Err(BuildError::NoPoolModules { path: source }.into());
        }
        tracing::warn!("no storage pool modules found; continuing without pool support as requested");
    }

    for file in MODULE_METADATA_FILES {
        tree.copy_from_host(host_root, &module_dir.join(file))?;
    }

    run_depmod(tree.root(), release);
    Ok(harvest)
}

fn install_module(
    tree: &mut TreeBuilder,
    source: &Path,
    dest: &Path,
    compression: Compression,
) -> Result<()> {
    if tree.contains(dest) {
        return Ok(());
    }
    match compression.decompressor() {
        None => tree.install_file(source, dest, 0o644),
        Some(tool) => {
            let staged = tree.dest(dest);
            if let Some(parent) = staged.parent() {
                fs::create_dir_all(parent)?;
            }
            Cmd::new(tool)
                .args(["-d", "-c"])
                .arg_path(source)
                .error_msg(format!("Failed to decompress {}", source.display()))
                .run_into(&staged)?;
            tree.adopt_file(dest, 0o644)
        }
    }
}

fn run_depmod(root: &Path, release: &str) {
    println!("  Running depmod...");
    let result = Cmd::new("depmod")
        .arg("-b")
        .arg_path(root)
        .arg(release)
        .allow_fail()
        .run();

    match result {
        Ok(r) if r.success() => println!("  depmod completed"),
        Ok(r) => tracing::warn!(code = r.code(), stderr = %r.stderr_trimmed(), "depmod failed; modprobe will not resolve dependencies"),
        Err(e) => tracing::warn!("could not run depmod: {:#}", e),
    }
}
