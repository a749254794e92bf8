//! Image packaging: finished tree to gzip-compressed `newc` cpio.
//!
//! Entries are written in sorted path order with fixed metadata and gzip
//! runs with `-n`, so an unchanged tree packages to identical bytes.
//! Identity overlays are separate gzip members appended to the image; the
//! kernel unpacks chained members in order, later files replacing earlier.

pub mod cpio;

use anyhow::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::build::tree::{DeviceKind, EntryKind, FsTree};
use crate::process::Cmd;
use cpio::{ArchiveWriter, CpioEntry};

/// Summary of a packaged image.
#[derive(Debug, Clone)]
pub struct PackagedImage {
    pub path: PathBuf,
    pub entries: usize,
    pub uncompressed_bytes: u64,
    pub compressed_bytes: u64,
}

/// Serialize `tree` into an uncompressed cpio stream.
pub fn write_archive<W: Write>(tree: &FsTree, writer: W) -> Result<(W, usize)> {
    let mut archive = ArchiveWriter::new(writer);
    let entries = tree.entries()?;

    for entry in &entries {
        let name = entry.path.to_string_lossy();
        match &entry.kind {
            EntryKind::Directory => archive.add_dir(&name, entry.mode)?,
            EntryKind::File { size } => {
                let source = tree.root().join(&entry.path);
                let mut file = File::open(&source)
                    .with_context(|| format!("Failed to open {}", source.display()))?;
                archive
                    .add_file_from(&name, entry.mode, *size, &mut file)
                    .with_context(|| format!("Failed to archive {}", name))?;
            }
            EntryKind::Symlink { target } => {
                archive.add_symlink(&name, &target.to_string_lossy())?
            }
            EntryKind::Device { kind, major, minor } => archive.add_device(
                &name,
                *kind == DeviceKind::Block,
                *major,
                *minor,
                entry.mode,
            )?,
        }
    }

    let writer = archive.finish().context("Failed to finish archive")?;
    Ok((writer, entries.len()))
}

/// Package `tree` as a gzip-compressed cpio at `dest`.
pub fn package(tree: &FsTree, dest: &Path) -> Result<PackagedImage> {
    println!("=== Packaging image ===");
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let raw = sibling(dest, "cpio");
    let file = File::create(&raw).with_context(|| format!("Failed to create {}", raw.display()))?;
    let (writer, entries) = write_archive(tree, BufWriter::new(file))?;
    writer
        .into_inner()
        .map_err(|e| e.into_error())
        .context("Failed to flush archive")?;

    let uncompressed_bytes = fs::metadata(&raw)?.len();
    compress(&raw, dest)?;
    fs::remove_file(&raw)?;

    let image = PackagedImage {
        path: dest.to_path_buf(),
        entries,
        uncompressed_bytes,
        compressed_bytes: fs::metadata(dest)?.len(),
    };
    println!(
        "  {} entries, {} KiB -> {} KiB",
        image.entries,
        image.uncompressed_bytes / 1024,
        image.compressed_bytes / 1024
    );
    println!("  Image: {}", image.path.display());
    Ok(image)
}

/// A file carried by an overlay, path relative to the image root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayFile {
    pub path: String,
    pub mode: u32,
    pub contents: Vec<u8>,
}

impl OverlayFile {
    pub fn new(path: &str, mode: u32, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.trim_start_matches('/').to_string(),
            mode,
            contents: contents.into(),
        }
    }
}

/// Uncompressed cpio for an overlay, parent directories included.
pub fn overlay_archive(files: &[OverlayFile]) -> io::Result<Vec<u8>> {
    let mut dirs: Vec<(String, u32)> = Vec::new();
    for file in files {
        let mut parent = Path::new(&file.path).parent();
        while let Some(dir) = parent.filter(|d| !d.as_os_str().is_empty()) {
            let name = dir.to_string_lossy().into_owned();
            if !dirs.iter().any(|(d, _)| *d == name) {
                dirs.push((name, private_dir_mode(dir)));
            }
            parent = dir.parent();
        }
    }
    dirs.sort();

    let mut archive = ArchiveWriter::new(Vec::new());
    for (dir, mode) in &dirs {
        archive.add_dir(dir, *mode)?;
    }
    for file in files {
        archive.add_file(&file.path, file.mode, &file.contents)?;
    }
    archive.finish()
}

fn private_dir_mode(dir: &Path) -> u32 {
    if dir == Path::new("root") || dir.ends_with(".ssh") || dir.ends_with("dropbear") {
        0o700
    } else {
        0o755
    }
}

/// Append `files` to `image` as one more gzip member.
pub fn append_overlay(image: &Path, files: &[OverlayFile]) -> Result<()> {
    let raw = sibling(image, "overlay.cpio");
    let packed = sibling(image, "overlay.cpio.gz");
    fs::write(&raw, overlay_archive(files)?)
        .with_context(|| format!("Failed to write {}", raw.display()))?;
    compress(&raw, &packed)?;

    let mut out = OpenOptions::new()
        .append(true)
        .open(image)
        .with_context(|| format!("Failed to open {} for append", image.display()))?;
    let mut member = File::open(&packed)?;
    io::copy(&mut member, &mut out).context("Failed to append overlay")?;
    out.sync_all()?;

    fs::remove_file(&raw)?;
    fs::remove_file(&packed)?;
    Ok(())
}

/// Read every entry of a compressed image, overlays applied.
pub fn read_image(image: &Path) -> Result<Vec<CpioEntry>> {
    let raw = sibling(image, "read.cpio");
    Cmd::new("gzip")
        .args(["-d", "-c"])
        .arg_path(image)
        .error_msg(format!("Failed to decompress {}", image.display()))
        .run_into(&raw)?;
    let bytes = fs::read(&raw)?;
    fs::remove_file(&raw)?;
    cpio::read_entries(&bytes)
}

/// Bytes the image occupies once unpacked into RAM.
pub fn unpacked_size(entries: &[CpioEntry]) -> u64 {
    entries.iter().map(|e| e.data.len() as u64).sum()
}

/// Find a regular file named `file_name` in one of `dirs` of the image.
pub fn find_file(entries: &[CpioEntry], dirs: &[&str], file_name: &str) -> Option<CpioEntry> {
    dirs.iter().find_map(|dir| {
        let name = format!("{}/{}", dir.trim_matches('/'), file_name);
        entries
            .iter()
            .find(|e| e.name == name && e.is_file())
            .cloned()
    })
}

fn compress(source: &Path, dest: &Path) -> Result<()> {
    if !source.is_file() {
        bail!("Nothing to compress at {}", source.display());
    }
    Cmd::new("gzip")
        .args(["-9", "-n", "-c"])
        .arg_path(source)
        .error_msg(format!("Failed to compress {}", source.display()))
        .run_into(dest)?;
    Ok(())
}

/// `dir/.name.suffix` next to `path`, for intermediate files.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    path.with_file_name(format!(".{}.{}", name, suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_includes_parents_once() {
        let files = vec![
            OverlayFile::new("/root/.ssh/authorized_keys", 0o600, "ssh-ed25519 AAAA\n"),
            OverlayFile::new("etc/dropbear/dropbear_ed25519_host_key", 0o600, vec![1, 2]),
            OverlayFile::new("etc/resolv.conf", 0o644, "nameserver 10.0.0.1\n"),
        ];
        let entries = cpio::read_entries(&overlay_archive(&files).unwrap()).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "etc",
                "etc/dropbear",
                "root",
                "root/.ssh",
                "root/.ssh/authorized_keys",
                "etc/dropbear/dropbear_ed25519_host_key",
                "etc/resolv.conf",
            ]
        );
        let ssh = entries.iter().find(|e| e.name == "root/.ssh").unwrap();
        assert_eq!(ssh.mode & 0o7777, 0o700);
    }

    #[test]
    fn test_find_file() {
        let files = vec![OverlayFile::new("usr/sbin/kexec", 0o755, "ELF")];
        let entries = cpio::read_entries(&overlay_archive(&files).unwrap()).unwrap();
        assert!(find_file(&entries, &["/sbin", "/usr/sbin"], "kexec").is_some());
        assert!(find_file(&entries, &["/sbin"], "kexec").is_none());
    }

    #[test]
    fn test_sibling() {
        assert_eq!(
            sibling(Path::new("/out/initramfs-6.1.cpio.gz"), "cpio"),
            PathBuf::from("/out/.initramfs-6.1.cpio.gz.cpio")
        );
    }
}
