//! The scratch filesystem tree.
//!
//! [`TreeBuilder`] owns the scratch directory while the assembler fills it.
//! Device nodes are kept in a list instead of being created with mknod, so
//! the build runs unprivileged; the packager emits them into the archive.
//! [`TreeBuilder::finish`] consumes the builder into an [`FsTree`], which
//! offers no way to modify the tree.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::config::host_path;
use crate::error::BuildError;

/// Symlink chains longer than this are treated as loops.
const MAX_LINK_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceKind {
    Char,
    Block,
}

/// A device node emitted by the packager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNode {
    /// Path relative to the tree root, e.g. `dev/console`.
    pub path: String,
    pub kind: DeviceKind,
    pub major: u32,
    pub minor: u32,
    pub mode: u32,
}

impl DeviceNode {
    pub fn char(path: &str, major: u32, minor: u32, mode: u32) -> Self {
        Self {
            path: path.to_string(),
            kind: DeviceKind::Char,
            major,
            minor,
            mode,
        }
    }
}

/// One completed assembly step and how many tree operations it performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    pub operations: usize,
}

/// Node kinds as seen by the packager and the digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File { size: u64 },
    Symlink { target: PathBuf },
    Device { kind: DeviceKind, major: u32, minor: u32 },
}

/// One node of a finished tree, in packaging order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Path relative to the tree root.
    pub path: PathBuf,
    /// Permission bits only.
    pub mode: u32,
    pub kind: EntryKind,
}

/// Mutable tree under construction.
pub struct TreeBuilder {
    root: PathBuf,
    devices: Vec<DeviceNode>,
    steps: Vec<Step>,
    operations: usize,
}

impl TreeBuilder {
    /// Start a fresh tree at `root`, wiping anything left from a previous run.
    pub fn create(root: &Path) -> Result<Self> {
        if root.exists() {
            fs::remove_dir_all(root)
                .with_context(|| format!("Failed to clear {}", root.display()))?;
        }
        fs::create_dir_all(root).map_err(|e| BuildError::ScratchUnwritable {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;

        let probe = root.join(".ramroot-write-test");
        fs::write(&probe, b"").map_err(|e| BuildError::ScratchUnwritable {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        fs::remove_file(&probe)?;

        Ok(Self {
            root: root.to_path_buf(),
            devices: Vec::new(),
            steps: Vec::new(),
            operations: 0,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scratch location of an absolute path inside the tree.
    pub fn dest(&self, path: &Path) -> PathBuf {
        host_path(&self.root, path)
    }

    /// Whether anything (including a dangling symlink) exists at `path`.
    pub fn contains(&self, path: &Path) -> bool {
        self.dest(path).symlink_metadata().is_ok()
    }

    /// Run `f` as a named step and record how much it did.
    pub fn step<F>(&mut self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let before = self.operations;
        f(self).with_context(|| format!("Assembly step '{}' failed", name))?;
        self.steps.push(Step {
            name: name.to_string(),
            operations: self.operations - before,
        });
        Ok(())
    }

    pub fn mkdir(&mut self, path: &Path, mode: u32) -> Result<()> {
        let dest = self.dest(path);
        if !dest.is_dir() {
            fs::create_dir_all(&dest)
                .with_context(|| format!("Failed to create {}", dest.display()))?;
            self.operations += 1;
        }
        fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    /// Write a generated file, replacing any previous content.
    pub fn write_file(&mut self, path: &Path, contents: &[u8], mode: u32) -> Result<()> {
        let dest = self.dest(path);
        ensure_parent(&dest)?;
        if dest.is_symlink() {
            fs::remove_file(&dest)?;
        }
        fs::write(&dest, contents)
            .with_context(|| format!("Failed to write {}", dest.display()))?;
        fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
        self.operations += 1;
        Ok(())
    }

    /// Copy a file from outside the host root (e.g. the init binary) to `path`.
    pub fn install_file(&mut self, source: &Path, path: &Path, mode: u32) -> Result<()> {
        let dest = self.dest(path);
        ensure_parent(&dest)?;
        if dest.symlink_metadata().is_ok() {
            fs::remove_file(&dest)?;
        }
        fs::copy(source, &dest).with_context(|| {
            format!("Failed to copy {} to {}", source.display(), dest.display())
        })?;
        fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
        self.operations += 1;
        Ok(())
    }

    /// Take ownership of a file written into the scratch tree by an external tool.
    pub fn adopt_file(&mut self, path: &Path, mode: u32) -> Result<()> {
        let dest = self.dest(path);
        fs::set_permissions(&dest, fs::Permissions::from_mode(mode))
            .with_context(|| format!("Failed to adopt {}", dest.display()))?;
        self.operations += 1;
        Ok(())
    }

    /// Create a symlink unless something already exists at `path`.
    pub fn symlink(&mut self, path: &Path, target: &Path) -> Result<bool> {
        let dest = self.dest(path);
        if dest.symlink_metadata().is_ok() {
            return Ok(false);
        }
        ensure_parent(&dest)?;
        symlink(target, &dest)
            .with_context(|| format!("Failed to link {} -> {}", dest.display(), target.display()))?;
        self.operations += 1;
        Ok(true)
    }

    /// Create a symlink, replacing whatever is at `path`.
    pub fn replace_symlink(&mut self, path: &Path, target: &Path) -> Result<()> {
        let dest = self.dest(path);
        match dest.symlink_metadata() {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&dest)?,
            Ok(_) => fs::remove_file(&dest)?,
            Err(_) => ensure_parent(&dest)?,
        }
        symlink(target, &dest)
            .with_context(|| format!("Failed to link {} -> {}", dest.display(), target.display()))?;
        self.operations += 1;
        Ok(())
    }

    pub fn add_device(&mut self, node: DeviceNode) {
        if !self.devices.iter().any(|d| d.path == node.path) {
            self.devices.push(node);
            self.operations += 1;
        }
    }

    /// Copy `path` from the host root to the same path in the tree.
    ///
    /// Copy-if-absent: an existing destination is left untouched. Symlinks
    /// are recreated and their targets copied too. Returns `Ok(false)` if
    /// the host has nothing at `path`.
    pub fn copy_from_host(&mut self, host_root: &Path, path: &Path) -> Result<bool> {
        self.copy_host_path(host_root, path, 0)
    }

    fn copy_host_path(&mut self, host_root: &Path, path: &Path, depth: usize) -> Result<bool> {
        if depth > MAX_LINK_DEPTH {
            bail!("Symlink chain too deep at {}", path.display());
        }

        let source = host_path(host_root, path);
        let meta = match fs::symlink_metadata(&source) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to stat {}", source.display()))
            }
        };

        let dest = self.dest(path);
        if dest.symlink_metadata().is_ok() {
            return Ok(true);
        }
        ensure_parent(&dest)?;

        if meta.file_type().is_symlink() {
            let target = fs::read_link(&source)?;
            symlink(&target, &dest)?;
            self.operations += 1;

            let parent = path.parent().unwrap_or(Path::new("/"));
            let resolved = normalize(&parent.join(&target));
            if !self.copy_host_path(host_root, &resolved, depth + 1)? {
                tracing::warn!(
                    link = %path.display(),
                    target = %resolved.display(),
                    "symlink target missing on host"
                );
            }
        } else if meta.is_dir() {
            fs::create_dir_all(&dest)?;
            fs::set_permissions(&dest, fs::Permissions::from_mode(meta.permissions().mode()))?;
            self.operations += 1;
        } else {
            fs::copy(&source, &dest).with_context(|| {
                format!("Failed to copy {} to {}", source.display(), dest.display())
            })?;
            self.operations += 1;
        }
        Ok(true)
    }

    /// Copy a whole host directory tree, entry by entry, copy-if-absent.
    pub fn copy_tree_from_host(&mut self, host_root: &Path, dir: &Path) -> Result<usize> {
        let source = host_path(host_root, dir);
        if !source.is_dir() {
            return Ok(0);
        }

        let mut copied = 0;
        for entry in WalkDir::new(&source).sort_by_file_name() {
            let entry = entry?;
            let relative = entry.path().strip_prefix(&source)?;
            let path = dir.join(relative);
            let dest = self.dest(&path);
            if dest.symlink_metadata().is_ok() {
                continue;
            }
            if entry.file_type().is_symlink() {
                ensure_parent(&dest)?;
                symlink(fs::read_link(entry.path())?, &dest)?;
            } else if entry.file_type().is_dir() {
                fs::create_dir_all(&dest)?;
            } else {
                ensure_parent(&dest)?;
                fs::copy(entry.path(), &dest)?;
            }
            self.operations += 1;
            copied += 1;
        }
        Ok(copied)
    }

    /// Freeze the tree.
    pub fn finish(self) -> FsTree {
        FsTree {
            root: self.root,
            devices: self.devices,
            steps: self.steps,
        }
    }
}

/// Finished, read-only tree.
#[derive(Debug)]
pub struct FsTree {
    root: PathBuf,
    devices: Vec<DeviceNode>,
    steps: Vec<Step>,
}

impl FsTree {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn devices(&self) -> &[DeviceNode] {
        &self.devices
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn contains(&self, path: &Path) -> bool {
        host_path(&self.root, path).symlink_metadata().is_ok()
    }

    /// Every node sorted by path, parents before children.
    pub fn entries(&self) -> Result<Vec<TreeEntry>> {
        let mut entries = Vec::new();

        for entry in WalkDir::new(&self.root).min_depth(1).sort_by_file_name() {
            let entry = entry?;
            let path = entry.path().strip_prefix(&self.root)?.to_path_buf();
            let meta = entry.path().symlink_metadata()?;
            let mode = meta.permissions().mode() & 0o7777;
            let file_type = meta.file_type();

            let kind = if file_type.is_symlink() {
                EntryKind::Symlink {
                    target: fs::read_link(entry.path())?,
                }
            } else if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_file() {
                EntryKind::File { size: meta.len() }
            } else {
                tracing::warn!(path = %path.display(), "skipping special file in scratch tree");
                continue;
            };
            entries.push(TreeEntry { path, mode, kind });
        }

        for device in &self.devices {
            let path = PathBuf::from(&device.path);
            entries.retain(|e| e.path != path);
            entries.push(TreeEntry {
                path,
                mode: device.mode,
                kind: EntryKind::Device {
                    kind: device.kind,
                    major: device.major,
                    minor: device.minor,
                },
            });
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// SHA-256 over paths, kinds, modes, contents and link targets.
    pub fn digest(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        for entry in self.entries()? {
            hasher.update(entry.path.to_string_lossy().as_bytes());
            hasher.update([0]);
            hasher.update(entry.mode.to_le_bytes());
            match &entry.kind {
                EntryKind::Directory => hasher.update(b"d"),
                EntryKind::File { .. } => {
                    hasher.update(b"f");
                    let contents = fs::read(self.root.join(&entry.path))?;
                    hasher.update(Sha256::digest(&contents));
                }
                EntryKind::Symlink { target } => {
                    hasher.update(b"l");
                    hasher.update(target.to_string_lossy().as_bytes());
                }
                EntryKind::Device { kind, major, minor } => {
                    hasher.update(match kind {
                        DeviceKind::Char => b"c",
                        DeviceKind::Block => b"b",
                    });
                    hasher.update(major.to_le_bytes());
                    hasher.update(minor.to_le_bytes());
                }
            }
            hasher.update([0]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

fn ensure_parent(dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// Resolve `.` and `..` lexically.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn host_with_links() -> TempDir {
        let host = TempDir::new().unwrap();
        let lib = host.path().join("lib/x86_64-linux-gnu");
        fs::create_dir_all(&lib).unwrap();
        fs::write(lib.join("libc.so.6"), b"libc").unwrap();
        fs::create_dir_all(host.path().join("lib64")).unwrap();
        symlink(
            "../lib/x86_64-linux-gnu/libc.so.6",
            host.path().join("lib64/libc-link.so"),
        )
        .unwrap();
        host
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize(Path::new("/lib64/../lib/./x/libc.so")),
            PathBuf::from("/lib/x/libc.so")
        );
        assert_eq!(normalize(Path::new("/../..")), PathBuf::from("/"));
    }

    #[test]
    fn test_copy_follows_symlink_targets() {
        let host = host_with_links();
        let scratch = TempDir::new().unwrap();
        let mut tree = TreeBuilder::create(&scratch.path().join("root")).unwrap();

        assert!(tree
            .copy_from_host(host.path(), Path::new("/lib64/libc-link.so"))
            .unwrap());
        assert!(tree.dest(Path::new("/lib64/libc-link.so")).is_symlink());
        assert_eq!(
            fs::read(tree.dest(Path::new("/lib/x86_64-linux-gnu/libc.so.6"))).unwrap(),
            b"libc"
        );
    }

    #[test]
    fn test_copy_if_absent_keeps_existing() {
        let host = host_with_links();
        let scratch = TempDir::new().unwrap();
        let mut tree = TreeBuilder::create(&scratch.path().join("root")).unwrap();

        tree.write_file(Path::new("/lib/x86_64-linux-gnu/libc.so.6"), b"mine", 0o644)
            .unwrap();
        tree.copy_from_host(host.path(), Path::new("/lib/x86_64-linux-gnu/libc.so.6"))
            .unwrap();
        assert_eq!(
            fs::read(tree.dest(Path::new("/lib/x86_64-linux-gnu/libc.so.6"))).unwrap(),
            b"mine"
        );
    }

    #[test]
    fn test_missing_host_path() {
        let host = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let mut tree = TreeBuilder::create(&scratch.path().join("root")).unwrap();
        assert!(!tree
            .copy_from_host(host.path(), Path::new("/usr/sbin/zpool"))
            .unwrap());
    }

    #[test]
    fn test_steps_count_operations() {
        let scratch = TempDir::new().unwrap();
        let mut tree = TreeBuilder::create(&scratch.path().join("root")).unwrap();
        tree.step("dirs", |t| {
            t.mkdir(Path::new("/etc"), 0o755)?;
            t.mkdir(Path::new("/etc"), 0o755)
        })
        .unwrap();
        tree.step("devices", |t| {
            t.add_device(DeviceNode::char("dev/null", 1, 3, 0o666));
            Ok(())
        })
        .unwrap();

        let tree = tree.finish();
        assert_eq!(
            tree.steps(),
            &[
                Step { name: "dirs".into(), operations: 1 },
                Step { name: "devices".into(), operations: 1 },
            ]
        );
    }

    #[test]
    fn test_entries_include_devices_in_order() {
        let scratch = TempDir::new().unwrap();
        let mut tree = TreeBuilder::create(&scratch.path().join("root")).unwrap();
        tree.mkdir(Path::new("/dev"), 0o755).unwrap();
        tree.mkdir(Path::new("/etc"), 0o755).unwrap();
        tree.add_device(DeviceNode::char("dev/console", 5, 1, 0o600));
        let tree = tree.finish();

        let paths: Vec<_> = tree
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.path.to_string_lossy().into_owned())
            .collect();
        assert_eq!(paths, vec!["dev", "dev/console", "etc"]);
    }

    #[test]
    fn test_digest_ignores_timestamps() {
        let scratch = TempDir::new().unwrap();
        let build = |name: &str| {
            let mut tree = TreeBuilder::create(&scratch.path().join(name)).unwrap();
            tree.write_file(Path::new("/etc/hostname"), b"ramroot\n", 0o644)
                .unwrap();
            tree.symlink(Path::new("/var/run"), Path::new("/run")).unwrap();
            tree.finish().digest().unwrap()
        };
        let first = build("a");
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(first, build("b"));
    }
}
