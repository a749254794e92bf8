//! Shared-library closure resolution.
//!
//! Given one binary, report every library the dynamic loader would map for
//! it, including the program interpreter. Entries the loader cannot find are
//! kept apart as warnings; a static binary resolves to an empty set.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::process::Cmd;

/// Libraries resolved for one binary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub binary: PathBuf,
    /// Absolute library paths, interpreter included.
    pub libraries: BTreeSet<PathBuf>,
    /// Sonames the loader reported as `not found`.
    pub missing: Vec<String>,
}

impl Resolution {
    pub fn empty(binary: &Path) -> Self {
        Self {
            binary: binary.to_path_buf(),
            ..Self::default()
        }
    }
}

/// Anything that can compute a binary's library closure.
pub trait LibraryResolver: Send + Sync {
    fn resolve(&self, binary: &Path) -> Result<Resolution>;
}

/// Dynamic loaders looked for under a foreign host root.
const LOADERS: &[&str] = &[
    "/lib64/ld-linux-x86-64.so.2",
    "/lib/ld-linux-aarch64.so.1",
    "/lib/ld-linux-armhf.so.3",
    "/lib/ld-linux.so.2",
];

/// Library directories searched under a foreign host root, before
/// `etc/ld.so.conf.d`.
const LIBRARY_DIRS: &[&str] = &[
    "/lib/x86_64-linux-gnu",
    "/usr/lib/x86_64-linux-gnu",
    "/lib/aarch64-linux-gnu",
    "/usr/lib/aarch64-linux-gnu",
    "/lib64",
    "/usr/lib64",
    "/lib",
    "/usr/lib",
];

/// Resolver backed by `ldd`.
///
/// For a host root other than `/` the root's own loader is run in list mode
/// with the root's library directories, so libraries come from the harvested
/// system rather than the build machine. That loader must be executable here.
#[derive(Debug, Clone)]
pub struct LddResolver {
    root: PathBuf,
}

impl LddResolver {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn is_live_root(&self) -> bool {
        self.root == Path::new("/")
    }

    fn loader(&self) -> Result<PathBuf> {
        LOADERS
            .iter()
            .map(|l| self.root.join(l.trim_start_matches('/')))
            .find(|l| l.exists())
            .with_context(|| format!("No dynamic loader found under {}", self.root.display()))
    }
}

impl LibraryResolver for LddResolver {
    fn resolve(&self, binary: &Path) -> Result<Resolution> {
        let cmd = if self.is_live_root() {
            Cmd::new("ldd").arg_path(binary)
        } else {
            let search = library_path(&self.root).join(":");
            Cmd::for_path(&self.loader()?)
                .arg("--list")
                .args(["--library-path", search.as_str()])
                .arg_path(binary)
        };
        let result = cmd
            .allow_fail()
            .run()
            .with_context(|| format!("Failed to resolve libraries of {}", binary.display()))?;

        // ldd exits non-zero for static binaries and scripts
        let mut text = result.stdout;
        text.push_str(&result.stderr);
        let mut resolution = parse_ldd_output(binary, &text);
        if !self.is_live_root() {
            resolution.libraries = resolution
                .libraries
                .into_iter()
                .map(|lib| into_host_namespace(&self.root, &lib))
                .collect();
        }
        Ok(resolution)
    }
}

/// Library search path under `root`, as build-machine paths.
pub fn library_path(root: &Path) -> Vec<String> {
    let mut dirs: Vec<String> = LIBRARY_DIRS.iter().map(|d| d.to_string()).collect();
    if let Ok(entries) = fs::read_dir(root.join("etc/ld.so.conf.d")) {
        let mut confs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "conf"))
            .collect();
        confs.sort();
        for conf in confs {
            let text = fs::read_to_string(&conf).unwrap_or_default();
            for line in text.lines().map(str::trim) {
                if line.starts_with('/') && !dirs.iter().any(|d| d == line) {
                    dirs.push(line.to_string());
                }
            }
        }
    }
    dirs.into_iter()
        .map(|d| root.join(d.trim_start_matches('/')))
        .filter(|d| d.is_dir())
        .map(|d| d.display().to_string())
        .collect()
}

/// Map a build-machine path below `root` back to its path on the host.
pub fn into_host_namespace(root: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix(root) {
        Ok(rest) => Path::new("/").join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Parse `ldd` output into a [`Resolution`].
pub fn parse_ldd_output(binary: &Path, output: &str) -> Resolution {
    let mut resolution = Resolution::empty(binary);

    for line in output.lines().map(str::trim) {
        if line.is_empty()
            || line.contains("not a dynamic executable")
            || line.contains("statically linked")
        {
            continue;
        }

        // libfoo.so.1 => /usr/lib/libfoo.so.1 (0x...)
        if let Some((soname, rest)) = line.split_once("=>") {
            let rest = rest.trim();
            if rest.starts_with("not found") {
                resolution.missing.push(soname.trim().to_string());
                continue;
            }
            if let Some(path) = leading_path(rest) {
                resolution.libraries.insert(path);
            }
            continue;
        }

        // /lib64/ld-linux-x86-64.so.2 (0x...), or the vDSO which has no path
        if let Some(path) = leading_path(line) {
            resolution.libraries.insert(path);
        }
    }

    resolution
}

fn leading_path(text: &str) -> Option<PathBuf> {
    let token = text.split_whitespace().next()?;
    token.starts_with('/').then(|| PathBuf::from(token))
}

/// Resolve many binaries concurrently; results come back sorted by binary.
pub async fn resolve_all(
    resolver: Arc<dyn LibraryResolver>,
    binaries: Vec<PathBuf>,
) -> Result<Vec<Resolution>> {
    let mut set = JoinSet::new();
    for binary in binaries {
        let resolver = Arc::clone(&resolver);
        set.spawn_blocking(move || resolver.resolve(&binary));
    }

    let mut resolutions = Vec::new();
    while let Some(joined) = set.join_next().await {
        let resolution = joined.context("Library resolution task panicked")??;
        for soname in &resolution.missing {
            tracing::warn!(
                binary = %resolution.binary.display(),
                library = %soname,
                "library not found on host"
            );
        }
        resolutions.push(resolution);
    }

    resolutions.sort_by(|a, b| a.binary.cmp(&b.binary));
    Ok(resolutions)
}

/// Blocking wrapper around [`resolve_all`] for synchronous callers.
pub fn resolve_all_blocking(
    resolver: Arc<dyn LibraryResolver>,
    binaries: Vec<PathBuf>,
) -> Result<Vec<Resolution>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start resolver runtime")?;
    runtime.block_on(resolve_all(resolver, binaries))
}
