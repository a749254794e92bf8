//! Root filesystem assembly.
//!
//! Turns the host's binaries into a minimal, dependency-complete tree in a
//! scratch directory:
//!
//! 1. search the host for every manifest tool (critical misses stop here)
//! 2. resolve library closures concurrently
//! 3. skeleton and device nodes
//! 4. dedicated tools with their closures
//! 5. busybox applets for whatever names remain
//! 6. auxiliary data, generated /etc, kernel modules
//! 7. `/init` and the reboot/poweroff/halt wrappers, last
//!
//! Every copy is copy-if-absent, so assembling twice from an unchanged host
//! yields the same [`FsTree::digest`].

pub mod auxdata;
pub mod busybox;
pub mod etc;
pub mod filesystem;
pub mod libdeps;
pub mod manifest;
pub mod modules;
pub mod tree;

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{host_path, BuildConfig};
use crate::error::BuildError;
use crate::prompt::Prompter;
use crate::resolve::{resolve_all_blocking, LibraryResolver};
use crate::timing::Timer;

use auxdata::AuxReport;
use manifest::{BinaryArtifact, MANIFEST};
use modules::ModuleHarvest;
pub use tree::{FsTree, TreeBuilder};

/// Names the terminal-action wrappers are installed under.
pub const WRAPPER_NAMES: &[&str] = &["reboot", "poweroff", "halt"];

/// Directories the wrappers are installed in.
pub const WRAPPER_DIRS: &[&str] = &["/sbin", "/bin", "/usr/sbin"];

/// Result of one assembly run.
#[derive(Debug)]
pub struct Assembly {
    pub tree: FsTree,
    pub artifacts: Vec<BinaryArtifact>,
    pub missing_optional: Vec<String>,
    pub applets: usize,
    pub modules: ModuleHarvest,
    pub aux: AuxReport,
}

/// Assemble the tree into `config.staging_dir()`.
pub fn assemble(
    config: &BuildConfig,
    resolver: Arc<dyn LibraryResolver>,
    prompter: &mut dyn Prompter,
) -> Result<Assembly> {
    println!("=== Assembling RAM root ===");
    let host_root = config.host_root.as_path();

    if !config.init_binary.is_file() {
        return Err(BuildError::MissingInit {
            path: config.init_binary.clone(),
        }
        .into());
    }

    let timer = Timer::start("Search");
    let outcome = manifest::search_with_remediation(
        host_root,
        MANIFEST,
        config.busybox.as_deref(),
        prompter,
    )?;
    timer.finish();
    println!(
        "  Found {} tools ({} optional missing)",
        outcome.found.len(),
        outcome.missing_optional.len()
    );

    let timer = Timer::start("Resolve");
    let artifacts = resolve_artifacts(host_root, outcome.found, Arc::clone(&resolver))?;
    let init_libraries = resolver
        .resolve(&config.init_binary)
        .context("Failed to resolve the init binary's libraries")?
        .libraries;
    timer.finish();

    let mut tree = TreeBuilder::create(&config.staging_dir())?;

    tree.step("skeleton", |t| {
        filesystem::create_skeleton(t)?;
        filesystem::create_device_nodes(t);
        Ok(())
    })?;

    let timer = Timer::start("Binaries");
    tree.step("binaries", |t| {
        for artifact in &artifacts {
            libdeps::install_binary(t, host_root, artifact)?;
        }
        Ok(())
    })?;
    timer.finish();

    let busybox = artifact_path(&artifacts, "busybox")
        .context("busybox missing after search")?
        .to_path_buf();
    let bash = artifact_path(&artifacts, "bash").map(Path::to_path_buf);
    let mut applets = 0;
    tree.step("applets", |t| {
        let listing = busybox::list_applets(host_root, &busybox)?;
        let names = busybox::applet_links(&listing, &config.applet_exclusions);
        applets = busybox::install_applets(t, &busybox, &names, bash.as_deref())?;
        Ok(())
    })?;
    println!("  Linked {} busybox applets", applets);

    let mut aux = AuxReport::default();
    tree.step("auxiliary data", |t| {
        aux = auxdata::copy_aux_data(t, host_root)?;
        Ok(())
    })?;

    tree.step("configuration", |t| etc::create_etc_files(t, &config.boot))?;

    let timer = Timer::start("Kernel modules");
    let mut harvest = ModuleHarvest::default();
    tree.step("kernel modules", |t| {
        harvest = modules::harvest_modules(
            t,
            host_root,
            &config.kernel_release,
            config.allow_missing_pool_modules,
        )?;
        Ok(())
    })?;
    timer.finish();
    println!(
        "  Kernel {}: {} pool modules, {} driver modules",
        harvest.kernel_release,
        harvest.pool_modules.len(),
        harvest.driver_modules
    );

    tree.step("init", |t| {
        t.install_file(&config.init_binary, Path::new("/init"), 0o755)?;
        libdeps::install_libraries(t, host_root, &init_libraries)
    })?;

    tree.step("wrappers", install_wrappers)?;

    let tree = tree.finish();
    for (binary, library) in libdeps::missing_libraries(&tree, &artifacts) {
        tracing::warn!(binary = %binary, library = %library.display(), "library absent from image");
    }

    println!("=== Assembly complete: {} ===", tree.root().display());
    Ok(Assembly {
        tree,
        artifacts,
        missing_optional: outcome.missing_optional,
        applets,
        modules: harvest,
        aux,
    })
}

/// Attach resolved libraries to each artifact.
fn resolve_artifacts(
    host_root: &Path,
    mut found: Vec<BinaryArtifact>,
    resolver: Arc<dyn LibraryResolver>,
) -> Result<Vec<BinaryArtifact>> {
    let on_disk: Vec<PathBuf> = found
        .iter()
        .map(|artifact| host_path(host_root, &artifact.path))
        .collect();
    let mut by_binary: HashMap<PathBuf, _> = resolve_all_blocking(resolver, on_disk.clone())?
        .into_iter()
        .map(|resolution| (resolution.binary.clone(), resolution.libraries))
        .collect();

    for (artifact, path) in found.iter_mut().zip(&on_disk) {
        artifact.libraries = by_binary.remove(path).unwrap_or_default();
    }
    Ok(found)
}

fn artifact_path<'a>(artifacts: &'a [BinaryArtifact], name: &str) -> Option<&'a Path> {
    artifacts
        .iter()
        .find(|a| a.name == name)
        .map(|a| a.path.as_path())
}

/// Point every terminal-action name at `/init`, replacing built-ins.
fn install_wrappers(tree: &mut TreeBuilder) -> Result<()> {
    for dir in WRAPPER_DIRS {
        for name in WRAPPER_NAMES {
            tree.replace_symlink(&Path::new(dir).join(name), Path::new("/init"))?;
        }
    }
    Ok(())
}
