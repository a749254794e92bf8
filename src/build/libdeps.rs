//! Binary and library installation.
//!
//! Binaries and their libraries land at the same absolute path they have on
//! the host. A library shared by many binaries is copied once: the second
//! copy finds the destination present and stops.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::manifest::BinaryArtifact;
use super::tree::{FsTree, TreeBuilder};

/// Copy one binary and its resolved closure into the tree.
pub fn install_binary(
    tree: &mut TreeBuilder,
    host_root: &Path,
    artifact: &BinaryArtifact,
) -> Result<()> {
    let copied = tree
        .copy_from_host(host_root, &artifact.path)
        .with_context(|| format!("Failed to install {}", artifact.name))?;
    if !copied {
        tracing::warn!(binary = %artifact.path.display(), "binary vanished from host");
        return Ok(());
    }

    for library in &artifact.libraries {
        let present = tree
            .copy_from_host(host_root, library)
            .with_context(|| {
                format!("'{}' requires library '{}'", artifact.name, library.display())
            })?;
        if !present {
            tracing::warn!(
                binary = %artifact.name,
                library = %library.display(),
                "required library missing on host"
            );
        }
    }
    Ok(())
}

/// Copy only the libraries of a binary installed some other way.
pub fn install_libraries<'a, I>(tree: &mut TreeBuilder, host_root: &Path, libraries: I) -> Result<()>
where
    I: IntoIterator<Item = &'a PathBuf>,
{
    for library in libraries {
        if !tree.copy_from_host(host_root, library)? {
            tracing::warn!(library = %library.display(), "library missing on host");
        }
    }
    Ok(())
}

/// Every (binary, library) pair whose library is absent from the tree.
pub fn missing_libraries(tree: &FsTree, artifacts: &[BinaryArtifact]) -> Vec<(String, PathBuf)> {
    artifacts
        .iter()
        .flat_map(|artifact| {
            artifact
                .libraries
                .iter()
                .filter(|lib| !tree.contains(lib))
                .map(|lib| (artifact.name.clone(), lib.clone()))
        })
        .collect()
}
