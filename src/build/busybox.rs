//! Busybox applet links.
//!
//! One symlink per applet in `/bin`, except the excluded names and any path
//! a dedicated binary already occupies.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::tree::TreeBuilder;
use crate::config::host_path;
use crate::process::Cmd;

/// Ask the host busybox which applets it was built with.
pub fn list_applets(host_root: &Path, busybox: &Path) -> Result<String> {
    let result = Cmd::for_path(&host_path(host_root, busybox))
        .arg("--list")
        .error_msg("busybox --list failed")
        .run()
        .context("Failed to list busybox applets")?;
    Ok(result.stdout)
}

/// Applet names to link, in listing order, minus exclusions and junk.
pub fn applet_links(listing: &str, exclusions: &[String]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for name in listing.lines().map(str::trim) {
        if name.is_empty()
            || name.contains('/')
            || name == "busybox"
            || exclusions.iter().any(|e| e == name)
            || names.iter().any(|n| n == name)
        {
            continue;
        }
        names.push(name.to_string());
    }
    names
}

/// Link applets to `busybox` and make sure `/bin/sh` exists.
///
/// Returns the number of links created.
pub fn install_applets(
    tree: &mut TreeBuilder,
    busybox: &Path,
    applets: &[String],
    shell: Option<&Path>,
) -> Result<usize> {
    let mut created = 0;
    for applet in applets {
        let link = PathBuf::from("/bin").join(applet);
        if tree.symlink(&link, busybox)? {
            created += 1;
        }
    }

    // sh is excluded from the applets; point it at a full shell when there is one
    let sh_target = match shell {
        Some(bash) => bash.to_path_buf(),
        None => {
            tracing::warn!("bash not available, /bin/sh falls back to busybox ash");
            busybox.to_path_buf()
        }
    };
    tree.symlink(Path::new("/bin/sh"), &sh_target)?;
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_APPLET_EXCLUSIONS;
    use std::fs;
    use tempfile::TempDir;

    fn exclusions() -> Vec<String> {
        DEFAULT_APPLET_EXCLUSIONS.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exclusions_are_never_linked() {
        let listing = "ash\nbusybox\ncat\nhalt\nip\ninit\nls\npoweroff\nreboot\nsh\nudhcpc\nls\n";
        assert_eq!(applet_links(listing, &exclusions()), vec!["cat", "ip", "ls", "udhcpc"]);
    }

    #[test]
    fn test_dedicated_binary_wins() {
        let scratch = TempDir::new().unwrap();
        let mut tree = TreeBuilder::create(&scratch.path().join("root")).unwrap();
        tree.write_file(Path::new("/bin/ip"), b"iproute2", 0o755).unwrap();

        let applets = vec!["ip".to_string(), "ls".to_string()];
        let created =
            install_applets(&mut tree, Path::new("/bin/busybox"), &applets, None).unwrap();

        assert_eq!(created, 1);
        assert_eq!(fs::read(tree.dest(Path::new("/bin/ip"))).unwrap(), b"iproute2");
        assert_eq!(
            fs::read_link(tree.dest(Path::new("/bin/sh"))).unwrap(),
            Path::new("/bin/busybox")
        );
    }

    #[test]
    fn test_sh_points_at_bash() {
        let scratch = TempDir::new().unwrap();
        let mut tree = TreeBuilder::create(&scratch.path().join("root")).unwrap();
        install_applets(
            &mut tree,
            Path::new("/bin/busybox"),
            &[],
            Some(Path::new("/usr/bin/bash")),
        )
        .unwrap();
        assert_eq!(
            fs::read_link(tree.dest(Path::new("/bin/sh"))).unwrap(),
            Path::new("/usr/bin/bash")
        );
    }
}
