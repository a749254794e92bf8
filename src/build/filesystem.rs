//! Directory skeleton and device nodes.

use anyhow::Result;
use std::path::Path;

use super::tree::{DeviceNode, TreeBuilder};

/// Directories every image has, with their modes.
pub const SKELETON: &[(&str, u32)] = &[
    ("/bin", 0o755),
    ("/sbin", 0o755),
    ("/usr/bin", 0o755),
    ("/usr/sbin", 0o755),
    ("/usr/share", 0o755),
    ("/lib", 0o755),
    ("/lib64", 0o755),
    ("/usr/lib", 0o755),
    ("/usr/lib64", 0o755),
    ("/etc", 0o755),
    ("/etc/ramroot", 0o755),
    ("/etc/dropbear", 0o700),
    ("/etc/zfs", 0o755),
    ("/root", 0o700),
    ("/root/.ssh", 0o700),
    ("/home", 0o755),
    ("/tmp", 0o1777),
    ("/run", 0o755),
    ("/var", 0o755),
    ("/var/log", 0o755),
    ("/var/tmp", 0o1777),
    ("/var/lib", 0o755),
    ("/proc", 0o555),
    ("/sys", 0o555),
    ("/dev", 0o755),
    ("/dev/pts", 0o755),
    ("/mnt", 0o755),
    ("/target", 0o755),
];

/// Absolute-path symlinks: (link, target).
pub const SKELETON_LINKS: &[(&str, &str)] = &[
    ("/var/run", "/run"),
    ("/var/lock", "/run/lock"),
    ("/etc/mtab", "/proc/self/mounts"),
];

/// Device nodes present before devtmpfs is mounted.
pub fn device_nodes() -> Vec<DeviceNode> {
    vec![
        DeviceNode::char("dev/console", 5, 1, 0o600),
        DeviceNode::char("dev/null", 1, 3, 0o666),
        DeviceNode::char("dev/zero", 1, 5, 0o666),
    ]
}

pub fn create_skeleton(tree: &mut TreeBuilder) -> Result<()> {
    for (dir, mode) in SKELETON {
        tree.mkdir(Path::new(dir), *mode)?;
    }
    for (link, target) in SKELETON_LINKS {
        tree.symlink(Path::new(link), Path::new(target))?;
    }
    Ok(())
}

pub fn create_device_nodes(tree: &mut TreeBuilder) {
    for node in device_nodes() {
        tree.add_device(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_skeleton() {
        let scratch = TempDir::new().unwrap();
        let mut tree = TreeBuilder::create(&scratch.path().join("root")).unwrap();
        create_skeleton(&mut tree).unwrap();
        create_device_nodes(&mut tree);

        let tmp = fs::metadata(tree.dest(Path::new("/tmp"))).unwrap();
        assert_eq!(tmp.permissions().mode() & 0o7777, 0o1777);
        assert_eq!(
            fs::read_link(tree.dest(Path::new("/var/run"))).unwrap(),
            Path::new("/run")
        );

        let tree = tree.finish();
        let console = tree
            .devices()
            .iter()
            .find(|d| d.path == "dev/console")
            .unwrap();
        assert_eq!((console.major, console.minor), (5, 1));
        assert!(tree.contains(Path::new("/dev/pts")));
    }
}
