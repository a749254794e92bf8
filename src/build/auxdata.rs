//! Auxiliary data copied from the host, best effort.
//!
//! Nothing here is fatal: a missing source leaves a warning and the
//! environment works with less (no TLS trust, dumb terminal, default keymap).

use anyhow::Result;
use std::path::{Path, PathBuf};

use super::tree::TreeBuilder;
use crate::config::host_path;

/// CA bundles, first present wins.
const TRUST_ROOTS: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/cert.pem",
];

const TERMINFO_DIRS: &[&str] = &["/usr/share/terminfo", "/lib/terminfo", "/etc/terminfo"];

const TERMINFO_ENTRIES: &[&str] = &[
    "d/dumb",
    "l/linux",
    "v/vt100",
    "v/vt102",
    "v/vt220",
    "x/xterm",
    "x/xterm-256color",
    "s/screen",
    "s/screen-256color",
    "t/tmux",
    "t/tmux-256color",
];

const LOCALES: &[&str] = &["/usr/lib/locale/C.utf8", "/usr/lib/locale/C.UTF-8"];

const KEYMAPS: &[&str] = &[
    "/usr/share/keymaps/i386/qwerty/us.kmap.gz",
    "/usr/lib/kbd/keymaps/legacy/i386/qwerty/us.map.gz",
    "/usr/share/kbd/keymaps/i386/qwerty/us.map.gz",
];

/// Package manager state directories, created empty.
const PACKAGE_DIRS: &[&str] = &[
    "/var/lib/dpkg/info",
    "/var/lib/dpkg/updates",
    "/var/lib/dpkg/alternatives",
    "/var/lib/dpkg/triggers",
    "/var/cache/apt/archives/partial",
    "/var/lib/apt/lists/partial",
    "/etc/apt/sources.list.d",
    "/etc/apt/apt.conf.d",
    "/etc/apt/preferences.d",
];

const PACKAGE_FILES: &[&str] = &["/var/lib/dpkg/status", "/var/lib/dpkg/available"];

/// Host data trees copied whole when present.
const DATA_TREES: &[&str] = &[
    // debootstrap suite scripts
    "/usr/share/debootstrap",
    // archive keys for release verification
    "/usr/share/keyrings",
    "/etc/apt/trusted.gpg.d",
];

/// What was found; `None` means the host had nothing to copy.
#[derive(Debug, Clone, Default)]
pub struct AuxReport {
    pub trust_roots: Option<PathBuf>,
    pub terminfo_entries: usize,
    pub locale: Option<PathBuf>,
    pub keymap: Option<PathBuf>,
}

pub fn copy_aux_data(tree: &mut TreeBuilder, host_root: &Path) -> Result<AuxReport> {
    let mut report = AuxReport::default();

    report.trust_roots = copy_first(tree, host_root, TRUST_ROOTS)?;
    if report.trust_roots.is_none() {
        tracing::warn!("no CA bundle on host; TLS downloads will fail verification");
    }

    for dir in TERMINFO_DIRS {
        for entry in TERMINFO_ENTRIES {
            let path = Path::new(dir).join(entry);
            if tree.copy_from_host(host_root, &path)? {
                report.terminfo_entries += 1;
            }
        }
    }
    if report.terminfo_entries == 0 {
        tracing::warn!("no terminfo entries found; full-screen tools will misbehave");
    }

    for locale in LOCALES {
        if host_path(host_root, Path::new(locale)).is_dir() {
            tree.copy_tree_from_host(host_root, Path::new(locale))?;
            report.locale = Some(PathBuf::from(locale));
            break;
        }
    }

    report.keymap = copy_first(tree, host_root, KEYMAPS)?;

    for dir in PACKAGE_DIRS {
        tree.mkdir(Path::new(dir), 0o755)?;
    }
    for file in PACKAGE_FILES {
        if !tree.contains(Path::new(file)) {
            tree.write_file(Path::new(file), b"", 0o644)?;
        }
    }

    for dir in DATA_TREES {
        tree.copy_tree_from_host(host_root, Path::new(dir))?;
    }

    Ok(report)
}

fn copy_first(tree: &mut TreeBuilder, host_root: &Path, candidates: &[&str]) -> Result<Option<PathBuf>> {
    for candidate in candidates {
        if tree.copy_from_host(host_root, Path::new(candidate))? {
            return Ok(Some(PathBuf::from(candidate)));
        }
    }
    Ok(None)
}
