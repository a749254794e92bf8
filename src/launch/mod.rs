//! Host-side launch: preflight, identity injection, kernel switch.
//!
//! Everything before the final gate only touches the scratch directory; the
//! gate is the single point where the host is given up.

pub mod artifact;
pub mod identity;
pub mod kexec;
pub mod ssh;

use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config::host_path;
use crate::error::LaunchError;
use crate::image::cpio::CpioEntry;
use crate::image::{find_file, read_image, unpacked_size};
use crate::network::capture::capture_host;
use crate::network::dns::select_nameservers;
use crate::network::NetworkIdentity;
use crate::preflight::environment::{image_memory_mib, secure_boot_enabled};
use crate::preflight::run_launch_preflight;
use crate::process;
use crate::prompt::Prompter;

use self::artifact::PayloadLayout;
use self::identity::Identity;
use self::kexec::{switch, KernelBootSpec, KexecSwitcher};
use self::ssh::{
    collect_trusted_keys, convert_host_keys, key_source_paths, passwd_home, select_trusted_keys,
    HostKeys, LiveKeyTool,
};

/// Where tools are looked for inside the image.
const TOOL_DIRS: &[&str] = &["usr/local/sbin", "usr/sbin", "sbin", "usr/bin", "bin"];

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub scratch: PathBuf,
    /// Root the host's keys, resolvers and kernel state are read from.
    pub host_root: PathBuf,
    pub min_memory_mib: Option<u64>,
    /// Extra `ramroot.*` kernel arguments.
    pub extra_cmdline: Vec<String>,
    pub capture_network: bool,
}

/// Finds host tools on PATH, else extracts them from the image.
pub struct ToolLocator {
    image: PathBuf,
    tools_dir: PathBuf,
    entries: Option<Vec<CpioEntry>>,
}

impl ToolLocator {
    pub fn new(image: &Path, tools_dir: &Path) -> Self {
        Self {
            image: image.to_path_buf(),
            tools_dir: tools_dir.to_path_buf(),
            entries: None,
        }
    }

    pub fn locate(&mut self, name: &str) -> Result<Option<PathBuf>> {
        if let Some(path) = process::which(name) {
            return Ok(Some(path));
        }
        self.extract(name)
    }

    /// Memory needed to hold the image once unpacked.
    pub fn image_memory_mib(&mut self) -> Result<u64> {
        Ok(image_memory_mib(unpacked_size(self.entries()?)))
    }

    fn entries(&mut self) -> Result<&[CpioEntry]> {
        if self.entries.is_none() {
            self.entries = Some(read_image(&self.image)?);
        }
        Ok(self.entries.as_deref().unwrap_or_default())
    }

    /// Copy `name` out of the image into the tools directory.
    pub fn extract(&mut self, name: &str) -> Result<Option<PathBuf>> {
        let Some(entry) = find_file(self.entries()?, TOOL_DIRS, name) else {
            return Ok(None);
        };

        fs::create_dir_all(&self.tools_dir)
            .with_context(|| format!("Failed to create {}", self.tools_dir.display()))?;
        let dest = self.tools_dir.join(name);
        fs::write(&dest, &entry.data)
            .with_context(|| format!("Failed to write {}", dest.display()))?;
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o755))?;
        tracing::info!(tool = name, "using the copy bundled in the image");
        Ok(Some(dest))
    }
}

/// Run the launch sequence. Returns only on abort or failure.
pub fn launch(
    options: &LaunchOptions,
    layout: &PayloadLayout,
    prompter: &mut dyn Prompter,
) -> Result<()> {
    println!("=== ramroot launch ===\n");
    println!("Kernel: {}", layout.kernel.display());
    println!("Image:  {}\n", layout.image.display());

    let mut tools = ToolLocator::new(&layout.image, &options.scratch.join("tools"));
    let kexec = tools.locate("kexec")?;
    let min_memory_mib = match options.min_memory_mib {
        Some(mib) => Some(mib),
        None => match tools.image_memory_mib() {
            Ok(mib) => Some(mib),
            Err(e) => {
                tracing::warn!("cannot size the image for the memory check: {:#}", e);
                None
            }
        },
    };
    let report = run_launch_preflight(
        &options.host_root,
        &options.scratch,
        min_memory_mib,
        kexec.as_deref(),
    );
    report.print();
    let Some(kexec) = kexec else {
        return Err(LaunchError::NoSwitchUtility.into());
    };
    if !report.all_passed() {
        bail!(
            "Launch preflight failed: {} check(s) failed. Nothing was changed.",
            report.fail_count()
        );
    }

    let identity = capture_identity(options, &mut tools, prompter)?;
    identity.inject(&layout.image)?;

    println!("\n=== Identity ===\n");
    for key in &identity.host_keys.keys {
        println!("  host key {}: {}", key.algorithm.name(), key.fingerprint);
    }
    if identity.host_keys.ephemeral {
        println!("  host key: NEW (clients will see a changed fingerprint)");
    }
    println!("  trusted keys: {}", identity.trusted.keys.len());
    println!("  interfaces captured: {}", identity.network.interfaces.len());
    println!(
        "  nameservers: {}",
        identity
            .nameservers
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    );
    println!();

    let mut spec = KernelBootSpec::new(&layout.kernel, &layout.image)
        .with_extra_args(&options.extra_cmdline);
    spec.file_load = secure_boot_enabled(&options.host_root);

    switch(&mut KexecSwitcher { kexec }, &spec, prompter)
}

fn capture_identity(
    options: &LaunchOptions,
    tools: &mut ToolLocator,
    prompter: &mut dyn Prompter,
) -> Result<Identity> {
    let work = options.scratch.join("identity");
    let mut key_tool = LiveKeyTool {
        dropbearconvert: tools.locate("dropbearconvert")?,
        dropbearkey: tools.locate("dropbearkey")?,
        ssh_keygen: tools.locate("ssh-keygen")?,
    };

    let ssh_dir = host_path(&options.host_root, Path::new("/etc/ssh"));
    let host_keys = match convert_host_keys(&mut key_tool, &ssh_dir, &work) {
        Ok(keys) => keys,
        Err(e) => {
            tracing::warn!("no host key provisioned, the environment will generate one at boot: {:#}", e);
            HostKeys {
                keys: Vec::new(),
                ephemeral: true,
            }
        }
    };

    let candidates = collect_trusted_keys(&key_source_paths(
        &host_path(&options.host_root, Path::new("/root")),
        &operator_homes(&options.host_root),
    ));
    let hostname = fs::read_to_string(host_path(&options.host_root, Path::new("/etc/hostname")))
        .map(|h| h.trim().to_string())
        .unwrap_or_default();
    let comment = format!("ramroot@{}", if hostname.is_empty() { "host" } else { &hostname });
    let trusted = select_trusted_keys(prompter, &mut key_tool, &candidates, &work, &comment)?;

    let (nameservers, source) = select_nameservers(&options.host_root);
    tracing::info!(?source, "nameservers captured");

    let network = if options.capture_network {
        match capture_host() {
            Ok(network) => network,
            Err(e) => {
                tracing::warn!("network capture failed, the environment will use DHCP: {:#}", e);
                NetworkIdentity::default()
            }
        }
    } else {
        NetworkIdentity::default()
    };
    if network.is_empty() {
        tracing::warn!("no interface captured, the environment will use DHCP");
    }

    Ok(Identity {
        host_keys,
        trusted,
        nameservers,
        network,
    })
}

/// Home of the invoking user and of the user behind sudo.
fn operator_homes(host_root: &Path) -> Vec<PathBuf> {
    let mut homes = Vec::new();
    if let Some(home) = dirs::home_dir() {
        homes.push(host_path(host_root, &home));
    }
    if let Ok(user) = std::env::var("SUDO_USER") {
        let passwd = fs::read_to_string(host_path(host_root, Path::new("/etc/passwd")))
            .unwrap_or_default();
        if let Some(home) = passwd_home(&passwd, &user) {
            let home = host_path(host_root, &home);
            if !homes.contains(&home) {
                homes.push(home);
            }
        }
    }
    homes
}
