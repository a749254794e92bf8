//! Configuration for ramroot.
//!
//! [`BuildConfig`] is read from a `.env` file and `RAMROOT_*` environment
//! variables (environment wins), then threaded unchanged through resolution,
//! assembly and packaging. [`BootConfig`] is the part of it that travels into
//! the image as `etc/ramroot/boot.json` for the init controller.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_HOSTNAME: &str = "ramroot";

/// Location of the boot configuration inside the image.
pub const BOOT_CONFIG_PATH: &str = "/etc/ramroot/boot.json";

/// Lease script handed to `udhcpc -s`.
pub const DHCP_SCRIPT_PATH: &str = "/etc/ramroot/udhcpc.script";

/// Present in the image when the launcher could not convert any host key.
pub const EPHEMERAL_KEY_MARKER: &str = "/etc/ramroot/ephemeral-host-key";

/// Applets never linked to busybox; a full binary or wrapper owns these names.
pub const DEFAULT_APPLET_EXCLUSIONS: &[&str] =
    &["sh", "ash", "bash", "reboot", "poweroff", "halt", "init"];

/// Modules the init controller tries to load, pool module first.
pub const DEFAULT_BOOT_MODULES: &[&str] = &[
    "zfs",
    "virtio_pci",
    "virtio_blk",
    "virtio_scsi",
    "virtio_net",
    "nvme",
    "ahci",
    "sd_mod",
    "megaraid_sas",
    "mpt3sas",
    "raid1",
    "e1000",
    "e1000e",
    "igb",
    "ixgbe",
    "i40e",
    "ice",
    "bnxt_en",
    "tg3",
    "r8169",
    "mlx5_core",
    "usb_storage",
];

/// Settings the init controller reads at start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    pub hostname: String,
    /// tmpfs size option for /run, e.g. "25%" or "512m". None means no quota.
    pub run_size: Option<String>,
    /// tmpfs size option for /tmp.
    pub tmp_size: Option<String>,
    /// Bytes written to the zfs_arc_max module parameter.
    pub zfs_arc_max: Option<u64>,
    pub modules: Vec<String>,
    pub ssh_port: u16,
    pub dhcp_retries: u32,
    pub dhcp_timeout_secs: u64,
    pub console_shell: String,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOSTNAME.to_string(),
            run_size: None,
            tmp_size: None,
            zfs_arc_max: None,
            modules: DEFAULT_BOOT_MODULES.iter().map(|m| m.to_string()).collect(),
            ssh_port: 22,
            dhcp_retries: 5,
            dhcp_timeout_secs: 10,
            console_shell: "/bin/bash".to_string(),
        }
    }
}

impl BootConfig {
    pub fn to_json(&self) -> Result<String> {
        let mut json =
            serde_json::to_string_pretty(self).context("Failed to serialize boot config")?;
        json.push('\n');
        Ok(json)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to parse boot config")
    }
}

/// Immutable build settings.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Root of the host filesystem binaries are harvested from.
    pub host_root: PathBuf,
    pub output_dir: PathBuf,
    pub kernel_release: String,
    pub kernel_image: PathBuf,
    /// Explicit busybox location; searched in the host root otherwise.
    pub busybox: Option<PathBuf>,
    /// The `ramroot-init` binary installed as `/init`.
    pub init_binary: PathBuf,
    pub allow_missing_pool_modules: bool,
    pub applet_exclusions: Vec<String>,
    pub min_memory_mib: Option<u64>,
    pub boot: BootConfig,
}

impl BuildConfig {
    /// Load from `<base_dir>/.env` and the process environment.
    pub fn load(base_dir: &Path) -> Result<Self> {
        let mut vars = HashMap::new();

        let env_path = base_dir.join(".env");
        if let Ok(iter) = dotenvy::from_path_iter(&env_path) {
            for item in iter {
                let (key, value) =
                    item.with_context(|| format!("Malformed line in {}", env_path.display()))?;
                vars.insert(key, value);
            }
        }

        // Environment variables override .env
        vars.extend(std::env::vars());

        let running = running_kernel_release().unwrap_or_else(|_| "unknown".to_string());
        Self::from_vars(&vars, base_dir, &running, default_init_binary())
    }

    /// Build from an explicit variable map.
    pub fn from_vars(
        vars: &HashMap<String, String>,
        base_dir: &Path,
        running_release: &str,
        default_init: PathBuf,
    ) -> Result<Self> {
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());
        let path_var = |key: &str| get(key).map(|v| absolutize(base_dir, v));

        let host_root = path_var("RAMROOT_HOST_ROOT").unwrap_or_else(|| PathBuf::from("/"));
        let output_dir = path_var("RAMROOT_OUTPUT").unwrap_or_else(|| base_dir.join("output"));
        let kernel_release = get("RAMROOT_KERNEL_RELEASE")
            .unwrap_or(running_release)
            .to_string();
        let kernel_image = path_var("RAMROOT_KERNEL_IMAGE").unwrap_or_else(|| {
            host_root
                .join("boot")
                .join(format!("vmlinuz-{}", kernel_release))
        });

        let mut boot = BootConfig::default();
        if let Some(hostname) = get("RAMROOT_HOSTNAME") {
            boot.hostname = hostname.to_string();
        }
        boot.tmp_size = get("RAMROOT_TMP_SIZE").map(str::to_string);
        boot.run_size = get("RAMROOT_RUN_SIZE").map(str::to_string);
        boot.zfs_arc_max = parse_u64(get("RAMROOT_ZFS_ARC_MAX"), "RAMROOT_ZFS_ARC_MAX")?;

        Ok(Self {
            kernel_image,
            busybox: path_var("RAMROOT_BUSYBOX"),
            init_binary: path_var("RAMROOT_INIT_BINARY").unwrap_or(default_init),
            allow_missing_pool_modules: get("RAMROOT_ALLOW_MISSING_POOL_MODULES")
                .map(parse_bool)
                .unwrap_or(false),
            applet_exclusions: DEFAULT_APPLET_EXCLUSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_memory_mib: parse_u64(get("RAMROOT_MIN_MEMORY_MIB"), "RAMROOT_MIN_MEMORY_MIB")?,
            host_root,
            output_dir,
            kernel_release,
            boot,
        })
    }

    /// Map an absolute path in the host namespace into the host root.
    pub fn host_path(&self, path: &Path) -> PathBuf {
        host_path(&self.host_root, path)
    }

    pub fn image_name(&self) -> String {
        format!("initramfs-{}.cpio.gz", self.kernel_release)
    }

    pub fn image_path(&self) -> PathBuf {
        self.output_dir.join(self.image_name())
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("ramroot-{}.run", self.kernel_release))
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.output_dir.join("staging")
    }

    pub fn print(&self) {
        println!("Configuration:");
        println!("  RAMROOT_HOST_ROOT: {}", self.host_root.display());
        println!("  RAMROOT_OUTPUT: {}", self.output_dir.display());
        println!("  RAMROOT_KERNEL_RELEASE: {}", self.kernel_release);
        println!("  RAMROOT_KERNEL_IMAGE: {}", self.kernel_image.display());
        match &self.busybox {
            Some(path) => println!("  RAMROOT_BUSYBOX: {}", path.display()),
            None => println!("  RAMROOT_BUSYBOX: (search host root)"),
        }
        println!("  RAMROOT_INIT_BINARY: {}", self.init_binary.display());
        println!(
            "  RAMROOT_ALLOW_MISSING_POOL_MODULES: {}",
            self.allow_missing_pool_modules
        );
        println!(
            "  RAMROOT_MIN_MEMORY_MIB: {}",
            display_opt(self.min_memory_mib.as_ref())
        );
        println!("  RAMROOT_HOSTNAME: {}", self.boot.hostname);
        println!("  RAMROOT_TMP_SIZE: {}", display_opt(self.boot.tmp_size.as_ref()));
        println!("  RAMROOT_RUN_SIZE: {}", display_opt(self.boot.run_size.as_ref()));
        println!(
            "  RAMROOT_ZFS_ARC_MAX: {}",
            display_opt(self.boot.zfs_arc_max.as_ref())
        );
        if self.init_binary.is_file() {
            println!("  Init binary: FOUND");
        } else {
            println!("  Init binary: NOT FOUND (build ramroot-init first)");
        }
    }
}

/// Join an absolute path onto a root, treating `/` as the host itself.
pub fn host_path(root: &Path, path: &Path) -> PathBuf {
    let relative = path.strip_prefix("/").unwrap_or(path);
    root.join(relative)
}

/// Release string of the running kernel.
pub fn running_kernel_release() -> Result<String> {
    let release = fs::read_to_string("/proc/sys/kernel/osrelease")
        .context("Failed to read /proc/sys/kernel/osrelease")?;
    Ok(release.trim().to_string())
}

/// `ramroot-init` next to the running executable.
pub fn default_init_binary() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("ramroot-init")))
        .unwrap_or_else(|| PathBuf::from("/usr/local/lib/ramroot/ramroot-init"))
}

fn absolutize(base_dir: &Path, value: &str) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_u64(value: Option<&str>, key: &str) -> Result<Option<u64>> {
    value
        .map(|v| {
            v.parse::<u64>()
                .with_context(|| format!("{} must be a whole number, got '{}'", key, v))
        })
        .transpose()
}

fn display_opt<T: std::fmt::Display>(value: Option<&T>) -> String {
    value.map_or_else(|| "(unset)".to_string(), |v| v.to_string())
}
