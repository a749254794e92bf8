//! Error taxonomy.
//!
//! Fatal classes are typed so callers can match on them; everything else is
//! plumbed through `anyhow` with context.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Conditions that stop a build.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error(
        "missing critical binaries: {}\n\
         Install the packages that provide them on the build host and retry",
        .names.join(", ")
    )]
    MissingCritical { names: Vec<String> },

    #[error(
        "no storage pool kernel modules found under {}\n\
         Install the pool module package for this kernel, or pass \
         --allow-missing-pool-modules to build without pool support",
        .path.display()
    )]
    NoPoolModules { path: PathBuf },

    #[error("scratch directory {} is not writable: {reason}", .path.display())]
    ScratchUnwritable { path: PathBuf, reason: String },

    #[error("init binary not found at {} (set RAMROOT_INIT_BINARY)", .path.display())]
    MissingInit { path: PathBuf },
}

/// Conditions that stop a launch.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("no kexec utility on the host and none bundled in the image")]
    NoSwitchUtility,

    #[error("aborted by operator at: {gate}")]
    Aborted { gate: String },

    #[error("payload marker not found in {}", .path.display())]
    MarkerNotFound { path: PathBuf },

    #[error("bundled {what} not found in {}", .dir.display())]
    MissingPayload { what: &'static str, dir: PathBuf },

    #[error(
        "kexec -e returned: {reason}\n\
         The host state is now undefined; recover through the physical or \
         out-of-band console"
    )]
    SwitchFailed { reason: String },
}

impl LaunchError {
    pub fn aborted(gate: impl Into<String>) -> Self {
        LaunchError::Aborted { gate: gate.into() }
    }
}

/// Conditions that stop init progression.
#[derive(Error, Debug)]
pub enum InitError {
    #[error("failed to mount {fstype} on {target}: {reason}")]
    MountFailed {
        target: String,
        fstype: String,
        reason: String,
    },
}

/// A runtime condition the booted environment continues through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Degradation {
    NetworkDegraded,
    EphemeralHostKey,
    NoStoragePools,
    PoolModuleUnavailable,
    SshUnavailable,
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Degradation::NetworkDegraded => "network-degraded: no interface configured",
            Degradation::EphemeralHostKey => {
                "ephemeral-host-key: host key fingerprint differs from the original host"
            }
            Degradation::NoStoragePools => "no-storage-pools: no pool was imported",
            Degradation::PoolModuleUnavailable => "pool-module-unavailable: zfs did not load",
            Degradation::SshUnavailable => "ssh-unavailable: dropbear did not start",
        };
        f.write_str(text)
    }
}
