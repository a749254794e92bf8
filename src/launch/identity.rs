//! Host identity injected into the scratch image as an overlay.

use anyhow::Result;
use std::net::IpAddr;
use std::path::Path;

use super::ssh::{HostKeys, TrustedKeys};
use crate::config::EPHEMERAL_KEY_MARKER;
use crate::image::{append_overlay, OverlayFile};
use crate::network::dns::render_resolv_conf;
use crate::network::{NetworkIdentity, NETWORK_CONFIG_PATH};

pub const AUTHORIZED_KEYS_PATH: &str = "/root/.ssh/authorized_keys";

/// Everything captured from the host for the booted environment.
#[derive(Debug, Clone)]
pub struct Identity {
    pub host_keys: HostKeys,
    pub trusted: TrustedKeys,
    pub nameservers: Vec<IpAddr>,
    pub network: NetworkIdentity,
}

impl Identity {
    pub fn overlay_files(&self) -> Result<Vec<OverlayFile>> {
        let mut files = Vec::new();
        for key in &self.host_keys.keys {
            files.push(OverlayFile::new(
                &key.algorithm.dropbear_path(),
                0o600,
                key.key.clone(),
            ));
        }
        if self.host_keys.ephemeral {
            files.push(OverlayFile::new(
                EPHEMERAL_KEY_MARKER,
                0o644,
                "host key generated at launch\n",
            ));
        }
        files.push(OverlayFile::new(
            AUTHORIZED_KEYS_PATH,
            0o600,
            self.trusted.authorized_keys(),
        ));
        files.push(OverlayFile::new(
            "/etc/resolv.conf",
            0o644,
            render_resolv_conf(&self.nameservers),
        ));
        files.push(OverlayFile::new(
            NETWORK_CONFIG_PATH,
            0o644,
            self.network.to_json()?,
        ));
        Ok(files)
    }

    /// Append the identity overlay to `image`. Only that file changes.
    pub fn inject(&self, image: &Path) -> Result<()> {
        let files = self.overlay_files()?;
        tracing::info!(files = files.len(), image = %image.display(), "injecting host identity");
        append_overlay(image, &files)
    }
}
