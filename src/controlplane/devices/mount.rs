//! Filesystem Mount Adapter (in-memory)
//!
//! Models the host-visible filesystem state the mount chains touch:
//! directories, `/etc/fstab` entries and active mounts.

use super::FailureInjector;
use crate::domain::model::ResourceId;
use crate::domain::ports::{FstabEntry, MountAdapter};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;
use tracing::{debug, info};

const DEVICE: &str = "mount-agent";

/// Filesystem state of one host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostFilesystem {
    pub directories: BTreeSet<String>,
    /// Mount path to entry
    pub fstab: BTreeMap<String, FstabEntry>,
    pub mounted: BTreeSet<String>,
}

#[derive(Default)]
pub struct InMemoryMountAdapter {
    failures: FailureInjector,
    hosts: RwLock<BTreeMap<ResourceId, HostFilesystem>>,
}

fn failed(operation: &str, reason: String) -> Error {
    Error::DeviceOperationFailed {
        device: DEVICE.into(),
        operation: operation.into(),
        reason,
    }
}

impl InMemoryMountAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> &FailureInjector {
        &self.failures
    }

    /// Snapshot of a host's filesystem state
    pub async fn filesystem(&self, host: &ResourceId) -> HostFilesystem {
        self.hosts.read().await.get(host).cloned().unwrap_or_default()
    }

    /// Seed an existing, mounted filesystem
    pub async fn seed_mount(&self, host: &ResourceId, entry: FstabEntry) {
        let mut hosts = self.hosts.write().await;
        let fs = hosts.entry(host.clone()).or_default();
        fs.directories.insert(entry.mount_path.clone());
        fs.mounted.insert(entry.mount_path.clone());
        fs.fstab.insert(entry.mount_path.clone(), entry);
    }

    /// Seed a plain directory with nothing mounted on it
    pub async fn seed_directory(&self, host: &ResourceId, path: &str) {
        self.hosts
            .write()
            .await
            .entry(host.clone())
            .or_default()
            .directories
            .insert(path.to_string());
    }
}

#[async_trait]
impl MountAdapter for InMemoryMountAdapter {
    async fn verify_mount_point(
        &self,
        host: &ResourceId,
        path: &str,
        expect_mounted: bool,
    ) -> Result<()> {
        self.failures.check(DEVICE, "verify_mount_point")?;
        let hosts = self.hosts.read().await;
        let (mounted, in_fstab) = hosts
            .get(host)
            .map(|fs| (fs.mounted.contains(path), fs.fstab.contains_key(path)))
            .unwrap_or((false, false));

        if expect_mounted && !mounted {
            return Err(failed("verify_mount_point", format!("{} is not mounted on host {}", path, host)));
        }
        if !expect_mounted && (mounted || in_fstab) {
            return Err(failed("verify_mount_point", format!("{} is already in use on host {}", path, host)));
        }
        Ok(())
    }

    async fn create_directory(&self, host: &ResourceId, path: &str) -> Result<bool> {
        self.failures.check(DEVICE, "create_directory")?;
        debug!("Creating directory {} on host {}", path, host);
        let created = self
            .hosts
            .write()
            .await
            .entry(host.clone())
            .or_default()
            .directories
            .insert(path.to_string());
        Ok(created)
    }

    async fn delete_directory(&self, host: &ResourceId, path: &str) -> Result<()> {
        self.failures.check(DEVICE, "delete_directory")?;
        let mut hosts = self.hosts.write().await;
        let fs = hosts.entry(host.clone()).or_default();
        if fs.mounted.contains(path) {
            return Err(failed("delete_directory", format!("{} is still mounted on host {}", path, host)));
        }
        debug!("Deleting directory {} on host {}", path, host);
        fs.directories.remove(path);
        Ok(())
    }

    async fn add_fstab_entry(&self, host: &ResourceId, entry: &FstabEntry) -> Result<()> {
        self.failures.check(DEVICE, "add_fstab_entry")?;
        debug!("Adding fstab entry {} -> {} on host {}", entry.device, entry.mount_path, host);
        self.hosts
            .write()
            .await
            .entry(host.clone())
            .or_default()
            .fstab
            .insert(entry.mount_path.clone(), entry.clone());
        Ok(())
    }

    async fn remove_fstab_entry(
        &self,
        host: &ResourceId,
        path: &str,
    ) -> Result<Option<FstabEntry>> {
        self.failures.check(DEVICE, "remove_fstab_entry")?;
        debug!("Removing fstab entry {} on host {}", path, host);
        Ok(self
            .hosts
            .write()
            .await
            .get_mut(host)
            .and_then(|fs| fs.fstab.remove(path)))
    }

    async fn mount_device(&self, host: &ResourceId, path: &str) -> Result<()> {
        self.failures.check(DEVICE, "mount_device")?;
        let mut hosts = self.hosts.write().await;
        let fs = hosts.entry(host.clone()).or_default();
        if !fs.directories.contains(path) {
            return Err(failed("mount_device", format!("mount point {} does not exist on host {}", path, host)));
        }
        let Some(entry) = fs.fstab.get(path) else {
            return Err(failed("mount_device", format!("no fstab entry for {} on host {}", path, host)));
        };
        info!("Mounting {} at {} on host {}", entry.device, path, host);
        fs.mounted.insert(path.to_string());
        Ok(())
    }

    async fn unmount_device(&self, host: &ResourceId, path: &str) -> Result<()> {
        self.failures.check(DEVICE, "unmount_device")?;
        info!("Unmounting {} on host {}", path, host);
        if let Some(fs) = self.hosts.write().await.get_mut(host) {
            fs.mounted.remove(path);
        }
        Ok(())
    }
}
