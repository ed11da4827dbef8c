//! Virtualization Host Adapter (in-memory)
//!
//! Tracks datastores per (host, volume), the storage I/O control setting of
//! each datastore and SAN boot targets per host.

use super::FailureInjector;
use crate::domain::model::ResourceId;
use crate::domain::ports::{HostAdapter, TaskHandle, TaskState};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEVICE: &str = "vcenter";

/// Datastore backed by one exported volume on one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatastoreState {
    pub mounted: bool,
    pub storage_io_control: bool,
    /// Virtual machines still running from the datastore
    pub in_use: bool,
}

impl Default for DatastoreState {
    fn default() -> Self {
        Self {
            mounted: true,
            storage_io_control: true,
            in_use: false,
        }
    }
}

type DatastoreKey = (ResourceId, ResourceId);

#[derive(Default)]
pub struct InMemoryHostAdapter {
    failures: FailureInjector,
    datastores: RwLock<BTreeMap<DatastoreKey, DatastoreState>>,
    san_boot_targets: RwLock<BTreeMap<ResourceId, Option<ResourceId>>>,
    tasks: DashMap<String, Arc<watch::Sender<TaskState>>>,
    stall_storage_io_control: AtomicBool,
}

impl InMemoryHostAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> &FailureInjector {
        &self.failures
    }

    /// Register a mounted datastore
    pub async fn add_datastore(&self, host: &ResourceId, volume: &ResourceId, state: DatastoreState) {
        self.datastores
            .write()
            .await
            .insert((host.clone(), volume.clone()), state);
    }

    pub async fn datastore(&self, host: &ResourceId, volume: &ResourceId) -> Option<DatastoreState> {
        self.datastores
            .read()
            .await
            .get(&(host.clone(), volume.clone()))
            .cloned()
    }

    pub async fn san_boot_target(&self, host: &ResourceId) -> Option<ResourceId> {
        self.san_boot_targets
            .read()
            .await
            .get(host)
            .cloned()
            .flatten()
    }

    /// While set, storage I/O control tasks never finish
    pub fn set_stall_storage_io_control(&self, stall: bool) {
        self.stall_storage_io_control.store(stall, Ordering::SeqCst);
    }

    pub fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.tasks.get(task_id).map(|tx| tx.borrow().clone())
    }
}

#[async_trait]
impl HostAdapter for InMemoryHostAdapter {
    async fn verify_datastore(&self, host: &ResourceId, volume: &ResourceId) -> Result<()> {
        self.failures.check(DEVICE, "verify_datastore")?;
        match self.datastore(host, volume).await {
            Some(ds) if ds.in_use => Err(Error::DeviceOperationFailed {
                device: DEVICE.into(),
                operation: "verify_datastore".into(),
                reason: format!("datastore on volume {} is in use on host {}", volume, host),
            }),
            _ => Ok(()),
        }
    }

    async fn unmount_and_detach(&self, host: &ResourceId, volume: &ResourceId) -> Result<()> {
        self.failures.check(DEVICE, "unmount_and_detach")?;
        info!("Unmounting and detaching datastore of volume {} on host {}", volume, host);
        let mut datastores = self.datastores.write().await;
        if let Some(ds) = datastores.get_mut(&(host.clone(), volume.clone())) {
            ds.mounted = false;
        }
        Ok(())
    }

    async fn attach_and_mount(&self, host: &ResourceId, volume: &ResourceId) -> Result<()> {
        self.failures.check(DEVICE, "attach_and_mount")?;
        info!("Attaching and mounting datastore of volume {} on host {}", volume, host);
        self.datastores
            .write()
            .await
            .entry((host.clone(), volume.clone()))
            .or_default()
            .mounted = true;
        Ok(())
    }

    async fn set_storage_io_control(
        &self,
        host: &ResourceId,
        volume: &ResourceId,
        enabled: bool,
    ) -> Result<TaskHandle> {
        self.failures.check(DEVICE, "set_storage_io_control")?;
        let task_id = format!("sioc-{}", Uuid::new_v4());
        let (tx, rx) = watch::channel(TaskState::Running);
        let tx = Arc::new(tx);
        self.tasks.insert(task_id.clone(), tx.clone());

        if self.stall_storage_io_control.load(Ordering::SeqCst) {
            debug!("Storage I/O control task {} stalled", task_id);
        } else {
            if let Some(ds) = self
                .datastores
                .write()
                .await
                .get_mut(&(host.clone(), volume.clone()))
            {
                ds.storage_io_control = enabled;
            }
            debug!(
                "Storage I/O control {} for volume {} on host {}",
                if enabled { "enabled" } else { "disabled" },
                volume,
                host
            );
            tx.send_replace(TaskState::Ready);
        }
        Ok(TaskHandle { task_id, state: rx })
    }

    async fn cancel_task(&self, task_id: &str) -> Result<()> {
        self.failures.check(DEVICE, "cancel_task")?;
        match self.tasks.get(task_id) {
            Some(tx) => {
                tx.send_if_modified(|state| {
                    if state.is_terminal() {
                        false
                    } else {
                        *state = TaskState::Cancelled;
                        true
                    }
                });
                Ok(())
            }
            None => {
                warn!("Cancel requested for unknown host task {}", task_id);
                Err(Error::not_found("HostTask", task_id))
            }
        }
    }

    async fn set_san_boot_target(
        &self,
        host: &ResourceId,
        compute_element: &str,
        volume: Option<&ResourceId>,
    ) -> Result<()> {
        self.failures.check(DEVICE, "set_san_boot_target")?;
        info!(
            "Setting SAN boot target of host {} on compute element {} to {:?}",
            host, compute_element, volume
        );
        self.san_boot_targets
            .write()
            .await
            .insert(host.clone(), volume.cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_datastore_in_use_fails_verification() {
        let adapter = InMemoryHostAdapter::new();
        let (host, volume) = (ResourceId::from("h1"), ResourceId::from("vol-1"));
        adapter
            .add_datastore(&host, &volume, DatastoreState {
                in_use: true,
                ..Default::default()
            })
            .await;
        assert!(adapter.verify_datastore(&host, &volume).await.is_err());
        assert!(adapter.verify_datastore(&host, &"vol-2".into()).await.is_ok());
    }

    #[tokio::test]
    async fn test_detach_and_reattach() {
        let adapter = InMemoryHostAdapter::new();
        let (host, volume) = (ResourceId::from("h1"), ResourceId::from("vol-1"));
        adapter.add_datastore(&host, &volume, DatastoreState::default()).await;

        adapter.unmount_and_detach(&host, &volume).await.unwrap();
        assert!(!adapter.datastore(&host, &volume).await.unwrap().mounted);
        adapter.attach_and_mount(&host, &volume).await.unwrap();
        assert!(adapter.datastore(&host, &volume).await.unwrap().mounted);
    }

    #[tokio::test]
    async fn test_stalled_storage_io_control_stays_running() {
        let adapter = InMemoryHostAdapter::new();
        adapter.set_stall_storage_io_control(true);
        let handle = adapter
            .set_storage_io_control(&"h1".into(), &"vol-1".into(), false)
            .await
            .unwrap();
        assert_eq!(*handle.state.borrow(), TaskState::Running);

        adapter.cancel_task(&handle.task_id).await.unwrap();
        assert_eq!(adapter.task_state(&handle.task_id), Some(TaskState::Cancelled));
    }
}
