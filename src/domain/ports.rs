//! Domain Ports - Trait definitions for the orchestrator's collaborators
//!
//! These traits define the boundaries between reconciliation/saga logic and
//! the external systems it drives: the persistent store, the block and file
//! export controllers, the virtualization host API and the filesystem mount
//! agent. Adapters implement these traits to provide concrete functionality.

use crate::domain::model::{
    Cluster, ExportGroup, ExportGroupUpdate, ExportMask, FileExportRule, FileShare, Host,
    Initiator, IpInterface, OperationRecord, ResourceId, ResourceKind, Vcenter,
    VcenterDataCenter, Volume,
};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

// =============================================================================
// Persistent Store Port
// =============================================================================

/// Indexed predicates the store can answer. Only active records match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constraint {
    ExportGroupsByHost(ResourceId),
    ExportGroupsByCluster(ResourceId),
    ExportGroupsByInitiator(ResourceId),
    ExportMasksByGroup(ResourceId),
    InitiatorsByHost(ResourceId),
    IpInterfacesByHost(ResourceId),
    HostsByCluster(ResourceId),
    HostsByDatacenter(ResourceId),
    ClustersByDatacenter(ResourceId),
    DatacentersByVcenter(ResourceId),
    FileSharesByEndpoint(String),
}

/// Port for the persistent object store.
///
/// Reads reflect the store's current, non-transactional view. Lookups by id
/// return inactive (soft-deleted) records too; callers decide what that means.
#[async_trait]
pub trait TopologyStore: Send + Sync {
    async fn export_group(&self, id: &ResourceId) -> Result<Option<ExportGroup>>;
    async fn export_mask(&self, id: &ResourceId) -> Result<Option<ExportMask>>;
    async fn host(&self, id: &ResourceId) -> Result<Option<Host>>;
    async fn cluster(&self, id: &ResourceId) -> Result<Option<Cluster>>;
    async fn initiator(&self, id: &ResourceId) -> Result<Option<Initiator>>;
    async fn ip_interface(&self, id: &ResourceId) -> Result<Option<IpInterface>>;
    async fn vcenter(&self, id: &ResourceId) -> Result<Option<Vcenter>>;
    async fn datacenter(&self, id: &ResourceId) -> Result<Option<VcenterDataCenter>>;
    async fn volume(&self, id: &ResourceId) -> Result<Option<Volume>>;
    async fn file_share(&self, id: &ResourceId) -> Result<Option<FileShare>>;

    /// Ids of active records matching the constraint
    async fn query(&self, constraint: &Constraint) -> Result<Vec<ResourceId>>;

    /// Last-writer-wins write; returns the new version
    async fn put_export_group(&self, group: ExportGroup) -> Result<u64>;

    /// Write only if the stored version still equals `expected_version`
    async fn compare_and_put_export_group(
        &self,
        group: ExportGroup,
        expected_version: u64,
    ) -> Result<u64>;

    async fn put_export_mask(&self, mask: ExportMask) -> Result<()>;
    async fn put_host(&self, host: Host) -> Result<()>;
    async fn put_cluster(&self, cluster: Cluster) -> Result<()>;
    async fn put_initiator(&self, initiator: Initiator) -> Result<()>;
    async fn put_ip_interface(&self, ip_interface: IpInterface) -> Result<()>;
    async fn put_vcenter(&self, vcenter: Vcenter) -> Result<()>;
    async fn put_datacenter(&self, datacenter: VcenterDataCenter) -> Result<()>;
    async fn put_volume(&self, volume: Volume) -> Result<()>;
    async fn put_file_share(&self, share: FileShare) -> Result<()>;

    /// Physically remove an export mask row
    async fn remove_export_mask(&self, id: &ResourceId) -> Result<()>;

    /// Soft delete: set the record's `inactive` flag
    async fn mark_for_deletion(&self, kind: ResourceKind, id: &ResourceId) -> Result<()>;

    /// Persist an operation's status onto a resource
    async fn record_operation(
        &self,
        kind: ResourceKind,
        id: &ResourceId,
        record: OperationRecord,
    ) -> Result<()>;

    async fn operation(&self, id: &ResourceId, op_id: &str) -> Result<Option<OperationRecord>>;
}

// =============================================================================
// Asynchronous Downstream Tasks
// =============================================================================

/// State of an asynchronous downstream task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "reason")]
pub enum TaskState {
    Queued,
    Running,
    Ready,
    Error(String),
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Ready | TaskState::Error(_) | TaskState::Cancelled)
    }
}

/// Handle on an asynchronous downstream task; completion is signalled
/// through the watch channel rather than polled from shared state.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub task_id: String,
    pub state: watch::Receiver<TaskState>,
}

// =============================================================================
// Block Export Controller Port
// =============================================================================

/// Port for the block export controller
#[async_trait]
pub trait BlockExportController: Send + Sync {
    /// Apply a membership update to an export group on the array.
    ///
    /// With `expected_version` set the controller rejects the update if the
    /// group changed since it was read.
    async fn export_group_update(
        &self,
        group: &ResourceId,
        update: &ExportGroupUpdate,
        expected_version: Option<u64>,
        op_id: &str,
    ) -> Result<()>;

    /// Export zero volumes to zero endpoints and retire the group
    async fn export_group_delete(
        &self,
        group: &ResourceId,
        expected_version: Option<u64>,
        op_id: &str,
    ) -> Result<()>;

    fn controller_name(&self) -> &str;
}

// =============================================================================
// File Export Controller Port
// =============================================================================

/// Port for the file export controller. All operations are asynchronous.
#[async_trait]
pub trait FileExportController: Send + Sync {
    /// Add or replace the given rules (matched by path)
    async fn export(
        &self,
        device: &ResourceId,
        share: &ResourceId,
        rules: &[FileExportRule],
        op_id: &str,
    ) -> Result<TaskHandle>;

    /// Remove the given rules (matched by path)
    async fn unexport(
        &self,
        device: &ResourceId,
        share: &ResourceId,
        rules: &[FileExportRule],
        op_id: &str,
    ) -> Result<TaskHandle>;

    /// Replace the share's rule set
    async fn update_export(
        &self,
        device: &ResourceId,
        share: &ResourceId,
        rules: &[FileExportRule],
        op_id: &str,
    ) -> Result<TaskHandle>;

    /// Completion signal of a previously started task
    fn subscribe(&self, task_id: &str) -> Option<watch::Receiver<TaskState>>;

    /// Native cancel of a running task
    async fn cancel(&self, task_id: &str) -> Result<()>;
}

// =============================================================================
// Virtualization Host Port
// =============================================================================

/// Port for the virtualization host API (datastores on ESX hosts)
#[async_trait]
pub trait HostAdapter: Send + Sync {
    /// Fail if the datastore on `volume` cannot be safely removed from `host`
    async fn verify_datastore(&self, host: &ResourceId, volume: &ResourceId) -> Result<()>;

    async fn unmount_and_detach(&self, host: &ResourceId, volume: &ResourceId) -> Result<()>;

    async fn attach_and_mount(&self, host: &ResourceId, volume: &ResourceId) -> Result<()>;

    async fn set_storage_io_control(
        &self,
        host: &ResourceId,
        volume: &ResourceId,
        enabled: bool,
    ) -> Result<TaskHandle>;

    async fn cancel_task(&self, task_id: &str) -> Result<()>;

    async fn set_san_boot_target(
        &self,
        host: &ResourceId,
        compute_element: &str,
        volume: Option<&ResourceId>,
    ) -> Result<()>;
}

// =============================================================================
// Filesystem Mount Port
// =============================================================================

/// One `/etc/fstab` line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FstabEntry {
    pub device: String,
    pub mount_path: String,
    pub fs_type: String,
    pub options: String,
}

/// Port for the host filesystem mount agent
#[async_trait]
pub trait MountAdapter: Send + Sync {
    /// Check the mount point is free (or, with `expect_mounted`, in use)
    async fn verify_mount_point(
        &self,
        host: &ResourceId,
        path: &str,
        expect_mounted: bool,
    ) -> Result<()>;

    /// Returns false when the directory already existed
    async fn create_directory(&self, host: &ResourceId, path: &str) -> Result<bool>;

    async fn delete_directory(&self, host: &ResourceId, path: &str) -> Result<()>;

    async fn add_fstab_entry(&self, host: &ResourceId, entry: &FstabEntry) -> Result<()>;

    /// Remove and return the entry for `path`
    async fn remove_fstab_entry(&self, host: &ResourceId, path: &str)
        -> Result<Option<FstabEntry>>;

    async fn mount_device(&self, host: &ResourceId, path: &str) -> Result<()>;

    async fn unmount_device(&self, host: &ResourceId, path: &str) -> Result<()>;
}

// =============================================================================
// Connectivity Port
// =============================================================================

/// Decides whether an initiator can reach a group's storage ports
pub trait ConnectivityChecker: Send + Sync {
    fn is_connected(&self, initiator: &Initiator, group: &ExportGroup) -> bool;
}

/// Connectivity by network membership: an initiator is connected when it is
/// logged into the network of at least one of the group's storage ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkConnectivity;

impl ConnectivityChecker for NetworkConnectivity {
    fn is_connected(&self, initiator: &Initiator, group: &ExportGroup) -> bool {
        match &initiator.network {
            Some(network) => group.storage_networks().contains(network.as_str()),
            None => false,
        }
    }
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type TopologyStoreRef = Arc<dyn TopologyStore>;
pub type BlockExportControllerRef = Arc<dyn BlockExportController>;
pub type FileExportControllerRef = Arc<dyn FileExportController>;
pub type HostAdapterRef = Arc<dyn HostAdapter>;
pub type MountAdapterRef = Arc<dyn MountAdapter>;
pub type ConnectivityCheckerRef = Arc<dyn ConnectivityChecker>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{ExportGroupKind, InitiatorProtocol, StoragePort};

    fn initiator(network: Option<&str>) -> Initiator {
        Initiator {
            id: "i1".into(),
            host: "h1".into(),
            port: "10:00:00:00:c9:00:00:01".into(),
            protocol: InitiatorProtocol::Fc,
            network: network.map(str::to_string),
            inactive: false,
        }
    }

    #[test]
    fn test_network_connectivity() {
        let mut group = ExportGroup::new("eg-1", "eg", ExportGroupKind::Host, "array-1");
        group.storage_ports.push(StoragePort {
            name: "FA-1A".into(),
            network: "fabric-a".into(),
        });

        let checker = NetworkConnectivity;
        assert!(checker.is_connected(&initiator(Some("fabric-a")), &group));
        assert!(!checker.is_connected(&initiator(Some("fabric-b")), &group));
        assert!(!checker.is_connected(&initiator(None), &group));
    }

    #[test]
    fn test_task_state_terminal() {
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Ready.is_terminal());
        assert!(TaskState::Error("boom".into()).is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
    }
}
