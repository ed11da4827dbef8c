//! Domain Model - Persisted topology and export records
//!
//! Records are long-lived and owned by the [`TopologyStore`](super::ports::TopologyStore).
//! The orchestrator never creates hosts or clusters; it reads them and
//! conditionally mutates their cross-references and export-group membership.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// Identifiers
// =============================================================================

/// Identifier of any persisted resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&String> for ResourceId {
    fn from(s: &String) -> Self {
        Self(s.clone())
    }
}

/// Kinds of persisted resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    ExportGroup,
    ExportMask,
    Host,
    Cluster,
    Initiator,
    IpInterface,
    Vcenter,
    VcenterDataCenter,
    Volume,
    FileShare,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::ExportGroup => write!(f, "ExportGroup"),
            ResourceKind::ExportMask => write!(f, "ExportMask"),
            ResourceKind::Host => write!(f, "Host"),
            ResourceKind::Cluster => write!(f, "Cluster"),
            ResourceKind::Initiator => write!(f, "Initiator"),
            ResourceKind::IpInterface => write!(f, "IpInterface"),
            ResourceKind::Vcenter => write!(f, "Vcenter"),
            ResourceKind::VcenterDataCenter => write!(f, "VcenterDataCenter"),
            ResourceKind::Volume => write!(f, "Volume"),
            ResourceKind::FileShare => write!(f, "FileShare"),
        }
    }
}

// =============================================================================
// Export Groups
// =============================================================================

/// Scope of an export group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportGroupKind {
    Host,
    Cluster,
    Initiator,
}

impl std::fmt::Display for ExportGroupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportGroupKind::Host => write!(f, "host"),
            ExportGroupKind::Cluster => write!(f, "cluster"),
            ExportGroupKind::Initiator => write!(f, "initiator"),
        }
    }
}

/// Storage-array target port an export group is served from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoragePort {
    pub name: String,
    /// Fabric or IP network the port is attached to
    pub network: String,
}

/// A set of volumes exposed to a set of hosts, clusters and initiators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportGroup {
    pub id: ResourceId,
    pub label: String,
    pub kind: ExportGroupKind,
    pub storage_system: ResourceId,
    #[serde(default)]
    pub hosts: BTreeSet<ResourceId>,
    #[serde(default)]
    pub clusters: BTreeSet<ResourceId>,
    #[serde(default)]
    pub initiators: BTreeSet<ResourceId>,
    /// Volume to logical unit number
    #[serde(default)]
    pub volumes: BTreeMap<ResourceId, u32>,
    #[serde(default)]
    pub storage_ports: Vec<StoragePort>,
    #[serde(default)]
    pub export_masks: BTreeSet<ResourceId>,
    #[serde(default)]
    pub inactive: bool,
    /// Bumped by the store on every write
    #[serde(default)]
    pub version: u64,
}

impl ExportGroup {
    pub fn new(
        id: impl Into<ResourceId>,
        label: impl Into<String>,
        kind: ExportGroupKind,
        storage_system: impl Into<ResourceId>,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind,
            storage_system: storage_system.into(),
            hosts: BTreeSet::new(),
            clusters: BTreeSet::new(),
            initiators: BTreeSet::new(),
            volumes: BTreeMap::new(),
            storage_ports: Vec::new(),
            export_masks: BTreeSet::new(),
            inactive: false,
            version: 0,
        }
    }

    /// Networks reachable through this group's storage ports
    pub fn storage_networks(&self) -> BTreeSet<&str> {
        self.storage_ports.iter().map(|p| p.network.as_str()).collect()
    }

    /// Whether the group's scoping membership is empty.
    ///
    /// A host group without hosts, an initiator group without initiators or a
    /// cluster group without clusters exports to nobody and must be deleted.
    pub fn scope_is_empty(&self) -> bool {
        match self.kind {
            ExportGroupKind::Host => self.hosts.is_empty(),
            ExportGroupKind::Cluster => self.clusters.is_empty(),
            ExportGroupKind::Initiator => self.initiators.is_empty(),
        }
    }
}

/// Device-level masking view backing part of an export group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMask {
    pub id: ResourceId,
    pub export_group: ResourceId,
    pub storage_system: ResourceId,
    #[serde(default)]
    pub initiators: BTreeSet<ResourceId>,
    #[serde(default)]
    pub volumes: BTreeSet<ResourceId>,
    #[serde(default)]
    pub inactive: bool,
}

/// Membership change applied to an export group by the block controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportGroupUpdate {
    #[serde(default)]
    pub added_volumes: BTreeMap<ResourceId, u32>,
    #[serde(default)]
    pub removed_volumes: BTreeSet<ResourceId>,
    #[serde(default)]
    pub added_clusters: BTreeSet<ResourceId>,
    #[serde(default)]
    pub removed_clusters: BTreeSet<ResourceId>,
    #[serde(default)]
    pub added_hosts: BTreeSet<ResourceId>,
    #[serde(default)]
    pub removed_hosts: BTreeSet<ResourceId>,
    #[serde(default)]
    pub added_initiators: BTreeSet<ResourceId>,
    #[serde(default)]
    pub removed_initiators: BTreeSet<ResourceId>,
}

impl ExportGroupUpdate {
    pub fn is_empty(&self) -> bool {
        self.added_volumes.is_empty()
            && self.removed_volumes.is_empty()
            && self.added_clusters.is_empty()
            && self.removed_clusters.is_empty()
            && self.added_hosts.is_empty()
            && self.removed_hosts.is_empty()
            && self.added_initiators.is_empty()
            && self.removed_initiators.is_empty()
    }

    /// The update that undoes this one.
    ///
    /// Removed volumes come back without their original LUN, which the
    /// caller must supply through `lun_of` (usually the pre-change group).
    pub fn inverse(&self, lun_of: &BTreeMap<ResourceId, u32>) -> Self {
        Self {
            added_volumes: self
                .removed_volumes
                .iter()
                .map(|v| (v.clone(), lun_of.get(v).copied().unwrap_or_default()))
                .collect(),
            removed_volumes: self.added_volumes.keys().cloned().collect(),
            added_clusters: self.removed_clusters.clone(),
            removed_clusters: self.added_clusters.clone(),
            added_hosts: self.removed_hosts.clone(),
            removed_hosts: self.added_hosts.clone(),
            added_initiators: self.removed_initiators.clone(),
            removed_initiators: self.added_initiators.clone(),
        }
    }

    /// Union another update into this one
    pub fn merge(&mut self, other: &ExportGroupUpdate) {
        self.added_volumes
            .extend(other.added_volumes.iter().map(|(k, v)| (k.clone(), *v)));
        self.removed_volumes.extend(other.removed_volumes.iter().cloned());
        self.added_clusters.extend(other.added_clusters.iter().cloned());
        self.removed_clusters.extend(other.removed_clusters.iter().cloned());
        self.added_hosts.extend(other.added_hosts.iter().cloned());
        self.removed_hosts.extend(other.removed_hosts.iter().cloned());
        self.added_initiators.extend(other.added_initiators.iter().cloned());
        self.removed_initiators.extend(other.removed_initiators.iter().cloned());
    }

    /// Apply removals then additions to a group's membership
    pub fn apply_to(&self, group: &mut ExportGroup) {
        for v in &self.removed_volumes {
            group.volumes.remove(v);
        }
        for c in &self.removed_clusters {
            group.clusters.remove(c);
        }
        for h in &self.removed_hosts {
            group.hosts.remove(h);
        }
        for i in &self.removed_initiators {
            group.initiators.remove(i);
        }
        group
            .volumes
            .extend(self.added_volumes.iter().map(|(k, v)| (k.clone(), *v)));
        group.clusters.extend(self.added_clusters.iter().cloned());
        group.hosts.extend(self.added_hosts.iter().cloned());
        group.initiators.extend(self.added_initiators.iter().cloned());
    }
}

// =============================================================================
// Compute Topology
// =============================================================================

/// Operating system family of a host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostType {
    Esx,
    Linux,
    Windows,
    #[default]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub id: ResourceId,
    pub label: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub host_type: HostType,
    #[serde(default)]
    pub cluster: Option<ResourceId>,
    #[serde(default)]
    pub vcenter_datacenter: Option<ResourceId>,
    /// Blade or rack server the host is provisioned on
    #[serde(default)]
    pub compute_element: Option<String>,
    #[serde(default)]
    pub boot_volume: Option<ResourceId>,
    #[serde(default)]
    pub inactive: bool,
}

impl Host {
    pub fn new(id: impl Into<ResourceId>, hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        Self {
            id: id.into(),
            label: hostname.clone(),
            hostname,
            host_type: HostType::Other,
            cluster: None,
            vcenter_datacenter: None,
            compute_element: None,
            boot_volume: None,
            inactive: false,
        }
    }

    /// ESX hosts managed through a vCenter carry datastores that must be
    /// unmounted before their volumes are unexported.
    pub fn has_managed_datastores(&self) -> bool {
        self.host_type == HostType::Esx && self.vcenter_datacenter.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub id: ResourceId,
    pub label: String,
    #[serde(default)]
    pub vcenter_datacenter: Option<ResourceId>,
    #[serde(default)]
    pub inactive: bool,
}

/// Storage-network protocol of an initiator port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitiatorProtocol {
    Fc,
    Iscsi,
    Nvme,
}

/// Host-side storage-network endpoint, e.g. an HBA port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Initiator {
    pub id: ResourceId,
    pub host: ResourceId,
    /// WWPN or IQN
    pub port: String,
    pub protocol: InitiatorProtocol,
    /// Network the port is logged into, if discovered
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub inactive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpInterface {
    pub id: ResourceId,
    pub host: ResourceId,
    pub address: String,
    #[serde(default)]
    pub inactive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vcenter {
    pub id: ResourceId,
    pub label: String,
    #[serde(default)]
    pub inactive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VcenterDataCenter {
    pub id: ResourceId,
    pub label: String,
    pub vcenter: ResourceId,
    #[serde(default)]
    pub inactive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub id: ResourceId,
    pub label: String,
    pub storage_system: ResourceId,
    #[serde(default)]
    pub wwn: String,
    #[serde(default)]
    pub inactive: bool,
}

// =============================================================================
// File Shares
// =============================================================================

/// One export rule of a file share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileExportRule {
    /// Exported path (share root or sub-directory)
    pub path: String,
    #[serde(default = "default_security")]
    pub security: String,
    #[serde(default = "default_permissions")]
    pub permissions: String,
    #[serde(default = "default_root_user")]
    pub root_user: String,
    /// Client endpoints: hostnames or IP addresses
    #[serde(default)]
    pub endpoints: BTreeSet<String>,
}

fn default_security() -> String {
    "sys".to_string()
}

fn default_permissions() -> String {
    "rw".to_string()
}

fn default_root_user() -> String {
    "nobody".to_string()
}

impl FileExportRule {
    pub fn new(path: impl Into<String>, endpoints: impl IntoIterator<Item = String>) -> Self {
        Self {
            path: path.into(),
            security: default_security(),
            permissions: default_permissions(),
            root_user: default_root_user(),
            endpoints: endpoints.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileShare {
    pub id: ResourceId,
    pub label: String,
    pub storage_device: ResourceId,
    #[serde(default)]
    pub mount_path: String,
    #[serde(default)]
    pub exports: Vec<FileExportRule>,
    #[serde(default)]
    pub inactive: bool,
}

impl FileShare {
    pub fn exported_to(&self, endpoint: &str) -> bool {
        self.exports.iter().any(|r| r.endpoints.contains(endpoint))
    }
}

// =============================================================================
// Operation Records
// =============================================================================

/// Terminal or pending status of an operation on a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Ready,
    Error,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Pending)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Pending => write!(f, "pending"),
            OperationStatus::Ready => write!(f, "ready"),
            OperationStatus::Error => write!(f, "error"),
        }
    }
}

/// Status of one operation, persisted on each affected resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub op_id: String,
    pub status: OperationStatus,
    #[serde(default)]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl OperationRecord {
    pub fn new(op_id: impl Into<String>, status: OperationStatus, message: Option<String>) -> Self {
        Self {
            op_id: op_id.into(),
            status,
            message,
            updated_at: Utc::now(),
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Serializable dump of the whole topology, used to seed and inspect stores
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopologySnapshot {
    pub export_groups: Vec<ExportGroup>,
    pub export_masks: Vec<ExportMask>,
    pub hosts: Vec<Host>,
    pub clusters: Vec<Cluster>,
    pub initiators: Vec<Initiator>,
    pub ip_interfaces: Vec<IpInterface>,
    pub vcenters: Vec<Vcenter>,
    pub datacenters: Vec<VcenterDataCenter>,
    pub volumes: Vec<Volume>,
    pub file_shares: Vec<FileShare>,
}
