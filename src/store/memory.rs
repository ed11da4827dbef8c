//! In-Memory Topology Store
//!
//! A single-process implementation of [`TopologyStore`] backed by ordered
//! tables behind a `parking_lot` lock. Writes are last-writer-wins unless the
//! caller uses the versioned export-group write.

use crate::domain::model::{
    Cluster, ExportGroup, ExportMask, FileShare, Host, Initiator, IpInterface, OperationRecord,
    ResourceId, ResourceKind, TopologySnapshot, Vcenter, VcenterDataCenter, Volume,
};
use crate::domain::ports::{Constraint, TopologyStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Tables
// =============================================================================

#[derive(Debug, Default)]
struct Tables {
    export_groups: BTreeMap<ResourceId, ExportGroup>,
    export_masks: BTreeMap<ResourceId, ExportMask>,
    hosts: BTreeMap<ResourceId, Host>,
    clusters: BTreeMap<ResourceId, Cluster>,
    initiators: BTreeMap<ResourceId, Initiator>,
    ip_interfaces: BTreeMap<ResourceId, IpInterface>,
    vcenters: BTreeMap<ResourceId, Vcenter>,
    datacenters: BTreeMap<ResourceId, VcenterDataCenter>,
    volumes: BTreeMap<ResourceId, Volume>,
    file_shares: BTreeMap<ResourceId, FileShare>,
    /// Resource id -> op id -> record
    operations: BTreeMap<ResourceId, BTreeMap<String, OperationRecord>>,
}

fn keys_where<T>(table: &BTreeMap<ResourceId, T>, pred: impl Fn(&T) -> bool) -> Vec<ResourceId> {
    table
        .iter()
        .filter(|(_, record)| pred(record))
        .map(|(id, _)| id.clone())
        .collect()
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// In-memory persistent store
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a store seeded from a snapshot
    pub fn from_snapshot(snapshot: TopologySnapshot) -> Arc<Self> {
        let store = Self::default();
        {
            let mut t = store.tables.write();
            t.export_groups = snapshot.export_groups.into_iter().map(|r| (r.id.clone(), r)).collect();
            t.export_masks = snapshot.export_masks.into_iter().map(|r| (r.id.clone(), r)).collect();
            t.hosts = snapshot.hosts.into_iter().map(|r| (r.id.clone(), r)).collect();
            t.clusters = snapshot.clusters.into_iter().map(|r| (r.id.clone(), r)).collect();
            t.initiators = snapshot.initiators.into_iter().map(|r| (r.id.clone(), r)).collect();
            t.ip_interfaces = snapshot.ip_interfaces.into_iter().map(|r| (r.id.clone(), r)).collect();
            t.vcenters = snapshot.vcenters.into_iter().map(|r| (r.id.clone(), r)).collect();
            t.datacenters = snapshot.datacenters.into_iter().map(|r| (r.id.clone(), r)).collect();
            t.volumes = snapshot.volumes.into_iter().map(|r| (r.id.clone(), r)).collect();
            t.file_shares = snapshot.file_shares.into_iter().map(|r| (r.id.clone(), r)).collect();
        }
        Arc::new(store)
    }

    /// Load a YAML (or JSON, which is valid YAML) snapshot file
    pub fn load(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let snapshot: TopologySnapshot = serde_yaml::from_str(&raw)?;
        info!(
            "Loaded topology snapshot from {}: {} export groups, {} hosts",
            path.display(),
            snapshot.export_groups.len(),
            snapshot.hosts.len()
        );
        Ok(Self::from_snapshot(snapshot))
    }

    /// Dump the current contents
    pub fn snapshot(&self) -> TopologySnapshot {
        let t = self.tables.read();
        TopologySnapshot {
            export_groups: t.export_groups.values().cloned().collect(),
            export_masks: t.export_masks.values().cloned().collect(),
            hosts: t.hosts.values().cloned().collect(),
            clusters: t.clusters.values().cloned().collect(),
            initiators: t.initiators.values().cloned().collect(),
            ip_interfaces: t.ip_interfaces.values().cloned().collect(),
            vcenters: t.vcenters.values().cloned().collect(),
            datacenters: t.datacenters.values().cloned().collect(),
            volumes: t.volumes.values().cloned().collect(),
            file_shares: t.file_shares.values().cloned().collect(),
        }
    }
}

#[async_trait]
impl TopologyStore for InMemoryStore {
    async fn export_group(&self, id: &ResourceId) -> Result<Option<ExportGroup>> {
        Ok(self.tables.read().export_groups.get(id).cloned())
    }

    async fn export_mask(&self, id: &ResourceId) -> Result<Option<ExportMask>> {
        Ok(self.tables.read().export_masks.get(id).cloned())
    }

    async fn host(&self, id: &ResourceId) -> Result<Option<Host>> {
        Ok(self.tables.read().hosts.get(id).cloned())
    }

    async fn cluster(&self, id: &ResourceId) -> Result<Option<Cluster>> {
        Ok(self.tables.read().clusters.get(id).cloned())
    }

    async fn initiator(&self, id: &ResourceId) -> Result<Option<Initiator>> {
        Ok(self.tables.read().initiators.get(id).cloned())
    }

    async fn ip_interface(&self, id: &ResourceId) -> Result<Option<IpInterface>> {
        Ok(self.tables.read().ip_interfaces.get(id).cloned())
    }

    async fn vcenter(&self, id: &ResourceId) -> Result<Option<Vcenter>> {
        Ok(self.tables.read().vcenters.get(id).cloned())
    }

    async fn datacenter(&self, id: &ResourceId) -> Result<Option<VcenterDataCenter>> {
        Ok(self.tables.read().datacenters.get(id).cloned())
    }

    async fn volume(&self, id: &ResourceId) -> Result<Option<Volume>> {
        Ok(self.tables.read().volumes.get(id).cloned())
    }

    async fn file_share(&self, id: &ResourceId) -> Result<Option<FileShare>> {
        Ok(self.tables.read().file_shares.get(id).cloned())
    }

    async fn query(&self, constraint: &Constraint) -> Result<Vec<ResourceId>> {
        let t = self.tables.read();
        let ids = match constraint {
            Constraint::ExportGroupsByHost(host) => {
                keys_where(&t.export_groups, |g| !g.inactive && g.hosts.contains(host))
            }
            Constraint::ExportGroupsByCluster(cluster) => {
                keys_where(&t.export_groups, |g| !g.inactive && g.clusters.contains(cluster))
            }
            Constraint::ExportGroupsByInitiator(initiator) => keys_where(&t.export_groups, |g| {
                !g.inactive && g.initiators.contains(initiator)
            }),
            Constraint::ExportMasksByGroup(group) => {
                keys_where(&t.export_masks, |m| !m.inactive && &m.export_group == group)
            }
            Constraint::InitiatorsByHost(host) => {
                keys_where(&t.initiators, |i| !i.inactive && &i.host == host)
            }
            Constraint::IpInterfacesByHost(host) => {
                keys_where(&t.ip_interfaces, |i| !i.inactive && &i.host == host)
            }
            Constraint::HostsByCluster(cluster) => {
                keys_where(&t.hosts, |h| !h.inactive && h.cluster.as_ref() == Some(cluster))
            }
            Constraint::HostsByDatacenter(dc) => keys_where(&t.hosts, |h| {
                !h.inactive && h.vcenter_datacenter.as_ref() == Some(dc)
            }),
            Constraint::ClustersByDatacenter(dc) => keys_where(&t.clusters, |c| {
                !c.inactive && c.vcenter_datacenter.as_ref() == Some(dc)
            }),
            Constraint::DatacentersByVcenter(vcenter) => {
                keys_where(&t.datacenters, |d| !d.inactive && &d.vcenter == vcenter)
            }
            Constraint::FileSharesByEndpoint(endpoint) => {
                keys_where(&t.file_shares, |s| !s.inactive && s.exported_to(endpoint))
            }
        };
        debug!("Query {:?} matched {} records", constraint, ids.len());
        Ok(ids)
    }

    async fn put_export_group(&self, mut group: ExportGroup) -> Result<u64> {
        let mut t = self.tables.write();
        let current = t.export_groups.get(&group.id).map(|g| g.version).unwrap_or(0);
        group.version = current + 1;
        let version = group.version;
        t.export_groups.insert(group.id.clone(), group);
        Ok(version)
    }

    async fn compare_and_put_export_group(
        &self,
        mut group: ExportGroup,
        expected_version: u64,
    ) -> Result<u64> {
        let mut t = self.tables.write();
        let current = t.export_groups.get(&group.id).map(|g| g.version).unwrap_or(0);
        if current != expected_version {
            return Err(Error::VersionConflict {
                group: group.id.to_string(),
                expected: expected_version,
                actual: current,
            });
        }
        group.version = current + 1;
        let version = group.version;
        t.export_groups.insert(group.id.clone(), group);
        Ok(version)
    }

    async fn put_export_mask(&self, mask: ExportMask) -> Result<()> {
        self.tables.write().export_masks.insert(mask.id.clone(), mask);
        Ok(())
    }

    async fn put_host(&self, host: Host) -> Result<()> {
        self.tables.write().hosts.insert(host.id.clone(), host);
        Ok(())
    }

    async fn put_cluster(&self, cluster: Cluster) -> Result<()> {
        self.tables.write().clusters.insert(cluster.id.clone(), cluster);
        Ok(())
    }

    async fn put_initiator(&self, initiator: Initiator) -> Result<()> {
        self.tables.write().initiators.insert(initiator.id.clone(), initiator);
        Ok(())
    }

    async fn put_ip_interface(&self, ip_interface: IpInterface) -> Result<()> {
        self.tables
            .write()
            .ip_interfaces
            .insert(ip_interface.id.clone(), ip_interface);
        Ok(())
    }

    async fn put_vcenter(&self, vcenter: Vcenter) -> Result<()> {
        self.tables.write().vcenters.insert(vcenter.id.clone(), vcenter);
        Ok(())
    }

    async fn put_datacenter(&self, datacenter: VcenterDataCenter) -> Result<()> {
        self.tables
            .write()
            .datacenters
            .insert(datacenter.id.clone(), datacenter);
        Ok(())
    }

    async fn put_volume(&self, volume: Volume) -> Result<()> {
        self.tables.write().volumes.insert(volume.id.clone(), volume);
        Ok(())
    }

    async fn put_file_share(&self, share: FileShare) -> Result<()> {
        self.tables.write().file_shares.insert(share.id.clone(), share);
        Ok(())
    }

    async fn remove_export_mask(&self, id: &ResourceId) -> Result<()> {
        let mut t = self.tables.write();
        if t.export_masks.remove(id).is_some() {
            debug!("Removed export mask {}", id);
        }
        Ok(())
    }

    async fn mark_for_deletion(&self, kind: ResourceKind, id: &ResourceId) -> Result<()> {
        let mut t = self.tables.write();
        let found = match kind {
            ResourceKind::ExportGroup => t.export_groups.get_mut(id).map(|g| {
                g.inactive = true;
                g.version += 1;
            }),
            ResourceKind::ExportMask => t.export_masks.get_mut(id).map(|r| r.inactive = true),
            ResourceKind::Host => t.hosts.get_mut(id).map(|r| r.inactive = true),
            ResourceKind::Cluster => t.clusters.get_mut(id).map(|r| r.inactive = true),
            ResourceKind::Initiator => t.initiators.get_mut(id).map(|r| r.inactive = true),
            ResourceKind::IpInterface => t.ip_interfaces.get_mut(id).map(|r| r.inactive = true),
            ResourceKind::Vcenter => t.vcenters.get_mut(id).map(|r| r.inactive = true),
            ResourceKind::VcenterDataCenter => t.datacenters.get_mut(id).map(|r| r.inactive = true),
            ResourceKind::Volume => t.volumes.get_mut(id).map(|r| r.inactive = true),
            ResourceKind::FileShare => t.file_shares.get_mut(id).map(|r| r.inactive = true),
        };
        match found {
            Some(()) => {
                debug!("Marked {}/{} for deletion", kind, id);
                Ok(())
            }
            None => Err(Error::not_found(kind, id)),
        }
    }

    async fn record_operation(
        &self,
        kind: ResourceKind,
        id: &ResourceId,
        record: OperationRecord,
    ) -> Result<()> {
        let mut t = self.tables.write();
        let exists = match kind {
            ResourceKind::ExportGroup => t.export_groups.contains_key(id),
            ResourceKind::ExportMask => t.export_masks.contains_key(id),
            ResourceKind::Host => t.hosts.contains_key(id),
            ResourceKind::Cluster => t.clusters.contains_key(id),
            ResourceKind::Initiator => t.initiators.contains_key(id),
            ResourceKind::IpInterface => t.ip_interfaces.contains_key(id),
            ResourceKind::Vcenter => t.vcenters.contains_key(id),
            ResourceKind::VcenterDataCenter => t.datacenters.contains_key(id),
            ResourceKind::Volume => t.volumes.contains_key(id),
            ResourceKind::FileShare => t.file_shares.contains_key(id),
        };
        if !exists {
            return Err(Error::not_found(kind, id));
        }
        t.operations
            .entry(id.clone())
            .or_default()
            .insert(record.op_id.clone(), record);
        Ok(())
    }

    async fn operation(&self, id: &ResourceId, op_id: &str) -> Result<Option<OperationRecord>> {
        Ok(self
            .tables
            .read()
            .operations
            .get(id)
            .and_then(|ops| ops.get(op_id))
            .cloned())
    }
}
