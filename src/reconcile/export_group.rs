//! Export-Topology Reconciler
//!
//! Given a topology change, finds the export groups it affects and computes
//! per group the added and removed hosts, clusters and initiators, and whether
//! the group must be deleted outright.
//!
//! Reads are a point-in-time view of the store with no lock held across the
//! read and the later write. Each diff carries the version it was computed
//! from so callers can opt into optimistic concurrency.

use super::diff::ExportGroupDiff;
use crate::domain::model::{
    Cluster, ExportGroup, ExportGroupKind, ExportGroupUpdate, Host, Initiator, ResourceId,
    ResourceKind,
};
use crate::domain::ports::{Constraint, ConnectivityCheckerRef, TopologyStoreRef};
use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

// =============================================================================
// Topology Changes
// =============================================================================

/// A compute-side topology change to reconcile against export groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum TopologyChange {
    /// New initiators discovered or registered on a host
    InitiatorsAdded {
        host: ResourceId,
        initiators: Vec<ResourceId>,
        /// Raised by an external event rather than an explicit request
        #[serde(default)]
        triggered_by_event: bool,
    },
    InitiatorsRemoved {
        host: ResourceId,
        initiators: Vec<ResourceId>,
    },
    HostsAddedToCluster {
        cluster: ResourceId,
        hosts: Vec<ResourceId>,
    },
    HostsRemovedFromCluster {
        cluster: ResourceId,
        hosts: Vec<ResourceId>,
    },
    /// Host decommissioned: remove it from every export
    HostRemoved { host: ResourceId },
    /// Cluster decommissioned: remove it from every export that names it
    ClusterDetached { cluster: ResourceId },
    /// Datacenter decommissioned: its clusters and hosts are detached
    DatacenterDetached { datacenter: ResourceId },
    /// Converge the cluster's export groups onto its current host list
    ClusterSync { cluster: ResourceId },
}

impl TopologyChange {
    pub fn name(&self) -> &'static str {
        match self {
            TopologyChange::InitiatorsAdded { .. } => "initiators_added",
            TopologyChange::InitiatorsRemoved { .. } => "initiators_removed",
            TopologyChange::HostsAddedToCluster { .. } => "hosts_added_to_cluster",
            TopologyChange::HostsRemovedFromCluster { .. } => "hosts_removed_from_cluster",
            TopologyChange::HostRemoved { .. } => "host_removed",
            TopologyChange::ClusterDetached { .. } => "cluster_detached",
            TopologyChange::DatacenterDetached { .. } => "datacenter_detached",
            TopologyChange::ClusterSync { .. } => "cluster_sync",
        }
    }
}

// =============================================================================
// Plan Builder
// =============================================================================

struct PendingGroup {
    group: ExportGroup,
    update: ExportGroupUpdate,
    excluded: BTreeSet<ResourceId>,
}

/// Accumulates requested updates per group; each group is read once
#[derive(Default)]
struct PlanBuilder {
    groups: IndexMap<ResourceId, PendingGroup>,
}

impl PlanBuilder {
    fn entry(&mut self, group: ExportGroup) -> &mut PendingGroup {
        self.groups
            .entry(group.id.clone())
            .or_insert_with(|| PendingGroup {
                group,
                update: ExportGroupUpdate::default(),
                excluded: BTreeSet::new(),
            })
    }

    fn finish(self) -> Vec<ExportGroupDiff> {
        self.groups
            .into_values()
            .filter_map(|pending| {
                let mut diff = ExportGroupDiff::compute(&pending.group, &pending.update);
                diff.excluded_initiators = pending.excluded;
                // no-op diffs are kept only to report excluded initiators
                (!diff.is_noop() || !diff.excluded_initiators.is_empty()).then_some(diff)
            })
            .collect()
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Computes export-group diffs from persisted topology
pub struct ExportReconciler {
    store: TopologyStoreRef,
    connectivity: ConnectivityCheckerRef,
}

impl ExportReconciler {
    pub fn new(store: TopologyStoreRef, connectivity: ConnectivityCheckerRef) -> Self {
        Self {
            store,
            connectivity,
        }
    }

    /// Diffs for a single change
    pub async fn reconcile(&self, change: &TopologyChange) -> Result<Vec<ExportGroupDiff>> {
        self.reconcile_many(std::slice::from_ref(change)).await
    }

    /// Diffs for several changes, merged per group before the delete/update
    /// decision is taken
    pub async fn reconcile_many(&self, changes: &[TopologyChange]) -> Result<Vec<ExportGroupDiff>> {
        let mut plan = PlanBuilder::default();
        for change in changes {
            debug!("Reconciling topology change {}", change.name());
            self.collect(change, &mut plan).await?;
        }
        let diffs = plan.finish();
        info!(
            "Reconciled {} topology changes: {} export groups affected ({} deletes)",
            changes.len(),
            diffs.len(),
            diffs.iter().filter(|d| d.is_delete()).count()
        );
        Ok(diffs)
    }

    async fn collect(&self, change: &TopologyChange, plan: &mut PlanBuilder) -> Result<()> {
        match change {
            TopologyChange::InitiatorsAdded {
                host,
                initiators,
                triggered_by_event,
            } => {
                self.initiators_added(host, initiators, *triggered_by_event, plan)
                    .await
            }
            TopologyChange::InitiatorsRemoved { host, initiators } => {
                self.initiators_removed(host, initiators, plan).await
            }
            TopologyChange::HostsAddedToCluster { cluster, hosts } => {
                self.hosts_added_to_cluster(cluster, hosts, plan).await
            }
            TopologyChange::HostsRemovedFromCluster { cluster, hosts } => {
                self.hosts_removed_from_cluster(cluster, hosts, plan).await
            }
            TopologyChange::HostRemoved { host } => self.host_removed(host, plan).await,
            TopologyChange::ClusterDetached { cluster } => {
                self.cluster_detached(cluster, plan).await
            }
            TopologyChange::DatacenterDetached { datacenter } => {
                self.datacenter_detached(datacenter, plan).await
            }
            TopologyChange::ClusterSync { cluster } => self.cluster_sync(cluster, plan).await,
        }
    }

    // -------------------------------------------------------------------------
    // Per-change collection
    // -------------------------------------------------------------------------

    async fn initiators_added(
        &self,
        host_id: &ResourceId,
        initiator_ids: &[ResourceId],
        triggered_by_event: bool,
        plan: &mut PlanBuilder,
    ) -> Result<()> {
        let host = self.require_host(host_id).await?;
        let mut initiators = Vec::with_capacity(initiator_ids.len());
        for id in initiator_ids {
            let initiator = self.require_initiator(id).await?;
            if &initiator.host != host_id {
                return Err(Error::Validation(format!(
                    "initiator {} belongs to host {}, not {}",
                    id, initiator.host, host_id
                )));
            }
            initiators.push(initiator);
        }

        let mut group_ids = self.query(Constraint::ExportGroupsByHost(host.id.clone())).await?;
        if let Some(cluster) = &host.cluster {
            group_ids.extend(self.query(Constraint::ExportGroupsByCluster(cluster.clone())).await?);
        }

        for group in self.load_groups(&group_ids).await? {
            // Initiator groups are scoped explicitly and never auto-extended
            if group.kind == ExportGroupKind::Initiator {
                continue;
            }
            let candidates: Vec<&Initiator> = initiators
                .iter()
                .filter(|i| !group.initiators.contains(&i.id))
                .collect();
            let (connected, unconnected) = self.partition_connected(&group, candidates);

            if triggered_by_event && !unconnected.is_empty() {
                return Err(Error::NoInitiatorConnectivity {
                    initiators: join_ids(&unconnected),
                    group: group.id.to_string(),
                });
            }
            let pending = plan.entry(group);
            pending.update.added_initiators.extend(connected);
            pending.excluded.extend(unconnected);
        }
        Ok(())
    }

    async fn initiators_removed(
        &self,
        host_id: &ResourceId,
        initiator_ids: &[ResourceId],
        plan: &mut PlanBuilder,
    ) -> Result<()> {
        self.require_host_record(host_id).await?;
        let removed: BTreeSet<ResourceId> = initiator_ids.iter().cloned().collect();

        let mut group_ids = Vec::new();
        for id in initiator_ids {
            group_ids.extend(self.query(Constraint::ExportGroupsByInitiator(id.clone())).await?);
        }
        for group in self.load_groups(&group_ids).await? {
            let in_group: BTreeSet<ResourceId> =
                group.initiators.intersection(&removed).cloned().collect();
            plan.entry(group).update.removed_initiators.extend(in_group);
        }
        Ok(())
    }

    async fn hosts_added_to_cluster(
        &self,
        cluster_id: &ResourceId,
        host_ids: &[ResourceId],
        plan: &mut PlanBuilder,
    ) -> Result<()> {
        self.require_cluster(cluster_id).await?;
        let mut hosts = Vec::with_capacity(host_ids.len());
        for id in host_ids {
            hosts.push(self.require_host(id).await?);
        }

        let group_ids = self.query(Constraint::ExportGroupsByCluster(cluster_id.clone())).await?;
        for group in self.load_groups(&group_ids).await? {
            let (added_hosts, added_initiators, excluded) =
                self.hosts_to_add(&group, &hosts).await?;
            let pending = plan.entry(group);
            pending.update.added_hosts.extend(added_hosts);
            pending.update.added_initiators.extend(added_initiators);
            pending.excluded.extend(excluded);
        }
        Ok(())
    }

    async fn hosts_removed_from_cluster(
        &self,
        cluster_id: &ResourceId,
        host_ids: &[ResourceId],
        plan: &mut PlanBuilder,
    ) -> Result<()> {
        self.require_cluster_record(cluster_id).await?;
        let hosts: BTreeSet<ResourceId> = host_ids.iter().cloned().collect();

        let group_ids = self.query(Constraint::ExportGroupsByCluster(cluster_id.clone())).await?;
        for group in self.load_groups(&group_ids).await? {
            let removed_hosts: BTreeSet<ResourceId> =
                group.hosts.intersection(&hosts).cloned().collect();
            let removed_initiators = self.group_initiators_of_hosts(&group, &hosts).await?;
            let pending = plan.entry(group);
            pending.update.removed_hosts.extend(removed_hosts);
            pending.update.removed_initiators.extend(removed_initiators);
        }
        Ok(())
    }

    async fn host_removed(&self, host_id: &ResourceId, plan: &mut PlanBuilder) -> Result<()> {
        self.require_host_record(host_id).await?;
        let hosts: BTreeSet<ResourceId> = [host_id.clone()].into_iter().collect();

        let mut group_ids = self.query(Constraint::ExportGroupsByHost(host_id.clone())).await?;
        for initiator in self.query(Constraint::InitiatorsByHost(host_id.clone())).await? {
            group_ids.extend(self.query(Constraint::ExportGroupsByInitiator(initiator)).await?);
        }

        for group in self.load_groups(&group_ids).await? {
            let removed_initiators = self.group_initiators_of_hosts(&group, &hosts).await?;
            let in_group = group.hosts.contains(host_id);
            let pending = plan.entry(group);
            if in_group {
                pending.update.removed_hosts.insert(host_id.clone());
            }
            pending.update.removed_initiators.extend(removed_initiators);
        }
        Ok(())
    }

    async fn cluster_detached(&self, cluster_id: &ResourceId, plan: &mut PlanBuilder) -> Result<()> {
        self.require_cluster_record(cluster_id).await?;
        let hosts: BTreeSet<ResourceId> = self
            .query(Constraint::HostsByCluster(cluster_id.clone()))
            .await?
            .into_iter()
            .collect();

        let group_ids = self.query(Constraint::ExportGroupsByCluster(cluster_id.clone())).await?;
        for group in self.load_groups(&group_ids).await? {
            let removed_hosts: BTreeSet<ResourceId> =
                group.hosts.intersection(&hosts).cloned().collect();
            let removed_initiators = self.group_initiators_of_hosts(&group, &hosts).await?;
            let pending = plan.entry(group);
            pending.update.removed_clusters.insert(cluster_id.clone());
            pending.update.removed_hosts.extend(removed_hosts);
            pending.update.removed_initiators.extend(removed_initiators);
        }
        Ok(())
    }

    async fn datacenter_detached(
        &self,
        datacenter_id: &ResourceId,
        plan: &mut PlanBuilder,
    ) -> Result<()> {
        if self.store.datacenter(datacenter_id).await?.is_none() {
            return Err(Error::not_found(ResourceKind::VcenterDataCenter, datacenter_id));
        }
        for cluster in self
            .query(Constraint::ClustersByDatacenter(datacenter_id.clone()))
            .await?
        {
            self.cluster_detached(&cluster, plan).await?;
        }
        for host in self.query(Constraint::HostsByDatacenter(datacenter_id.clone())).await? {
            self.host_removed(&host, plan).await?;
        }
        Ok(())
    }

    /// Convergent mode: compare each cluster group's hosts with the
    /// cluster's current host list
    async fn cluster_sync(&self, cluster_id: &ResourceId, plan: &mut PlanBuilder) -> Result<()> {
        self.require_cluster(cluster_id).await?;
        let cluster_hosts: BTreeSet<ResourceId> = self
            .query(Constraint::HostsByCluster(cluster_id.clone()))
            .await?
            .into_iter()
            .collect();

        let group_ids = self.query(Constraint::ExportGroupsByCluster(cluster_id.clone())).await?;
        for group in self.load_groups(&group_ids).await? {
            let (added, removed) = super::diff::set_diff(&group.hosts, &cluster_hosts);

            let mut hosts_to_add = Vec::with_capacity(added.len());
            for id in &added {
                hosts_to_add.push(self.require_host(id).await?);
            }
            let (added_hosts, added_initiators, excluded) =
                self.hosts_to_add(&group, &hosts_to_add).await?;
            let removed_initiators = self.group_initiators_of_hosts(&group, &removed).await?;

            let pending = plan.entry(group);
            pending.update.added_hosts.extend(added_hosts);
            pending.update.added_initiators.extend(added_initiators);
            pending.update.removed_hosts.extend(removed);
            pending.update.removed_initiators.extend(removed_initiators);
            pending.excluded.extend(excluded);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Hosts not yet in the group, with their connected initiators
    async fn hosts_to_add(
        &self,
        group: &ExportGroup,
        hosts: &[Host],
    ) -> Result<(BTreeSet<ResourceId>, BTreeSet<ResourceId>, BTreeSet<ResourceId>)> {
        let mut added_hosts = BTreeSet::new();
        let mut added_initiators = BTreeSet::new();
        let mut excluded = BTreeSet::new();
        for host in hosts {
            if !group.hosts.contains(&host.id) {
                added_hosts.insert(host.id.clone());
            }
            let mut initiators = Vec::new();
            for id in self.query(Constraint::InitiatorsByHost(host.id.clone())).await? {
                if group.initiators.contains(&id) {
                    continue;
                }
                if let Some(initiator) = self.store.initiator(&id).await? {
                    initiators.push(initiator);
                }
            }
            let (connected, unconnected) =
                self.partition_connected(group, initiators.iter().collect());
            added_initiators.extend(connected);
            excluded.extend(unconnected);
        }
        Ok((added_hosts, added_initiators, excluded))
    }

    fn partition_connected(
        &self,
        group: &ExportGroup,
        candidates: Vec<&Initiator>,
    ) -> (BTreeSet<ResourceId>, BTreeSet<ResourceId>) {
        let mut connected = BTreeSet::new();
        let mut unconnected = BTreeSet::new();
        for initiator in candidates {
            if self.connectivity.is_connected(initiator, group) {
                connected.insert(initiator.id.clone());
            } else {
                debug!(
                    "Initiator {} has no connectivity to storage ports of export group {}",
                    initiator.id, group.id
                );
                unconnected.insert(initiator.id.clone());
            }
        }
        (connected, unconnected)
    }

    /// Members of `group.initiators` that belong to one of `hosts`.
    ///
    /// Reads each member by id so inactive initiators are found too.
    async fn group_initiators_of_hosts(
        &self,
        group: &ExportGroup,
        hosts: &BTreeSet<ResourceId>,
    ) -> Result<BTreeSet<ResourceId>> {
        let mut found = BTreeSet::new();
        if hosts.is_empty() {
            return Ok(found);
        }
        for id in &group.initiators {
            if let Some(initiator) = self.store.initiator(id).await? {
                if hosts.contains(&initiator.host) {
                    found.insert(id.clone());
                }
            }
        }
        Ok(found)
    }

    async fn query(&self, constraint: Constraint) -> Result<Vec<ResourceId>> {
        self.store.query(&constraint).await
    }

    /// Active groups for the ids, deduplicated, in first-seen order
    async fn load_groups(&self, ids: &[ResourceId]) -> Result<Vec<ExportGroup>> {
        let mut seen = BTreeSet::new();
        let mut groups = Vec::new();
        for id in ids {
            if !seen.insert(id.clone()) {
                continue;
            }
            match self.store.export_group(id).await? {
                Some(group) if !group.inactive => groups.push(group),
                _ => debug!("Skipping missing or inactive export group {}", id),
            }
        }
        Ok(groups)
    }

    async fn require_host_record(&self, id: &ResourceId) -> Result<Host> {
        self.store
            .host(id)
            .await?
            .ok_or_else(|| Error::not_found(ResourceKind::Host, id))
    }

    async fn require_host(&self, id: &ResourceId) -> Result<Host> {
        let host = self.require_host_record(id).await?;
        if host.inactive {
            return Err(Error::inactive(ResourceKind::Host, id));
        }
        Ok(host)
    }

    async fn require_cluster_record(&self, id: &ResourceId) -> Result<Cluster> {
        self.store
            .cluster(id)
            .await?
            .ok_or_else(|| Error::not_found(ResourceKind::Cluster, id))
    }

    async fn require_cluster(&self, id: &ResourceId) -> Result<Cluster> {
        let cluster = self.require_cluster_record(id).await?;
        if cluster.inactive {
            return Err(Error::inactive(ResourceKind::Cluster, id));
        }
        Ok(cluster)
    }

    async fn require_initiator(&self, id: &ResourceId) -> Result<Initiator> {
        let initiator = self
            .store
            .initiator(id)
            .await?
            .ok_or_else(|| Error::not_found(ResourceKind::Initiator, id))?;
        if initiator.inactive {
            return Err(Error::inactive(ResourceKind::Initiator, id));
        }
        Ok(initiator)
    }
}

fn join_ids(ids: &BTreeSet<ResourceId>) -> String {
    ids.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(", ")
}
