//! Resource-Specific Completers
//!
//! Completers that perform the one class of side effect allowed at completion
//! time: retiring records the finished operation made obsolete.

use super::task::TaskCompleter;
use super::Completer;
use crate::domain::model::{ExportGroup, ExportGroupUpdate, OperationStatus, ResourceId, ResourceKind};
use crate::domain::ports::{Constraint, TopologyStore, TopologyStoreRef};
use crate::error::{Error, Result};
use crate::reconcile::diff::update_between;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

// =============================================================================
// Deactivate-on-complete
// =============================================================================

/// Completer for detach/remove operations that may also retire the resource
pub struct ResourceCompleter {
    inner: TaskCompleter,
    deactivate_on_complete: bool,
}

impl ResourceCompleter {
    pub fn new(
        store: TopologyStoreRef,
        kind: ResourceKind,
        ids: impl IntoIterator<Item = ResourceId>,
        op_id: impl Into<String>,
        deactivate_on_complete: bool,
    ) -> Self {
        Self {
            inner: TaskCompleter::new(store, kind, ids, op_id),
            deactivate_on_complete,
        }
    }

    pub fn deactivates_on_complete(&self) -> bool {
        self.deactivate_on_complete
    }

    async fn deactivate(&self) -> Result<()> {
        let store = self.inner.store();
        for id in self.inner.resources() {
            match self.inner.resource_kind() {
                ResourceKind::Host => deactivate_host(store.as_ref(), id).await?,
                ResourceKind::Cluster => deactivate_cluster(store.as_ref(), id).await?,
                ResourceKind::VcenterDataCenter => {
                    deactivate_datacenter(store.as_ref(), id).await?
                }
                ResourceKind::Vcenter => {
                    for dc in store.query(&Constraint::DatacentersByVcenter(id.clone())).await? {
                        deactivate_datacenter(store.as_ref(), &dc).await?;
                    }
                    store.mark_for_deletion(ResourceKind::Vcenter, id).await?;
                }
                kind => store.mark_for_deletion(kind, id).await?,
            }
            info!("Deactivated {} {}", self.inner.resource_kind(), id);
        }
        Ok(())
    }
}

async fn deactivate_host(store: &dyn TopologyStore, id: &ResourceId) -> Result<()> {
    for initiator in store.query(&Constraint::InitiatorsByHost(id.clone())).await? {
        store.mark_for_deletion(ResourceKind::Initiator, &initiator).await?;
    }
    for ip in store.query(&Constraint::IpInterfacesByHost(id.clone())).await? {
        store.mark_for_deletion(ResourceKind::IpInterface, &ip).await?;
    }
    store.mark_for_deletion(ResourceKind::Host, id).await
}

async fn deactivate_cluster(store: &dyn TopologyStore, id: &ResourceId) -> Result<()> {
    for host_id in store.query(&Constraint::HostsByCluster(id.clone())).await? {
        if let Some(mut host) = store.host(&host_id).await? {
            host.cluster = None;
            store.put_host(host).await?;
        }
    }
    store.mark_for_deletion(ResourceKind::Cluster, id).await
}

async fn deactivate_datacenter(store: &dyn TopologyStore, id: &ResourceId) -> Result<()> {
    for host_id in store.query(&Constraint::HostsByDatacenter(id.clone())).await? {
        if let Some(mut host) = store.host(&host_id).await? {
            host.vcenter_datacenter = None;
            store.put_host(host).await?;
        }
    }
    for cluster_id in store.query(&Constraint::ClustersByDatacenter(id.clone())).await? {
        if let Some(mut cluster) = store.cluster(&cluster_id).await? {
            cluster.vcenter_datacenter = None;
            store.put_cluster(cluster).await?;
        }
    }
    store.mark_for_deletion(ResourceKind::VcenterDataCenter, id).await
}

#[async_trait]
impl Completer for ResourceCompleter {
    fn op_id(&self) -> &str {
        self.inner.op_id()
    }

    fn resource_kind(&self) -> ResourceKind {
        self.inner.resource_kind()
    }

    fn resources(&self) -> &[ResourceId] {
        self.inner.resources()
    }

    fn is_rolling_back(&self) -> bool {
        self.inner.is_rolling_back()
    }

    fn set_rolling_back(&self, rolling_back: bool) {
        self.inner.set_rolling_back(rolling_back)
    }

    fn status(&self) -> OperationStatus {
        self.inner.status()
    }

    fn message(&self) -> Option<String> {
        self.inner.message()
    }

    async fn begin(&self) -> Result<()> {
        self.inner.begin().await
    }

    async fn complete(&self, status: OperationStatus, message: Option<String>) -> Result<()> {
        let mut status = status;
        let mut message = message;
        if status == OperationStatus::Ready && self.deactivate_on_complete && !self.is_completed() {
            if let Err(e) = self.deactivate().await {
                warn!(
                    "Operation {} succeeded but deactivation failed: {}",
                    self.op_id(),
                    e
                );
                status = OperationStatus::Error;
                message = Some(format!("deactivation failed: {}", e));
            }
        }
        self.inner.complete(status, message).await
    }
}

// =============================================================================
// Export mask deletion
// =============================================================================

/// Completer that removes export-mask rows once their deletion is certain.
///
/// Rows are removed on `Ready`, or on a terminal status reached while rolling
/// back (the compensating delete also finished). Never on anything else.
pub struct ExportMaskDeleteCompleter {
    inner: TaskCompleter,
    masks: Vec<ResourceId>,
}

impl ExportMaskDeleteCompleter {
    pub fn new(
        store: TopologyStoreRef,
        group: ResourceId,
        masks: impl IntoIterator<Item = ResourceId>,
        op_id: impl Into<String>,
    ) -> Self {
        Self {
            inner: TaskCompleter::for_resource(store, ResourceKind::ExportGroup, group, op_id),
            masks: masks.into_iter().collect(),
        }
    }

    pub fn masks(&self) -> &[ResourceId] {
        &self.masks
    }

    fn should_remove(status: OperationStatus, rolling_back: bool) -> bool {
        status == OperationStatus::Ready || (status.is_terminal() && rolling_back)
    }
}

#[async_trait]
impl Completer for ExportMaskDeleteCompleter {
    fn op_id(&self) -> &str {
        self.inner.op_id()
    }

    fn resource_kind(&self) -> ResourceKind {
        self.inner.resource_kind()
    }

    fn resources(&self) -> &[ResourceId] {
        self.inner.resources()
    }

    fn is_rolling_back(&self) -> bool {
        self.inner.is_rolling_back()
    }

    fn set_rolling_back(&self, rolling_back: bool) {
        self.inner.set_rolling_back(rolling_back)
    }

    fn status(&self) -> OperationStatus {
        self.inner.status()
    }

    fn message(&self) -> Option<String> {
        self.inner.message()
    }

    async fn begin(&self) -> Result<()> {
        self.inner.begin().await
    }

    async fn complete(&self, status: OperationStatus, message: Option<String>) -> Result<()> {
        let Some(done) = self.inner.claim(status, message) else {
            return Ok(());
        };
        if Self::should_remove(done.status, done.rolling_back) {
            let store = self.inner.store();
            for mask in &self.masks {
                if let Err(e) = store.remove_export_mask(mask).await {
                    warn!("Failed to remove export mask {}: {}", mask, e);
                }
            }
            debug!("Removed {} export masks for operation {}", self.masks.len(), self.op_id());
        }
        self.inner.record_all(done.status, done.message).await;
        Ok(())
    }
}

// =============================================================================
// Export group update
// =============================================================================

/// Completer for a single export-group update step.
///
/// Holds the membership observed before the step. When the step fails after
/// the controller may have applied part of the update, it re-reads the group
/// and derives the update that returns membership to that snapshot. The
/// derived update is computed from current state rather than by inverting
/// the forward update, so it stays correct when the forward update was only
/// partially applied.
pub struct ExportUpdateCompleter {
    inner: TaskCompleter,
    before: ExportGroup,
    rollback: Mutex<Option<ExportGroupUpdate>>,
}

impl ExportUpdateCompleter {
    pub fn new(store: TopologyStoreRef, before: ExportGroup, op_id: impl Into<String>) -> Self {
        Self {
            inner: TaskCompleter::for_resource(
                store,
                ResourceKind::ExportGroup,
                before.id.clone(),
                op_id,
            ),
            before,
            rollback: Mutex::new(None),
        }
    }

    /// Update that restores the pre-step membership, once derived
    pub fn rollback_update(&self) -> Option<ExportGroupUpdate> {
        self.rollback.lock().clone()
    }

    /// Classify a step error and complete.
    ///
    /// Validation errors are raised before the controller touches the array,
    /// so nothing needs undoing. Anything else may have left a partial update.
    pub async fn fail(&self, err: &Error) -> Result<Option<ExportGroupUpdate>> {
        if !err.is_validation() {
            let current = self.inner.store().export_group(&self.before.id).await?;
            if let Some(current) = current {
                let update = update_between(&current, &self.before);
                if !update.is_empty() {
                    debug!(
                        "Derived rollback update for export group {}: {:?}",
                        self.before.id, update
                    );
                    *self.rollback.lock() = Some(update);
                }
            }
        }
        let message = format!("[{}] {}", err.class(), err);
        self.complete(OperationStatus::Error, Some(message)).await?;
        Ok(self.rollback_update())
    }
}

#[async_trait]
impl Completer for ExportUpdateCompleter {
    fn op_id(&self) -> &str {
        self.inner.op_id()
    }

    fn resource_kind(&self) -> ResourceKind {
        self.inner.resource_kind()
    }

    fn resources(&self) -> &[ResourceId] {
        self.inner.resources()
    }

    fn is_rolling_back(&self) -> bool {
        self.inner.is_rolling_back()
    }

    fn set_rolling_back(&self, rolling_back: bool) {
        self.inner.set_rolling_back(rolling_back)
    }

    fn status(&self) -> OperationStatus {
        self.inner.status()
    }

    fn message(&self) -> Option<String> {
        self.inner.message()
    }

    async fn begin(&self) -> Result<()> {
        self.inner.begin().await
    }

    async fn complete(&self, status: OperationStatus, message: Option<String>) -> Result<()> {
        self.inner.complete(status, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{
        ExportGroupKind, ExportMask, Host, Initiator, InitiatorProtocol, IpInterface,
    };
    use crate::store::InMemoryStore;
    use std::collections::BTreeSet;

    fn ids(items: &[&str]) -> BTreeSet<ResourceId> {
        items.iter().map(|s| ResourceId::from(*s)).collect()
    }

    #[tokio::test]
    async fn test_host_deactivation_on_ready() {
        let store = InMemoryStore::new();
        let mut host = Host::new("h1", "esx-01");
        host.cluster = Some("c1".into());
        store.put_host(host).await.unwrap();
        store
            .put_initiator(Initiator {
                id: "i1".into(),
                host: "h1".into(),
                port: "iqn.1998-01.com.vmware:esx-01".into(),
                protocol: InitiatorProtocol::Iscsi,
                network: None,
                inactive: false,
            })
            .await
            .unwrap();
        store
            .put_ip_interface(IpInterface {
                id: "ip1".into(),
                host: "h1".into(),
                address: "10.0.0.11".into(),
                inactive: false,
            })
            .await
            .unwrap();

        let completer =
            ResourceCompleter::new(store.clone(), ResourceKind::Host, ["h1".into()], "op-1", true);
        completer.ready(None).await.unwrap();

        assert!(store.host(&"h1".into()).await.unwrap().unwrap().inactive);
        assert!(store.initiator(&"i1".into()).await.unwrap().unwrap().inactive);
        assert!(store.ip_interface(&"ip1".into()).await.unwrap().unwrap().inactive);
    }

    #[tokio::test]
    async fn test_no_deactivation_on_error() {
        let store = InMemoryStore::new();
        store.put_host(Host::new("h1", "esx-01")).await.unwrap();

        let completer =
            ResourceCompleter::new(store.clone(), ResourceKind::Host, ["h1".into()], "op-2", true);
        completer.error("detach failed".into()).await.unwrap();

        assert!(!store.host(&"h1".into()).await.unwrap().unwrap().inactive);
    }

    async fn store_with_mask() -> std::sync::Arc<InMemoryStore> {
        let store = InMemoryStore::new();
        store
            .put_export_group(ExportGroup::new("eg-1", "eg", ExportGroupKind::Host, "array-1"))
            .await
            .unwrap();
        store
            .put_export_mask(ExportMask {
                id: "m1".into(),
                export_group: "eg-1".into(),
                storage_system: "array-1".into(),
                initiators: BTreeSet::new(),
                volumes: BTreeSet::new(),
                inactive: false,
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_mask_removed_only_when_deletion_is_certain() {
        // plain error: the mask stays
        let store = store_with_mask().await;
        let completer =
            ExportMaskDeleteCompleter::new(store.clone(), "eg-1".into(), ["m1".into()], "op-3");
        completer.error("array offline".into()).await.unwrap();
        assert!(store.export_mask(&"m1".into()).await.unwrap().is_some());

        // error reached while rolling back: the compensating delete finished
        let store = store_with_mask().await;
        let completer =
            ExportMaskDeleteCompleter::new(store.clone(), "eg-1".into(), ["m1".into()], "op-4");
        completer.set_rolling_back(true);
        completer.error("array offline".into()).await.unwrap();
        assert!(store.export_mask(&"m1".into()).await.unwrap().is_none());

        // ready
        let store = store_with_mask().await;
        let completer =
            ExportMaskDeleteCompleter::new(store.clone(), "eg-1".into(), ["m1".into()], "op-5");
        completer.ready(None).await.unwrap();
        assert!(store.export_mask(&"m1".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_completer_derives_restoring_update() {
        let store = InMemoryStore::new();
        let mut before = ExportGroup::new("eg-1", "eg", ExportGroupKind::Host, "array-1");
        before.hosts = ids(&["h1", "h2"]);
        before.initiators = ids(&["i1", "i2", "i3"]);
        store.put_export_group(before.clone()).await.unwrap();

        // the controller applied half of "remove h2 + i2 + i3" before failing
        let mut partial = before.clone();
        partial.hosts = ids(&["h1"]);
        partial.initiators = ids(&["i1", "i3"]);
        store.put_export_group(partial).await.unwrap();

        let completer = ExportUpdateCompleter::new(store.clone(), before, "op-6");
        let err = Error::DeviceOperationFailed {
            device: "block".into(),
            operation: "export_group_update".into(),
            reason: "masking view busy".into(),
        };
        let update = completer.fail(&err).await.unwrap().unwrap();
        assert_eq!(update.added_hosts, ids(&["h2"]));
        assert_eq!(update.added_initiators, ids(&["i2"]));
        assert!(update.removed_initiators.is_empty());
        assert!(completer.message().unwrap().starts_with("[downstream]"));

        let validation = ExportUpdateCompleter::new(
            store.clone(),
            ExportGroup::new("eg-1", "eg", ExportGroupKind::Host, "array-1"),
            "op-7",
        );
        let none = validation
            .fail(&Error::Validation("bad request".into()))
            .await
            .unwrap();
        assert!(none.is_none());
    }
}
