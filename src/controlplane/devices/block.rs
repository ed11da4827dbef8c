//! Block Export Controller (in-memory)
//!
//! Applies export-group membership changes directly to the topology store,
//! standing in for the array-side masking controller.

use super::FailureInjector;
use crate::domain::model::{ExportGroupUpdate, ResourceId, ResourceKind};
use crate::domain::ports::{BlockExportController, TopologyStoreRef};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct BlockControllerConfig {
    /// Name reported in errors and logs
    pub name: String,
}

impl Default for BlockControllerConfig {
    fn default() -> Self {
        Self {
            name: "block-export".to_string(),
        }
    }
}

// =============================================================================
// Call Log
// =============================================================================

/// One accepted controller call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockCall {
    pub operation: String,
    pub group: ResourceId,
    pub op_id: String,
    pub expected_version: Option<u64>,
}

// =============================================================================
// Controller
// =============================================================================

pub struct InMemoryBlockController {
    config: BlockControllerConfig,
    store: TopologyStoreRef,
    failures: FailureInjector,
    calls: RwLock<Vec<BlockCall>>,
}

impl InMemoryBlockController {
    pub fn new(config: BlockControllerConfig, store: TopologyStoreRef) -> Self {
        Self {
            config,
            store,
            failures: FailureInjector::new(),
            calls: RwLock::new(Vec::new()),
        }
    }

    pub fn failures(&self) -> &FailureInjector {
        &self.failures
    }

    /// Calls that reached the store, in order
    pub async fn calls(&self) -> Vec<BlockCall> {
        self.calls.read().await.clone()
    }

    async fn log_call(
        &self,
        operation: &str,
        group: &ResourceId,
        op_id: &str,
        expected_version: Option<u64>,
    ) {
        self.calls.write().await.push(BlockCall {
            operation: operation.to_string(),
            group: group.clone(),
            op_id: op_id.to_string(),
            expected_version,
        });
    }
}

#[async_trait]
impl BlockExportController for InMemoryBlockController {
    async fn export_group_update(
        &self,
        group_id: &ResourceId,
        update: &ExportGroupUpdate,
        expected_version: Option<u64>,
        op_id: &str,
    ) -> Result<()> {
        self.failures.check(&self.config.name, "export_group_update")?;

        let mut group = self
            .store
            .export_group(group_id)
            .await?
            .ok_or_else(|| Error::not_found(ResourceKind::ExportGroup, group_id))?;
        if group.inactive {
            return Err(Error::inactive(ResourceKind::ExportGroup, group_id));
        }

        info!(
            "Updating export group {} for operation {} (+{} -{} hosts, +{} -{} initiators)",
            group_id,
            op_id,
            update.added_hosts.len(),
            update.removed_hosts.len(),
            update.added_initiators.len(),
            update.removed_initiators.len()
        );
        update.apply_to(&mut group);

        let version = match expected_version {
            Some(expected) => self.store.compare_and_put_export_group(group, expected).await?,
            None => self.store.put_export_group(group).await?,
        };
        self.log_call("export_group_update", group_id, op_id, expected_version)
            .await;
        debug!("Export group {} now at version {}", group_id, version);
        Ok(())
    }

    async fn export_group_delete(
        &self,
        group_id: &ResourceId,
        expected_version: Option<u64>,
        op_id: &str,
    ) -> Result<()> {
        self.failures.check(&self.config.name, "export_group_delete")?;

        let mut group = self
            .store
            .export_group(group_id)
            .await?
            .ok_or_else(|| Error::not_found(ResourceKind::ExportGroup, group_id))?;

        info!(
            "Deleting export group {} for operation {}: unexporting {} volumes",
            group_id,
            op_id,
            group.volumes.len()
        );
        group.volumes.clear();
        group.hosts.clear();
        group.clusters.clear();
        group.initiators.clear();
        group.inactive = true;

        match expected_version {
            Some(expected) => {
                self.store.compare_and_put_export_group(group, expected).await?;
            }
            None => {
                self.store.put_export_group(group).await?;
            }
        }
        self.log_call("export_group_delete", group_id, op_id, expected_version)
            .await;
        Ok(())
    }

    fn controller_name(&self) -> &str {
        &self.config.name
    }
}
