//! Invocation Dispatcher
//!
//! Resolves each [`Invocation`] variant onto the device port that performs
//! it. This is the only place where a step's descriptor turns into a call.

use super::devices::DeviceSet;
use crate::completer::{Completer, ExportMaskDeleteCompleter, ExportUpdateCompleter};
use crate::domain::model::{ExportGroupUpdate, Host, ResourceId, ResourceKind};
use crate::domain::ports::{
    BlockExportController, Constraint, FileExportController, FstabEntry, HostAdapter,
    MountAdapter, TaskHandle, TopologyStore, TopologyStoreRef,
};
use crate::error::{Error, Result};
use crate::workflow::{into_result, wait_for_terminal, Invocation, InvocationHandler, StepContext};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Step-data key under which file steps publish their task id
pub const FILE_TASK_KEY: &str = "task_id";

/// Step-data key under which a removed fstab entry is kept for rollback
pub const FSTAB_ENTRY_KEY: &str = "fstab_entry";

/// Step-data key recording whether a directory step created its path
pub const DIRECTORY_CREATED_KEY: &str = "created";

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Ceiling for asynchronous file export tasks
    pub file_task_timeout: Duration,
    /// Ceiling for storage I/O control toggles
    pub storage_io_control_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            file_task_timeout: Duration::from_secs(300),
            storage_io_control_timeout: Duration::from_secs(60),
        }
    }
}

/// [`InvocationHandler`] backed by a set of device ports
pub struct DeviceDispatcher {
    config: DispatchConfig,
    store: TopologyStoreRef,
    devices: DeviceSet,
}

impl DeviceDispatcher {
    pub fn new(config: DispatchConfig, store: TopologyStoreRef, devices: DeviceSet) -> Self {
        Self {
            config,
            store,
            devices,
        }
    }

    // -------------------------------------------------------------------------
    // Export groups
    // -------------------------------------------------------------------------

    async fn update_export_group(
        &self,
        group: &ResourceId,
        update: &ExportGroupUpdate,
        expected_version: Option<u64>,
        ctx: &StepContext,
    ) -> Result<()> {
        let block = &self.devices.block;
        if ctx.rolling_back {
            // compensations are last-writer-wins
            return block.export_group_update(group, update, None, &ctx.op_id).await;
        }

        let before = self
            .store
            .export_group(group)
            .await?
            .ok_or_else(|| Error::not_found(ResourceKind::ExportGroup, group))?;
        let completer = ExportUpdateCompleter::new(self.store.clone(), before, ctx.op_id.clone());

        match block
            .export_group_update(group, update, expected_version, &ctx.op_id)
            .await
        {
            Ok(()) => {
                completer
                    .ready(Some(format!("Export group {} updated", group)))
                    .await?;
                Ok(())
            }
            Err(e) => {
                match completer.fail(&e).await {
                    Ok(Some(undo)) => {
                        info!("Reverting partial update of export group {}", group);
                        if let Err(re) = block.export_group_update(group, &undo, None, &ctx.op_id).await {
                            warn!("Reverting export group {} failed: {}", group, re);
                        }
                    }
                    Ok(None) => {}
                    Err(ce) => warn!("Export group {} completer failed: {}", group, ce),
                }
                Err(e)
            }
        }
    }

    /// Delete the group, then drop its orphaned export-mask rows
    async fn delete_export_group(
        &self,
        group: &ResourceId,
        expected_version: Option<u64>,
        ctx: &StepContext,
    ) -> Result<()> {
        let masks = self
            .store
            .query(&Constraint::ExportMasksByGroup(group.clone()))
            .await?;
        let completer =
            ExportMaskDeleteCompleter::new(self.store.clone(), group.clone(), masks, ctx.op_id.clone());

        match self
            .devices
            .block
            .export_group_delete(group, expected_version, &ctx.op_id)
            .await
        {
            Ok(()) => {
                completer
                    .ready(Some(format!(
                        "Export group {} deleted with {} export masks",
                        group,
                        completer.masks().len()
                    )))
                    .await
            }
            Err(e) => {
                if let Err(ce) = completer.error(format!("[{}] {}", e.class(), e)).await {
                    warn!("Export group {} completer failed: {}", group, ce);
                }
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Bounded waits
    // -------------------------------------------------------------------------

    /// Wait for a file task; a timed-out task gets a best-effort native cancel
    async fn wait_file_task(&self, task_id: &str, ctx: &StepContext) -> Result<()> {
        let rx = self
            .devices
            .file
            .subscribe(task_id)
            .ok_or_else(|| Error::TaskFailed {
                task: task_id.to_string(),
                reason: "unknown task".into(),
            })?;
        match wait_for_terminal(task_id, rx, self.config.file_task_timeout, &ctx.cancel).await {
            Ok(state) => into_result(task_id, state),
            Err(e) => {
                if matches!(e, Error::TaskTimeout { .. } | Error::Cancelled(_)) {
                    if let Err(ce) = self.devices.file.cancel(task_id).await {
                        warn!("Cancel of file task {} failed: {}", task_id, ce);
                    }
                }
                Err(e)
            }
        }
    }

    async fn wait_storage_io_control(&self, handle: TaskHandle, ctx: &StepContext) -> Result<()> {
        let TaskHandle { task_id, state } = handle;
        match wait_for_terminal(&task_id, state, self.config.storage_io_control_timeout, &ctx.cancel)
            .await
        {
            Ok(state) => into_result(&task_id, state),
            Err(e) => {
                if let Err(ce) = self.devices.host.cancel_task(&task_id).await {
                    warn!("Cancel of storage I/O control task {} failed: {}", task_id, ce);
                }
                Err(e)
            }
        }
    }

    /// Forward file steps hand their task to a dedicated wait step;
    /// compensations wait inline
    async fn file_task(&self, handle: TaskHandle, ctx: &StepContext) -> Result<()> {
        if ctx.rolling_back {
            return self.wait_file_task(&handle.task_id, ctx).await;
        }
        debug!("Step '{}' started file task {}", ctx.label, handle.task_id);
        ctx.store_data(FILE_TASK_KEY, &handle.task_id)
    }

    // -------------------------------------------------------------------------
    // Host references
    // -------------------------------------------------------------------------

    async fn load_host(&self, id: &ResourceId) -> Result<Host> {
        self.store
            .host(id)
            .await?
            .ok_or_else(|| Error::not_found(ResourceKind::Host, id))
    }
}

#[async_trait]
impl InvocationHandler for DeviceDispatcher {
    async fn invoke(&self, invocation: &Invocation, ctx: &StepContext) -> Result<()> {
        debug!(
            "Step '{}' ({}) invoking {}{}",
            ctx.label,
            ctx.step,
            invocation,
            if ctx.rolling_back { " [rollback]" } else { "" }
        );
        let devices = &self.devices;
        match invocation {
            Invocation::NoOp => Ok(()),

            Invocation::UpdateExportGroup {
                group,
                update,
                expected_version,
            } => {
                self.update_export_group(group, update, *expected_version, ctx)
                    .await
            }
            Invocation::DeleteExportGroup {
                group,
                expected_version,
            } => self.delete_export_group(group, *expected_version, ctx).await,

            Invocation::FileExport { device, share, rules } => {
                let handle = devices.file.export(device, share, rules, &ctx.op_id).await?;
                self.file_task(handle, ctx).await
            }
            Invocation::FileUnexport { device, share, rules } => {
                let handle = devices.file.unexport(device, share, rules, &ctx.op_id).await?;
                self.file_task(handle, ctx).await
            }
            Invocation::FileUpdateExport { device, share, rules } => {
                let handle = devices
                    .file
                    .update_export(device, share, rules, &ctx.op_id)
                    .await?;
                self.file_task(handle, ctx).await
            }
            Invocation::WaitForFileTask { share, task_step } => {
                let task_id: String = ctx
                    .load_data(*task_step, FILE_TASK_KEY)?
                    .ok_or_else(|| {
                        Error::Internal(format!("no file task recorded for share {}", share))
                    })?;
                self.wait_file_task(&task_id, ctx).await
            }

            Invocation::VerifyDatastore { host, volume } => {
                devices.host.verify_datastore(host, volume).await
            }
            Invocation::SetStorageIoControl {
                host,
                volume,
                enabled,
            } => {
                let handle = devices
                    .host
                    .set_storage_io_control(host, volume, *enabled)
                    .await?;
                self.wait_storage_io_control(handle, ctx).await
            }
            Invocation::UnmountAndDetach { host, volume } => {
                devices.host.unmount_and_detach(host, volume).await
            }
            Invocation::AttachAndMount { host, volume } => {
                devices.host.attach_and_mount(host, volume).await
            }

            Invocation::UpdateHostCluster { host, cluster } => {
                let mut record = self.load_host(host).await?;
                record.cluster = cluster.clone();
                self.store.put_host(record).await
            }
            Invocation::SetBootVolume { host, volume } => {
                let mut record = self.load_host(host).await?;
                record.boot_volume = volume.clone();
                self.store.put_host(record).await
            }
            Invocation::SetSanBootTargets { host, volume } => {
                let record = self.load_host(host).await?;
                let compute_element = record.compute_element.as_deref().ok_or_else(|| {
                    Error::Validation(format!("host {} has no compute element", host))
                })?;
                devices
                    .host
                    .set_san_boot_target(host, compute_element, volume.as_ref())
                    .await
            }

            Invocation::VerifyMountPoint {
                host,
                path,
                expect_mounted,
            } => devices.mount.verify_mount_point(host, path, *expect_mounted).await,
            Invocation::CreateDirectory { host, path } => {
                let created = devices.mount.create_directory(host, path).await?;
                ctx.store_data(DIRECTORY_CREATED_KEY, &created)
            }
            Invocation::DeleteDirectory { host, path } => {
                if ctx.rolling_back {
                    let created: Option<bool> = ctx.load_data(ctx.step, DIRECTORY_CREATED_KEY)?;
                    if created != Some(true) {
                        debug!("Directory {} on host {} predates the operation; keeping it", path, host);
                        return Ok(());
                    }
                }
                devices.mount.delete_directory(host, path).await
            }
            Invocation::AddFstabEntry { host, entry } => {
                devices.mount.add_fstab_entry(host, entry).await
            }
            Invocation::RemoveFstabEntry { host, path } => {
                let removed = devices.mount.remove_fstab_entry(host, path).await?;
                if let Some(entry) = removed {
                    ctx.store_data(FSTAB_ENTRY_KEY, &entry)?;
                }
                Ok(())
            }
            Invocation::RestoreFstabEntry { host, path } => {
                let entry: Option<FstabEntry> = ctx.load_data(ctx.step, FSTAB_ENTRY_KEY)?;
                match entry {
                    Some(entry) => devices.mount.add_fstab_entry(host, &entry).await,
                    None => {
                        debug!("No fstab entry was removed for {} on host {}", path, host);
                        Ok(())
                    }
                }
            }
            Invocation::MountDevice { host, path } => devices.mount.mount_device(host, path).await,
            Invocation::UnmountDevice { host, path } => {
                devices.mount.unmount_device(host, path).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::devices::InMemoryDevices;
    use crate::completer::TaskCompleter;
    use crate::domain::model::{ExportGroup, ExportGroupKind, FileShare, OperationStatus};
    use crate::store::InMemoryStore;
    use crate::workflow::{EngineConfig, SagaEngine, SagaOutcome, StepSpec, WaitFor};
    use assert_matches::assert_matches;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    async fn setup(config: DispatchConfig) -> (Arc<InMemoryStore>, InMemoryDevices, Arc<SagaEngine>) {
        let store = InMemoryStore::new();
        let mut group = ExportGroup::new("eg-1", "eg", ExportGroupKind::Host, "array-1");
        group.hosts = BTreeSet::from(["h1".into(), "h2".into()]);
        store.put_export_group(group).await.unwrap();
        store
            .put_host(Host::new("h1", "esx-01"))
            .await
            .unwrap();

        let devices = InMemoryDevices::new(store.clone());
        let dispatcher = DeviceDispatcher::new(config, store.clone(), devices.device_set());
        let engine = SagaEngine::new(EngineConfig::default(), Arc::new(dispatcher));
        (store, devices, engine)
    }

    fn host_completer(store: &Arc<InMemoryStore>, op: &str) -> Arc<TaskCompleter> {
        Arc::new(TaskCompleter::for_resource(
            store.clone(),
            ResourceKind::Host,
            "h1".into(),
            op,
        ))
    }

    #[tokio::test]
    async fn test_update_records_status_on_export_group() {
        let (store, _devices, engine) = setup(DispatchConfig::default()).await;
        let mut workflow = engine.new_workflow("test", "update", true, "op-1");
        workflow
            .graph_mut()
            .create_step(
                WaitFor::none(),
                StepSpec::new("remove h2", "eg-1", Invocation::UpdateExportGroup {
                    group: "eg-1".into(),
                    update: ExportGroupUpdate {
                        removed_hosts: BTreeSet::from(["h2".into()]),
                        ..Default::default()
                    },
                    expected_version: None,
                }),
            )
            .unwrap();

        let report = engine
            .execute_plan(workflow, host_completer(&store, "op-1"), "done")
            .await
            .unwrap();
        assert!(report.outcome.is_success());
        let record = store.operation(&"eg-1".into(), "op-1").await.unwrap().unwrap();
        assert_eq!(record.status, OperationStatus::Ready);
    }

    #[tokio::test]
    async fn test_file_wait_times_out_and_cancels() {
        let config = DispatchConfig {
            file_task_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (store, devices, engine) = setup(config).await;
        store
            .put_file_share(FileShare {
                id: "fs-1".into(),
                label: "home".into(),
                storage_device: "nas-1".into(),
                mount_path: "/ifs/home".into(),
                exports: Vec::new(),
                inactive: false,
            })
            .await
            .unwrap();
        devices.file.set_stalled(true);

        let mut workflow = engine.new_workflow("test", "file", true, "op-2");
        let graph = workflow.graph_mut();
        let forward = graph
            .create_step(
                WaitFor::none(),
                StepSpec::new("update exports", "fs-1", Invocation::FileUpdateExport {
                    device: "nas-1".into(),
                    share: "fs-1".into(),
                    rules: Vec::new(),
                })
                .with_no_op_rollback(),
            )
            .unwrap();
        graph
            .create_step(
                forward,
                StepSpec::new("wait", "fs-1", Invocation::WaitForFileTask {
                    share: "fs-1".into(),
                    task_step: forward,
                })
                .with_no_op_rollback(),
            )
            .unwrap();

        let report = engine
            .execute_plan(workflow, host_completer(&store, "op-2"), "done")
            .await
            .unwrap();
        let wait = report.step("wait").unwrap();
        assert!(wait.message.as_deref().unwrap().contains("did not finish"));
        assert_matches!(report.outcome, SagaOutcome::Compensated { .. });
    }

    #[tokio::test]
    async fn test_storage_io_control_timeout_swallows_cancel_failure() {
        let config = DispatchConfig {
            storage_io_control_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let (store, devices, engine) = setup(config).await;
        devices.host.set_stall_storage_io_control(true);
        devices.host.failures().fail("cancel_task");

        let mut workflow = engine.new_workflow("test", "sioc", true, "op-3");
        workflow
            .graph_mut()
            .create_step(
                WaitFor::none(),
                StepSpec::new("disable sioc", "h1", Invocation::SetStorageIoControl {
                    host: "h1".into(),
                    volume: "vol-1".into(),
                    enabled: false,
                }),
            )
            .unwrap();
        let report = engine
            .execute_plan(workflow, host_completer(&store, "op-3"), "done")
            .await
            .unwrap();

        // the step fails with the timeout, not with the cancel failure
        let message = report.steps[0].message.clone().unwrap();
        assert!(message.contains("did not finish"));
        assert!(!message.contains("injected"));
    }
}
