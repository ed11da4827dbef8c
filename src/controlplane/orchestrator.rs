//! Main Orchestrator - Topology Change Entry Points
//!
//! Each entry point follows the same shape:
//! - bind a completer to the affected resources
//! - reconcile the change against persisted export state
//! - plan the resulting steps on a fresh workflow
//! - hand the workflow to the saga engine
//!
//! Failures never escape as errors. They are recorded through the completer
//! and returned in the [`TaskReport`].

use super::devices::DeviceSet;
use super::dispatch::{DeviceDispatcher, DispatchConfig};
use super::steps;
use crate::completer::{Completer, CompleterRef, ResourceCompleter, TaskCompleter};
use crate::domain::model::{ExportGroup, Host, OperationStatus, ResourceId, ResourceKind};
use crate::domain::ports::{
    Constraint, ConnectivityCheckerRef, FstabEntry, TopologyStore, TopologyStoreRef,
};
use crate::error::{Error, Result};
use crate::metrics::OrchestratorMetrics;
use crate::reconcile::{
    host_endpoints, plan_endpoint_withdrawal, ExportGroupDiff, ExportReconciler, TopologyChange,
};
use crate::workflow::{EngineConfig, SagaEngine, SagaReport, StepGraph, StepToken, WaitFor, Workflow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const OWNER: &str = "topology-orchestrator";

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Configuration for the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    /// How long a step waits for its named locks
    pub lock_timeout_secs: u64,
    /// Concurrently executing steps per workflow
    pub max_parallel_steps: usize,
    /// Ceiling for asynchronous file export tasks
    pub file_task_timeout_secs: u64,
    /// Ceiling for storage I/O control toggles
    pub storage_io_control_timeout_secs: u64,
    /// Submit the observed export-group version with forward updates
    pub enforce_export_group_versions: bool,
    /// Compensate succeeded steps when a later step fails
    pub rollback_allowed: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 30,
            max_parallel_steps: 16,
            file_task_timeout_secs: 300,
            storage_io_control_timeout_secs: 60,
            enforce_export_group_versions: false,
            rollback_allowed: true,
        }
    }
}

impl OrchestratorConfig {
    /// Load from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        info!("Loaded orchestrator configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_steps == 0 {
            return Err(Error::Configuration("maxParallelSteps must be at least 1".into()));
        }
        for (name, value) in [
            ("lockTimeoutSecs", self.lock_timeout_secs),
            ("fileTaskTimeoutSecs", self.file_task_timeout_secs),
            ("storageIoControlTimeoutSecs", self.storage_io_control_timeout_secs),
        ] {
            if value == 0 {
                return Err(Error::Configuration(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_parallel_steps: self.max_parallel_steps,
            lock_timeout: Duration::from_secs(self.lock_timeout_secs),
        }
    }

    fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            file_task_timeout: Duration::from_secs(self.file_task_timeout_secs),
            storage_io_control_timeout: Duration::from_secs(self.storage_io_control_timeout_secs),
        }
    }
}

// =============================================================================
// Task Report
// =============================================================================

/// What a caller gets back from an entry point
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub op_id: String,
    pub status: OperationStatus,
    #[serde(default)]
    pub message: Option<String>,
    /// Absent when the operation was rejected before any step was created
    #[serde(default)]
    pub saga: Option<SagaReport>,
}

impl TaskReport {
    pub fn is_ready(&self) -> bool {
        self.status == OperationStatus::Ready
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Entry points for compute-topology changes
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: TopologyStoreRef,
    reconciler: ExportReconciler,
    engine: Arc<SagaEngine>,
    metrics: Arc<OrchestratorMetrics>,
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(
        config: OrchestratorConfig,
        store: TopologyStoreRef,
        devices: DeviceSet,
        connectivity: ConnectivityCheckerRef,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let metrics = OrchestratorMetrics::new()?;
        let dispatcher = DeviceDispatcher::new(config.dispatch_config(), store.clone(), devices);
        let engine =
            SagaEngine::with_metrics(config.engine_config(), Arc::new(dispatcher), metrics.clone());

        info!(
            "Orchestrator initialized (rollback {}, version enforcement {})",
            if config.rollback_allowed { "on" } else { "off" },
            if config.enforce_export_group_versions { "on" } else { "off" }
        );
        Ok(Arc::new(Self {
            config,
            reconciler: ExportReconciler::new(store.clone(), connectivity),
            store,
            engine,
            metrics,
        }))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &TopologyStoreRef {
        &self.store
    }

    pub fn engine(&self) -> &Arc<SagaEngine> {
        &self.engine
    }

    pub fn reconciler(&self) -> &ExportReconciler {
        &self.reconciler
    }

    pub fn metrics(&self) -> &Arc<OrchestratorMetrics> {
        &self.metrics
    }

    /// Stop in-flight bounded waits
    pub fn shutdown(&self) {
        self.engine.shutdown();
    }

    // -------------------------------------------------------------------------
    // Initiators
    // -------------------------------------------------------------------------

    /// Add a host's initiators to the host and cluster export groups that
    /// reference the host
    pub async fn add_initiators_to_export(
        &self,
        host: &ResourceId,
        initiators: &[ResourceId],
        triggered_by_event: bool,
        op_id: &str,
    ) -> TaskReport {
        let completer = self.task_completer(ResourceKind::Initiator, initiators.to_vec(), op_id);
        let planned = async {
            let change = TopologyChange::InitiatorsAdded {
                host: host.clone(),
                initiators: initiators.to_vec(),
                triggered_by_event,
            };
            let diffs = self.reconciler.reconcile(&change).await?;
            let mut workflow = self.workflow("add_initiators_to_export", op_id);
            self.plan_export_diffs(workflow.graph_mut(), &diffs, WaitFor::none())
                .await?;

            let excluded: BTreeSet<&ResourceId> =
                diffs.iter().flat_map(|d| d.excluded_initiators.iter()).collect();
            let mut message = format!(
                "Added initiators of host {} to {} export groups",
                host,
                diffs.iter().filter(|d| !d.is_noop()).count()
            );
            if !excluded.is_empty() {
                message.push_str(&format!(
                    "; excluded without storage port connectivity: {}",
                    join(excluded)
                ));
            }
            Ok::<_, Error>((workflow, message))
        }
        .await;
        self.run(planned, completer).await
    }

    pub async fn remove_initiators_from_export(
        &self,
        host: &ResourceId,
        initiators: &[ResourceId],
        op_id: &str,
    ) -> TaskReport {
        let completer = self.task_completer(ResourceKind::Initiator, initiators.to_vec(), op_id);
        let planned = async {
            let change = TopologyChange::InitiatorsRemoved {
                host: host.clone(),
                initiators: initiators.to_vec(),
            };
            let diffs = self.reconciler.reconcile(&change).await?;
            let mut workflow = self.workflow("remove_initiators_from_export", op_id);
            self.plan_export_diffs(workflow.graph_mut(), &diffs, WaitFor::none())
                .await?;
            let message = format!(
                "Removed {} initiators of host {} from {} export groups",
                initiators.len(),
                host,
                diffs.len()
            );
            Ok::<_, Error>((workflow, message))
        }
        .await;
        self.run(planned, completer).await
    }

    // -------------------------------------------------------------------------
    // Cluster membership
    // -------------------------------------------------------------------------

    /// Add hosts to the cluster's export groups and point them at the
    /// cluster. With `cleanup_prior_cluster`, hosts moving from another
    /// cluster are first removed from that cluster's export groups.
    pub async fn add_hosts_to_cluster_export(
        &self,
        cluster: &ResourceId,
        hosts: &[ResourceId],
        cleanup_prior_cluster: bool,
        op_id: &str,
    ) -> TaskReport {
        let completer = self.task_completer(ResourceKind::Host, hosts.to_vec(), op_id);
        let planned = async {
            let records = self.load_hosts(hosts).await?;
            let mut changes = Vec::new();
            if cleanup_prior_cluster {
                for host in &records {
                    if let Some(prior) = host.cluster.as_ref().filter(|c| *c != cluster) {
                        debug!("Host {} leaves prior cluster {}", host.id, prior);
                        changes.push(TopologyChange::HostsRemovedFromCluster {
                            cluster: prior.clone(),
                            hosts: vec![host.id.clone()],
                        });
                    }
                }
            }
            changes.push(TopologyChange::HostsAddedToCluster {
                cluster: cluster.clone(),
                hosts: hosts.to_vec(),
            });
            let diffs = self.reconciler.reconcile_many(&changes).await?;

            let mut workflow = self.workflow("add_hosts_to_cluster_export", op_id);
            let graph = workflow.graph_mut();
            let tails = self.plan_export_diffs(graph, &diffs, WaitFor::none()).await?;
            for host in records.iter().filter(|h| h.cluster.as_ref() != Some(cluster)) {
                steps::host_cluster_step(graph, WaitFor::all(tails.clone()), host, Some(cluster.clone()))?;
            }
            let message = format!("Added {} hosts to cluster {} exports", hosts.len(), cluster);
            Ok::<_, Error>((workflow, message))
        }
        .await;
        self.run(planned, completer).await
    }

    pub async fn remove_hosts_from_cluster_export(
        &self,
        cluster: &ResourceId,
        hosts: &[ResourceId],
        op_id: &str,
    ) -> TaskReport {
        let completer = self.task_completer(ResourceKind::Host, hosts.to_vec(), op_id);
        let planned = async {
            let records = self.load_hosts(hosts).await?;
            let change = TopologyChange::HostsRemovedFromCluster {
                cluster: cluster.clone(),
                hosts: hosts.to_vec(),
            };
            let diffs = self.reconciler.reconcile(&change).await?;

            let mut workflow = self.workflow("remove_hosts_from_cluster_export", op_id);
            let graph = workflow.graph_mut();
            let tails = self.plan_export_diffs(graph, &diffs, WaitFor::none()).await?;
            for host in records.iter().filter(|h| h.cluster.as_ref() == Some(cluster)) {
                steps::host_cluster_step(graph, WaitFor::all(tails.clone()), host, None)?;
            }
            let message = format!("Removed {} hosts from cluster {} exports", hosts.len(), cluster);
            Ok::<_, Error>((workflow, message))
        }
        .await;
        self.run(planned, completer).await
    }

    /// Converge the cluster's export groups onto its current host list
    pub async fn synchronize_cluster_export(&self, cluster: &ResourceId, op_id: &str) -> TaskReport {
        let completer = self.task_completer(ResourceKind::Cluster, vec![cluster.clone()], op_id);
        let planned = async {
            let diffs = self
                .reconciler
                .reconcile(&TopologyChange::ClusterSync {
                    cluster: cluster.clone(),
                })
                .await?;
            let mut workflow = self.workflow("synchronize_cluster_export", op_id);
            self.plan_export_diffs(workflow.graph_mut(), &diffs, WaitFor::none())
                .await?;
            let message = format!(
                "Synchronized {} export groups of cluster {}",
                diffs.len(),
                cluster
            );
            Ok::<_, Error>((workflow, message))
        }
        .await;
        self.run(planned, completer).await
    }

    // -------------------------------------------------------------------------
    // File shares
    // -------------------------------------------------------------------------

    pub async fn remove_ip_interface_from_file_shares(
        &self,
        ip_interface: &ResourceId,
        op_id: &str,
    ) -> TaskReport {
        let completer =
            self.task_completer(ResourceKind::IpInterface, vec![ip_interface.clone()], op_id);
        let planned = async {
            let interface = self
                .store
                .ip_interface(ip_interface)
                .await?
                .ok_or_else(|| Error::not_found(ResourceKind::IpInterface, ip_interface))?;
            let endpoints = BTreeSet::from([interface.address.clone()]);

            let mut workflow = self.workflow("remove_ip_interface_from_file_shares", op_id);
            let shares = self.plan_file_shares(workflow.graph_mut(), &endpoints).await?;
            let message = format!(
                "Removed {} from the exports of {} file shares",
                interface.address, shares
            );
            Ok::<_, Error>((workflow, message))
        }
        .await;
        self.run(planned, completer).await
    }

    // -------------------------------------------------------------------------
    // Detach
    // -------------------------------------------------------------------------

    /// Remove the host from every block and file export. With
    /// `deactivate_on_complete` the host, its initiators and IP interfaces
    /// are retired once everything succeeded.
    pub async fn detach_host_storage(
        &self,
        host: &ResourceId,
        deactivate_on_complete: bool,
        op_id: &str,
    ) -> TaskReport {
        let completer = self.resource_completer(ResourceKind::Host, host, op_id, deactivate_on_complete);
        let planned = async {
            let diffs = self
                .reconciler
                .reconcile(&TopologyChange::HostRemoved { host: host.clone() })
                .await?;
            let endpoints = host_endpoints(&self.store, host).await?;

            let mut workflow = self.workflow("detach_host_storage", op_id);
            self.plan_export_diffs(workflow.graph_mut(), &diffs, WaitFor::none())
                .await?;
            let shares = self.plan_file_shares(workflow.graph_mut(), &endpoints).await?;
            let message = format!(
                "Detached storage of host {}: {} export groups, {} file shares",
                host,
                diffs.len(),
                shares
            );
            Ok::<_, Error>((workflow, message))
        }
        .await;
        self.run(planned, completer).await
    }

    pub async fn detach_cluster_storage(
        &self,
        cluster: &ResourceId,
        deactivate_on_complete: bool,
        op_id: &str,
    ) -> TaskReport {
        let completer =
            self.resource_completer(ResourceKind::Cluster, cluster, op_id, deactivate_on_complete);
        let planned = async {
            let diffs = self
                .reconciler
                .reconcile(&TopologyChange::ClusterDetached {
                    cluster: cluster.clone(),
                })
                .await?;
            let hosts = self
                .store
                .query(&Constraint::HostsByCluster(cluster.clone()))
                .await?;
            let endpoints = self.endpoints_of(&hosts).await?;

            let mut workflow = self.workflow("detach_cluster_storage", op_id);
            self.plan_export_diffs(workflow.graph_mut(), &diffs, WaitFor::none())
                .await?;
            let shares = self.plan_file_shares(workflow.graph_mut(), &endpoints).await?;
            let message = format!(
                "Detached storage of cluster {}: {} export groups, {} file shares",
                cluster,
                diffs.len(),
                shares
            );
            Ok::<_, Error>((workflow, message))
        }
        .await;
        self.run(planned, completer).await
    }

    pub async fn detach_datacenter_storage(
        &self,
        datacenter: &ResourceId,
        deactivate_on_complete: bool,
        op_id: &str,
    ) -> TaskReport {
        let completer = self.resource_completer(
            ResourceKind::VcenterDataCenter,
            datacenter,
            op_id,
            deactivate_on_complete,
        );
        let planned = async {
            let diffs = self
                .reconciler
                .reconcile(&TopologyChange::DatacenterDetached {
                    datacenter: datacenter.clone(),
                })
                .await?;
            let hosts = self.datacenter_hosts(datacenter).await?;
            let endpoints = self.endpoints_of(&hosts).await?;

            let mut workflow = self.workflow("detach_datacenter_storage", op_id);
            self.plan_export_diffs(workflow.graph_mut(), &diffs, WaitFor::none())
                .await?;
            let shares = self.plan_file_shares(workflow.graph_mut(), &endpoints).await?;
            let message = format!(
                "Detached storage of datacenter {}: {} export groups, {} file shares",
                datacenter,
                diffs.len(),
                shares
            );
            Ok::<_, Error>((workflow, message))
        }
        .await;
        self.run(planned, completer).await
    }

    pub async fn detach_vcenter_storage(
        &self,
        vcenter: &ResourceId,
        deactivate_on_complete: bool,
        op_id: &str,
    ) -> TaskReport {
        let completer =
            self.resource_completer(ResourceKind::Vcenter, vcenter, op_id, deactivate_on_complete);
        let planned = async {
            if self.store.vcenter(vcenter).await?.is_none() {
                return Err(Error::not_found(ResourceKind::Vcenter, vcenter));
            }
            let datacenters = self
                .store
                .query(&Constraint::DatacentersByVcenter(vcenter.clone()))
                .await?;
            let changes: Vec<TopologyChange> = datacenters
                .iter()
                .map(|dc| TopologyChange::DatacenterDetached {
                    datacenter: dc.clone(),
                })
                .collect();
            let diffs = self.reconciler.reconcile_many(&changes).await?;

            let mut hosts = Vec::new();
            for dc in &datacenters {
                hosts.extend(self.datacenter_hosts(dc).await?);
            }
            let endpoints = self.endpoints_of(&hosts).await?;

            let mut workflow = self.workflow("detach_vcenter_storage", op_id);
            self.plan_export_diffs(workflow.graph_mut(), &diffs, WaitFor::none())
                .await?;
            let shares = self.plan_file_shares(workflow.graph_mut(), &endpoints).await?;
            let message = format!(
                "Detached storage of vCenter {} ({} datacenters): {} export groups, {} file shares",
                vcenter,
                datacenters.len(),
                diffs.len(),
                shares
            );
            Ok::<_, Error>((workflow, message))
        }
        .await;
        self.run(planned, completer).await
    }

    // -------------------------------------------------------------------------
    // Boot volume
    // -------------------------------------------------------------------------

    /// Record the host's boot volume and, optionally, propagate it to the
    /// host's SAN boot targets
    pub async fn set_host_boot_volume(
        &self,
        host: &ResourceId,
        volume: &ResourceId,
        update_san_boot_targets: bool,
        op_id: &str,
    ) -> TaskReport {
        let completer = self.task_completer(ResourceKind::Host, vec![host.clone()], op_id);
        let planned = async {
            let record = self.active_host(host).await?;
            match self.store.volume(volume).await? {
                Some(v) if !v.inactive => {}
                Some(_) => return Err(Error::inactive(ResourceKind::Volume, volume)),
                None => return Err(Error::not_found(ResourceKind::Volume, volume)),
            }
            if !self.exported_to_host(&record, volume).await? {
                return Err(Error::Validation(format!(
                    "volume {} is not exported to host {}",
                    volume, host
                )));
            }
            if update_san_boot_targets && record.compute_element.is_none() {
                return Err(Error::Validation(format!(
                    "host {} has no compute element to propagate SAN boot targets to",
                    host
                )));
            }

            let mut workflow = self.workflow("set_host_boot_volume", op_id);
            let graph = workflow.graph_mut();
            let boot = steps::boot_volume_step(graph, WaitFor::none(), &record, volume)?;
            if update_san_boot_targets {
                steps::san_boot_target_step(graph, boot, &record, volume)?;
            }
            Ok::<_, Error>((workflow, format!("Boot volume of host {} set to {}", host, volume)))
        }
        .await;
        self.run(planned, completer).await
    }

    // -------------------------------------------------------------------------
    // Host-local mounts
    // -------------------------------------------------------------------------

    pub async fn mount_host_device(
        &self,
        host: &ResourceId,
        entry: &FstabEntry,
        op_id: &str,
    ) -> TaskReport {
        let completer = self.task_completer(ResourceKind::Host, vec![host.clone()], op_id);
        let planned = async {
            self.active_host(host).await?;
            validate_mount_path(&entry.mount_path)?;
            let mut workflow = self.workflow("mount_host_device", op_id);
            steps::mount_steps(workflow.graph_mut(), WaitFor::none(), host, entry)?;
            Ok::<_, Error>((
                workflow,
                format!("Mounted {} at {} on host {}", entry.device, entry.mount_path, host),
            ))
        }
        .await;
        self.run(planned, completer).await
    }

    pub async fn unmount_host_device(
        &self,
        host: &ResourceId,
        mount_path: &str,
        op_id: &str,
    ) -> TaskReport {
        let completer = self.task_completer(ResourceKind::Host, vec![host.clone()], op_id);
        let planned = async {
            self.active_host(host).await?;
            validate_mount_path(mount_path)?;
            let mut workflow = self.workflow("unmount_host_device", op_id);
            steps::unmount_steps(workflow.graph_mut(), WaitFor::none(), host, mount_path)?;
            Ok::<_, Error>((workflow, format!("Unmounted {} on host {}", mount_path, host)))
        }
        .await;
        self.run(planned, completer).await
    }

    // -------------------------------------------------------------------------
    // Planning
    // -------------------------------------------------------------------------

    /// Steps for a set of export-group diffs.
    ///
    /// Managed ESX hosts leaving a group get their datastores detached before
    /// the export step; hosts joining get datastores attached after it.
    /// Returns the tokens later steps should wait for.
    pub async fn plan_export_diffs(
        &self,
        graph: &mut StepGraph,
        diffs: &[ExportGroupDiff],
        wait_for: WaitFor,
    ) -> Result<Vec<StepToken>> {
        let mut tails = Vec::new();
        for diff in diffs.iter().filter(|d| !d.is_noop()) {
            let mut detached = Vec::new();
            for host in self.managed_hosts(&diff.update.removed_hosts).await? {
                for volume in diff.volumes.keys() {
                    detached.push(steps::datastore_detach_steps(
                        graph,
                        wait_for.clone(),
                        &host,
                        volume,
                    )?);
                }
            }
            let export_wait = if detached.is_empty() {
                wait_for.clone()
            } else {
                WaitFor::all(detached)
            };
            let export = steps::export_group_step(
                graph,
                export_wait,
                diff,
                self.config.enforce_export_group_versions,
            )?;
            tails.push(export);

            for host in self.managed_hosts(&diff.update.added_hosts).await? {
                for volume in diff.volumes.keys() {
                    tails.push(steps::datastore_attach_step(graph, export, &host, volume)?);
                }
            }
        }
        Ok(tails)
    }

    /// File-share steps for every share exported to `endpoints`; returns
    /// the number of shares affected
    async fn plan_file_shares(
        &self,
        graph: &mut StepGraph,
        endpoints: &BTreeSet<String>,
    ) -> Result<usize> {
        if endpoints.is_empty() {
            return Ok(0);
        }
        let diffs = plan_endpoint_withdrawal(&self.store, endpoints).await?;
        for diff in &diffs {
            steps::file_share_steps(graph, WaitFor::none(), diff)?;
        }
        Ok(diffs.len())
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    fn workflow(&self, name: &str, op_id: &str) -> Workflow {
        self.engine
            .new_workflow(OWNER, name, self.config.rollback_allowed, op_id)
    }

    fn task_completer(&self, kind: ResourceKind, ids: Vec<ResourceId>, op_id: &str) -> CompleterRef {
        Arc::new(TaskCompleter::new(self.store.clone(), kind, ids, op_id))
    }

    fn resource_completer(
        &self,
        kind: ResourceKind,
        id: &ResourceId,
        op_id: &str,
        deactivate_on_complete: bool,
    ) -> CompleterRef {
        Arc::new(ResourceCompleter::new(
            self.store.clone(),
            kind,
            [id.clone()],
            op_id,
            deactivate_on_complete,
        ))
    }

    /// Execute a planned workflow, or record why planning failed
    async fn run(&self, planned: Result<(Workflow, String)>, completer: CompleterRef) -> TaskReport {
        let op_id = completer.op_id().to_string();
        if let Err(e) = completer.begin().await {
            warn!("Could not record pending status for {}: {}", op_id, e);
        }

        let saga = match planned {
            Ok((workflow, success_message)) => {
                info!(
                    "Operation {} ({}) planned with {} steps",
                    op_id,
                    workflow.name,
                    workflow.graph().len()
                );
                match self
                    .engine
                    .execute_plan(workflow, completer.clone(), &success_message)
                    .await
                {
                    Ok(report) => Some(report),
                    Err(e) => {
                        error!("Operation {} could not be executed: {}", op_id, e);
                        None
                    }
                }
            }
            Err(e) => {
                warn!("Operation {} rejected: {}", op_id, e);
                if let Err(ce) = completer.error(format!("[{}] {}", e.class(), e)).await {
                    warn!("Completer for {} failed: {}", op_id, ce);
                }
                None
            }
        };

        TaskReport {
            op_id,
            status: completer.status(),
            message: completer.message(),
            saga,
        }
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    async fn active_host(&self, id: &ResourceId) -> Result<Host> {
        let host = self
            .store
            .host(id)
            .await?
            .ok_or_else(|| Error::not_found(ResourceKind::Host, id))?;
        if host.inactive {
            return Err(Error::inactive(ResourceKind::Host, id));
        }
        Ok(host)
    }

    async fn load_hosts(&self, ids: &[ResourceId]) -> Result<Vec<Host>> {
        let mut hosts = Vec::with_capacity(ids.len());
        for id in ids {
            hosts.push(self.active_host(id).await?);
        }
        Ok(hosts)
    }

    /// Hosts among `ids` whose datastores are managed through a vCenter
    async fn managed_hosts(&self, ids: &BTreeSet<ResourceId>) -> Result<Vec<ResourceId>> {
        let mut managed = Vec::new();
        for id in ids {
            if let Some(host) = self.store.host(id).await? {
                if host.has_managed_datastores() {
                    managed.push(host.id);
                }
            }
        }
        Ok(managed)
    }

    /// Hosts placed directly in the datacenter or in one of its clusters
    async fn datacenter_hosts(&self, datacenter: &ResourceId) -> Result<Vec<ResourceId>> {
        let mut hosts: BTreeSet<ResourceId> = self
            .store
            .query(&Constraint::HostsByDatacenter(datacenter.clone()))
            .await?
            .into_iter()
            .collect();
        for cluster in self
            .store
            .query(&Constraint::ClustersByDatacenter(datacenter.clone()))
            .await?
        {
            hosts.extend(self.store.query(&Constraint::HostsByCluster(cluster)).await?);
        }
        Ok(hosts.into_iter().collect())
    }

    async fn endpoints_of(&self, hosts: &[ResourceId]) -> Result<BTreeSet<String>> {
        let mut endpoints = BTreeSet::new();
        for host in hosts {
            endpoints.extend(host_endpoints(&self.store, host).await?);
        }
        Ok(endpoints)
    }

    async fn exported_to_host(&self, host: &Host, volume: &ResourceId) -> Result<bool> {
        let mut groups = self
            .store
            .query(&Constraint::ExportGroupsByHost(host.id.clone()))
            .await?;
        if let Some(cluster) = &host.cluster {
            groups.extend(
                self.store
                    .query(&Constraint::ExportGroupsByCluster(cluster.clone()))
                    .await?,
            );
        }
        for id in groups {
            let exported = self
                .store
                .export_group(&id)
                .await?
                .map(|g: ExportGroup| g.volumes.contains_key(volume))
                .unwrap_or(false);
            if exported {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn validate_mount_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || path == "/" {
        return Err(Error::Validation(format!(
            "mount path {:?} must be an absolute path below /",
            path
        )));
    }
    Ok(())
}

fn join<'a>(ids: impl IntoIterator<Item = &'a ResourceId>) -> String {
    ids.into_iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::devices::{DatastoreState, HostFilesystem, InMemoryDevices};
    use crate::domain::model::{
        Cluster, ExportGroupKind, ExportMask, FileExportRule, FileShare, HostType, Initiator,
        InitiatorProtocol, IpInterface, StoragePort, Vcenter, VcenterDataCenter, Volume,
    };
    use crate::domain::ports::NetworkConnectivity;
    use crate::store::InMemoryStore;
    use crate::workflow::SagaOutcome;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;

    fn ids(items: &[&str]) -> BTreeSet<ResourceId> {
        items.iter().map(|s| ResourceId::from(*s)).collect()
    }

    fn host(id: &str, cluster: Option<&str>) -> Host {
        let mut host = Host::new(id, format!("{}.lab", id));
        host.cluster = cluster.map(ResourceId::from);
        host.vcenter_datacenter = Some("dc-1".into());
        host
    }

    fn initiator(id: &str, host: &str, network: &str) -> Initiator {
        Initiator {
            id: id.into(),
            host: host.into(),
            port: format!("iqn.2024-01.lab:{}", id),
            protocol: InitiatorProtocol::Iscsi,
            network: Some(network.to_string()),
            inactive: false,
        }
    }

    fn group(
        id: &str,
        kind: ExportGroupKind,
        clusters: &[&str],
        hosts: &[&str],
        initiators: &[&str],
        volume: &str,
    ) -> ExportGroup {
        let mut g = ExportGroup::new(id, id, kind, "array-1");
        g.clusters = ids(clusters);
        g.hosts = ids(hosts);
        g.initiators = ids(initiators);
        g.volumes = BTreeMap::from([(ResourceId::from(volume), 1)]);
        g.storage_ports.push(StoragePort {
            name: "port-1".into(),
            network: "fabric-a".into(),
        });
        g
    }

    /// c1 = {h1, h2}, c2 = {h3}; h4 is a standalone ESX host
    async fn seeded(config: OrchestratorConfig) -> (Arc<InMemoryStore>, InMemoryDevices, Arc<Orchestrator>) {
        let store = InMemoryStore::new();
        store
            .put_vcenter(Vcenter {
                id: "vc-1".into(),
                label: "vc".into(),
                inactive: false,
            })
            .await
            .unwrap();
        store
            .put_datacenter(VcenterDataCenter {
                id: "dc-1".into(),
                label: "dc".into(),
                vcenter: "vc-1".into(),
                inactive: false,
            })
            .await
            .unwrap();
        for c in ["c1", "c2"] {
            store
                .put_cluster(Cluster {
                    id: c.into(),
                    label: c.into(),
                    vcenter_datacenter: Some("dc-1".into()),
                    inactive: false,
                })
                .await
                .unwrap();
        }
        store.put_host(host("h1", Some("c1"))).await.unwrap();
        store.put_host(host("h2", Some("c1"))).await.unwrap();
        store.put_host(host("h3", Some("c2"))).await.unwrap();
        let mut h4 = host("h4", None);
        h4.host_type = HostType::Esx;
        store.put_host(h4).await.unwrap();

        for (i, h) in [("i1", "h1"), ("i2", "h1"), ("i3", "h2"), ("i4", "h2"), ("i5", "h3"), ("i6", "h4")] {
            store.put_initiator(initiator(i, h, "fabric-a")).await.unwrap();
        }
        for (ip, h, addr) in [("ip-1", "h1", "10.0.0.1"), ("ip-2", "h2", "10.0.0.2")] {
            store
                .put_ip_interface(IpInterface {
                    id: ip.into(),
                    host: h.into(),
                    address: addr.into(),
                    inactive: false,
                })
                .await
                .unwrap();
        }
        for v in ["vol-1", "vol-2", "vol-3", "vol-4"] {
            store
                .put_volume(Volume {
                    id: v.into(),
                    label: v.into(),
                    storage_system: "array-1".into(),
                    wwn: String::new(),
                    inactive: false,
                })
                .await
                .unwrap();
        }

        let groups = [
            group("eg-c1", ExportGroupKind::Cluster, &["c1"], &["h1", "h2"], &["i1", "i2", "i3", "i4"], "vol-1"),
            group("eg-h12", ExportGroupKind::Host, &[], &["h1", "h2"], &["i1", "i2", "i3", "i4"], "vol-2"),
            group("eg-c2", ExportGroupKind::Cluster, &["c2"], &["h3"], &["i5"], "vol-3"),
            group("eg-h4", ExportGroupKind::Host, &[], &["h4"], &["i6"], "vol-4"),
        ];
        for g in groups {
            store.put_export_group(g).await.unwrap();
        }
        store
            .put_export_mask(ExportMask {
                id: "em-4".into(),
                export_group: "eg-h4".into(),
                storage_system: "array-1".into(),
                initiators: ids(&["i6"]),
                volumes: ids(&["vol-4"]),
                inactive: false,
            })
            .await
            .unwrap();
        store
            .put_file_share(FileShare {
                id: "fs-1".into(),
                label: "home".into(),
                storage_device: "nas-1".into(),
                mount_path: "/ifs/home".into(),
                exports: vec![FileExportRule::new(
                    "/ifs/home",
                    ["10.0.0.1".to_string(), "10.0.0.2".to_string()],
                )],
                inactive: false,
            })
            .await
            .unwrap();

        let devices = InMemoryDevices::new(store.clone());
        let orchestrator = Orchestrator::new(
            config,
            store.clone(),
            devices.device_set(),
            Arc::new(NetworkConnectivity),
        )
        .unwrap();
        (store, devices, orchestrator)
    }

    #[test]
    fn test_config_load_and_validate() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "maxParallelSteps: 4\nenforceExportGroupVersions: true").unwrap();
        let config = OrchestratorConfig::load(file.path()).unwrap();
        assert_eq!(config.max_parallel_steps, 4);
        assert!(config.enforce_export_group_versions);
        assert_eq!(config.lock_timeout_secs, 30);
        assert!(config.rollback_allowed);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "fileTaskTimeoutSecs: 0").unwrap();
        assert_matches!(OrchestratorConfig::load(file.path()), Err(Error::Configuration(_)));
    }

    async fn export_group(store: &InMemoryStore, id: &str) -> ExportGroup {
        store.export_group(&id.into()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_detach_host_keeps_groups_with_remaining_hosts() {
        let (store, _devices, orchestrator) = seeded(OrchestratorConfig::default()).await;

        let report = orchestrator.detach_host_storage(&"h2".into(), false, "op-1").await;
        assert!(report.is_ready(), "{:?}", report.message);

        let g = export_group(&store, "eg-h12").await;
        assert!(!g.inactive);
        assert_eq!(g.hosts, ids(&["h1"]));
        assert_eq!(g.initiators, ids(&["i1", "i2"]));
        assert_eq!(export_group(&store, "eg-c1").await.hosts, ids(&["h1"]));

        let share = store.file_share(&"fs-1".into()).await.unwrap().unwrap();
        assert_eq!(share.exports[0].endpoints, BTreeSet::from(["10.0.0.1".to_string()]));

        let h2 = store.host(&"h2".into()).await.unwrap().unwrap();
        assert!(!h2.inactive);
        let record = store.operation(&"h2".into(), "op-1").await.unwrap().unwrap();
        assert_eq!(record.status, OperationStatus::Ready);
    }

    #[tokio::test]
    async fn test_detach_last_host_deletes_group_and_deactivates() {
        let (store, devices, orchestrator) = seeded(OrchestratorConfig::default()).await;
        devices
            .host
            .add_datastore(&"h4".into(), &"vol-4".into(), DatastoreState::default())
            .await;

        let report = orchestrator.detach_host_storage(&"h4".into(), true, "op-2").await;
        assert!(report.is_ready(), "{:?}", report.message);

        let g = export_group(&store, "eg-h4").await;
        assert!(g.inactive);
        assert!(g.volumes.is_empty());
        assert!(store.export_mask(&"em-4".into()).await.unwrap().is_none());

        let ds = devices.host.datastore(&"h4".into(), &"vol-4".into()).await.unwrap();
        assert!(!ds.mounted);
        assert!(!ds.storage_io_control);

        assert!(store.host(&"h4".into()).await.unwrap().unwrap().inactive);
        assert!(store.initiator(&"i6".into()).await.unwrap().unwrap().inactive);
    }

    #[tokio::test]
    async fn test_failed_delete_compensates_datastore_chain() {
        let (store, devices, orchestrator) = seeded(OrchestratorConfig::default()).await;
        devices
            .host
            .add_datastore(&"h4".into(), &"vol-4".into(), DatastoreState::default())
            .await;
        devices.block.failures().fail("export_group_delete");

        let report = orchestrator.detach_host_storage(&"h4".into(), true, "op-3").await;
        assert_eq!(report.status, OperationStatus::Error);
        assert_matches!(report.saga.as_ref().unwrap().outcome, SagaOutcome::Compensated { .. });
        assert!(!report.message.unwrap().contains("manual cleanup"));

        let ds = devices.host.datastore(&"h4".into(), &"vol-4".into()).await.unwrap();
        assert!(ds.mounted);
        assert!(ds.storage_io_control);
        assert!(!store.host(&"h4".into()).await.unwrap().unwrap().inactive);
        assert!(store.export_mask(&"em-4".into()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_event_triggered_add_requires_connectivity() {
        let (store, _devices, orchestrator) = seeded(OrchestratorConfig::default()).await;
        store.put_initiator(initiator("i7", "h1", "fabric-b")).await.unwrap();

        let report = orchestrator
            .add_initiators_to_export(&"h1".into(), &["i7".into()], true, "op-4")
            .await;
        assert_eq!(report.status, OperationStatus::Error);
        assert!(report.saga.is_none());
        assert!(report.message.unwrap().starts_with("[validation]"));

        let report = orchestrator
            .add_initiators_to_export(&"h1".into(), &["i7".into()], false, "op-5")
            .await;
        assert!(report.is_ready());
        assert!(report.message.unwrap().contains("excluded without storage port connectivity: i7"));
        assert!(!export_group(&store, "eg-c1").await.initiators.contains(&"i7".into()));
    }

    #[tokio::test]
    async fn test_add_hosts_moves_host_between_clusters() {
        let (store, _devices, orchestrator) = seeded(OrchestratorConfig::default()).await;

        let report = orchestrator
            .add_hosts_to_cluster_export(&"c1".into(), &["h3".into()], true, "op-6")
            .await;
        assert!(report.is_ready(), "{:?}", report.message);

        let c1 = export_group(&store, "eg-c1").await;
        assert!(c1.hosts.contains(&"h3".into()));
        assert!(c1.initiators.contains(&"i5".into()));

        // the cluster group keeps its cluster, so it is updated, not deleted
        let c2 = export_group(&store, "eg-c2").await;
        assert!(!c2.inactive);
        assert!(c2.hosts.is_empty());

        let h3 = store.host(&"h3".into()).await.unwrap().unwrap();
        assert_eq!(h3.cluster, Some("c1".into()));
    }

    #[tokio::test]
    async fn test_failed_export_update_leaves_cluster_reference() {
        let (store, devices, orchestrator) = seeded(OrchestratorConfig::default()).await;
        devices.block.failures().fail("export_group_update");

        let report = orchestrator
            .remove_hosts_from_cluster_export(&"c1".into(), &["h2".into()], "op-7")
            .await;
        assert_eq!(report.status, OperationStatus::Error);
        let h2 = store.host(&"h2".into()).await.unwrap().unwrap();
        assert_eq!(h2.cluster, Some("c1".into()));
        assert_eq!(export_group(&store, "eg-c1").await.hosts, ids(&["h1", "h2"]));
    }

    #[tokio::test]
    async fn test_synchronize_cluster_export_converges() {
        let (store, _devices, orchestrator) = seeded(OrchestratorConfig::default()).await;
        let mut h3 = store.host(&"h3".into()).await.unwrap().unwrap();
        h3.cluster = Some("c1".into());
        store.put_host(h3).await.unwrap();
        let mut h2 = store.host(&"h2".into()).await.unwrap().unwrap();
        h2.cluster = None;
        store.put_host(h2).await.unwrap();

        let report = orchestrator.synchronize_cluster_export(&"c1".into(), "op-8").await;
        assert!(report.is_ready(), "{:?}", report.message);
        let c1 = export_group(&store, "eg-c1").await;
        assert_eq!(c1.hosts, ids(&["h1", "h3"]));
        assert_eq!(c1.initiators, ids(&["i1", "i2", "i5"]));
    }

    #[tokio::test]
    async fn test_detach_cluster_deletes_cluster_group() {
        let (store, _devices, orchestrator) = seeded(OrchestratorConfig::default()).await;
        let report = orchestrator.detach_cluster_storage(&"c2".into(), true, "op-9").await;
        assert!(report.is_ready(), "{:?}", report.message);

        assert!(export_group(&store, "eg-c2").await.inactive);
        assert!(store.cluster(&"c2".into()).await.unwrap().unwrap().inactive);
        assert_eq!(store.host(&"h3".into()).await.unwrap().unwrap().cluster, None);
    }

    #[tokio::test]
    async fn test_detach_vcenter_retires_datacenters() {
        let (store, _devices, orchestrator) = seeded(OrchestratorConfig::default()).await;
        let report = orchestrator.detach_vcenter_storage(&"vc-1".into(), true, "op-10").await;
        assert!(report.is_ready(), "{:?}", report.message);

        for g in ["eg-c1", "eg-h12", "eg-c2", "eg-h4"] {
            assert!(export_group(&store, g).await.inactive, "{} still active", g);
        }
        assert!(store.file_share(&"fs-1".into()).await.unwrap().unwrap().exports.is_empty());
        assert!(store.vcenter(&"vc-1".into()).await.unwrap().unwrap().inactive);
        assert!(store.datacenter(&"dc-1".into()).await.unwrap().unwrap().inactive);
    }

    #[tokio::test]
    async fn test_remove_ip_interface_from_file_shares() {
        let (store, _devices, orchestrator) = seeded(OrchestratorConfig::default()).await;
        let report = orchestrator
            .remove_ip_interface_from_file_shares(&"ip-1".into(), "op-11")
            .await;
        assert!(report.is_ready(), "{:?}", report.message);
        let share = store.file_share(&"fs-1".into()).await.unwrap().unwrap();
        assert_eq!(share.exports[0].endpoints, BTreeSet::from(["10.0.0.2".to_string()]));
    }

    #[tokio::test]
    async fn test_boot_volume_validation_and_san_propagation() {
        let (store, devices, orchestrator) = seeded(OrchestratorConfig::default()).await;

        let report = orchestrator
            .set_host_boot_volume(&"h1".into(), &"vol-3".into(), false, "op-12")
            .await;
        assert_eq!(report.status, OperationStatus::Error);
        assert!(report.message.unwrap().contains("not exported"));

        let report = orchestrator
            .set_host_boot_volume(&"h1".into(), &"vol-1".into(), true, "op-13")
            .await;
        assert!(report.message.unwrap().contains("compute element"));

        let mut h1 = store.host(&"h1".into()).await.unwrap().unwrap();
        h1.compute_element = Some("blade-1".into());
        store.put_host(h1).await.unwrap();
        let report = orchestrator
            .set_host_boot_volume(&"h1".into(), &"vol-1".into(), true, "op-14")
            .await;
        assert!(report.is_ready(), "{:?}", report.message);
        assert_eq!(
            store.host(&"h1".into()).await.unwrap().unwrap().boot_volume,
            Some("vol-1".into())
        );
        assert_eq!(devices.host.san_boot_target(&"h1".into()).await, Some("vol-1".into()));
    }

    fn fstab(path: &str) -> FstabEntry {
        FstabEntry {
            device: "/dev/sdb1".into(),
            mount_path: path.into(),
            fs_type: "xfs".into(),
            options: "defaults".into(),
        }
    }

    #[tokio::test]
    async fn test_mount_chain_compensation_restores_host_state() {
        let (_store, devices, orchestrator) = seeded(OrchestratorConfig::default()).await;
        let host = ResourceId::from("h1");
        let before = devices.mount.filesystem(&host).await;
        devices.mount.failures().fail("mount_device");

        let report = orchestrator.mount_host_device(&host, &fstab("/data"), "op-15").await;
        assert_eq!(report.status, OperationStatus::Error);
        assert_eq!(devices.mount.filesystem(&host).await, before);

        devices.mount.failures().clear_all();
        let report = orchestrator.mount_host_device(&host, &fstab("/data"), "op-16").await;
        assert!(report.is_ready(), "{:?}", report.message);
        let fs = devices.mount.filesystem(&host).await;
        assert!(fs.mounted.contains("/data"));
    }

    #[tokio::test]
    async fn test_mount_rollback_keeps_existing_directory() {
        let (_store, devices, orchestrator) = seeded(OrchestratorConfig::default()).await;
        let host = ResourceId::from("h1");
        devices.mount.seed_directory(&host, "/data").await;
        let before = devices.mount.filesystem(&host).await;
        devices.mount.failures().fail("mount_device");

        let report = orchestrator.mount_host_device(&host, &fstab("/data"), "op-15b").await;
        assert_eq!(report.status, OperationStatus::Error);
        let after = devices.mount.filesystem(&host).await;
        assert!(after.directories.contains("/data"));
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_unmount_chain_compensation_restores_fstab() {
        let (_store, devices, orchestrator) = seeded(OrchestratorConfig::default()).await;
        let host = ResourceId::from("h1");
        devices.mount.seed_mount(&host, fstab("/data")).await;
        let before: HostFilesystem = devices.mount.filesystem(&host).await;
        devices.mount.failures().fail("delete_directory");

        let report = orchestrator.unmount_host_device(&host, "/data", "op-17").await;
        assert_eq!(report.status, OperationStatus::Error);
        assert_eq!(devices.mount.filesystem(&host).await, before);
    }

    #[tokio::test]
    async fn test_delete_decision_races_concurrent_add_without_versions() {
        let (store, _devices, orchestrator) = seeded(OrchestratorConfig::default()).await;
        store.put_initiator(initiator("i8", "h4", "fabric-a")).await.unwrap();

        // both diffs read eg-h4 before either runs
        let delete = orchestrator
            .reconciler()
            .reconcile(&TopologyChange::HostRemoved { host: "h4".into() })
            .await
            .unwrap();
        let add = orchestrator
            .reconciler()
            .reconcile(&TopologyChange::InitiatorsAdded {
                host: "h4".into(),
                initiators: vec!["i8".into()],
                triggered_by_event: false,
            })
            .await
            .unwrap();
        assert!(delete[0].is_delete());

        let engine = orchestrator.engine();
        let completer = |op: &str| -> CompleterRef {
            Arc::new(TaskCompleter::for_resource(store.clone(), ResourceKind::Host, "h4".into(), op))
        };
        let mut add_flow = engine.new_workflow("test", "add", true, "op-20");
        orchestrator
            .plan_export_diffs(add_flow.graph_mut(), &add, WaitFor::none())
            .await
            .unwrap();
        let mut delete_flow = engine.new_workflow("test", "delete", true, "op-21");
        orchestrator
            .plan_export_diffs(delete_flow.graph_mut(), &delete, WaitFor::none())
            .await
            .unwrap();

        let added = engine.execute_plan(add_flow, completer("op-20"), "added").await.unwrap();
        assert!(added.outcome.is_success());
        assert!(export_group(&store, "eg-h4").await.initiators.contains(&"i8".into()));

        // the stale delete decision still wins: the freshly added initiator is
        // unexported along with the rest of the group
        let deleted = engine.execute_plan(delete_flow, completer("op-21"), "deleted").await.unwrap();
        assert!(deleted.outcome.is_success());
        let g = export_group(&store, "eg-h4").await;
        assert!(g.inactive);
        assert!(g.initiators.is_empty());
    }

    #[tokio::test]
    async fn test_stale_diff_rejected_when_versions_enforced() {
        let config = OrchestratorConfig {
            enforce_export_group_versions: true,
            ..Default::default()
        };
        let (store, _devices, orchestrator) = seeded(config).await;
        store.put_initiator(initiator("i8", "h1", "fabric-a")).await.unwrap();

        // both diffs observe the same versions of eg-c1 and eg-h12
        let remove = orchestrator
            .reconciler()
            .reconcile(&TopologyChange::InitiatorsRemoved {
                host: "h2".into(),
                initiators: vec!["i3".into()],
            })
            .await
            .unwrap();
        let add = orchestrator
            .reconciler()
            .reconcile(&TopologyChange::InitiatorsAdded {
                host: "h1".into(),
                initiators: vec!["i8".into()],
                triggered_by_event: false,
            })
            .await
            .unwrap();
        assert_eq!(remove.len(), 2);
        assert_eq!(add.len(), 2);

        let engine = orchestrator.engine();
        let mut first = engine.new_workflow("test", "remove", true, "op-18");
        orchestrator
            .plan_export_diffs(first.graph_mut(), &remove, WaitFor::none())
            .await
            .unwrap();
        let mut second = engine.new_workflow("test", "add", true, "op-19");
        orchestrator
            .plan_export_diffs(second.graph_mut(), &add, WaitFor::none())
            .await
            .unwrap();

        let completer = |op: &str| -> CompleterRef {
            Arc::new(TaskCompleter::for_resource(store.clone(), ResourceKind::Host, "h1".into(), op))
        };
        let first = engine.execute_plan(first, completer("op-18"), "removed").await.unwrap();
        assert!(first.outcome.is_success());
        let second = engine.execute_plan(second, completer("op-19"), "added").await.unwrap();
        assert_matches!(
            second.outcome,
            SagaOutcome::Compensated { ref error, .. } if error.contains("Version conflict")
        );
        for id in ["eg-c1", "eg-h12"] {
            let g = export_group(&store, id).await;
            assert!(!g.initiators.contains(&"i3".into()));
            assert!(!g.initiators.contains(&"i8".into()));
        }
    }
}
