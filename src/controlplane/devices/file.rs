//! File Export Controller (in-memory)
//!
//! Every export change runs as an asynchronous task. The caller receives a
//! [`TaskHandle`] immediately and observes completion on its watch channel.
//! Tasks can be stalled to exercise bounded waits and native cancel.

use super::FailureInjector;
use crate::domain::model::{FileExportRule, ResourceId, ResourceKind};
use crate::domain::ports::{FileExportController, TaskHandle, TaskState, TopologyStoreRef};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct FileControllerConfig {
    pub name: String,
    /// Simulated time a task takes before it applies its change
    pub latency: Duration,
}

impl Default for FileControllerConfig {
    fn default() -> Self {
        Self {
            name: "file-export".to_string(),
            latency: Duration::from_millis(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExportChange {
    Export,
    Unexport,
    Replace,
}

impl ExportChange {
    fn operation(&self) -> &'static str {
        match self {
            ExportChange::Export => "export",
            ExportChange::Unexport => "unexport",
            ExportChange::Replace => "update_export",
        }
    }
}

// =============================================================================
// Controller
// =============================================================================

pub struct InMemoryFileController {
    config: FileControllerConfig,
    store: TopologyStoreRef,
    failures: FailureInjector,
    tasks: DashMap<String, Arc<watch::Sender<TaskState>>>,
    stalled: AtomicBool,
}

impl InMemoryFileController {
    pub fn new(config: FileControllerConfig, store: TopologyStoreRef) -> Self {
        Self {
            config,
            store,
            failures: FailureInjector::new(),
            tasks: DashMap::new(),
            stalled: AtomicBool::new(false),
        }
    }

    /// Rejections are keyed by operation (`export`, `unexport`,
    /// `update_export`, `cancel`); asynchronous task failures by the
    /// operation with a `_task` suffix.
    pub fn failures(&self) -> &FailureInjector {
        &self.failures
    }

    /// While stalled, new tasks start running and never finish
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Current state of a task
    pub fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.tasks.get(task_id).map(|tx| tx.borrow().clone())
    }

    async fn start(
        &self,
        change: ExportChange,
        device: &ResourceId,
        share: &ResourceId,
        rules: &[FileExportRule],
        op_id: &str,
    ) -> Result<TaskHandle> {
        self.failures.check(&self.config.name, change.operation())?;
        if self.store.file_share(share).await?.is_none() {
            return Err(Error::not_found(ResourceKind::FileShare, share));
        }

        let task_id = format!("file-task-{}", Uuid::new_v4());
        let (tx, rx) = watch::channel(TaskState::Queued);
        let tx = Arc::new(tx);
        self.tasks.insert(task_id.clone(), tx.clone());

        info!(
            "File {} on {} for share {} ({} rules, operation {}) started as {}",
            change.operation(),
            device,
            share,
            rules.len(),
            op_id,
            task_id
        );

        let fail_task = self
            .failures
            .check(&self.config.name, &format!("{}_task", change.operation()))
            .err();
        let stalled = self.stalled.load(Ordering::SeqCst);
        let latency = self.config.latency;
        let store = self.store.clone();
        let share = share.clone();
        let rules = rules.to_vec();
        let id = task_id.clone();

        tokio::spawn(async move {
            tx.send_if_modified(|state| {
                if *state == TaskState::Queued {
                    *state = TaskState::Running;
                    true
                } else {
                    false
                }
            });
            if stalled {
                debug!("File task {} stalled", id);
                return;
            }
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if *tx.borrow() == TaskState::Cancelled {
                return;
            }
            let state = match fail_task {
                Some(e) => TaskState::Error(e.to_string()),
                None => match apply(&store, change, &share, rules).await {
                    Ok(()) => TaskState::Ready,
                    Err(e) => TaskState::Error(e.to_string()),
                },
            };
            debug!("File task {} finished: {:?}", id, state);
            tx.send_if_modified(move |current| {
                if current.is_terminal() {
                    false
                } else {
                    *current = state;
                    true
                }
            });
        });

        Ok(TaskHandle { task_id, state: rx })
    }
}

/// Apply an export change to the persisted share
async fn apply(
    store: &TopologyStoreRef,
    change: ExportChange,
    share_id: &ResourceId,
    rules: Vec<FileExportRule>,
) -> Result<()> {
    let mut share = store
        .file_share(share_id)
        .await?
        .ok_or_else(|| Error::not_found(ResourceKind::FileShare, share_id))?;
    match change {
        ExportChange::Export => {
            for rule in rules {
                match share.exports.iter_mut().find(|r| r.path == rule.path) {
                    Some(existing) => *existing = rule,
                    None => share.exports.push(rule),
                }
            }
        }
        ExportChange::Unexport => {
            share
                .exports
                .retain(|r| !rules.iter().any(|removed| removed.path == r.path));
        }
        ExportChange::Replace => share.exports = rules,
    }
    store.put_file_share(share).await
}

#[async_trait]
impl FileExportController for InMemoryFileController {
    async fn export(
        &self,
        device: &ResourceId,
        share: &ResourceId,
        rules: &[FileExportRule],
        op_id: &str,
    ) -> Result<TaskHandle> {
        self.start(ExportChange::Export, device, share, rules, op_id).await
    }

    async fn unexport(
        &self,
        device: &ResourceId,
        share: &ResourceId,
        rules: &[FileExportRule],
        op_id: &str,
    ) -> Result<TaskHandle> {
        self.start(ExportChange::Unexport, device, share, rules, op_id).await
    }

    async fn update_export(
        &self,
        device: &ResourceId,
        share: &ResourceId,
        rules: &[FileExportRule],
        op_id: &str,
    ) -> Result<TaskHandle> {
        self.start(ExportChange::Replace, device, share, rules, op_id).await
    }

    fn subscribe(&self, task_id: &str) -> Option<watch::Receiver<TaskState>> {
        self.tasks.get(task_id).map(|tx| tx.subscribe())
    }

    async fn cancel(&self, task_id: &str) -> Result<()> {
        self.failures.check(&self.config.name, "cancel")?;
        let tx = self
            .tasks
            .get(task_id)
            .map(|tx| tx.clone())
            .ok_or_else(|| Error::not_found("FileTask", task_id))?;
        let cancelled = tx.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = TaskState::Cancelled;
                true
            }
        });
        if cancelled {
            info!("Cancelled file task {}", task_id);
        } else {
            warn!("File task {} already finished; cancel ignored", task_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::FileShare;
    use crate::domain::ports::TopologyStore;
    use crate::store::InMemoryStore;
    use crate::workflow::wait_for_terminal;
    use tokio_util::sync::CancellationToken;

    fn rule(path: &str, clients: &[&str]) -> FileExportRule {
        FileExportRule::new(path, clients.iter().map(|c| c.to_string()))
    }

    async fn setup() -> (Arc<InMemoryStore>, InMemoryFileController) {
        let store = InMemoryStore::new();
        store
            .put_file_share(FileShare {
                id: "fs-1".into(),
                label: "home".into(),
                storage_device: "nas-1".into(),
                mount_path: "/ifs/home".into(),
                exports: vec![rule("/ifs/home", &["10.0.0.1", "10.0.0.2"])],
                inactive: false,
            })
            .await
            .unwrap();
        let controller = InMemoryFileController::new(FileControllerConfig::default(), store.clone());
        (store, controller)
    }

    async fn finish(handle: TaskHandle) -> TaskState {
        wait_for_terminal(
            &handle.task_id,
            handle.state,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_unexport_then_export_restores_rules() {
        let (store, controller) = setup().await;
        let original = store.file_share(&"fs-1".into()).await.unwrap().unwrap().exports;

        let handle = controller
            .unexport(&"nas-1".into(), &"fs-1".into(), &original, "op-1")
            .await
            .unwrap();
        assert_eq!(finish(handle).await, TaskState::Ready);
        let share = store.file_share(&"fs-1".into()).await.unwrap().unwrap();
        assert!(share.exports.is_empty());

        let handle = controller
            .export(&"nas-1".into(), &"fs-1".into(), &original, "op-1")
            .await
            .unwrap();
        assert_eq!(finish(handle).await, TaskState::Ready);
        let share = store.file_share(&"fs-1".into()).await.unwrap().unwrap();
        assert_eq!(share.exports, original);
    }

    #[tokio::test]
    async fn test_injected_task_failure_reports_error_state() {
        let (_store, controller) = setup().await;
        controller.failures().fail("update_export_task");
        let handle = controller
            .update_export(&"nas-1".into(), &"fs-1".into(), &[], "op-2")
            .await
            .unwrap();
        assert!(matches!(finish(handle).await, TaskState::Error(_)));
    }

    #[tokio::test]
    async fn test_stalled_task_can_be_cancelled() {
        let (store, controller) = setup().await;
        controller.set_stalled(true);
        let handle = controller
            .update_export(&"nas-1".into(), &"fs-1".into(), &[], "op-3")
            .await
            .unwrap();
        controller.cancel(&handle.task_id).await.unwrap();
        assert_eq!(controller.task_state(&handle.task_id), Some(TaskState::Cancelled));
        let share = store.file_share(&"fs-1".into()).await.unwrap().unwrap();
        assert_eq!(share.exports.len(), 1);
    }
}
