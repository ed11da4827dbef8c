//! Base Task Completer
//!
//! Records an [`OperationRecord`] on every affected resource independently.
//! A failure to record on one resource is logged and does not stop recording
//! on the others.

use super::Completer;
use crate::domain::model::{OperationRecord, OperationStatus, ResourceId, ResourceKind};
use crate::domain::ports::TopologyStoreRef;
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Outcome captured when a completer is first completed
#[derive(Debug, Clone)]
pub(crate) struct Completion {
    pub status: OperationStatus,
    pub message: Option<String>,
    pub rolling_back: bool,
}

/// Completer that persists status onto one or more resources of one kind
pub struct TaskCompleter {
    store: TopologyStoreRef,
    kind: ResourceKind,
    ids: Vec<ResourceId>,
    op_id: String,
    rolling_back: AtomicBool,
    completed: AtomicBool,
    outcome: Mutex<(OperationStatus, Option<String>)>,
}

impl TaskCompleter {
    pub fn new(
        store: TopologyStoreRef,
        kind: ResourceKind,
        ids: impl IntoIterator<Item = ResourceId>,
        op_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            kind,
            ids: ids.into_iter().collect(),
            op_id: op_id.into(),
            rolling_back: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            outcome: Mutex::new((OperationStatus::Pending, None)),
        }
    }

    pub fn for_resource(
        store: TopologyStoreRef,
        kind: ResourceKind,
        id: ResourceId,
        op_id: impl Into<String>,
    ) -> Self {
        Self::new(store, kind, [id], op_id)
    }

    pub(crate) fn store(&self) -> &TopologyStoreRef {
        &self.store
    }

    /// Suffix appended to errors reported while rollback is incomplete
    pub fn manual_cleanup_suffix(&self) -> String {
        let ids: Vec<&str> = self.ids.iter().map(|id| id.as_str()).collect();
        format!(
            "; rollback did not complete, {} {} may require manual cleanup",
            self.kind,
            ids.join(", ")
        )
    }

    /// Claim the single completion. Returns `None` when already completed.
    pub(crate) fn claim(
        &self,
        status: OperationStatus,
        message: Option<String>,
    ) -> Option<Completion> {
        if !status.is_terminal() {
            warn!(
                "Operation {} completed with non-terminal status {}; ignoring",
                self.op_id, status
            );
            return None;
        }
        if self.completed.swap(true, Ordering::SeqCst) {
            debug!("Operation {} already completed; ignoring {}", self.op_id, status);
            return None;
        }

        let rolling_back = self.rolling_back.load(Ordering::SeqCst);
        let message = if status == OperationStatus::Error && rolling_back {
            let base = message.unwrap_or_else(|| "operation failed".to_string());
            Some(format!("{}{}", base, self.manual_cleanup_suffix()))
        } else {
            message
        };

        *self.outcome.lock() = (status, message.clone());
        Some(Completion {
            status,
            message,
            rolling_back,
        })
    }

    /// Persist a status on every bound resource
    pub(crate) async fn record_all(&self, status: OperationStatus, message: Option<String>) {
        for id in &self.ids {
            let record = OperationRecord::new(self.op_id.clone(), status, message.clone());
            if let Err(e) = self.store.record_operation(self.kind, id, record).await {
                warn!(
                    "Failed to record {} status for operation {} on {} {}: {}",
                    status, self.op_id, self.kind, id, e
                );
            }
        }
    }
}

#[async_trait]
impl Completer for TaskCompleter {
    fn op_id(&self) -> &str {
        &self.op_id
    }

    fn resource_kind(&self) -> ResourceKind {
        self.kind
    }

    fn resources(&self) -> &[ResourceId] {
        &self.ids
    }

    fn is_rolling_back(&self) -> bool {
        self.rolling_back.load(Ordering::SeqCst)
    }

    fn set_rolling_back(&self, rolling_back: bool) {
        self.rolling_back.store(rolling_back, Ordering::SeqCst);
    }

    fn status(&self) -> OperationStatus {
        self.outcome.lock().0
    }

    fn message(&self) -> Option<String> {
        self.outcome.lock().1.clone()
    }

    async fn begin(&self) -> Result<()> {
        self.record_all(OperationStatus::Pending, None).await;
        Ok(())
    }

    async fn complete(&self, status: OperationStatus, message: Option<String>) -> Result<()> {
        let Some(done) = self.claim(status, message) else {
            return Ok(());
        };
        info!(
            "Operation {} completed with status {} on {} {:?}",
            self.op_id, done.status, self.kind, self.ids
        );
        self.record_all(done.status, done.message).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::Host;
    use crate::domain::ports::TopologyStore;
    use crate::store::InMemoryStore;
    use std::sync::Arc;

    async fn store_with_hosts(ids: &[&str]) -> Arc<InMemoryStore> {
        let store = InMemoryStore::new();
        for id in ids {
            store.put_host(Host::new(*id, *id)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_records_each_resource_independently() {
        let store = store_with_hosts(&["h1", "h3"]).await;
        let completer = TaskCompleter::new(
            store.clone(),
            ResourceKind::Host,
            ["h1".into(), "h2".into(), "h3".into()],
            "op-1",
        );

        // h2 does not exist; h1 and h3 are still recorded
        completer.ready(Some("done".into())).await.unwrap();
        for id in ["h1", "h3"] {
            let record = store.operation(&id.into(), "op-1").await.unwrap().unwrap();
            assert_eq!(record.status, OperationStatus::Ready);
            assert_eq!(record.message.as_deref(), Some("done"));
        }
        assert!(store.operation(&"h2".into(), "op-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_completes_exactly_once() {
        let store = store_with_hosts(&["h1"]).await;
        let completer =
            TaskCompleter::for_resource(store.clone(), ResourceKind::Host, "h1".into(), "op-2");

        completer.error("step failed".into()).await.unwrap();
        completer.ready(None).await.unwrap();

        assert_eq!(completer.status(), OperationStatus::Error);
        let record = store.operation(&"h1".into(), "op-2").await.unwrap().unwrap();
        assert_eq!(record.status, OperationStatus::Error);
    }

    #[tokio::test]
    async fn test_rolling_back_error_is_annotated() {
        let store = store_with_hosts(&["h1", "h2"]).await;
        let completer = TaskCompleter::new(
            store.clone(),
            ResourceKind::Host,
            ["h1".into(), "h2".into()],
            "op-3",
        );
        completer.set_rolling_back(true);
        completer.error("unmount failed".into()).await.unwrap();

        let message = completer.message().unwrap();
        assert_eq!(
            message,
            "unmount failed; rollback did not complete, Host h1, h2 may require manual cleanup"
        );
    }

    #[tokio::test]
    async fn test_success_is_not_annotated_while_rolling_back() {
        let store = store_with_hosts(&["h1"]).await;
        let completer =
            TaskCompleter::for_resource(store, ResourceKind::Host, "h1".into(), "op-4");
        completer.set_rolling_back(true);
        completer.ready(Some("ok".into())).await.unwrap();
        assert_eq!(completer.message().as_deref(), Some("ok"));
    }
}
