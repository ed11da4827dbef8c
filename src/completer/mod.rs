//! Operation Completers
//!
//! A completer is bound to the resources one top-level operation affects. It
//! receives the operation's terminal status exactly once and persists it onto
//! every affected resource, annotating errors raised while a rollback could
//! not finish.

pub mod resources;
pub mod task;

pub use resources::*;
pub use task::*;

use crate::domain::model::{OperationStatus, ResourceId, ResourceKind};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Records the outcome of one operation on its affected resources
#[async_trait]
pub trait Completer: Send + Sync {
    fn op_id(&self) -> &str;

    fn resource_kind(&self) -> ResourceKind;

    fn resources(&self) -> &[ResourceId];

    fn is_rolling_back(&self) -> bool;

    /// Mark that the operation finishes while a rollback is incomplete
    fn set_rolling_back(&self, rolling_back: bool);

    /// Current status; `Pending` until completed
    fn status(&self) -> OperationStatus;

    /// Final message, including any manual-cleanup annotation
    fn message(&self) -> Option<String>;

    fn is_completed(&self) -> bool {
        self.status().is_terminal()
    }

    /// Record `Pending` on every resource
    async fn begin(&self) -> Result<()>;

    /// Record the terminal status. Calls after the first are ignored.
    async fn complete(&self, status: OperationStatus, message: Option<String>) -> Result<()>;

    async fn ready(&self, message: Option<String>) -> Result<()> {
        self.complete(OperationStatus::Ready, message).await
    }

    async fn error(&self, message: String) -> Result<()> {
        self.complete(OperationStatus::Error, Some(message)).await
    }
}

pub type CompleterRef = Arc<dyn Completer>;
