//! Topology Orchestrator - Storage Export Control Plane
//!
//! Keeps block and file storage exports consistent with a changing compute
//! topology. Every topology change is reconciled against persisted export
//! state and carried out as a saga whose completed steps are compensated in
//! reverse order when a later step fails.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                       REST API  /  Orchestrator entry points                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │   Reconciler    │  │  Step planning  │  │        Completers           │  │
//! │  │ (export diffs)  │  │  (StepGraph)    │  │  (operation status)         │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           └────────────────────┼─────────────────────────┘                  │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │      Saga engine      │                                │
//! │                    │ (locks, waits, undo)  │                                │
//! │                    └───────────┬───────────┘                                │
//! ├────────────────────────────────┼────────────────────────────────────────────┤
//! │                         Invocation dispatcher                               │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌─────────────────┐  │
//! │  │    Block     │  │     File     │  │  ESX hosts   │  │  Host mounts    │  │
//! │  └──────────────┘  └──────────────┘  └──────────────┘  └─────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: entry points, step planning, device dispatch and REST API
//! - [`workflow`]: step graph, saga engine, locks and bounded waits
//! - [`reconcile`]: export-group and file-share diffs
//! - [`completer`]: exactly-once operation status recording
//! - [`domain`]: persisted records and device ports
//! - [`store`]: in-memory topology store
//! - [`metrics`]: Prometheus counters
//! - [`error`]: error types and classification

pub mod completer;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod reconcile;
pub mod store;
pub mod workflow;

// Re-export commonly used types
pub use controlplane::{
    ApiServer, ApiServerConfig, DeviceSet, InMemoryDevices, Orchestrator, OrchestratorConfig,
    TaskReport,
};

pub use completer::{Completer, CompleterRef, ResourceCompleter, TaskCompleter};

pub use domain::model::{
    ExportGroup, ExportGroupKind, ExportGroupUpdate, Host, OperationStatus, ResourceId,
    ResourceKind,
};

pub use domain::ports::{
    BlockExportController, ConnectivityChecker, FileExportController, HostAdapter, MountAdapter,
    NetworkConnectivity, TopologyStore,
};

pub use error::{Error, ErrorClass, Result};

pub use metrics::OrchestratorMetrics;

pub use reconcile::{ExportGroupDiff, ExportReconciler, TopologyChange};

pub use store::InMemoryStore;

pub use workflow::{SagaEngine, SagaOutcome, SagaReport, StepGraph};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
