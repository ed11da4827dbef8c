//! Topology Reconciliation
//!
//! Computes, from live persisted state, which export groups and file shares a
//! topology change affects and how.

pub mod diff;
pub mod export_group;
pub mod file_share;

pub use diff::{effective_update, set_diff, update_between, ExportGroupDiff, GroupAction};
pub use export_group::{ExportReconciler, TopologyChange};
pub use file_share::{
    host_endpoints, plan_endpoint_withdrawal, withdraw_endpoints, FileShareAction, FileShareDiff,
};
