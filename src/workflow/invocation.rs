//! Invocation Descriptors
//!
//! Every forward and compensating action a step can perform is one variant of
//! [`Invocation`]. Variants carry strongly-typed arguments and serialize with
//! an `op` tag, so a step graph can be persisted and inspected without any
//! name-based lookup at execution time.

use super::graph::StepToken;
use crate::domain::model::{ExportGroupUpdate, FileExportRule, ResourceId};
use crate::domain::ports::FstabEntry;
use serde::{Deserialize, Serialize};

/// A named operation plus its arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Invocation {
    /// Report success without touching anything
    NoOp,

    // =========================================================================
    // Block exports
    // =========================================================================
    UpdateExportGroup {
        group: ResourceId,
        update: ExportGroupUpdate,
        /// Version the diff was computed against, when enforced
        #[serde(default)]
        expected_version: Option<u64>,
    },

    DeleteExportGroup {
        group: ResourceId,
        #[serde(default)]
        expected_version: Option<u64>,
    },

    // =========================================================================
    // File exports
    // =========================================================================
    FileExport {
        device: ResourceId,
        share: ResourceId,
        rules: Vec<FileExportRule>,
    },

    FileUnexport {
        device: ResourceId,
        share: ResourceId,
        rules: Vec<FileExportRule>,
    },

    FileUpdateExport {
        device: ResourceId,
        share: ResourceId,
        rules: Vec<FileExportRule>,
    },

    /// Wait for the asynchronous file task started by `task_step`
    WaitForFileTask {
        share: ResourceId,
        task_step: StepToken,
    },

    // =========================================================================
    // Virtualization hosts
    // =========================================================================
    VerifyDatastore {
        host: ResourceId,
        volume: ResourceId,
    },

    SetStorageIoControl {
        host: ResourceId,
        volume: ResourceId,
        enabled: bool,
    },

    UnmountAndDetach {
        host: ResourceId,
        volume: ResourceId,
    },

    AttachAndMount {
        host: ResourceId,
        volume: ResourceId,
    },

    // =========================================================================
    // Host references
    // =========================================================================
    UpdateHostCluster {
        host: ResourceId,
        cluster: Option<ResourceId>,
    },

    SetBootVolume {
        host: ResourceId,
        volume: Option<ResourceId>,
    },

    SetSanBootTargets {
        host: ResourceId,
        volume: Option<ResourceId>,
    },

    // =========================================================================
    // Host filesystem mounts
    // =========================================================================
    VerifyMountPoint {
        host: ResourceId,
        path: String,
        expect_mounted: bool,
    },

    CreateDirectory {
        host: ResourceId,
        path: String,
    },

    DeleteDirectory {
        host: ResourceId,
        path: String,
    },

    AddFstabEntry {
        host: ResourceId,
        entry: FstabEntry,
    },

    /// Removes the entry and keeps it in step data for [`Invocation::RestoreFstabEntry`]
    RemoveFstabEntry {
        host: ResourceId,
        path: String,
    },

    /// Re-adds the entry the same step removed
    RestoreFstabEntry {
        host: ResourceId,
        path: String,
    },

    MountDevice {
        host: ResourceId,
        path: String,
    },

    UnmountDevice {
        host: ResourceId,
        path: String,
    },
}

impl Invocation {
    /// Operation name, as serialized in the `op` tag
    pub fn name(&self) -> &'static str {
        match self {
            Invocation::NoOp => "no_op",
            Invocation::UpdateExportGroup { .. } => "update_export_group",
            Invocation::DeleteExportGroup { .. } => "delete_export_group",
            Invocation::FileExport { .. } => "file_export",
            Invocation::FileUnexport { .. } => "file_unexport",
            Invocation::FileUpdateExport { .. } => "file_update_export",
            Invocation::WaitForFileTask { .. } => "wait_for_file_task",
            Invocation::VerifyDatastore { .. } => "verify_datastore",
            Invocation::SetStorageIoControl { .. } => "set_storage_io_control",
            Invocation::UnmountAndDetach { .. } => "unmount_and_detach",
            Invocation::AttachAndMount { .. } => "attach_and_mount",
            Invocation::UpdateHostCluster { .. } => "update_host_cluster",
            Invocation::SetBootVolume { .. } => "set_boot_volume",
            Invocation::SetSanBootTargets { .. } => "set_san_boot_targets",
            Invocation::VerifyMountPoint { .. } => "verify_mount_point",
            Invocation::CreateDirectory { .. } => "create_directory",
            Invocation::DeleteDirectory { .. } => "delete_directory",
            Invocation::AddFstabEntry { .. } => "add_fstab_entry",
            Invocation::RemoveFstabEntry { .. } => "remove_fstab_entry",
            Invocation::RestoreFstabEntry { .. } => "restore_fstab_entry",
            Invocation::MountDevice { .. } => "mount_device",
            Invocation::UnmountDevice { .. } => "unmount_device",
        }
    }

    pub fn is_no_op(&self) -> bool {
        matches!(self, Invocation::NoOp)
    }
}

impl std::fmt::Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_serialization() {
        let inv = Invocation::DeleteExportGroup {
            group: "eg-1".into(),
            expected_version: Some(4),
        };
        let json = serde_json::to_value(&inv).unwrap();
        assert_eq!(json["op"], "delete_export_group");
        assert_eq!(json["group"], "eg-1");
        assert_eq!(json["expected_version"], 4);

        let noop: Invocation = serde_json::from_str(r#"{"op":"no_op"}"#).unwrap();
        assert!(noop.is_no_op());
    }

    #[test]
    fn test_name_matches_tag() {
        let inv = Invocation::SetStorageIoControl {
            host: "h1".into(),
            volume: "vol-1".into(),
            enabled: false,
        };
        let json = serde_json::to_value(&inv).unwrap();
        assert_eq!(json["op"], inv.name());
    }
}
