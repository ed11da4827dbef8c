//! Step Planning
//!
//! Builders that turn reconciliation results and host-local requests into
//! steps on a [`StepGraph`]. Each builder takes the wait-for it must run
//! after and returns the token later steps should wait for.

use crate::domain::model::{Host, ResourceId};
use crate::domain::ports::FstabEntry;
use crate::error::Result;
use crate::reconcile::{ExportGroupDiff, FileShareAction, FileShareDiff};
use crate::workflow::{mount_lock_key, Invocation, StepGraph, StepSpec, StepToken, WaitFor};

// =============================================================================
// Export groups
// =============================================================================

/// One update or delete step for an export-group diff.
///
/// Deletes are irreversible: the group's volumes are unexported from every
/// remaining endpoint and there is no compensation.
pub fn export_group_step(
    graph: &mut StepGraph,
    wait_for: impl Into<WaitFor>,
    diff: &ExportGroupDiff,
    enforce_versions: bool,
) -> Result<StepToken> {
    let expected_version = diff.expected_version(enforce_versions);
    let spec = if diff.is_delete() {
        StepSpec::new(
            format!("Delete export group {}", diff.label),
            diff.group.clone(),
            Invocation::DeleteExportGroup {
                group: diff.group.clone(),
                expected_version,
            },
        )
    } else {
        StepSpec::new(
            format!("Update export group {}", diff.label),
            diff.group.clone(),
            Invocation::UpdateExportGroup {
                group: diff.group.clone(),
                update: diff.update.clone(),
                expected_version,
            },
        )
        .with_rollback(Invocation::UpdateExportGroup {
            group: diff.group.clone(),
            update: diff.inverse_update(),
            expected_version: None,
        })
    };
    graph.create_step(wait_for, spec)
}

// =============================================================================
// File shares
// =============================================================================

/// Export change for one share followed by a bounded wait on its task
pub fn file_share_steps(
    graph: &mut StepGraph,
    wait_for: impl Into<WaitFor>,
    diff: &FileShareDiff,
) -> Result<StepToken> {
    let spec = match &diff.action {
        FileShareAction::Unexport { rules } => StepSpec::new(
            format!("Unexport file share {}", diff.label),
            diff.share.clone(),
            Invocation::FileUnexport {
                device: diff.storage_device.clone(),
                share: diff.share.clone(),
                rules: rules.clone(),
            },
        )
        .with_rollback(Invocation::FileExport {
            device: diff.storage_device.clone(),
            share: diff.share.clone(),
            rules: diff.original_rules.clone(),
        }),
        FileShareAction::UpdateExport { rules, .. } => StepSpec::new(
            format!("Update exports of file share {}", diff.label),
            diff.share.clone(),
            Invocation::FileUpdateExport {
                device: diff.storage_device.clone(),
                share: diff.share.clone(),
                rules: rules.clone(),
            },
        )
        .with_rollback(Invocation::FileUpdateExport {
            device: diff.storage_device.clone(),
            share: diff.share.clone(),
            rules: diff.original_rules.clone(),
        }),
    };
    let forward = graph.create_step(wait_for, spec)?;
    graph.create_step(
        forward,
        StepSpec::new(
            format!("Wait for file share {}", diff.label),
            diff.share.clone(),
            Invocation::WaitForFileTask {
                share: diff.share.clone(),
                task_step: forward,
            },
        )
        .with_no_op_rollback(),
    )
}

// =============================================================================
// ESX datastores
// =============================================================================

/// verify datastore -> disable storage I/O control -> unmount and detach
pub fn datastore_detach_steps(
    graph: &mut StepGraph,
    wait_for: impl Into<WaitFor>,
    host: &ResourceId,
    volume: &ResourceId,
) -> Result<StepToken> {
    let verify = graph.create_step(
        wait_for,
        StepSpec::new(
            format!("Verify datastore of {} on {}", volume, host),
            host.clone(),
            Invocation::VerifyDatastore {
                host: host.clone(),
                volume: volume.clone(),
            },
        )
        .with_no_op_rollback(),
    )?;
    let sioc = graph.create_step(
        verify,
        StepSpec::new(
            format!("Disable storage I/O control of {} on {}", volume, host),
            host.clone(),
            Invocation::SetStorageIoControl {
                host: host.clone(),
                volume: volume.clone(),
                enabled: false,
            },
        )
        .with_rollback(Invocation::SetStorageIoControl {
            host: host.clone(),
            volume: volume.clone(),
            enabled: true,
        }),
    )?;
    graph.create_step(
        sioc,
        StepSpec::new(
            format!("Unmount and detach {} from {}", volume, host),
            host.clone(),
            Invocation::UnmountAndDetach {
                host: host.clone(),
                volume: volume.clone(),
            },
        )
        .with_rollback(Invocation::AttachAndMount {
            host: host.clone(),
            volume: volume.clone(),
        }),
    )
}

pub fn datastore_attach_step(
    graph: &mut StepGraph,
    wait_for: impl Into<WaitFor>,
    host: &ResourceId,
    volume: &ResourceId,
) -> Result<StepToken> {
    graph.create_step(
        wait_for,
        StepSpec::new(
            format!("Attach and mount {} on {}", volume, host),
            host.clone(),
            Invocation::AttachAndMount {
                host: host.clone(),
                volume: volume.clone(),
            },
        )
        .with_rollback(Invocation::UnmountAndDetach {
            host: host.clone(),
            volume: volume.clone(),
        }),
    )
}

// =============================================================================
// Host references
// =============================================================================

/// Point the host at `cluster`; rollback restores the current reference
pub fn host_cluster_step(
    graph: &mut StepGraph,
    wait_for: impl Into<WaitFor>,
    host: &Host,
    cluster: Option<ResourceId>,
) -> Result<StepToken> {
    graph.create_step(
        wait_for,
        StepSpec::new(
            format!("Update cluster of host {}", host.label),
            host.id.clone(),
            Invocation::UpdateHostCluster {
                host: host.id.clone(),
                cluster,
            },
        )
        .with_rollback(Invocation::UpdateHostCluster {
            host: host.id.clone(),
            cluster: host.cluster.clone(),
        }),
    )
}

pub fn boot_volume_step(
    graph: &mut StepGraph,
    wait_for: impl Into<WaitFor>,
    host: &Host,
    volume: &ResourceId,
) -> Result<StepToken> {
    graph.create_step(
        wait_for,
        StepSpec::new(
            format!("Set boot volume of host {}", host.label),
            host.id.clone(),
            Invocation::SetBootVolume {
                host: host.id.clone(),
                volume: Some(volume.clone()),
            },
        )
        .with_rollback(Invocation::SetBootVolume {
            host: host.id.clone(),
            volume: host.boot_volume.clone(),
        }),
    )
}

pub fn san_boot_target_step(
    graph: &mut StepGraph,
    wait_for: impl Into<WaitFor>,
    host: &Host,
    volume: &ResourceId,
) -> Result<StepToken> {
    graph.create_step(
        wait_for,
        StepSpec::new(
            format!("Set SAN boot targets of host {}", host.label),
            host.id.clone(),
            Invocation::SetSanBootTargets {
                host: host.id.clone(),
                volume: Some(volume.clone()),
            },
        )
        .with_rollback(Invocation::SetSanBootTargets {
            host: host.id.clone(),
            volume: host.boot_volume.clone(),
        }),
    )
}

// =============================================================================
// Host-local mounts
// =============================================================================

/// verify mount point -> create directory -> add fstab entry -> mount
pub fn mount_steps(
    graph: &mut StepGraph,
    wait_for: impl Into<WaitFor>,
    host: &ResourceId,
    entry: &FstabEntry,
) -> Result<StepToken> {
    let lock = mount_lock_key(host);
    let path = entry.mount_path.clone();

    let verify = graph.create_step(
        wait_for,
        StepSpec::new(
            format!("Verify mount point {}", path),
            host.clone(),
            Invocation::VerifyMountPoint {
                host: host.clone(),
                path: path.clone(),
                expect_mounted: false,
            },
        )
        .with_no_op_rollback()
        .with_locks([lock.clone()]),
    )?;
    let directory = graph.create_step(
        verify,
        StepSpec::new(
            format!("Create directory {}", path),
            host.clone(),
            Invocation::CreateDirectory {
                host: host.clone(),
                path: path.clone(),
            },
        )
        .with_rollback(Invocation::DeleteDirectory {
            host: host.clone(),
            path: path.clone(),
        })
        .with_locks([lock.clone()]),
    )?;
    let fstab = graph.create_step(
        directory,
        StepSpec::new(
            format!("Add fstab entry {}", path),
            host.clone(),
            Invocation::AddFstabEntry {
                host: host.clone(),
                entry: entry.clone(),
            },
        )
        .with_rollback(Invocation::RemoveFstabEntry {
            host: host.clone(),
            path: path.clone(),
        })
        .with_locks([lock.clone()]),
    )?;
    graph.create_step(
        fstab,
        StepSpec::new(
            format!("Mount {} at {}", entry.device, path),
            host.clone(),
            Invocation::MountDevice {
                host: host.clone(),
                path: path.clone(),
            },
        )
        .with_rollback(Invocation::UnmountDevice {
            host: host.clone(),
            path,
        })
        .with_locks([lock]),
    )
}

/// verify mounted -> unmount -> remove fstab entry -> delete directory
pub fn unmount_steps(
    graph: &mut StepGraph,
    wait_for: impl Into<WaitFor>,
    host: &ResourceId,
    path: &str,
) -> Result<StepToken> {
    let lock = mount_lock_key(host);

    let verify = graph.create_step(
        wait_for,
        StepSpec::new(
            format!("Verify {} is mounted", path),
            host.clone(),
            Invocation::VerifyMountPoint {
                host: host.clone(),
                path: path.to_string(),
                expect_mounted: true,
            },
        )
        .with_no_op_rollback()
        .with_locks([lock.clone()]),
    )?;
    let unmount = graph.create_step(
        verify,
        StepSpec::new(
            format!("Unmount {}", path),
            host.clone(),
            Invocation::UnmountDevice {
                host: host.clone(),
                path: path.to_string(),
            },
        )
        .with_rollback(Invocation::MountDevice {
            host: host.clone(),
            path: path.to_string(),
        })
        .with_locks([lock.clone()]),
    )?;
    let fstab = graph.create_step(
        unmount,
        StepSpec::new(
            format!("Remove fstab entry {}", path),
            host.clone(),
            Invocation::RemoveFstabEntry {
                host: host.clone(),
                path: path.to_string(),
            },
        )
        .with_rollback(Invocation::RestoreFstabEntry {
            host: host.clone(),
            path: path.to_string(),
        })
        .with_locks([lock.clone()]),
    )?;
    graph.create_step(
        fstab,
        StepSpec::new(
            format!("Delete directory {}", path),
            host.clone(),
            Invocation::DeleteDirectory {
                host: host.clone(),
                path: path.to_string(),
            },
        )
        .with_rollback(Invocation::CreateDirectory {
            host: host.clone(),
            path: path.to_string(),
        })
        .with_locks([lock]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{ExportGroup, ExportGroupKind, ExportGroupUpdate};
    use std::collections::BTreeSet;

    fn labels(graph: &StepGraph) -> Vec<String> {
        graph
            .linearize()
            .unwrap()
            .iter()
            .map(|t| graph.node(t).unwrap().spec.label.clone())
            .collect()
    }

    #[test]
    fn test_delete_step_is_irreversible() {
        let mut group = ExportGroup::new("eg-1", "web", ExportGroupKind::Host, "array-1");
        group.hosts = BTreeSet::from(["h1".into()]);
        let diff = ExportGroupDiff::compute(
            &group,
            &ExportGroupUpdate {
                removed_hosts: BTreeSet::from(["h1".into()]),
                ..Default::default()
            },
        );

        let mut graph = StepGraph::new();
        let token = export_group_step(&mut graph, WaitFor::none(), &diff, true).unwrap();
        let node = graph.node(&token).unwrap();
        assert!(node.spec.rollback.is_none());
        assert!(matches!(
            node.spec.forward,
            Invocation::DeleteExportGroup { expected_version: Some(0), .. }
        ));
    }

    #[test]
    fn test_mount_chain_order_and_locks() {
        let entry = FstabEntry {
            device: "/dev/sdb1".into(),
            mount_path: "/data".into(),
            fs_type: "ext4".into(),
            options: "defaults".into(),
        };
        let mut graph = StepGraph::new();
        mount_steps(&mut graph, WaitFor::none(), &"h1".into(), &entry).unwrap();

        assert_eq!(
            labels(&graph),
            vec![
                "Verify mount point /data",
                "Create directory /data",
                "Add fstab entry /data",
                "Mount /dev/sdb1 at /data"
            ]
        );
        assert!(graph
            .nodes()
            .all(|n| n.spec.lock_keys == vec!["mount:h1".to_string()]));
    }

    #[test]
    fn test_datastore_chain_rollbacks() {
        let mut graph = StepGraph::new();
        datastore_detach_steps(&mut graph, WaitFor::none(), &"h1".into(), &"vol-1".into()).unwrap();
        let rollbacks: Vec<Option<&Invocation>> =
            graph.nodes().map(|n| n.spec.rollback.as_ref()).collect();
        assert_eq!(rollbacks[0], Some(&Invocation::NoOp));
        assert!(matches!(
            rollbacks[1],
            Some(Invocation::SetStorageIoControl { enabled: true, .. })
        ));
        assert!(matches!(rollbacks[2], Some(Invocation::AttachAndMount { .. })));
    }
}
