//! Membership Diff Primitives
//!
//! Pure functions over export-group membership. Nothing here reads the store.

use crate::domain::model::{ExportGroup, ExportGroupKind, ExportGroupUpdate, ResourceId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// `(desired \ current, current \ desired)`
pub fn set_diff(
    current: &BTreeSet<ResourceId>,
    desired: &BTreeSet<ResourceId>,
) -> (BTreeSet<ResourceId>, BTreeSet<ResourceId>) {
    let added = desired.difference(current).cloned().collect();
    let removed = current.difference(desired).cloned().collect();
    (added, removed)
}

/// Update that turns `current` membership into `desired` membership
pub fn update_between(current: &ExportGroup, desired: &ExportGroup) -> ExportGroupUpdate {
    let (added_hosts, removed_hosts) = set_diff(&current.hosts, &desired.hosts);
    let (added_clusters, removed_clusters) = set_diff(&current.clusters, &desired.clusters);
    let (added_initiators, removed_initiators) = set_diff(&current.initiators, &desired.initiators);

    let added_volumes = desired
        .volumes
        .iter()
        .filter(|(v, lun)| current.volumes.get(*v) != Some(*lun))
        .map(|(v, lun)| (v.clone(), *lun))
        .collect();
    let removed_volumes = current
        .volumes
        .keys()
        .filter(|v| !desired.volumes.contains_key(*v))
        .cloned()
        .collect();

    ExportGroupUpdate {
        added_volumes,
        removed_volumes,
        added_clusters,
        removed_clusters,
        added_hosts,
        removed_hosts,
        added_initiators,
        removed_initiators,
    }
}

/// Drop no-op entries: removals of non-members and additions of members
pub fn effective_update(group: &ExportGroup, update: &ExportGroupUpdate) -> ExportGroupUpdate {
    fn removals(current: &BTreeSet<ResourceId>, requested: &BTreeSet<ResourceId>) -> BTreeSet<ResourceId> {
        requested.intersection(current).cloned().collect()
    }
    fn additions(current: &BTreeSet<ResourceId>, requested: &BTreeSet<ResourceId>) -> BTreeSet<ResourceId> {
        requested.difference(current).cloned().collect()
    }

    ExportGroupUpdate {
        added_volumes: update
            .added_volumes
            .iter()
            .filter(|(v, _)| !group.volumes.contains_key(*v))
            .map(|(v, lun)| (v.clone(), *lun))
            .collect(),
        removed_volumes: update
            .removed_volumes
            .iter()
            .filter(|v| group.volumes.contains_key(*v))
            .cloned()
            .collect(),
        added_clusters: additions(&group.clusters, &update.added_clusters),
        removed_clusters: removals(&group.clusters, &update.removed_clusters),
        added_hosts: additions(&group.hosts, &update.added_hosts),
        removed_hosts: removals(&group.hosts, &update.removed_hosts),
        added_initiators: additions(&group.initiators, &update.added_initiators),
        removed_initiators: removals(&group.initiators, &update.removed_initiators),
    }
}

// =============================================================================
// Per-group decision
// =============================================================================

/// What to do with an affected export group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupAction {
    Update,
    /// Export zero volumes to zero endpoints and retire the group
    Delete,
}

/// Decide between update and delete.
///
/// The group is deleted when its scoping membership (hosts for Host groups,
/// initiators for Initiator groups, clusters for Cluster groups) is empty once
/// the whole update is applied. Deleting unexports every volume from every
/// remaining endpoint, which is a wider change than the update asked for;
/// the escalation is intentional and callers must not suppress it.
pub fn decide(group: &ExportGroup, update: &ExportGroupUpdate) -> GroupAction {
    let mut after = group.clone();
    update.apply_to(&mut after);
    if after.scope_is_empty() {
        GroupAction::Delete
    } else {
        GroupAction::Update
    }
}

/// Reconciliation result for one export group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportGroupDiff {
    pub group: ResourceId,
    pub label: String,
    pub kind: ExportGroupKind,
    /// Version of the group the diff was computed from
    pub observed_version: u64,
    /// Volumes exported by the group when it was read
    pub volumes: BTreeMap<ResourceId, u32>,
    pub update: ExportGroupUpdate,
    pub action: GroupAction,
    /// Candidate initiators left out for lack of storage-port connectivity
    #[serde(default)]
    pub excluded_initiators: BTreeSet<ResourceId>,
}

impl ExportGroupDiff {
    /// Build the diff for `requested` against the group as read
    pub fn compute(group: &ExportGroup, requested: &ExportGroupUpdate) -> Self {
        let update = effective_update(group, requested);
        let action = decide(group, &update);
        Self {
            group: group.id.clone(),
            label: group.label.clone(),
            kind: group.kind,
            observed_version: group.version,
            volumes: group.volumes.clone(),
            update,
            action,
            excluded_initiators: BTreeSet::new(),
        }
    }

    /// Nothing to do for this group
    pub fn is_noop(&self) -> bool {
        self.action == GroupAction::Update && self.update.is_empty()
    }

    pub fn is_delete(&self) -> bool {
        self.action == GroupAction::Delete
    }

    /// Update that undoes this diff's update
    pub fn inverse_update(&self) -> ExportGroupUpdate {
        self.update.inverse(&self.volumes)
    }

    /// Version to submit with the forward action, when enforcement is on
    pub fn expected_version(&self, enforce: bool) -> Option<u64> {
        enforce.then_some(self.observed_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(items: &[&str]) -> BTreeSet<ResourceId> {
        items.iter().map(|s| ResourceId::from(*s)).collect()
    }

    fn host_group(hosts: &[&str]) -> ExportGroup {
        let mut g = ExportGroup::new("eg-1", "eg", ExportGroupKind::Host, "array-1");
        g.hosts = ids(hosts);
        g
    }

    #[test]
    fn test_remove_subset_of_hosts() {
        let hosts = ["h1", "h2", "h3", "h4"];
        let group = host_group(&hosts);

        // every proper subset yields an update, the full set a delete
        for mask in 1u32..(1 << hosts.len()) {
            let removed: Vec<&str> = hosts
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, h)| *h)
                .collect();
            let requested = ExportGroupUpdate {
                removed_hosts: ids(&removed),
                ..Default::default()
            };
            let diff = ExportGroupDiff::compute(&group, &requested);
            assert_eq!(diff.update.removed_hosts, ids(&removed));
            let expect = if removed.len() == hosts.len() {
                GroupAction::Delete
            } else {
                GroupAction::Update
            };
            assert_eq!(diff.action, expect, "removing {:?}", removed);
        }
    }

    #[test]
    fn test_initiator_group_deleted_when_initiators_empty() {
        let mut group = ExportGroup::new("eg-2", "eg", ExportGroupKind::Initiator, "array-1");
        group.hosts = ids(&["h1"]);
        group.initiators = ids(&["i1", "i2"]);

        let requested = ExportGroupUpdate {
            removed_initiators: ids(&["i1", "i2"]),
            ..Default::default()
        };
        let diff = ExportGroupDiff::compute(&group, &requested);
        assert_eq!(diff.action, GroupAction::Delete);
        // the group still lists a host; host emptiness is irrelevant here
        assert!(!group.hosts.is_empty());
    }

    #[test]
    fn test_effective_update_drops_noops() {
        let mut group = host_group(&["h1"]);
        group.volumes.insert("vol-1".into(), 3);
        let requested = ExportGroupUpdate {
            added_hosts: ids(&["h1", "h2"]),
            removed_hosts: ids(&["h9"]),
            removed_volumes: ids(&["vol-2"]),
            ..Default::default()
        };
        let update = effective_update(&group, &requested);
        assert_eq!(update.added_hosts, ids(&["h2"]));
        assert!(update.removed_hosts.is_empty());
        assert!(update.removed_volumes.is_empty());
    }

    #[test]
    fn test_update_between_restores_snapshot() {
        let mut before = host_group(&["h1", "h2"]);
        before.volumes.insert("vol-1".into(), 1);
        let mut after = host_group(&["h1", "h3"]);
        after.volumes.insert("vol-2".into(), 2);

        let undo = update_between(&after, &before);
        let mut restored = after.clone();
        undo.apply_to(&mut restored);
        assert_eq!(restored.hosts, before.hosts);
        assert_eq!(restored.volumes, before.volumes);
    }

    #[test]
    fn test_expected_version_is_opt_in() {
        let mut group = host_group(&["h1", "h2"]);
        group.version = 7;
        let diff = ExportGroupDiff::compute(&group, &ExportGroupUpdate::default());
        assert!(diff.is_noop());
        assert_eq!(diff.expected_version(false), None);
        assert_eq!(diff.expected_version(true), Some(7));
    }
}
