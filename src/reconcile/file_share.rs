//! File-Share Endpoint Withdrawal
//!
//! When a host (or one of its IP interfaces) goes away, every file share
//! exported to it must stop exporting to its endpoints. A rule left with no
//! endpoints is unexported; otherwise the share's rules are updated with the
//! shrunk client lists.

use crate::domain::model::{FileExportRule, FileShare, ResourceId, ResourceKind};
use crate::domain::ports::{Constraint, TopologyStoreRef};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Export change for one share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FileShareAction {
    /// Every rule of the share lost all its endpoints
    Unexport { rules: Vec<FileExportRule> },
    /// Some rules remain; `rules` is the full new rule set and `emptied`
    /// the rules that lost every endpoint
    UpdateExport {
        rules: Vec<FileExportRule>,
        #[serde(default)]
        emptied: Vec<FileExportRule>,
    },
}

/// Reconciliation result for one file share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileShareDiff {
    pub share: ResourceId,
    pub label: String,
    pub storage_device: ResourceId,
    /// Rules as read, used to restore the share on rollback
    pub original_rules: Vec<FileExportRule>,
    pub action: FileShareAction,
}

/// Remove `endpoints` from every rule of `share`.
///
/// Returns `None` when the share does not export to any of them.
pub fn withdraw_endpoints(share: &FileShare, endpoints: &BTreeSet<String>) -> Option<FileShareDiff> {
    if !share.exports.iter().any(|r| !r.endpoints.is_disjoint(endpoints)) {
        return None;
    }

    let mut kept = Vec::new();
    let mut emptied = Vec::new();
    for rule in &share.exports {
        let remaining: BTreeSet<String> = rule.endpoints.difference(endpoints).cloned().collect();
        if remaining.is_empty() {
            emptied.push(rule.clone());
        } else {
            let mut shrunk = rule.clone();
            shrunk.endpoints = remaining;
            kept.push(shrunk);
        }
    }

    let action = if kept.is_empty() {
        FileShareAction::Unexport { rules: emptied }
    } else {
        FileShareAction::UpdateExport {
            rules: kept,
            emptied,
        }
    };
    Some(FileShareDiff {
        share: share.id.clone(),
        label: share.label.clone(),
        storage_device: share.storage_device.clone(),
        original_rules: share.exports.clone(),
        action,
    })
}

/// Endpoints a host is known by: its hostname and the addresses of its
/// active IP interfaces
pub async fn host_endpoints(store: &TopologyStoreRef, host: &ResourceId) -> Result<BTreeSet<String>> {
    let record = store
        .host(host)
        .await?
        .ok_or_else(|| Error::not_found(ResourceKind::Host, host))?;
    let mut endpoints = BTreeSet::new();
    if !record.hostname.is_empty() {
        endpoints.insert(record.hostname);
    }
    for ip in store.query(&Constraint::IpInterfacesByHost(host.clone())).await? {
        if let Some(interface) = store.ip_interface(&ip).await? {
            endpoints.insert(interface.address);
        }
    }
    Ok(endpoints)
}

/// Diffs for every active share exported to any of `endpoints`
pub async fn plan_endpoint_withdrawal(
    store: &TopologyStoreRef,
    endpoints: &BTreeSet<String>,
) -> Result<Vec<FileShareDiff>> {
    let mut seen = BTreeSet::new();
    let mut diffs = Vec::new();
    for endpoint in endpoints {
        for id in store
            .query(&Constraint::FileSharesByEndpoint(endpoint.clone()))
            .await?
        {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(share) = store.file_share(&id).await? else {
                continue;
            };
            if let Some(diff) = withdraw_endpoints(&share, endpoints) {
                debug!("File share {} loses endpoints {:?}", share.id, endpoints);
                diffs.push(diff);
            }
        }
    }
    Ok(diffs)
}
