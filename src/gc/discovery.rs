//! Deletable resource discovery

use super::client::{DiscoveryClient, GroupVersion, GroupVersionResource, ResourceMapping};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Resource types the collector watches, keyed by endpoint
pub type DeletableResources = BTreeMap<GroupVersionResource, ResourceMapping>;

/// Result of a discovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryResult {
    pub resources: DeletableResources,
    /// Group versions whose resources could not be listed
    pub failed_groups: BTreeSet<GroupVersion>,
    /// Set when discovery failed outright
    pub error: Option<String>,
}

impl DiscoveryResult {
    pub fn is_partial(&self) -> bool {
        !self.failed_groups.is_empty()
    }
}

/// Preferred-version resources supporting delete, list and watch
///
/// Failures are logged and returned alongside whatever was discovered.
pub async fn get_deletable_resources(discovery: &dyn DiscoveryClient) -> DiscoveryResult {
    let server = match discovery.server_resources().await {
        Ok(server) => server,
        Err(e) => {
            warn!(error = %e, "Failed to discover server resources");
            return DiscoveryResult {
                error: Some(e.to_string()),
                ..Default::default()
            };
        }
    };

    for (group_version, reason) in &server.failed {
        warn!(%group_version, %reason, "Failed to discover resources for group version");
    }

    let resources = server
        .resources
        .into_iter()
        .filter(|r| r.preferred)
        .filter(|r| !r.mapping.resource.resource.contains('/'))
        .filter(|r| r.supports("delete") && r.supports("list") && r.supports("watch"))
        .map(|r| (r.mapping.resource.clone(), r.mapping))
        .collect();

    DiscoveryResult {
        resources,
        failed_groups: server.failed.into_keys().collect(),
        error: None,
    }
}

/// Keep last known resources for group versions that failed this pass
///
/// Only resources for which `is_synced` holds are carried over.
pub fn merge_failed_groups(
    result: &mut DiscoveryResult,
    previous: &DeletableResources,
    is_synced: impl Fn(&GroupVersionResource) -> bool,
) {
    for (gvr, mapping) in previous {
        if result.failed_groups.contains(&gvr.group_version()) && is_synced(gvr) {
            result
                .resources
                .entry(gvr.clone())
                .or_insert_with(|| mapping.clone());
        }
    }
}

/// Human readable summary of what changed between two discovery passes
pub fn print_diff(old: &DeletableResources, new: &DeletableResources) -> String {
    let removed: Vec<String> = old
        .keys()
        .filter(|gvr| !new.contains_key(*gvr))
        .map(ToString::to_string)
        .collect();
    let added: Vec<String> = new
        .keys()
        .filter(|gvr| !old.contains_key(*gvr))
        .map(ToString::to_string)
        .collect();
    format!("added: [{}], removed: [{}]", added.join(" "), removed.join(" "))
}
