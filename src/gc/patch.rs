//! JSON merge patches applied to dependents and owners
//!
//! Merge patches replace lists wholesale, so every patch carries the full new
//! list computed from the live object together with its `resourceVersion`.
//! A concurrent writer makes the patch fail with a conflict instead of being
//! silently overwritten.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde_json::{Value, json};

/// Owner references left after removing `uids`, or `None` if none matched
pub fn remove_owner_references(
    references: &[OwnerReference],
    uids: &[String],
) -> Option<Vec<OwnerReference>> {
    let remaining: Vec<OwnerReference> = references
        .iter()
        .filter(|r| !uids.contains(&r.uid))
        .cloned()
        .collect();
    (remaining.len() != references.len()).then_some(remaining)
}

/// Owner references with every `blockOwnerDeletion: true` flipped to false,
/// or `None` if nothing was blocking
pub fn unblock_owner_references(references: &[OwnerReference]) -> Option<Vec<OwnerReference>> {
    if !references.iter().any(|r| r.block_owner_deletion == Some(true)) {
        return None;
    }
    Some(
        references
            .iter()
            .cloned()
            .map(|mut r| {
                if r.block_owner_deletion == Some(true) {
                    r.block_owner_deletion = Some(false);
                }
                r
            })
            .collect(),
    )
}

/// Finalizers left after removing `finalizer`, or `None` if it was absent
pub fn remove_finalizer(finalizers: &[String], finalizer: &str) -> Option<Vec<String>> {
    if !finalizers.iter().any(|f| f == finalizer) {
        return None;
    }
    Some(
        finalizers
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect(),
    )
}

pub fn owner_references_patch(
    resource_version: Option<&str>,
    references: &[OwnerReference],
) -> Value {
    json!({
        "metadata": {
            "resourceVersion": resource_version,
            "ownerReferences": references,
        }
    })
}

pub fn finalizers_patch(resource_version: Option<&str>, finalizers: &[String]) -> Value {
    json!({
        "metadata": {
            "resourceVersion": resource_version,
            "finalizers": finalizers,
        }
    })
}
