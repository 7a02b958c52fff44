//! API calls made on behalf of workers
//!
//! Every call is routed to the partition named in the object's identity and
//! uses that partition's own client and mapper.

use super::client::{DeleteOptions, PropagationPolicy, ResourceMapping};
use super::collector::GarbageCollector;
use super::error::{ClientError, GcError, Result};
use super::graph_builder::GraphBuilder;
use super::model::{ObjectAccessor, ObjectMetadata, ObjectReference};
use super::node::Node;
use super::patch;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Attempts made when a read-modify-write hits a conflict
const CONFLICT_RETRY_STEPS: u32 = 4;
const CONFLICT_RETRY_DELAY: Duration = Duration::from_millis(10);
const CONFLICT_RETRY_FACTOR: u32 = 5;

/// Namespace to address an object of `mapping` with
fn resource_namespace<'a>(mapping: &ResourceMapping, namespace: &'a str) -> Option<&'a str> {
    (mapping.namespaced && !namespace.is_empty()).then_some(namespace)
}

/// Run `attempt` until it does not fail with a conflict
///
/// Backs off exponentially between attempts; gives up with
/// `ConflictRetriesExhausted` after a fixed number of conflicts.
pub(crate) async fn retry_on_conflict<T, F, Fut>(identity: &ObjectReference, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = CONFLICT_RETRY_DELAY;
    for step in 1..=CONFLICT_RETRY_STEPS {
        match attempt().await {
            Err(e) if e.is_conflict() => {
                debug!(item = %identity, step, "Conflict, retrying");
                if step < CONFLICT_RETRY_STEPS {
                    tokio::time::sleep(delay).await;
                    delay *= CONFLICT_RETRY_FACTOR;
                }
            }
            other => return other,
        }
    }
    Err(GcError::ConflictRetriesExhausted(identity.clone()))
}

impl GarbageCollector {
    /// Builder and mapping for an identity's partition and kind
    pub(crate) async fn resolve(
        &self,
        identity: &ObjectReference,
    ) -> Result<(Arc<GraphBuilder>, ResourceMapping)> {
        let builder = self
            .builder_for(&identity.partition)
            .ok_or_else(|| GcError::PartitionNotRegistered(identity.partition.clone()))?;
        let mapping = builder
            .mapper()
            .mapping(&identity.api_version, &identity.kind)
            .await?;
        Ok((builder, mapping))
    }

    pub(crate) async fn get_object(&self, identity: &ObjectReference) -> Result<ObjectMetadata> {
        let (builder, mapping) = self.resolve(identity).await?;
        if mapping.namespaced && identity.namespace.is_empty() {
            // Only a cluster-scoped dependent can name a namespaced owner without a namespace.
            return Err(GcError::NamespacedOwnerOfClusterScopedObject);
        }
        let namespace = resource_namespace(&mapping, &identity.namespace);
        Ok(builder
            .client()
            .get(&mapping, namespace, &identity.name)
            .await?)
    }

    pub(crate) async fn patch_object(
        &self,
        identity: &ObjectReference,
        patch: &serde_json::Value,
    ) -> Result<ObjectMetadata> {
        let (builder, mapping) = self.resolve(identity).await?;
        let namespace = resource_namespace(&mapping, &identity.namespace);
        Ok(builder
            .client()
            .patch(&mapping, namespace, &identity.name, patch)
            .await?)
    }

    /// Delete with UID and resourceVersion preconditions
    ///
    /// If only the resourceVersion moved and the owner references are the ones
    /// the decision was based on, the delete is retried without it.
    pub(crate) async fn delete_object(
        &self,
        identity: &ObjectReference,
        resource_version: Option<&str>,
        owners_at_version: &[OwnerReference],
        policy: PropagationPolicy,
    ) -> Result<()> {
        let (builder, mapping) = self.resolve(identity).await?;
        let namespace = resource_namespace(&mapping, &identity.namespace);
        let mut options = DeleteOptions {
            uid: Some(identity.uid.clone()),
            resource_version: resource_version.map(str::to_string),
            propagation: Some(policy),
        };

        let result = builder
            .client()
            .delete(&mapping, namespace, &identity.name, &options)
            .await;
        match result {
            Err(ClientError::Conflict(message)) if options.resource_version.is_some() => {
                let latest = match self.get_object(identity).await {
                    Ok(latest) => latest,
                    Err(_) => return Err(ClientError::Conflict(message).into()),
                };
                let unchanged_owners = latest.uid() == Some(identity.uid.as_str())
                    && latest.resource_version() != resource_version
                    && latest.owner_references() == owners_at_version;
                if !unchanged_owners {
                    return Err(ClientError::Conflict(message).into());
                }
                debug!(item = %identity, "Retrying delete without resourceVersion precondition");
                options.resource_version = None;
                Ok(builder
                    .client()
                    .delete(&mapping, namespace, &identity.name, &options)
                    .await?)
            }
            other => Ok(other?),
        }
    }

    /// Remove `finalizer` from the owner, retrying on conflicts
    pub(crate) async fn remove_finalizer(&self, owner: &Node, finalizer: &str) -> Result<()> {
        let identity = &owner.identity;
        retry_on_conflict(identity, || async move {
            let latest = match self.get_object(identity).await {
                Ok(latest) => latest,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            };
            if latest.uid() != Some(identity.uid.as_str()) {
                // A different object now has this name; nothing left to finalize.
                return Ok(());
            }
            let Some(finalizers) = patch::remove_finalizer(latest.finalizers(), finalizer) else {
                debug!(item = %identity, finalizer, "Finalizer already removed");
                return Ok(());
            };
            let body = patch::finalizers_patch(latest.resource_version(), &finalizers);
            match self.patch_object(identity, &body).await {
                Ok(_) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Remove references to `owner_uids` from the dependent's owner references
    ///
    /// Nothing is patched when none of the references are present.
    pub(crate) async fn delete_owner_references(
        &self,
        dependent: &ObjectReference,
        owner_uids: &[String],
    ) -> Result<()> {
        retry_on_conflict(dependent, || async move {
            let latest = self.get_object(dependent).await?;
            if latest.uid() != Some(dependent.uid.as_str()) {
                return Err(ClientError::NotFound.into());
            }
            let Some(remaining) =
                patch::remove_owner_references(latest.owner_references(), owner_uids)
            else {
                return Ok(());
            };
            let body = patch::owner_references_patch(latest.resource_version(), &remaining);
            self.patch_object(dependent, &body).await.map(|_| ())
        })
        .await
    }

    /// Set `blockOwnerDeletion` to false on every owner reference of the item
    pub(crate) async fn unblock_owner_references(&self, item: &ObjectReference) -> Result<()> {
        retry_on_conflict(item, || async move {
            let latest = self.get_object(item).await?;
            if latest.uid() != Some(item.uid.as_str()) {
                return Err(ClientError::NotFound.into());
            }
            let Some(unblocked) = patch::unblock_owner_references(latest.owner_references()) else {
                return Ok(());
            };
            let body = patch::owner_references_patch(latest.resource_version(), &unblocked);
            self.patch_object(item, &body).await.map(|_| ())
        })
        .await
    }
}
