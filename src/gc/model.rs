//! Object identity and metadata types shared by every part of the collector
//!
//! Objects are handled through their metadata only. `ObjectAccessor` gives the
//! graph builder and the workers a uniform view over the metadata shapes that
//! come back from the API (typed objects, dynamic objects, partial metadata).

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Finalizer that asks the collector to orphan dependents before the owner goes away
pub const FINALIZER_ORPHAN: &str = "orphan";

/// Finalizer that asks the collector to delete blocking dependents first
pub const FINALIZER_DELETE_DEPENDENTS: &str = "foregroundDeletion";

const ROOT_PARTITION: &str = "root";

/// Identifies the cluster an object lives in
///
/// `Root` is the control plane's own cluster. Every other partition is a
/// project cluster addressed by its project name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum PartitionId {
    #[default]
    Root,
    Project(String),
}

impl PartitionId {
    /// Build a partition id from a project name
    ///
    /// The empty string and "root" both name the root partition.
    pub fn project(name: impl Into<String>) -> Self {
        let name = name.into();
        if name.is_empty() || name == ROOT_PARTITION {
            Self::Root
        } else {
            Self::Project(name)
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Root => ROOT_PARTITION,
            Self::Project(name) => name,
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartitionId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::project(s))
    }
}

/// Full identity of an object, including the partition it was observed in
///
/// `namespace` is empty for cluster-scoped objects. Two references are equal
/// only when every coordinate matches; the graph itself keys vertices by UID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectReference {
    pub partition: PartitionId,
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    pub namespace: String,
}

impl ObjectReference {
    /// Identity of the owner named by an owner reference
    ///
    /// Owner references carry no namespace, so the caller supplies the best
    /// guess (the dependent's namespace, or empty for cluster scope).
    pub fn from_owner_reference(
        partition: PartitionId,
        owner: &OwnerReference,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            partition,
            api_version: owner.api_version.clone(),
            kind: owner.kind.clone(),
            name: owner.name.clone(),
            uid: owner.uid.clone(),
            namespace: namespace.into(),
        }
    }

    /// Identity of an observed object
    pub fn from_object(partition: PartitionId, object: &ObjectMetadata) -> Self {
        Self {
            partition,
            api_version: object.api_version.clone(),
            kind: object.kind.clone(),
            name: object.name().to_string(),
            uid: object.uid().unwrap_or_default().to_string(),
            namespace: object.namespace().unwrap_or_default().to_string(),
        }
    }

    /// Owner reference pointing at this object
    pub fn to_owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            ..Default::default()
        }
    }

    /// True when an owner reference names exactly this object
    pub fn matches_owner_reference(&self, owner: &OwnerReference) -> bool {
        self.uid == owner.uid
            && self.name == owner.name
            && self.kind == owner.kind
            && self.api_version == owner.api_version
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}, namespace: {}, name: {}, uid: {}, partition: {}]",
            self.api_version, self.kind, self.namespace, self.name, self.uid, self.partition
        )
    }
}

/// Metadata of an object together with its type information
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
}

impl ObjectMetadata {
    /// Minimal metadata carrying only an identity, used for virtual delete events
    pub fn from_identity(identity: &ObjectReference) -> Self {
        Self {
            api_version: identity.api_version.clone(),
            kind: identity.kind.clone(),
            metadata: ObjectMeta {
                name: Some(identity.name.clone()),
                namespace: (!identity.namespace.is_empty()).then(|| identity.namespace.clone()),
                uid: Some(identity.uid.clone()),
                ..Default::default()
            },
        }
    }
}

/// Uniform read access to object metadata
pub trait ObjectAccessor {
    fn meta(&self) -> &ObjectMeta;

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref().filter(|ns| !ns.is_empty())
    }

    fn uid(&self) -> Option<&str> {
        self.meta().uid.as_deref()
    }

    fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }

    fn owner_references(&self) -> &[OwnerReference] {
        self.meta().owner_references.as_deref().unwrap_or_default()
    }

    fn finalizers(&self) -> &[String] {
        self.meta().finalizers.as_deref().unwrap_or_default()
    }

    fn is_being_deleted(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }

    fn has_orphan_finalizer(&self) -> bool {
        self.has_finalizer(FINALIZER_ORPHAN)
    }

    fn has_delete_dependents_finalizer(&self) -> bool {
        self.has_finalizer(FINALIZER_DELETE_DEPENDENTS)
    }
}

impl ObjectAccessor for ObjectMeta {
    fn meta(&self) -> &ObjectMeta {
        self
    }
}

impl ObjectAccessor for ObjectMetadata {
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
}

impl ObjectAccessor for kube::core::DynamicObject {
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
}

/// True when the owner reference asks to block the owner's foreground deletion
pub fn is_blocking(owner: &OwnerReference) -> bool {
    owner.block_owner_deletion == Some(true)
}

/// Owner reference changes between two versions of an object
#[derive(Debug, Default)]
pub struct ReferenceDiffs {
    pub added: Vec<OwnerReference>,
    pub removed: Vec<OwnerReference>,
    /// `(old, new)` pairs for references to the same owner UID that changed
    pub changed: Vec<(OwnerReference, OwnerReference)>,
}

impl ReferenceDiffs {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Compare owner references by UID
pub fn references_diffs(old: &[OwnerReference], new: &[OwnerReference]) -> ReferenceDiffs {
    let mut diffs = ReferenceDiffs::default();
    for new_ref in new {
        match old.iter().find(|r| r.uid == new_ref.uid) {
            Some(old_ref) if old_ref != new_ref => {
                diffs.changed.push((old_ref.clone(), new_ref.clone()));
            }
            Some(_) => {}
            None => diffs.added.push(new_ref.clone()),
        }
    }
    for old_ref in old {
        if !new.iter().any(|r| r.uid == old_ref.uid) {
            diffs.removed.push(old_ref.clone());
        }
    }
    diffs
}

/// Finds the owner references whose `blockOwnerDeletion` flipped from true to false
pub fn unblocked_owner_uids(diffs: &ReferenceDiffs) -> Vec<String> {
    diffs
        .changed
        .iter()
        .filter(|(old, new)| is_blocking(old) && !is_blocking(new))
        .map(|(_, new)| new.uid.clone())
        .collect()
}
