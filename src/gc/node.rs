//! Vertices of the ownership graph

use super::model::{ObjectReference, is_blocking};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// One object in the ownership graph
///
/// A node is either observed (seen through a watch) or virtual (only known
/// because some dependent names it as an owner). The graph builder is the
/// only writer of `owners` and `dependents`; workers read snapshots.
pub struct Node {
    pub identity: ObjectReference,
    dependents: RwLock<HashMap<String, Arc<Node>>>,
    owners: RwLock<Vec<OwnerReference>>,
    being_deleted: AtomicBool,
    deleting_dependents: AtomicBool,
    virtual_node: AtomicBool,
}

impl Node {
    /// Node for an object seen through a watch
    pub fn observed(
        identity: ObjectReference,
        owners: Vec<OwnerReference>,
        being_deleted: bool,
        deleting_dependents: bool,
    ) -> Self {
        Self {
            identity,
            dependents: RwLock::new(HashMap::new()),
            owners: RwLock::new(owners),
            being_deleted: AtomicBool::new(being_deleted),
            deleting_dependents: AtomicBool::new(deleting_dependents),
            virtual_node: AtomicBool::new(false),
        }
    }

    /// Placeholder for an owner that has not been observed yet
    pub fn virtual_owner(identity: ObjectReference) -> Self {
        Self {
            identity,
            dependents: RwLock::new(HashMap::new()),
            owners: RwLock::new(Vec::new()),
            being_deleted: AtomicBool::new(false),
            deleting_dependents: AtomicBool::new(false),
            virtual_node: AtomicBool::new(true),
        }
    }

    /// Copy of this node under a different identity
    ///
    /// Used when an observed object turns out to have different coordinates
    /// than the virtual node created for it.
    pub fn clone_with_identity(&self, identity: ObjectReference) -> Self {
        Self {
            identity,
            dependents: RwLock::new(self.dependents.read().clone()),
            owners: RwLock::new(self.owners.read().clone()),
            being_deleted: AtomicBool::new(self.is_being_deleted()),
            deleting_dependents: AtomicBool::new(self.is_deleting_dependents()),
            virtual_node: AtomicBool::new(self.is_virtual()),
        }
    }

    pub fn uid(&self) -> &str {
        &self.identity.uid
    }

    pub fn is_virtual(&self) -> bool {
        self.virtual_node.load(Ordering::Acquire)
    }

    pub fn is_observed(&self) -> bool {
        !self.is_virtual()
    }

    pub fn mark_observed(&self) {
        self.virtual_node.store(false, Ordering::Release);
    }

    pub fn is_being_deleted(&self) -> bool {
        self.being_deleted.load(Ordering::Acquire)
    }

    pub fn mark_being_deleted(&self) {
        self.being_deleted.store(true, Ordering::Release);
    }

    pub fn is_deleting_dependents(&self) -> bool {
        self.deleting_dependents.load(Ordering::Acquire)
    }

    /// Deleting dependents implies being deleted
    pub fn mark_deleting_dependents(&self) {
        self.being_deleted.store(true, Ordering::Release);
        self.deleting_dependents.store(true, Ordering::Release);
    }

    pub fn owners(&self) -> Vec<OwnerReference> {
        self.owners.read().clone()
    }

    pub fn set_owners(&self, owners: Vec<OwnerReference>) {
        *self.owners.write() = owners;
    }

    pub fn add_dependent(&self, dependent: Arc<Node>) {
        self.dependents
            .write()
            .insert(dependent.uid().to_string(), dependent);
    }

    pub fn delete_dependent(&self, uid: &str) {
        self.dependents.write().remove(uid);
    }

    pub fn dependents_len(&self) -> usize {
        self.dependents.read().len()
    }

    /// Snapshot of the current dependents
    pub fn dependents(&self) -> Vec<Arc<Node>> {
        self.dependents.read().values().cloned().collect()
    }

    /// Dependents that block this node's foreground deletion
    pub fn blocking_dependents(&self) -> Vec<Arc<Node>> {
        self.dependents
            .read()
            .values()
            .filter(|dependent| {
                dependent
                    .owners
                    .read()
                    .iter()
                    .any(|owner| owner.uid == self.identity.uid && is_blocking(owner))
            })
            .cloned()
            .collect()
    }
}

// Dependents are printed by UID only, ownership can be cyclic.
impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.identity)
            .field("dependents", &self.dependents.read().keys().collect::<Vec<_>>())
            .field("owners", &self.owners.read().len())
            .field("being_deleted", &self.is_being_deleted())
            .field("deleting_dependents", &self.is_deleting_dependents())
            .field("virtual", &self.is_virtual())
            .finish()
    }
}

/// Queue handle for a graph node
///
/// Equality is pointer identity: a node replaced in the graph is a different
/// work item than the node it replaced.
#[derive(Debug, Clone)]
pub struct NodeRef(pub Arc<Node>);

impl NodeRef {
    pub fn new(node: Arc<Node>) -> Self {
        Self(node)
    }
}

impl From<Arc<Node>> for NodeRef {
    fn from(node: Arc<Node>) -> Self {
        Self(node)
    }
}

impl Deref for NodeRef {
    type Target = Arc<Node>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for NodeRef {}

impl Hash for NodeRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}
