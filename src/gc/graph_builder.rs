//! Per-partition dependency graph maintenance
//!
//! Each partition gets one `GraphBuilder`. Its monitors watch every deletable
//! resource in that partition and push changes onto a single channel; one
//! task drains the channel and is the only writer of the graph. Items that
//! need attention are pushed onto the queues shared by all partitions.

use super::cache::ReferenceCache;
use super::client::{
    EventRecorder, GroupResource, GroupVersionResource, MetadataClient, ResourceMapper,
};
use super::discovery::DeletableResources;
use super::graph::UidToNode;
use super::model::{
    FINALIZER_DELETE_DEPENDENTS, FINALIZER_ORPHAN, ObjectAccessor, ObjectMetadata,
    ObjectReference, PartitionId, is_blocking, references_diffs,
};
use super::monitor::{EventType, GraphEvent, Monitor};
use super::node::{Node, NodeRef};
use super::queue::WorkQueue;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// State every partition shares with the workers
#[derive(Clone)]
pub struct SharedState {
    pub attempt_to_delete: Arc<WorkQueue<NodeRef>>,
    pub attempt_to_orphan: Arc<WorkQueue<NodeRef>>,
    pub absent_owner_cache: Arc<ReferenceCache>,
    pub recorder: Arc<dyn EventRecorder>,
}

/// Builds and maintains the ownership graph of one partition
pub struct GraphBuilder {
    partition: PartitionId,
    client: Arc<dyn MetadataClient>,
    mapper: Arc<dyn ResourceMapper>,
    ignored: HashSet<GroupResource>,
    graph: UidToNode,
    shared: SharedState,
    informers_started: watch::Receiver<bool>,
    events_tx: mpsc::UnboundedSender<GraphEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<GraphEvent>>>,
    monitors: Mutex<HashMap<GroupVersionResource, Monitor>>,
    running: AtomicBool,
    cancel: CancellationToken,
}

impl GraphBuilder {
    pub fn new(
        partition: PartitionId,
        client: Arc<dyn MetadataClient>,
        mapper: Arc<dyn ResourceMapper>,
        ignored: HashSet<GroupResource>,
        informers_started: watch::Receiver<bool>,
        shared: SharedState,
        cancel: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            partition,
            client,
            mapper,
            ignored,
            graph: UidToNode::new(),
            shared,
            informers_started,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            monitors: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn partition(&self) -> &PartitionId {
        &self.partition
    }

    pub fn client(&self) -> &Arc<dyn MetadataClient> {
        &self.client
    }

    pub fn mapper(&self) -> &Arc<dyn ResourceMapper> {
        &self.mapper
    }

    pub fn graph(&self) -> &UidToNode {
        &self.graph
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start consuming graph changes until the partition is cancelled
    ///
    /// Monitors registered before this call are started now; later ones are
    /// started by `start_monitors`.
    pub fn start(self: &Arc<Self>) {
        let Some(mut events) = self.events_rx.lock().take() else {
            debug!(partition = %self.partition, "Graph builder already started");
            return;
        };
        self.running.store(true, Ordering::Release);
        self.start_monitors();

        let builder = Arc::clone(self);
        tokio::spawn(async move {
            info!(partition = %builder.partition, "Graph builder running");
            loop {
                tokio::select! {
                    _ = builder.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => builder.process_graph_changes(event),
                        None => break,
                    },
                }
            }
            builder.running.store(false, Ordering::Release);
            builder.monitors.lock().clear();
            info!(partition = %builder.partition, "Graph builder stopped");
        });
    }

    /// Make the monitor set match `resources`
    ///
    /// Existing monitors for resources still present are kept, monitors for
    /// resources that went away are stopped and new ones are created stopped.
    pub fn sync_monitors(&self, resources: &DeletableResources) {
        let mut monitors = self.monitors.lock();
        let mut current = HashMap::with_capacity(resources.len());
        let (mut kept, mut added) = (0usize, 0usize);

        for (gvr, mapping) in resources {
            if self.ignored.contains(&gvr.group_resource()) {
                debug!(partition = %self.partition, resource = %gvr, "Ignoring resource");
                continue;
            }
            if let Some(monitor) = monitors.remove(gvr) {
                current.insert(gvr.clone(), monitor);
                kept += 1;
                continue;
            }
            current.insert(gvr.clone(), Monitor::new(mapping.clone(), &self.cancel));
            added += 1;
        }

        let removed = monitors.len();
        for (_, monitor) in monitors.drain() {
            monitor.stop();
        }
        *monitors = current;

        info!(
            partition = %self.partition,
            kept,
            added,
            removed,
            "Synced monitors"
        );
    }

    /// Start every monitor that is not running yet
    ///
    /// Does nothing until the builder itself has been started.
    pub fn start_monitors(&self) {
        if !self.is_running() {
            return;
        }
        let mut monitors = self.monitors.lock();
        let mut started = 0usize;
        for monitor in monitors.values_mut() {
            if !monitor.is_started() {
                monitor.start(
                    self.client.clone(),
                    self.events_tx.clone(),
                    self.informers_started.clone(),
                );
                started += 1;
            }
        }
        debug!(partition = %self.partition, started, total = monitors.len(), "Started monitors");
    }

    /// True when there is at least one monitor and all of them have synced
    pub fn is_synced(&self) -> bool {
        let monitors = self.monitors.lock();
        if monitors.is_empty() {
            debug!(partition = %self.partition, "Garbage controller has no monitors yet");
            return false;
        }
        let unsynced: Vec<String> = monitors
            .iter()
            .filter(|(_, monitor)| !monitor.is_synced())
            .map(|(gvr, _)| gvr.to_string())
            .collect();
        if !unsynced.is_empty() {
            debug!(partition = %self.partition, ?unsynced, "Monitors not synced");
            return false;
        }
        true
    }

    pub fn is_resource_synced(&self, resource: &GroupVersionResource) -> bool {
        self.monitors
            .lock()
            .get(resource)
            .is_some_and(Monitor::is_synced)
    }

    /// Resources currently monitored
    pub fn monitored_resources(&self) -> BTreeSet<GroupVersionResource> {
        self.monitors.lock().keys().cloned().collect()
    }

    /// Ask the graph to forget an object that workers found missing
    pub fn enqueue_virtual_delete_event(&self, identity: &ObjectReference) {
        let event = GraphEvent::virtual_delete(ObjectMetadata::from_identity(identity));
        if self.events_tx.send(event).is_err() {
            debug!(partition = %self.partition, %identity, "Graph builder stopped, dropping virtual delete");
        }
    }

    /// Apply one change to the graph
    pub(crate) fn process_graph_changes(&self, event: GraphEvent) {
        let GraphEvent {
            event_type,
            object,
            old_object,
            virtual_event,
        } = event;

        let Some(uid) = object.uid().filter(|uid| !uid.is_empty()).map(str::to_string) else {
            debug!(partition = %self.partition, name = object.name(), "Skipping event for object without UID");
            return;
        };
        let identity = ObjectReference::from_object(self.partition.clone(), &object);
        debug!(
            partition = %self.partition,
            event = ?event_type,
            virtual_event,
            %identity,
            "Processing graph change"
        );

        let mut existing = self.graph.read(&uid);
        if !virtual_event {
            if let Some(node) = existing.take() {
                existing = Some(if node.is_observed() {
                    node
                } else {
                    self.observe_virtual_node(node, &identity)
                });
            }
        }

        match (event_type, existing) {
            (EventType::Add | EventType::Update, None) => {
                let being_deleted = object.is_being_deleted();
                let node = Arc::new(Node::observed(
                    identity,
                    object.owner_references().to_vec(),
                    being_deleted,
                    being_deleted && object.has_delete_dependents_finalizer(),
                ));
                self.insert_node(&node);
                // A creation and a deletion may have been folded into one event.
                self.process_transitions(old_object.as_ref(), &object, &node);
            }
            (EventType::Add | EventType::Update, Some(node)) => {
                let diffs = references_diffs(&node.owners(), object.owner_references());
                if !diffs.is_empty() {
                    self.add_unblocked_owners_to_delete_queue(&diffs.removed, &diffs.changed);
                    node.set_owners(object.owner_references().to_vec());
                    self.add_dependent_to_owners(&node, &diffs.added);
                    self.remove_dependent_from_owners(&node, &diffs.removed);
                }
                if object.is_being_deleted() {
                    node.mark_being_deleted();
                }
                self.process_transitions(old_object.as_ref(), &object, &node);
            }
            (EventType::Delete, None) => {
                debug!(partition = %self.partition, %identity, "Item doesn't exist in the graph");
            }
            (EventType::Delete, Some(node)) => {
                let remove = if virtual_event {
                    self.process_virtual_delete(&node, &identity)
                } else {
                    true
                };
                if remove {
                    self.remove_node(&node);
                    let dependents = node.dependents();
                    if !dependents.is_empty() {
                        self.shared.absent_owner_cache.add(identity);
                    }
                    for dependent in dependents {
                        self.shared.attempt_to_delete.add(NodeRef::new(dependent));
                    }
                    for owner in node.owners() {
                        // Lets the owner check whether all its dependents are gone.
                        if let Some(owner_node) = self.graph.read(&owner.uid) {
                            if owner_node.is_deleting_dependents() {
                                self.shared.attempt_to_delete.add(NodeRef::new(owner_node));
                            }
                        }
                    }
                }
            }
        }
    }

    // First real sighting of an object previously known only as an owner.
    fn observe_virtual_node(&self, node: Arc<Node>, identity: &ObjectReference) -> Arc<Node> {
        let node = if node.identity != *identity {
            let (_, mismatched) = partition_dependents(&node.dependents(), identity);
            for dependent in mismatched {
                if !identity.namespace.is_empty() && dependent.identity.namespace != identity.namespace
                {
                    self.report_invalid_namespace_owner_ref(&dependent, &identity.uid);
                }
                self.shared.attempt_to_delete.add(NodeRef::new(dependent));
            }

            debug!(
                partition = %self.partition,
                virtual_identity = %node.identity,
                observed_identity = %identity,
                "Replacing virtual item with observed item"
            );
            let replacement = Arc::new(node.clone_with_identity(identity.clone()));
            self.graph.write(Arc::clone(&replacement));
            replacement
        } else {
            node
        };
        node.mark_observed();
        node
    }

    // Returns whether the node should be removed from the graph.
    fn process_virtual_delete(&self, node: &Arc<Node>, deleted: &ObjectReference) -> bool {
        if node.is_virtual() {
            // Dependents may disagree about the coordinates of a virtual owner.
            let (matching, mismatched) = partition_dependents(&node.dependents(), deleted);
            if mismatched.is_empty() {
                return true;
            }
            if !matching.is_empty() {
                self.shared.absent_owner_cache.add(deleted.clone());
                for dependent in matching {
                    self.shared.attempt_to_delete.add(NodeRef::new(dependent));
                }
            }
            let alternate = (node.identity == *deleted)
                .then(|| alternate_owner_identity(mismatched, deleted))
                .flatten();
            if let Some(alternate) = alternate {
                debug!(
                    partition = %self.partition,
                    absent = %deleted,
                    alternate = %alternate,
                    "Retrying virtual owner under alternate identity"
                );
                let replacement = Arc::new(node.clone_with_identity(alternate));
                self.graph.write(Arc::clone(&replacement));
                self.shared
                    .attempt_to_delete
                    .add_rate_limited(NodeRef::new(replacement));
            }
            return false;
        }

        if node.identity != *deleted {
            // An observed node is never removed on the word of a virtual event
            // with other coordinates; only dependents pointing at those go.
            let (matching, _) = partition_dependents(&node.dependents(), deleted);
            if !matching.is_empty() {
                self.shared.absent_owner_cache.add(deleted.clone());
                for dependent in matching {
                    self.shared.attempt_to_delete.add(NodeRef::new(dependent));
                }
            }
            return false;
        }

        true
    }

    fn insert_node(&self, node: &Arc<Node>) {
        self.graph.write(Arc::clone(node));
        self.add_dependent_to_owners(node, &node.owners());
    }

    fn remove_node(&self, node: &Arc<Node>) {
        self.graph.delete(node.uid());
        self.remove_dependent_from_owners(node, &node.owners());
    }

    fn add_dependent_to_owners(&self, node: &Arc<Node>, owners: &[OwnerReference]) {
        for owner in owners {
            match self.graph.read(&owner.uid) {
                None => {
                    // Placeholder until the owner is observed; a worker checks
                    // whether it exists at all.
                    let identity = ObjectReference::from_owner_reference(
                        self.partition.clone(),
                        owner,
                        node.identity.namespace.clone(),
                    );
                    debug!(partition = %self.partition, %identity, "Adding virtual item");
                    let owner_node = Arc::new(Node::virtual_owner(identity));
                    self.graph.write(Arc::clone(&owner_node));
                    owner_node.add_dependent(Arc::clone(node));
                    self.shared.attempt_to_delete.add(NodeRef::new(owner_node));
                }
                Some(owner_node) => {
                    owner_node.add_dependent(Arc::clone(node));

                    let owner_namespace = &owner_node.identity.namespace;
                    if !owner_namespace.is_empty() && *owner_namespace != node.identity.namespace {
                        if owner_node.is_observed() {
                            self.report_invalid_namespace_owner_ref(node, &owner.uid);
                        }
                        self.shared.attempt_to_delete.add(NodeRef::new(Arc::clone(node)));
                    }

                    if !owner_node.identity.matches_owner_reference(owner) {
                        if owner_node.is_observed() {
                            debug!(
                                partition = %self.partition,
                                item = %node.identity,
                                owner = %owner_node.identity,
                                "Item references an owner with coordinates that do not match the observed identity"
                            );
                        }
                        self.shared.attempt_to_delete.add(NodeRef::new(Arc::clone(node)));
                    }
                }
            }
        }
    }

    fn remove_dependent_from_owners(&self, node: &Arc<Node>, owners: &[OwnerReference]) {
        for owner in owners {
            let Some(owner_node) = self.graph.read(&owner.uid) else {
                continue;
            };
            owner_node.delete_dependent(node.uid());
            // Placeholders only exist to track dependents.
            if owner_node.is_virtual() && owner_node.dependents_len() == 0 {
                self.graph.delete(owner_node.uid());
            }
        }
    }

    fn add_unblocked_owners_to_delete_queue(
        &self,
        removed: &[OwnerReference],
        changed: &[(OwnerReference, OwnerReference)],
    ) {
        let unblocked = removed
            .iter()
            .filter(|r| is_blocking(r))
            .chain(
                changed
                    .iter()
                    .filter(|(old, new)| is_blocking(old) && !is_blocking(new))
                    .map(|(_, new)| new),
            );
        for reference in unblocked {
            if let Some(owner_node) = self.graph.read(&reference.uid) {
                self.shared.attempt_to_delete.add(NodeRef::new(owner_node));
            }
        }
    }

    fn process_transitions(
        &self,
        old: Option<&ObjectMetadata>,
        new: &ObjectMetadata,
        node: &Arc<Node>,
    ) {
        if deletion_starts_with_finalizer(old, new, FINALIZER_ORPHAN) {
            debug!(partition = %self.partition, item = %node.identity, "Adding item to attemptToOrphan");
            self.shared.attempt_to_orphan.add(NodeRef::new(Arc::clone(node)));
            return;
        }
        if deletion_starts_with_finalizer(old, new, FINALIZER_DELETE_DEPENDENTS) {
            debug!(
                partition = %self.partition,
                item = %node.identity,
                "Adding item to attemptToDelete, waiting for its dependents to be deleted"
            );
            // Virtual nodes were created without the flag.
            node.mark_deleting_dependents();
            for dependent in node.dependents() {
                self.shared.attempt_to_delete.add(NodeRef::new(dependent));
            }
            self.shared.attempt_to_delete.add(NodeRef::new(Arc::clone(node)));
        }
    }

    fn report_invalid_namespace_owner_ref(&self, node: &Node, owner_uid: &str) {
        let Some(owner) = node.owners().into_iter().find(|o| o.uid == owner_uid) else {
            return;
        };
        let message = format!(
            "ownerRef [{}/{}, namespace: {}, name: {}, uid: {}] does not exist in namespace {:?}",
            owner.api_version,
            owner.kind,
            node.identity.namespace,
            owner.name,
            owner.uid,
            node.identity.namespace
        );
        self.shared
            .recorder
            .warning(&node.identity, "OwnerRefInvalidNamespace", &message);
    }
}

/// True when `new` is the first version being deleted with `finalizer` set
fn deletion_starts_with_finalizer(
    old: Option<&ObjectMetadata>,
    new: &ObjectMetadata,
    finalizer: &str,
) -> bool {
    if !new.is_being_deleted() || !new.has_finalizer(finalizer) {
        return false;
    }
    match old {
        None => true,
        Some(old) => !(old.is_being_deleted() && old.has_finalizer(finalizer)),
    }
}

/// Split dependents by whether their reference to `owner` matches its coordinates
///
/// A dependent can land in both lists if it holds several references with
/// the owner's UID.
pub(crate) fn partition_dependents(
    dependents: &[Arc<Node>],
    owner: &ObjectReference,
) -> (Vec<Arc<Node>>, Vec<Arc<Node>>) {
    let owner_is_namespaced = !owner.namespace.is_empty();
    let mut matching = Vec::new();
    let mut mismatched = Vec::new();

    for dependent in dependents {
        let (mut found_match, mut found_mismatch) = (false, false);
        if owner_is_namespaced && owner.namespace != dependent.identity.namespace {
            found_mismatch = true;
        } else {
            for reference in dependent.owners().iter().filter(|r| r.uid == owner.uid) {
                if owner.matches_owner_reference(reference) {
                    found_match = true;
                } else {
                    found_mismatch = true;
                }
            }
        }
        if found_match {
            matching.push(Arc::clone(dependent));
        }
        if found_mismatch {
            mismatched.push(Arc::clone(dependent));
        }
    }
    (matching, mismatched)
}

/// Another identity some dependent uses for a UID verified absent as `absent`
///
/// Dependents are visited in identity order so the choice is deterministic.
pub(crate) fn alternate_owner_identity(
    mut dependents: Vec<Arc<Node>>,
    absent: &ObjectReference,
) -> Option<ObjectReference> {
    let absent_is_cluster_scoped = absent.namespace.is_empty();
    dependents.sort_by(|a, b| a.identity.cmp(&b.identity));

    for dependent in &dependents {
        for reference in dependent.owners().iter().filter(|r| r.uid == absent.uid) {
            if absent.matches_owner_reference(reference)
                && (absent_is_cluster_scoped || absent.namespace == dependent.identity.namespace)
            {
                continue;
            }

            let mut candidate = ObjectReference::from_owner_reference(
                absent.partition.clone(),
                reference,
                dependent.identity.namespace.clone(),
            );
            if absent_is_cluster_scoped
                && candidate.api_version == absent.api_version
                && candidate.kind == absent.kind
            {
                // The kind is known to be cluster-scoped.
                candidate.namespace.clear();
            }
            if candidate != *absent {
                return Some(candidate);
            }
        }
    }
    None
}
