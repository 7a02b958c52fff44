//! Garbage collector orchestrator
//!
//! Owns the shared work queues and absent-owner cache, tracks one graph
//! builder per registered partition and runs the workers that act on the
//! queued nodes. Workers never hold registry entries across API calls; they
//! clone the builder out and release the map entry first.

use super::cache::ReferenceCache;
use super::client::{
    DiscoveryClient, EventRecorder, GroupResource, GroupVersionResource, MetadataClient,
    PropagationPolicy, ResourceMapper, TracingEventRecorder,
};
use super::discovery::{DeletableResources, get_deletable_resources, merge_failed_groups, print_diff};
use super::error::{GcError, Result};
use super::graph_builder::{GraphBuilder, SharedState};
use super::model::{
    FINALIZER_DELETE_DEPENDENTS, FINALIZER_ORPHAN, ObjectAccessor, ObjectMetadata,
    ObjectReference, PartitionId,
};
use super::node::{Node, NodeRef};
use super::queue::{RateLimiterConfig, WorkQueue};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Settings shared by all partitions
#[derive(Debug, Clone)]
pub struct CollectorOptions {
    pub queue: RateLimiterConfig,
    pub absent_owner_capacity: u64,
    pub absent_owner_ttl: Duration,
    /// How long `run` waits for caches before starting workers anyway
    pub initial_sync_timeout: Duration,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            queue: RateLimiterConfig::default(),
            absent_owner_capacity: super::cache::DEFAULT_CAPACITY,
            absent_owner_ttl: super::cache::DEFAULT_TTL,
            initial_sync_timeout: Duration::from_secs(30),
        }
    }
}

/// Everything needed to bring a partition under management
pub struct PartitionSpec {
    pub id: PartitionId,
    pub client: Arc<dyn MetadataClient>,
    pub mapper: Arc<dyn ResourceMapper>,
    pub discovery: Arc<dyn DiscoveryClient>,
    pub ignored_resources: HashSet<GroupResource>,
    pub informers_started: watch::Receiver<bool>,
    pub initial_sync_timeout: Duration,
}

struct PartitionEntry {
    builder: Arc<GraphBuilder>,
    cancel: CancellationToken,
}

/// What to do with a work item after processing it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkAction {
    Forget,
    Requeue,
}

/// Classification of an item's owner references
#[derive(Debug, Default)]
struct ClassifiedReferences {
    solid: Vec<OwnerReference>,
    dangling: Vec<OwnerReference>,
    waiting_for_dependents_deletion: Vec<OwnerReference>,
}

/// Cascading garbage collector over any number of partitions
pub struct GarbageCollector {
    attempt_to_delete: Arc<WorkQueue<NodeRef>>,
    attempt_to_orphan: Arc<WorkQueue<NodeRef>>,
    absent_owner_cache: Arc<ReferenceCache>,
    recorder: Arc<dyn EventRecorder>,
    partitions: DashMap<PartitionId, PartitionEntry>,
    options: CollectorOptions,
    /// Resync passes that found no resources or timed out waiting for monitors
    resync_errors: AtomicU64,
}

impl GarbageCollector {
    pub fn new(options: CollectorOptions) -> Self {
        Self::with_recorder(options, Arc::new(TracingEventRecorder))
    }

    pub fn with_recorder(options: CollectorOptions, recorder: Arc<dyn EventRecorder>) -> Self {
        Self {
            attempt_to_delete: Arc::new(WorkQueue::new("garbage_collector_attempt_to_delete", options.queue)),
            attempt_to_orphan: Arc::new(WorkQueue::new("garbage_collector_attempt_to_orphan", options.queue)),
            absent_owner_cache: Arc::new(ReferenceCache::new(
                options.absent_owner_capacity,
                options.absent_owner_ttl,
            )),
            recorder,
            partitions: DashMap::new(),
            options,
            resync_errors: AtomicU64::new(0),
        }
    }

    fn shared_state(&self) -> SharedState {
        SharedState {
            attempt_to_delete: self.attempt_to_delete.clone(),
            attempt_to_orphan: self.attempt_to_orphan.clone(),
            absent_owner_cache: self.absent_owner_cache.clone(),
            recorder: self.recorder.clone(),
        }
    }

    /// Register a partition, start its graph builder and wait for its caches
    ///
    /// A sync timeout is logged, not returned: the partition stays registered
    /// and its monitors keep syncing in the background.
    pub async fn add_partition(&self, ctx: &CancellationToken, spec: PartitionSpec) -> Result<()> {
        let PartitionSpec {
            id,
            client,
            mapper,
            discovery,
            ignored_resources,
            informers_started,
            initial_sync_timeout,
        } = spec;

        let cancel = ctx.child_token();
        let builder = Arc::new(GraphBuilder::new(
            id.clone(),
            client,
            mapper,
            ignored_resources,
            informers_started,
            self.shared_state(),
            cancel.clone(),
        ));

        match self.partitions.entry(id.clone()) {
            Entry::Occupied(_) => return Err(GcError::PartitionAlreadyRegistered(id)),
            Entry::Vacant(entry) => {
                entry.insert(PartitionEntry {
                    builder: builder.clone(),
                    cancel: cancel.clone(),
                });
            }
        }

        builder.start();
        let discovered = get_deletable_resources(discovery.as_ref()).await;
        builder.sync_monitors(&discovered.resources);
        builder.start_monitors();

        info!(partition = %id, resources = discovered.resources.len(), "Partition added, waiting for caches to sync");
        if wait_until(&cancel, initial_sync_timeout, || builder.is_synced()).await {
            info!(partition = %id, "Partition caches synced");
        } else {
            info!(partition = %id, "Timed out waiting for partition caches to sync, continuing");
        }
        Ok(())
    }

    /// Stop a partition's builder and monitors
    ///
    /// Items already queued for the partition stay queued; workers requeue
    /// them until the partition is registered again.
    pub fn remove_partition(&self, id: &PartitionId) {
        match self.partitions.remove(id) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                info!(partition = %id, "Partition removed");
            }
            None => debug!(partition = %id, "Partition not registered, nothing to remove"),
        }
    }

    /// Registered partition ids, sorted
    pub fn partitions(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self.partitions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn builder_for(&self, id: &PartitionId) -> Option<Arc<GraphBuilder>> {
        self.partitions.get(id).map(|entry| entry.builder.clone())
    }

    pub fn builders(&self) -> Vec<Arc<GraphBuilder>> {
        self.partitions.iter().map(|entry| entry.builder.clone()).collect()
    }

    /// True if any partition's graph holds the UID
    pub fn graph_has_uid(&self, uid: &str) -> bool {
        self.builders().iter().any(|b| b.graph().contains(uid))
    }

    /// True when at least one partition is registered and all have synced
    pub fn is_synced(&self) -> bool {
        let builders = self.builders();
        !builders.is_empty() && builders.iter().all(|b| b.is_synced())
    }

    /// Number of failed resync passes since start
    pub fn resync_errors(&self) -> u64 {
        self.resync_errors.load(Ordering::Relaxed)
    }

    fn any_builder_resource_synced(&self, resource: &GroupVersionResource) -> bool {
        self.builders().iter().any(|b| b.is_resource_synced(resource))
    }

    /// Run the workers until `ctx` is cancelled
    ///
    /// On shutdown the queues are closed and every partition is stopped.
    pub async fn run(self: Arc<Self>, ctx: CancellationToken, workers: usize) {
        info!(workers, "Starting garbage collector");

        if !self.partitions.is_empty() {
            if wait_until(&ctx, self.options.initial_sync_timeout, || self.is_synced()).await {
                info!("All resource monitors have synced, proceeding to collect garbage");
            } else {
                info!("Timed out waiting for dependency graph builders to sync, proceeding anyway");
            }
        }

        let mut handles = Vec::with_capacity(workers * 2);
        for _ in 0..workers {
            handles.push(tokio::spawn(self.clone().run_attempt_to_delete_worker()));
            handles.push(tokio::spawn(self.clone().run_attempt_to_orphan_worker()));
        }

        ctx.cancelled().await;
        info!("Shutting down garbage collector");

        self.attempt_to_delete.shut_down();
        self.attempt_to_orphan.shut_down();
        for entry in self.partitions.iter() {
            entry.cancel.cancel();
        }
        futures::future::join_all(handles).await;
        info!("Garbage collector stopped");
    }

    /// Periodically rediscover deletable resources and resync monitors
    pub async fn sync(
        self: Arc<Self>,
        ctx: CancellationToken,
        discovery: Arc<dyn DiscoveryClient>,
        period: Duration,
    ) {
        let mut known = DeletableResources::new();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Some(resources) = self.sync_once(&ctx, discovery.as_ref(), &known, period).await {
                known = resources;
            }
        }
        debug!("Resource sync loop stopped");
    }

    /// One resync pass; returns the new resource set if it was applied
    async fn sync_once(
        &self,
        ctx: &CancellationToken,
        discovery: &dyn DiscoveryClient,
        known: &DeletableResources,
        period: Duration,
    ) -> Option<DeletableResources> {
        let mut discovered = get_deletable_resources(discovery).await;

        if discovered.is_partial() {
            merge_failed_groups(&mut discovered, known, |gvr| self.any_builder_resource_synced(gvr));
        }
        if discovered.resources.is_empty() {
            debug!(error = ?discovered.error, "No resources reported by discovery, skipping garbage collector sync");
            self.resync_errors.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        if discovered.resources == *known {
            debug!("No resource updates from discovery, skipping garbage collector sync");
            return None;
        }

        info!(diff = %print_diff(known, &discovered.resources), "Syncing garbage collector");

        let builders = self.builders();
        for builder in &builders {
            // New resource types need fresh mappings.
            builder.mapper().reset();
            builder.sync_monitors(&discovered.resources);
            builder.start_monitors();
        }

        if wait_until(ctx, period, || builders.iter().all(|b| b.is_synced())).await {
            debug!("Synced garbage collector");
        } else {
            warn!("Timed out waiting for dependency graph builders to sync during resync");
            self.resync_errors.fetch_add(1, Ordering::Relaxed);
        }
        Some(discovered.resources)
    }

    async fn run_attempt_to_delete_worker(self: Arc<Self>) {
        while self.process_attempt_to_delete_worker().await {}
    }

    async fn process_attempt_to_delete_worker(&self) -> bool {
        let Some(item) = self.attempt_to_delete.get().await else {
            return false;
        };
        match self.attempt_to_delete_worker(&item).await {
            WorkAction::Forget => self.attempt_to_delete.forget(&item),
            WorkAction::Requeue => self.attempt_to_delete.add_rate_limited(item.clone()),
        }
        self.attempt_to_delete.done(&item);
        true
    }

    async fn attempt_to_delete_worker(&self, item: &NodeRef) -> WorkAction {
        let Some(builder) = self.builder_for(&item.identity.partition) else {
            debug!(
                partition = %item.identity.partition,
                item = %item.identity,
                "No graph builder for item's partition, requeuing"
            );
            return WorkAction::Requeue;
        };

        if !item.is_observed() {
            match builder.graph().read(item.uid()) {
                None => {
                    debug!(item = %item.identity, "Item no longer in the graph, skipping");
                    return WorkAction::Forget;
                }
                Some(node) if node.is_observed() => {
                    debug!(item = %item.identity, "Item no longer virtual in the graph, skipping");
                    return WorkAction::Forget;
                }
                Some(_) => {}
            }
        }

        match self.attempt_to_delete_item(&builder, item).await {
            Ok(()) if !item.is_observed() => {
                debug!(item = %item.identity, "Item hasn't been observed via informer yet");
                WorkAction::Requeue
            }
            Ok(()) => WorkAction::Forget,
            Err(GcError::VirtualDeleteEnqueued | GcError::NamespacedOwnerOfClusterScopedObject) => {
                WorkAction::Forget
            }
            Err(e @ GcError::RestMapping { .. }) => {
                debug!(item = %item.identity, error = %e, "Error syncing item");
                WorkAction::Requeue
            }
            Err(e) if e.is_forbidden() => {
                error!(item = %item.identity, error = %e, "Not allowed to act on item, dropping it");
                WorkAction::Forget
            }
            Err(e) => {
                error!(item = %item.identity, error = %e, "Error syncing item");
                WorkAction::Requeue
            }
        }
    }

    /// Delete the item if every owner reference is dangling
    ///
    /// The live object is fetched first; if it is gone, or its UID changed, a
    /// virtual delete event is sent to the partition's builder instead.
    async fn attempt_to_delete_item(&self, builder: &GraphBuilder, item: &Arc<Node>) -> Result<()> {
        debug!(item = %item.identity, virtual_node = item.is_virtual(), "Processing item");

        if item.is_being_deleted() && !item.is_deleting_dependents() {
            debug!(item = %item.identity, "Item is already being deleted, skipping");
            return Ok(());
        }

        let latest = match self.get_object(&item.identity).await {
            Ok(latest) => latest,
            Err(e) if e.is_not_found() => {
                debug!(item = %item.identity, "Item not found, generating a virtual delete event");
                builder.enqueue_virtual_delete_event(&item.identity);
                return Err(GcError::VirtualDeleteEnqueued);
            }
            Err(e) => return Err(e),
        };

        if latest.uid() != Some(item.uid()) {
            debug!(item = %item.identity, "UID doesn't match, generating a virtual delete event");
            builder.enqueue_virtual_delete_event(&item.identity);
            return Err(GcError::VirtualDeleteEnqueued);
        }

        if item.is_deleting_dependents() {
            return self.process_deleting_dependents_item(item).await;
        }

        let owner_references = latest.owner_references();
        if owner_references.is_empty() {
            debug!(item = %item.identity, "Item doesn't have an owner, continuing");
            return Ok(());
        }

        let classified = self.classify_references(builder, item, owner_references).await?;
        debug!(
            item = %item.identity,
            solid = classified.solid.len(),
            dangling = classified.dangling.len(),
            waiting = classified.waiting_for_dependents_deletion.len(),
            "Classified item's owner references"
        );

        if !classified.solid.is_empty() {
            if classified.dangling.is_empty() && classified.waiting_for_dependents_deletion.is_empty() {
                return Ok(());
            }
            let owner_uids: Vec<String> = classified
                .dangling
                .iter()
                .chain(&classified.waiting_for_dependents_deletion)
                .map(|r| r.uid.clone())
                .collect();
            debug!(item = %item.identity, ?owner_uids, "Item has a solid owner, removing dangling and waiting references");
            return self.delete_owner_references(&item.identity, &owner_uids).await;
        }

        if !classified.waiting_for_dependents_deletion.is_empty() && item.dependents_len() != 0 {
            if let Some(dependent) = item.dependents().into_iter().find(|d| d.is_deleting_dependents()) {
                debug!(
                    item = %item.identity,
                    dependent = %dependent.identity,
                    "An owner and a dependent are deleting dependents, unblocking owner references"
                );
                self.unblock_owner_references(&item.identity).await?;
            }
            debug!(item = %item.identity, "Deleting item in the foreground, an owner waits for its dependents");
            return self
                .delete_object(
                    &item.identity,
                    latest.resource_version(),
                    owner_references,
                    PropagationPolicy::Foreground,
                )
                .await;
        }

        let policy = propagation_policy_for(&latest);
        debug!(item = %item.identity, %policy, "Deleting item");
        self.delete_object(&item.identity, latest.resource_version(), owner_references, policy)
            .await
    }

    async fn process_deleting_dependents_item(&self, item: &Arc<Node>) -> Result<()> {
        let blocking = item.blocking_dependents();
        if blocking.is_empty() {
            debug!(item = %item.identity, "Removing foregroundDeletion finalizer");
            return self.remove_finalizer(item, FINALIZER_DELETE_DEPENDENTS).await;
        }
        for dependent in blocking {
            if !dependent.is_deleting_dependents() {
                debug!(
                    item = %item.identity,
                    dependent = %dependent.identity,
                    "Adding dependent to attemptToDelete, its owner is deleting dependents"
                );
                self.attempt_to_delete.add(NodeRef::new(dependent));
            }
        }
        Ok(())
    }

    async fn classify_references(
        &self,
        builder: &GraphBuilder,
        item: &Node,
        references: &[OwnerReference],
    ) -> Result<ClassifiedReferences> {
        let mut classified = ClassifiedReferences::default();
        for reference in references {
            match self.is_dangling(builder, reference, item).await? {
                None => classified.dangling.push(reference.clone()),
                Some(owner)
                    if owner.is_being_deleted() && owner.has_delete_dependents_finalizer() =>
                {
                    classified.waiting_for_dependents_deletion.push(reference.clone())
                }
                Some(_) => classified.solid.push(reference.clone()),
            }
        }
        Ok(classified)
    }

    /// Live owner for a reference, or `None` if the reference is dangling
    async fn is_dangling(
        &self,
        builder: &GraphBuilder,
        reference: &OwnerReference,
        item: &Node,
    ) -> Result<Option<ObjectMetadata>> {
        let mut key = ObjectReference::from_owner_reference(item.identity.partition.clone(), reference, "");
        let mapping = builder
            .mapper()
            .mapping(&reference.api_version, &reference.kind)
            .await?;
        if item.identity.is_cluster_scoped() && mapping.namespaced {
            debug!(item = %item.identity, owner = %key, "Cluster-scoped item refers to a namespaced owner");
            return Err(GcError::NamespacedOwnerOfClusterScopedObject);
        }

        if self.absent_owner_cache.has(&key) {
            debug!(item = %item.identity, owner = %key, "Owner is known to be absent");
            return Ok(None);
        }
        key.namespace = item.identity.namespace.clone();
        if self.absent_owner_cache.has(&key) {
            debug!(item = %item.identity, owner = %key, "Owner is known to be absent from the namespace");
            return Ok(None);
        }
        if !mapping.namespaced {
            key.namespace.clear();
        }

        let namespace = mapping.namespaced.then_some(item.identity.namespace.as_str());
        match builder.client().get(&mapping, namespace, &reference.name).await {
            Ok(owner) if owner.uid() == Some(reference.uid.as_str()) => Ok(Some(owner)),
            Ok(_) => {
                debug!(item = %item.identity, owner = %key, "Owner UID mismatch, owner is absent");
                self.absent_owner_cache.add(key);
                Ok(None)
            }
            Err(e) if e.is_not_found() => {
                debug!(item = %item.identity, owner = %key, "Owner not found");
                self.absent_owner_cache.add(key);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn run_attempt_to_orphan_worker(self: Arc<Self>) {
        while self.process_attempt_to_orphan_worker().await {}
    }

    async fn process_attempt_to_orphan_worker(&self) -> bool {
        let Some(item) = self.attempt_to_orphan.get().await else {
            return false;
        };
        match self.attempt_to_orphan_worker(&item).await {
            WorkAction::Forget => self.attempt_to_orphan.forget(&item),
            WorkAction::Requeue => self.attempt_to_orphan.add_rate_limited(item.clone()),
        }
        self.attempt_to_orphan.done(&item);
        true
    }

    /// Strip the owner from all its dependents, then drop its orphan finalizer
    async fn attempt_to_orphan_worker(&self, owner: &NodeRef) -> WorkAction {
        let dependents = owner.dependents();

        if let Err(e) = self.orphan_dependents(&owner.identity, &dependents).await {
            error!(owner = %owner.identity, error = %e, "Failed to orphan dependents");
            return WorkAction::Requeue;
        }
        if let Err(e) = self.remove_finalizer(owner, FINALIZER_ORPHAN).await {
            error!(owner = %owner.identity, error = %e, "Failed to remove orphan finalizer");
            return WorkAction::Requeue;
        }
        WorkAction::Forget
    }

    async fn orphan_dependents(&self, owner: &ObjectReference, dependents: &[Arc<Node>]) -> Result<()> {
        let owner_uids = [owner.uid.clone()];
        let results = futures::future::join_all(
            dependents
                .iter()
                .map(|dependent| self.delete_owner_references(&dependent.identity, &owner_uids)),
        )
        .await;

        let errors: Vec<String> = dependents
            .iter()
            .zip(results)
            .filter_map(|(dependent, result)| match result {
                Err(e) if !e.is_not_found() => Some(format!("orphaning {} failed: {}", dependent.identity, e)),
                _ => None,
            })
            .collect();

        if !errors.is_empty() {
            return Err(GcError::OrphanFailed {
                owner: owner.clone(),
                errors: errors.join("; "),
            });
        }
        debug!(%owner, dependents = dependents.len(), "Updated all dependents");
        Ok(())
    }
}

/// Propagation policy implied by the finalizers an item already carries
fn propagation_policy_for(object: &ObjectMetadata) -> PropagationPolicy {
    if object.has_orphan_finalizer() {
        PropagationPolicy::Orphan
    } else if object.has_delete_dependents_finalizer() {
        PropagationPolicy::Foreground
    } else {
        PropagationPolicy::Background
    }
}

/// Poll `condition` until it holds, the timeout passes or `cancel` fires
async fn wait_until(cancel: &CancellationToken, timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(SYNC_POLL_INTERVAL) => {}
        }
    }
}
