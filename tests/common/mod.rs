//! In-memory cluster for integration tests
//!
//! Implements the metadata and discovery seams with API server deletion
//! semantics: finalizers hold an object in a terminating state, orphan and
//! foreground propagation add their finalizers, and preconditions on UID and
//! resourceVersion fail with a conflict.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use parking_lot::Mutex;
use projectgc::gc::model::{FINALIZER_DELETE_DEPENDENTS, FINALIZER_ORPHAN, ObjectAccessor};
use projectgc::gc::{
    ClientError, CollectorOptions, DeleteOptions, DiscoveredResource, DiscoveryClient,
    DiscoveryResourceMapper, EventRecorder, GarbageCollector, GroupVersionResource,
    MetadataClient, ObjectMetadata, ObjectReference, PartitionId, PartitionSpec,
    PropagationPolicy, ResourceMapping, ServerResources, WatchEvent, WatchStream,
};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// A delete call received through the metadata client
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteCall {
    pub name: String,
    pub uid: Option<String>,
    pub propagation: Option<PropagationPolicy>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, ObjectMetadata>,
    next_resource_version: u64,
    watchers: Vec<(ResourceMapping, mpsc::UnboundedSender<WatchEvent>)>,
    deletes: Vec<DeleteCall>,
    patches: usize,
    gets: BTreeMap<String, usize>,
    /// Injected read failures by object name, with how many remain
    get_failures: BTreeMap<String, (ClientError, usize)>,
}

impl State {
    fn bump(&mut self, object: &mut ObjectMetadata) {
        self.next_resource_version += 1;
        object.metadata.resource_version = Some(self.next_resource_version.to_string());
    }

    fn notify(&mut self, event: impl Fn(ObjectMetadata) -> WatchEvent, object: &ObjectMetadata) {
        self.watchers.retain(|(mapping, tx)| {
            if !matches_type(mapping, object) {
                return !tx.is_closed();
            }
            tx.send(event(object.clone())).is_ok()
        });
    }

    fn store(&mut self, mut object: ObjectMetadata) -> ObjectMetadata {
        self.bump(&mut object);
        let uid = object.uid().unwrap_or_default().to_string();
        self.objects.insert(uid, object.clone());
        self.notify(WatchEvent::Apply, &object);
        object
    }

    fn remove(&mut self, uid: &str) {
        if let Some(object) = self.objects.remove(uid) {
            self.notify(WatchEvent::Delete, &object);
        }
    }

    fn delete(&mut self, uid: &str, propagation: Option<PropagationPolicy>) {
        let Some(mut object) = self.objects.get(uid).cloned() else {
            return;
        };
        if object.is_being_deleted() {
            return;
        }
        let finalizer = match propagation {
            Some(PropagationPolicy::Orphan) => Some(FINALIZER_ORPHAN),
            Some(PropagationPolicy::Foreground) => Some(FINALIZER_DELETE_DEPENDENTS),
            _ => None,
        };
        if let Some(finalizer) = finalizer {
            object
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(finalizer.to_string());
        }
        if object.finalizers().is_empty() {
            self.remove(uid);
            return;
        }
        object.metadata.deletion_timestamp = Some(deletion_timestamp());
        self.store(object);
    }

    fn find(&self, mapping: &ResourceMapping, namespace: Option<&str>, name: &str) -> Option<ObjectMetadata> {
        self.objects
            .values()
            .find(|o| {
                matches_type(mapping, o)
                    && o.namespace().unwrap_or_default() == namespace.unwrap_or_default()
                    && o.name() == name
            })
            .cloned()
    }
}

fn matches_type(mapping: &ResourceMapping, object: &ObjectMetadata) -> bool {
    object.api_version == mapping.api_version() && object.kind == mapping.kind
}

fn deletion_timestamp() -> k8s_openapi::apimachinery::pkg::apis::meta::v1::Time {
    serde_json::from_value(serde_json::json!("2024-01-01T00:00:00Z")).unwrap()
}

fn conflict(what: &str) -> ClientError {
    ClientError::Conflict(format!("the object has been modified: {what}"))
}

/// Cluster with configmaps, secrets, deployments, replicasets and cluster roles
pub struct FakeCluster {
    resources: Vec<DiscoveredResource>,
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        let verbs = ["get", "list", "watch", "patch", "delete"];
        let resource = |group: &str, version: &str, plural: &str, kind: &str, namespaced: bool| DiscoveredResource {
            mapping: ResourceMapping {
                resource: GroupVersionResource::new(group, version, plural),
                kind: kind.to_string(),
                namespaced,
            },
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
            preferred: true,
        };
        Arc::new(Self {
            resources: vec![
                resource("", "v1", "configmaps", "ConfigMap", true),
                resource("", "v1", "secrets", "Secret", true),
                resource("apps", "v1", "deployments", "Deployment", true),
                resource("apps", "v1", "replicasets", "ReplicaSet", true),
                resource("rbac.authorization.k8s.io", "v1", "clusterroles", "ClusterRole", false),
            ],
            state: Mutex::new(State::default()),
        })
    }

    /// Create or replace an object, notifying watchers
    pub fn create(&self, object: ObjectMetadata) -> ObjectMetadata {
        self.state.lock().store(object)
    }

    /// Delete as a user would, with the given propagation
    pub fn delete(&self, uid: &str, propagation: PropagationPolicy) {
        self.state.lock().delete(uid, Some(propagation));
    }

    pub fn get(&self, uid: &str) -> Option<ObjectMetadata> {
        self.state.lock().objects.get(uid).cloned()
    }

    pub fn exists(&self, uid: &str) -> bool {
        self.state.lock().objects.contains_key(uid)
    }

    pub fn deletes(&self) -> Vec<DeleteCall> {
        self.state.lock().deletes.clone()
    }

    pub fn patch_count(&self) -> usize {
        self.state.lock().patches
    }

    /// Fail the next `times` reads of objects called `name` with `error`
    pub fn fail_gets(&self, name: &str, error: ClientError, times: usize) {
        self.state
            .lock()
            .get_failures
            .insert(name.to_string(), (error, times));
    }

    pub fn clear_failures(&self) {
        self.state.lock().get_failures.clear();
    }

    /// Reads of objects called `name`, failed ones included
    pub fn get_count(&self, name: &str) -> usize {
        self.state.lock().gets.get(name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MetadataClient for FakeCluster {
    async fn get(
        &self,
        mapping: &ResourceMapping,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<ObjectMetadata, ClientError> {
        let mut state = self.state.lock();
        *state.gets.entry(name.to_string()).or_default() += 1;
        if let Some((error, remaining)) = state.get_failures.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(error.clone());
            }
        }
        state.find(mapping, namespace, name).ok_or(ClientError::NotFound)
    }

    async fn patch(
        &self,
        mapping: &ResourceMapping,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<ObjectMetadata, ClientError> {
        let mut state = self.state.lock();
        let mut object = state.find(mapping, namespace, name).ok_or(ClientError::NotFound)?;
        let metadata = &patch["metadata"];

        if let Some(expected) = metadata["resourceVersion"].as_str() {
            if object.resource_version() != Some(expected) {
                return Err(conflict(name));
            }
        }
        if let Some(references) = metadata.get("ownerReferences") {
            let references: Vec<OwnerReference> = serde_json::from_value(references.clone())
                .map_err(|e| ClientError::Api {
                    code: 422,
                    message: e.to_string(),
                })?;
            object.metadata.owner_references = (!references.is_empty()).then_some(references);
        }
        if let Some(finalizers) = metadata.get("finalizers") {
            let finalizers: Vec<String> = serde_json::from_value(finalizers.clone())
                .map_err(|e| ClientError::Api {
                    code: 422,
                    message: e.to_string(),
                })?;
            object.metadata.finalizers = (!finalizers.is_empty()).then_some(finalizers);
        }
        state.patches += 1;

        if object.is_being_deleted() && object.finalizers().is_empty() {
            let uid = object.uid().unwrap_or_default().to_string();
            state.remove(&uid);
            return Ok(object);
        }
        Ok(state.store(object))
    }

    async fn delete(
        &self,
        mapping: &ResourceMapping,
        namespace: Option<&str>,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        let object = state.find(mapping, namespace, name).ok_or(ClientError::NotFound)?;
        if options.uid.is_some() && object.uid() != options.uid.as_deref() {
            return Err(conflict(name));
        }
        if options.resource_version.is_some() && object.resource_version() != options.resource_version.as_deref() {
            return Err(conflict(name));
        }
        state.deletes.push(DeleteCall {
            name: name.to_string(),
            uid: object.uid().map(str::to_string),
            propagation: options.propagation,
        });
        let uid = object.uid().unwrap_or_default().to_string();
        state.delete(&uid, options.propagation);
        Ok(())
    }

    fn watch(&self, mapping: &ResourceMapping) -> WatchStream {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock();
            let _ = tx.send(WatchEvent::Init);
            for object in state.objects.values().filter(|o| matches_type(mapping, o)) {
                let _ = tx.send(WatchEvent::InitApply(object.clone()));
            }
            let _ = tx.send(WatchEvent::InitDone);
            state.watchers.push((mapping.clone(), tx));
        }
        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (Ok(event), rx))
        })
        .boxed()
    }
}

#[async_trait]
impl DiscoveryClient for FakeCluster {
    async fn server_resources(&self) -> Result<ServerResources, ClientError> {
        Ok(ServerResources {
            resources: self.resources.clone(),
            failed: Default::default(),
        })
    }
}

/// Namespaced object metadata
pub fn object(api_version: &str, kind: &str, namespace: &str, name: &str, uid: &str) -> ObjectMetadata {
    ObjectMetadata {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: (!namespace.is_empty()).then(|| namespace.to_string()),
            uid: Some(uid.to_string()),
            ..Default::default()
        },
    }
}

pub fn config_map(name: &str, uid: &str) -> ObjectMetadata {
    object("v1", "ConfigMap", "default", name, uid)
}

/// Owner reference pointing at `owner`
pub fn reference_to(owner: &ObjectMetadata, block_owner_deletion: bool) -> OwnerReference {
    OwnerReference {
        api_version: owner.api_version.clone(),
        kind: owner.kind.clone(),
        name: owner.name().to_string(),
        uid: owner.uid().unwrap_or_default().to_string(),
        block_owner_deletion: block_owner_deletion.then_some(true),
        ..Default::default()
    }
}

pub fn with_owners(mut object: ObjectMetadata, owners: Vec<OwnerReference>) -> ObjectMetadata {
    object.metadata.owner_references = Some(owners);
    object
}

/// Object already being deleted and held by `finalizers`
pub fn terminating(mut object: ObjectMetadata, finalizers: &[&str]) -> ObjectMetadata {
    object.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
    object.metadata.deletion_timestamp = Some(deletion_timestamp());
    object
}

/// A warning event passed to the collector's recorder
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub object: ObjectReference,
    pub reason: String,
    pub message: String,
}

#[derive(Default)]
pub struct RecordedEvents(Mutex<Vec<RecordedEvent>>);

impl RecordedEvents {
    pub fn all(&self) -> Vec<RecordedEvent> {
        self.0.lock().clone()
    }
}

impl EventRecorder for RecordedEvents {
    fn warning(&self, object: &ObjectReference, reason: &str, message: &str) {
        self.0.lock().push(RecordedEvent {
            object: object.clone(),
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

pub fn test_options() -> CollectorOptions {
    CollectorOptions {
        initial_sync_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn partition_spec(
    id: PartitionId,
    cluster: &Arc<FakeCluster>,
    informers_started: watch::Receiver<bool>,
) -> PartitionSpec {
    PartitionSpec {
        id,
        client: cluster.clone(),
        mapper: Arc::new(DiscoveryResourceMapper::new(cluster.clone())),
        discovery: cluster.clone(),
        ignored_resources: HashSet::new(),
        informers_started,
        initial_sync_timeout: Duration::from_secs(5),
    }
}

/// A running collector; cancelled on drop
pub struct Harness {
    pub gc: Arc<GarbageCollector>,
    pub events: Arc<RecordedEvents>,
    pub ctx: CancellationToken,
    pub informers_started: watch::Receiver<bool>,
    _started: watch::Sender<bool>,
}

impl Harness {
    /// Collector with no partitions and no workers
    pub fn idle() -> Self {
        let (started, informers_started) = watch::channel(true);
        let events = Arc::new(RecordedEvents::default());
        Self {
            gc: Arc::new(GarbageCollector::with_recorder(test_options(), events.clone())),
            events,
            ctx: CancellationToken::new(),
            informers_started,
            _started: started,
        }
    }

    /// Register `partitions` and start two workers per queue
    pub async fn start(partitions: Vec<(PartitionId, Arc<FakeCluster>)>) -> Self {
        let harness = Self::idle();
        for (id, cluster) in partitions {
            harness.add(id, &cluster).await;
        }
        tokio::spawn(harness.gc.clone().run(harness.ctx.clone(), 2));
        harness
    }

    pub async fn add(&self, id: PartitionId, cluster: &Arc<FakeCluster>) {
        self.gc
            .add_partition(&self.ctx, partition_spec(id, cluster, self.informers_started.clone()))
            .await
            .unwrap();
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}

/// Poll `condition` every 20ms for up to five seconds
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    eventually_within(Duration::from_secs(5), condition).await
}

pub async fn eventually_within(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Wait until `future` resolves or panic after five seconds
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}
