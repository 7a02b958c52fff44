//! Per-resource metadata watches feeding a graph builder
//!
//! A monitor keeps its own view of the objects it has seen so that watch
//! events can be turned into add, update (with the previous version) and
//! delete events for the graph.

use super::client::{MetadataClient, ResourceMapping, WatchEvent};
use super::model::{ObjectAccessor, ObjectMetadata};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Kind of change observed for an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Add,
    Update,
    Delete,
}

/// Change delivered to the graph builder
#[derive(Debug, Clone)]
pub struct GraphEvent {
    pub event_type: EventType,
    pub object: ObjectMetadata,
    /// Previous version for updates
    pub old_object: Option<ObjectMetadata>,
    /// Set for delete events synthesized by workers, not seen on a watch
    pub virtual_event: bool,
}

impl GraphEvent {
    pub fn add(object: ObjectMetadata) -> Self {
        Self {
            event_type: EventType::Add,
            object,
            old_object: None,
            virtual_event: false,
        }
    }

    pub fn update(old: ObjectMetadata, new: ObjectMetadata) -> Self {
        Self {
            event_type: EventType::Update,
            object: new,
            old_object: Some(old),
            virtual_event: false,
        }
    }

    pub fn delete(object: ObjectMetadata) -> Self {
        Self {
            event_type: EventType::Delete,
            object,
            old_object: None,
            virtual_event: false,
        }
    }

    pub fn virtual_delete(object: ObjectMetadata) -> Self {
        Self {
            virtual_event: true,
            ..Self::delete(object)
        }
    }
}

/// Watch over one resource type
pub struct Monitor {
    mapping: ResourceMapping,
    cancel: CancellationToken,
    synced: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Monitor {
    /// Create a stopped monitor whose lifetime is bounded by `parent`
    pub fn new(mapping: ResourceMapping, parent: &CancellationToken) -> Self {
        Self {
            mapping,
            cancel: parent.child_token(),
            synced: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.handle.is_some()
    }

    /// True once the first full listing has been delivered
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Spawn the watch; events flow once `informers_started` turns true
    pub fn start(
        &mut self,
        client: Arc<dyn MetadataClient>,
        events: mpsc::UnboundedSender<GraphEvent>,
        informers_started: watch::Receiver<bool>,
    ) {
        if self.handle.is_some() {
            return;
        }
        let task = MonitorTask {
            mapping: self.mapping.clone(),
            client,
            events,
            synced: self.synced.clone(),
            cancel: self.cancel.clone(),
        };
        self.handle = Some(tokio::spawn(task.run(informers_started)));
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct MonitorTask {
    mapping: ResourceMapping,
    client: Arc<dyn MetadataClient>,
    events: mpsc::UnboundedSender<GraphEvent>,
    synced: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl MonitorTask {
    async fn run(self, mut informers_started: watch::Receiver<bool>) {
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            started = informers_started.wait_for(|started| *started) => {
                if started.is_err() {
                    debug!(resource = %self.mapping.resource, "Informer start signal dropped");
                    return;
                }
            }
        }

        debug!(resource = %self.mapping.resource, "Starting monitor");
        let mut stream = self.client.watch(&self.mapping);
        let mut known: HashMap<String, ObjectMetadata> = HashMap::new();
        let mut relisted: Option<HashSet<String>> = None;
        let mut error_count = 0u32;

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = stream.next() => event,
            };
            let Some(event) = event else {
                debug!(resource = %self.mapping.resource, "Watch stream ended");
                break;
            };

            match event {
                Ok(WatchEvent::Init) => {
                    error_count = 0;
                    relisted = Some(HashSet::new());
                }
                Ok(WatchEvent::InitApply(object)) => {
                    error_count = 0;
                    if let (Some(seen), Some(uid)) = (relisted.as_mut(), object.uid()) {
                        seen.insert(uid.to_string());
                    }
                    self.apply(&mut known, object);
                }
                Ok(WatchEvent::InitDone) => {
                    error_count = 0;
                    if let Some(seen) = relisted.take() {
                        // Objects that vanished while the watch was down.
                        let gone: Vec<String> =
                            known.keys().filter(|uid| !seen.contains(*uid)).cloned().collect();
                        for uid in gone {
                            if let Some(object) = known.remove(&uid) {
                                self.send(GraphEvent::delete(object));
                            }
                        }
                    }
                    self.synced.store(true, Ordering::Release);
                }
                Ok(WatchEvent::Apply(object)) => {
                    error_count = 0;
                    self.apply(&mut known, object);
                }
                Ok(WatchEvent::Delete(object)) => {
                    error_count = 0;
                    let object = self.typed(object);
                    if let Some(uid) = object.uid() {
                        known.remove(uid);
                    }
                    self.send(GraphEvent::delete(object));
                }
                Err(e) => {
                    error_count += 1;
                    // Only log errors occasionally to avoid spam
                    if error_count == 1 || error_count.is_multiple_of(10) {
                        warn!(
                            resource = %self.mapping.resource,
                            error = %e,
                            error_count,
                            "Monitor watch error"
                        );
                    }
                }
            }
        }
    }

    fn apply(&self, known: &mut HashMap<String, ObjectMetadata>, object: ObjectMetadata) {
        let object = self.typed(object);
        let Some(uid) = object.uid().map(str::to_string) else {
            return;
        };
        match known.insert(uid, object.clone()) {
            Some(old) if old == object => {}
            Some(old) => self.send(GraphEvent::update(old, object)),
            None => self.send(GraphEvent::add(object)),
        }
    }

    // Metadata watches do not always carry type information.
    fn typed(&self, mut object: ObjectMetadata) -> ObjectMetadata {
        if object.api_version.is_empty() {
            object.api_version = self.mapping.api_version();
        }
        if object.kind.is_empty() {
            object.kind = self.mapping.kind.clone();
        }
        object
    }

    fn send(&self, event: GraphEvent) {
        if self.events.send(event).is_err() {
            debug!(resource = %self.mapping.resource, "Graph builder is gone, dropping event");
        }
    }
}
