//! Event recorder publishing to each partition's API server

use crate::gc::client::EventRecorder;
use crate::gc::model::{ObjectReference, PartitionId};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::ObjectReference as KubeObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::{debug, warn};

/// Action attached to every published event
const EVENT_ACTION: &str = "GarbageCollect";

/// `EventRecorder` that posts Events next to the object they concern
///
/// Each partition registers its own client; warnings about objects of an
/// unregistered partition are only logged.
pub struct KubeEventRecorder {
    reporter: Reporter,
    recorders: DashMap<PartitionId, Recorder>,
}

impl KubeEventRecorder {
    pub fn new(controller: &str) -> Self {
        Self {
            reporter: Reporter {
                controller: controller.to_string(),
                instance: None,
            },
            recorders: DashMap::new(),
        }
    }

    /// Publish events for objects of `partition` through `client`
    pub fn register(&self, partition: PartitionId, client: Client) {
        self.recorders
            .insert(partition, Recorder::new(client, self.reporter.clone()));
    }
}

impl EventRecorder for KubeEventRecorder {
    fn warning(&self, object: &ObjectReference, reason: &str, message: &str) {
        warn!(object = %object, reason, "{}", message);

        let Some(recorder) = self
            .recorders
            .get(&object.partition)
            .map(|r| r.value().clone())
        else {
            debug!(partition = %object.partition, "No event recorder registered for partition");
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(object = %object, "No runtime to publish event on");
            return;
        };

        let event = warning_event(reason, message);
        let reference = object_reference(object);
        let partition = object.partition.clone();
        runtime.spawn(async move {
            if let Err(e) = recorder.publish(&event, &reference).await {
                warn!(%partition, reason = %event.reason, error = %e, "Failed to publish event");
            }
        });
    }
}

fn warning_event(reason: &str, message: &str) -> Event {
    Event {
        type_: EventType::Warning,
        reason: reason.to_string(),
        note: Some(message.to_string()),
        action: EVENT_ACTION.to_string(),
        secondary: None,
    }
}

fn object_reference(object: &ObjectReference) -> KubeObjectReference {
    KubeObjectReference {
        api_version: Some(object.api_version.clone()),
        kind: Some(object.kind.clone()),
        name: Some(object.name.clone()),
        namespace: (!object.namespace.is_empty()).then(|| object.namespace.clone()),
        uid: Some(object.uid.clone()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(namespace: &str) -> ObjectReference {
        ObjectReference {
            partition: PartitionId::project("project-a"),
            api_version: "apps/v1".into(),
            kind: "ReplicaSet".into(),
            name: "web-1".into(),
            uid: "rs-uid".into(),
            namespace: namespace.into(),
        }
    }

    #[test]
    fn test_object_reference() {
        let reference = object_reference(&identity("default"));
        assert_eq!(reference.api_version.as_deref(), Some("apps/v1"));
        assert_eq!(reference.kind.as_deref(), Some("ReplicaSet"));
        assert_eq!(reference.namespace.as_deref(), Some("default"));
        assert_eq!(reference.uid.as_deref(), Some("rs-uid"));

        assert_eq!(object_reference(&identity("")).namespace, None);
    }

    #[test]
    fn test_warning_event() {
        let event = warning_event("OwnerRefInvalidNamespace", "owner is elsewhere");
        assert!(matches!(event.type_, EventType::Warning));
        assert_eq!(event.reason, "OwnerRefInvalidNamespace");
        assert_eq!(event.note.as_deref(), Some("owner is elsewhere"));
        assert_eq!(event.action, EVENT_ACTION);
    }

    #[test]
    fn test_unregistered_partition_is_only_logged() {
        let recorder = KubeEventRecorder::new("projectgc");
        recorder.warning(&identity("default"), "OwnerRefInvalidNamespace", "message");
        assert!(recorder.recorders.is_empty());
    }
}
