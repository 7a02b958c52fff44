//! Seams between the collector and the clusters it manages
//!
//! Each partition supplies its own metadata client, resource mapper and
//! discovery client. The kube-rs implementations live in `crate::kube`;
//! tests plug in an in-memory cluster.

use super::error::{ClientError, Result};
use super::model::{ObjectMetadata, ObjectReference};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// API group and version, parsed from an `apiVersion` string
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct GroupVersion {
    pub group: String,
    pub version: String,
}

impl GroupVersion {
    /// Parse `group/version`, or a bare `version` for the core group
    pub fn parse(api_version: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self {
                group: group.to_string(),
                version: version.to_string(),
            },
            None => Self {
                group: String::new(),
                version: api_version.to_string(),
            },
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for GroupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.api_version())
    }
}

/// A resource type independent of version, used for the ignore list
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct GroupResource {
    #[serde(default)]
    pub group: String,
    pub resource: String,
}

impl GroupResource {
    pub fn new(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
        }
    }
}

impl fmt::Display for GroupResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            f.write_str(&self.resource)
        } else {
            write!(f, "{}.{}", self.resource, self.group)
        }
    }
}

/// A watchable resource endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GroupVersionResource {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    pub fn group_version(&self) -> GroupVersion {
        GroupVersion {
            group: self.group.clone(),
            version: self.version.clone(),
        }
    }

    pub fn group_resource(&self) -> GroupResource {
        GroupResource::new(self.group.clone(), self.resource.clone())
    }
}

impl fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}, Resource={}", self.group, self.version, self.resource)
    }
}

/// Everything needed to address objects of one kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceMapping {
    pub resource: GroupVersionResource,
    pub kind: String,
    pub namespaced: bool,
}

impl ResourceMapping {
    pub fn api_version(&self) -> String {
        self.resource.group_version().api_version()
    }
}

/// How the API server should treat dependents of a deleted object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationPolicy {
    Orphan,
    Background,
    Foreground,
}

impl fmt::Display for PropagationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Orphan => "Orphan",
            Self::Background => "Background",
            Self::Foreground => "Foreground",
        })
    }
}

/// Preconditions and propagation for a delete call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    pub propagation: Option<PropagationPolicy>,
}

/// Event from a metadata watch
///
/// Mirrors the watcher lifecycle: a relist is bracketed by `Init` and
/// `InitDone` with the current objects delivered as `InitApply` in between.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Init,
    InitApply(ObjectMetadata),
    InitDone,
    Apply(ObjectMetadata),
    Delete(ObjectMetadata),
}

pub type WatchStream = BoxStream<'static, std::result::Result<WatchEvent, ClientError>>;

/// Metadata-only access to objects in one partition
#[async_trait]
pub trait MetadataClient: Send + Sync {
    async fn get(
        &self,
        mapping: &ResourceMapping,
        namespace: Option<&str>,
        name: &str,
    ) -> std::result::Result<ObjectMetadata, ClientError>;

    /// Apply a JSON merge patch and return the updated metadata
    async fn patch(
        &self,
        mapping: &ResourceMapping,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> std::result::Result<ObjectMetadata, ClientError>;

    async fn delete(
        &self,
        mapping: &ResourceMapping,
        namespace: Option<&str>,
        name: &str,
        options: &DeleteOptions,
    ) -> std::result::Result<(), ClientError>;

    /// Watch every object of a resource across all namespaces
    ///
    /// The stream retries with its own backoff after an error and never ends
    /// on one.
    fn watch(&self, mapping: &ResourceMapping) -> WatchStream;
}

/// Resolves `(apiVersion, kind)` to a resource endpoint
#[async_trait]
pub trait ResourceMapper: Send + Sync {
    async fn mapping(&self, api_version: &str, kind: &str) -> Result<ResourceMapping>;

    /// Drop cached mappings so the next lookup sees new resource types
    fn reset(&self);
}

/// One resource type reported by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredResource {
    pub mapping: ResourceMapping,
    pub verbs: Vec<String>,
    /// True for the group's preferred version
    pub preferred: bool,
}

impl DiscoveredResource {
    pub fn supports(&self, verb: &str) -> bool {
        self.verbs.iter().any(|v| v == verb)
    }
}

/// Discovery results, possibly partial
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerResources {
    pub resources: Vec<DiscoveredResource>,
    /// Group versions that could not be listed, with the reason
    pub failed: BTreeMap<GroupVersion, String>,
}

/// Lists the resource types a cluster serves
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    async fn server_resources(&self) -> std::result::Result<ServerResources, ClientError>;
}

/// Sink for warnings attached to objects
pub trait EventRecorder: Send + Sync {
    fn warning(&self, object: &ObjectReference, reason: &str, message: &str);
}

/// Records events as log lines
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventRecorder;

impl EventRecorder for TracingEventRecorder {
    fn warning(&self, object: &ObjectReference, reason: &str, message: &str) {
        tracing::warn!(object = %object, reason, "{}", message);
    }
}
