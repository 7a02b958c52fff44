//! Metadata client over kube-rs
//!
//! Every call goes through `Api<DynamicObject>` built from the resource
//! mapping, so any resource type discovery reports can be handled without
//! compiled-in types. Only metadata is ever requested.

use crate::gc::client::{DeleteOptions, MetadataClient, PropagationPolicy, ResourceMapping, WatchEvent, WatchStream};
use crate::gc::error::ClientError;
use crate::gc::model::ObjectMetadata;
use async_trait::async_trait;
use futures::StreamExt;
use kube::Client;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, Patch, PatchParams, Preconditions};
use kube::core::PartialObjectMeta;
use kube::runtime::{WatchStreamExt, metadata_watcher, watcher};

/// `MetadataClient` for one cluster
#[derive(Clone)]
pub struct KubeMetadataClient {
    client: Client,
}

impl KubeMetadataClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, mapping: &ResourceMapping, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = api_resource(mapping);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

fn api_resource(mapping: &ResourceMapping) -> ApiResource {
    ApiResource {
        group: mapping.resource.group.clone(),
        version: mapping.resource.version.clone(),
        api_version: mapping.api_version(),
        kind: mapping.kind.clone(),
        plural: mapping.resource.resource.clone(),
    }
}

fn to_metadata(mapping: &ResourceMapping, object: PartialObjectMeta<DynamicObject>) -> ObjectMetadata {
    let (api_version, kind) = match object.types {
        Some(types) if !types.kind.is_empty() => (types.api_version, types.kind),
        _ => (mapping.api_version(), mapping.kind.clone()),
    };
    ObjectMetadata {
        api_version,
        kind,
        metadata: object.metadata,
    }
}

fn propagation(policy: PropagationPolicy) -> kube::api::PropagationPolicy {
    match policy {
        PropagationPolicy::Orphan => kube::api::PropagationPolicy::Orphan,
        PropagationPolicy::Background => kube::api::PropagationPolicy::Background,
        PropagationPolicy::Foreground => kube::api::PropagationPolicy::Foreground,
    }
}

fn delete_params(options: &DeleteOptions) -> DeleteParams {
    let preconditions = (options.uid.is_some() || options.resource_version.is_some()).then(|| Preconditions {
        uid: options.uid.clone(),
        resource_version: options.resource_version.clone(),
    });
    DeleteParams {
        preconditions,
        propagation_policy: options.propagation.map(propagation),
        ..Default::default()
    }
}

#[async_trait]
impl MetadataClient for KubeMetadataClient {
    async fn get(
        &self,
        mapping: &ResourceMapping,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<ObjectMetadata, ClientError> {
        let object = self.api(mapping, namespace).get_metadata(name).await?;
        Ok(to_metadata(mapping, object))
    }

    async fn patch(
        &self,
        mapping: &ResourceMapping,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<ObjectMetadata, ClientError> {
        let object = self
            .api(mapping, namespace)
            .patch_metadata(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(to_metadata(mapping, object))
    }

    async fn delete(
        &self,
        mapping: &ResourceMapping,
        namespace: Option<&str>,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), ClientError> {
        self.api(mapping, namespace)
            .delete(name, &delete_params(options))
            .await?;
        Ok(())
    }

    fn watch(&self, mapping: &ResourceMapping) -> WatchStream {
        let api = self.api(mapping, None);
        let mapping = mapping.clone();
        metadata_watcher(api, watcher::Config::default())
            .default_backoff()
            .map(move |event| match event {
                Ok(watcher::Event::Init) => Ok(WatchEvent::Init),
                Ok(watcher::Event::InitApply(object)) => Ok(WatchEvent::InitApply(to_metadata(&mapping, object))),
                Ok(watcher::Event::InitDone) => Ok(WatchEvent::InitDone),
                Ok(watcher::Event::Apply(object)) => Ok(WatchEvent::Apply(to_metadata(&mapping, object))),
                Ok(watcher::Event::Delete(object)) => Ok(WatchEvent::Delete(to_metadata(&mapping, object))),
                Err(e) => Err(ClientError::Transport(e.to_string())),
            })
            .boxed()
    }
}
