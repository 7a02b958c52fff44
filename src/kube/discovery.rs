//! Discovery client over kube-rs
//!
//! Walks the core API and every API group version. A group version that
//! fails to list is reported in `ServerResources::failed` while the rest of
//! the results are still returned.

use crate::gc::client::{
    DiscoveredResource, DiscoveryClient, GroupVersion, GroupVersionResource, ResourceMapping,
    ServerResources,
};
use crate::gc::error::ClientError;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use kube::Client;
use tracing::debug;

#[derive(Clone)]
pub struct KubeDiscoveryClient {
    client: Client,
}

impl KubeDiscoveryClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn collect_resources(
    list: APIResourceList,
    group_version: &GroupVersion,
    preferred: bool,
    out: &mut Vec<DiscoveredResource>,
) {
    for resource in list.resources {
        out.push(DiscoveredResource {
            mapping: ResourceMapping {
                resource: GroupVersionResource::new(
                    resource.group.unwrap_or_else(|| group_version.group.clone()),
                    resource.version.unwrap_or_else(|| group_version.version.clone()),
                    resource.name,
                ),
                kind: resource.kind,
                namespaced: resource.namespaced,
            },
            verbs: resource.verbs,
            preferred,
        });
    }
}

#[async_trait]
impl DiscoveryClient for KubeDiscoveryClient {
    async fn server_resources(&self) -> Result<ServerResources, ClientError> {
        let mut result = ServerResources::default();

        let core = self.client.list_core_api_versions().await?;
        for (i, version) in core.versions.iter().enumerate() {
            let group_version = GroupVersion::parse(version);
            match self.client.list_core_api_resources(version).await {
                Ok(list) => collect_resources(list, &group_version, i == 0, &mut result.resources),
                Err(e) => {
                    result.failed.insert(group_version, e.to_string());
                }
            }
        }

        let groups = self.client.list_api_groups().await?;
        for group in groups.groups {
            let preferred = group
                .preferred_version
                .as_ref()
                .or_else(|| group.versions.first())
                .map(|v| v.group_version.clone());
            for version in &group.versions {
                let group_version = GroupVersion::parse(&version.group_version);
                let is_preferred = preferred.as_deref() == Some(version.group_version.as_str());
                match self.client.list_api_group_resources(&version.group_version).await {
                    Ok(list) => collect_resources(list, &group_version, is_preferred, &mut result.resources),
                    Err(e) => {
                        result.failed.insert(group_version, e.to_string());
                    }
                }
            }
        }

        debug!(
            resources = result.resources.len(),
            failed = result.failed.len(),
            "Discovered server resources"
        );
        Ok(result)
    }
}
