//! Resource mapper backed by discovery

use super::client::{DiscoveryClient, GroupVersion, ResourceMapper, ResourceMapping};
use super::error::{GcError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

type MappingKey = (GroupVersion, String);

/// Caches every mapping discovery reports and reloads on `reset` or a miss
pub struct DiscoveryResourceMapper {
    discovery: Arc<dyn DiscoveryClient>,
    mappings: RwLock<Option<HashMap<MappingKey, ResourceMapping>>>,
}

impl DiscoveryResourceMapper {
    pub fn new(discovery: Arc<dyn DiscoveryClient>) -> Self {
        Self {
            discovery,
            mappings: RwLock::new(None),
        }
    }

    fn lookup(&self, key: &MappingKey) -> Option<Option<ResourceMapping>> {
        self.mappings
            .read()
            .as_ref()
            .map(|mappings| mappings.get(key).cloned())
    }

    async fn reload(&self) -> Result<()> {
        let resources = self
            .discovery
            .server_resources()
            .await
            .map_err(|e| GcError::Discovery(e.to_string()))?;

        let mut mappings = HashMap::new();
        for resource in resources.resources {
            // Subresources like "pods/status" share the parent's kind.
            if resource.mapping.resource.resource.contains('/') {
                continue;
            }
            let key = (
                resource.mapping.resource.group_version(),
                resource.mapping.kind.clone(),
            );
            mappings.entry(key).or_insert(resource.mapping);
        }
        debug!(count = mappings.len(), "Loaded resource mappings");
        *self.mappings.write() = Some(mappings);
        Ok(())
    }
}

#[async_trait]
impl ResourceMapper for DiscoveryResourceMapper {
    async fn mapping(&self, api_version: &str, kind: &str) -> Result<ResourceMapping> {
        let key = (GroupVersion::parse(api_version), kind.to_string());

        let fresh = match self.lookup(&key) {
            Some(Some(mapping)) => return Ok(mapping),
            Some(None) => false,
            None => {
                self.reload().await?;
                true
            }
        };

        // A miss on cached data may just be a type created since the last load.
        if !fresh {
            self.reload().await?;
        }

        self.lookup(&key)
            .flatten()
            .ok_or_else(|| GcError::RestMapping {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
            })
    }

    fn reset(&self) {
        *self.mappings.write() = None;
    }
}
