//! Cache of owners confirmed absent
//!
//! Saves a lookup against the API when many dependents point at the same
//! missing owner. Entries are bounded in number and expire, so an owner that
//! is later created is eventually looked up again.

use super::model::ObjectReference;
use moka::sync::Cache;
use std::time::Duration;

/// Default number of absent owners remembered
pub const DEFAULT_CAPACITY: u64 = 500;

/// Default lifetime of an absent-owner entry
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Bounded, expiring set of owner identities known not to exist
#[derive(Clone)]
pub struct ReferenceCache {
    cache: Cache<ObjectReference, ()>,
}

impl ReferenceCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn add(&self, reference: ObjectReference) {
        self.cache.insert(reference, ());
    }

    pub fn has(&self, reference: &ObjectReference) -> bool {
        self.cache.contains_key(reference)
    }

    /// Approximate number of live entries
    pub fn len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReferenceCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl std::fmt::Debug for ReferenceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceCache")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::model::PartitionId;

    fn owner(partition: PartitionId, namespace: &str) -> ObjectReference {
        ObjectReference {
            partition,
            api_version: "v1".into(),
            kind: "ConfigMap".into(),
            name: "gone".into(),
            uid: "uid-1".into(),
            namespace: namespace.into(),
        }
    }

    #[test]
    fn test_namespace_is_part_of_the_key() {
        let cache = ReferenceCache::default();
        cache.add(owner(PartitionId::Root, "a"));

        assert!(cache.has(&owner(PartitionId::Root, "a")));
        assert!(!cache.has(&owner(PartitionId::Root, "b")));
        assert!(!cache.has(&owner(PartitionId::Root, "")));
    }

    #[test]
    fn test_partition_is_part_of_the_key() {
        let cache = ReferenceCache::default();
        cache.add(owner(PartitionId::project("alpha"), "a"));
        assert!(!cache.has(&owner(PartitionId::project("beta"), "a")));
    }

    #[test]
    fn test_entries_expire() {
        let cache = ReferenceCache::new(10, Duration::from_millis(20));
        cache.add(owner(PartitionId::Root, ""));
        assert!(cache.has(&owner(PartitionId::Root, "")));

        std::thread::sleep(Duration::from_millis(60));
        assert!(!cache.has(&owner(PartitionId::Root, "")));
    }

    #[test]
    fn test_capacity_is_bounded() {
        let cache = ReferenceCache::new(5, DEFAULT_TTL);
        for i in 0..50 {
            let mut reference = owner(PartitionId::Root, "");
            reference.uid = format!("uid-{i}");
            cache.add(reference);
        }
        assert!(cache.len() <= 5);
    }
}
