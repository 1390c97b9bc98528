//! Metadata caches and their coordination.
//!
//! Three caches sit in front of the network:
//! - objects: address → object header, written on every head and put
//! - names: `bucket/key` → address of the last known current version
//! - lists: listing query → id universe or resolved version list
//!
//! Entries are advisory. A miss or a failed insert only costs a network round
//! trip, so failures are logged and never surfaced.

use crate::models::object::{ContainerId, ObjectAddress, ObjectId, ObjectInfo, ObjectMeta};
use crate::services::versions::ObjectVersionInfo;
use lru::LruCache;
use parking_lot::Mutex;
use std::{hash::Hash, num::NonZeroUsize, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache is disabled")]
    Disabled,
}

pub type CacheResult<T> = Result<T, CacheError>;

pub trait ObjectsCache: Send + Sync {
    fn get(&self, address: &ObjectAddress) -> Option<ObjectMeta>;
    fn put(&self, meta: ObjectMeta) -> CacheResult<()>;
    fn delete(&self, address: &ObjectAddress);
}

pub trait NamesCache: Send + Sync {
    fn get(&self, nice_name: &str) -> Option<ObjectAddress>;
    fn put(&self, nice_name: String, address: ObjectAddress) -> CacheResult<()>;
    fn delete(&self, nice_name: &str);
}

pub trait ListsCache: Send + Sync {
    fn get(&self, key: &ListCacheKey) -> Option<ListCacheValue>;
    fn put(&self, key: ListCacheKey, value: ListCacheValue) -> CacheResult<()>;
    /// Drop every entry of `container` whose prefix is a prefix of `name`.
    fn clean_entries_containing_object(&self, container: ContainerId, name: &str);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ListMethod {
    Versions,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListCacheKey {
    pub container: ContainerId,
    pub prefix: String,
    pub method: Option<ListMethod>,
    pub delimiter: String,
}

impl ListCacheKey {
    /// Key of the id universe under `prefix`, shared by V1 and V2 listings.
    pub fn ids(container: ContainerId, prefix: &str) -> Self {
        Self {
            container,
            prefix: prefix.to_string(),
            method: None,
            delimiter: String::new(),
        }
    }

    pub fn versions(container: ContainerId, prefix: &str, delimiter: &str) -> Self {
        Self {
            container,
            prefix: prefix.to_string(),
            method: Some(ListMethod::Versions),
            delimiter: delimiter.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListCacheValue {
    Ids(Vec<ObjectId>),
    Versions(Vec<ObjectVersionInfo>),
}

/// Capacity and entry lifetime of an in-memory cache. A capacity of zero
/// disables it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub capacity: usize,
    pub lifetime: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            lifetime: Duration::from_secs(60),
        }
    }
}

/// LRU map whose entries also expire after a fixed lifetime.
pub struct TtlCache<K: Hash + Eq, V> {
    entries: Option<Mutex<LruCache<K, (Instant, V)>>>,
    lifetime: Duration,
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: NonZeroUsize::new(config.capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            lifetime: config.lifetime,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.as_ref()?.lock();
        let expired = match entries.get(key) {
            None => return None,
            Some((stored, _)) => stored.elapsed() >= self.lifetime,
        };
        if expired {
            entries.pop(key);
            return None;
        }
        entries.get(key).map(|(_, value)| value.clone())
    }

    pub fn put(&self, key: K, value: V) -> CacheResult<()> {
        let entries = self.entries.as_ref().ok_or(CacheError::Disabled)?;
        entries.lock().put(key, (Instant::now(), value));
        Ok(())
    }

    pub fn delete(&self, key: &K) {
        if let Some(entries) = self.entries.as_ref() {
            entries.lock().pop(key);
        }
    }

    /// Remove every entry whose key matches `predicate`.
    pub fn retain_keys(&self, predicate: impl Fn(&K) -> bool)
    where
        K: Clone,
    {
        let Some(entries) = self.entries.as_ref() else {
            return;
        };
        let mut entries = entries.lock();
        let doomed: Vec<K> = entries
            .iter()
            .filter(|(key, _)| !predicate(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            entries.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |entries| entries.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectsCache for TtlCache<ObjectAddress, ObjectMeta> {
    fn get(&self, address: &ObjectAddress) -> Option<ObjectMeta> {
        TtlCache::get(self, address)
    }

    fn put(&self, meta: ObjectMeta) -> CacheResult<()> {
        TtlCache::put(self, meta.address, meta)
    }

    fn delete(&self, address: &ObjectAddress) {
        TtlCache::delete(self, address)
    }
}

impl NamesCache for TtlCache<String, ObjectAddress> {
    fn get(&self, nice_name: &str) -> Option<ObjectAddress> {
        TtlCache::get(self, &nice_name.to_string())
    }

    fn put(&self, nice_name: String, address: ObjectAddress) -> CacheResult<()> {
        TtlCache::put(self, nice_name, address)
    }

    fn delete(&self, nice_name: &str) {
        TtlCache::delete(self, &nice_name.to_string())
    }
}

impl ListsCache for TtlCache<ListCacheKey, ListCacheValue> {
    fn get(&self, key: &ListCacheKey) -> Option<ListCacheValue> {
        TtlCache::get(self, key)
    }

    fn put(&self, key: ListCacheKey, value: ListCacheValue) -> CacheResult<()> {
        TtlCache::put(self, key, value)
    }

    fn clean_entries_containing_object(&self, container: ContainerId, name: &str) {
        self.retain_keys(|key| !(key.container == container && name.starts_with(&key.prefix)));
    }
}

/// The three caches together with the rules for keeping them consistent
/// with writes and deletes.
#[derive(Clone)]
pub struct MetadataCaches {
    objects: Arc<dyn ObjectsCache>,
    names: Arc<dyn NamesCache>,
    lists: Arc<dyn ListsCache>,
}

impl MetadataCaches {
    pub fn new(
        objects: Arc<dyn ObjectsCache>,
        names: Arc<dyn NamesCache>,
        lists: Arc<dyn ListsCache>,
    ) -> Self {
        Self {
            objects,
            names,
            lists,
        }
    }

    pub fn in_memory(config: CacheConfig) -> Self {
        Self::new(
            Arc::new(TtlCache::<ObjectAddress, ObjectMeta>::new(config)),
            Arc::new(TtlCache::<String, ObjectAddress>::new(config)),
            Arc::new(TtlCache::<ListCacheKey, ListCacheValue>::new(config)),
        )
    }

    pub fn object(&self, address: &ObjectAddress) -> Option<ObjectMeta> {
        self.objects.get(address)
    }

    pub fn put_object(&self, meta: &ObjectMeta) {
        if let Err(err) = self.objects.put(meta.clone()) {
            debug!(address = %meta.address, error = %err, "couldn't put meta to objects cache");
        }
    }

    pub fn forget_object(&self, address: &ObjectAddress) {
        self.objects.delete(address);
    }

    pub fn name(&self, bucket: &str, key: &str) -> Option<ObjectAddress> {
        self.names.get(&format!("{}/{}", bucket, key))
    }

    /// Point the name cache at `info` as the current version of its key.
    pub fn put_name(&self, info: &ObjectInfo) {
        if let Err(err) = self.names.put(info.nice_name(), info.address()) {
            debug!(name = %info.nice_name(), error = %err, "couldn't put obj address to names cache");
        }
    }

    pub fn forget_name(&self, bucket: &str, key: &str) {
        self.names.delete(&format!("{}/{}", bucket, key));
    }

    pub fn list_ids(&self, container: ContainerId, prefix: &str) -> Option<Vec<ObjectId>> {
        match self.lists.get(&ListCacheKey::ids(container, prefix)) {
            Some(ListCacheValue::Ids(ids)) => Some(ids),
            _ => None,
        }
    }

    pub fn put_list_ids(&self, container: ContainerId, prefix: &str, ids: Vec<ObjectId>) {
        if let Err(err) = self
            .lists
            .put(ListCacheKey::ids(container, prefix), ListCacheValue::Ids(ids))
        {
            debug!(%container, prefix, error = %err, "couldn't cache list of objects");
        }
    }

    pub fn list_versions(
        &self,
        container: ContainerId,
        prefix: &str,
        delimiter: &str,
    ) -> Option<Vec<ObjectVersionInfo>> {
        match self
            .lists
            .get(&ListCacheKey::versions(container, prefix, delimiter))
        {
            Some(ListCacheValue::Versions(versions)) => Some(versions),
            _ => None,
        }
    }

    pub fn put_list_versions(
        &self,
        container: ContainerId,
        prefix: &str,
        delimiter: &str,
        versions: Vec<ObjectVersionInfo>,
    ) {
        if let Err(err) = self.lists.put(
            ListCacheKey::versions(container, prefix, delimiter),
            ListCacheValue::Versions(versions),
        ) {
            debug!(%container, prefix, error = %err, "couldn't cache list of versions");
        }
    }

    /// Invalidate every cached listing that could contain `name`.
    pub fn clean_lists_containing(&self, container: ContainerId, name: &str) {
        self.lists.clean_entries_containing_object(container, name);
    }
}
