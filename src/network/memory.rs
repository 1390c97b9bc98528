//! In-process object network for tests and demos.
//!
//! Behaves like the real network where the gateway can observe it: ids are
//! unique, epochs only grow, deletes leave tombstones, heads of tombstoned
//! objects fail with not-found. Failures can be injected per object.

use super::{
    NetworkError, NetworkResult, ObjectNetwork, PayloadSink, PayloadStream, PutRequest,
    SearchParams, check_range, ensure_container_name_safe, normalize_region,
};
use crate::{
    models::{
        bucket::BucketInfo,
        object::{ATTR_FILE_NAME, ByteRange, ContainerId, ObjectAddress, ObjectId, ObjectMeta},
    },
    services::context::RequestContext,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::StreamExt;
use parking_lot::RwLock;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone)]
struct StoredObject {
    meta: ObjectMeta,
    payload: Bytes,
    tombstoned: bool,
}

#[derive(Debug, Default)]
struct State {
    containers: HashMap<String, BucketInfo>,
    objects: HashMap<ObjectAddress, StoredObject>,
    last_epoch: u64,
    frozen_epoch: Option<u64>,
    failing_heads: HashSet<ObjectId>,
    failing_deletes: HashSet<ObjectId>,
    deny_all: bool,
}

#[derive(Debug, Default)]
struct Counters {
    search: AtomicUsize,
    head: AtomicUsize,
    delete: AtomicUsize,
}

/// In-memory network. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<RwLock<State>>,
    counters: Arc<Counters>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign every following write the same epoch, as concurrent writers
    /// confirmed in one consensus round would get.
    pub fn freeze_epoch(&self, epoch: Option<u64>) {
        self.state.write().frozen_epoch = epoch;
    }

    pub fn fail_head_for(&self, id: ObjectId) {
        self.state.write().failing_heads.insert(id);
    }

    pub fn fail_delete_for(&self, id: ObjectId) {
        self.state.write().failing_deletes.insert(id);
    }

    /// Reject every call the way a container ACL would.
    pub fn deny_access(&self, deny: bool) {
        self.state.write().deny_all = deny;
    }

    pub fn search_calls(&self) -> usize {
        self.counters.search.load(Ordering::SeqCst)
    }

    pub fn head_calls(&self) -> usize {
        self.counters.head.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.counters.delete.load(Ordering::SeqCst)
    }

    /// Ids of live objects whose file name is `name`, oldest first.
    pub fn live_ids(&self, container: ContainerId, name: &str) -> Vec<ObjectId> {
        let state = self.state.read();
        let mut live: Vec<&StoredObject> = state
            .objects
            .values()
            .filter(|o| {
                !o.tombstoned
                    && o.meta.address.container == container
                    && o.meta.attribute(ATTR_FILE_NAME) == Some(name)
            })
            .collect();
        live.sort_by_key(|o| (o.meta.creation_epoch, o.meta.address.object));
        live.iter().map(|o| o.meta.address.object).collect()
    }

    fn check_access(&self, op: &str) -> NetworkResult<()> {
        if self.state.read().deny_all {
            return Err(NetworkError::Status(format!(
                "access to operation {} is denied by basic ACL check",
                op
            )));
        }
        Ok(())
    }

    fn live_object(&self, address: &ObjectAddress) -> NetworkResult<StoredObject> {
        self.state
            .read()
            .objects
            .get(address)
            .filter(|o| !o.tombstoned)
            .cloned()
            .ok_or(NetworkError::NotFound(*address))
    }
}

#[async_trait]
impl ObjectNetwork for MemoryNetwork {
    async fn container(&self, _ctx: &RequestContext, name: &str) -> NetworkResult<BucketInfo> {
        self.state
            .read()
            .containers
            .get(name)
            .cloned()
            .ok_or_else(|| NetworkError::ContainerNotFound(name.to_string()))
    }

    async fn create_container(
        &self,
        _ctx: &RequestContext,
        name: &str,
        region: &str,
    ) -> NetworkResult<BucketInfo> {
        ensure_container_name_safe(name)?;
        let region = normalize_region(region)?;

        let mut state = self.state.write();
        if state.containers.contains_key(name) {
            return Err(NetworkError::ContainerAlreadyExists(name.to_string()));
        }
        let bucket = BucketInfo {
            name: name.to_string(),
            container: ContainerId::new(),
            owner: "memory".into(),
            region,
            created: Utc::now(),
        };
        state.containers.insert(name.to_string(), bucket.clone());
        Ok(bucket)
    }

    async fn search(
        &self,
        _ctx: &RequestContext,
        params: &SearchParams,
    ) -> NetworkResult<Vec<ObjectId>> {
        self.counters.search.fetch_add(1, Ordering::SeqCst);
        self.check_access("SEARCH")?;

        let state = self.state.read();
        let mut found: Vec<&StoredObject> = state
            .objects
            .values()
            .filter(|o| !o.tombstoned && o.meta.address.container == params.container)
            .filter(|o| {
                params
                    .filters
                    .iter()
                    .all(|(k, v)| o.meta.attribute(k) == Some(v.as_str()))
            })
            .filter(|o| {
                params.prefix.is_empty()
                    || o.meta
                        .attribute(ATTR_FILE_NAME)
                        .is_some_and(|name| name.starts_with(&params.prefix))
            })
            .collect();
        found.sort_by_key(|o| o.meta.address.object);
        Ok(found.iter().map(|o| o.meta.address.object).collect())
    }

    async fn head(
        &self,
        _ctx: &RequestContext,
        address: &ObjectAddress,
    ) -> NetworkResult<ObjectMeta> {
        self.counters.head.fetch_add(1, Ordering::SeqCst);
        self.check_access("HEAD")?;
        if self.state.read().failing_heads.contains(&address.object) {
            return Err(NetworkError::Status(format!(
                "head of {} failed: node unavailable",
                address
            )));
        }
        Ok(self.live_object(address)?.meta)
    }

    async fn get(
        &self,
        _ctx: &RequestContext,
        address: &ObjectAddress,
        range: Option<ByteRange>,
        sink: PayloadSink<'_>,
    ) -> NetworkResult<ObjectMeta> {
        self.check_access("GET")?;
        let stored = self.live_object(address)?;
        let payload = match range {
            Some(range) => {
                let range = check_range(range, stored.payload.len() as u64)?;
                stored
                    .payload
                    .slice(range.start as usize..=range.end as usize)
            }
            None => stored.payload.clone(),
        };
        sink.write_all(&payload).await?;
        sink.flush().await?;
        Ok(stored.meta)
    }

    async fn put(
        &self,
        ctx: &RequestContext,
        request: PutRequest,
        mut payload: PayloadStream,
    ) -> NetworkResult<ObjectId> {
        self.check_access("PUT")?;

        let mut buf = BytesMut::new();
        while let Some(chunk) = payload.next().await {
            buf.extend_from_slice(&chunk?);
        }
        let payload = buf.freeze();

        let mut state = self.state.write();
        if !state
            .containers
            .values()
            .any(|b| b.container == request.container)
        {
            return Err(NetworkError::ContainerNotFound(
                request.container.to_string(),
            ));
        }
        let epoch = match state.frozen_epoch {
            Some(epoch) => epoch,
            None => {
                state.last_epoch += 1;
                state.last_epoch
            }
        };

        let id = ObjectId::new();
        let address = ObjectAddress::new(request.container, id);
        let meta = ObjectMeta {
            address,
            owner: request
                .owner
                .or_else(|| ctx.call_options().bearer_token.clone()),
            payload_size: payload.len() as u64,
            creation_epoch: epoch,
            payload_checksum: format!("{:x}", md5::compute(&payload)),
            attributes: request.attributes,
        };
        state.objects.insert(
            address,
            StoredObject {
                meta,
                payload,
                tombstoned: false,
            },
        );
        Ok(id)
    }

    async fn delete(&self, _ctx: &RequestContext, address: &ObjectAddress) -> NetworkResult<()> {
        self.counters.delete.fetch_add(1, Ordering::SeqCst);
        self.check_access("DELETE")?;

        let mut state = self.state.write();
        if state.failing_deletes.contains(&address.object) {
            return Err(NetworkError::Status(format!(
                "delete of {} failed: node unavailable",
                address
            )));
        }
        match state.objects.get_mut(address) {
            Some(obj) if !obj.tombstoned => {
                obj.tombstoned = true;
                Ok(())
            }
            _ => Err(NetworkError::NotFound(*address)),
        }
    }

    async fn health(&self, _ctx: &RequestContext) -> NetworkResult<()> {
        Ok(())
    }
}
