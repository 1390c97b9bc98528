//! Logical object operations on top of the append-only network.
//!
//! A PUT never overwrites anything: it writes a new object whose version
//! headers fold everything the writer saw about the key. A DELETE is either a
//! new delete-marker object or a deletion record followed by a tombstone of
//! the targeted version.

use crate::{
    models::{
        bucket::{BucketInfo, BucketSettings},
        object::{
            ATTR_CONTENT_TYPE, ATTR_FILE_NAME, ATTR_TIMESTAMP, ByteRange, ContainerId,
            ObjectAddress, ObjectId, ObjectInfo, ObjectMeta, is_system_header,
        },
    },
    network::{NetworkError, ObjectNetwork, PayloadSink, PayloadStream, PutRequest, SearchParams},
    services::{
        cache::MetadataCaches,
        context::RequestContext,
        detector::{ContentDetector, sniff_payload},
        error::{LayerError, LayerResult},
        settings::{SettingsError, SettingsStore},
        versions::{
            DEL_MARK_FULL_OBJECT, ObjectVersions, UNVERSIONED_VERSION_ID,
            VERSIONS_DELETE_MARK_ATTR, update_version_headers,
        },
    },
};
use chrono::Utc;
use futures::{StreamExt, TryStreamExt, stream};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, info, warn};

/// Number of object heads in flight while resolving a key or a listing.
pub(super) const HEAD_CONCURRENCY: usize = 16;
const MAX_OBJECT_KEY_LEN: usize = 1024;

pub struct PutObjectParams {
    pub bucket: String,
    pub key: String,
    /// User metadata plus an optional `Content-Type`. Reserved `S3-*`
    /// headers are dropped.
    pub headers: BTreeMap<String, String>,
    pub payload: PayloadStream,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeadObjectParams {
    pub bucket: String,
    pub key: String,
    /// `None` for the current version, `null` for the unversioned one.
    pub version_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteObjectParams {
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteObjectResult {
    pub version_id: String,
    /// True when a delete marker was written rather than a version removed.
    pub delete_marker: bool,
}

pub struct Gateway {
    pub(super) network: Arc<dyn ObjectNetwork>,
    pub(super) settings: Arc<dyn SettingsStore>,
    pub(super) caches: MetadataCaches,
    detector: Arc<dyn ContentDetector>,
}

impl Gateway {
    pub fn new(
        network: Arc<dyn ObjectNetwork>,
        settings: Arc<dyn SettingsStore>,
        caches: MetadataCaches,
        detector: Arc<dyn ContentDetector>,
    ) -> Self {
        Self {
            network,
            settings,
            caches,
            detector,
        }
    }

    pub async fn create_bucket(
        &self,
        ctx: &RequestContext,
        name: &str,
        region: &str,
    ) -> LayerResult<BucketInfo> {
        let bkt = ctx
            .run(self.network.create_container(ctx, name, region))
            .await?;
        ctx.run(
            self.settings
                .put_settings(ctx, bkt.container, BucketSettings::default()),
        )
        .await?;
        info!(bucket = %bkt.name, container = %bkt.container, "bucket created");
        Ok(bkt)
    }

    pub(super) async fn bucket_info(
        &self,
        ctx: &RequestContext,
        name: &str,
    ) -> LayerResult<BucketInfo> {
        ctx.run(async {
            self.network
                .container(ctx, name)
                .await
                .map_err(|err| match err {
                    NetworkError::InvalidContainerName { .. } => {
                        LayerError::NoSuchBucket(name.to_string())
                    }
                    err if err.is_not_found() => LayerError::NoSuchBucket(name.to_string()),
                    err => err.into(),
                })
        })
        .await
    }

    pub async fn get_bucket_versioning(
        &self,
        ctx: &RequestContext,
        bucket: &str,
    ) -> LayerResult<BucketSettings> {
        let bkt = self.bucket_info(ctx, bucket).await?;
        self.bucket_settings(ctx, bkt.container).await
    }

    pub async fn put_bucket_versioning(
        &self,
        ctx: &RequestContext,
        bucket: &str,
        settings: BucketSettings,
    ) -> LayerResult<BucketSettings> {
        let bkt = self.bucket_info(ctx, bucket).await?;
        ctx.run(self.settings.put_settings(ctx, bkt.container, settings))
            .await?;
        info!(
            bucket = %bkt.name,
            versioning_enabled = settings.versioning_enabled,
            "bucket versioning updated"
        );
        Ok(settings)
    }

    /// Settings of a bucket that never configured versioning are the
    /// defaults.
    async fn bucket_settings(
        &self,
        ctx: &RequestContext,
        container: ContainerId,
    ) -> LayerResult<BucketSettings> {
        match ctx.run(self.settings.get_settings(ctx, container)).await {
            Ok(settings) => Ok(settings),
            Err(LayerError::Settings(SettingsError::NodeNotFound(_))) => {
                Ok(BucketSettings::default())
            }
            Err(err) => Err(err),
        }
    }

    pub(super) async fn is_versioning_enabled(
        &self,
        ctx: &RequestContext,
        bkt: &BucketInfo,
    ) -> bool {
        match self.bucket_settings(ctx, bkt.container).await {
            Ok(settings) => settings.versioning_enabled,
            Err(err) => {
                warn!(bucket = %bkt.name, error = %err, "couldn't get versioning settings object");
                false
            }
        }
    }

    pub async fn put_object(
        &self,
        ctx: &RequestContext,
        params: PutObjectParams,
    ) -> LayerResult<ObjectInfo> {
        ensure_key_safe(&params.key)?;
        let bkt = self.bucket_info(ctx, &params.bucket).await?;
        let headers = params
            .headers
            .into_iter()
            .filter(|(key, _)| !is_system_header(key))
            .collect();
        self.write_version(ctx, &bkt, &params.key, headers, params.payload)
            .await
    }

    /// Write one new version of `key`, merging the version headers of
    /// everything currently known about it.
    async fn write_version(
        &self,
        ctx: &RequestContext,
        bkt: &BucketInfo,
        key: &str,
        mut headers: BTreeMap<String, String>,
        payload: PayloadStream,
    ) -> LayerResult<ObjectInfo> {
        let mut versions = match self.head_versions(ctx, bkt, key).await {
            Ok(versions) => versions,
            Err(LayerError::NoSuchKey) => ObjectVersions::new(key),
            Err(err) => return Err(err),
        };
        let versioning_enabled = self.is_versioning_enabled(ctx, bkt).await;
        let superseded = update_version_headers(&mut headers, &mut versions, versioning_enabled);

        let payload = if headers.contains_key(ATTR_CONTENT_TYPE) {
            payload
        } else {
            let (content_type, payload) = sniff_payload(self.detector.as_ref(), payload)
                .await
                .map_err(LayerError::Payload)?;
            if let Some(content_type) = content_type {
                headers.insert(ATTR_CONTENT_TYPE.to_string(), content_type);
            }
            payload
        };

        headers.insert(ATTR_FILE_NAME.to_string(), key.to_string());
        headers.insert(ATTR_TIMESTAMP.to_string(), Utc::now().timestamp().to_string());

        let request = PutRequest {
            container: bkt.container,
            owner: Some(bkt.owner.clone()),
            attributes: headers,
        };
        let id = ctx.run(self.network.put(ctx, request, payload)).await?;
        let address = ObjectAddress::new(bkt.container, id);

        let meta = ctx.run(self.network.head(ctx, &address)).await?;
        self.caches.put_object(&meta);
        let info = ObjectInfo::from_meta(&bkt.name, &meta).ok_or_else(|| {
            LayerError::Network(NetworkError::Status(format!(
                "stored object {} lost its file name",
                address
            )))
        })?;

        if info.delete_mark().is_some() {
            self.caches.forget_name(&bkt.name, key);
        } else {
            self.caches.put_name(&info);
        }
        self.caches.clean_lists_containing(bkt.container, key);

        debug!(
            bucket = %bkt.name,
            key,
            version = %info.id,
            superseded = superseded.len(),
            "object version stored"
        );

        for old in superseded {
            let address = ObjectAddress::new(bkt.container, old);
            if let Err(err) = self.object_delete(ctx, &address).await {
                warn!(%address, error = %err, "couldn't delete superseded object");
                continue;
            }
            if !versioning_enabled {
                if let Err(err) = ctx
                    .run(self.settings.delete_object_tagging(ctx, &address))
                    .await
                {
                    warn!(%address, error = %err, "couldn't delete object tagging");
                }
            }
        }

        Ok(info)
    }

    pub async fn head_object(
        &self,
        ctx: &RequestContext,
        params: &HeadObjectParams,
    ) -> LayerResult<ObjectInfo> {
        let bkt = self.bucket_info(ctx, &params.bucket).await?;
        match params.version_id.as_deref() {
            None | Some("") => {
                self.head_last_version_if_not_deleted(ctx, &bkt, &params.key)
                    .await
            }
            Some(version) => self.head_version(ctx, &bkt, &params.key, version).await,
        }
    }

    /// Resolve the object and stream its payload into `sink`.
    pub async fn get_object(
        &self,
        ctx: &RequestContext,
        params: &HeadObjectParams,
        range: Option<ByteRange>,
        sink: PayloadSink<'_>,
    ) -> LayerResult<ObjectInfo> {
        let info = self.head_object(ctx, params).await?;
        self.read_payload(ctx, &info, range, sink).await?;
        Ok(info)
    }

    /// Stream the payload of an already resolved version.
    pub async fn read_payload(
        &self,
        ctx: &RequestContext,
        info: &ObjectInfo,
        range: Option<ByteRange>,
        sink: PayloadSink<'_>,
    ) -> LayerResult<ObjectMeta> {
        let address = info.address();
        ctx.run(async {
            self.network
                .get(ctx, &address, range, sink)
                .await
                .map_err(|err| match err {
                    err @ NetworkError::InvalidRange { .. } => err.into(),
                    err if err.is_not_found() => LayerError::NoSuchKey,
                    err => err.into(),
                })
        })
        .await
    }

    async fn head_last_version_if_not_deleted(
        &self,
        ctx: &RequestContext,
        bkt: &BucketInfo,
        key: &str,
    ) -> LayerResult<ObjectInfo> {
        if let Some(address) = self.caches.name(&bkt.name, key) {
            if let Some(info) = self
                .caches
                .object(&address)
                .and_then(|meta| ObjectInfo::from_meta(&bkt.name, &meta))
                .filter(|info| info.name == key)
            {
                return Ok(info);
            }
        }

        let mut versions = self.head_versions(ctx, bkt, key).await?;
        let last = versions.last().cloned().ok_or(LayerError::NoSuchKey)?;
        self.caches.put_name(&last);
        Ok(last)
    }

    async fn head_version(
        &self,
        ctx: &RequestContext,
        bkt: &BucketInfo,
        key: &str,
        version: &str,
    ) -> LayerResult<ObjectInfo> {
        if version == UNVERSIONED_VERSION_ID {
            let mut versions = self.head_versions(ctx, bkt, key).await?;
            return versions
                .last_unversioned()
                .cloned()
                .ok_or(LayerError::NoSuchVersion);
        }

        let id: ObjectId = version
            .parse()
            .map_err(|_| LayerError::InvalidVersion(version.to_string()))?;
        let address = ObjectAddress::new(bkt.container, id);

        let meta = match self.caches.object(&address) {
            Some(meta) => meta,
            None => {
                let meta = ctx
                    .run(async {
                        self.network
                            .head(ctx, &address)
                            .await
                            .map_err(|err| match err {
                                err if err.is_not_found() => LayerError::NoSuchVersion,
                                err => err.into(),
                            })
                    })
                    .await?;
                self.caches.put_object(&meta);
                meta
            }
        };

        ObjectInfo::from_meta(&bkt.name, &meta)
            .filter(|info| info.name == key && !info.is_system())
            .ok_or(LayerError::NoSuchVersion)
    }

    /// Discover and fold every version of `key`.
    pub(super) async fn head_versions(
        &self,
        ctx: &RequestContext,
        bkt: &BucketInfo,
        key: &str,
    ) -> LayerResult<ObjectVersions> {
        let params = SearchParams {
            container: bkt.container,
            filters: vec![(ATTR_FILE_NAME.to_string(), key.to_string())],
            prefix: String::new(),
        };
        let ids = ctx.run(self.network.search(ctx, &params)).await?;
        if ids.is_empty() {
            return Err(LayerError::NoSuchKey);
        }

        let metas: Vec<Option<ObjectMeta>> = stream::iter(ids)
            .map(|id| self.object_from_cache_or_network(ctx, bkt.container, id))
            .buffered(HEAD_CONCURRENCY)
            .try_collect()
            .await?;

        let mut versions = ObjectVersions::new(key);
        for info in metas
            .iter()
            .flatten()
            .filter_map(|meta| ObjectInfo::from_meta(&bkt.name, meta))
            .filter(|info| !info.is_system())
        {
            versions.append_version(info);
        }
        Ok(versions)
    }

    /// Header of one object. Head failures other than interrupts are logged
    /// and yield `None`.
    pub(super) async fn object_from_cache_or_network(
        &self,
        ctx: &RequestContext,
        container: ContainerId,
        id: ObjectId,
    ) -> LayerResult<Option<ObjectMeta>> {
        let address = ObjectAddress::new(container, id);
        if let Some(meta) = self.caches.object(&address) {
            return Ok(Some(meta));
        }

        match ctx.run(self.network.head(ctx, &address)).await {
            Ok(meta) => {
                self.caches.put_object(&meta);
                Ok(Some(meta))
            }
            Err(err) if err.is_interrupt() => Err(err),
            Err(err) => {
                warn!(%address, error = %err, "couldn't head object");
                Ok(None)
            }
        }
    }

    pub async fn delete_object(
        &self,
        ctx: &RequestContext,
        params: &DeleteObjectParams,
    ) -> LayerResult<DeleteObjectResult> {
        let bkt = self.bucket_info(ctx, &params.bucket).await?;

        match params.version_id.as_deref() {
            None | Some("") => {
                let headers = BTreeMap::from([(
                    VERSIONS_DELETE_MARK_ATTR.to_string(),
                    DEL_MARK_FULL_OBJECT.to_string(),
                )]);
                let marker = self
                    .write_version(ctx, &bkt, &params.key, headers, empty_payload())
                    .await?;
                Ok(DeleteObjectResult {
                    version_id: marker.surfaced_version(),
                    delete_marker: true,
                })
            }
            Some(UNVERSIONED_VERSION_ID) => {
                let mut versions = self.head_versions(ctx, &bkt, &params.key).await?;
                let id = versions
                    .last_unversioned()
                    .map(|info| info.id)
                    .ok_or(LayerError::NoSuchVersion)?;
                self.delete_version(ctx, &bkt, &params.key, id).await?;
                Ok(DeleteObjectResult {
                    version_id: UNVERSIONED_VERSION_ID.to_string(),
                    delete_marker: false,
                })
            }
            Some(version) => {
                let id = self
                    .check_version_exists(ctx, &bkt, &params.key, version)
                    .await?;
                self.delete_version(ctx, &bkt, &params.key, id).await?;
                Ok(DeleteObjectResult {
                    version_id: id.to_string(),
                    delete_marker: false,
                })
            }
        }
    }

    /// Record the removal of one version, then tombstone it.
    async fn delete_version(
        &self,
        ctx: &RequestContext,
        bkt: &BucketInfo,
        key: &str,
        id: ObjectId,
    ) -> LayerResult<()> {
        let headers = BTreeMap::from([(VERSIONS_DELETE_MARK_ATTR.to_string(), id.to_string())]);
        self.write_version(ctx, bkt, key, headers, empty_payload())
            .await?;
        self.caches.forget_name(&bkt.name, key);

        let address = ObjectAddress::new(bkt.container, id);
        match self.object_delete(ctx, &address).await {
            Ok(()) => {}
            // Already superseded by the deletion record itself.
            Err(LayerError::Network(err)) if err.is_not_found() => {
                debug!(%address, "version already tombstoned");
            }
            Err(err) => return Err(err),
        }

        if let Err(err) = ctx
            .run(self.settings.delete_object_tagging(ctx, &address))
            .await
        {
            warn!(%address, error = %err, "couldn't delete object tagging");
        }
        info!(bucket = %bkt.name, key, version = %id, "object version deleted");
        Ok(())
    }

    pub(super) async fn check_version_exists(
        &self,
        ctx: &RequestContext,
        bkt: &BucketInfo,
        key: &str,
        version: &str,
    ) -> LayerResult<ObjectId> {
        let id: ObjectId = version
            .parse()
            .map_err(|_| LayerError::InvalidVersion(version.to_string()))?;

        let versions = self.head_versions(ctx, bkt, key).await?;
        if !versions.existing().contains(&id.to_string()) {
            return Err(LayerError::InvalidVersion(version.to_string()));
        }
        Ok(id)
    }

    /// Tombstone one physical object. The cached header goes first so no
    /// reader can pick it up once the tombstone lands.
    pub(super) async fn object_delete(
        &self,
        ctx: &RequestContext,
        address: &ObjectAddress,
    ) -> LayerResult<()> {
        self.caches.forget_object(address);
        ctx.run(self.network.delete(ctx, address)).await
    }

    pub async fn ready(&self, ctx: &RequestContext) -> LayerResult<()> {
        ctx.run(self.network.health(ctx)).await
    }
}

/// Reject empty or overlong keys and keys carrying control characters.
fn ensure_key_safe(key: &str) -> LayerResult<()> {
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(LayerError::InvalidKey);
    }
    if key.bytes().any(|b| b.is_ascii_control()) {
        return Err(LayerError::InvalidKey);
    }
    Ok(())
}

fn empty_payload() -> PayloadStream {
    Box::pin(stream::empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        testing::{Fixture, payload},
        versions::VERSIONS_UNVERSIONED_ATTR,
    };

    fn head(key: &str, version: Option<&str>) -> HeadObjectParams {
        HeadObjectParams {
            bucket: Fixture::BUCKET.into(),
            key: key.into(),
            version_id: version.map(str::to_string),
        }
    }

    fn delete(key: &str, version: Option<&str>) -> DeleteObjectParams {
        DeleteObjectParams {
            bucket: Fixture::BUCKET.into(),
            key: key.into(),
            version_id: version.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn unversioned_overwrite_keeps_one_live_version() {
        let fx = Fixture::new().await;
        let first = fx.put("doc.txt", b"one").await;
        let second = fx.put("doc.txt", b"two").await;

        assert_eq!(
            fx.network.live_ids(fx.bucket.container, "doc.txt"),
            vec![second.id]
        );
        assert!(second.is_unversioned());

        let current = fx.gateway.head_object(&fx.ctx, &head("doc.txt", None)).await.unwrap();
        assert_eq!(current.id, second.id);

        let err = fx
            .gateway
            .head_object(&fx.ctx, &head("doc.txt", Some(&first.version())))
            .await
            .unwrap_err();
        assert!(matches!(err, LayerError::NoSuchVersion));
    }

    #[tokio::test]
    async fn versioned_bucket_keeps_history_behind_delete_marker() {
        let fx = Fixture::versioned().await;
        let first = fx.put("doc.txt", b"one").await;
        let second = fx.put("doc.txt", b"two").await;
        assert_eq!(fx.network.live_ids(fx.bucket.container, "doc.txt").len(), 2);

        let current = fx.gateway.head_object(&fx.ctx, &head("doc.txt", None)).await.unwrap();
        assert_eq!(current.id, second.id);

        let result = fx
            .gateway
            .delete_object(&fx.ctx, &delete("doc.txt", None))
            .await
            .unwrap();
        assert!(result.delete_marker);
        assert_ne!(result.version_id, UNVERSIONED_VERSION_ID);

        let err = fx.gateway.head_object(&fx.ctx, &head("doc.txt", None)).await.unwrap_err();
        assert!(matches!(err, LayerError::NoSuchKey));

        let old = fx
            .gateway
            .head_object(&fx.ctx, &head("doc.txt", Some(&first.version())))
            .await
            .unwrap();
        assert_eq!(old.id, first.id);
    }

    #[tokio::test]
    async fn deleting_a_version_exposes_the_previous_one() {
        let fx = Fixture::versioned().await;
        let first = fx.put("doc.txt", b"one").await;
        let second = fx.put("doc.txt", b"two").await;
        // Prime the name cache with the version about to go away.
        fx.gateway.head_object(&fx.ctx, &head("doc.txt", None)).await.unwrap();

        let result = fx
            .gateway
            .delete_object(&fx.ctx, &delete("doc.txt", Some(&second.version())))
            .await
            .unwrap();
        assert!(!result.delete_marker);
        assert_eq!(result.version_id, second.version());

        let err = fx
            .gateway
            .head_object(&fx.ctx, &head("doc.txt", Some(&second.version())))
            .await
            .unwrap_err();
        assert!(matches!(err, LayerError::NoSuchVersion));

        let current = fx.gateway.head_object(&fx.ctx, &head("doc.txt", None)).await.unwrap();
        assert_eq!(current.id, first.id);
    }

    #[tokio::test]
    async fn null_version_tracks_unversioned_writes() {
        let fx = Fixture::new().await;
        let plain = fx.put("doc.txt", b"plain").await;
        fx.enable_versioning().await;
        let versioned = fx.put("doc.txt", b"versioned").await;

        let null = fx
            .gateway
            .head_object(&fx.ctx, &head("doc.txt", Some(UNVERSIONED_VERSION_ID)))
            .await
            .unwrap();
        assert_eq!(null.id, plain.id);

        fx.gateway
            .delete_object(&fx.ctx, &delete("doc.txt", Some(&versioned.version())))
            .await
            .unwrap();
        let null = fx
            .gateway
            .head_object(&fx.ctx, &head("doc.txt", Some(UNVERSIONED_VERSION_ID)))
            .await
            .unwrap();
        assert_eq!(null.id, plain.id);

        let result = fx
            .gateway
            .delete_object(&fx.ctx, &delete("doc.txt", Some(UNVERSIONED_VERSION_ID)))
            .await
            .unwrap();
        assert_eq!(result.version_id, UNVERSIONED_VERSION_ID);

        let err = fx
            .gateway
            .head_object(&fx.ctx, &head("doc.txt", Some(UNVERSIONED_VERSION_ID)))
            .await
            .unwrap_err();
        assert!(matches!(err, LayerError::NoSuchVersion));
        let err = fx.gateway.head_object(&fx.ctx, &head("doc.txt", None)).await.unwrap_err();
        assert!(matches!(err, LayerError::NoSuchKey));
    }

    #[tokio::test]
    async fn unversioned_delete_marker_reports_null() {
        let fx = Fixture::new().await;
        fx.put("doc.txt", b"one").await;
        let result = fx
            .gateway
            .delete_object(&fx.ctx, &delete("doc.txt", None))
            .await
            .unwrap();
        assert!(result.delete_marker);
        assert_eq!(result.version_id, UNVERSIONED_VERSION_ID);
    }

    #[tokio::test]
    async fn invalid_versions_are_rejected() {
        let fx = Fixture::versioned().await;
        fx.put("doc.txt", b"one").await;

        let err = fx
            .gateway
            .delete_object(&fx.ctx, &delete("doc.txt", Some("garbage")))
            .await
            .unwrap_err();
        assert!(matches!(err, LayerError::InvalidVersion(_)));

        let unknown = ObjectId::new().to_string();
        let err = fx
            .gateway
            .delete_object(&fx.ctx, &delete("doc.txt", Some(&unknown)))
            .await
            .unwrap_err();
        assert!(matches!(err, LayerError::InvalidVersion(_)));

        let err = fx
            .gateway
            .head_object(&fx.ctx, &head("doc.txt", Some("garbage")))
            .await
            .unwrap_err();
        assert!(matches!(err, LayerError::InvalidVersion(_)));
    }

    #[tokio::test]
    async fn explicit_version_of_another_key_is_not_found() {
        let fx = Fixture::versioned().await;
        let other = fx.put("other.txt", b"x").await;
        fx.put("doc.txt", b"y").await;

        let err = fx
            .gateway
            .head_object(&fx.ctx, &head("doc.txt", Some(&other.version())))
            .await
            .unwrap_err();
        assert!(matches!(err, LayerError::NoSuchVersion));
    }

    #[tokio::test]
    async fn content_type_is_detected_when_missing() {
        let fx = Fixture::new().await;
        let json = fx.put("data.json", b"{\"a\": 1}").await;
        assert_eq!(json.content_type, "application/json");

        let empty = fx.put("empty", b"").await;
        assert_eq!(empty.content_type, "");

        let explicit = fx
            .put_with(
                "page",
                b"{}",
                BTreeMap::from([(ATTR_CONTENT_TYPE.to_string(), "text/html".to_string())]),
            )
            .await;
        assert_eq!(explicit.content_type, "text/html");
    }

    #[tokio::test]
    async fn reserved_headers_from_callers_are_dropped() {
        let fx = Fixture::new().await;
        let info = fx
            .put_with(
                "doc.txt",
                b"x",
                BTreeMap::from([
                    (VERSIONS_DELETE_MARK_ATTR.to_string(), "*".to_string()),
                    ("author".to_string(), "me".to_string()),
                ]),
            )
            .await;
        assert!(info.delete_mark().is_none());
        assert_eq!(info.headers["author"], "me");
        assert_eq!(info.headers[VERSIONS_UNVERSIONED_ATTR], "true");
    }

    #[tokio::test]
    async fn failed_heads_are_skipped_while_resolving() {
        let fx = Fixture::versioned().await;
        let first = fx.put("doc.txt", b"one").await;
        let second = fx.put("doc.txt", b"two").await;
        fx.network.fail_head_for(second.id);

        let cold = fx.cold_gateway();
        let current = cold.head_object(&fx.ctx, &head("doc.txt", None)).await.unwrap();
        assert_eq!(current.id, first.id);
    }

    #[tokio::test]
    async fn backend_acl_rejection_is_access_denied() {
        let fx = Fixture::new().await;
        fx.put("doc.txt", b"one").await;
        fx.network.deny_access(true);

        let err = fx
            .cold_gateway()
            .head_object(&fx.ctx, &head("doc.txt", None))
            .await
            .unwrap_err();
        assert!(matches!(err, LayerError::AccessDenied));
    }

    #[tokio::test]
    async fn system_objects_are_not_versions() {
        let fx = Fixture::new().await;
        fx.put_raw(
            "settings",
            BTreeMap::from([(
                crate::models::object::ATTR_SYSTEM_NAME.to_string(),
                "bucket.settings".to_string(),
            )]),
        )
        .await;

        let err = fx.gateway.head_object(&fx.ctx, &head("settings", None)).await.unwrap_err();
        assert!(matches!(err, LayerError::NoSuchKey));
    }

    #[tokio::test]
    async fn ranged_get_streams_a_slice() {
        let fx = Fixture::new().await;
        fx.put("doc.txt", b"hello world").await;

        let mut sink = Vec::new();
        let info = fx
            .gateway
            .get_object(
                &fx.ctx,
                &head("doc.txt", None),
                Some(ByteRange { start: 6, end: 10 }),
                &mut sink,
            )
            .await
            .unwrap();
        assert_eq!(sink, b"world");
        assert_eq!(info.size, 11);
    }

    #[tokio::test]
    async fn unsafe_keys_are_rejected() {
        let fx = Fixture::new().await;
        let overlong = "k".repeat(MAX_OBJECT_KEY_LEN + 1);
        for key in ["", "tab\tkey", overlong.as_str()] {
            let err = fx
                .gateway
                .put_object(
                    &fx.ctx,
                    PutObjectParams {
                        bucket: Fixture::BUCKET.into(),
                        key: key.into(),
                        headers: BTreeMap::new(),
                        payload: payload(b"x"),
                    },
                )
                .await
                .unwrap_err();
            assert!(matches!(err, LayerError::InvalidKey));
        }
    }

    #[tokio::test]
    async fn rooted_and_backslash_keys_are_plain_s3_keys() {
        let fx = Fixture::new().await;
        for key in ["/rooted", "dir\\file.txt"] {
            let stored = fx.put(key, b"x").await;
            let current = fx.gateway.head_object(&fx.ctx, &head(key, None)).await.unwrap();
            assert_eq!(current.id, stored.id);
        }
    }

    #[tokio::test]
    async fn version_ids_are_matched_case_insensitively() {
        let fx = Fixture::versioned().await;
        let first = fx.put("doc.txt", b"one").await;
        let second = fx.put("doc.txt", b"two").await;

        let upper = first.version().to_uppercase();
        let result = fx
            .gateway
            .delete_object(&fx.ctx, &delete("doc.txt", Some(&upper)))
            .await
            .unwrap();
        assert!(!result.delete_marker);
        assert!(
            !fx.network
                .live_ids(fx.bucket.container, "doc.txt")
                .contains(&first.id)
        );
        let current = fx.gateway.head_object(&fx.ctx, &head("doc.txt", None)).await.unwrap();
        assert_eq!(current.id, second.id);
    }

    #[tokio::test]
    async fn suspended_version_delete_keeps_null_version() {
        let fx = Fixture::versioned().await;
        let v1 = fx.put("doc.txt", b"versioned").await;
        fx.suspend_versioning().await;
        let plain = fx.put("doc.txt", b"plain").await;
        assert!(plain.is_unversioned());

        fx.gateway
            .delete_object(&fx.ctx, &delete("doc.txt", Some(&v1.version())))
            .await
            .unwrap();

        let live = fx.network.live_ids(fx.bucket.container, "doc.txt");
        assert!(live.contains(&plain.id));
        assert!(!live.contains(&v1.id));

        let null = fx
            .gateway
            .head_object(&fx.ctx, &head("doc.txt", Some(UNVERSIONED_VERSION_ID)))
            .await
            .unwrap();
        assert_eq!(null.id, plain.id);

        let current = fx
            .cold_gateway()
            .head_object(&fx.ctx, &head("doc.txt", None))
            .await
            .unwrap();
        assert_eq!(current.id, plain.id);
    }

    #[tokio::test]
    async fn failed_cleanup_of_superseded_version_keeps_the_write() {
        let fx = Fixture::new().await;
        let first = fx.put("doc.txt", b"one").await;
        fx.network.fail_delete_for(first.id);
        let deletes = fx.network.delete_calls();

        let second = fx.put("doc.txt", b"two").await;
        assert_eq!(fx.network.delete_calls(), deletes + 1);
        assert_eq!(
            fx.network.live_ids(fx.bucket.container, "doc.txt"),
            vec![first.id, second.id]
        );

        let gateway = fx.cold_gateway();
        let bkt = gateway.bucket_info(&fx.ctx, Fixture::BUCKET).await.unwrap();
        let mut versions = gateway.head_versions(&fx.ctx, &bkt, "doc.txt").await.unwrap();
        assert_eq!(versions.last().map(|v| v.id), Some(second.id));
    }

    #[tokio::test]
    async fn equal_epochs_converge_on_the_larger_id() {
        let fx = Fixture::versioned().await;
        fx.network.freeze_epoch(Some(7));
        let a = fx.put("doc.txt", b"a").await;
        let b = fx.put("doc.txt", b"b").await;
        fx.network.freeze_epoch(None);
        assert_eq!(a.creation_epoch, b.creation_epoch);

        let current = fx
            .cold_gateway()
            .head_object(&fx.ctx, &head("doc.txt", None))
            .await
            .unwrap();
        assert_eq!(current.id, a.id.max(b.id));
    }

    #[tokio::test]
    async fn cached_current_version_skips_the_network() {
        let fx = Fixture::new().await;
        let stored = fx.put("doc.txt", b"one").await;

        let heads = fx.network.head_calls();
        let current = fx.gateway.head_object(&fx.ctx, &head("doc.txt", None)).await.unwrap();
        assert_eq!(current.id, stored.id);
        assert_eq!(fx.network.head_calls(), heads);

        fx.cold_gateway()
            .head_object(&fx.ctx, &head("doc.txt", None))
            .await
            .unwrap();
        assert!(fx.network.head_calls() > heads);
    }

    #[tokio::test]
    async fn missing_bucket_and_cancelled_requests() {
        let fx = Fixture::new().await;
        let err = fx
            .gateway
            .head_object(
                &fx.ctx,
                &HeadObjectParams {
                    bucket: "missing".into(),
                    key: "k".into(),
                    version_id: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LayerError::NoSuchBucket(_)));

        let ctx = RequestContext::new();
        ctx.cancel();
        let err = fx
            .gateway
            .put_object(
                &ctx,
                PutObjectParams {
                    bucket: Fixture::BUCKET.into(),
                    key: "k".into(),
                    headers: BTreeMap::new(),
                    payload: payload(b"x"),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LayerError::Cancelled));
    }

    #[tokio::test]
    async fn superseded_versions_lose_their_tags() {
        let fx = Fixture::new().await;
        let first = fx.put("doc.txt", b"one").await;
        fx.settings.set_tags(
            first.address(),
            BTreeMap::from([("k".to_string(), "v".to_string())]),
        );

        fx.put("doc.txt", b"two").await;
        assert!(fx.settings.tags(&first.address()).is_none());
    }

    #[tokio::test]
    async fn bucket_versioning_round_trip() {
        let fx = Fixture::new().await;
        let settings = fx
            .gateway
            .get_bucket_versioning(&fx.ctx, Fixture::BUCKET)
            .await
            .unwrap();
        assert!(!settings.versioning_enabled);

        fx.enable_versioning().await;
        let settings = fx
            .gateway
            .get_bucket_versioning(&fx.ctx, Fixture::BUCKET)
            .await
            .unwrap();
        assert!(settings.versioning_enabled);
    }
}
