//! Shared fixture for gateway and listing tests.

use crate::{
    models::{
        bucket::{BucketInfo, BucketSettings},
        object::{ATTR_FILE_NAME, ObjectInfo},
    },
    network::{ObjectNetwork, PayloadStream, PutRequest, memory::MemoryNetwork},
    services::{
        cache::{CacheConfig, MetadataCaches},
        context::RequestContext,
        detector::MagicDetector,
        gateway::{Gateway, PutObjectParams},
        settings::MemorySettings,
    },
};
use bytes::Bytes;
use futures::stream;
use std::{collections::BTreeMap, sync::Arc};

pub fn payload(data: &'static [u8]) -> PayloadStream {
    Box::pin(stream::iter(vec![Ok(Bytes::from_static(data))]))
}

pub struct Fixture {
    pub gateway: Gateway,
    pub network: MemoryNetwork,
    pub settings: MemorySettings,
    pub ctx: RequestContext,
    pub bucket: BucketInfo,
}

impl Fixture {
    pub const BUCKET: &'static str = "bucket";

    pub async fn new() -> Self {
        let network = MemoryNetwork::new();
        let settings = MemorySettings::new();
        let gateway = Self::gateway_over(&network, &settings);
        let ctx = RequestContext::new();
        let bucket = gateway
            .create_bucket(&ctx, Self::BUCKET, "local")
            .await
            .unwrap();
        Self {
            gateway,
            network,
            settings,
            ctx,
            bucket,
        }
    }

    pub async fn versioned() -> Self {
        let fx = Self::new().await;
        fx.enable_versioning().await;
        fx
    }

    fn gateway_over(network: &MemoryNetwork, settings: &MemorySettings) -> Gateway {
        Gateway::new(
            Arc::new(network.clone()),
            Arc::new(settings.clone()),
            MetadataCaches::in_memory(CacheConfig::default()),
            Arc::new(MagicDetector),
        )
    }

    /// A gateway over the same network and settings with empty caches.
    pub fn cold_gateway(&self) -> Gateway {
        Self::gateway_over(&self.network, &self.settings)
    }

    pub async fn enable_versioning(&self) {
        self.set_versioning(true).await;
    }

    pub async fn suspend_versioning(&self) {
        self.set_versioning(false).await;
    }

    async fn set_versioning(&self, versioning_enabled: bool) {
        self.gateway
            .put_bucket_versioning(
                &self.ctx,
                Self::BUCKET,
                BucketSettings { versioning_enabled },
            )
            .await
            .unwrap();
    }

    pub async fn put(&self, key: &str, data: &'static [u8]) -> ObjectInfo {
        self.put_with(key, data, BTreeMap::new()).await
    }

    pub async fn put_with(
        &self,
        key: &str,
        data: &'static [u8],
        headers: BTreeMap<String, String>,
    ) -> ObjectInfo {
        self.gateway
            .put_object(
                &self.ctx,
                PutObjectParams {
                    bucket: Self::BUCKET.into(),
                    key: key.into(),
                    headers,
                    payload: payload(data),
                },
            )
            .await
            .unwrap()
    }

    /// Store an object directly on the network, bypassing version headers.
    pub async fn put_raw(&self, key: &str, mut attributes: BTreeMap<String, String>) {
        attributes.insert(ATTR_FILE_NAME.to_string(), key.to_string());
        self.network
            .put(
                &self.ctx,
                PutRequest {
                    container: self.bucket.container,
                    owner: None,
                    attributes,
                },
                payload(b""),
            )
            .await
            .unwrap();
    }
}
