//! Bucket settings tree.
//!
//! Holds per-bucket settings (versioning) and per-version tagging. The
//! gateway only reads and writes settings and cleans up tagging of versions it
//! removed; everything else about the tree belongs to other services.

use crate::{
    models::{
        bucket::BucketSettings,
        object::{ContainerId, ObjectAddress},
    },
    services::context::RequestContext,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::SqlitePool;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings node for container `{0}` not found")]
    NodeNotFound(ContainerId),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type SettingsResult<T> = Result<T, SettingsError>;

#[async_trait]
pub trait SettingsStore: Send + Sync + 'static {
    async fn get_settings(
        &self,
        ctx: &RequestContext,
        container: ContainerId,
    ) -> SettingsResult<BucketSettings>;

    async fn put_settings(
        &self,
        ctx: &RequestContext,
        container: ContainerId,
        settings: BucketSettings,
    ) -> SettingsResult<()>;

    /// Drop the tag set attached to one physical version.
    async fn delete_object_tagging(
        &self,
        ctx: &RequestContext,
        address: &ObjectAddress,
    ) -> SettingsResult<()>;
}

/// In-process settings tree.
#[derive(Clone, Default)]
pub struct MemorySettings {
    settings: Arc<RwLock<HashMap<ContainerId, BucketSettings>>>,
    tags: Arc<RwLock<HashMap<ObjectAddress, BTreeMap<String, String>>>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tags(&self, address: ObjectAddress, tags: BTreeMap<String, String>) {
        self.tags.write().insert(address, tags);
    }

    pub fn tags(&self, address: &ObjectAddress) -> Option<BTreeMap<String, String>> {
        self.tags.read().get(address).cloned()
    }
}

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn get_settings(
        &self,
        _ctx: &RequestContext,
        container: ContainerId,
    ) -> SettingsResult<BucketSettings> {
        self.settings
            .read()
            .get(&container)
            .copied()
            .ok_or(SettingsError::NodeNotFound(container))
    }

    async fn put_settings(
        &self,
        _ctx: &RequestContext,
        container: ContainerId,
        settings: BucketSettings,
    ) -> SettingsResult<()> {
        self.settings.write().insert(container, settings);
        Ok(())
    }

    async fn delete_object_tagging(
        &self,
        _ctx: &RequestContext,
        address: &ObjectAddress,
    ) -> SettingsResult<()> {
        self.tags.write().remove(address);
        Ok(())
    }
}

/// Settings kept next to the local network's container records.
#[derive(Clone)]
pub struct LocalSettings {
    db: Arc<SqlitePool>,
}

impl LocalSettings {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SettingsStore for LocalSettings {
    async fn get_settings(
        &self,
        _ctx: &RequestContext,
        container: ContainerId,
    ) -> SettingsResult<BucketSettings> {
        let enabled: Option<bool> =
            sqlx::query_scalar("SELECT versioning_enabled FROM buckets WHERE id = ?")
                .bind(container.as_uuid())
                .fetch_optional(&*self.db)
                .await?;

        enabled
            .map(|versioning_enabled| BucketSettings { versioning_enabled })
            .ok_or(SettingsError::NodeNotFound(container))
    }

    async fn put_settings(
        &self,
        _ctx: &RequestContext,
        container: ContainerId,
        settings: BucketSettings,
    ) -> SettingsResult<()> {
        let result = sqlx::query("UPDATE buckets SET versioning_enabled = ? WHERE id = ?")
            .bind(settings.versioning_enabled)
            .bind(container.as_uuid())
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(SettingsError::NodeNotFound(container));
        }
        Ok(())
    }

    async fn delete_object_tagging(
        &self,
        _ctx: &RequestContext,
        address: &ObjectAddress,
    ) -> SettingsResult<()> {
        sqlx::query("DELETE FROM object_tags WHERE container_id = ? AND object_id = ?")
            .bind(address.container.as_uuid())
            .bind(address.object.as_uuid())
            .execute(&*self.db)
            .await?;
        Ok(())
    }
}
