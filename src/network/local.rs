//! LocalNetwork: an append-only object network backed by SQLite for object
//! headers and local disk for payloads.
//!
//! Objects are never updated: a put inserts a new row plus its attributes and
//! a delete only raises the tombstone flag (the payload file is removed
//! best-effort). Payloads live beneath
//! `base_path/{container}/{shard}/{shard}/{object}`.

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
use chrono::{DateTime, Utc};
use futures::StreamExt;
use md5::Context;
use sqlx::{FromRow, QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

#[derive(FromRow)]
struct BucketRow {
    id: Uuid,
    name: String,
    owner_id: Uuid,
    region: String,
    created_at: DateTime<Utc>,
}

impl From<BucketRow> for BucketInfo {
    fn from(row: BucketRow) -> Self {
        BucketInfo {
            name: row.name,
            container: ContainerId::from_uuid(row.id),
            owner: row.owner_id.to_string(),
            region: row.region,
            created: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct ObjectRow {
    id: Uuid,
    container_id: Uuid,
    owner_id: Option<String>,
    creation_epoch: i64,
    payload_size: i64,
    payload_checksum: String,
}

/// Object network over a shared SQLite pool and a payload directory.
#[derive(Clone)]
pub struct LocalNetwork {
    /// Shared SQLite connection pool holding containers and object headers.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

impl LocalNetwork {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    fn container_root(&self, container: ContainerId) -> PathBuf {
        self.base_path.join(container.to_string())
    }

    /// Two-level shard identifiers from MD5(container/object), reducing the
    /// file count per directory.
    fn object_shards(container: ContainerId, id: ObjectId) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", container, id));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, container: ContainerId, id: ObjectId) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(container, id);
        let mut path = self.container_root(container);
        path.push(shard_a);
        path.push(shard_b);
        path.push(id.to_string());
        path
    }

    async fn fetch_bucket_by_id(&self, container: ContainerId) -> NetworkResult<BucketInfo> {
        sqlx::query_as::<_, BucketRow>(
            "SELECT id, name, owner_id, region, created_at FROM buckets WHERE id = ?",
        )
        .bind(container.as_uuid())
        .fetch_optional(&*self.db)
        .await?
        .map(BucketInfo::from)
        .ok_or_else(|| NetworkError::ContainerNotFound(container.to_string()))
    }

    /// Stream a payload into `path`, computing size and MD5 along the way.
    /// The file is fsynced before returning.
    async fn write_payload(path: &Path, mut payload: PayloadStream) -> io::Result<(u64, String)> {
        let mut file = File::create(path).await?;
        let mut size: u64 = 0;
        let mut digest = Context::new();
        while let Some(chunk) = payload.next().await {
            let chunk = chunk?;
            size += chunk.len() as u64;
            digest.consume(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok((size, format!("{:x}", digest.compute())))
    }

    /// Insert the header rows. The epoch is assigned inside the transaction
    /// so it is strictly greater than every epoch committed before it.
    async fn insert_object(
        &self,
        id: ObjectId,
        request: PutRequest,
        size: u64,
        checksum: String,
    ) -> NetworkResult<()> {
        let mut tx = self.db.begin().await?;
        let epoch: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(creation_epoch), 0) + 1 FROM objects")
                .fetch_one(&mut *tx)
                .await?;

        sqlx::query(
            "INSERT INTO objects (
                id, container_id, owner_id, creation_epoch, payload_size,
                payload_checksum, tombstoned
            ) VALUES (?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(id.as_uuid())
        .bind(request.container.as_uuid())
        .bind(request.owner)
        .bind(epoch)
        .bind(size as i64)
        .bind(checksum)
        .execute(&mut *tx)
        .await?;

        for (key, value) in request.attributes {
            sqlx::query("INSERT INTO object_attributes (object_id, key, value) VALUES (?, ?, ?)")
                .bind(id.as_uuid())
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Recursively remove empty directories up to the container root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectNetwork for LocalNetwork {
    async fn container(&self, _ctx: &RequestContext, name: &str) -> NetworkResult<BucketInfo> {
        ensure_container_name_safe(name)?;
        sqlx::query_as::<_, BucketRow>(
            "SELECT id, name, owner_id, region, created_at FROM buckets WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&*self.db)
        .await?
        .map(BucketInfo::from)
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

        let bucket = BucketInfo {
            name: name.to_string(),
            container: ContainerId::new(),
            owner: Uuid::new_v4().to_string(),
            region,
            created: Utc::now(),
        };
        let owner_id = Uuid::parse_str(&bucket.owner).unwrap_or_else(|_| Uuid::nil());

        match sqlx::query(
            "INSERT INTO buckets (id, name, owner_id, region, created_at, versioning_enabled)
             VALUES (?, ?, ?, ?, ?, 0)",
        )
        .bind(bucket.container.as_uuid())
        .bind(&bucket.name)
        .bind(owner_id)
        .bind(&bucket.region)
        .bind(bucket.created)
        .execute(&*self.db)
        .await
        {
            Ok(_) => {
                fs::create_dir_all(self.container_root(bucket.container)).await?;
                Ok(bucket)
            }
            Err(err) if is_unique_violation(&err) => {
                Err(NetworkError::ContainerAlreadyExists(name.to_string()))
            }
            Err(err) => Err(NetworkError::Sqlx(err)),
        }
    }

    async fn search(
        &self,
        _ctx: &RequestContext,
        params: &SearchParams,
    ) -> NetworkResult<Vec<ObjectId>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT o.id FROM objects o WHERE o.tombstoned = 0 AND o.container_id = ",
        );
        builder.push_bind(params.container.as_uuid());

        for (key, value) in &params.filters {
            builder.push(
                " AND EXISTS (SELECT 1 FROM object_attributes a \
                 WHERE a.object_id = o.id AND a.key = ",
            );
            builder.push_bind(key.clone());
            builder.push(" AND a.value = ");
            builder.push_bind(value.clone());
            builder.push(")");
        }

        if !params.prefix.is_empty() {
            builder.push(
                " AND EXISTS (SELECT 1 FROM object_attributes a \
                 WHERE a.object_id = o.id AND a.key = ",
            );
            builder.push_bind(ATTR_FILE_NAME);
            builder.push(" AND substr(a.value, 1, length(");
            builder.push_bind(params.prefix.clone());
            builder.push(")) = ");
            builder.push_bind(params.prefix.clone());
            builder.push(")");
        }

        builder.push(" ORDER BY o.id");

        let ids: Vec<Uuid> = builder
            .build_query_scalar::<Uuid>()
            .fetch_all(&*self.db)
            .await?;
        Ok(ids.into_iter().map(ObjectId::from_uuid).collect())
    }

    async fn head(
        &self,
        _ctx: &RequestContext,
        address: &ObjectAddress,
    ) -> NetworkResult<ObjectMeta> {
        let row = sqlx::query_as::<_, ObjectRow>(
            "SELECT id, container_id, owner_id, creation_epoch, payload_size, payload_checksum
             FROM objects
             WHERE id = ? AND container_id = ? AND tombstoned = 0",
        )
        .bind(address.object.as_uuid())
        .bind(address.container.as_uuid())
        .fetch_optional(&*self.db)
        .await?
        .ok_or(NetworkError::NotFound(*address))?;

        let attributes: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM object_attributes WHERE object_id = ?")
                .bind(row.id)
                .fetch_all(&*self.db)
                .await?;

        Ok(ObjectMeta {
            address: ObjectAddress::new(
                ContainerId::from_uuid(row.container_id),
                ObjectId::from_uuid(row.id),
            ),
            owner: row.owner_id,
            payload_size: row.payload_size.max(0) as u64,
            creation_epoch: row.creation_epoch.max(0) as u64,
            payload_checksum: row.payload_checksum,
            attributes: attributes.into_iter().collect(),
        })
    }

    async fn get(
        &self,
        ctx: &RequestContext,
        address: &ObjectAddress,
        range: Option<ByteRange>,
        sink: PayloadSink<'_>,
    ) -> NetworkResult<ObjectMeta> {
        let meta = self.head(ctx, address).await?;
        let path = self.object_path(address.container, address.object);
        let mut file = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                NetworkError::NotFound(*address)
            } else {
                NetworkError::Io(err)
            }
        })?;

        let len = match range {
            Some(range) => {
                let range = check_range(range, meta.payload_size)?;
                file.seek(SeekFrom::Start(range.start)).await?;
                range.len()
            }
            None => meta.payload_size,
        };

        let mut reader = file.take(len);
        tokio::io::copy(&mut reader, &mut *sink).await?;
        sink.flush().await?;
        Ok(meta)
    }

    async fn put(
        &self,
        _ctx: &RequestContext,
        request: PutRequest,
        payload: PayloadStream,
    ) -> NetworkResult<ObjectId> {
        self.fetch_bucket_by_id(request.container).await?;

        let id = ObjectId::new();
        let file_path = self.object_path(request.container, id);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("object path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let (size, checksum) = match Self::write_payload(&tmp_path, payload).await {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(NetworkError::Io(err));
            }
        };

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(NetworkError::Io(err));
        }

        match self.insert_object(id, request, size, checksum).await {
            Ok(()) => Ok(id),
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(err)
            }
        }
    }

    async fn delete(&self, _ctx: &RequestContext, address: &ObjectAddress) -> NetworkResult<()> {
        let result = sqlx::query(
            "UPDATE objects SET tombstoned = 1
             WHERE id = ? AND container_id = ? AND tombstoned = 0",
        )
        .bind(address.object.as_uuid())
        .bind(address.container.as_uuid())
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(NetworkError::NotFound(*address));
        }

        let file_path = self.object_path(address.container, address.object);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed payload {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("payload {} already missing", file_path.display());
            }
            Err(err) => debug!("failed to remove payload {}: {}", file_path.display(), err),
        }

        if let Some(parent) = file_path.parent() {
            let root = self.container_root(address.container);
            self.prune_empty_dirs(parent, &root).await;
        }

        Ok(())
    }

    /// Lightweight query against SQLite plus a write/read/delete round trip
    /// under `base_path`.
    async fn health(&self, _ctx: &RequestContext) -> NetworkResult<()> {
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&*self.db).await?;
        if one != 1 {
            return Err(NetworkError::Status(format!(
                "unexpected sqlite probe result: {}",
                one
            )));
        }

        fs::create_dir_all(&self.base_path).await?;
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read_back = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read_back? != b"readyz" {
            return Err(NetworkError::Status("payload probe content mismatch".into()));
        }
        Ok(())
    }
}

/// Create the schema. Statements are idempotent.
pub async fn run_migrations(db: &SqlitePool) -> NetworkResult<()> {
    let statements = SCHEMA
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
