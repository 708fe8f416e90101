use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::model::{BucketCategory, FileRecord};

/// Document store for File records plus the content-hash block-list.
///
/// (hash, bucket) is the content-addressing key: lookups, reference counts,
/// and thumbnail propagation all operate on that pair.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Persist a new record.
    async fn insert(&self, record: &FileRecord) -> Result<()>;

    /// Find a committed record by id. Records with a zero upload timestamp
    /// are invisible.
    async fn find_by_id(&self, id: &str) -> Result<Option<FileRecord>>;

    /// Find any record sharing (hash, bucket), for the dedup fast path.
    async fn find_by_content(
        &self,
        hash: &str,
        bucket: BucketCategory,
    ) -> Result<Option<FileRecord>>;

    /// Number of records referencing (hash, bucket), for reference counting
    /// before object deletion.
    async fn count_by_content(&self, hash: &str, bucket: BucketCategory) -> Result<i64>;

    /// All unclaimed records uploaded before `cutoff` (unix seconds).
    async fn find_expired(&self, cutoff: i64) -> Result<Vec<FileRecord>>;

    /// Record a thumbnail MIME on every record sharing (hash, bucket), as
    /// one atomic multi-match update. Returns the number of records touched.
    async fn set_thumbnail_mime(
        &self,
        hash: &str,
        bucket: BucketCategory,
        mime: &str,
    ) -> Result<u64>;

    /// Delete one record by id. Object cleanup is the caller's concern.
    async fn delete_by_id(&self, id: &str) -> Result<()>;

    /// Whether a content hash is on the block-list.
    async fn is_blocked(&self, hash: &str) -> Result<bool>;
}

const FILE_COLUMNS: &str = "id, hash, bucket, mime, thumbnail_mime, size, filename, \
     width, height, upload_region, uploaded_by, uploaded_at, claimed";

/// PostgreSQL-backed metadata store.
pub struct PgMetadataStore {
    pool: PgPool,
}

/// Raw row shape; `bucket` is stored as text.
#[derive(FromRow)]
struct FileRow {
    id: String,
    hash: String,
    bucket: String,
    mime: String,
    thumbnail_mime: Option<String>,
    size: i64,
    filename: String,
    width: Option<i32>,
    height: Option<i32>,
    upload_region: String,
    uploaded_by: String,
    uploaded_at: i64,
    claimed: bool,
}

impl TryFrom<FileRow> for FileRecord {
    type Error = Error;

    fn try_from(row: FileRow) -> Result<Self> {
        let bucket = BucketCategory::from_str(&row.bucket)?;
        Ok(FileRecord {
            id: row.id,
            hash: row.hash,
            bucket,
            mime: row.mime,
            thumbnail_mime: row.thumbnail_mime,
            size: row.size,
            filename: row.filename,
            width: row.width,
            height: row.height,
            upload_region: row.upload_region,
            uploaded_by: row.uploaded_by,
            uploaded_at: row.uploaded_at,
            claimed: row.claimed,
        })
    }
}

impl PgMetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("failed to connect to PostgreSQL")?;

        info!("connected to PostgreSQL metadata store");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;

        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    #[instrument(skip(self, record), fields(id = %record.id, bucket = %record.bucket))]
    async fn insert(&self, record: &FileRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO files (
                id, hash, bucket, mime, thumbnail_mime, size, filename,
                width, height, upload_region, uploaded_by, uploaded_at, claimed
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13
            )
            "#,
        )
        .bind(&record.id)
        .bind(&record.hash)
        .bind(record.bucket.as_str())
        .bind(&record.mime)
        .bind(&record.thumbnail_mime)
        .bind(record.size)
        .bind(&record.filename)
        .bind(record.width)
        .bind(record.height)
        .bind(&record.upload_region)
        .bind(&record.uploaded_by)
        .bind(record.uploaded_at)
        .bind(record.claimed)
        .execute(&self.pool)
        .await
        .context("failed to insert file record")?;

        debug!("file record inserted");
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE id = $1 AND uploaded_at <> 0"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query file by id")?;

        row.map(FileRecord::try_from).transpose()
    }

    async fn find_by_content(
        &self,
        hash: &str,
        bucket: BucketCategory,
    ) -> Result<Option<FileRecord>> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE hash = $1 AND bucket = $2 LIMIT 1"
        ))
        .bind(hash)
        .bind(bucket.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("failed to query file by content")?;

        row.map(FileRecord::try_from).transpose()
    }

    async fn count_by_content(&self, hash: &str, bucket: BucketCategory) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM files WHERE hash = $1 AND bucket = $2")
                .bind(hash)
                .bind(bucket.as_str())
                .fetch_one(&self.pool)
                .await
                .context("failed to count file references")?;

        Ok(count.0)
    }

    async fn find_expired(&self, cutoff: i64) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE claimed = FALSE AND uploaded_at < $1"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("failed to query expired files")?;

        rows.into_iter().map(FileRecord::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn set_thumbnail_mime(
        &self,
        hash: &str,
        bucket: BucketCategory,
        mime: &str,
    ) -> Result<u64> {
        let result =
            sqlx::query("UPDATE files SET thumbnail_mime = $1 WHERE hash = $2 AND bucket = $3")
                .bind(mime)
                .bind(hash)
                .bind(bucket.as_str())
                .execute(&self.pool)
                .await
                .context("failed to update thumbnail mime")?;

        Ok(result.rows_affected())
    }

    async fn delete_by_id(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM files WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to delete file record")?;

        Ok(())
    }

    async fn is_blocked(&self, hash: &str) -> Result<bool> {
        let blocked: (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM blocked_files WHERE hash = $1)")
                .bind(hash)
                .fetch_one(&self.pool)
                .await
                .context("failed to query block-list")?;

        Ok(blocked.0)
    }
}

/// In-memory metadata store for tests and local development.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    records: RwLock<HashMap<String, FileRecord>>,
    blocked: RwLock<HashSet<String>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hash to the block-list.
    pub fn block(&self, hash: &str) {
        self.blocked
            .write()
            .expect("block-list poisoned")
            .insert(hash.to_string());
    }

    /// Flip the claimed flag, standing in for the downstream feature that
    /// normally does this.
    pub fn set_claimed(&self, id: &str, claimed: bool) -> bool {
        let mut records = self.records.write().expect("record map poisoned");
        match records.get_mut(id) {
            Some(record) => {
                record.claimed = claimed;
                true
            }
            None => false,
        }
    }

    pub fn record_count(&self) -> usize {
        self.records.read().expect("record map poisoned").len()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn insert(&self, record: &FileRecord) -> Result<()> {
        self.records
            .write()
            .expect("record map poisoned")
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<FileRecord>> {
        Ok(self
            .records
            .read()
            .expect("record map poisoned")
            .get(id)
            .filter(|r| r.uploaded_at != 0)
            .cloned())
    }

    async fn find_by_content(
        &self,
        hash: &str,
        bucket: BucketCategory,
    ) -> Result<Option<FileRecord>> {
        Ok(self
            .records
            .read()
            .expect("record map poisoned")
            .values()
            .find(|r| r.hash == hash && r.bucket == bucket)
            .cloned())
    }

    async fn count_by_content(&self, hash: &str, bucket: BucketCategory) -> Result<i64> {
        Ok(self
            .records
            .read()
            .expect("record map poisoned")
            .values()
            .filter(|r| r.hash == hash && r.bucket == bucket)
            .count() as i64)
    }

    async fn find_expired(&self, cutoff: i64) -> Result<Vec<FileRecord>> {
        Ok(self
            .records
            .read()
            .expect("record map poisoned")
            .values()
            .filter(|r| !r.claimed && r.uploaded_at < cutoff)
            .cloned()
            .collect())
    }

    async fn set_thumbnail_mime(
        &self,
        hash: &str,
        bucket: BucketCategory,
        mime: &str,
    ) -> Result<u64> {
        let mut records = self.records.write().expect("record map poisoned");
        let mut updated = 0;
        for record in records.values_mut() {
            if record.hash == hash && record.bucket == bucket {
                record.thumbnail_mime = Some(mime.to_string());
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn delete_by_id(&self, id: &str) -> Result<()> {
        self.records
            .write()
            .expect("record map poisoned")
            .remove(id);
        Ok(())
    }

    async fn is_blocked(&self, hash: &str) -> Result<bool> {
        Ok(self
            .blocked
            .read()
            .expect("block-list poisoned")
            .contains(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, hash: &str, bucket: BucketCategory, uploaded_at: i64) -> FileRecord {
        FileRecord {
            id: id.to_string(),
            hash: hash.to_string(),
            bucket,
            mime: "image/webp".to_string(),
            thumbnail_mime: None,
            size: 42,
            filename: "f.webp".to_string(),
            width: Some(10),
            height: Some(10),
            upload_region: "us-east".to_string(),
            uploaded_by: "tester".to_string(),
            uploaded_at,
            claimed: false,
        }
    }

    #[tokio::test]
    async fn test_uncommitted_records_invisible() {
        let store = InMemoryMetadataStore::new();
        store
            .insert(&record("a", "h", BucketCategory::Icons, 0))
            .await
            .unwrap();
        assert!(store.find_by_id("a").await.unwrap().is_none());

        store
            .insert(&record("b", "h", BucketCategory::Icons, 100))
            .await
            .unwrap();
        assert!(store.find_by_id("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_thumbnail_mime_propagates_to_all_matches() {
        let store = InMemoryMetadataStore::new();
        store
            .insert(&record("a", "h", BucketCategory::Attachments, 1))
            .await
            .unwrap();
        store
            .insert(&record("b", "h", BucketCategory::Attachments, 2))
            .await
            .unwrap();
        store
            .insert(&record("c", "other", BucketCategory::Attachments, 3))
            .await
            .unwrap();

        let updated = store
            .set_thumbnail_mime("h", BucketCategory::Attachments, "image/webp")
            .await
            .unwrap();
        assert_eq!(updated, 2);

        let a = store.find_by_id("a").await.unwrap().unwrap();
        let b = store.find_by_id("b").await.unwrap().unwrap();
        let c = store.find_by_id("c").await.unwrap().unwrap();
        assert_eq!(a.thumbnail_mime.as_deref(), Some("image/webp"));
        assert_eq!(b.thumbnail_mime.as_deref(), Some("image/webp"));
        assert_eq!(c.thumbnail_mime, None);
    }

    #[tokio::test]
    async fn test_find_expired_skips_claimed() {
        let store = InMemoryMetadataStore::new();
        store
            .insert(&record("old", "h1", BucketCategory::Attachments, 100))
            .await
            .unwrap();
        store
            .insert(&record("claimed", "h2", BucketCategory::Attachments, 100))
            .await
            .unwrap();
        store
            .insert(&record("fresh", "h3", BucketCategory::Attachments, 10_000))
            .await
            .unwrap();
        assert!(store.set_claimed("claimed", true));

        let expired = store.find_expired(1000).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "old");
    }

    #[tokio::test]
    async fn test_block_list() {
        let store = InMemoryMetadataStore::new();
        assert!(!store.is_blocked("deadbeef").await.unwrap());
        store.block("deadbeef");
        assert!(store.is_blocked("deadbeef").await.unwrap());
    }

    #[tokio::test]
    async fn test_count_by_content() {
        let store = InMemoryMetadataStore::new();
        store
            .insert(&record("a", "h", BucketCategory::Stickers, 1))
            .await
            .unwrap();
        store
            .insert(&record("b", "h", BucketCategory::Stickers, 2))
            .await
            .unwrap();
        // Same hash in another bucket is a different object.
        store
            .insert(&record("c", "h", BucketCategory::Icons, 3))
            .await
            .unwrap();

        assert_eq!(
            store
                .count_by_content("h", BucketCategory::Stickers)
                .await
                .unwrap(),
            2
        );
        store.delete_by_id("a").await.unwrap();
        assert_eq!(
            store
                .count_by_content("h", BucketCategory::Stickers)
                .await
                .unwrap(),
            1
        );
    }
}
