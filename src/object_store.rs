use anyhow::Context;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::config::RegionConfig;
use crate::error::{Error, Result};
use crate::model::{BucketCategory, THUMBNAIL_SUFFIX};

/// Object-store key of the thumbnail rendition for a content hash.
pub fn thumbnail_key(hash: &str) -> String {
    format!("{hash}{THUMBNAIL_SUFFIX}")
}

/// One region-scoped blob backend. Keys are content hashes (plus the
/// thumbnail suffix for derivatives), namespaced by bucket category.
#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// Upload a file, returning the number of bytes stored.
    async fn put(
        &self,
        bucket: BucketCategory,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<i64>;

    /// Download an object. `Error::NotFound` when the key does not exist.
    async fn get(&self, bucket: BucketCategory, key: &str) -> Result<Vec<u8>>;

    /// Delete an object. Deleting a missing key is not an error.
    async fn delete(&self, bucket: BucketCategory, key: &str) -> Result<()>;
}

/// Region-keyed blob store client.
///
/// Backends are held in a fixed priority order: all writes and primary
/// reads target the first (primary) region; deletion fans out to every
/// region best-effort.
pub struct ObjectStoreClient {
    regions: Vec<(String, Arc<dyn BlobBackend>)>,
}

impl ObjectStoreClient {
    pub fn new(regions: Vec<(String, Arc<dyn BlobBackend>)>) -> Result<Self> {
        if regions.is_empty() {
            return Err(Error::TransientIo(anyhow::anyhow!(
                "at least one object store region must be configured"
            )));
        }
        Ok(Self { regions })
    }

    /// Name of the primary region, recorded on File records.
    pub fn primary_region(&self) -> &str {
        &self.regions[0].0
    }

    fn primary(&self) -> &Arc<dyn BlobBackend> {
        &self.regions[0].1
    }

    /// Upload a file to the primary region.
    pub async fn put(
        &self,
        bucket: BucketCategory,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<i64> {
        self.primary().put(bucket, key, path, content_type).await
    }

    /// Download an object from the primary region.
    pub async fn get(&self, bucket: BucketCategory, key: &str) -> Result<Vec<u8>> {
        self.primary().get(bucket, key).await
    }

    /// Delete an object from every configured region. Each attempt is
    /// independent and best-effort: a failure in one region is logged and
    /// does not block the others, and nothing is retried.
    pub async fn delete_all_regions(&self, bucket: BucketCategory, key: &str) {
        let attempts = self.regions.iter().map(|(name, backend)| async move {
            if let Err(e) = backend.delete(bucket, key).await {
                warn!(
                    region = %name,
                    bucket = %bucket,
                    key = %key,
                    error = %e,
                    "best-effort object delete failed"
                );
            }
        });
        futures::future::join_all(attempts).await;
    }
}

/// S3-backed blob backend for one region.
pub struct S3Backend {
    client: S3Client,
    region: String,
}

impl S3Backend {
    /// Create a backend for one configured region.
    pub async fn new(config: &RegionConfig) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            name = %config.name,
            region = %config.region,
            "S3 backend initialized"
        );

        Ok(Self {
            client,
            region: config.name.clone(),
        })
    }
}

#[async_trait]
impl BlobBackend for S3Backend {
    async fn put(
        &self,
        bucket: BucketCategory,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<i64> {
        let size = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len() as i64;

        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;

        self.client
            .put_object()
            .bucket(bucket.as_str())
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .context("failed to put object")?;

        debug!(
            region = %self.region,
            bucket = %bucket,
            key = %key,
            size_bytes = size,
            "object uploaded"
        );

        Ok(size)
    }

    async fn get(&self, bucket: BucketCategory, key: &str) -> Result<Vec<u8>> {
        let response = match self
            .client
            .get_object()
            .bucket(bucket.as_str())
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Err(Error::NotFound);
                }
                return Err(anyhow::Error::new(e)
                    .context("failed to get object")
                    .into());
            }
        };

        let data = response
            .body
            .collect()
            .await
            .context("failed to read object body")?;

        Ok(data.into_bytes().to_vec())
    }

    async fn delete(&self, bucket: BucketCategory, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket.as_str())
            .key(key)
            .send()
            .await
            .context("failed to delete object")?;

        debug!(region = %self.region, bucket = %bucket, key = %key, "object deleted");
        Ok(())
    }
}

/// In-memory blob backend for tests and local development.
#[derive(Default)]
pub struct InMemoryBackend {
    objects: RwLock<HashMap<(BucketCategory, String), StoredObject>>,
    puts: AtomicU64,
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of put operations observed.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn contains(&self, bucket: BucketCategory, key: &str) -> bool {
        self.objects
            .read()
            .expect("object map poisoned")
            .contains_key(&(bucket, key.to_string()))
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().expect("object map poisoned").len()
    }

    pub fn content_type(&self, bucket: BucketCategory, key: &str) -> Option<String> {
        self.objects
            .read()
            .expect("object map poisoned")
            .get(&(bucket, key.to_string()))
            .map(|o| o.content_type.clone())
    }
}

#[async_trait]
impl BlobBackend for InMemoryBackend {
    async fn put(
        &self,
        bucket: BucketCategory,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<i64> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let size = bytes.len() as i64;
        self.objects.write().expect("object map poisoned").insert(
            (bucket, key.to_string()),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(size)
    }

    async fn get(&self, bucket: BucketCategory, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .expect("object map poisoned")
            .get(&(bucket, key.to_string()))
            .map(|o| o.bytes.clone())
            .ok_or(Error::NotFound)
    }

    async fn delete(&self, bucket: BucketCategory, key: &str) -> Result<()> {
        self.objects
            .write()
            .expect("object map poisoned")
            .remove(&(bucket, key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thumbnail_key() {
        assert_eq!(thumbnail_key("abc123"), "abc123_thumbnail");
    }

    #[test]
    fn test_empty_region_list_rejected() {
        assert!(ObjectStoreClient::new(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_in_memory_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        tokio::fs::write(&path, b"payload").await.unwrap();

        let backend = InMemoryBackend::new();
        let size = backend
            .put(BucketCategory::Attachments, "h1", &path, "image/webp")
            .await
            .unwrap();
        assert_eq!(size, 7);
        assert_eq!(backend.put_count(), 1);
        assert_eq!(
            backend
                .get(BucketCategory::Attachments, "h1")
                .await
                .unwrap(),
            b"payload"
        );
        assert_eq!(
            backend.content_type(BucketCategory::Attachments, "h1"),
            Some("image/webp".to_string())
        );

        backend
            .delete(BucketCategory::Attachments, "h1")
            .await
            .unwrap();
        assert!(matches!(
            backend.get(BucketCategory::Attachments, "h1").await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_primary_writes_delete_fans_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        tokio::fs::write(&path, b"x").await.unwrap();

        let primary = Arc::new(InMemoryBackend::new());
        let secondary = Arc::new(InMemoryBackend::new());
        let client = ObjectStoreClient::new(vec![
            ("us-east".to_string(), primary.clone() as Arc<dyn BlobBackend>),
            ("eu-west".to_string(), secondary.clone() as Arc<dyn BlobBackend>),
        ])
        .unwrap();

        assert_eq!(client.primary_region(), "us-east");

        client
            .put(BucketCategory::Icons, "h2", &path, "image/webp")
            .await
            .unwrap();
        assert!(primary.contains(BucketCategory::Icons, "h2"));
        assert!(!secondary.contains(BucketCategory::Icons, "h2"));

        // Plant a replica in the secondary region and make sure the
        // all-region delete clears both.
        secondary
            .put(BucketCategory::Icons, "h2", &path, "image/webp")
            .await
            .unwrap();
        client.delete_all_regions(BucketCategory::Icons, "h2").await;
        assert!(!primary.contains(BucketCategory::Icons, "h2"));
        assert!(!secondary.contains(BucketCategory::Icons, "h2"));
    }
}
