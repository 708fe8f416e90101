use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::derivative::DerivativeGenerator;
use crate::error::{Error, Result};
use crate::metadata_store::MetadataStore;
use crate::model::{BucketCategory, FileRecord};
use crate::object_store::{thumbnail_key, ObjectStoreClient};

/// A fetched object ready to hand to the caller.
#[derive(Debug)]
pub struct FetchedObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Fetch, explicit deletion, and the TTL garbage collector.
///
/// Deletion is reference-counted: the canonical and thumbnail blobs are
/// only removed once no metadata record references their (hash, bucket),
/// and then from every configured region.
pub struct Lifecycle {
    metadata: Arc<dyn MetadataStore>,
    objects: Arc<ObjectStoreClient>,
    derivatives: DerivativeGenerator,
    unclaimed_ttl: Duration,
}

impl Lifecycle {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        objects: Arc<ObjectStoreClient>,
        derivatives: DerivativeGenerator,
        unclaimed_ttl: Duration,
    ) -> Self {
        Self {
            metadata,
            objects,
            derivatives,
            unclaimed_ttl,
        }
    }

    /// Fetch a file's canonical object, or its thumbnail when requested.
    ///
    /// Thumbnails only exist for image and video content; asking for one
    /// that was never generated triggers lazy generation first.
    #[instrument(skip(self))]
    pub async fn fetch(
        &self,
        file_id: &str,
        bucket: BucketCategory,
        want_thumbnail: bool,
    ) -> Result<FetchedObject> {
        let record = self
            .metadata
            .find_by_id(file_id)
            .await?
            .ok_or(Error::NotFound)?;
        if record.bucket != bucket {
            return Err(Error::NotFound);
        }

        let has_renditions =
            record.mime.starts_with("image/") || record.mime.starts_with("video/");
        if want_thumbnail && has_renditions {
            let content_type = match record.thumbnail_mime {
                Some(ref mime) => mime.clone(),
                None => self.derivatives.ensure_thumbnail(&record).await?,
            };
            let bytes = self
                .objects
                .get(bucket, &thumbnail_key(&record.hash))
                .await?;
            return Ok(FetchedObject {
                bytes,
                content_type,
            });
        }

        let bytes = self.objects.get(bucket, &record.hash).await?;
        Ok(FetchedObject {
            bytes,
            content_type: record.mime,
        })
    }

    /// Delete a record and, when it was the last reference to its
    /// (hash, bucket), the canonical and thumbnail objects in every region.
    #[instrument(skip(self))]
    pub async fn delete(&self, file_id: &str) -> Result<()> {
        let record = self
            .metadata
            .find_by_id(file_id)
            .await?
            .ok_or(Error::NotFound)?;
        self.delete_record(&record).await
    }

    async fn delete_record(&self, record: &FileRecord) -> Result<()> {
        self.metadata.delete_by_id(&record.id).await?;

        let remaining = self
            .metadata
            .count_by_content(&record.hash, record.bucket)
            .await?;
        if remaining == 0 {
            self.objects
                .delete_all_regions(record.bucket, &record.hash)
                .await;
            self.objects
                .delete_all_regions(record.bucket, &thumbnail_key(&record.hash))
                .await;
            debug!(hash = %record.hash, bucket = %record.bucket, "last reference removed, objects deleted");
        }

        metrics::counter!("filestore.files.deleted").increment(1);
        Ok(())
    }

    /// Garbage collect unclaimed records older than the TTL, running each
    /// through the same reference-counted delete path as explicit deletion.
    /// Returns the number of records removed.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let cutoff = Utc::now().timestamp() - self.unclaimed_ttl.as_secs() as i64;
        let expired = self.metadata.find_expired(cutoff).await?;

        let mut deleted = 0u64;
        for record in expired {
            self.delete_record(&record).await?;
            deleted += 1;
        }

        if deleted > 0 {
            info!(deleted, "garbage collected expired unclaimed files");
            metrics::counter!("filestore.gc.swept").increment(deleted);
        }

        Ok(deleted)
    }
}
