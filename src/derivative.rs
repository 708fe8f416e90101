use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::codec::{CodecBackend, TranscodeOptions};
use crate::error::{Error, Result};
use crate::metadata_store::MetadataStore;
use crate::model::FileRecord;
use crate::object_store::{thumbnail_key, ObjectStoreClient};
use crate::scratch::ScratchDir;

/// Thumbnails are bounded to this many pixels on the long axis.
pub const THUMBNAIL_BOUND: u32 = 480;

/// Bounding box for a thumbnail: the larger source axis, capped at 480.
/// Never upscales.
pub fn thumbnail_bound(width: u32, height: u32) -> u32 {
    width.max(height).min(THUMBNAIL_BOUND)
}

/// Encoded format for image renditions: webp for stills, gif when the
/// source is animated.
pub fn animation_format(frames: u32) -> (&'static str, &'static str) {
    if frames == 1 {
        ("webp", "image/webp")
    } else {
        ("gif", "image/gif")
    }
}

/// Generates thumbnail renditions after ingestion.
///
/// Eager generation for attachments happens inline in the ingest engine;
/// this type covers the lazy path, where a read request asks for a
/// thumbnail that was never produced. Concurrent lazy requests for the
/// same (hash, bucket) are not de-duplicated; the duplicate work lands on
/// the same object key, so the overwrite is idempotent.
pub struct DerivativeGenerator {
    metadata: Arc<dyn MetadataStore>,
    objects: Arc<ObjectStoreClient>,
    codec: Arc<dyn CodecBackend>,
    scratch_root: PathBuf,
}

impl DerivativeGenerator {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        objects: Arc<ObjectStoreClient>,
        codec: Arc<dyn CodecBackend>,
        scratch_root: PathBuf,
    ) -> Self {
        Self {
            metadata,
            objects,
            codec,
            scratch_root,
        }
    }

    /// Generate the shared thumbnail for a record's (hash, bucket) and
    /// record its MIME on every record sharing that pair. Returns the
    /// thumbnail MIME.
    #[instrument(skip(self, record), fields(id = %record.id, hash = %record.hash, bucket = %record.bucket))]
    pub async fn ensure_thumbnail(&self, record: &FileRecord) -> Result<String> {
        if let Some(ref mime) = record.thumbnail_mime {
            return Ok(mime.clone());
        }

        let is_video = record.mime.starts_with("video/");
        if !is_video && !record.mime.starts_with("image/") {
            return Err(Error::Unsupported);
        }

        let scratch =
            ScratchDir::create(&self.scratch_root, &format!("{}-thumbnail", record.id)).await?;

        // Pull the canonical object down to scratch storage.
        let canonical = scratch.file("canonical");
        let bytes = self.objects.get(record.bucket, &record.hash).await?;
        tokio::fs::write(&canonical, &bytes)
            .await
            .context("failed to write canonical object to scratch")?;

        // Same per-MIME policy as ingestion: videos thumbnail their first
        // frame as webp, images follow the animation-aware format rule.
        let (source, format, mime, bound) = if is_video {
            let frame = scratch.file("first_frame.jpg");
            self.codec.extract_first_frame(&canonical, &frame).await?;
            let (width, height) = self.codec.probe_dimensions(&frame).await?;
            (frame, "webp", "image/webp", thumbnail_bound(width, height))
        } else {
            let probe = self.codec.probe_image(&canonical).await?;
            let (format, mime) = animation_format(probe.frames);
            (
                canonical,
                format,
                mime,
                thumbnail_bound(probe.width, probe.height),
            )
        };

        let thumbnail = scratch.file(&format!("thumbnail.{format}"));
        self.codec
            .transcode(
                &source,
                &thumbnail,
                &TranscodeOptions {
                    resize: Some(bound),
                    ..Default::default()
                },
            )
            .await?;

        self.objects
            .put(
                record.bucket,
                &thumbnail_key(&record.hash),
                &thumbnail,
                mime,
            )
            .await?;

        // Thumbnail existence is a property of the content, so every upload
        // event sharing (hash, bucket) gets the MIME in one update.
        let updated = self
            .metadata
            .set_thumbnail_mime(&record.hash, record.bucket, mime)
            .await?;
        debug!(updated, "thumbnail mime propagated");

        info!("thumbnail generated lazily");
        metrics::counter!("filestore.thumbnails.lazy_generated").increment(1);

        Ok(mime.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thumbnail_bound() {
        assert_eq!(thumbnail_bound(1000, 500), 480);
        assert_eq!(thumbnail_bound(500, 1000), 480);
        assert_eq!(thumbnail_bound(320, 240), 320);
        assert_eq!(thumbnail_bound(480, 480), 480);
    }

    #[test]
    fn test_animation_format() {
        assert_eq!(animation_format(1), ("webp", "image/webp"));
        assert_eq!(animation_format(2), ("gif", "image/gif"));
        assert_eq!(animation_format(10), ("gif", "image/gif"));
    }
}
