use anyhow::Context;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, instrument};

use crate::codec::{CodecBackend, TranscodeOptions};
use crate::config::UploadLimitsConfig;
use crate::derivative::{animation_format, thumbnail_bound};
use crate::error::{Error, Result};
use crate::metadata_store::MetadataStore;
use crate::model::{
    generate_id, sanitize_filename, BucketCategory, FileRecord, Uploader, FLAG_ULTRA_HD_UPLOADS,
};
use crate::object_store::{thumbnail_key, ObjectStoreClient};
use crate::scratch::ScratchDir;

/// Outcome of processing new content: everything derived from the bytes
/// that ends up on the record.
struct ProcessedAsset {
    mime: String,
    thumbnail_mime: Option<String>,
    size: i64,
    width: Option<i32>,
    height: Option<i32>,
}

/// File ingestion engine: hashing, dedup resolution, and bucket-specific
/// transform dispatch.
///
/// Store and codec backends are long-lived, concurrency-safe singletons
/// injected at construction; one engine serves any number of concurrent
/// ingest operations.
pub struct IngestEngine {
    metadata: Arc<dyn MetadataStore>,
    objects: Arc<ObjectStoreClient>,
    codec: Arc<dyn CodecBackend>,
    scratch_root: PathBuf,
    limits: UploadLimitsConfig,
}

impl IngestEngine {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        objects: Arc<ObjectStoreClient>,
        codec: Arc<dyn CodecBackend>,
        scratch_root: PathBuf,
        limits: UploadLimitsConfig,
    ) -> Self {
        Self {
            metadata,
            objects,
            codec,
            scratch_root,
            limits,
        }
    }

    /// Ingest an upload into a bucket.
    ///
    /// Identical bytes uploaded to the same bucket dedup to the existing
    /// canonical blob: the returned record gets a fresh id, uploader, and
    /// timestamp but clones the derived attributes, and nothing is written
    /// to the object store.
    #[instrument(skip(self, data, original_filename, uploader), fields(bucket = %bucket, uploader = %uploader.username))]
    pub async fn ingest<R>(
        &self,
        bucket: BucketCategory,
        data: R,
        original_filename: &str,
        uploader: &Uploader,
    ) -> Result<FileRecord>
    where
        R: AsyncRead + Unpin + Send,
    {
        let id = generate_id();
        let scratch = ScratchDir::create(&self.scratch_root, &id).await?;
        let original = scratch.file("original");

        self.save_upload(bucket, data, &original).await?;

        if uploader.has_flag(FLAG_ULTRA_HD_UPLOADS) {
            self.ultra_hd_preprocess(&scratch, &original).await?;
        }

        // Content addressing happens on the canonical (post-preprocess)
        // bytes.
        let hash = hash_file(&original).await?;

        if self.metadata.is_blocked(&hash).await? {
            return Err(Error::Blocked);
        }

        let now = Utc::now().timestamp();
        let filename = {
            let sanitized = sanitize_filename(original_filename);
            if sanitized.is_empty() {
                id.clone()
            } else {
                sanitized
            }
        };

        // Dedup fast path: the blob already exists for this (hash, bucket),
        // so only a metadata record is created.
        if let Some(existing) = self.metadata.find_by_content(&hash, bucket).await? {
            let record = FileRecord {
                id,
                filename,
                uploaded_by: uploader.username.clone(),
                uploaded_at: now,
                claimed: false,
                ..existing
            };
            self.metadata.insert(&record).await?;

            debug!(id = %record.id, hash = %record.hash, "duplicate content, cloned existing record");
            metrics::counter!("filestore.files.deduplicated").increment(1);
            return Ok(record);
        }

        let asset = self.process_new(&scratch, &hash, bucket).await?;

        let record = FileRecord {
            id,
            hash,
            bucket,
            mime: asset.mime,
            thumbnail_mime: asset.thumbnail_mime,
            size: asset.size,
            filename,
            width: asset.width,
            height: asset.height,
            upload_region: self.objects.primary_region().to_string(),
            uploaded_by: uploader.username.clone(),
            uploaded_at: now,
            claimed: false,
        };

        self.metadata.insert(&record).await?;

        info!(
            id = %record.id,
            hash = %record.hash,
            region = %record.upload_region,
            "file ingested"
        );
        metrics::counter!("filestore.files.ingested").increment(1);

        Ok(record)
    }

    /// Save the upload into scratch, enforcing the bucket's size cap before
    /// any hashing or store work.
    async fn save_upload<R>(&self, bucket: BucketCategory, data: R, original: &Path) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let cap = self.limits.max_bytes(bucket);
        let mut limited = data.take(cap + 1);
        let mut dst = tokio::fs::File::create(original)
            .await
            .context("failed to create scratch file")?;
        let written = tokio::io::copy(&mut limited, &mut dst)
            .await
            .context("failed to save upload to scratch")?;
        if written > cap {
            return Err(Error::Unsupported);
        }
        Ok(())
    }

    /// Re-encode image uploads from flagged users at quality 5 before
    /// anything else sees the bytes.
    async fn ultra_hd_preprocess(&self, scratch: &ScratchDir, original: &Path) -> Result<()> {
        let mime = self.codec.probe_mime(original).await?;
        if !mime.starts_with("image/") {
            return Ok(());
        }
        let crushed = scratch.file("original.jpg");
        self.codec
            .transcode(original, &crushed, &TranscodeOptions::quality(5))
            .await?;
        tokio::fs::rename(&crushed, original)
            .await
            .context("failed to replace original with preprocessed copy")?;
        Ok(())
    }

    /// Transform dispatch for content not seen before: route on (bucket,
    /// detected MIME), upload the canonical object, and produce the
    /// derivative where the policy calls for one.
    async fn process_new(
        &self,
        scratch: &ScratchDir,
        hash: &str,
        bucket: BucketCategory,
    ) -> Result<ProcessedAsset> {
        let original = scratch.file("original");
        let mime = self.codec.probe_mime(&original).await?;

        let probe = if mime.starts_with("image/") {
            Some(self.codec.probe_image(&original).await?)
        } else {
            None
        };

        if bucket.requires_image() {
            let Some(probe) = probe else {
                return Err(Error::Unsupported);
            };
            return self
                .process_media_asset(scratch, hash, bucket, probe.width, probe.height, probe.frames)
                .await;
        }

        match probe {
            Some(probe) => {
                self.process_attachment_image(
                    scratch,
                    hash,
                    bucket,
                    mime,
                    probe.width,
                    probe.height,
                    probe.frames,
                )
                .await
            }
            None if mime.starts_with("video/") => {
                self.process_attachment_video(scratch, hash, bucket, mime)
                    .await
            }
            None => self.process_attachment_raw(scratch, hash, bucket, mime).await,
        }
    }

    /// icon/emoji/sticker: the re-encoded, metadata-stripped, resized asset
    /// itself is canonical; no derivative exists.
    async fn process_media_asset(
        &self,
        scratch: &ScratchDir,
        hash: &str,
        bucket: BucketCategory,
        width: u32,
        height: u32,
        frames: u32,
    ) -> Result<ProcessedAsset> {
        let (format, mime) = animation_format(frames);
        let cap = bucket
            .size_cap()
            .expect("media buckets always have a size cap");
        let bound = square_bound(cap, width, height);

        let encoded = scratch.file(&format!("encoded.{format}"));
        self.codec
            .transcode(
                &scratch.file("original"),
                &encoded,
                &TranscodeOptions {
                    quality: Some(90),
                    resize: Some(bound),
                    strip_metadata: true,
                },
            )
            .await?;

        // Canonical upload and the dimension re-probe run as independent
        // tasks; the record is assembled only after both join.
        let upload = {
            let objects = self.objects.clone();
            let encoded = encoded.clone();
            let hash = hash.to_string();
            tokio::spawn(async move { objects.put(bucket, &hash, &encoded, mime).await })
        };
        let reprobe = {
            let codec = self.codec.clone();
            tokio::spawn(async move { codec.probe_dimensions(&encoded).await })
        };

        let (upload_res, reprobe_res) = tokio::join!(upload, reprobe);
        let size = join_task(upload_res)?;
        let (width, height) = join_task(reprobe_res)?;

        Ok(ProcessedAsset {
            mime: mime.to_string(),
            thumbnail_mime: None,
            size,
            width: Some(width as i32),
            height: Some(height as i32),
        })
    }

    /// attachment + image: metadata-stripped re-encode is canonical, plus
    /// an eager thumbnail bounded to 480px on the long axis.
    #[allow(clippy::too_many_arguments)]
    async fn process_attachment_image(
        &self,
        scratch: &ScratchDir,
        hash: &str,
        bucket: BucketCategory,
        mime: String,
        width: u32,
        height: u32,
        frames: u32,
    ) -> Result<ProcessedAsset> {
        let optimized = scratch.file("optimized");
        self.codec
            .transcode(
                &scratch.file("original"),
                &optimized,
                &TranscodeOptions {
                    quality: Some(90),
                    strip_metadata: true,
                    ..Default::default()
                },
            )
            .await?;

        let (thumb_format, thumb_mime) = animation_format(frames);
        let bound = thumbnail_bound(width, height);

        let upload = {
            let objects = self.objects.clone();
            let optimized = optimized.clone();
            let hash = hash.to_string();
            let mime = mime.clone();
            tokio::spawn(async move { objects.put(bucket, &hash, &optimized, &mime).await })
        };
        let thumbnail = {
            let objects = self.objects.clone();
            let codec = self.codec.clone();
            let thumb = scratch.file(&format!("thumbnail.{thumb_format}"));
            let key = thumbnail_key(hash);
            tokio::spawn(async move {
                codec
                    .transcode(
                        &optimized,
                        &thumb,
                        &TranscodeOptions {
                            resize: Some(bound),
                            ..Default::default()
                        },
                    )
                    .await?;
                objects.put(bucket, &key, &thumb, thumb_mime).await?;
                Ok::<_, Error>(())
            })
        };

        let (upload_res, thumbnail_res) = tokio::join!(upload, thumbnail);
        let size = join_task(upload_res)?;
        join_task(thumbnail_res)?;

        Ok(ProcessedAsset {
            mime,
            thumbnail_mime: Some(thumb_mime.to_string()),
            size,
            width: Some(width as i32),
            height: Some(height as i32),
        })
    }

    /// attachment + video: original bytes are canonical, the thumbnail is
    /// derived from the first decoded frame, and record dimensions come
    /// from that frame.
    async fn process_attachment_video(
        &self,
        scratch: &ScratchDir,
        hash: &str,
        bucket: BucketCategory,
        mime: String,
    ) -> Result<ProcessedAsset> {
        let upload = {
            let objects = self.objects.clone();
            let original = scratch.file("original");
            let hash = hash.to_string();
            let mime = mime.clone();
            tokio::spawn(async move { objects.put(bucket, &hash, &original, &mime).await })
        };

        // Frame extraction happens alongside the canonical upload; its
        // failure must not cancel the in-flight sibling, so the error is
        // held until both have finished.
        let frame = scratch.file("first_frame.jpg");
        let frame_res: Result<(u32, u32)> = async {
            self.codec
                .extract_first_frame(&scratch.file("original"), &frame)
                .await?;
            self.codec.probe_dimensions(&frame).await
        }
        .await;

        let thumbnail_res = match &frame_res {
            Ok((width, height)) => {
                let bound = thumbnail_bound(*width, *height);
                let thumb = scratch.file("thumbnail.webp");
                let handle = {
                    let objects = self.objects.clone();
                    let codec = self.codec.clone();
                    let frame = frame.clone();
                    let key = thumbnail_key(hash);
                    tokio::spawn(async move {
                        codec
                            .transcode(
                                &frame,
                                &thumb,
                                &TranscodeOptions {
                                    resize: Some(bound),
                                    ..Default::default()
                                },
                            )
                            .await?;
                        objects.put(bucket, &key, &thumb, "image/webp").await?;
                        Ok::<_, Error>(())
                    })
                };
                Some(handle.await)
            }
            Err(_) => None,
        };

        let size = join_task(upload.await)?;
        let (width, height) = frame_res?;
        if let Some(res) = thumbnail_res {
            join_task(res)?;
        }

        Ok(ProcessedAsset {
            mime,
            thumbnail_mime: Some("image/webp".to_string()),
            size,
            width: Some(width as i32),
            height: Some(height as i32),
        })
    }

    /// attachment + anything else: original bytes stored unmodified, no
    /// derivative, no dimensions.
    async fn process_attachment_raw(
        &self,
        scratch: &ScratchDir,
        hash: &str,
        bucket: BucketCategory,
        mime: String,
    ) -> Result<ProcessedAsset> {
        let size = self
            .objects
            .put(bucket, hash, &scratch.file("original"), &mime)
            .await?;

        Ok(ProcessedAsset {
            mime,
            thumbnail_mime: None,
            size,
            width: None,
            height: None,
        })
    }
}

/// Square bound for re-encoded media assets: the bucket cap, further
/// bounded by the smaller source axis so content is never upscaled.
fn square_bound(cap: u32, width: u32, height: u32) -> u32 {
    cap.min(width).min(height)
}

/// Unwrap a joined subtask, folding a panic into the transient taxonomy.
fn join_task<T>(
    joined: std::result::Result<Result<T>, tokio::task::JoinError>,
) -> Result<T> {
    match joined {
        Ok(inner) => inner,
        Err(e) => Err(Error::TransientIo(
            anyhow::Error::new(e).context("ingest subtask failed to join"),
        )),
    }
}

/// Streaming SHA-256 over a scratch file, as a lowercase hex digest.
async fn hash_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .context("failed to read file for hashing")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_square_bound_never_upscales() {
        assert_eq!(square_bound(256, 1000, 800), 256);
        assert_eq!(square_bound(256, 100, 800), 100);
        assert_eq!(square_bound(256, 800, 100), 100);
        assert_eq!(square_bound(128, 64, 48), 48);
    }

    #[tokio::test]
    async fn test_hash_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        tokio::fs::write(&path, b"hello world").await.unwrap();
        assert_eq!(
            hash_file(&path).await.unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
