//! Shared test fixtures: a fake codec backend over a tiny synthetic media
//! format, and a harness wiring the engine to in-memory stores.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use filestore::codec::{CodecBackend, ImageProbe, TranscodeOptions};
use filestore::config::UploadLimitsConfig;
use filestore::derivative::DerivativeGenerator;
use filestore::error::Result;
use filestore::ingest::IngestEngine;
use filestore::lifecycle::Lifecycle;
use filestore::metadata_store::{InMemoryMetadataStore, MetadataStore};
use filestore::model::{BucketCategory, FileRecord, Uploader};
use filestore::object_store::{BlobBackend, InMemoryBackend, ObjectStoreClient};

/// Synthetic image payload: `img <mime> <w> <h> <frames> <seed>`.
pub fn image_bytes(mime: &str, width: u32, height: u32, frames: u32, seed: &str) -> Vec<u8> {
    format!("img {mime} {width} {height} {frames} {seed}").into_bytes()
}

/// Synthetic video payload: `vid <mime> <w> <h> <seed>`.
pub fn video_bytes(mime: &str, width: u32, height: u32, seed: &str) -> Vec<u8> {
    format!("vid {mime} {width} {height} {seed}").into_bytes()
}

/// Parse the dimensions out of a stored synthetic image.
pub fn parse_dims(bytes: &[u8]) -> (u32, u32) {
    let doc = FakeMedia::parse(bytes).expect("stored object is not synthetic media");
    (doc.width, doc.height)
}

struct FakeMedia {
    kind: &'static str,
    mime: String,
    width: u32,
    height: u32,
    frames: u32,
}

impl FakeMedia {
    fn parse(bytes: &[u8]) -> anyhow::Result<Self> {
        let text = std::str::from_utf8(bytes).context("not utf-8")?;
        let mut tokens = text.split_whitespace();
        let kind = match tokens.next() {
            Some("img") => "img",
            Some("vid") => "vid",
            _ => return Err(anyhow!("not synthetic media")),
        };
        let mime = tokens.next().context("missing mime")?.to_string();
        let width = tokens.next().context("missing width")?.parse()?;
        let height = tokens.next().context("missing height")?.parse()?;
        let frames = if kind == "img" {
            tokens.next().context("missing frames")?.parse()?
        } else {
            0
        };
        Ok(Self {
            kind,
            mime,
            width,
            height,
            frames,
        })
    }

    async fn read(path: &Path) -> anyhow::Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&bytes)
    }
}

/// Scale into a square bounding box the way `magick -resize NxN` does:
/// best fit, aspect ratio preserved.
fn fit(width: u32, height: u32, bound: u32) -> (u32, u32) {
    let scale = (bound as f64 / width as f64).min(bound as f64 / height as f64);
    (
        ((width as f64 * scale).round() as u32).max(1),
        ((height as f64 * scale).round() as u32).max(1),
    )
}

fn mime_for_extension(path: &Path, fallback: &str) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some("webp") => "image/webp".to_string(),
        Some("gif") => "image/gif".to_string(),
        Some("jpg") | Some("jpeg") => "image/jpeg".to_string(),
        Some("png") => "image/png".to_string(),
        _ => fallback.to_string(),
    }
}

/// Codec backend that understands only the synthetic media format above,
/// so engine behavior is testable without real binaries.
pub struct FakeCodec;

#[async_trait]
impl CodecBackend for FakeCodec {
    async fn probe_mime(&self, path: &Path) -> Result<String> {
        match FakeMedia::read(path).await {
            Ok(doc) => Ok(doc.mime),
            Err(_) => Ok("application/octet-stream".to_string()),
        }
    }

    async fn probe_image(&self, path: &Path) -> Result<ImageProbe> {
        let doc = FakeMedia::read(path).await?;
        if doc.kind != "img" {
            return Err(anyhow!("not an image").into());
        }
        Ok(ImageProbe {
            width: doc.width,
            height: doc.height,
            frames: doc.frames,
        })
    }

    async fn probe_dimensions(&self, path: &Path) -> Result<(u32, u32)> {
        let doc = FakeMedia::read(path).await?;
        Ok((doc.width, doc.height))
    }

    async fn transcode(&self, src: &Path, dst: &Path, opts: &TranscodeOptions) -> Result<()> {
        let doc = FakeMedia::read(src).await?;
        if doc.kind != "img" {
            return Err(anyhow!("cannot transcode non-image").into());
        }
        let (width, height) = match opts.resize {
            Some(bound) => fit(doc.width, doc.height, bound),
            None => (doc.width, doc.height),
        };
        let mime = mime_for_extension(dst, &doc.mime);
        // Animation survives formats that support it.
        let frames = match dst.extension().and_then(|e| e.to_str()) {
            Some("gif") | None => doc.frames,
            _ => 1,
        };
        tokio::fs::write(dst, image_bytes(&mime, width, height, frames, "transcoded"))
            .await
            .context("failed to write transcoded output")?;
        Ok(())
    }

    async fn extract_first_frame(&self, src: &Path, dst: &Path) -> Result<()> {
        let doc = FakeMedia::read(src).await?;
        if doc.kind != "vid" {
            return Err(anyhow!("cannot extract frame from non-video").into());
        }
        tokio::fs::write(
            dst,
            image_bytes("image/jpeg", doc.width, doc.height, 1, "frame"),
        )
        .await
        .context("failed to write extracted frame")?;
        Ok(())
    }
}

/// Codec whose thumbnail encodes always fail, for exercising derivative
/// subtask failures. Everything else delegates to [`FakeCodec`].
pub struct BrokenThumbnailCodec;

#[async_trait]
impl CodecBackend for BrokenThumbnailCodec {
    async fn probe_mime(&self, path: &Path) -> Result<String> {
        FakeCodec.probe_mime(path).await
    }

    async fn probe_image(&self, path: &Path) -> Result<ImageProbe> {
        FakeCodec.probe_image(path).await
    }

    async fn probe_dimensions(&self, path: &Path) -> Result<(u32, u32)> {
        FakeCodec.probe_dimensions(path).await
    }

    async fn transcode(&self, src: &Path, dst: &Path, opts: &TranscodeOptions) -> Result<()> {
        let is_thumbnail = dst
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with("thumbnail"));
        if is_thumbnail {
            return Err(anyhow!("thumbnail encoder unavailable").into());
        }
        FakeCodec.transcode(src, dst, opts).await
    }

    async fn extract_first_frame(&self, src: &Path, dst: &Path) -> Result<()> {
        FakeCodec.extract_first_frame(src, dst).await
    }
}

/// Engine plus in-memory stores, wired the way `main` wires the real ones.
pub struct Harness {
    pub metadata: Arc<InMemoryMetadataStore>,
    pub primary: Arc<InMemoryBackend>,
    pub secondary: Arc<InMemoryBackend>,
    pub engine: IngestEngine,
    pub lifecycle: Lifecycle,
    _scratch: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_codec(Arc::new(FakeCodec))
    }

    pub fn with_codec(codec: Arc<dyn CodecBackend>) -> Self {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let primary = Arc::new(InMemoryBackend::new());
        let secondary = Arc::new(InMemoryBackend::new());
        let objects = Arc::new(
            ObjectStoreClient::new(vec![
                (
                    "us-east".to_string(),
                    primary.clone() as Arc<dyn BlobBackend>,
                ),
                (
                    "eu-west".to_string(),
                    secondary.clone() as Arc<dyn BlobBackend>,
                ),
            ])
            .unwrap(),
        );
        let scratch = tempfile::tempdir().unwrap();

        let engine = IngestEngine::new(
            metadata.clone() as Arc<dyn MetadataStore>,
            objects.clone(),
            codec.clone(),
            scratch.path().to_path_buf(),
            UploadLimitsConfig::default(),
        );
        let derivatives = DerivativeGenerator::new(
            metadata.clone() as Arc<dyn MetadataStore>,
            objects.clone(),
            codec,
            scratch.path().to_path_buf(),
        );
        let lifecycle = Lifecycle::new(
            metadata.clone() as Arc<dyn MetadataStore>,
            objects,
            derivatives,
            Duration::from_secs(1800),
        );

        Self {
            metadata,
            primary,
            secondary,
            engine,
            lifecycle,
            _scratch: scratch,
        }
    }

    pub async fn ingest(
        &self,
        bucket: BucketCategory,
        bytes: &[u8],
        filename: &str,
    ) -> Result<FileRecord> {
        self.engine
            .ingest(bucket, bytes, filename, &Uploader::new("tester"))
            .await
    }
}
