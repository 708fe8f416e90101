use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Object-store key suffix for the thumbnail rendition of a blob.
pub const THUMBNAIL_SUFFIX: &str = "_thumbnail";

/// Bucket categories. The category namespaces the object store and is part
/// of the dedup key together with the content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketCategory {
    Icons,
    Emojis,
    Stickers,
    Attachments,
}

impl BucketCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketCategory::Icons => "icons",
            BucketCategory::Emojis => "emojis",
            BucketCategory::Stickers => "stickers",
            BucketCategory::Attachments => "attachments",
        }
    }

    /// Square bound for re-encoded assets in this bucket. Attachments keep
    /// their original dimensions.
    pub fn size_cap(&self) -> Option<u32> {
        match self {
            BucketCategory::Icons => Some(256),
            BucketCategory::Emojis => Some(128),
            BucketCategory::Stickers => Some(384),
            BucketCategory::Attachments => None,
        }
    }

    /// Buckets other than attachments only accept image content.
    pub fn requires_image(&self) -> bool {
        !matches!(self, BucketCategory::Attachments)
    }
}

impl fmt::Display for BucketCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BucketCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "icons" => Ok(BucketCategory::Icons),
            "emojis" => Ok(BucketCategory::Emojis),
            "stickers" => Ok(BucketCategory::Stickers),
            "attachments" => Ok(BucketCategory::Attachments),
            other => Err(anyhow::anyhow!("unknown bucket category: {other}")),
        }
    }
}

/// One upload event. Many records may share the same (hash, bucket); they
/// all point at the same canonical blob, and a thumbnail generated for the
/// pair belongs to every one of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Opaque identifier, unique per upload event, never reused.
    pub id: String,
    /// Lowercase hex SHA-256 of the canonical bytes.
    pub hash: String,
    pub bucket: BucketCategory,
    pub mime: String,
    /// Set once a thumbnail exists for this (hash, bucket).
    pub thumbnail_mime: Option<String>,
    /// Canonical object size in bytes.
    pub size: i64,
    /// Sanitized original filename.
    pub filename: String,
    /// Dimensions of the final encoded asset, where known.
    pub width: Option<i32>,
    pub height: Option<i32>,
    /// Region the canonical object was written to.
    pub upload_region: String,
    pub uploaded_by: String,
    /// Unix seconds. Records with a zero timestamp are not yet committed
    /// and are invisible to lookups.
    pub uploaded_at: i64,
    /// Set externally once a downstream feature references this record.
    /// Unclaimed records are garbage collected after the TTL.
    pub claimed: bool,
}

/// Resolved uploader identity, supplied by the caller's auth layer.
#[derive(Debug, Clone)]
pub struct Uploader {
    pub username: String,
    pub flags: i64,
}

/// Uploads from flagged users are re-encoded at quality 5 before hashing.
pub const FLAG_ULTRA_HD_UPLOADS: i64 = 16;

impl Uploader {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            flags: 0,
        }
    }

    pub fn has_flag(&self, flag: i64) -> bool {
        self.flags & flag != 0
    }
}

/// Generate an upload id: 18 random bytes, URL-safe base64 with the
/// non-alphanumeric alphabet characters mapped away.
pub fn generate_id() -> String {
    let mut buf = [0u8; 18];
    rand::thread_rng().fill_bytes(&mut buf);
    URL_SAFE
        .encode(buf)
        .replace('-', "a")
        .replace('_', "b")
        .replace('=', "c")
}

/// Replace every character outside `A-Za-z0-9.-_+!()$` with `_`.
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' => c,
            '.' | '-' | '_' | '+' | '!' | '(' | ')' | '$' => c,
            _ => '_',
        })
        .collect()
}
