//! Filestore
//!
//! Content-addressed file ingestion and lifecycle engine. Uploaded bytes
//! are hashed, deduplicated per (hash, bucket), transformed per bucket
//! policy, stored in a region-scoped blob store, and garbage collected
//! when no downstream feature ever claims them.
//!
//! ## Features
//!
//! - **Content addressing**: identical bytes uploaded to the same bucket
//!   share one canonical blob, keyed by SHA-256, however many upload
//!   events point at it
//! - **Bucket policies**: icons/emojis/stickers are re-encoded and
//!   square-bounded; attachment images get an optimized canonical plus an
//!   eager thumbnail; videos keep their original bytes and thumbnail the
//!   first frame; everything else is stored as-is
//! - **Lazy derivatives**: a thumbnail asked for before it exists is
//!   generated on first read and attributed to every record sharing the
//!   content
//! - **Reference-counted cleanup**: blobs are removed from every region
//!   once the last record referencing them is deleted, explicitly or by
//!   the TTL sweep
//!
//! ## Architecture
//!
//! ```text
//! upload bytes                 Object Store              PostgreSQL
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Hasher &     │           │ {bucket}/    │          │ files        │
//! │ Dedup        │──────────▶│   {hash}     │          │ blocked_files│
//! └──────────────┘  (miss)   │   {hash}_    │          └──────────────┘
//!        │                   │   thumbnail  │                 ▲
//!        ▼                   └──────────────┘                 │
//! ┌──────────────┐                  ▲                         │
//! │ Transform    │──── fork/join ───┘                         │
//! │ Dispatcher   │──────────────────────────── insert ────────┤
//! └──────────────┘                                            │
//! ┌──────────────┐                                            │
//! │ GC sweep     │──── refcount, delete all regions ──────────┘
//! └──────────────┘
//! ```

pub mod codec;
pub mod config;
pub mod derivative;
pub mod error;
pub mod ingest;
pub mod lifecycle;
pub mod metadata_store;
pub mod model;
pub mod object_store;
pub mod scratch;

pub use codec::{CodecBackend, ImageProbe, ShellCodec, TranscodeOptions};
pub use config::Config;
pub use derivative::{thumbnail_bound, DerivativeGenerator, THUMBNAIL_BOUND};
pub use error::{Error, Result};
pub use ingest::IngestEngine;
pub use lifecycle::{FetchedObject, Lifecycle};
pub use metadata_store::{InMemoryMetadataStore, MetadataStore, PgMetadataStore};
pub use model::{
    generate_id, sanitize_filename, BucketCategory, FileRecord, Uploader, FLAG_ULTRA_HD_UPLOADS,
    THUMBNAIL_SUFFIX,
};
pub use object_store::{
    thumbnail_key, BlobBackend, InMemoryBackend, ObjectStoreClient, S3Backend,
};
pub use scratch::ScratchDir;
