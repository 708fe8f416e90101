use anyhow::Context;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::Result;

/// Per-operation scratch directory holding the original upload and any
/// intermediate derivative files.
///
/// Each directory is exclusively owned by one ingest or thumbnail operation
/// and is removed when the guard drops, on every exit path.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Create `<root>/<name>`, creating the root if needed.
    pub async fn create(root: &Path, name: &str) -> Result<Self> {
        let path = root.join(name);
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("failed to create scratch directory {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a named file inside the scratch directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to remove scratch directory"
                );
            }
        }
    }
}
