use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{PlatformError, PlatformResult};

/// Tenant program files on disk, one per upload or generation.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `source` as `{owner}_{name}_{timestamp}_{nonce}.{ext}` and return its path.
    pub async fn store(
        &self,
        owner_id: i64,
        name: &str,
        extension: &str,
        source: &str,
    ) -> PlatformResult<PathBuf> {
        fs::create_dir_all(&self.root).await?;
        let file_name = format!(
            "{owner_id}_{}_{}_{}.{extension}",
            sanitize(name),
            Utc::now().format("%Y%m%d%H%M%S%3f"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let path = self.root.join(file_name);
        fs::write(&path, source).await?;
        debug!("stored artifact {}", path.display());
        Ok(path)
    }

    pub async fn read(&self, location: &Path) -> PlatformResult<String> {
        match fs::read_to_string(location).await {
            Ok(source) => Ok(source),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let name = location.file_name().unwrap_or_default().to_string_lossy();
                Err(PlatformError::NotFound(format!("artifact {name}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, location: &Path) -> bool {
        fs::try_exists(location).await.unwrap_or(false)
    }

    /// Best effort; a missing file is not an error.
    pub async fn remove(&self, location: &Path) {
        if let Err(e) = fs::remove_file(location).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove artifact {}: {e}", location.display());
            }
        }
    }
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .take(48)
        .collect();
    if cleaned.is_empty() { "bot".to_string() } else { cleaned }
}
