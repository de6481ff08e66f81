use std::path::{Path, PathBuf};

use common::artifact::content_hash;
use common::{Artifact, Error, Result};
use tokio::fs;
use tracing::{error, info};

use crate::store::Store;

pub const DEFAULT_ARTIFACT_TYPE: &str = "executable";

/// Stores uploaded programs on disk and keeps their metadata in the store.
#[derive(Clone)]
pub struct ArtifactManager {
    store: Store,
    root: PathBuf,
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(Error::invalid_argument(format!("{name:?} is not a valid artifact name")));
    }
    Ok(())
}

impl ArtifactManager {
    pub fn new(store: Store, root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            root: root.into(),
        }
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates or replaces `name`. Re-uploading identical content is a no-op.
    pub async fn create_artifact(&self, name: &str, artifact_type: &str, content: &[u8]) -> Result<Artifact> {
        check_name(name)?;
        let hash = content_hash(content);
        if let Some(existing) = self.store.artifact(name) {
            if existing.hash == hash {
                return Ok(existing);
            }
        }

        fs::create_dir_all(&self.root).await?;
        let path = self.path_of(name);
        if let Err(e) = fs::write(&path, content).await {
            error!("can't write artifact {}: {}", path.display(), e);
            return Err(e.into());
        }

        let artifact = Artifact::from_content(name, artifact_type, content);
        self.store.upsert_artifact(artifact.clone());
        info!("artifact {} stored ({} bytes, sha256 {})", name, artifact.size, artifact.hash);
        Ok(artifact)
    }

    pub fn artifacts(&self) -> Vec<Artifact> {
        self.store.artifacts()
    }

    pub fn artifact(&self, name: &str) -> Result<Artifact> {
        self.store
            .artifact(name)
            .ok_or_else(|| Error::not_found(format!("{name} artifact metadata can't be found")))
    }

    /// Program bytes shipped to the workers.
    pub async fn content(&self, name: &str) -> Result<Vec<u8>> {
        check_name(name)?;
        let path = self.path_of(name);
        fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(format!("artifact file {}", path.display())),
            _ => Error::internal(format!("{}: {e}", path.display())),
        })
    }

    pub async fn delete_artifact(&self, name: &str) -> Result<Artifact> {
        let artifact = self.artifact(name)?;
        let path = self.path_of(name);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("artifact file {} was already gone", path.display());
            }
            Err(e) => return Err(e.into()),
        }
        self.store.remove_artifact(name);
        Ok(artifact)
    }
}
