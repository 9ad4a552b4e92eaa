//! Hash-addressed immutable storage for serialized generations.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

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

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `<namespace>/<YYYYMMDD>/<HHMMSS>-<hash>.json`
    pub fn relative_path_for(
        &self,
        namespace: &str,
        recorded_at: DateTime<Utc>,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(namespace)
            .join(recorded_at.format("%Y%m%d").to_string())
            .join(format!("{}-{content_hash}.json", recorded_at.format("%H%M%S")))
    }

    /// Writes `value` as pretty JSON via temp-file + rename; identical content
    /// at the same instant resolves to the existing file.
    pub async fn store_json<T: Serialize>(
        &self,
        namespace: &str,
        recorded_at: DateTime<Utc>,
        value: &T,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing {namespace} artifact"))?;
        let content_hash = Self::sha256_hex(&bytes);
        let relative_path = self.relative_path_for(namespace, recorded_at, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let artifact = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(artifact(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp artifact file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(artifact(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(artifact(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }

    pub async fn load_json<T: DeserializeOwned>(&self, relative_path: &Path) -> anyhow::Result<T> {
        let path = self.root.join(relative_path);
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading artifact {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing artifact {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gigfeed_core::TrendingGeneration;
    use tempfile::tempdir;

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_generations_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let recorded_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let generation = TrendingGeneration {
            window_hours: 24,
            ..TrendingGeneration::default()
        };

        let first = store.store_json("trending", recorded_at, &generation).await.expect("first");
        let second = store.store_json("trending", recorded_at, &generation).await.expect("second");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("trending/20260224"));

        let loaded: TrendingGeneration = store.load_json(&first.relative_path).await.expect("load");
        assert_eq!(loaded, generation);
    }
}
