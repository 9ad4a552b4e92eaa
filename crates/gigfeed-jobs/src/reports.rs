//! Run reports: per-run summaries, Parquet snapshot exports and
//! hash-addressed generation artifacts.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use gigfeed_core::{FeatureGeneration, SimilarityKind};
use gigfeed_storage::{ArtifactStore, StoredArtifact};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::orchestrator::RunSummary;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub generation_id: Uuid,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

#[derive(Debug, Clone)]
pub struct ReportWriter {
    reports_dir: PathBuf,
    artifacts: ArtifactStore,
}

impl ReportWriter {
    pub fn new(reports_dir: impl Into<PathBuf>, artifacts: ArtifactStore) -> Self {
        Self {
            reports_dir: reports_dir.into(),
            artifacts,
        }
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.reports_dir.join(run_id.to_string())
    }

    pub async fn write_run_summary(&self, summary: &RunSummary) -> Result<PathBuf> {
        let run_dir = self.run_dir(summary.run_id);
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;
        let path = run_dir.join("run_summary.json");
        let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    /// Exports the feature generation as Parquet tables plus a sha256 manifest.
    pub async fn export_feature_snapshot(&self, run_id: Uuid, generation: &FeatureGeneration) -> Result<PathBuf> {
        let run_dir = self.run_dir(run_id);
        let snapshot_dir = run_dir.join("snapshots");
        fs::create_dir_all(&snapshot_dir)
            .await
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;

        let vectors_path = snapshot_dir.join("feature_vectors.parquet");
        let similarities_path = snapshot_dir.join("similarities.parquet");
        let vector_rows = write_feature_vectors_parquet(&vectors_path, generation)?;
        let similarity_rows = write_similarities_parquet(&similarities_path, generation)?;

        let manifest = ParquetManifest {
            schema_version: 1,
            generation_id: generation.generation_id,
            files: vec![
                manifest_entry("feature_vectors", &run_dir, &vectors_path, vector_rows)?,
                manifest_entry("similarities", &run_dir, &similarities_path, similarity_rows)?,
            ],
        };
        let manifest_path = snapshot_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;
        Ok(manifest_path)
    }

    pub async fn store_generation<T: Serialize>(
        &self,
        namespace: &str,
        generation: &T,
        recorded_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<StoredArtifact> {
        self.artifacts.store_json(namespace, recorded_at, generation).await
    }
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_feature_vectors_parquet(path: &Path, generation: &FeatureGeneration) -> Result<usize> {
    let rows: Vec<(String, u32, f64, u64, f64)> = generation
        .feature_vectors
        .values()
        .flat_map(|v| {
            v.tag_weights.iter().map(move |(tag, weight)| {
                (
                    v.user_uid.to_string(),
                    *tag,
                    *weight,
                    v.interaction_count as u64,
                    v.activity_level,
                )
            })
        })
        .collect();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("user_uid", DataType::Utf8, false),
        ArrowField::new("tag_id", DataType::UInt32, false),
        ArrowField::new("weight", DataType::Float64, false),
        ArrowField::new("interaction_count", DataType::UInt64, false),
        ArrowField::new("activity_level", DataType::Float64, false),
    ]));
    let user_uids = StringArray::from(rows.iter().map(|r| Some(r.0.as_str())).collect::<Vec<_>>());
    let tag_ids = UInt32Array::from(rows.iter().map(|r| r.1).collect::<Vec<_>>());
    let weights = Float64Array::from(rows.iter().map(|r| r.2).collect::<Vec<_>>());
    let counts = UInt64Array::from(rows.iter().map(|r| r.3).collect::<Vec<_>>());
    let activity = Float64Array::from(rows.iter().map(|r| r.4).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(user_uids),
            Arc::new(tag_ids),
            Arc::new(weights),
            Arc::new(counts),
            Arc::new(activity),
        ],
    )
    .context("building feature_vectors record batch")?;
    write_parquet(path, batch)?;
    Ok(rows.len())
}

fn write_similarities_parquet(path: &Path, generation: &FeatureGeneration) -> Result<usize> {
    let entries: Vec<_> = generation
        .user_neighbors
        .values()
        .chain(generation.item_neighbors.values())
        .flatten()
        .collect();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("subject_id", DataType::Utf8, false),
        ArrowField::new("neighbor_id", DataType::Utf8, false),
        ArrowField::new("kind", DataType::Utf8, false),
        ArrowField::new("score", DataType::Float64, false),
    ]));
    let subjects = StringArray::from(
        entries
            .iter()
            .map(|e| Some(e.subject_id.to_string()))
            .collect::<Vec<_>>(),
    );
    let neighbors = StringArray::from(
        entries
            .iter()
            .map(|e| Some(e.neighbor_id.to_string()))
            .collect::<Vec<_>>(),
    );
    let kinds = StringArray::from(
        entries
            .iter()
            .map(|e| {
                Some(match e.kind {
                    SimilarityKind::UserUser => "user_user",
                    SimilarityKind::ItemItem => "item_item",
                })
            })
            .collect::<Vec<_>>(),
    );
    let scores = Float64Array::from(entries.iter().map(|e| e.score).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(subjects),
            Arc::new(neighbors),
            Arc::new(kinds),
            Arc::new(scores),
        ],
    )
    .context("building similarities record batch")?;
    write_parquet(path, batch)?;
    Ok(entries.len())
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: ArtifactStore::sha256_hex(&bytes),
        bytes: bytes.len() as u64,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gigfeed_core::{SimilarityEntry, UserFeatureVector};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn sample_generation() -> FeatureGeneration {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let vector = |uid| UserFeatureVector {
            user_uid: uid,
            tag_weights: BTreeMap::from([(1, 2.0), (7, 0.5)]),
            interaction_count: 3,
            activity_level: 0.03,
        };
        FeatureGeneration {
            generation_id: Uuid::new_v4(),
            feature_vectors: BTreeMap::from([(a, vector(a)), (b, vector(b))]),
            user_neighbors: BTreeMap::from([(
                a,
                vec![SimilarityEntry {
                    subject_id: a,
                    neighbor_id: b,
                    kind: SimilarityKind::UserUser,
                    score: 1.0,
                }],
            )]),
            ..FeatureGeneration::default()
        }
    }

    #[tokio::test]
    async fn feature_snapshot_manifest_lists_hashed_parquet_files() {
        let dir = tempdir().expect("tempdir");
        let writer = ReportWriter::new(dir.path().join("reports"), ArtifactStore::new(dir.path().join("artifacts")));
        let run_id = Uuid::new_v4();
        let generation = sample_generation();

        let manifest_path = writer
            .export_feature_snapshot(run_id, &generation)
            .await
            .expect("export");

        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).expect("read")).expect("parse");
        assert_eq!(manifest.generation_id, generation.generation_id);
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[0].rows, 4);
        assert_eq!(manifest.files[1].rows, 1);
        for file in &manifest.files {
            assert_eq!(file.sha256.len(), 64);
            assert!(file.bytes > 0);
            assert!(writer.run_dir(run_id).join(&file.path).exists());
        }
    }

    #[tokio::test]
    async fn generations_are_stored_by_content_hash() {
        let dir = tempdir().expect("tempdir");
        let writer = ReportWriter::new(dir.path().join("reports"), ArtifactStore::new(dir.path().join("artifacts")));
        let at = chrono::Utc.with_ymd_and_hms(2026, 3, 10, 2, 0, 0).single().unwrap();
        let stored = writer
            .store_generation("features", &sample_generation(), at)
            .await
            .expect("store");
        assert!(stored.relative_path.starts_with("features/20260310"));
        assert!(stored.absolute_path.exists());
    }
}
