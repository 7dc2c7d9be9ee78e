//! # EventIndex
//!
//! Read-only nearest-neighbor index over event embeddings.
//!
//! This module wraps a [HNSW](https://arxiv.org/abs/1603.09320) approximate
//! nearest-neighbor graph (`hora` crate) together with the ordered list of
//! [`EventRecord`]s it was built from. Vector slot `i` always resolves to
//! record `i`; the two halves are built, saved and loaded together.
//!
//! ## Lifecycle
//! - **Build** once, offline, from a batch of fetched events ([`EventIndex::build`]).
//! - **Save** as a snapshot directory ([`EventIndex::save`]).
//! - **Load** read-only at startup ([`EventIndex::load`]) and share it behind an
//!   `Arc`; nothing mutates it afterwards, so concurrent searches need no lock.
//!
//! ## Snapshot layout
//! ```text
//! <dir>/index.hnsw     hora binary dump of the built graph
//! <dir>/records.yaml   manifest: dimension, record count, blake3 digest of
//!                      index.hnsw, embedding model id, build time, records
//! ```
//! A missing artifact, a digest mismatch, or a record count that disagrees
//! with the manifest is reported as an [`IndexError`]; callers treat that as
//! "no index" rather than a fatal condition.

use chrono::Utc;
use hora::core::ann_index::{ANNIndex, SerializableIndex};
use hora::core::metrics::Metric;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use indicatif::{ParallelProgressIterator, ProgressBar};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::embedder::{EmbedError, Embedder};
use crate::event::EventRecord;

pub const INDEX_FILE: &str = "index.hnsw";
pub const RECORDS_FILE: &str = "records.yaml";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("cannot build an index from zero records")]
    EmptyInput,

    #[error("top_k must be at least 1")]
    InvalidTopK,

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbedError),

    #[error("vector for slot {slot} has {found} dimensions, expected {expected}")]
    DimensionMismatch {
        slot: usize,
        expected: usize,
        found: usize,
    },

    #[error("hnsw index error: {0}")]
    Hnsw(&'static str),

    #[error("snapshot artifact missing: {}", .0.display())]
    Missing(PathBuf),

    #[error("snapshot is inconsistent: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot manifest error: {0}")]
    Manifest(#[from] serde_yaml::Error),

    #[error("index build task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// On-disk companion of `index.hnsw`.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotManifest {
    dimension: usize,
    len: usize,
    index_digest: String,
    embedding_model: String,
    built_at: String,
    records: Vec<EventRecord>,
}

/// HNSW graph plus the records its slots point at.
pub struct EventIndex {
    index: HNSWIndex<f32, usize>,
    records: Vec<EventRecord>,
    dimension: usize,
    embedding_model: String,
    built_at: String,
}

impl EventIndex {
    /// Embed every record and build the graph.
    ///
    /// Each record contributes `title + "\n\n" + description`. The vector for
    /// `records[i]` is stored under slot `i`.
    ///
    /// # Errors
    /// - [`IndexError::EmptyInput`] when `records` is empty.
    /// - [`IndexError::Embedding`] when any single embedding fails; no partial
    ///   index is returned.
    pub fn build(records: Vec<EventRecord>, embedder: &dyn Embedder) -> Result<Self, IndexError> {
        Self::build_with_progress(records, embedder, &ProgressBar::hidden())
    }

    /// [`EventIndex::build`], ticking `progress` once per embedded record.
    ///
    /// Embeddings are computed in parallel; slot order still follows `records`.
    pub fn build_with_progress(
        records: Vec<EventRecord>,
        embedder: &dyn Embedder,
        progress: &ProgressBar,
    ) -> Result<Self, IndexError> {
        if records.is_empty() {
            return Err(IndexError::EmptyInput);
        }

        progress.set_length(records.len() as u64);
        let vectors = records
            .par_iter()
            .progress_with(progress.clone())
            .map(|record| embedder.embed(&record.embedding_text()))
            .collect::<Result<Vec<Vec<f32>>, EmbedError>>()?;
        progress.finish_and_clear();

        Self::from_vectors(records, vectors, embedder.dimension(), embedder.model_id())
    }

    /// Build from precomputed vectors; `vectors[i]` belongs to `records[i]`.
    pub fn from_vectors(
        records: Vec<EventRecord>,
        vectors: Vec<Vec<f32>>,
        dimension: usize,
        embedding_model: &str,
    ) -> Result<Self, IndexError> {
        if records.is_empty() {
            return Err(IndexError::EmptyInput);
        }
        if records.len() != vectors.len() {
            return Err(IndexError::Corrupt(format!(
                "{} records but {} vectors",
                records.len(),
                vectors.len()
            )));
        }

        let mut index = HNSWIndex::new(dimension, &HNSWParams::default());
        for (slot, vector) in vectors.iter().enumerate() {
            if vector.len() != dimension {
                return Err(IndexError::DimensionMismatch {
                    slot,
                    expected: dimension,
                    found: vector.len(),
                });
            }
            index.add(vector, slot).map_err(IndexError::Hnsw)?;
        }
        index.build(Metric::Euclidean).map_err(IndexError::Hnsw)?;

        info!("Built event index over {} records", records.len());

        Ok(Self {
            index,
            records,
            dimension,
            embedding_model: embedding_model.to_string(),
            built_at: Utc::now().to_rfc3339(),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    pub fn built_at(&self) -> &str {
        &self.built_at
    }

    /// Resolve a slot to its record; `None` when out of range.
    pub fn record(&self, slot: usize) -> Option<&EventRecord> {
        self.records.get(slot)
    }

    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    /// Raw k-NN: `(slot, distance)` pairs, closest first.
    ///
    /// Returns an empty list when `vector` has the wrong dimension or `k` is 0.
    pub fn search_vector(&self, vector: &[f32], k: usize) -> Vec<(usize, f32)> {
        if vector.len() != self.dimension || k == 0 {
            return Vec::new();
        }

        let mut hits: Vec<(usize, f32)> = self
            .index
            .search_nodes(vector, k)
            .into_iter()
            .filter_map(|(node, distance)| (*node.idx()).map(|slot| (slot, distance)))
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1));
        hits.truncate(k);
        hits
    }

    /// Embed `query` and return up to `k` records, best match first.
    ///
    /// Slots the graph returns that do not resolve to a record are skipped.
    ///
    /// # Errors
    /// - [`IndexError::InvalidTopK`] when `k == 0`.
    /// - [`IndexError::Embedding`] when the query cannot be embedded.
    /// - [`IndexError::DimensionMismatch`] when the embedder disagrees with the index.
    pub fn search(
        &self,
        embedder: &dyn Embedder,
        query: &str,
        k: usize,
    ) -> Result<Vec<EventRecord>, IndexError> {
        if k == 0 {
            return Err(IndexError::InvalidTopK);
        }

        let vector = embedder.embed(query)?;
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                slot: 0,
                expected: self.dimension,
                found: vector.len(),
            });
        }

        let results: Vec<EventRecord> = self
            .search_vector(&vector, k)
            .into_iter()
            .filter_map(|(slot, _)| {
                let record = self.record(slot);
                if record.is_none() {
                    debug!("Skipping out-of-range slot {}", slot);
                }
                record.cloned()
            })
            .collect();

        debug!("Index search returned {} of {} requested", results.len(), k);
        Ok(results)
    }

    /// Write `index.hnsw` and `records.yaml` into `dir`, creating it if needed.
    pub fn save(&mut self, dir: &Path) -> Result<(), IndexError> {
        fs::create_dir_all(dir)?;

        let index_file = dir.join(INDEX_FILE);
        self.index
            .dump(path_str(&index_file)?)
            .map_err(IndexError::Hnsw)?;
        let index_digest = blake3::hash(&fs::read(&index_file)?).to_hex().to_string();

        let manifest = SnapshotManifest {
            dimension: self.dimension,
            len: self.records.len(),
            index_digest,
            embedding_model: self.embedding_model.clone(),
            built_at: self.built_at.clone(),
            records: self.records.clone(),
        };
        fs::write(dir.join(RECORDS_FILE), serde_yaml::to_string(&manifest)?)?;

        info!("Saved event index snapshot to {}", dir.display());
        Ok(())
    }

    /// Load a snapshot written by [`EventIndex::save`].
    ///
    /// # Errors
    /// [`IndexError::Missing`] if either artifact is absent; [`IndexError::Corrupt`]
    /// if the digest or record count does not match the manifest.
    pub fn load(dir: &Path) -> Result<Self, IndexError> {
        let index_file = dir.join(INDEX_FILE);
        let records_file = dir.join(RECORDS_FILE);
        for artifact in [&index_file, &records_file] {
            if !artifact.is_file() {
                return Err(IndexError::Missing(artifact.clone()));
            }
        }

        let manifest: SnapshotManifest = serde_yaml::from_str(&fs::read_to_string(&records_file)?)?;

        let digest = blake3::hash(&fs::read(&index_file)?).to_hex().to_string();
        if digest != manifest.index_digest {
            return Err(IndexError::Corrupt(format!(
                "{} does not match the digest in {}",
                INDEX_FILE, RECORDS_FILE
            )));
        }
        if manifest.len == 0 || manifest.records.len() != manifest.len {
            return Err(IndexError::Corrupt(format!(
                "manifest lists {} slots but holds {} records",
                manifest.len,
                manifest.records.len()
            )));
        }

        let index = HNSWIndex::load(path_str(&index_file)?).map_err(IndexError::Hnsw)?;

        info!(
            "Loaded event index: {} records, built {} with {}",
            manifest.len, manifest.built_at, manifest.embedding_model
        );

        Ok(Self {
            index,
            records: manifest.records,
            dimension: manifest.dimension,
            embedding_model: manifest.embedding_model,
            built_at: manifest.built_at,
        })
    }
}

fn path_str(path: &Path) -> Result<&str, IndexError> {
    path.to_str()
        .ok_or_else(|| IndexError::Corrupt(format!("non UTF-8 path {}", path.display())))
}
