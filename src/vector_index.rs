//! VectorIndex (§4.4): upsert/search/delete/stats over chunk payloads, with
//! a flat-file JSON-backed implementation.
//!
//! Grounded on the teacher's `IndexStore`/`FileIndexEntry` flat-file
//! persistence and its `cosine_similarity`/`score_file_entry` pure-function
//! scoring (`vector_store.rs`), generalized from per-file embeddings to
//! per-chunk payloads behind a `VectorIndex` trait so a remote backend can be
//! dropped in without touching `ContextGenerator`.

use crate::document::DocumentChunk;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.7;

#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    /// Conjunction (`must`) of equality predicates over payload fields.
    pub equals: Vec<(String, String)>,
    /// Conjunction of glob predicates, emulated by post-filter scan.
    pub globs: Vec<(String, String)>,
}

impl MetadataFilter {
    pub fn matches(&self, chunk: &DocumentChunk) -> bool {
        for (field, value) in &self.equals {
            if field_value(chunk, field).as_deref() != Some(value.as_str()) {
                return false;
            }
        }
        for (field, pattern) in &self.globs {
            let Some(actual) = field_value(chunk, field) else {
                return false;
            };
            let Ok(glob_pattern) = glob::Pattern::new(pattern) else {
                return false;
            };
            if !glob_pattern.matches(&actual) {
                return false;
            }
        }
        true
    }
}

fn field_value(chunk: &DocumentChunk, field: &str) -> Option<String> {
    match field {
        "repository" => Some(chunk.repository.clone()),
        "filepath" => Some(chunk.filepath.clone()),
        "category" => chunk.category.clone(),
        "language" => chunk.language.clone(),
        "framework" => chunk.framework.clone(),
        "type" => Some(format!("{:?}", chunk.chunk_type).to_lowercase()),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_documents: usize,
    pub total_chunks: usize,
    pub collection_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOptions {
    pub limit: usize,
    pub score_threshold: Option<f32>,
    #[serde(skip)]
    pub filter: Option<MetadataFilter>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            limit: 20,
            score_threshold: Some(DEFAULT_SCORE_THRESHOLD),
            filter: None,
        }
    }
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, chunks: Vec<DocumentChunk>) -> Result<()>;
    async fn search_by_vector(
        &self,
        vector: &[f32],
        opts: &SearchOptions,
    ) -> Result<Vec<(DocumentChunk, f32)>>;
    async fn search_by_metadata(&self, filter: &MetadataFilter, limit: usize) -> Result<Vec<DocumentChunk>>;
    async fn delete_by_document(&self, document_id: &str) -> Result<usize>;
    async fn delete_by_repository(&self, repository: &str) -> Result<usize>;
    async fn stats(&self) -> Result<IndexStats>;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Encodes a 16-hex chunk ID into a backend-safe UUID-shaped string while
/// preserving the original in the payload as `originalId` (§4.4).
pub fn encode_backend_id(original_id: &str) -> String {
    let padded = format!("{:0<32}", original_id);
    format!(
        "{}-{}-{}-{}-{}",
        &padded[0..8],
        &padded[8..12],
        &padded[12..16],
        &padded[16..20],
        &padded[20..32]
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    original_id: String,
    backend_id: String,
    chunk: DocumentChunk,
}

#[derive(Default, Serialize, Deserialize)]
struct IndexFile {
    dimension: usize,
    entries: Vec<IndexEntry>,
}

/// Flat-file JSON-backed `VectorIndex`. Suitable as the default/local
/// backend; a remote backend (Qdrant, pgvector, ...) implements the same
/// trait without changing `ContextGenerator`.
pub struct FileVectorIndex {
    path: PathBuf,
    dimension: usize,
    state: RwLock<HashMap<String, IndexEntry>>,
}

impl FileVectorIndex {
    /// Ensures the collection file exists with the configured dimension,
    /// creating it if missing (§4.4 Collection initialization).
    pub fn open(path: impl AsRef<Path>, dimension: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let text = std::fs::read_to_string(&path).context("reading vector index file")?;
            let file: IndexFile = serde_json::from_str(&text).unwrap_or_default();
            if file.dimension != 0 && file.dimension != dimension {
                anyhow::bail!(
                    "vector index at {:?} was built for dimension {}, not {}; use a new collection name",
                    path,
                    file.dimension,
                    dimension
                );
            }
            file.entries
                .into_iter()
                .map(|e| (e.original_id.clone(), e))
                .collect()
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            HashMap::new()
        };
        let index = FileVectorIndex {
            path,
            dimension,
            state: RwLock::new(state),
        };
        index.persist()?;
        Ok(index)
    }

    fn persist(&self) -> Result<()> {
        let state = self.state.read().expect("vector index lock poisoned");
        let file = IndexFile {
            dimension: self.dimension,
            entries: state.values().cloned().collect(),
        };
        let text = serde_json::to_string_pretty(&file)?;
        std::fs::write(&self.path, text).context("writing vector index file")?;
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for FileVectorIndex {
    async fn upsert(&self, chunks: Vec<DocumentChunk>) -> Result<()> {
        {
            let mut state = self.state.write().expect("vector index lock poisoned");
            for chunk in chunks {
                let backend_id = encode_backend_id(&chunk.id);
                let original_id = chunk.id.clone();
                state.insert(original_id.clone(), IndexEntry { original_id, backend_id, chunk });
            }
        }
        self.persist()
    }

    async fn search_by_vector(
        &self,
        vector: &[f32],
        opts: &SearchOptions,
    ) -> Result<Vec<(DocumentChunk, f32)>> {
        let state = self.state.read().expect("vector index lock poisoned");
        let threshold = opts.score_threshold.unwrap_or(DEFAULT_SCORE_THRESHOLD);

        let mut hits: Vec<(DocumentChunk, f32)> = state
            .values()
            .filter(|e| opts.filter.as_ref().map(|f| f.matches(&e.chunk)).unwrap_or(true))
            .filter_map(|e| {
                let embedding = e.chunk.embedding.as_ref()?;
                let score = cosine_similarity(vector, embedding);
                if score >= threshold {
                    Some((e.chunk.clone(), score))
                } else {
                    None
                }
            })
            .collect();

        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(opts.limit);
        Ok(hits)
    }

    async fn search_by_metadata(&self, filter: &MetadataFilter, limit: usize) -> Result<Vec<DocumentChunk>> {
        let state = self.state.read().expect("vector index lock poisoned");
        Ok(state
            .values()
            .filter(|e| filter.matches(&e.chunk))
            .take(limit)
            .map(|e| e.chunk.clone())
            .collect())
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        let removed = {
            let mut state = self.state.write().expect("vector index lock poisoned");
            let before = state.len();
            state.retain(|_, e| e.chunk.document_id != document_id);
            before - state.len()
        };
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    async fn delete_by_repository(&self, repository: &str) -> Result<usize> {
        let removed = {
            let mut state = self.state.write().expect("vector index lock poisoned");
            let before = state.len();
            state.retain(|_, e| e.chunk.repository != repository);
            before - state.len()
        };
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    async fn stats(&self) -> Result<IndexStats> {
        let state = self.state.read().expect("vector index lock poisoned");
        let total_chunks = state.len();
        let total_documents = state
            .values()
            .map(|e| e.chunk.document_id.clone())
            .collect::<std::collections::HashSet<_>>()
            .len();
        Ok(IndexStats {
            total_documents,
            total_chunks,
            collection_size: total_chunks,
        })
    }
}
