//! The data model (§3): `Repository`, `Document`, `DocumentChunk`, and their
//! deterministic identity functions.
//!
//! Grounded on `cortesi-ra`'s `ChunkDocument` for the hierarchical
//! doc_id/parent_id/depth shape, generalized from Tantivy-indexable fields to
//! this crate's own chunk payload.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    None,
    Token,
    Ssh,
}

impl Default for AuthMode {
    fn default() -> Self {
        AuthMode::None
    }
}

/// The unit of sync (§3 Repository).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub clone_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub auth: AuthMode,
    /// Env var name holding the credential; never a literal secret (§6).
    #[serde(default)]
    pub credential_env: Option<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub category: Option<String>,
    /// Minutes; 0 = on-demand only (disabled), per the fixed Open Question.
    #[serde(default)]
    pub sync_interval: u64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Markdown,
    Rst,
    Html,
    Code,
    Yaml,
    Json,
    Xml,
    Plain,
}

/// A parsed source file at a given revision (§3 Document).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub repository: String,
    pub filepath: String,
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub category: Option<String>,
    pub language: Option<String>,
    pub framework: Option<String>,
    pub author: Option<String>,
    /// Additional front-matter keys, sanitized (§4.2, §7).
    pub extra_metadata: HashMap<String, String>,
    pub content: String,
    pub chunk_ids: Vec<String>,
    pub last_modified: chrono::DateTime<chrono::Utc>,
    pub content_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Heading,
    Paragraph,
    Code,
    List,
    Table,
    Blockquote,
    Other,
}

/// An indexed unit (§3 DocumentChunk).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub document_id: String,
    pub repository: String,
    pub filepath: String,
    #[serde(rename = "type")]
    pub chunk_type: ChunkType,
    pub content: String,
    pub start_line: Option<usize>,
    pub end_line: Option<usize>,
    pub parent_chunk_id: Option<String>,
    pub child_chunk_ids: Vec<String>,
    /// Ancestor heading titles, outermost first.
    pub heading_context: Vec<String>,
    /// Innermost heading — the chunk's own section title.
    pub section: String,
    pub title: Option<String>,
    pub category: Option<String>,
    pub language: Option<String>,
    pub framework: Option<String>,
    pub priority: Priority,
    pub content_hash: String,
    /// Populated lazily by the EmbeddingProvider; absent until embedded.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

impl DocumentChunk {
    pub fn is_searchable(&self) -> bool {
        self.embedding.is_some()
    }
}

/// First 16 hex chars of SHA-256(data) — the identity scheme mandated by §4.2
/// for both document and chunk IDs.
fn short_sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p.as_bytes());
    }
    let digest = hasher.finalize();
    let full = hex_encode(&digest);
    full[..16].to_string()
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex_encode(&hasher.finalize())
}

/// Document ID = first 16 hex chars of SHA-256(repository || filepath || contentHash).
pub fn document_id(repository: &str, filepath: &str, content_hash: &str) -> String {
    short_sha256_hex(&[repository, filepath, content_hash])
}

/// Chunk ID = first 16 hex chars of SHA-256(documentId || content).
pub fn chunk_id(document_id: &str, content: &str) -> String {
    short_sha256_hex(&[document_id, content])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_id_is_deterministic() {
        let hash = content_hash("# Hello\n");
        let a = document_id("repo", "a.md", &hash);
        let b = document_id("repo", "a.md", &hash);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn document_id_changes_with_content() {
        let a = document_id("repo", "a.md", &content_hash("one"));
        let b = document_id("repo", "a.md", &content_hash("two"));
        assert_ne!(a, b);
    }

    #[test]
    fn chunk_id_depends_on_document_and_content() {
        let a = chunk_id("doc1", "same content");
        let b = chunk_id("doc2", "same content");
        assert_ne!(a, b, "same content under a different document must differ");

        let c = chunk_id("doc1", "same content");
        assert_eq!(a, c, "same (document, content) pair must be stable");
    }
}
