//! ContextGenerator (§4.5): embed → filter → search → re-rank → dedupe →
//! token-budget assembly, plus progressive levels and a degraded
//! simple-text fallback.
//!
//! The token-budget accounting (never split a unit once over budget) is
//! grounded on the teacher's `slicer.rs` `importance_score`/
//! `build_xml_from_entries`, generalized from file-level XML assembly to
//! chunk-level markdown assembly. The priority/match-boost re-rank formula
//! has no direct teacher analog; it's implemented as a pure, unit-tested
//! function in the same style as `vector_store.rs`'s `score_file_entry`.

use crate::config::ContextGenerationConfig;
use crate::document::DocumentChunk;
use crate::embedding::EmbeddingProvider;
use crate::vector_index::{MetadataFilter, SearchOptions, VectorIndex};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Semantic,
    Keyword,
    Hybrid,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Hybrid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressiveLevel {
    Overview,
    Detailed,
    Comprehensive,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContextQuery {
    pub task: String,
    pub language: Option<String>,
    pub framework: Option<String>,
    pub context: Option<String>,
    pub max_results: Option<usize>,
    pub repositories: Option<Vec<String>>,
    pub categories: Option<Vec<String>>,
    #[serde(default)]
    pub strategy: Strategy,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedChunk {
    pub chunk: DocumentChunk,
    pub score: f32,
    pub explanation: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextSource {
    pub filepath: String,
    pub repository: String,
    pub relevance: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextMetadata {
    pub sources: Vec<ContextSource>,
    pub total_chunks: usize,
    pub tokens_used: usize,
    pub strategy: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub relevant_repositories: Vec<String>,
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextResult {
    pub content: String,
    pub chunks: Vec<RankedChunk>,
    pub metadata: ContextMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressiveContextResult {
    pub result: ContextResult,
    pub has_more: bool,
    pub next_level: Option<ProgressiveLevel>,
}

/// Priority weight lookup, configurable defaults `{high:1.5, medium:1.0, low:0.7}`.
fn priority_weight(priority: crate::document::Priority, cfg: &ContextGenerationConfig) -> f32 {
    match priority {
        crate::document::Priority::High => cfg.priority_weights.high,
        crate::document::Priority::Medium => cfg.priority_weights.medium,
        crate::document::Priority::Low => cfg.priority_weights.low,
    }
}

/// `final = semantic × priorityWeight[priority] × (1 + 0.15·lang + 0.15·framework + 0.10·category)` (§4.5).
///
/// The `keyword` strategy is an alias for `hybrid` with the semantic weight
/// pinned to 0 (Open Question 2): the raw vector score is replaced by a
/// constant base so ranking is driven entirely by priority and match boosts.
pub fn rerank_score(
    semantic: f32,
    chunk: &DocumentChunk,
    query: &ContextQuery,
    cfg: &ContextGenerationConfig,
) -> (f32, String) {
    let semantic = if query.strategy == Strategy::Keyword { 1.0 } else { semantic };
    let lang_match = matches(&chunk.language, &query.language);
    let framework_match = matches(&chunk.framework, &query.framework);
    let category_match = query
        .categories
        .as_ref()
        .map(|cats| chunk.category.as_deref().map(|c| cats.iter().any(|x| x == c)).unwrap_or(false))
        .unwrap_or(false);

    let boost = 1.0
        + 0.15 * (lang_match as i32 as f32)
        + 0.15 * (framework_match as i32 as f32)
        + 0.10 * (category_match as i32 as f32);

    let score = semantic * priority_weight(chunk.priority, cfg) * boost;

    let mut reasons = Vec::new();
    if lang_match {
        reasons.push("language match");
    }
    if framework_match {
        reasons.push("framework match");
    }
    if category_match {
        reasons.push("category match");
    }
    let explanation = if reasons.is_empty() {
        "semantic match".to_string()
    } else {
        reasons.join(", ")
    };

    (score, explanation)
}

fn matches(field: &Option<String>, hint: &Option<String>) -> bool {
    match (field, hint) {
        (Some(f), Some(h)) => f.eq_ignore_ascii_case(h),
        _ => false,
    }
}

fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() + 3) / 4
}

pub struct ContextGenerator {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    cfg: ContextGenerationConfig,
}

impl ContextGenerator {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, index: Arc<dyn VectorIndex>, cfg: ContextGenerationConfig) -> Self {
        ContextGenerator { embedder, index, cfg }
    }

    fn build_filter(&self, query: &ContextQuery) -> Option<MetadataFilter> {
        let mut equals = Vec::new();
        // repositories/categories are OR'd internally but ANDed with each
        // other; with a single-valued equality filter we only get exact
        // support for the single-repository/category case here and fall
        // back to post-filtering for the multi-value case.
        if let Some(repos) = &query.repositories {
            if repos.len() == 1 {
                equals.push(("repository".to_string(), repos[0].clone()));
            }
        }
        if let Some(cats) = &query.categories {
            if cats.len() == 1 {
                equals.push(("category".to_string(), cats[0].clone()));
            }
        }
        if equals.is_empty() {
            None
        } else {
            Some(MetadataFilter { equals, globs: Vec::new() })
        }
    }

    fn post_filter(&self, chunk: &DocumentChunk, query: &ContextQuery) -> bool {
        if let Some(repos) = &query.repositories {
            if !repos.iter().any(|r| r == &chunk.repository) {
                return false;
            }
        }
        if let Some(cats) = &query.categories {
            if !chunk.category.as_deref().map(|c| cats.iter().any(|x| x == c)).unwrap_or(false) {
                return false;
            }
        }
        true
    }

    pub async fn generate(&self, query: &ContextQuery) -> Result<ContextResult> {
        let max_results = query.max_results.unwrap_or(self.cfg.max_results);

        let embed_result = self.embedder.embed(&query.task).await;
        let search_result = match &embed_result {
            Ok(vector) => {
                let filter = self.build_filter(query);
                self.index
                    .search_by_vector(
                        vector,
                        &SearchOptions {
                            limit: max_results * 4,
                            score_threshold: Some(self.cfg.score_threshold),
                            filter,
                        },
                    )
                    .await
            }
            Err(e) => Err(anyhow::anyhow!(e.to_string())),
        };

        match search_result {
            Ok(hits) => Ok(self.assemble(hits, query, max_results, "hybrid")),
            Err(_) => self.degraded_search(query, max_results).await,
        }
    }

    /// §4.5 degraded mode: a plain substring scan of the catalog via
    /// `searchByMetadata`, scored with a constant 1.0.
    async fn degraded_search(&self, query: &ContextQuery, max_results: usize) -> Result<ContextResult> {
        let filter = MetadataFilter::default();
        let catalog = self.index.search_by_metadata(&filter, usize::MAX).await?;
        let needle = query.task.to_ascii_lowercase();

        let hits: Vec<(DocumentChunk, f32)> = catalog
            .into_iter()
            .filter(|c| self.post_filter(c, query))
            .filter(|c| c.content.to_ascii_lowercase().contains(&needle))
            .map(|c| (c, 1.0))
            .collect();

        Ok(self.assemble(hits, query, max_results, "simple_text"))
    }

    fn assemble(
        &self,
        hits: Vec<(DocumentChunk, f32)>,
        query: &ContextQuery,
        max_results: usize,
        strategy: &str,
    ) -> ContextResult {
        let mut ranked: Vec<(f32, String, DocumentChunk)> = hits
            .into_iter()
            .filter(|(chunk, _)| self.post_filter(chunk, query))
            .map(|(chunk, semantic)| {
                let (score, explanation) = if strategy == "simple_text" {
                    (semantic, "literal match".to_string())
                } else {
                    rerank_score(semantic, &chunk, query, &self.cfg)
                };
                (score, explanation, chunk)
            })
            .collect();

        // Dedupe by (filepath, section), keeping the max-scoring chunk.
        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut deduped = Vec::new();
        for (score, explanation, chunk) in ranked {
            let key = (chunk.filepath.clone(), chunk.section.clone());
            if seen.insert(key) {
                deduped.push((score, explanation, chunk));
            }
        }

        deduped.truncate(max_results);

        // Token budget: accumulate until maxTokens is reached; never split a chunk.
        let mut kept = Vec::new();
        let mut tokens_used = 0usize;
        for (score, explanation, chunk) in deduped {
            let chunk_tokens = estimate_tokens(&chunk.content);
            if tokens_used + chunk_tokens > self.cfg.max_tokens && !kept.is_empty() {
                break;
            }
            tokens_used += chunk_tokens;
            kept.push(RankedChunk { chunk, score, explanation });
        }

        let content = render_markdown(&kept);

        let mut sources = Vec::new();
        let mut repo_order: Vec<String> = Vec::new();
        for rc in &kept {
            if !repo_order.contains(&rc.chunk.repository) {
                repo_order.push(rc.chunk.repository.clone());
            }
            sources.push(ContextSource {
                filepath: rc.chunk.filepath.clone(),
                repository: rc.chunk.repository.clone(),
                relevance: rc.score,
            });
        }

        let confidence = if kept.is_empty() {
            None
        } else {
            Some(kept.iter().map(|c| c.score).sum::<f32>() / kept.len() as f32)
        };

        ContextResult {
            content,
            chunks: kept,
            metadata: ContextMetadata {
                sources,
                total_chunks: kept.len(),
                tokens_used,
                strategy: strategy.to_string(),
                timestamp: chrono::Utc::now(),
                relevant_repositories: repo_order,
                confidence,
            },
        }
    }

    /// `generateProgressive(query, level)` (§4.5): caps result count per
    /// level and prefers summary chunks at `overview`.
    pub async fn generate_progressive(
        &self,
        query: &ContextQuery,
        level: ProgressiveLevel,
    ) -> Result<ProgressiveContextResult> {
        let cap = match level {
            ProgressiveLevel::Overview => self.cfg.overview_limit,
            ProgressiveLevel::Detailed => self.cfg.detailed_limit,
            ProgressiveLevel::Comprehensive => self.cfg.comprehensive_limit,
        };

        let mut bounded_query = query.clone();
        bounded_query.max_results = Some(cap);
        let mut result = self.generate(&bounded_query).await?;

        if level == ProgressiveLevel::Overview {
            // Prefer summary (non-leaf heading) chunks when available.
            let summaries: Vec<RankedChunk> = result
                .chunks
                .iter()
                .filter(|c| !c.chunk.child_chunk_ids.is_empty())
                .cloned()
                .collect();
            if !summaries.is_empty() {
                result.chunks = summaries;
                result.content = render_markdown(&result.chunks);
                result.metadata.total_chunks = result.chunks.len();
            }
        }

        let next_level = match level {
            ProgressiveLevel::Overview => Some(ProgressiveLevel::Detailed),
            ProgressiveLevel::Detailed => Some(ProgressiveLevel::Comprehensive),
            ProgressiveLevel::Comprehensive => None,
        };
        let has_more = next_level.is_some() && result.chunks.len() >= cap;

        Ok(ProgressiveContextResult { result, has_more, next_level })
    }
}

fn render_markdown(chunks: &[RankedChunk]) -> String {
    let mut out = String::new();
    let mut last_repo: Option<&str> = None;
    let mut last_path: Option<&str> = None;
    for rc in chunks {
        if last_repo != Some(rc.chunk.repository.as_str()) {
            out.push_str(&format!("# {}\n\n", rc.chunk.repository));
            last_repo = Some(&rc.chunk.repository);
            last_path = None;
        }
        if last_path != Some(rc.chunk.filepath.as_str()) {
            out.push_str(&format!("## {}\n\n", rc.chunk.filepath));
            last_path = Some(&rc.chunk.filepath);
        }
        out.push_str(&rc.chunk.content);
        out.push_str(&format!("\n\n_relevance: {}_\n\n", rc.explanation));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ChunkType, Priority};
    use crate::embedding::EmbeddingProvider;
    use crate::vector_index::{IndexStats, VectorIndex};
    use async_trait::async_trait;

    fn chunk(filepath: &str, section: &str, priority: Priority, language: Option<&str>) -> DocumentChunk {
        DocumentChunk {
            id: format!("{filepath}-{section}"),
            document_id: "doc".to_string(),
            repository: "demo".to_string(),
            filepath: filepath.to_string(),
            chunk_type: ChunkType::Paragraph,
            content: format!("content about {section}"),
            start_line: None,
            end_line: None,
            parent_chunk_id: None,
            child_chunk_ids: Vec::new(),
            heading_context: Vec::new(),
            section: section.to_string(),
            title: None,
            category: None,
            language: language.map(String::from),
            framework: None,
            priority,
            content_hash: "hash".to_string(),
            embedding: Some(vec![1.0, 0.0]),
        }
    }

    struct StubEmbedder;

    #[async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
        fn dimension(&self) -> usize {
            2
        }
        fn model_version(&self) -> &str {
            "stub"
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            anyhow::bail!("backend unreachable")
        }
        async fn embed_batch(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            anyhow::bail!("backend unreachable")
        }
        fn dimension(&self) -> usize {
            2
        }
        fn model_version(&self) -> &str {
            "stub"
        }
    }

    struct StubIndex {
        chunks: Vec<DocumentChunk>,
        fail_vector_search: bool,
    }

    #[async_trait]
    impl VectorIndex for StubIndex {
        async fn upsert(&self, _chunks: Vec<DocumentChunk>) -> anyhow::Result<()> {
            Ok(())
        }
        async fn search_by_vector(
            &self,
            _vector: &[f32],
            opts: &SearchOptions,
        ) -> anyhow::Result<Vec<(DocumentChunk, f32)>> {
            if self.fail_vector_search {
                anyhow::bail!("vector backend down");
            }
            Ok(self
                .chunks
                .iter()
                .cloned()
                .map(|c| (c, 0.8))
                .take(opts.limit)
                .collect())
        }
        async fn search_by_metadata(&self, _filter: &MetadataFilter, limit: usize) -> anyhow::Result<Vec<DocumentChunk>> {
            Ok(self.chunks.iter().cloned().take(limit).collect())
        }
        async fn delete_by_document(&self, _id: &str) -> anyhow::Result<usize> {
            Ok(0)
        }
        async fn delete_by_repository(&self, _repo: &str) -> anyhow::Result<usize> {
            Ok(0)
        }
        async fn stats(&self) -> anyhow::Result<IndexStats> {
            Ok(IndexStats::default())
        }
    }

    #[test]
    fn rerank_boosts_language_match() {
        let cfg = ContextGenerationConfig::default();
        let query = ContextQuery {
            task: "parse json".into(),
            language: Some("typescript".into()),
            ..Default::default()
        };
        let matching = chunk("a.md", "Parsing", Priority::Medium, Some("typescript"));
        let non_matching = chunk("b.md", "Other", Priority::Medium, Some("python"));

        let (s1, _) = rerank_score(0.8, &matching, &query, &cfg);
        let (s2, _) = rerank_score(0.8, &non_matching, &query, &cfg);
        assert!(s1 > s2);
    }

    #[tokio::test]
    async fn s2_priority_outranks_equal_semantic_score() {
        let cfg = ContextGenerationConfig::default();
        let high = chunk("a.md", "Install", Priority::High, None);
        let low = chunk("b.md", "Install", Priority::Low, None);
        let index = Arc::new(StubIndex { chunks: vec![low, high.clone()], fail_vector_search: false });
        let gen = ContextGenerator::new(Arc::new(StubEmbedder), index, cfg);

        let query = ContextQuery { task: "install".into(), ..Default::default() };
        let result = gen.generate(&query).await.unwrap();

        assert!(!result.chunks.is_empty());
        assert_eq!(result.chunks[0].chunk.priority, Priority::High);
        assert!(result.metadata.confidence.is_some());
    }

    #[tokio::test]
    async fn degraded_mode_returns_literal_matches_when_embedding_fails() {
        let cfg = ContextGenerationConfig::default();
        let c = chunk("auth.md", "Authentication", Priority::Medium, None);
        let index = Arc::new(StubIndex { chunks: vec![c], fail_vector_search: true });
        let gen = ContextGenerator::new(Arc::new(FailingEmbedder), index, cfg);

        let query = ContextQuery { task: "authentication".into(), ..Default::default() };
        let result = gen.generate(&query).await.unwrap();

        assert_eq!(result.metadata.strategy, "simple_text");
        assert!(!result.chunks.is_empty());
        assert_eq!(result.chunks[0].score, 1.0);
    }

    #[test]
    fn dedupe_keeps_max_scoring_chunk_per_filepath_section() {
        let cfg = ContextGenerationConfig::default();
        let query = ContextQuery::default();
        let index: Arc<dyn VectorIndex> = Arc::new(StubIndex { chunks: Vec::new(), fail_vector_search: false });
        let gen = ContextGenerator::new(Arc::new(StubEmbedder), index, cfg);

        let a = chunk("a.md", "Intro", Priority::Low, None);
        let mut b = chunk("a.md", "Intro", Priority::High, None);
        b.id = "different-id".to_string();

        let result = gen.assemble(vec![(a, 0.5), (b, 0.9)], &query, 10, "hybrid");
        assert_eq!(result.chunks.len(), 1);
        assert_eq!(result.chunks[0].chunk.priority, Priority::High);
    }

    #[test]
    fn token_budget_never_splits_a_chunk() {
        let mut cfg = ContextGenerationConfig::default();
        cfg.max_tokens = 5; // smaller than a single chunk's token estimate
        let query = ContextQuery::default();
        let index: Arc<dyn VectorIndex> = Arc::new(StubIndex { chunks: Vec::new(), fail_vector_search: false });
        let gen = ContextGenerator::new(Arc::new(StubEmbedder), index, cfg);

        let c = chunk("a.md", "Intro", Priority::Medium, None);
        let result = gen.assemble(vec![(c.clone(), 0.9)], &query, 10, "hybrid");

        // Even though the chunk exceeds maxTokens, at least one chunk is kept
        // whole rather than split.
        assert_eq!(result.chunks.len(), 1);
        assert_eq!(result.chunks[0].chunk.content, c.content);
    }
}
