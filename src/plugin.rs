//! PluginRegistry (§4.6): per-extension DocumentProcessor, named context
//! re-ranker, named EmbeddingProvider, with idempotent-by-name registration
//! and `init`/`destroy` lifecycle.
//!
//! Grounded on the teacher's feature-flag-gated tree-sitter grammar
//! registration (`Cargo.toml` `lang-*` features selecting optional grammars
//! at compile time), generalized here to a runtime registry since §4.6 needs
//! run-time plugin registration rather than compile-time feature selection.
//! The idempotent-by-name + ordered-merge discipline borrows from
//! `rules.rs`'s `get_merged_rules`.

use crate::context_generator::{ContextQuery, RankedChunk};
use crate::document::{Document, DocumentChunk, Repository};
use crate::embedding::EmbeddingProvider;
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub trait DocumentProcessorPlugin: Send + Sync {
    fn name(&self) -> &str;
    fn process(
        &self,
        path: &str,
        bytes: &[u8],
        repository: &Repository,
    ) -> Result<(Document, Vec<DocumentChunk>)>;
}

/// Runs after the base ranker, in registration order, within the strategies
/// it declares (§4.6).
pub trait ContextReranker: Send + Sync {
    fn name(&self) -> &str;
    fn strategies(&self) -> &[&str];
    fn rerank(&self, query: &ContextQuery, chunks: Vec<RankedChunk>) -> Vec<RankedChunk>;
}

pub trait PluginLifecycle: Send + Sync {
    fn init(&self, config: &Value) -> Result<()>;
    fn destroy(&self) -> Result<()>;
}

#[derive(Default)]
struct RegistryInner {
    processors_by_extension: HashMap<String, Arc<dyn DocumentProcessorPlugin>>,
    rerankers: Vec<Arc<dyn ContextReranker>>,
    embedders_by_name: HashMap<String, Arc<dyn EmbeddingProvider>>,
    lifecycles: Vec<Arc<dyn PluginLifecycle>>,
}

/// Holds all registered extension points. Registration is idempotent by
/// name: re-registering a name already present replaces the prior entry
/// rather than erroring or duplicating it.
#[derive(Default)]
pub struct PluginRegistry {
    inner: RwLock<RegistryInner>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        PluginRegistry::default()
    }

    pub fn register_processor(&self, extension: &str, plugin: Arc<dyn DocumentProcessorPlugin>) {
        let mut inner = self.inner.write().expect("plugin registry lock poisoned");
        inner.processors_by_extension.insert(extension.trim_start_matches('.').to_string(), plugin);
    }

    pub fn processor_for(&self, extension: &str) -> Option<Arc<dyn DocumentProcessorPlugin>> {
        let inner = self.inner.read().expect("plugin registry lock poisoned");
        inner.processors_by_extension.get(extension.trim_start_matches('.')).cloned()
    }

    pub fn register_reranker(&self, reranker: Arc<dyn ContextReranker>) {
        let mut inner = self.inner.write().expect("plugin registry lock poisoned");
        if let Some(pos) = inner.rerankers.iter().position(|r| r.name() == reranker.name()) {
            inner.rerankers[pos] = reranker;
        } else {
            inner.rerankers.push(reranker);
        }
    }

    /// Reranks chunks with every registered reranker that declares interest
    /// in `strategy`, applied in registration order.
    pub fn apply_rerankers(&self, strategy: &str, query: &ContextQuery, mut chunks: Vec<RankedChunk>) -> Vec<RankedChunk> {
        let inner = self.inner.read().expect("plugin registry lock poisoned");
        for reranker in inner.rerankers.iter().filter(|r| r.strategies().contains(&strategy)) {
            chunks = reranker.rerank(query, chunks);
        }
        chunks
    }

    pub fn register_embedder(&self, name: &str, embedder: Arc<dyn EmbeddingProvider>) {
        let mut inner = self.inner.write().expect("plugin registry lock poisoned");
        inner.embedders_by_name.insert(name.to_string(), embedder);
    }

    pub fn embedder_by_name(&self, name: &str) -> Option<Arc<dyn EmbeddingProvider>> {
        let inner = self.inner.read().expect("plugin registry lock poisoned");
        inner.embedders_by_name.get(name).cloned()
    }

    pub fn register_lifecycle(&self, plugin: Arc<dyn PluginLifecycle>) {
        let mut inner = self.inner.write().expect("plugin registry lock poisoned");
        inner.lifecycles.push(plugin);
    }

    /// Runs `init(config)` on every registered lifecycle plugin, in
    /// registration order. A failing plugin does not stop the others.
    pub fn init_all(&self, config: &Value) -> Vec<(usize, Result<()>)> {
        let inner = self.inner.read().expect("plugin registry lock poisoned");
        inner
            .lifecycles
            .iter()
            .enumerate()
            .map(|(i, p)| (i, p.init(config)))
            .collect()
    }

    pub fn destroy_all(&self) -> Vec<(usize, Result<()>)> {
        let inner = self.inner.read().expect("plugin registry lock poisoned");
        inner
            .lifecycles
            .iter()
            .enumerate()
            .map(|(i, p)| (i, p.destroy()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopProcessor(&'static str);

    impl DocumentProcessorPlugin for NoopProcessor {
        fn name(&self) -> &str {
            self.0
        }
        fn process(&self, _path: &str, _bytes: &[u8], _repository: &Repository) -> Result<(Document, Vec<DocumentChunk>)> {
            anyhow::bail!("noop plugin always fails, forcing fallback to the default processor")
        }
    }

    #[test]
    fn registering_same_extension_twice_replaces_the_plugin() {
        let registry = PluginRegistry::new();
        registry.register_processor(".mdx", Arc::new(NoopProcessor("first")));
        registry.register_processor("mdx", Arc::new(NoopProcessor("second")));

        let plugin = registry.processor_for(".mdx").unwrap();
        assert_eq!(plugin.name(), "second");
    }

    struct CountingLifecycle {
        inits: AtomicUsize,
        destroys: AtomicUsize,
    }

    impl PluginLifecycle for CountingLifecycle {
        fn init(&self, _config: &Value) -> Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn destroy(&self) -> Result<()> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn init_and_destroy_run_for_every_registered_plugin() {
        let registry = PluginRegistry::new();
        let plugin = Arc::new(CountingLifecycle { inits: AtomicUsize::new(0), destroys: AtomicUsize::new(0) });
        registry.register_lifecycle(plugin.clone());

        let init_results = registry.init_all(&Value::Null);
        assert_eq!(init_results.len(), 1);
        assert!(init_results[0].1.is_ok());
        assert_eq!(plugin.inits.load(Ordering::SeqCst), 1);

        registry.destroy_all();
        assert_eq!(plugin.destroys.load(Ordering::SeqCst), 1);
    }

    struct BoostReranker;

    impl ContextReranker for BoostReranker {
        fn name(&self) -> &str {
            "boost"
        }
        fn strategies(&self) -> &[&str] {
            &["hybrid"]
        }
        fn rerank(&self, _query: &ContextQuery, mut chunks: Vec<RankedChunk>) -> Vec<RankedChunk> {
            for c in chunks.iter_mut() {
                c.score *= 2.0;
            }
            chunks
        }
    }

    #[test]
    fn rerankers_only_apply_within_declared_strategies() {
        let registry = PluginRegistry::new();
        registry.register_reranker(Arc::new(BoostReranker));

        let chunk = crate::document::DocumentChunk {
            id: "x".into(),
            document_id: "d".into(),
            repository: "r".into(),
            filepath: "f".into(),
            chunk_type: crate::document::ChunkType::Paragraph,
            content: "c".into(),
            start_line: None,
            end_line: None,
            parent_chunk_id: None,
            child_chunk_ids: Vec::new(),
            heading_context: Vec::new(),
            section: String::new(),
            title: None,
            category: None,
            language: None,
            framework: None,
            priority: crate::document::Priority::Medium,
            content_hash: "h".into(),
            embedding: None,
        };
        let ranked = vec![RankedChunk { chunk, score: 1.0, explanation: String::new() }];
        let query = ContextQuery::default();

        let hybrid_out = registry.apply_rerankers("hybrid", &query, ranked.clone());
        assert_eq!(hybrid_out[0].score, 2.0);

        let semantic_out = registry.apply_rerankers("semantic", &query, ranked);
        assert_eq!(semantic_out[0].score, 1.0);
    }
}
