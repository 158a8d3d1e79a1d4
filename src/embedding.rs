//! EmbeddingProvider (§4.3): `embed`/`embed_batch`, a coalescing batch
//! window, and a bounded LRU cache keyed by `(modelVersion, hash(text))`.
//!
//! Grounded on the teacher's `CodebaseIndex` (`model2vec_rs::model::StaticModel`,
//! the `passage:`/`query:` prefixing convention, `index_meta_v2.json`
//! model-version tracking) for the local backend, and on
//! `other_examples/021be95f_vyotiq-ai-vyotiq-agent__rust-backend-src-embedder.rs.rs`
//! for the batching constants and the `Arc<Mutex<Option<Model>>>` +
//! `AtomicBool` lazy-init pattern.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

pub const EMBED_DIMENSION: usize = 384;
pub const EMBED_BATCH_SIZE: usize = 32;
pub const EMBED_BATCH_WINDOW: Duration = Duration::from_millis(50);
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn dimension(&self) -> usize;
    fn model_version(&self) -> &str;
}

/// Bounded LRU keyed by `(modelVersion, hash(text))`. Insertion evicts the
/// least recently used entry once at capacity.
struct LruCache {
    capacity: usize,
    map: HashMap<u64, Vec<f32>>,
    order: Vec<u64>,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        LruCache {
            capacity,
            map: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn key(model_version: &str, text: &str) -> u64 {
        use xxhash_rust::xxh3::xxh3_64;
        let mut buf = Vec::with_capacity(model_version.len() + text.len() + 1);
        buf.extend_from_slice(model_version.as_bytes());
        buf.push(0);
        buf.extend_from_slice(text.as_bytes());
        xxh3_64(&buf)
    }

    fn get(&mut self, key: u64) -> Option<Vec<f32>> {
        if let Some(v) = self.map.get(&key).cloned() {
            self.touch(key);
            Some(v)
        } else {
            None
        }
    }

    fn touch(&mut self, key: u64) {
        if let Some(pos) = self.order.iter().position(|k| *k == key) {
            self.order.remove(pos);
        }
        self.order.push(key);
    }

    fn put(&mut self, key: u64, value: Vec<f32>) {
        if self.map.contains_key(&key) {
            self.map.insert(key, value);
            self.touch(key);
            return;
        }
        if self.map.len() >= self.capacity {
            if !self.order.is_empty() {
                let oldest = self.order.remove(0);
                self.map.remove(&oldest);
            }
        }
        self.map.insert(key, value);
        self.order.push(key);
    }
}

/// Local in-process backend. Lazily loads a `model2vec_rs::model::StaticModel`
/// behind an `Arc<Mutex<Option<_>>>` guarded by an `AtomicBool` so concurrent
/// callers don't race the load.
pub struct LocalEmbeddingProvider {
    model_path: PathBuf,
    model_version: String,
    loaded: Arc<AtomicBool>,
    model: Arc<Mutex<Option<model2vec_rs::model::StaticModel>>>,
    cache: Arc<AsyncMutex<LruCache>>,
}

impl LocalEmbeddingProvider {
    pub fn new(model_path: PathBuf, model_version: impl Into<String>) -> Self {
        LocalEmbeddingProvider {
            model_path,
            model_version: model_version.into(),
            loaded: Arc::new(AtomicBool::new(false)),
            model: Arc::new(Mutex::new(None)),
            cache: Arc::new(AsyncMutex::new(LruCache::new(DEFAULT_CACHE_CAPACITY))),
        }
    }

    fn ensure_loaded(
        model_path: &PathBuf,
        loaded: &AtomicBool,
        model: &Mutex<Option<model2vec_rs::model::StaticModel>>,
    ) -> Result<()> {
        if loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut guard = model.lock().expect("embedding model mutex poisoned");
        if guard.is_none() {
            let loaded_model = model2vec_rs::model::StaticModel::from_pretrained(
                model_path.to_string_lossy().as_ref(),
                None,
                None,
                None,
            )
            .context("loading local embedding model")?;
            *guard = Some(loaded_model);
        }
        loaded.store(true, Ordering::Release);
        Ok(())
    }

    fn embed_raw_blocking(
        model_path: &PathBuf,
        loaded: &AtomicBool,
        model: &Mutex<Option<model2vec_rs::model::StaticModel>>,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        Self::ensure_loaded(model_path, loaded, model)?;
        let guard = model.lock().expect("embedding model mutex poisoned");
        let m = guard.as_ref().expect("model loaded by ensure_loaded");
        let prefixed: Vec<String> = texts.iter().map(|t| format!("passage: {t}")).collect();
        Ok(m.encode(&prefixed))
    }

    /// Runs the (CPU-bound) encode call on the blocking pool, sharing the
    /// already-loaded model rather than reloading it per call.
    async fn embed_raw(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let model_path = self.model_path.clone();
        let loaded = self.loaded.clone();
        let model = self.model.clone();
        tokio::task::spawn_blocking(move || {
            Self::embed_raw_blocking(&model_path, &loaded, &model, &texts)
        })
        .await
        .context("embedding task panicked")?
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = LruCache::key(&self.model_version, text);
        {
            let mut cache = self.cache.lock().await;
            if let Some(cached) = cache.get(key) {
                return Ok(cached);
            }
        }
        let vector = self
            .embed_raw(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();

        let mut cache = self.cache.lock().await;
        cache.put(key, vector.clone());
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut to_compute: Vec<(usize, String)> = Vec::new();
        {
            let mut cache = self.cache.lock().await;
            for (i, t) in texts.iter().enumerate() {
                let key = LruCache::key(&self.model_version, t);
                if let Some(v) = cache.get(key) {
                    results[i] = Some(v);
                } else {
                    to_compute.push((i, t.clone()));
                }
            }
        }

        for batch in to_compute.chunks(EMBED_BATCH_SIZE) {
            let batch_texts: Vec<String> = batch.iter().map(|(_, t)| t.clone()).collect();
            let computed = match self.embed_raw(batch_texts.clone()).await {
                Ok(v) => v,
                Err(_) => {
                    // Batch failure falls back to per-item embed (§4.3).
                    let mut fallback = Vec::with_capacity(batch_texts.len());
                    for t in &batch_texts {
                        fallback.push(self.embed_raw(vec![t.clone()]).await?.remove(0));
                    }
                    fallback
                }
            };
            let mut cache = self.cache.lock().await;
            for ((idx, text), vector) in batch.iter().zip(computed.into_iter()) {
                let key = LruCache::key(&self.model_version, text);
                cache.put(key, vector.clone());
                results[*idx] = Some(vector);
            }
        }

        Ok(results.into_iter().map(|v| v.unwrap_or_default()).collect())
    }

    fn dimension(&self) -> usize {
        EMBED_DIMENSION
    }

    fn model_version(&self) -> &str {
        &self.model_version
    }
}

/// Buffers concurrent `embed` callers for up to `EMBED_BATCH_WINDOW` so they
/// can be served by a single `embed_batch` call underneath.
pub struct CoalescingBatcher<P: EmbeddingProvider> {
    provider: Arc<P>,
    pending: Arc<AsyncMutex<Vec<(String, oneshot::Sender<Result<Vec<f32>, String>>)>>>,
}

impl<P: EmbeddingProvider + 'static> CoalescingBatcher<P> {
    pub fn new(provider: Arc<P>) -> Self {
        CoalescingBatcher {
            provider,
            pending: Arc::new(AsyncMutex::new(Vec::new())),
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let (tx, rx) = oneshot::channel();
        let should_spawn_flush = {
            let mut pending = self.pending.lock().await;
            pending.push((text.to_string(), tx));
            pending.len() == 1
        };

        if should_spawn_flush {
            let provider = self.provider.clone();
            let pending = self.pending.clone();
            tokio::spawn(async move {
                tokio::time::sleep(EMBED_BATCH_WINDOW).await;
                let batch = {
                    let mut p = pending.lock().await;
                    std::mem::take(&mut *p)
                };
                if batch.is_empty() {
                    return;
                }
                let texts: Vec<String> = batch.iter().map(|(t, _)| t.clone()).collect();
                match provider.embed_batch(&texts).await {
                    Ok(vectors) => {
                        for ((_, tx), vector) in batch.into_iter().zip(vectors.into_iter()) {
                            let _ = tx.send(Ok(vector));
                        }
                    }
                    Err(e) => {
                        let msg = e.to_string();
                        for (_, tx) in batch {
                            let _ = tx.send(Err(msg.clone()));
                        }
                    }
                }
            });
        }

        rx.await
            .context("embedding batch worker dropped")?
            .map_err(|msg| anyhow::anyhow!(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_evicts_oldest_entry_past_capacity() {
        let mut cache = LruCache::new(2);
        cache.put(1, vec![1.0]);
        cache.put(2, vec![2.0]);
        cache.put(3, vec![3.0]);
        assert!(cache.get(1).is_none(), "entry 1 should have been evicted");
        assert!(cache.get(2).is_some());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn lru_touch_on_get_protects_from_eviction() {
        let mut cache = LruCache::new(2);
        cache.put(1, vec![1.0]);
        cache.put(2, vec![2.0]);
        cache.get(1); // 1 is now most-recently-used
        cache.put(3, vec![3.0]);
        assert!(cache.get(2).is_none(), "entry 2 should have been evicted, not 1");
        assert!(cache.get(1).is_some());
    }

    #[test]
    fn cache_key_depends_on_model_version_and_text() {
        let a = LruCache::key("v1", "hello");
        let b = LruCache::key("v2", "hello");
        let c = LruCache::key("v1", "hello");
        assert_ne!(a, b);
        assert_eq!(a, c);
    }
}
