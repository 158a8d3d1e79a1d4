//! Configuration (§6, Appendix A.3): JSON config loading with
//! `#[serde(default)]` everywhere, following the teacher's `config.rs`
//! convention of silently falling back to `Default` on parse failure for the
//! process-wide config file. Preset merging reuses the teacher's
//! `rules.rs::deep_merge`.

use crate::document::Repository;
use crate::error::ServiceError;
use crate::redact::is_blocklisted_key;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_chunk_size: usize,
    pub overlap_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        ChunkingConfig {
            max_chunk_size: 2000,
            overlap_size: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    pub high: f32,
    pub medium: f32,
    pub low: f32,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        PriorityWeights {
            high: 1.5,
            medium: 1.0,
            low: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextGenerationConfig {
    pub max_results: usize,
    pub max_tokens: usize,
    pub score_threshold: f32,
    pub priority_weights: PriorityWeights,
    pub overview_limit: usize,
    pub detailed_limit: usize,
    pub comprehensive_limit: usize,
}

impl Default for ContextGenerationConfig {
    fn default() -> Self {
        ContextGenerationConfig {
            max_results: 20,
            max_tokens: 8000,
            score_threshold: 0.7,
            priority_weights: PriorityWeights::default(),
            overview_limit: 3,
            detailed_limit: 10,
            comprehensive_limit: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub mode: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 7117,
            mode: "mcp".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub dimension: usize,
    pub collection: String,
    pub data_dir: String,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        VectorStoreConfig {
            dimension: 384,
            collection: "contextloom_v1".to_string(),
            data_dir: ".contextloom".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub name: String,
    pub description: Option<String>,
}

/// Top-level config file shape (§6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub project: ProjectConfig,
    pub repositories: Vec<Repository>,
    pub chunking: ChunkingConfig,
    pub context_generation: ContextGenerationConfig,
    pub server: ServerConfig,
    pub vector_store: VectorStoreConfig,
}

impl Config {
    /// Loads the config file. A missing or malformed file falls back to
    /// `Default::default()` — the process-wide config is allowed to be
    /// absent on first run.
    pub fn load(path: &Path) -> Config {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Rejects literal-looking secrets embedded directly in a repository's
    /// auth configuration rather than referenced via `credential_env` (A.3).
    pub fn validate(&self) -> Result<(), ServiceError> {
        for repo in &self.repositories {
            for (key, value) in &repo.metadata {
                if is_blocklisted_key(key) && !value.trim().is_empty() {
                    return Err(ServiceError::Validation(format!(
                        "repository '{}' embeds a literal secret in metadata key '{}'; use credential_env instead",
                        repo.name, key
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn find_repository(&self, name: &str) -> Option<&Repository> {
        self.repositories.iter().find(|r| r.name == name)
    }
}

/// Merges `patch` over `base`: objects merge key-by-key, arrays union
/// (patch elements not already present in base are appended), scalars are
/// overwritten by `patch`. Mirrors the teacher's rule-tier merge exactly,
/// repurposed here for config presets merged by repository name.
pub fn deep_merge(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            let mut out = base_map.clone();
            for (k, v) in patch_map {
                let merged = match out.get(k) {
                    Some(existing) => deep_merge(existing, v),
                    None => v.clone(),
                };
                out.insert(k.clone(), merged);
            }
            Value::Object(out)
        }
        (Value::Array(base_arr), Value::Array(patch_arr)) => {
            let mut out = base_arr.clone();
            for item in patch_arr {
                if !out.contains(item) {
                    out.push(item.clone());
                }
            }
            Value::Array(out)
        }
        (_, patch_val) => patch_val.clone(),
    }
}

/// Applies a named preset (a full or partial config fragment) over the base
/// config by repository name, as described in §6.
pub fn apply_preset(base: &Config, preset: &HashMap<String, Value>) -> anyhow::Result<Config> {
    let base_value = serde_json::to_value(base)?;
    let mut repos_by_name: HashMap<String, Value> = HashMap::new();
    if let Some(arr) = base_value.get("repositories").and_then(|v| v.as_array()) {
        for r in arr {
            if let Some(name) = r.get("name").and_then(|v| v.as_str()) {
                repos_by_name.insert(name.to_string(), r.clone());
            }
        }
    }
    for (name, patch) in preset {
        let merged = match repos_by_name.get(name) {
            Some(existing) => deep_merge(existing, patch),
            None => patch.clone(),
        };
        repos_by_name.insert(name.clone(), merged);
    }
    let mut merged_value = base_value;
    let repos: Vec<Value> = repos_by_name.into_values().collect();
    merged_value["repositories"] = Value::Array(repos);
    Ok(serde_json::from_value(merged_value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_config_round_trips_through_json() {
        let cfg = Config::default();
        let text = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(back.vector_store.dimension, 384);
    }

    #[test]
    fn load_falls_back_to_default_on_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not valid json").unwrap();
        let cfg = Config::load(&path);
        assert_eq!(cfg.server.port, 7117);
    }

    #[test]
    fn deep_merge_unions_arrays_and_overwrites_scalars() {
        let base = json!({"paths": ["a", "b"], "priority": "low"});
        let patch = json!({"paths": ["b", "c"], "priority": "high"});
        let merged = deep_merge(&base, &patch);
        assert_eq!(merged["priority"], "high");
        assert_eq!(merged["paths"], json!(["a", "b", "c"]));
    }

    #[test]
    fn validate_rejects_literal_secret_in_metadata() {
        let mut cfg = Config::default();
        let mut repo = Repository {
            name: "demo".into(),
            clone_url: "https://example.com/demo.git".into(),
            branch: "main".into(),
            auth: crate::document::AuthMode::Token,
            credential_env: None,
            paths: Vec::new(),
            exclude: Vec::new(),
            priority: crate::document::Priority::Medium,
            category: None,
            sync_interval: 0,
            metadata: HashMap::new(),
        };
        repo.metadata.insert("api_key".to_string(), "sk-literal-secret-value".to_string());
        cfg.repositories.push(repo);
        assert!(cfg.validate().is_err());
    }
}
