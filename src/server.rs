//! JSON-RPC surface over stdio (§6): `initialize`, `tools/list`,
//! `tools/call`, `resources/list`, `resources/read`, `prompts/list`,
//! `prompts/get`.
//!
//! Grounded on the teacher's `ServerState`/`tool_list`/`tool_call`/
//! `run_stdio_server` dispatch shape — line-delimited JSON-RPC over stdio,
//! `ok`/`err` response closures wrapping tool results as
//! `{"content":[{"type":"text",...}],"isError":bool}`. The teacher's loop is
//! synchronous (its six AST tools are synchronous); here every tool touches
//! the index or the network, so the loop and every handler are async. The
//! teacher's workspace-root-resolution state (`capture_init_root`,
//! `repo_root_from_params`, `extract_path_from_uri`) has no analog in this
//! domain and is dropped; `resources/read` and `prompts/get` are new
//! dispatch arms the teacher's stubs never reached.

use crate::context_generator::{ContextQuery, ProgressiveLevel, Strategy};
use crate::error::ServiceError;
use crate::state::AppState;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

const PROTOCOL_VERSION: &str = "2024-11-05";

fn tool_list_payload() -> Value {
    json!({
        "tools": [
            {
                "name": "search_documentation",
                "description": "Search indexed documentation across synced repositories and return the best-matching chunks.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "query": {"type": "string"},
                        "repository": {"type": "string"},
                        "category": {"type": "string"},
                        "limit": {"type": "integer"}
                    },
                    "required": ["query"]
                }
            },
            {
                "name": "generate_context",
                "description": "Assemble a token-budgeted, ranked markdown context block for a coding task.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "task": {"type": "string"},
                        "language": {"type": "string"},
                        "framework": {"type": "string"},
                        "context": {"type": "string"},
                        "max_results": {"type": "integer"},
                        "repositories": {"type": "array", "items": {"type": "string"}},
                        "categories": {"type": "array", "items": {"type": "string"}},
                        "strategy": {"type": "string", "enum": ["semantic", "keyword", "hybrid"]},
                        "level": {"type": "string", "enum": ["overview", "detailed", "comprehensive"]}
                    },
                    "required": ["task"]
                }
            },
            {
                "name": "get_repository_status",
                "description": "Report the sync status of one configured repository, or all of them.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "repository": {"type": "string"}
                    }
                }
            },
            {
                "name": "sync_repository",
                "description": "Trigger an on-demand git sync plus re-indexing for a configured repository.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "repository": {"type": "string"}
                    }
                }
            }
        ]
    })
}

fn resource_list_payload() -> Value {
    json!({
        "resources": [
            {"uri": "docs://status", "name": "Repository sync status", "mimeType": "application/json"},
            {"uri": "docs://stats", "name": "Vector index statistics", "mimeType": "application/json"}
        ]
    })
}

fn prompt_list_payload() -> Value {
    json!({
        "prompts": [
            {
                "name": "explain_code",
                "description": "Explain a symbol or file using the indexed documentation as grounding.",
                "arguments": [{"name": "subject", "required": true}, {"name": "language", "required": false}]
            },
            {
                "name": "write_documentation",
                "description": "Draft documentation for a feature, matching the conventions of the indexed docs.",
                "arguments": [{"name": "feature", "required": true}, {"name": "repository", "required": false}]
            },
            {
                "name": "code_example",
                "description": "Produce a minimal, idiomatic usage example grounded in indexed documentation.",
                "arguments": [{"name": "task", "required": true}, {"name": "language", "required": false}]
            }
        ]
    })
}

fn parse_strategy(raw: Option<&str>) -> Strategy {
    match raw {
        Some("semantic") => Strategy::Semantic,
        Some("keyword") => Strategy::Keyword,
        _ => Strategy::Hybrid,
    }
}

fn parse_level(raw: Option<&str>) -> ProgressiveLevel {
    match raw {
        Some("overview") => ProgressiveLevel::Overview,
        Some("comprehensive") => ProgressiveLevel::Comprehensive,
        _ => ProgressiveLevel::Detailed,
    }
}

async fn handle_search_documentation(state: &AppState, args: &Value) -> Result<Value, ServiceError> {
    let query_text = args.get("query").and_then(Value::as_str).unwrap_or_default().to_string();
    if query_text.trim().is_empty() {
        return Err(ServiceError::Validation("'query' is required".to_string()));
    }
    let query = ContextQuery {
        task: query_text,
        repositories: args.get("repository").and_then(Value::as_str).map(|s| vec![s.to_string()]),
        categories: args.get("category").and_then(Value::as_str).map(|s| vec![s.to_string()]),
        max_results: args.get("limit").and_then(Value::as_u64).map(|n| n as usize),
        strategy: Strategy::Hybrid,
        ..Default::default()
    };
    let result = state.context_generator.generate(&query).await.map_err(ServiceError::from)?;
    let hits: Vec<Value> = result
        .chunks
        .iter()
        .map(|rc| {
            json!({
                "repository": rc.chunk.repository,
                "filepath": rc.chunk.filepath,
                "section": rc.chunk.section,
                "score": rc.score,
                "explanation": rc.explanation,
                "content": rc.chunk.content,
            })
        })
        .collect();
    Ok(json!({"strategy": result.metadata.strategy, "results": hits}))
}

async fn handle_generate_context(state: &AppState, args: &Value) -> Result<Value, ServiceError> {
    let task = args.get("task").and_then(Value::as_str).unwrap_or_default().to_string();
    if task.trim().is_empty() {
        return Err(ServiceError::Validation("'task' is required".to_string()));
    }
    let query = ContextQuery {
        task,
        language: args.get("language").and_then(Value::as_str).map(String::from),
        framework: args.get("framework").and_then(Value::as_str).map(String::from),
        context: args.get("context").and_then(Value::as_str).map(String::from),
        max_results: args.get("max_results").and_then(Value::as_u64).map(|n| n as usize),
        repositories: args
            .get("repositories")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect()),
        categories: args
            .get("categories")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect()),
        strategy: parse_strategy(args.get("strategy").and_then(Value::as_str)),
    };

    if let Some(level_raw) = args.get("level").and_then(Value::as_str) {
        let level = parse_level(Some(level_raw));
        let progressive = state
            .context_generator
            .generate_progressive(&query, level)
            .await
            .map_err(ServiceError::from)?;
        return Ok(json!({
            "content": progressive.result.content,
            "metadata": progressive.result.metadata,
            "hasMore": progressive.has_more,
            "nextLevel": progressive.next_level,
        }));
    }

    let result = state.context_generator.generate(&query).await.map_err(ServiceError::from)?;
    Ok(json!({"content": result.content, "metadata": result.metadata}))
}

async fn handle_get_repository_status(state: &AppState, args: &Value) -> Result<Value, ServiceError> {
    match args.get("repository").and_then(Value::as_str) {
        Some(name) => {
            let config = state.config.read().await;
            if config.find_repository(name).is_none() {
                return Err(ServiceError::NotFound(format!("repository '{name}' is not configured")));
            }
            Ok(json!({name: format!("{:?}", state.git_sync.status(name))}))
        }
        None => {
            let statuses = state.git_sync.all_statuses();
            let rendered: serde_json::Map<String, Value> =
                statuses.into_iter().map(|(k, v)| (k, Value::String(format!("{v:?}")))).collect();
            Ok(Value::Object(rendered))
        }
    }
}

async fn handle_sync_repository(state: &AppState, args: &Value) -> Result<Value, ServiceError> {
    let repo_name = args.get("repository").and_then(Value::as_str);
    let repo = state.resolve_repository(repo_name).await?;
    let cfg = state.config.read().await.clone();
    let outcome = crate::ingest::ingest_repository(
        &repo,
        &state.git_sync,
        state.index.as_ref(),
        state.embedder.as_ref(),
        &cfg.chunking,
    )
    .await
    .map_err(ServiceError::from)?;
    Ok(json!({
        "repository": outcome.repository,
        "changedFiles": outcome.changed_files.len(),
        "commit": outcome.commit,
        "fullWalk": outcome.full_walk,
    }))
}

async fn handle_resource_read(state: &AppState, uri: &str) -> Result<Value, ServiceError> {
    match uri {
        "docs://status" => {
            let statuses = state.git_sync.all_statuses();
            let rendered: serde_json::Map<String, Value> =
                statuses.into_iter().map(|(k, v)| (k, Value::String(format!("{v:?}")))).collect();
            Ok(Value::Object(rendered))
        }
        "docs://stats" => {
            let stats = state.index.stats().await.map_err(ServiceError::from)?;
            serde_json::to_value(stats).map_err(|e| ServiceError::Fatal(e.to_string()))
        }
        other => Err(ServiceError::NotFound(format!("unknown resource uri '{other}'"))),
    }
}

fn prompt_get_payload(name: &str, arguments: &Value) -> Result<Value, ServiceError> {
    let text = match name {
        "explain_code" => {
            let subject = arguments.get("subject").and_then(Value::as_str).unwrap_or("the given symbol");
            format!(
                "Using the indexed documentation as grounding, explain {subject} clearly: its purpose, \
                 how it is used, and any gotchas documented for it."
            )
        }
        "write_documentation" => {
            let feature = arguments.get("feature").and_then(Value::as_str).unwrap_or("the given feature");
            format!(
                "Draft documentation for {feature}, matching the tone, structure and heading conventions \
                 already used in the indexed documentation for this repository."
            )
        }
        "code_example" => {
            let task = arguments.get("task").and_then(Value::as_str).unwrap_or("the given task");
            format!(
                "Using the indexed documentation as grounding, produce a minimal, idiomatic code example \
                 that accomplishes: {task}."
            )
        }
        other => return Err(ServiceError::NotFound(format!("unknown prompt '{other}'"))),
    };
    Ok(json!({
        "description": format!("Prompt '{name}' grounded in indexed documentation"),
        "messages": [{"role": "user", "content": {"type": "text", "text": text}}]
    }))
}

/// Dispatches one already-parsed JSON-RPC request and returns the reply
/// value, or `None` for notifications (no `id`) that require no response.
pub async fn dispatch(state: &AppState, request: Value) -> Option<Value> {
    let id = request.get("id").cloned();
    let Some(method) = request.get("method").and_then(Value::as_str) else {
        return id.map(|id| rpc_error(id, -32600, "invalid request: missing 'method'"));
    };
    let Some(id) = id else {
        debug!(method, "ignoring notification (no id)");
        return None;
    };

    let params = request.get("params").cloned().unwrap_or(Value::Null);

    let reply = match method {
        "initialize" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}, "resources": {}, "prompts": {}},
                "serverInfo": {"name": "contextloom", "version": env!("CARGO_PKG_VERSION")}
            }
        }),
        "ping" => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
        "tools/list" => json!({"jsonrpc": "2.0", "id": id, "result": tool_list_payload()}),
        "tools/call" => {
            let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
            let arguments = params.get("arguments").cloned().unwrap_or(Value::Object(Default::default()));
            let outcome = match name {
                "search_documentation" => handle_search_documentation(state, &arguments).await,
                "generate_context" => handle_generate_context(state, &arguments).await,
                "get_repository_status" => handle_get_repository_status(state, &arguments).await,
                "sync_repository" => handle_sync_repository(state, &arguments).await,
                other => Err(ServiceError::NotFound(format!("unknown tool '{other}'"))),
            };
            match outcome {
                Ok(value) => tool_result(id, serde_json::to_string_pretty(&value).unwrap_or_default(), false),
                Err(e) => {
                    warn!(tool = name, error = %e, "tool call failed");
                    tool_result(id, e.redacted_message(), true)
                }
            }
        }
        "resources/list" => json!({"jsonrpc": "2.0", "id": id, "result": resource_list_payload()}),
        "resources/read" => {
            let uri = params.get("uri").and_then(Value::as_str).unwrap_or_default();
            match handle_resource_read(state, uri).await {
                Ok(value) => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"contents": [{"uri": uri, "mimeType": "application/json", "text": value.to_string()}]}
                }),
                Err(e) => rpc_error(id, e.rpc_code(), &e.redacted_message()),
            }
        }
        "prompts/list" => json!({"jsonrpc": "2.0", "id": id, "result": prompt_list_payload()}),
        "prompts/get" => {
            let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
            let arguments = params.get("arguments").cloned().unwrap_or(Value::Object(Default::default()));
            match prompt_get_payload(name, &arguments) {
                Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                Err(e) => rpc_error(id, e.rpc_code(), &e.redacted_message()),
            }
        }
        other => rpc_error(id, -32601, &format!("method not found: {other}")),
    };

    Some(reply)
}

fn tool_result(id: Value, text: String, is_error: bool) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {"content": [{"type": "text", "text": text}], "isError": is_error}
    })
}

fn rpc_error(id: Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

/// Reads line-delimited JSON-RPC requests from stdin and writes replies to
/// stdout, one JSON object per line. Parse failures and notifications are
/// silently skipped, matching the teacher's loop.
pub async fn run_stdio_server(state: Arc<AppState>) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let request: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "skipping unparsable line on stdin");
                continue;
            }
        };

        if let Some(reply) = dispatch(&state, request).await {
            let text = serde_json::to_string(&reply)?;
            stdout.write_all(text.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context_generator::ContextGenerator;
    use crate::embedding::{EmbeddingProvider, EMBED_DIMENSION};
    use crate::git_sync::GitSync;
    use crate::plugin::PluginRegistry;
    use crate::scheduler::Scheduler;
    use crate::vector_index::{IndexStats, MetadataFilter, SearchOptions, VectorIndex};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct StubEmbedder;

    #[async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(vec![1.0; EMBED_DIMENSION])
        }
        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0; EMBED_DIMENSION]).collect())
        }
        fn dimension(&self) -> usize {
            EMBED_DIMENSION
        }
        fn model_version(&self) -> &str {
            "stub"
        }
    }

    struct EmptyIndex;

    #[async_trait]
    impl VectorIndex for EmptyIndex {
        async fn upsert(&self, _chunks: Vec<crate::document::DocumentChunk>) -> anyhow::Result<()> {
            Ok(())
        }
        async fn search_by_vector(
            &self,
            _vector: &[f32],
            _opts: &SearchOptions,
        ) -> anyhow::Result<Vec<(crate::document::DocumentChunk, f32)>> {
            Ok(Vec::new())
        }
        async fn search_by_metadata(&self, _filter: &MetadataFilter, _limit: usize) -> anyhow::Result<Vec<crate::document::DocumentChunk>> {
            Ok(Vec::new())
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

    fn test_state() -> Arc<AppState> {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(StubEmbedder);
        let index: Arc<dyn VectorIndex> = Arc::new(EmptyIndex);
        let config = Config::default();
        let generator = Arc::new(ContextGenerator::new(embedder.clone(), index.clone(), config.context_generation.clone()));
        let git_sync = Arc::new(GitSync::new(std::path::PathBuf::from("/tmp/contextloom-server-test")));
        let scheduler = Arc::new(Scheduler::new(git_sync.clone(), embedder.clone(), index.clone(), config.chunking));
        Arc::new(AppState {
            config: tokio::sync::RwLock::new(config),
            config_path: std::path::PathBuf::from("/tmp/contextloom-server-test/config.json"),
            git_sync,
            embedder,
            index,
            context_generator: generator,
            plugins: Arc::new(PluginRegistry::new()),
            scheduler,
        })
    }

    #[tokio::test]
    async fn initialize_reports_protocol_version_and_capabilities() {
        let state = test_state();
        let reply = dispatch(&state, json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}))
            .await
            .unwrap();
        assert_eq!(reply["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert!(reply["result"]["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn notifications_without_id_produce_no_reply() {
        let state = test_state();
        let reply = dispatch(&state, json!({"jsonrpc": "2.0", "method": "notifications/initialized"})).await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn tools_list_includes_all_four_pipeline_tools() {
        let state = test_state();
        let reply = dispatch(&state, json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"})).await.unwrap();
        let names: Vec<&str> = reply["result"]["tools"].as_array().unwrap().iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["search_documentation", "generate_context", "get_repository_status", "sync_repository"]);
    }

    #[tokio::test]
    async fn unknown_method_returns_method_not_found_error() {
        let state = test_state();
        let reply = dispatch(&state, json!({"jsonrpc": "2.0", "id": 1, "method": "nonexistent"})).await.unwrap();
        assert_eq!(reply["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn search_documentation_without_query_is_a_validation_error_tool_result() {
        let state = test_state();
        let reply = dispatch(
            &state,
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "search_documentation", "arguments": {}}}),
        )
        .await
        .unwrap();
        assert_eq!(reply["result"]["isError"], true);
    }

    #[tokio::test]
    async fn get_repository_status_for_unknown_repository_is_not_found() {
        let state = test_state();
        let reply = dispatch(
            &state,
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "get_repository_status", "arguments": {"repository": "nope"}}}),
        )
        .await
        .unwrap();
        assert_eq!(reply["result"]["isError"], true);
    }

    #[tokio::test]
    async fn resources_read_unknown_uri_is_an_rpc_error() {
        let state = test_state();
        let reply = dispatch(&state, json!({"jsonrpc": "2.0", "id": 1, "method": "resources/read", "params": {"uri": "docs://bogus"}}))
            .await
            .unwrap();
        assert!(reply.get("error").is_some());
    }

    #[tokio::test]
    async fn prompts_get_explain_code_renders_subject_into_prompt_text() {
        let state = test_state();
        let reply = dispatch(
            &state,
            json!({"jsonrpc": "2.0", "id": 1, "method": "prompts/get", "params": {"name": "explain_code", "arguments": {"subject": "GitSync"}}}),
        )
        .await
        .unwrap();
        let text = reply["result"]["messages"][0]["content"]["text"].as_str().unwrap();
        assert!(text.contains("GitSync"));
    }
}
