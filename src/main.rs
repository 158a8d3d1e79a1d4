//! CLI entry point (§6, Appendix A.4): `sync`, `search`, `status`, `start`.
//!
//! Grounded on the teacher's `main.rs` `clap::Parser`/`Subcommand` shape and
//! its pattern of matching the subcommand before doing any heavier wiring.
//! Logging init (Appendix A.1) replaces the teacher's `debug_log!` macro
//! with `tracing_subscriber::fmt` + `EnvFilter`, stderr-only so stdout stays
//! clean for JSON-RPC framing in `mcp` mode.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use contextloom::config::Config;
use contextloom::context_generator::{ContextGenerator, ContextQuery};
use contextloom::document::Repository;
use contextloom::embedding::{EmbeddingProvider, LocalEmbeddingProvider};
use contextloom::git_sync::GitSync;
use contextloom::ingest::ingest_repository;
use contextloom::plugin::PluginRegistry;
use contextloom::scheduler::Scheduler;
use contextloom::server::run_stdio_server;
use contextloom::state::AppState;
use contextloom::vector_index::{FileVectorIndex, VectorIndex};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "contextloom")]
#[command(version)]
#[command(about = "Documentation retrieval service: git sync, chunking, embedding and ranked context generation")]
struct Cli {
    /// Path to the config file (default: config/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sync one or all configured repositories and re-index changed documents.
    Sync {
        #[arg(long)]
        repository: Option<String>,
    },
    /// Run a one-off search against the indexed documentation.
    Search { query: String },
    /// Print the sync status of every configured repository.
    Status,
    /// Start a long-running server.
    Start {
        #[arg(long, default_value = "mcp")]
        mode: String,
        #[arg(long)]
        port: Option<u16>,
    },
}

struct Wiring {
    config: Config,
    config_path: PathBuf,
    git_sync: Arc<GitSync>,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    context_generator: Arc<ContextGenerator>,
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_writer(std::io::stderr).with_env_filter(filter).init();
}

fn workspace_root() -> PathBuf {
    PathBuf::from("data/repos")
}

fn default_config_path() -> PathBuf {
    PathBuf::from("config/config.json")
}

/// Builds everything from configuration and environment (§6 Environment
/// variables). `VECTOR_URL` and a non-`local` `EMBEDDING_PROVIDER` are
/// accepted but only the local backends are implemented; both are logged
/// and otherwise ignored rather than silently misbehaving.
fn wire(config_path: PathBuf) -> Result<Wiring> {
    let config = Config::load(&config_path);
    config.validate().context("config failed validation")?;

    if let Ok(url) = std::env::var("VECTOR_URL") {
        warn!(url, "VECTOR_URL is set but no remote vector backend is implemented; using the local file index");
    }
    let embedding_provider = std::env::var("EMBEDDING_PROVIDER").unwrap_or_else(|_| "local".to_string());
    if embedding_provider != "local" {
        warn!(embedding_provider, "only the 'local' embedding provider is implemented; using it regardless");
    }
    let embedding_model = std::env::var("EMBEDDING_MODEL").unwrap_or_else(|_| "minishlab/potion-retrieval-32M".to_string());

    let git_sync = Arc::new(GitSync::new(workspace_root()));
    let embedder: Arc<dyn EmbeddingProvider> =
        Arc::new(LocalEmbeddingProvider::new(PathBuf::from(&embedding_model), embedding_model));

    let index_path = PathBuf::from(&config.vector_store.data_dir).join(format!("{}.json", config.vector_store.collection));
    let index: Arc<dyn VectorIndex> = Arc::new(FileVectorIndex::open(&index_path, config.vector_store.dimension)?);

    let context_generator = Arc::new(ContextGenerator::new(embedder.clone(), index.clone(), config.context_generation.clone()));

    Ok(Wiring { config, config_path, git_sync, embedder, index, context_generator })
}

async fn run_sync(wiring: &Wiring, repository: Option<String>) -> Result<()> {
    let targets: Vec<Repository> = match repository {
        Some(name) => vec![wiring
            .config
            .find_repository(&name)
            .cloned()
            .with_context(|| format!("repository '{name}' is not configured"))?],
        None => wiring.config.repositories.clone(),
    };

    if targets.is_empty() {
        println!("no repositories configured");
        return Ok(());
    }

    for repo in &targets {
        info!(repository = %repo.name, "syncing");
        let outcome = ingest_repository(repo, &wiring.git_sync, wiring.index.as_ref(), wiring.embedder.as_ref(), &wiring.config.chunking).await?;
        println!(
            "{}: {} file(s) changed, commit={}",
            outcome.repository,
            outcome.changed_files.len(),
            outcome.commit.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}

async fn run_search(wiring: &Wiring, query: String) -> Result<()> {
    let result = wiring.context_generator.generate(&ContextQuery { task: query, ..Default::default() }).await?;
    println!("{}", result.content);
    eprintln!(
        "({} chunks, strategy={}, tokens_used={})",
        result.metadata.total_chunks, result.metadata.strategy, result.metadata.tokens_used
    );
    Ok(())
}

fn run_status(wiring: &Wiring) -> Result<()> {
    let statuses = wiring.git_sync.all_statuses();
    for repo in &wiring.config.repositories {
        let status = statuses.get(&repo.name).cloned().unwrap_or(contextloom::git_sync::RepoStatus::Idle);
        println!("{}: {:?}", repo.name, status);
    }
    Ok(())
}

async fn run_start(wiring: Wiring, mode: String, port: Option<u16>) -> Result<()> {
    let port = port.unwrap_or(wiring.config.server.port);
    let plugins = Arc::new(PluginRegistry::new());
    let scheduler = Arc::new(Scheduler::new(
        wiring.git_sync.clone(),
        wiring.embedder.clone(),
        wiring.index.clone(),
        wiring.config.chunking,
    ));
    for repo in &wiring.config.repositories {
        scheduler.schedule(repo.clone()).await;
    }

    let config_value = serde_json::to_value(&wiring.config).unwrap_or(serde_json::Value::Null);
    for (index, result) in plugins.init_all(&config_value) {
        if let Err(e) = result {
            warn!(plugin_index = index, error = %e, "plugin init failed");
        }
    }

    let state = Arc::new(AppState {
        config: tokio::sync::RwLock::new(wiring.config),
        config_path: wiring.config_path,
        git_sync: wiring.git_sync,
        embedder: wiring.embedder,
        index: wiring.index,
        context_generator: wiring.context_generator,
        plugins: plugins.clone(),
        scheduler,
    });

    let result = match mode.as_str() {
        "mcp" => {
            info!("starting JSON-RPC stdio server");
            run_stdio_server(state).await
        }
        "api" => {
            let addr = format!("0.0.0.0:{port}");
            info!(%addr, "starting REST server");
            let listener = tokio::net::TcpListener::bind(&addr).await.context("binding REST listener")?;
            axum::serve(listener, contextloom::rest::router(state)).await.context("REST server error")
        }
        "enhanced" => {
            let addr = format!("0.0.0.0:{port}");
            info!(%addr, "starting REST server with background repository sync");
            let listener = tokio::net::TcpListener::bind(&addr).await.context("binding REST listener")?;
            axum::serve(listener, contextloom::rest::router(state)).await.context("REST server error")
        }
        "websocket" => {
            Err(anyhow::anyhow!("the 'websocket' start mode is not implemented; use 'mcp', 'api' or 'enhanced'"))
        }
        other => Err(anyhow::anyhow!("unknown start mode '{other}'")),
    };

    for (index, destroy_result) in plugins.destroy_all() {
        if let Err(e) = destroy_result {
            warn!(plugin_index = index, error = %e, "plugin destroy failed");
        }
    }

    result
}

fn main() {
    init_logging();
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };

    let wiring = match wire(config_path) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(2);
        }
    };

    let result = rt.block_on(async {
        match cli.cmd {
            Command::Sync { repository } => run_sync(&wiring, repository).await,
            Command::Search { query } => run_search(&wiring, query).await,
            Command::Status => run_status(&wiring),
            Command::Start { mode, port } => run_start(wiring, mode, port).await,
        }
    });

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
