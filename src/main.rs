//! # Memory Harness CLI (`memh`)
//!
//! The `memh` binary drives the memory engine: database initialization,
//! one-shot and continuous ingestion of the notes tree, retrieval, and
//! inspection of tag signals and engine state.
//!
//! ## Usage
//!
//! ```bash
//! memh --config ./config/memh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `memh init` | Create the SQLite database and run schema migrations |
//! | `memh sync` | Scan the notes tree once and ingest every change |
//! | `memh watch` | Keep ingesting changes until interrupted |
//! | `memh search "<query>"` | Retrieve chunks for a query |
//! | `memh get <path>` | Print the stored chunks of one or more files |
//! | `memh signals "<query>"` | Show the tag signal analysis and query plan |
//! | `memh stats` | Print store, index and cache statistics |
//!
//! Logging goes to stderr and is filtered with `RUST_LOG` (default `info`);
//! command output is JSON on stdout.

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use memory_harness::config::{load_config, Config};
use memory_harness::context::ContextWindow;
use memory_harness::embedding::create_provider;
use memory_harness::index::FlatIndexFactory;
use memory_harness::retrieval::RetrievalRequest;
use memory_harness::{db, migrate, Engine};

/// Memory Harness CLI: a local-first semantic memory engine.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "memh",
    about = "Memory Harness: a local-first semantic memory engine",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/memh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Scan the notes tree once and ingest added, changed and removed files.
    Sync,

    /// Watch the notes tree and ingest changes until Ctrl-C.
    Watch,

    /// Retrieve chunks for a query.
    Search {
        /// The query text.
        query: String,

        /// Restrict to one corpus. Repeat for several; omit for all.
        #[arg(long)]
        corpus: Vec<String>,

        /// Result count. Defaults to the planner's dynamic K.
        #[arg(long)]
        k: Option<usize>,

        /// Modifier marker, e.g. `::Time::Rerank::TagMemo0.3:1.5`.
        #[arg(long, default_value = "")]
        modifiers: String,

        /// Preceding conversation turns, oldest first.
        #[arg(long)]
        context: Vec<String>,
    },

    /// Print the stored chunks of files, by path relative to the notes root.
    Get {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Show the tag signal analysis, query plan and nearest tags for a query.
    Signals {
        query: String,

        /// Number of similar tags to list.
        #[arg(long, default_value_t = 10)]
        tags: usize,
    },

    /// Print store, index and cache statistics.
    Stats,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn open_engine(config: Config) -> Result<Engine> {
    let embedder = create_provider(&config.embedding)?;
    let engine = Engine::open(config, Arc::new(FlatIndexFactory), embedder).await?;
    engine.settle().await;
    Ok(engine)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Sync => {
            let engine = open_engine(config).await?;
            let report = engine.ingestion_pipeline()?.sync_all().await;
            engine.shutdown().await;
            print_json(&report?)?;
        }
        Commands::Watch => {
            let engine = open_engine(config).await?;
            let pipeline = engine.ingestion_pipeline()?;
            pipeline.sync_all().await?;
            pipeline.watch()?;
            info!("Watching for changes, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            engine.shutdown().await;
        }
        Commands::Search {
            query,
            corpus,
            k,
            modifiers,
            context,
        } => {
            let engine = open_engine(config).await?;
            let mut context_vectors = Vec::with_capacity(context.len());
            for turn in &context {
                context_vectors.push(engine.embed_query(turn).await?);
            }
            let request = RetrievalRequest {
                corpora: corpus,
                query_text: query,
                context_text: (!context.is_empty()).then(|| context.join("\n")),
                context_vectors,
                modifiers,
                k,
                ..RetrievalRequest::default()
            };
            let outcome = engine.retrieve(&request).await;
            engine.shutdown().await;
            print_json(&outcome?)?;
        }
        Commands::Get { paths } => {
            let engine = open_engine(config).await?;
            let chunks = engine.get_chunks_by_file_paths(&paths).await;
            engine.shutdown().await;
            print_json(&chunks?)?;
        }
        Commands::Signals { query, tags } => {
            let engine = open_engine(config).await?;
            let vector = engine.embed_query(&query).await?;
            let analysis = engine.get_signal_analysis(&vector)?;
            let width = ContextWindow::new(Vec::new()).semantic_width(&vector);
            let plan = engine.planner().plan(&analysis, width, &query, None);
            let similar = engine.search_similar_tags(&vector, tags)?;
            engine.shutdown().await;
            print_json(&json!({
                "analysis": analysis,
                "plan": plan,
                "similar_tags": similar,
            }))?;
        }
        Commands::Stats => {
            let engine = open_engine(config).await?;
            let stats = engine.stats().await;
            engine.shutdown().await;
            print_json(&stats?)?;
        }
    }

    Ok(())
}
