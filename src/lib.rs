//! # Memory Harness
//!
//! A local-first semantic memory engine for AI tools.
//!
//! Memory Harness watches a tree of notes, splits each document into
//! chunks, embeds them and keeps one vector index per corpus (top-level
//! directory) next to a SQLite store of files, chunks, tags and cached
//! vectors. Retrieval adapts to the query: a tag signal engine measures how
//! focused and how grounded a query is, the planner turns that into a result
//! count and a tag boost weight, and the orchestrator fans out over context
//! segments, time ranges and corpora before an optional re-rank.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌───────────────┐
//! │ TreeWatcher │──▶│  Ingestion   │──▶│ SQLite store  │
//! │  (polling)  │   │ chunk+embed │   │ files/chunks/ │
//! └─────────────┘   └──────┬──────┘   │ tags/kv       │
//!                          │          └──────┬────────┘
//!                          ▼                 │
//!                   ┌─────────────┐          │
//!                   │  Registry   │◀─────────┘ recover
//!                   │ per-corpus  │
//!                   │ + tag index │
//!                   └──────┬──────┘
//!                          ▼
//!   ┌──────────┐    ┌─────────────┐    ┌──────────┐
//!   │ Signals  │───▶│   Planner   │───▶│Retrieval │──▶ rerank ──▶ hits
//!   └──────────┘    └─────────────┘    └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! memh init                          # create database
//! memh sync                          # ingest the notes tree once
//! memh watch                         # keep ingesting as files change
//! memh search "rust async runtimes" --k 5
//! memh search "what did I write last week" --modifiers "::Time::Rerank"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Engine error kinds |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`store`] | Relational store: files, chunks, tags, key/vector table |
//! | [`index`] | Vector index capability and the flat implementation |
//! | [`vector`] | Vector math and blob encoding |
//! | [`registry`] | Per-corpus indices, recovery and debounced saves |
//! | [`chunk`] | Text chunking |
//! | [`extract`] | Tag line and entry date extraction |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`watcher`] | Polling file tree watcher |
//! | [`ingest`] | Batched ingestion pipeline |
//! | [`signals`] | Tag signal engine: axes, pyramid, co-occurrence, boosting |
//! | [`context`] | Conversation context segmentation |
//! | [`planner`] | Dynamic K, tag weight and truncation |
//! | [`time_range`] | Date range expressions |
//! | [`rerank`] | Remote re-ranking with circuit breaking |
//! | [`cache`] | Query, embedding and derived vector caches |
//! | [`retrieval`] | Retrieval orchestration |
//! | [`engine`] | The engine context that ties everything together |

pub mod cache;
pub mod chunk;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod planner;
pub mod registry;
pub mod rerank;
pub mod retrieval;
pub mod signals;
pub mod store;
pub mod time_range;
pub mod vector;
pub mod watcher;

pub use engine::{Engine, SearchRequest};
pub use error::{EngineError, EngineResult};
