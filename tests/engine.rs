mod common;

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashSet;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use common::{hash_embed, open_engine, setup, sync, write_note, CountingEmbedder, HashEmbedder};
use memory_harness::cache::hash_str;
use memory_harness::embedding::EmbeddingProvider;
use memory_harness::index::FlatIndexFactory;
use memory_harness::models::{HitOrigin, SearchHit};
use memory_harness::registry::IndexScope;
use memory_harness::rerank::RerankProvider;
use memory_harness::retrieval::RetrievalRequest;
use memory_harness::time_range::TimeRange;
use memory_harness::watcher::FileEvent;
use memory_harness::{Engine, EngineError, EngineResult, SearchRequest};

const NOTES: &str = "Alpha beta notes about the first topic.\n\n\
Second paragraph discusses something else entirely.\n\n\
Tag: alpha, beta\n";

const FIRST: &str = "Alpha beta notes about the first topic.";

fn request(corpus: &str, text: &str, k: usize) -> SearchRequest {
    SearchRequest {
        corpus: Some(corpus.to_string()),
        vector: hash_embed(text),
        k,
        ..SearchRequest::default()
    }
}

#[tokio::test]
async fn test_ingest_then_search_finds_paragraph() {
    let (_tmp, config) = setup();
    write_note(&config, "notes.md", NOTES);
    let engine = open_engine(config, Arc::new(HashEmbedder)).await;
    sync(&engine).await;

    let hits = engine.search(&request("Root", FIRST, 3)).await.unwrap();
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].text, FIRST);
    assert!(hits[0].score > 0.99, "score was {}", hits[0].score);
    assert_eq!(hits[0].source_file, "notes.md");
    assert_eq!(hits[0].corpus, "Root");

    let boosted = engine
        .search(&SearchRequest {
            tag_weight: Some(0.1),
            core_tags: vec!["alpha".to_string()],
            ..request("Root", FIRST, 3)
        })
        .await
        .unwrap();
    assert_eq!(boosted[0].text, FIRST);
    assert!(boosted[0].score > 0.9, "score was {}", boosted[0].score);
    assert!(boosted[0].core_tags_matched.contains(&"alpha".to_string()));
    assert!(boosted[0].boost_factor > 0.0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_reingest_unchanged_tree_embeds_nothing() {
    let (_tmp, config) = setup();
    write_note(&config, "notes.md", NOTES);
    write_note(&config, "work/todo.md", "Ship the release.\n\nTag: work\n");
    let embedder = Arc::new(CountingEmbedder::default());
    let engine = open_engine(config.clone(), embedder.clone()).await;
    let pipeline = engine.ingestion_pipeline().unwrap();

    let first = pipeline.sync_all().await.unwrap();
    assert_eq!(first.written, 2);
    let calls = embedder.count();
    assert!(calls > 0);

    // Same bytes rewritten: stat may change, the hash does not
    write_note(&config, "notes.md", NOTES);
    let second = pipeline.sync_all().await.unwrap();
    assert_eq!(second.written, 0);
    assert_eq!(second.unchanged + second.touched, 2);
    assert_eq!(embedder.count(), calls);

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.store.files, 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_search_unknown_corpus_is_empty() {
    let (_tmp, config) = setup();
    let engine = open_engine(config, Arc::new(HashEmbedder)).await;

    let hits = engine.search(&request("Nowhere", "anything", 5)).await.unwrap();
    assert!(hits.is_empty());

    let outcome = engine
        .retrieve(&RetrievalRequest {
            query_text: "anything at all".to_string(),
            k: Some(5),
            ..RetrievalRequest::default()
        })
        .await
        .unwrap();
    assert!(outcome.hits.is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_wrong_dimension_is_rejected() {
    let (_tmp, config) = setup();
    let engine = open_engine(config, Arc::new(HashEmbedder)).await;

    let err = engine
        .search(&SearchRequest {
            corpus: Some("Root".to_string()),
            vector: vec![1.0, 0.0, 0.0],
            k: 3,
            ..SearchRequest::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::DimensionMismatch {
            expected: common::DIMS,
            actual: 3
        }
    ));
    assert!(engine.get_signal_analysis(&[0.5; 4]).is_err());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_open_rejects_embedder_dimension_mismatch() {
    let (_tmp, mut config) = setup();
    config.embedding.dims = Some(8);
    let result = Engine::open(config, Arc::new(FlatIndexFactory), Arc::new(HashEmbedder)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_deleted_file_leaves_index_and_store() {
    let (_tmp, config) = setup();
    write_note(&config, "work/a.md", "Kubernetes cluster upgrade plan.");
    write_note(&config, "work/b.md", "Quarterly budget spreadsheet review.");
    let engine = open_engine(config.clone(), Arc::new(HashEmbedder)).await;
    sync(&engine).await;

    fs::remove_file(config.ingest.root.join("work/b.md")).unwrap();
    let report = engine.ingestion_pipeline().unwrap().sync_all().await.unwrap();
    assert_eq!(report.deleted, 1);

    let hits = engine
        .search(&request("work", "Quarterly budget spreadsheet review.", 5))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].full_path, "work/a.md");

    let chunks = engine
        .get_chunks_by_file_paths(&["work/b.md".to_string()])
        .await
        .unwrap();
    assert!(chunks.is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_indices_survive_restart() {
    let (_tmp, config) = setup();
    write_note(&config, "notes.md", NOTES);
    write_note(&config, "work/a.md", "Kubernetes cluster upgrade plan.\n\nRoll nodes one at a time.");
    write_note(&config, "work/b.md", "Quarterly budget spreadsheet review.");

    let engine = open_engine(config.clone(), Arc::new(HashEmbedder)).await;
    sync(&engine).await;
    let before = engine
        .search(&request("work", "cluster upgrade nodes", 3))
        .await
        .unwrap();
    let saved = engine.registry().index_path(&IndexScope::Corpus("work".to_string()));
    engine.shutdown().await;
    assert!(saved.exists());

    let reopened = open_engine(config, Arc::new(HashEmbedder)).await;
    let after = reopened
        .search(&request("work", "cluster upgrade nodes", 3))
        .await
        .unwrap();

    let ids = |hits: &[SearchHit]| hits.iter().map(|h| h.chunk_id).collect::<Vec<_>>();
    assert_eq!(ids(&before), ids(&after));
    assert!(reopened.signals().tag_count() >= 2);
    reopened.shutdown().await;
}

#[tokio::test]
async fn test_aggregate_spans_corpora() {
    let (_tmp, config) = setup();
    write_note(&config, "work/deploy.md", "Deploy pipeline runs cargo build.");
    write_note(&config, "home/garden.md", "Tomatoes need water daily.");
    let engine = open_engine(config, Arc::new(HashEmbedder)).await;
    sync(&engine).await;

    let outcome = engine
        .retrieve(&RetrievalRequest {
            query_text: "cargo build deploy pipeline".to_string(),
            k: Some(2),
            ..RetrievalRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(outcome.k, 2);
    assert!(!outcome.hits.is_empty());
    assert!(outcome.hits.len() <= 2);
    assert_eq!(outcome.hits[0].corpus, "work");

    // Representative vectors are persisted under the corpus name
    assert!(engine.get_vector_for_key("corpus_name:work").await.unwrap().is_some());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_time_modifier_mixes_dated_chunks() {
    let (_tmp, config) = setup();
    write_note(&config, "journal/0514.md", "[2024-05-14] Standup about the release checklist.");
    write_note(&config, "journal/0401.md", "[2024-04-01] Planning the garden layout.");
    write_note(&config, "journal/misc.md", "Random thoughts on green tea.");
    let engine = open_engine(config, Arc::new(HashEmbedder)).await;
    sync(&engine).await;

    let today = NaiveDate::from_ymd_opt(2024, 5, 15).unwrap();
    let outcome = engine
        .retrieve(&RetrievalRequest {
            corpora: vec!["journal".to_string()],
            query_text: "what happened yesterday".to_string(),
            modifiers: "::Time".to_string(),
            k: Some(3),
            today: Some(today),
            ..RetrievalRequest::default()
        })
        .await
        .unwrap();

    assert_eq!(
        outcome.time_ranges,
        vec![TimeRange::day(NaiveDate::from_ymd_opt(2024, 5, 14).unwrap())]
    );
    assert!(outcome.hits.len() <= 3);
    let texts: HashSet<&str> = outcome.hits.iter().map(|h| h.text.trim()).collect();
    assert_eq!(texts.len(), outcome.hits.len());
    assert!(outcome
        .hits
        .iter()
        .any(|h| h.date.as_deref() == Some("2024-05-14")));
    assert!(outcome
        .hits
        .iter()
        .all(|h| h.origin == HitOrigin::Semantic || h.date.as_deref() == Some("2024-05-14")));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_query_cache_invalidated_by_ingest() {
    let (_tmp, config) = setup();
    write_note(&config, "notes.md", NOTES);
    let engine = open_engine(config.clone(), Arc::new(HashEmbedder)).await;
    sync(&engine).await;

    let req = RetrievalRequest {
        query_text: "first topic notes".to_string(),
        k: Some(2),
        ..RetrievalRequest::default()
    };
    assert!(!engine.retrieve(&req).await.unwrap().cached);
    assert!(engine.retrieve(&req).await.unwrap().cached);

    write_note(&config, "more.md", "Another note about the first topic.");
    sync(&engine).await;
    let fresh = engine.retrieve(&req).await.unwrap();
    assert!(!fresh.cached);
    assert!(fresh
        .hits
        .iter()
        .any(|h| h.text == "Another note about the first topic."));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_keyed_vectors_embed_once() {
    let (_tmp, config) = setup();
    let embedder = Arc::new(CountingEmbedder::default());
    let engine = open_engine(config, embedder.clone()).await;

    let first = engine.get_or_embed_keyed("persistent memory").await.unwrap().unwrap();
    let calls = embedder.count();
    let second = engine.get_or_embed_keyed("persistent memory").await.unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(embedder.count(), calls);

    let stored = engine
        .get_vector_for_key(&hash_str("persistent memory"))
        .await
        .unwrap();
    assert_eq!(stored, Some(first));
    assert_eq!(engine.get_vector_for_key("missing").await.unwrap(), None);
    engine.shutdown().await;
}

/// Scores documents by length, longest first.
struct LengthReranker;

#[async_trait]
impl RerankProvider for LengthReranker {
    async fn rerank(&self, _query: &str, documents: &[String]) -> EngineResult<Vec<(usize, f32)>> {
        Ok(documents
            .iter()
            .enumerate()
            .map(|(i, d)| (i, d.len() as f32 / 100.0))
            .collect())
    }
}

#[tokio::test]
async fn test_rerank_modifier_reorders_hits() {
    let (_tmp, config) = setup();
    write_note(&config, "notes.md", NOTES);
    let engine = Engine::open_with(
        config,
        Arc::new(FlatIndexFactory),
        Arc::new(HashEmbedder),
        Some(Arc::new(LengthReranker)),
    )
    .await
    .unwrap();
    engine.settle().await;
    sync(&engine).await;

    let outcome = engine
        .retrieve(&RetrievalRequest {
            query_text: FIRST.to_string(),
            modifiers: "::Rerank".to_string(),
            k: Some(2),
            ..RetrievalRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(outcome.hits.len(), 2);
    assert!(outcome.hits.iter().all(|h| h.rerank_score.is_some()));
    assert!(outcome.hits[0].text.len() >= outcome.hits[1].text.len());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_watch_picks_up_new_files() {
    let (_tmp, config) = setup();
    let engine = open_engine(config.clone(), Arc::new(HashEmbedder)).await;
    engine.ingestion_pipeline().unwrap().watch().unwrap();

    write_note(&config, "inbox/new.md", "Freshly written idea about sourdough.");

    let mut found = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let paths = engine
            .get_chunks_by_file_paths(&["inbox/new.md".to_string()])
            .await
            .unwrap();
        if !paths.is_empty() {
            found = true;
            break;
        }
    }
    assert!(found, "watcher never ingested the new file");

    let hits = engine
        .search(&request("inbox", "Freshly written idea about sourdough.", 1))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_boost_marks_every_file_tag() {
    let (_tmp, config) = setup();
    write_note(&config, "notes/day.md", NOTES);
    let engine = open_engine(config, Arc::new(HashEmbedder)).await;
    sync(&engine).await;

    let hits = engine
        .search(&SearchRequest {
            tag_weight: Some(0.15),
            ..request("notes", FIRST, 1)
        })
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].text, FIRST);
    assert!(hits[0].score > 0.9, "score was {}", hits[0].score);
    assert!(hits[0].matched_tags.contains(&"alpha".to_string()));
    assert!(hits[0].matched_tags.contains(&"beta".to_string()));
    assert!(hits[0].core_tags_matched.is_empty());

    // Spotlight names match regardless of case
    let spotlit = engine
        .search(&SearchRequest {
            tag_weight: Some(0.15),
            core_tags: vec!["ALPHA".to_string()],
            ..request("notes", FIRST, 1)
        })
        .await
        .unwrap();
    assert_eq!(spotlit[0].core_tags_matched, vec!["alpha".to_string()]);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_symbol_only_file_is_stored_without_chunks() {
    let (_tmp, config) = setup();
    write_note(&config, "emoji.md", "🎉✨");
    write_note(&config, "mixed.md", "Plain words survive.\n\n🎉✨\n");
    let engine = open_engine(config, Arc::new(HashEmbedder)).await;
    let pipeline = engine.ingestion_pipeline().unwrap();

    let first = pipeline.sync_all().await.unwrap();
    assert_eq!(first.written, 2);
    assert_eq!(first.deferred, 0);
    assert_eq!(pipeline.pending_len(), 0);

    let second = pipeline.sync_all().await.unwrap();
    assert_eq!(second.written, 0);
    assert_eq!(second.deferred, 0);

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.store.files, 2);
    assert!(engine
        .get_chunks_by_file_paths(&["emoji.md".to_string()])
        .await
        .unwrap()
        .is_empty());
    let mixed = engine
        .get_chunks_by_file_paths(&["mixed.md".to_string()])
        .await
        .unwrap();
    assert_eq!(mixed.len(), 1);
    assert_eq!(mixed[0].content.trim(), "Plain words survive.");
    engine.shutdown().await;
}

#[tokio::test]
async fn test_query_cache_separates_context_and_core_tags() {
    let (_tmp, config) = setup();
    write_note(&config, "journal/0514.md", "[2024-05-14] Standup about the release checklist.");
    write_note(&config, "journal/0401.md", "[2024-04-01] Planning the garden layout.");
    let engine = open_engine(config, Arc::new(HashEmbedder)).await;
    sync(&engine).await;

    let base = RetrievalRequest {
        corpora: vec!["journal".to_string()],
        query_text: "what happened then".to_string(),
        context_text: Some("yesterday".to_string()),
        modifiers: "::Time".to_string(),
        k: Some(2),
        today: NaiveDate::from_ymd_opt(2024, 5, 15),
        ..RetrievalRequest::default()
    };
    let first = engine.retrieve(&base).await.unwrap();
    assert!(!first.cached);
    assert!(engine.retrieve(&base).await.unwrap().cached);

    let last_month = engine
        .retrieve(&RetrievalRequest {
            context_text: Some("last month".to_string()),
            ..base.clone()
        })
        .await
        .unwrap();
    assert!(!last_month.cached);
    assert_ne!(last_month.time_ranges, first.time_ranges);
    assert!(last_month
        .hits
        .iter()
        .any(|h| h.date.as_deref() == Some("2024-04-01")));

    let spotlit = engine
        .retrieve(&RetrievalRequest {
            core_tags: vec!["garden".to_string()],
            ..base.clone()
        })
        .await
        .unwrap();
    assert!(!spotlit.cached);

    let with_history = engine
        .retrieve(&RetrievalRequest {
            context_vectors: vec![hash_embed("release checklist")],
            ..base.clone()
        })
        .await
        .unwrap();
    assert!(!with_history.cached);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_time_aware_aggregate_caps_at_k() {
    let (_tmp, config) = setup();
    write_note(&config, "work/a.md", "[2024-05-14] Deploy review with the team.");
    write_note(&config, "home/b.md", "[2024-05-14] Watered the tomatoes.");
    write_note(&config, "travel/c.md", "[2024-05-14] Booked the train tickets.");
    let engine = open_engine(config, Arc::new(HashEmbedder)).await;
    sync(&engine).await;

    let outcome = engine
        .retrieve(&RetrievalRequest {
            query_text: "what did I do yesterday".to_string(),
            modifiers: "::Time".to_string(),
            k: Some(2),
            today: NaiveDate::from_ymd_opt(2024, 5, 15),
            ..RetrievalRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(outcome.k, 2);
    assert_eq!(outcome.hits.len(), 2);
    engine.shutdown().await;
}

/// Blocks its first call until released.
#[derive(Default)]
struct GatedEmbedder {
    gated: AtomicBool,
    started: Notify,
    release: Notify,
}

#[async_trait]
impl EmbeddingProvider for GatedEmbedder {
    fn model_name(&self) -> &str {
        "hash-bow-gated"
    }

    fn dims(&self) -> usize {
        common::DIMS
    }

    async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        if !self.gated.swap(true, Ordering::SeqCst) {
            self.started.notify_one();
            self.release.notified().await;
        }
        HashEmbedder.embed(texts).await
    }
}

#[tokio::test]
async fn test_flush_during_flush_runs_one_follow_up_pass() {
    let (_tmp, config) = setup();
    write_note(&config, "first.md", "First note about gardening.");
    let embedder = Arc::new(GatedEmbedder::default());
    let engine = open_engine(config.clone(), embedder.clone()).await;
    let pipeline = engine.ingestion_pipeline().unwrap();

    pipeline.enqueue(FileEvent::Upsert("first.md".to_string()));
    let running = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.flush().await }
    });
    embedder.started.notified().await;

    write_note(&config, "second.md", "Second note about cooking.");
    assert_eq!(pipeline.enqueue(FileEvent::Upsert("second.md".to_string())), 1);
    let nested = pipeline.flush().await.unwrap();
    assert_eq!(nested.written, 0);
    assert_eq!(pipeline.pending_len(), 1);

    embedder.release.notify_one();
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.written, 2);
    assert_eq!(pipeline.pending_len(), 0);
    assert_eq!(engine.stats().await.unwrap().store.files, 2);

    // Back to collecting: a later flush runs normally
    assert_eq!(pipeline.flush().await.unwrap().written, 0);
    engine.shutdown().await;
}
