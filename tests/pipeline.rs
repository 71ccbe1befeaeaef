//! End-to-end pipeline tests: extraction → batch run → splice-back.
//!
//! Uses a tempfile-backed SQLite database, the in-memory content store,
//! and a scripted mock API client, so every external effect of a run is
//! observable.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tempfile::TempDir;

use simplify_harness::api::{SimplificationApi, SimplifiedText};
use simplify_harness::extract::extract_object;
use simplify_harness::markers::RunState;
use simplify_harness::migrate;
use simplify_harness::models::{ObjectRef, TextState};
use simplify_harness::objects::{ContentObject, ContentStore, MemoryContentStore, ObjectKind};
use simplify_harness::orchestrator::{
    FailureKind, LanguageMappings, Orchestrator, RunOptions, RunOutcome, StaleDecision,
};
use simplify_harness::parser::ParserRegistry;
use simplify_harness::store::{StoreOptions, TextQuery, TextStore};

async fn setup_db() -> (TempDir, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("spx.sqlite");
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
        .unwrap()
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .unwrap();
    migrate::apply_schema(&pool).await.unwrap();
    (tmp, pool)
}

fn store_options() -> StoreOptions {
    StoreOptions {
        default_language: "en".to_string(),
        delete_unused_texts: false,
        tenant_id: 0,
    }
}

fn mappings() -> LanguageMappings {
    let mut m = LanguageMappings::new();
    m.insert("en".to_string(), vec!["de".to_string()]);
    m
}

fn simplifiable(id: i64, targets: &[&str]) -> ContentObject {
    ContentObject {
        id,
        object_type: "page".to_string(),
        language: "en".to_string(),
        kind: ObjectKind::Simplifiable {
            target_languages: targets.iter().map(|s| s.to_string()).collect(),
        },
        state: "published".to_string(),
        locked: false,
        automatic_mode_prevented: false,
    }
}

fn simplified_copy(id: i64, original_id: i64, language: &str) -> ContentObject {
    ContentObject {
        id,
        object_type: "page".to_string(),
        language: language.to_string(),
        kind: ObjectKind::Simplified { original_id },
        state: "published".to_string(),
        locked: false,
        automatic_mode_prevented: false,
    }
}

/// Scripted API client: returns canned simplifications, records every
/// call, and can be switched to fail unconditionally.
struct MockApi {
    responses: HashMap<String, String>,
    calls: Mutex<Vec<(String, String, String)>>,
    max_requests: u64,
    fail: bool,
}

impl MockApi {
    fn new(responses: &[(&str, &str)]) -> Self {
        Self {
            responses: responses
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            calls: Mutex::new(Vec::new()),
            max_requests: 25,
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            responses: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            max_requests: 25,
            fail: true,
        }
    }

    fn with_max_requests(mut self, max: u64) -> Self {
        self.max_requests = max;
        self
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl SimplificationApi for MockApi {
    fn name(&self) -> &str {
        "mock"
    }

    fn max_requests_per_interval(&self) -> u64 {
        self.max_requests
    }

    async fn call(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<SimplifiedText> {
        self.calls.lock().unwrap().push((
            text.to_string(),
            source_lang.to_string(),
            target_lang.to_string(),
        ));
        if self.fail {
            anyhow::bail!("mock API failure");
        }
        match self.responses.get(text) {
            Some(simplified) => Ok(SimplifiedText {
                text: simplified.clone(),
                job_id: 4711,
            }),
            None => anyhow::bail!("no canned response for '{}'", text),
        }
    }
}

#[tokio::test]
async fn end_to_end_two_fragments() {
    let (_tmp, pool) = setup_db().await;
    let store = TextStore::new(pool.clone(), store_options());
    let content = MemoryContentStore::new();
    let parsers = ParserRegistry::with_builtins();
    let run_state = RunState::new(pool.clone());

    let object = simplifiable(1, &["de"]);
    content.insert(object.clone(), "Hello\n\nWorld");
    content.insert(simplified_copy(2, 1, "de"), "Hello\n\nWorld");

    let report = extract_object(&store, &content, &parsers, &object)
        .await
        .unwrap();
    assert_eq!(report.created, 2);

    let api = MockApi::new(&[("Hello", "Hallo"), ("World", "Welt")]);
    let orchestrator = Orchestrator::new(&store, &content, &parsers, &run_state);
    let processed = orchestrator
        .run_batch(&object, &api, &mappings(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(processed, 2);
    assert_eq!(api.call_count(), 2);

    // Both records advanced to in_use, one simplification each.
    for text in ["Hello", "World"] {
        let record = store.find_by_text(text, Some("en")).await.unwrap().unwrap();
        assert_eq!(record.state, TextState::InUse);
        assert!(store
            .has_simplification_in_language(&record.id, "de")
            .await
            .unwrap());
    }

    // The German copy now holds the simplified text.
    let copy_content = content.content(&ObjectRef::new(2, "page")).await.unwrap();
    assert_eq!(copy_content, "Hallo\n\nWelt");

    // Markers are terminal: count == max == 2, not running, success result.
    let marker = run_state
        .progress(&object.object_ref().marker_hash())
        .await
        .unwrap();
    assert_eq!(marker.count, 2);
    assert_eq!(marker.max, 2);
    assert_eq!(marker.running, 0);
    let outcome: RunOutcome = serde_json::from_value(marker.result.unwrap()).unwrap();
    match outcome {
        RunOutcome::Finished {
            processed,
            max,
            api_calls,
            reused,
            errors,
        } => {
            assert_eq!(processed, 2);
            assert_eq!(max, 2);
            assert_eq!(api_calls, 2);
            assert_eq!(reused, 0);
            assert!(errors.is_empty());
        }
        other => panic!("expected Finished, got {:?}", other),
    }

    // Finalize hook reached the content system.
    assert_eq!(content.updated(), vec![ObjectRef::new(1, "page")]);
}

#[tokio::test]
async fn shared_text_is_reused_without_api_call() {
    let (_tmp, pool) = setup_db().await;
    let store = TextStore::new(pool.clone(), store_options());
    let content = MemoryContentStore::new();
    let parsers = ParserRegistry::with_builtins();
    let run_state = RunState::new(pool.clone());

    // Object O gets simplified normally.
    let object_o = simplifiable(1, &["de"]);
    content.insert(object_o.clone(), "Hello");
    content.insert(simplified_copy(2, 1, "de"), "Hello");
    extract_object(&store, &content, &parsers, &object_o)
        .await
        .unwrap();
    let api = MockApi::new(&[("Hello", "Hallo")]);
    let orchestrator = Orchestrator::new(&store, &content, &parsers, &run_state);
    orchestrator
        .run_batch(&object_o, &api, &mappings(), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(api.call_count(), 1);

    // Object P shares the fragment. Its run must not touch the API.
    let object_p = simplifiable(3, &["de"]);
    content.insert(object_p.clone(), "Hello");
    content.insert(simplified_copy(4, 3, "de"), "Hello");
    extract_object(&store, &content, &parsers, &object_p)
        .await
        .unwrap();

    let silent_api = MockApi::failing();
    let processed = orchestrator
        .run_batch(&object_p, &silent_api, &mappings(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(processed, 1);
    assert_eq!(silent_api.call_count(), 0);

    let copy_content = content.content(&ObjectRef::new(4, "page")).await.unwrap();
    assert_eq!(copy_content, "Hallo");

    let marker = run_state
        .progress(&object_p.object_ref().marker_hash())
        .await
        .unwrap();
    let outcome: RunOutcome = serde_json::from_value(marker.result.unwrap()).unwrap();
    match outcome {
        RunOutcome::Finished {
            api_calls, reused, ..
        } => {
            assert_eq!(api_calls, 0);
            assert_eq!(reused, 1);
        }
        other => panic!("expected Finished, got {:?}", other),
    }
}

#[tokio::test]
async fn rerun_with_nothing_due_skips_api() {
    let (_tmp, pool) = setup_db().await;
    let store = TextStore::new(pool.clone(), store_options());
    let content = MemoryContentStore::new();
    let parsers = ParserRegistry::with_builtins();
    let run_state = RunState::new(pool.clone());

    let object = simplifiable(1, &["de"]);
    content.insert(object.clone(), "Hello\n\nWorld");
    content.insert(simplified_copy(2, 1, "de"), "Hello\n\nWorld");
    extract_object(&store, &content, &parsers, &object)
        .await
        .unwrap();

    let api = MockApi::new(&[("Hello", "Hallo"), ("World", "Welt")]);
    let orchestrator = Orchestrator::new(&store, &content, &parsers, &run_state);
    orchestrator
        .run_batch(&object, &api, &mappings(), RunOptions::default())
        .await
        .unwrap();

    // Second run: must not call the API and must report the recorded max.
    let silent_api = MockApi::failing();
    let processed = orchestrator
        .run_batch(&object, &silent_api, &mappings(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(processed, 2);
    assert_eq!(silent_api.call_count(), 0);

    let marker = run_state
        .progress(&object.object_ref().marker_hash())
        .await
        .unwrap();
    let outcome: RunOutcome = serde_json::from_value(marker.result.unwrap()).unwrap();
    assert_eq!(outcome, RunOutcome::AlreadyComplete { max: 2 });
}

#[tokio::test]
async fn single_flight_guard_blocks_second_run() {
    let (_tmp, pool) = setup_db().await;
    let store = TextStore::new(pool.clone(), store_options());
    let content = MemoryContentStore::new();
    let parsers = ParserRegistry::with_builtins();
    let run_state = RunState::new(pool.clone());

    let object = simplifiable(1, &["de"]);
    content.insert(object.clone(), "Hello");
    content.insert(simplified_copy(2, 1, "de"), "Hello");
    extract_object(&store, &content, &parsers, &object)
        .await
        .unwrap();

    // Another process holds the slot.
    let hash = object.object_ref().marker_hash();
    assert!(run_state.try_begin(&hash).await.unwrap());

    let api = MockApi::new(&[("Hello", "Hallo")]);
    let orchestrator = Orchestrator::new(&store, &content, &parsers, &run_state);
    let processed = orchestrator
        .run_batch(&object, &api, &mappings(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(processed, 0);
    assert_eq!(api.call_count(), 0);

    let marker = run_state.progress(&hash).await.unwrap();
    let outcome: RunOutcome = serde_json::from_value(marker.result.unwrap()).unwrap();
    assert_eq!(outcome, RunOutcome::AlreadyRunning);
}

#[tokio::test]
async fn stale_processing_blocks_until_resolved() {
    let (_tmp, pool) = setup_db().await;
    let store = TextStore::new(pool.clone(), store_options());
    let content = MemoryContentStore::new();
    let parsers = ParserRegistry::with_builtins();
    let run_state = RunState::new(pool.clone());

    let object = simplifiable(1, &["de"]);
    content.insert(object.clone(), "Hello");
    content.insert(simplified_copy(2, 1, "de"), "Hello");
    extract_object(&store, &content, &parsers, &object)
        .await
        .unwrap();

    // Simulate a crashed run: record stuck in processing.
    let mut record = store.find_by_text("Hello", Some("en")).await.unwrap().unwrap();
    store
        .set_state(&mut record, TextState::Processing)
        .await
        .unwrap();

    let api = MockApi::new(&[("Hello", "Hallo")]);
    let orchestrator = Orchestrator::new(&store, &content, &parsers, &run_state);
    let processed = orchestrator
        .run_batch(&object, &api, &mappings(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(processed, 0);
    assert_eq!(api.call_count(), 0);

    let hash = object.object_ref().marker_hash();
    let marker = run_state.progress(&hash).await.unwrap();
    let outcome: RunOutcome = serde_json::from_value(marker.result.unwrap()).unwrap();
    assert_eq!(outcome, RunOutcome::StaleProcessing { pending: 1 });
    // The slot was released; the run is paused, not wedged.
    assert_eq!(marker.running, 0);

    // Retry puts the record back to to_simplify — exactly, not in_use.
    let updated = orchestrator
        .resolve_stale(&object.object_ref(), StaleDecision::Retry)
        .await
        .unwrap();
    assert_eq!(updated, 1);
    let record = store.get(&record.id).await.unwrap().unwrap();
    assert_eq!(record.state, TextState::ToSimplify);

    // And the next run goes through.
    let processed = orchestrator
        .run_batch(&object, &api, &mappings(), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(processed, 1);
}

#[tokio::test]
async fn resolve_stale_can_ignore() {
    let (_tmp, pool) = setup_db().await;
    let store = TextStore::new(pool.clone(), store_options());
    let content = MemoryContentStore::new();
    let parsers = ParserRegistry::with_builtins();
    let run_state = RunState::new(pool.clone());

    let object = simplifiable(1, &["de"]);
    content.insert(object.clone(), "Hello");
    extract_object(&store, &content, &parsers, &object)
        .await
        .unwrap();

    let mut record = store.find_by_text("Hello", Some("en")).await.unwrap().unwrap();
    store
        .set_state(&mut record, TextState::Processing)
        .await
        .unwrap();

    let orchestrator = Orchestrator::new(&store, &content, &parsers, &run_state);
    orchestrator
        .resolve_stale(&object.object_ref(), StaleDecision::Ignore)
        .await
        .unwrap();

    let record = store.get(&record.id).await.unwrap().unwrap();
    assert_eq!(record.state, TextState::Ignore);

    // Ignored records are not selected by the next run.
    let api = MockApi::failing();
    let processed = orchestrator
        .run_batch(&object, &api, &mappings(), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(processed, 1); // returns recorded max (all accounted for)
    assert_eq!(api.call_count(), 0);
}

#[tokio::test]
async fn quota_precheck_defers_oversized_run() {
    let (_tmp, pool) = setup_db().await;
    let store = TextStore::new(pool.clone(), store_options());
    let content = MemoryContentStore::new();
    let parsers = ParserRegistry::with_builtins();
    let run_state = RunState::new(pool.clone());

    let object = simplifiable(1, &["de"]);
    content.insert(object.clone(), "A\n\nB\n\nC\n\nD\n\nE\n\nF");
    extract_object(&store, &content, &parsers, &object)
        .await
        .unwrap();

    let api = MockApi::new(&[]).with_max_requests(5);
    let orchestrator = Orchestrator::new(&store, &content, &parsers, &run_state);
    let processed = orchestrator
        .run_batch(&object, &api, &mappings(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(processed, 0);
    assert_eq!(api.call_count(), 0);

    let marker = run_state
        .progress(&object.object_ref().marker_hash())
        .await
        .unwrap();
    assert_eq!(marker.running, 0);
    let outcome: RunOutcome = serde_json::from_value(marker.result.unwrap()).unwrap();
    assert_eq!(
        outcome,
        RunOutcome::QuotaDeferred {
            total: 6,
            limit: 5,
            automatic_prevented: false,
        }
    );
}

#[tokio::test]
async fn quota_precheck_reports_automatic_opt_out() {
    let (_tmp, pool) = setup_db().await;
    let store = TextStore::new(pool.clone(), store_options());
    let content = MemoryContentStore::new();
    let parsers = ParserRegistry::with_builtins();
    let run_state = RunState::new(pool.clone());

    let mut object = simplifiable(1, &["de"]);
    object.automatic_mode_prevented = true;
    content.insert(object.clone(), "A\n\nB");
    extract_object(&store, &content, &parsers, &object)
        .await
        .unwrap();

    let api = MockApi::new(&[]).with_max_requests(1);
    let orchestrator = Orchestrator::new(&store, &content, &parsers, &run_state);
    orchestrator
        .run_batch(&object, &api, &mappings(), RunOptions::default())
        .await
        .unwrap();

    let marker = run_state
        .progress(&object.object_ref().marker_hash())
        .await
        .unwrap();
    let outcome: RunOutcome = serde_json::from_value(marker.result.unwrap()).unwrap();
    match outcome {
        RunOutcome::QuotaDeferred {
            automatic_prevented,
            ..
        } => assert!(automatic_prevented),
        other => panic!("expected QuotaDeferred, got {:?}", other),
    }
}

#[tokio::test]
async fn locked_object_refuses_to_run() {
    let (_tmp, pool) = setup_db().await;
    let store = TextStore::new(pool.clone(), store_options());
    let content = MemoryContentStore::new();
    let parsers = ParserRegistry::with_builtins();
    let run_state = RunState::new(pool.clone());

    let mut object = simplifiable(1, &["de"]);
    object.locked = true;
    content.insert(object.clone(), "Hello");
    extract_object(&store, &content, &parsers, &object)
        .await
        .unwrap();

    let api = MockApi::new(&[("Hello", "Hallo")]);
    let orchestrator = Orchestrator::new(&store, &content, &parsers, &run_state);
    let processed = orchestrator
        .run_batch(&object, &api, &mappings(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(processed, 0);
    assert_eq!(api.call_count(), 0);
}

#[tokio::test]
async fn api_failure_requeues_record() {
    let (_tmp, pool) = setup_db().await;
    let store = TextStore::new(pool.clone(), store_options());
    let content = MemoryContentStore::new();
    let parsers = ParserRegistry::with_builtins();
    let run_state = RunState::new(pool.clone());

    let object = simplifiable(1, &["de"]);
    content.insert(object.clone(), "Hello");
    content.insert(simplified_copy(2, 1, "de"), "Hello");
    extract_object(&store, &content, &parsers, &object)
        .await
        .unwrap();

    let api = MockApi::failing();
    let orchestrator = Orchestrator::new(&store, &content, &parsers, &run_state);
    orchestrator
        .run_batch(&object, &api, &mappings(), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(api.call_count(), 1);

    // The failed record went back into the queue for the next run.
    let record = store.find_by_text("Hello", Some("en")).await.unwrap().unwrap();
    assert_eq!(record.state, TextState::ToSimplify);

    let marker = run_state
        .progress(&object.object_ref().marker_hash())
        .await
        .unwrap();
    let outcome: RunOutcome = serde_json::from_value(marker.result.unwrap()).unwrap();
    match outcome {
        RunOutcome::Finished { errors, .. } => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].kind, FailureKind::ApiFailed);
        }
        other => panic!("expected Finished, got {:?}", other),
    }

    // A later run with a working API picks the record up again.
    let api = MockApi::new(&[("Hello", "Hallo")]);
    orchestrator
        .run_batch(&object, &api, &mappings(), RunOptions::default())
        .await
        .unwrap();
    let record = store.find_by_text("Hello", Some("en")).await.unwrap().unwrap();
    assert_eq!(record.state, TextState::InUse);
}

#[tokio::test]
async fn splice_mismatch_is_a_hard_error() {
    let (_tmp, pool) = setup_db().await;
    let store = TextStore::new(pool.clone(), store_options());
    let content = MemoryContentStore::new();
    let parsers = ParserRegistry::with_builtins();
    let run_state = RunState::new(pool.clone());

    let object = simplifiable(1, &["de"]);
    content.insert(object.clone(), "Hello");
    // Structural drift: the copy does not contain the original fragment.
    content.insert(simplified_copy(2, 1, "de"), "Completely different");
    extract_object(&store, &content, &parsers, &object)
        .await
        .unwrap();

    let api = MockApi::new(&[("Hello", "Hallo")]);
    let orchestrator = Orchestrator::new(&store, &content, &parsers, &run_state);
    orchestrator
        .run_batch(&object, &api, &mappings(), RunOptions::default())
        .await
        .unwrap();

    let marker = run_state
        .progress(&object.object_ref().marker_hash())
        .await
        .unwrap();
    let outcome: RunOutcome = serde_json::from_value(marker.result.unwrap()).unwrap();
    match outcome {
        RunOutcome::Finished { errors, .. } => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].kind, FailureKind::SpliceMismatch);
        }
        other => panic!("expected Finished, got {:?}", other),
    }

    // Observed upstream behavior: the record still ends up in_use even
    // though nothing was written. Kept as-is pending clarification.
    let record = store.find_by_text("Hello", Some("en")).await.unwrap().unwrap();
    assert_eq!(record.state, TextState::InUse);
}

#[tokio::test]
async fn paginated_run_keeps_slot_until_done() {
    let (_tmp, pool) = setup_db().await;
    let store = TextStore::new(pool.clone(), store_options());
    let content = MemoryContentStore::new();
    let parsers = ParserRegistry::with_builtins();
    let run_state = RunState::new(pool.clone());

    let object = simplifiable(1, &["de"]);
    content.insert(object.clone(), "Hello\n\nWorld");
    content.insert(simplified_copy(2, 1, "de"), "Hello\n\nWorld");
    extract_object(&store, &content, &parsers, &object)
        .await
        .unwrap();

    let api = MockApi::new(&[("Hello", "Hallo"), ("World", "Welt")]);
    let orchestrator = Orchestrator::new(&store, &content, &parsers, &run_state);

    // First page: limit 1, run stays in flight.
    let processed = orchestrator
        .run_batch(
            &object,
            &api,
            &mappings(),
            RunOptions {
                limit: 1,
                is_init: true,
                user_id: 0,
            },
        )
        .await
        .unwrap();
    assert_eq!(processed, 1);

    let hash = object.object_ref().marker_hash();
    let marker = run_state.progress(&hash).await.unwrap();
    assert!(marker.running > 0);
    assert_eq!(marker.count, 1);
    assert_eq!(marker.max, 2);

    // Continuation page finishes the run and releases the slot.
    let processed = orchestrator
        .run_batch(
            &object,
            &api,
            &mappings(),
            RunOptions {
                limit: 1,
                is_init: false,
                user_id: 0,
            },
        )
        .await
        .unwrap();
    assert_eq!(processed, 1);

    let marker = run_state.progress(&hash).await.unwrap();
    assert_eq!(marker.running, 0);
    assert_eq!(marker.count, 2);
}

#[tokio::test]
async fn automatic_run_skips_opted_out_objects() {
    let (_tmp, pool) = setup_db().await;
    let store = TextStore::new(pool.clone(), store_options());
    let content = MemoryContentStore::new();
    let parsers = ParserRegistry::with_builtins();
    let run_state = RunState::new(pool.clone());

    let eligible = simplifiable(1, &["de"]);
    content.insert(eligible.clone(), "Hello");
    content.insert(simplified_copy(2, 1, "de"), "Hello");
    extract_object(&store, &content, &parsers, &eligible)
        .await
        .unwrap();

    let mut opted_out = simplifiable(3, &["de"]);
    opted_out.automatic_mode_prevented = true;
    content.insert(opted_out.clone(), "World");
    content.insert(simplified_copy(4, 3, "de"), "World");
    extract_object(&store, &content, &parsers, &opted_out)
        .await
        .unwrap();

    let api = MockApi::new(&[("Hello", "Hallo"), ("World", "Welt")]);
    let orchestrator = Orchestrator::new(&store, &content, &parsers, &run_state);
    orchestrator
        .run_automatic(&api, &mappings(), 0)
        .await
        .unwrap();

    // Only the eligible object's text was submitted.
    assert_eq!(api.call_count(), 1);
    let record = store.find_by_text("World", Some("en")).await.unwrap().unwrap();
    assert_eq!(record.state, TextState::ToSimplify);
}
