//! Store-level properties: dedup, the state machine, lookups, and the
//! deletion policy.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tempfile::TempDir;

use simplify_harness::migrate;
use simplify_harness::models::{ObjectRef, TextState};
use simplify_harness::store::{QueryOrder, StoreError, StoreOptions, TextQuery, TextStore};

async fn setup_store() -> (TempDir, TextStore) {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("spx.sqlite");
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
        .unwrap()
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
    let pool: SqlitePool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .unwrap();
    migrate::apply_schema(&pool).await.unwrap();

    let store = TextStore::new(
        pool,
        StoreOptions {
            default_language: "en".to_string(),
            delete_unused_texts: false,
            tenant_id: 0,
        },
    );
    (tmp, store)
}

#[tokio::test]
async fn identical_text_resolves_to_one_record() {
    let (_tmp, store) = setup_store().await;

    let first = store.add("Hello", Some("en"), "body", false).await.unwrap();

    // Dedup protocol: look up before adding. Same bytes, same language →
    // the existing record, never a second row.
    let found = store.find_by_text("Hello", Some("en")).await.unwrap();
    assert_eq!(found.map(|r| r.id), Some(first.id.clone()));

    // A different source language is a different original.
    assert!(store
        .find_by_text("Hello", Some("de"))
        .await
        .unwrap()
        .is_none());

    // Different bytes miss.
    assert!(store
        .find_by_text("hello", Some("en"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn empty_text_is_rejected() {
    let (_tmp, store) = setup_store().await;

    for blank in ["", "   ", "\n\t"] {
        let err = store.add(blank, Some("en"), "body", false).await.unwrap_err();
        assert!(matches!(err, StoreError::EmptyText));
    }

    // Nothing reached the table.
    let all = store.query(&TextQuery::default()).await.unwrap();
    assert!(all.is_empty());
}

#[tokio::test]
async fn unknown_state_value_is_a_silent_noop() {
    let (_tmp, store) = setup_store().await;

    let mut record = store.add("Hello", Some("en"), "body", false).await.unwrap();
    store
        .set_state(&mut record, TextState::Processing)
        .await
        .unwrap();

    for bogus in ["done", "IN_USE", "", "simplified"] {
        let changed = store.set_state_raw(&mut record, bogus).await.unwrap();
        assert!(!changed);
        let persisted = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(persisted.state, TextState::Processing);
    }

    // Legal values still transition.
    let changed = store.set_state_raw(&mut record, "ignore").await.unwrap();
    assert!(changed);
    assert_eq!(record.state, TextState::Ignore);
}

#[tokio::test]
async fn simplification_lookup_and_fallback() {
    let (_tmp, store) = setup_store().await;

    let mut record = store.add("Hello", Some("en"), "body", false).await.unwrap();

    // No simplification yet: the original comes back unmodified.
    let text = store.get_simplification(&record, "de").await.unwrap();
    assert_eq!(text, "Hello");

    store
        .set_simplification(&mut record, "Hallo", "de", "mock", 4711, 0)
        .await
        .unwrap();

    assert_eq!(record.state, TextState::InUse);
    assert!(store
        .has_simplification_in_language(&record.id, "de")
        .await
        .unwrap());
    assert!(!store
        .has_simplification_in_language(&record.id, "fr")
        .await
        .unwrap());

    let text = store.get_simplification(&record, "de").await.unwrap();
    assert_eq!(text, "Hallo");
    // Unsupported language: fall back to the original.
    let text = store.get_simplification(&record, "fr").await.unwrap();
    assert_eq!(text, "Hello");

    // Reverse lookup: the simplified text resolves back to its original.
    let found = store.find_by_simplification("Hallo", "de").await.unwrap();
    assert_eq!(found.map(|r| r.id), Some(record.id.clone()));
    assert!(store
        .find_by_simplification("Hallo", "fr")
        .await
        .unwrap()
        .is_none());

    let rows = store.simplifications(&record.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].used_api, "mock");
    assert_eq!(rows[0].job_id, 4711);
}

#[tokio::test]
async fn reset_all_simplifications_clears_table() {
    let (_tmp, store) = setup_store().await;

    let mut a = store.add("Hello", Some("en"), "body", false).await.unwrap();
    let mut b = store.add("World", Some("en"), "body", false).await.unwrap();
    store
        .set_simplification(&mut a, "Hallo", "de", "mock", 1, 0)
        .await
        .unwrap();
    store
        .set_simplification(&mut b, "Welt", "de", "mock", 2, 0)
        .await
        .unwrap();

    let removed = store.reset_all_simplifications().await.unwrap();
    assert_eq!(removed, 2);
    assert!(!store
        .has_simplification_in_language(&a.id, "de")
        .await
        .unwrap());
}

#[tokio::test]
async fn titles_sort_before_other_fields() {
    let (_tmp, store) = setup_store().await;
    let obj = ObjectRef::new(1, "page");

    let body = store.add("Some body", Some("en"), "body", true).await.unwrap();
    store.add_usage(&body.id, &obj, 1, "plain").await.unwrap();
    let title = store.add("A title", Some("en"), "title", false).await.unwrap();
    store.add_usage(&title.id, &obj, 0, "plain").await.unwrap();

    let records = store
        .query(&TextQuery {
            object: Some(obj),
            order: QueryOrder::TitleFirst,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].field, "title");
    assert_eq!(records[1].field, "body");
}

#[tokio::test]
async fn delete_keeps_shared_records() {
    let (_tmp, store) = setup_store().await;
    let obj_a = ObjectRef::new(1, "page");
    let obj_b = ObjectRef::new(2, "page");

    let record = store.add("Hello", Some("en"), "body", false).await.unwrap();
    store.add_usage(&record.id, &obj_a, 0, "plain").await.unwrap();
    store.add_usage(&record.id, &obj_b, 0, "plain").await.unwrap();

    store.delete(&record.id, Some(&obj_a)).await.unwrap();

    let usages = store.usages(&record.id).await.unwrap();
    assert_eq!(usages.len(), 1);
    assert_eq!(usages[0].object_id, 2);
    // Policy off: the record survives even with zero usages.
    store.delete(&record.id, Some(&obj_b)).await.unwrap();
    assert!(store.get(&record.id).await.unwrap().is_some());
}

#[tokio::test]
async fn delete_unused_policy_cascades() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("spx.sqlite");
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
        .unwrap()
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
    let pool: SqlitePool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .unwrap();
    migrate::apply_schema(&pool).await.unwrap();
    let store = TextStore::new(
        pool,
        StoreOptions {
            default_language: "en".to_string(),
            delete_unused_texts: true,
            tenant_id: 0,
        },
    );

    let obj = ObjectRef::new(1, "page");
    let mut record = store.add("Hello", Some("en"), "body", false).await.unwrap();
    store.add_usage(&record.id, &obj, 0, "plain").await.unwrap();
    store
        .set_simplification(&mut record, "Hallo", "de", "mock", 1, 0)
        .await
        .unwrap();

    store.delete(&record.id, Some(&obj)).await.unwrap();

    // Last usage gone + policy on → original and simplifications gone.
    assert!(store.get(&record.id).await.unwrap().is_none());
    assert!(store
        .find_by_simplification("Hallo", "de")
        .await
        .unwrap()
        .is_none());
    // And the lookup no longer resolves (cache was invalidated too).
    assert!(store
        .find_by_text("Hello", Some("en"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn query_filters_compose() {
    let (_tmp, store) = setup_store().await;
    let obj = ObjectRef::new(1, "page");

    let mut a = store.add("Hello", Some("en"), "body", false).await.unwrap();
    store.add_usage(&a.id, &obj, 0, "plain").await.unwrap();
    let b = store.add("World", Some("en"), "body", false).await.unwrap();
    store.add_usage(&b.id, &obj, 1, "plain").await.unwrap();
    store.add("Bonjour", Some("fr"), "body", false).await.unwrap();

    store
        .set_simplification(&mut a, "Hallo", "de", "mock", 1, 0)
        .await
        .unwrap();

    let with_simplification = store
        .query(&TextQuery {
            has_simplification: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(with_simplification.len(), 1);
    assert_eq!(with_simplification[0].id, a.id);

    let without = store
        .query(&TextQuery {
            has_simplification: Some(false),
            source_language: Some("en".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(without.len(), 1);
    assert_eq!(without[0].id, b.id);

    let in_german = store
        .query(&TextQuery {
            target_language: Some("de".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(in_german.len(), 1);

    let due_for_object = store
        .query(&TextQuery {
            object: Some(obj),
            usage_state: Some(TextState::ToSimplify),
            limit: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(due_for_object.len(), 1);
}
