//! Database-backend scenarios against a live `PostgreSQL`.
//!
//! Every test uses its own unique key prefix, so the suite is safe to run in
//! parallel and does not wipe the table. Tests skip with a message unless
//! `OPENCLAW_TEST_DB_URL` is set.

use std::process;
use std::sync::Arc;

use openclaw_statestore::{DatabaseStore, StateStore, UpdateDecision};
use rand::Rng;
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;

const TEST_DB_ENV: &str = "OPENCLAW_TEST_DB_URL";

async fn connect_store() -> Option<DatabaseStore> {
    let Ok(url) = std::env::var(TEST_DB_ENV) else {
        eprintln!("skipping: {TEST_DB_ENV} not set");
        return None;
    };
    Some(
        DatabaseStore::connect(&url)
            .await
            .expect("connect test database"),
    )
}

/// Key unique per test invocation so suites never collide.
fn unique_key(name: &str) -> String {
    format!(
        "itest/{name}/{}-{:08x}.json",
        process::id(),
        rand::rng().random::<u32>()
    )
}

#[tokio::test]
async fn write_is_immediately_visible_and_durable_after_flush() {
    let Some(store) = connect_store().await else { return };
    let key = unique_key("durability");
    let doc = json!({"name": "A", "nested": {"list": [1, 2, 3]}});

    store.write_json(&key, &doc).await.unwrap();

    // Write-through: visible to this process before any commit happened.
    assert_eq!(store.read_json(&key).unwrap(), Some(doc.clone()));

    store.flush().await.unwrap();

    // A second connection (a stand-in for a second process) sees the row.
    let url = std::env::var(TEST_DB_ENV).unwrap();
    let other = PgPoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .unwrap();
    let row: Option<Value> = sqlx::query_scalar("SELECT data FROM kv WHERE key = $1")
        .bind(&key)
        .fetch_optional(&other)
        .await
        .unwrap();
    assert_eq!(row, Some(doc));

    store.delete(&key).await.unwrap();
    store.close().await.unwrap();
}

#[tokio::test]
async fn delete_clears_cache_and_row() {
    let Some(store) = connect_store().await else { return };
    let key = unique_key("delete");

    store.write_json(&key, &json!({"v": 1})).await.unwrap();
    store.delete(&key).await.unwrap();

    assert!(store.read_json(&key).unwrap().is_none());
    store.flush().await.unwrap();

    let row: Option<Value> = sqlx::query_scalar("SELECT data FROM kv WHERE key = $1")
        .bind(&key)
        .fetch_optional(store.pool())
        .await
        .unwrap();
    assert!(row.is_none());
    store.close().await.unwrap();
}

#[tokio::test]
async fn per_key_order_holds_across_a_burst_of_writes() {
    let Some(store) = connect_store().await else { return };
    let key = unique_key("burst");

    for n in 0..50 {
        store.write_json(&key, &json!({"seq": n})).await.unwrap();
    }
    store.flush().await.unwrap();

    let row: Option<Value> = sqlx::query_scalar("SELECT data FROM kv WHERE key = $1")
        .bind(&key)
        .fetch_optional(store.pool())
        .await
        .unwrap();
    assert_eq!(row, Some(json!({"seq": 49})));

    store.delete(&key).await.unwrap();
    store.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn counter_reaches_ten_under_contention() {
    let Some(store) = connect_store().await else { return };
    let store = Arc::new(store);
    let key = unique_key("counter");

    let mut writers = Vec::new();
    for _ in 0..10 {
        let store = Arc::clone(&store);
        let key = key.clone();
        writers.push(tokio::spawn(async move {
            store
                .update_json_with_lock(
                    &key,
                    Box::new(|current| {
                        let n = current.as_ref().and_then(Value::as_i64).unwrap_or(0);
                        Ok(UpdateDecision::Write(json!(n + 1)))
                    }),
                )
                .await
        }));
    }
    for writer in writers {
        writer.await.unwrap().unwrap();
    }

    assert_eq!(store.read_json(&key).unwrap(), Some(json!(10)));

    store.delete(&key).await.unwrap();
    store.close().await.unwrap();
}

#[tokio::test]
async fn update_serializes_creation_of_missing_rows() {
    let Some(store) = connect_store().await else { return };
    let key = unique_key("create");

    let result = store
        .update_json_with_lock(
            &key,
            Box::new(|current| {
                assert!(current.is_none());
                Ok(UpdateDecision::Write(json!({"created": true})))
            }),
        )
        .await
        .unwrap();
    assert_eq!(result, Some(json!({"created": true})));

    // Observable to later updaters and to plain reads.
    let kept = store
        .update_json_with_lock(
            &key,
            Box::new(|current| {
                assert_eq!(current, Some(json!({"created": true})));
                Ok(UpdateDecision::Keep)
            }),
        )
        .await
        .unwrap();
    assert_eq!(kept, Some(json!({"created": true})));

    store.delete(&key).await.unwrap();
    store.close().await.unwrap();
}

#[tokio::test]
async fn failing_updater_rolls_back_and_changes_nothing() {
    let Some(store) = connect_store().await else { return };
    let key = unique_key("abort");

    store.write_json(&key, &json!({"v": 1})).await.unwrap();
    store.flush().await.unwrap();

    let err = store
        .update_json_with_lock(&key, Box::new(|_| anyhow::bail!("nope")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        openclaw_statestore::StoreError::UpdateAborted { .. }
    ));

    assert_eq!(store.read_json(&key).unwrap(), Some(json!({"v": 1})));

    store.delete(&key).await.unwrap();
    store.close().await.unwrap();
}

#[tokio::test]
async fn text_documents_round_trip_through_the_marker_object() {
    let Some(store) = connect_store().await else { return };
    let key = unique_key("text");

    store.write_text(&key, "pid:4711").await.unwrap();
    assert_eq!(store.read_text(&key).unwrap().as_deref(), Some("pid:4711"));

    store.flush().await.unwrap();
    let row: Option<Value> = sqlx::query_scalar("SELECT data FROM kv WHERE key = $1")
        .bind(&key)
        .fetch_optional(store.pool())
        .await
        .unwrap();
    assert_eq!(row, Some(json!({"__text": "pid:4711"})));

    store.delete(&key).await.unwrap();
    store.close().await.unwrap();
}

#[tokio::test]
async fn preload_makes_rows_written_elsewhere_readable() {
    let Some(store) = connect_store().await else { return };
    let key = unique_key("preload");

    // Another process wrote this row; this cache has never seen it.
    sqlx::query("INSERT INTO kv (key, data) VALUES ($1, $2)")
        .bind(&key)
        .bind(json!({"planted": true}))
        .execute(store.pool())
        .await
        .unwrap();

    assert!(store.read_json(&key).unwrap().is_none());
    store.ensure_preloaded().await.unwrap();
    assert_eq!(store.read_json(&key).unwrap(), Some(json!({"planted": true})));

    store.delete(&key).await.unwrap();
    store.close().await.unwrap();
}

#[tokio::test]
async fn targeted_preload_warms_only_the_requested_keys() {
    let Some(store) = connect_store().await else { return };
    let key = unique_key("warm");

    sqlx::query("INSERT INTO kv (key, data) VALUES ($1, $2)")
        .bind(&key)
        .bind(json!({"warm": true}))
        .execute(store.pool())
        .await
        .unwrap();

    store.preload(&[key.clone()]).await.unwrap();
    assert_eq!(store.read_json(&key).unwrap(), Some(json!({"warm": true})));

    store.delete(&key).await.unwrap();
    store.close().await.unwrap();
}

#[tokio::test]
async fn returned_documents_are_clones_not_aliases() {
    let Some(store) = connect_store().await else { return };
    let key = unique_key("clone");

    store.write_json(&key, &json!({"list": [1]})).await.unwrap();

    let mut first = store.read_json(&key).unwrap().unwrap();
    first["list"].as_array_mut().unwrap().push(json!(2));

    // Mutating the returned value must not corrupt the cached document.
    assert_eq!(store.read_json(&key).unwrap(), Some(json!({"list": [1]})));

    store.delete(&key).await.unwrap();
    store.close().await.unwrap();
}
