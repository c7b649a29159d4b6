//! Universal store-contract invariants, exercised on the filesystem backend.
//!
//! The same properties hold on the database backend; the suites in
//! `database_live.rs` repeat the concurrency-sensitive ones against a real
//! `PostgreSQL` when one is configured.

use std::sync::Arc;

use openclaw_statestore::{FilesystemStore, JsonUpdater, StateStore, StoreError, UpdateDecision};
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};

fn fs_store(dir: &TempDir) -> Arc<dyn StateStore> {
    Arc::new(FilesystemStore::new(dir.path().to_path_buf()))
}

#[tokio::test]
async fn round_trip_survives_reopen() {
    let dir = tempdir().unwrap();
    let doc = json!({"channel": "telegram", "offset": 921_455});

    fs_store(&dir)
        .write_json("telegram/offset.json", &doc)
        .await
        .unwrap();

    // A fresh store over the same home sees the same document, which is what
    // a process restart looks like to this backend.
    let reopened = fs_store(&dir);
    assert_eq!(reopened.read_json("telegram/offset.json").unwrap(), Some(doc));
}

#[tokio::test]
async fn absent_key_reads_as_none_and_fallback_reports_absence() {
    let dir = tempdir().unwrap();
    let store = fs_store(&dir);

    assert!(store.read_json("never.json").unwrap().is_none());
    assert!(store.read_text("never.txt").unwrap().is_none());

    let read = store
        .read_json_with_fallback("never.json", json!({"default": true}))
        .unwrap();
    assert!(!read.exists);
    assert_eq!(read.value, json!({"default": true}));

    store.write_json("now.json", &json!(1)).await.unwrap();
    let read = store.read_json_with_fallback("now.json", json!(0)).unwrap();
    assert!(read.exists);
    assert_eq!(read.value, json!(1));
}

#[tokio::test]
async fn delete_then_read_is_none() {
    let dir = tempdir().unwrap();
    let store = fs_store(&dir);

    store.write_json("gone.json", &json!({"v": 1})).await.unwrap();
    store.delete("gone.json").await.unwrap();
    assert!(store.read_json("gone.json").unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_upserts_on_disjoint_keys_lose_nothing() {
    let dir = tempdir().unwrap();
    let store = fs_store(&dir);

    let mk = |name: &'static str| -> JsonUpdater {
        Box::new(move |_| Ok(UpdateDecision::Write(json!({"name": name}))))
    };

    let a = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.update_json_with_lock("a.json", mk("A")).await })
    };
    let b = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.update_json_with_lock("b.json", mk("B")).await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    assert_eq!(store.read_json("a.json").unwrap(), Some(json!({"name": "A"})));
    assert_eq!(store.read_json("b.json").unwrap(), Some(json!({"name": "B"})));
}

#[tokio::test]
async fn registry_update_then_remove_leaves_empty_entries() {
    let dir = tempdir().unwrap();
    let store = fs_store(&dir);
    let key = "sandbox/registry.json";

    store
        .write_json(
            key,
            &json!({"entries": [{"containerName": "X", "configHash": "orig"}]}),
        )
        .await
        .unwrap();

    store
        .update_json_with_lock(
            key,
            Box::new(|current| {
                let mut doc = current.expect("registry was seeded");
                for entry in doc["entries"].as_array_mut().expect("entries array") {
                    if entry["containerName"] == "X" {
                        entry["configHash"] = json!("updated");
                    }
                }
                Ok(UpdateDecision::Write(doc))
            }),
        )
        .await
        .unwrap();

    store
        .update_json_with_lock(
            key,
            Box::new(|current| {
                let mut doc = current.expect("registry still present");
                doc["entries"]
                    .as_array_mut()
                    .expect("entries array")
                    .retain(|entry| entry["containerName"] != "X");
                Ok(UpdateDecision::Write(doc))
            }),
        )
        .await
        .unwrap();

    assert_eq!(store.read_json(key).unwrap(), Some(json!({"entries": []})));
}

#[tokio::test]
async fn corrupt_document_blocks_update_without_writing() {
    let dir = tempdir().unwrap();
    let store = fs_store(&dir);
    std::fs::write(dir.path().join("bad.json"), "{bad json").unwrap();

    let err = store
        .update_json_with_lock(
            "bad.json",
            Box::new(|_| Ok(UpdateDecision::Write(json!({"healed": true})))),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::Corrupt { .. }));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("bad.json")).unwrap(),
        "{bad json"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn counter_reaches_ten_under_contention() {
    let dir = tempdir().unwrap();
    let store = fs_store(&dir);

    let mut writers = Vec::new();
    for _ in 0..10 {
        let store = Arc::clone(&store);
        writers.push(tokio::spawn(async move {
            store
                .update_json_with_lock(
                    "counter.json",
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

    assert_eq!(store.read_json("counter.json").unwrap(), Some(json!(10)));
}

#[tokio::test]
async fn text_round_trips_verbatim() {
    let dir = tempdir().unwrap();
    let store = fs_store(&dir);

    store.write_text("restart.sentinel", "pid:4711").await.unwrap();
    assert_eq!(
        store.read_text("restart.sentinel").unwrap().as_deref(),
        Some("pid:4711")
    );
}

#[tokio::test]
async fn backup_write_leaves_a_sidecar() {
    let dir = tempdir().unwrap();
    let store = fs_store(&dir);

    store
        .write_json_with_backup("auth.json", &json!({"token": "t"}))
        .await
        .unwrap();

    assert!(dir.path().join("auth.json.bak").exists());
}

#[tokio::test]
async fn lenient_read_accepts_human_edits() {
    let dir = tempdir().unwrap();
    let store = fs_store(&dir);
    std::fs::write(
        dir.path().join("picker.json"),
        "{ model: 'opus', /* picked manually */ }",
    )
    .unwrap();

    let doc = store.read_json5("picker.json").unwrap().unwrap();
    assert_eq!(doc["model"], "opus");
}

#[tokio::test]
async fn flush_is_a_no_op_on_synchronous_writes() {
    let dir = tempdir().unwrap();
    let store = fs_store(&dir);

    store.write_json("x.json", &json!(1)).await.unwrap();
    store.flush().await.unwrap();
    assert_eq!(store.read_json("x.json").unwrap(), Some(json!(1)));
}
