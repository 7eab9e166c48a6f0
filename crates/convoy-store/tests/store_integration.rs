#![allow(clippy::unwrap_used, clippy::expect_used)]

use convoy_store::{insert, load, load_all, save, Collection, FileStore, MemoryStore, Store};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Record {
    id: String,
    value: u32,
}

/// Helper: create a FileStore in a temp directory.
async fn temp_store() -> (Arc<FileStore>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let store = FileStore::new(tmp.path().join("data")).await.unwrap();
    (Arc::new(store), tmp)
}

async fn exercise_contract(store: &dyn Store) {
    let a = Record {
        id: "a".into(),
        value: 1,
    };
    let b = Record {
        id: "b".into(),
        value: 2,
    };

    assert!(insert(store, Collection::Tasks, "b", &b).await.unwrap());
    assert!(insert(store, Collection::Tasks, "a", &a).await.unwrap());
    assert!(!insert(store, Collection::Tasks, "a", &b).await.unwrap());

    let loaded: Option<Record> = load(store, Collection::Tasks, "a").await.unwrap();
    assert_eq!(loaded, Some(a.clone()));

    let updated = Record { value: 10, ..a };
    save(store, Collection::Tasks, "a", &updated).await.unwrap();
    let all: Vec<Record> = load_all(store, Collection::Tasks).await.unwrap();
    assert_eq!(all, vec![updated, b]);

    assert_eq!(
        store.list(Collection::Tasks).await.unwrap(),
        vec!["a".to_string(), "b".to_string()]
    );
    assert!(store.list(Collection::Results).await.unwrap().is_empty());

    assert!(store.delete(Collection::Tasks, "a").await.unwrap());
    let missing: Option<Record> = load(store, Collection::Tasks, "a").await.unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_memory_store_contract() {
    exercise_contract(&MemoryStore::new()).await;
}

#[tokio::test]
async fn test_file_store_contract() {
    let (store, _tmp) = temp_store().await;
    exercise_contract(store.as_ref()).await;
}

#[tokio::test]
async fn test_file_store_persists_across_instances() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let store = FileStore::new(tmp.path()).await.unwrap();
        let r = Record {
            id: "p".into(),
            value: 7,
        };
        save(&store, Collection::Workflows, "p", &r).await.unwrap();
    }
    let store2 = FileStore::new(tmp.path()).await.unwrap();
    let loaded: Option<Record> = load(&store2, Collection::Workflows, "p").await.unwrap();
    assert_eq!(loaded.map(|r| r.value), Some(7));
}

#[tokio::test]
async fn test_concurrent_create_has_single_winner() {
    let (store, _tmp) = temp_store().await;
    let mut handles = Vec::new();
    for i in 0..16u32 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .create(Collection::Locks, "registry", &serde_json::json!({ "owner": i }))
                .await
                .unwrap()
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}
