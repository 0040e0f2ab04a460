mod common;

use common::*;
use lazystore::*;
use std::sync::Arc;

async fn sqlite(prefix: &str) -> (Arc<dyn StorageDriver>, std::path::PathBuf) {
    let file = temp_path("lazystore_sql").with_extension("db");
    let settings = RelationalSettings {
        dialect: SqlDialect::Sqlite,
        database: file.to_string_lossy().into_owned(),
        prefix: prefix.to_string(),
        ..Default::default()
    };
    let driver = lazystore::storage::open(&StorageSettings::Relational(settings)).await.unwrap();
    (driver, file)
}

#[tokio::test]
async fn rows_round_trip_through_sqlite() {
    let (driver, file) = sqlite("it_").await;
    let manager = players(driver).await;

    let mut bob = player("bob", 7);
    bob.online = false;
    let key = manager.key_of(&bob).unwrap();
    let cached = manager.insert(bob.clone()).unwrap();
    assert!(manager.flush(&[key.clone()], false).await.is_clean());

    cached.write().score = 99;
    let report = manager.flush_all(SaveOperation::SaveAllAndEvictAll).await;
    assert_eq!(report.saved, vec![key.clone()]);
    assert!(manager.is_empty());

    let loaded = manager.load_inline(&key).await.unwrap();
    bob.score = 99;
    assert_eq!(*loaded.read(), bob);
    let _ = std::fs::remove_file(file);
}

#[tokio::test]
async fn unique_conflicts_keep_the_loser_cached() {
    let (driver, file) = sqlite("").await;
    let manager = players(driver).await;

    let first = player("eve", 1);
    let second = player("eve", 2);
    manager.insert(first).unwrap();
    manager.insert(second).unwrap();

    let report = manager.flush_all(SaveOperation::SaveAllAndEvictAll).await;
    assert_eq!(report.saved.len(), 1);
    assert_eq!(report.failed.len(), 1);
    assert!(manager.is_cached(&report.failed[0]));
    assert!(!manager.is_cached(&report.saved[0]));
    let _ = std::fs::remove_file(file);
}
