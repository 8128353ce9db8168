//! End-to-end coverage of hydration, offline editing, and reconnect sync
//! across the cache store and the sync engine together — no mocking, a
//! real SQLite file and an in-process remote fake, the way the teacher's
//! own integration tests exercise a real database instead of stubbing it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gitmdfs::cache::{create_pool, CacheStore};
use gitmdfs::config::{ConflictPolicy, GitmdfsConfig, DEFAULT_CACHE_MMAP_BYTES};
use gitmdfs::remote::fake::{FailMode, InMemoryRemote};
use gitmdfs::remote::{IssueSnapshot, RemoteCapability};
use gitmdfs::sync::SyncEngine;
use tempfile::tempdir;

const REPO: &str = "owner/repo";

async fn store_at(dir: &std::path::Path) -> Arc<CacheStore> {
    let pool = create_pool(&dir.join("cache.db"), DEFAULT_CACHE_MMAP_BYTES)
        .await
        .unwrap();
    Arc::new(CacheStore::open(pool).await.unwrap())
}

fn config(dir: &std::path::Path) -> GitmdfsConfig {
    GitmdfsConfig {
        repository: REPO.to_string(),
        debounce_interval: Duration::from_millis(10),
        poll_interval: Duration::from_secs(3600),
        conflict_policy: ConflictPolicy::PreferRemoteWithBackup,
        cache_dir: dir.to_path_buf(),
        cache_mmap_bytes: DEFAULT_CACHE_MMAP_BYTES,
    }
}

fn seeded_issue(number: u64, body: &str) -> IssueSnapshot {
    IssueSnapshot {
        number,
        title: "Crash on startup".to_string(),
        body: body.to_string(),
        state: "open".to_string(),
        author: "alice".to_string(),
        labels: vec!["bug".to_string()],
        created_at: Utc::now(),
        updated_at: Utc::now(),
        validator: "v1".to_string(),
    }
}

/// S1: a fresh mount hydrates every remote issue into the cache before
/// serving the namespace.
#[tokio::test]
async fn initial_hydration_populates_the_cache() {
    let dir = tempdir().unwrap();
    let store = store_at(dir.path()).await;
    let remote = Arc::new(InMemoryRemote::new());
    remote.seed_issue(seeded_issue(1, "Repro steps here"));

    let engine = SyncEngine::new(store.clone(), remote.clone(), config(dir.path()));
    let (_handle, hydration) = engine.start().await;
    assert!(hydration.is_ok());

    let cached = store.get_issue(REPO, 1).await.unwrap().unwrap();
    assert_eq!(cached.body, "Repro steps here");
    assert!(!cached.dirty);
}

/// S4: a local edit made while the remote is unreachable survives the
/// cache untouched, then pushes successfully once connectivity returns.
#[tokio::test]
async fn offline_edit_survives_and_pushes_after_reconnect() {
    let dir = tempdir().unwrap();
    let store = store_at(dir.path()).await;
    let remote = Arc::new(InMemoryRemote::new());
    remote.seed_issue(seeded_issue(1, "Original body"));

    let engine = SyncEngine::new(store.clone(), remote.clone(), config(dir.path()));
    let (handle, hydration) = engine.start().await;
    assert!(hydration.is_ok());

    remote.set_fail_mode(FailMode::Transport, std::time::SystemTime::now());

    store
        .mark_dirty(
            REPO,
            1,
            &gitmdfs::cache::IssueFieldChanges {
                body: Some("Edited while offline".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // The push attempt fails at the transport but leaves the dirty row
    // intact for the next pass, never surfacing the transport error to
    // the caller (flush_now only reports hard store errors).
    handle.flush_now().await.unwrap();
    let still_dirty = store.get_issue(REPO, 1).await.unwrap().unwrap();
    assert!(still_dirty.dirty);
    assert_eq!(still_dirty.body, "Edited while offline");

    remote.clear_fail_mode();
    handle.flush_now().await.unwrap();

    let pushed = store.get_issue(REPO, 1).await.unwrap().unwrap();
    assert!(!pushed.dirty);
    let calls = remote.update_issue_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.body.as_deref(), Some("Edited while offline"));

    handle.stop().await;
}

/// Reopening the same cache directory after a process restart observes
/// the previously hydrated and dirty state, the way a real mount restart
/// would.
#[tokio::test]
async fn cache_state_survives_reopening_the_store() {
    let dir = tempdir().unwrap();
    {
        let store = store_at(dir.path()).await;
        let remote = Arc::new(InMemoryRemote::new());
        remote.seed_issue(seeded_issue(1, "First run body"));
        let engine = SyncEngine::new(store.clone(), remote, config(dir.path()));
        let (handle, hydration) = engine.start().await;
        assert!(hydration.is_ok());
        handle.stop().await;
    }

    let reopened = store_at(dir.path()).await;
    let cached = reopened.get_issue(REPO, 1).await.unwrap().unwrap();
    assert_eq!(cached.body, "First run body");
}
