use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify};

use crate::cache::store::RemoteComment;
use crate::cache::{CacheStore, Issue, IssueState};
use crate::codec;
use crate::config::{ConflictPolicy, GitmdfsConfig};
use crate::error::GitmdfsError;
use crate::remote::{retrying_rate_limit, FetchOutcome, IssuePatch, IssueSnapshot, RemoteCapability};

/// Commands a [`SyncHandle`] sends to the background engine.
enum EngineCommand {
    /// A local write landed in the cache; collapse into the debounce timer.
    LocalChange,
    /// Block until any queued push (and any push this unblocks) completes.
    FlushNow(oneshot::Sender<Result<(), GitmdfsError>>),
    /// Stop the background task after acknowledging.
    Stop(oneshot::Sender<()>),
}

/// Shared, immutable-after-construction state the background task and its
/// helper functions close over.
struct EngineState {
    store: Arc<CacheStore>,
    remote: Arc<dyn RemoteCapability>,
    config: GitmdfsConfig,
    /// Serializes push and reconcile: at most one of them touches any given
    /// issue at a time, and a poll's reconcile never races a push.
    push_mutex: AsyncMutex<()>,
    /// Notified on `Stop` so a rate-limit sleep in progress on a background
    /// push/poll task is cut short instead of queuing behind it.
    stop: Notify,
}

/// A lightweight, cloneable handle to a running engine. Communicates with
/// the background task over a channel, the way the teacher's `SyncHandle`
/// never locks the engine itself to send a command.
#[derive(Clone)]
pub struct SyncHandle {
    command_tx: mpsc::UnboundedSender<EngineCommand>,
}

impl SyncHandle {
    /// Signal that a local write happened. Non-blocking: the filesystem
    /// adapter calls this from a synchronous FUSE callback and must never
    /// wait on it.
    pub fn on_local_change(&self) {
        let _ = self.command_tx.send(EngineCommand::LocalChange);
    }

    /// Block until any queued push has completed, bypassing the debounce
    /// window. Used by tests and by an explicit "sync now" request.
    pub async fn flush_now(&self) -> Result<(), GitmdfsError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(EngineCommand::FlushNow(tx))
            .map_err(|_| GitmdfsError::store_error("sync engine is not running"))?;
        rx.await
            .map_err(|_| GitmdfsError::store_error("sync engine stopped before flush completed"))?
    }

    /// Cancel the debounce and poll timers and wait for the background task
    /// to exit.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.command_tx.send(EngineCommand::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// The sync engine: initial hydration plus the three background activities
/// (debounced pusher, poller, shutdown) described by the component design.
pub struct SyncEngine {
    state: Arc<EngineState>,
}

impl SyncEngine {
    pub fn new(store: Arc<CacheStore>, remote: Arc<dyn RemoteCapability>, config: GitmdfsConfig) -> Self {
        Self {
            state: Arc::new(EngineState {
                store,
                remote,
                config,
                push_mutex: AsyncMutex::new(()),
                stop: Notify::new(),
            }),
        }
    }

    /// Run initial hydration synchronously, then spawn the background
    /// activities. The caller learns whether hydration succeeded before the
    /// mount is served; the background task keeps running regardless so an
    /// offline mount still serves the last-cached state (scenario: offline
    /// serve).
    pub async fn start(self) -> (SyncHandle, Result<(), GitmdfsError>) {
        let hydration_result = hydrate(&self.state).await;
        if let Err(e) = &hydration_result {
            log::warn!("initial hydration failed, serving cached state: {e}");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let state = self.state.clone();
        tokio::spawn(run_loop(state, rx));

        (SyncHandle { command_tx: tx }, hydration_result)
    }
}

async fn run_loop(state: Arc<EngineState>, mut rx: mpsc::UnboundedReceiver<EngineCommand>) {
    let mut poll_ticker = tokio::time::interval(state.config.poll_interval);
    poll_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    poll_ticker.tick().await; // first tick fires immediately; consume it

    let debounce_sleep = tokio::time::sleep(state.config.debounce_interval);
    tokio::pin!(debounce_sleep);
    let mut debounce_armed = false;

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    None => break,
                    Some(EngineCommand::LocalChange) => {
                        debounce_sleep.as_mut().reset(tokio::time::Instant::now() + state.config.debounce_interval);
                        debounce_armed = true;
                    }
                    Some(EngineCommand::FlushNow(ack)) => {
                        debounce_armed = false;
                        let state = state.clone();
                        // Spawned rather than awaited inline: a `Stop` must
                        // be able to notify `state.stop` and break this loop
                        // while a rate-limit sleep inside this push is still
                        // in progress, instead of queuing behind it.
                        tokio::spawn(async move {
                            let result = push_phase(&state).await;
                            let _ = ack.send(result);
                        });
                    }
                    Some(EngineCommand::Stop(ack)) => {
                        state.stop.notify_waiters();
                        let _ = ack.send(());
                        break;
                    }
                }
            }
            () = &mut debounce_sleep, if debounce_armed => {
                debounce_armed = false;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = push_phase(&state).await {
                        log::warn!("debounced push failed: {e}");
                    }
                });
            }
            _ = poll_ticker.tick() => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = poll_phase(&state).await {
                        log::warn!("poll failed: {e}");
                    }
                });
            }
        }
    }
}

/// `Start`'s synchronous half: fetch every remote issue and its comments,
/// upserting into the cache. Never clears or sets a row's dirty flag —
/// local edits made while offline must survive hydration untouched.
async fn hydrate(state: &EngineState) -> Result<(), GitmdfsError> {
    let repo = state.config.repository.clone();
    let snapshots = state.remote.list_issues(&repo).await?;

    for snapshot in snapshots {
        let existing = state.store.get_issue(&repo, snapshot.number).await?;
        let (dirty, local_updated_at) = match &existing {
            Some(e) => (e.dirty, e.local_updated_at),
            None => (false, Utc::now()),
        };

        let issue = Issue {
            repository: repo.clone(),
            number: snapshot.number,
            title: snapshot.title,
            body: snapshot.body,
            state: IssueState::from(snapshot.state.as_str()),
            author: snapshot.author,
            labels: snapshot.labels,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
            validator: snapshot.validator,
            dirty,
            local_updated_at,
        };
        state.store.upsert_issue(&issue).await?;

        let comments = state.remote.list_comments(&repo, issue.number).await?;
        let remote_comments: Vec<RemoteComment> = comments
            .into_iter()
            .map(|c| RemoteComment {
                id: c.id,
                author: c.author,
                body: c.body,
                created_at: c.created_at,
                updated_at: c.updated_at,
            })
            .collect();
        state
            .store
            .upsert_comments_of_issue(&repo, issue.number, &remote_comments)
            .await?;
    }

    Ok(())
}

/// The push phase: drain pending issues, dirty issues, dirty comments, then
/// pending comments, in that order. A per-row transport failure is logged
/// and the row is left for the next pass; a store-level failure aborts the
/// whole phase.
async fn push_phase(state: &EngineState) -> Result<(), GitmdfsError> {
    let _guard = state.push_mutex.lock().await;
    let repo = state.config.repository.clone();

    push_pending_issues(state, &repo).await?;
    push_dirty_issues(state, &repo).await?;
    push_dirty_comments(state, &repo).await?;
    push_pending_comments(state, &repo).await?;

    Ok(())
}

async fn push_pending_issues(state: &EngineState, repo: &str) -> Result<(), GitmdfsError> {
    for pending in state.store.list_pending_issues(repo).await? {
        let patch = IssuePatch {
            title: Some(pending.title.clone()),
            body: Some(pending.body.clone()),
            state: None,
            labels: Some(pending.labels.clone()),
        };
        match retrying_rate_limit(&state.stop, || state.remote.create_issue(repo, &patch)).await {
            Ok(snapshot) => {
                let issue = Issue {
                    repository: repo.to_string(),
                    number: snapshot.number,
                    title: snapshot.title,
                    body: snapshot.body,
                    state: IssueState::from(snapshot.state.as_str()),
                    author: snapshot.author,
                    labels: snapshot.labels,
                    created_at: snapshot.created_at,
                    updated_at: snapshot.updated_at,
                    validator: snapshot.validator,
                    dirty: false,
                    local_updated_at: Utc::now(),
                };
                state.store.upsert_issue(&issue).await?;
                state.store.remove_pending_issue(pending.local_seq).await?;
            }
            Err(GitmdfsError::RemoteTransport(msg)) => {
                log::warn!(
                    "push: create_issue failed for pending issue {}: {msg}, stopping this pass",
                    pending.local_seq
                );
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn push_dirty_issues(state: &EngineState, repo: &str) -> Result<(), GitmdfsError> {
    for issue in state.store.list_dirty_issues(repo).await? {
        let patch = IssuePatch {
            title: Some(issue.title.clone()),
            body: Some(issue.body.clone()),
            state: Some(issue.state.as_str().to_string()),
            labels: Some(issue.labels.clone()),
        };
        match retrying_rate_limit(&state.stop, || state.remote.update_issue(repo, issue.number, &patch)).await {
            Ok(()) => {
                state.store.clear_dirty(repo, issue.number).await?;
            }
            Err(GitmdfsError::RemoteTransport(msg)) => {
                log::warn!("push: update_issue failed for issue {}: {msg}", issue.number);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn push_dirty_comments(state: &EngineState, repo: &str) -> Result<(), GitmdfsError> {
    for comment in state.store.list_dirty_comments(repo).await? {
        match retrying_rate_limit(&state.stop, || state.remote.update_comment(repo, comment.id, &comment.body)).await {
            Ok(()) => {
                state.store.clear_comment_dirty(repo, comment.id).await?;
            }
            Err(GitmdfsError::RemoteTransport(msg)) => {
                log::warn!("push: update_comment failed for comment {}: {msg}", comment.id);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn push_pending_comments(state: &EngineState, repo: &str) -> Result<(), GitmdfsError> {
    for pending in state.store.list_pending_comments(repo).await? {
        let issue_number = pending.issue_number as u64;
        match retrying_rate_limit(&state.stop, || state.remote.create_comment(repo, issue_number, &pending.body)).await {
            Ok(snapshot) => {
                let remote_comment = RemoteComment {
                    id: snapshot.id,
                    author: snapshot.author,
                    body: snapshot.body,
                    created_at: snapshot.created_at,
                    updated_at: snapshot.updated_at,
                };
                state
                    .store
                    .insert_comment(repo, issue_number, &remote_comment)
                    .await?;
                state.store.remove_pending_comment(pending.local_seq).await?;
            }
            Err(GitmdfsError::RemoteTransport(msg)) => {
                log::warn!("push: create_comment failed for pending comment {}: {msg}", pending.local_seq);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// The poller: walk cached issues in ascending number order, asking the
/// remote whether each has changed since its stored validator, and
/// reconcile the ones that have.
async fn poll_phase(state: &EngineState) -> Result<(), GitmdfsError> {
    let repo = state.config.repository.clone();
    let issues = state.store.list_issues(&repo).await?;

    for issue in issues {
        let outcome = match retrying_rate_limit(&state.stop, || {
            state
                .remote
                .get_issue_if_changed(&repo, issue.number, &issue.validator)
        })
        .await
        {
            Ok(outcome) => outcome,
            Err(GitmdfsError::RemoteTransport(msg)) => {
                log::warn!("poll: get_issue_if_changed failed for issue {}: {msg}", issue.number);
                continue;
            }
            Err(e) => return Err(e),
        };

        if let FetchOutcome::Updated(snapshot) = outcome {
            reconcile_issue(state, &repo, snapshot).await?;
        }
    }

    Ok(())
}

/// Reconcile one issue's updated remote snapshot against the cache. A
/// not-dirty local row adopts the snapshot outright; a dirty row is
/// resolved per the configured conflict policy.
async fn reconcile_issue(
    state: &EngineState,
    repo: &str,
    snapshot: IssueSnapshot,
) -> Result<(), GitmdfsError> {
    let _guard = state.push_mutex.lock().await;

    let Some(local) = state.store.get_issue(repo, snapshot.number).await? else {
        return Ok(());
    };

    if !local.dirty {
        apply_remote_snapshot(state, repo, snapshot).await?;
        return Ok(());
    }

    match state.config.conflict_policy {
        ConflictPolicy::PreferLocal => {
            log::info!(
                "reconcile: keeping dirty local issue {} over remote change; will overwrite on next push",
                local.number
            );
        }
        ConflictPolicy::PreferRemoteWithBackup => {
            let comments = state.store.list_comments(repo, local.number).await?;
            let backup = codec::encode(&local, &comments);
            write_conflict_backup(&state.config, local.number, &backup)?;
            let number = snapshot.number;
            apply_remote_snapshot(state, repo, snapshot).await?;
            state.store.clear_dirty(repo, number).await?;
            log::warn!("reconcile: backed up dirty issue {number} before adopting remote snapshot");
        }
    }

    Ok(())
}

async fn apply_remote_snapshot(
    state: &EngineState,
    repo: &str,
    snapshot: IssueSnapshot,
) -> Result<(), GitmdfsError> {
    let number = snapshot.number;
    let issue = Issue {
        repository: repo.to_string(),
        number,
        title: snapshot.title,
        body: snapshot.body,
        state: IssueState::from(snapshot.state.as_str()),
        author: snapshot.author,
        labels: snapshot.labels,
        created_at: snapshot.created_at,
        updated_at: snapshot.updated_at,
        validator: snapshot.validator,
        dirty: false,
        local_updated_at: Utc::now(),
    };
    state.store.upsert_issue(&issue).await?;

    let comments = state.remote.list_comments(repo, number).await?;
    let remote_comments: Vec<RemoteComment> = comments
        .into_iter()
        .map(|c| RemoteComment {
            id: c.id,
            author: c.author,
            body: c.body,
            created_at: c.created_at,
            updated_at: c.updated_at,
        })
        .collect();
    state
        .store
        .upsert_comments_of_issue(repo, number, &remote_comments)
        .await
}

fn write_conflict_backup(config: &GitmdfsConfig, number: u64, markdown: &str) -> Result<(), GitmdfsError> {
    let dir = config.conflicts_dir();
    std::fs::create_dir_all(&dir)?;
    let stamp = format_backup_timestamp(Utc::now());
    let path = dir.join(format!("issue_{number}_{stamp}.md"));
    std::fs::write(path, markdown)?;
    Ok(())
}

fn format_backup_timestamp(ts: chrono::DateTime<Utc>) -> String {
    ts.format("%Y%m%d_%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::create_pool;
    use crate::config::DEFAULT_CACHE_MMAP_BYTES;
    use crate::remote::fake::{FailMode, InMemoryRemote};
    use std::time::Duration as StdDuration;
    use tempfile::tempdir;

    async fn test_store() -> (Arc<CacheStore>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let pool = create_pool(&dir.path().join("cache.db"), DEFAULT_CACHE_MMAP_BYTES)
            .await
            .unwrap();
        let store = CacheStore::open(pool).await.unwrap();
        (Arc::new(store), dir)
    }

    fn test_config(cache_dir: &std::path::Path) -> GitmdfsConfig {
        let mut cfg = GitmdfsConfig::new("owner/repo", cache_dir);
        cfg.debounce_interval = StdDuration::from_millis(20);
        cfg.poll_interval = StdDuration::from_secs(3600);
        cfg
    }

    fn sample_snapshot(number: u64) -> IssueSnapshot {
        IssueSnapshot {
            number,
            title: "Test Issue".to_string(),
            body: "Original body content".to_string(),
            state: "open".to_string(),
            author: "testuser".to_string(),
            labels: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            validator: "v0".to_string(),
        }
    }

    #[tokio::test]
    async fn start_hydrates_remote_issues_into_cache() {
        let (store, dir) = test_store().await;
        let remote = Arc::new(InMemoryRemote::new());
        remote.seed_issue(sample_snapshot(1));
        let config = test_config(dir.path());

        let engine = SyncEngine::new(store.clone(), remote, config);
        let (handle, result) = engine.start().await;
        result.unwrap();

        let cached = store.get_issue("owner/repo", 1).await.unwrap().unwrap();
        assert_eq!(cached.title, "Test Issue");
        handle.stop().await;
    }

    #[tokio::test]
    async fn flush_now_pushes_dirty_issue() {
        let (store, dir) = test_store().await;
        let remote = Arc::new(InMemoryRemote::new());
        remote.seed_issue(sample_snapshot(1));
        let config = test_config(dir.path());

        let engine = SyncEngine::new(store.clone(), remote.clone(), config);
        let (handle, result) = engine.start().await;
        result.unwrap();

        let changes = crate::cache::IssueFieldChanges {
            body: Some("Locally edited body".to_string()),
            ..Default::default()
        };
        store.mark_dirty("owner/repo", 1, &changes).await.unwrap();

        handle.flush_now().await.unwrap();

        let cached = store.get_issue("owner/repo", 1).await.unwrap().unwrap();
        assert!(!cached.dirty);
        assert_eq!(remote.update_issue_calls().len(), 1);
        handle.stop().await;
    }

    #[tokio::test]
    async fn local_change_triggers_debounced_push() {
        let (store, dir) = test_store().await;
        let remote = Arc::new(InMemoryRemote::new());
        remote.seed_issue(sample_snapshot(1));
        let config = test_config(dir.path());

        let engine = SyncEngine::new(store.clone(), remote.clone(), config);
        let (handle, result) = engine.start().await;
        result.unwrap();

        let changes = crate::cache::IssueFieldChanges {
            body: Some("Debounced edit".to_string()),
            ..Default::default()
        };
        store.mark_dirty("owner/repo", 1, &changes).await.unwrap();
        handle.on_local_change();

        tokio::time::sleep(StdDuration::from_millis(120)).await;

        let cached = store.get_issue("owner/repo", 1).await.unwrap().unwrap();
        assert!(!cached.dirty);
        handle.stop().await;
    }

    #[tokio::test]
    async fn prefer_remote_with_backup_writes_conflict_file_and_adopts_remote() {
        let (store, dir) = test_store().await;
        let remote = Arc::new(InMemoryRemote::new());
        remote.seed_issue(sample_snapshot(1));
        let config = test_config(dir.path());

        let engine = SyncEngine::new(store.clone(), remote.clone(), config.clone());
        let (handle, result) = engine.start().await;
        result.unwrap();

        let changes = crate::cache::IssueFieldChanges {
            body: Some("Local change".to_string()),
            ..Default::default()
        };
        store.mark_dirty("owner/repo", 1, &changes).await.unwrap();
        remote.push_remote_change(1, "Remote change", "v1");

        poll_phase(&engine_state_for_test(store.clone(), remote.clone(), config.clone()))
            .await
            .unwrap();

        let cached = store.get_issue("owner/repo", 1).await.unwrap().unwrap();
        assert_eq!(cached.body, "Remote change");
        assert!(!cached.dirty);

        let backups: Vec<_> = std::fs::read_dir(config.conflicts_dir()).unwrap().collect();
        assert_eq!(backups.len(), 1);
        handle.stop().await;
    }

    #[tokio::test]
    async fn transport_failure_during_push_is_left_for_next_pass() {
        let (store, dir) = test_store().await;
        let remote = Arc::new(InMemoryRemote::new());
        remote.seed_issue(sample_snapshot(1));
        let config = test_config(dir.path());

        let engine = SyncEngine::new(store.clone(), remote.clone(), config);
        let (handle, result) = engine.start().await;
        result.unwrap();

        let changes = crate::cache::IssueFieldChanges {
            body: Some("Will not push yet".to_string()),
            ..Default::default()
        };
        store.mark_dirty("owner/repo", 1, &changes).await.unwrap();
        remote.set_fail_mode(FailMode::Transport, std::time::SystemTime::now());

        handle.flush_now().await.unwrap();

        let cached = store.get_issue("owner/repo", 1).await.unwrap().unwrap();
        assert!(cached.dirty, "dirty flag must survive a transport failure");
        handle.stop().await;
    }

    fn engine_state_for_test(
        store: Arc<CacheStore>,
        remote: Arc<InMemoryRemote>,
        config: GitmdfsConfig,
    ) -> Arc<EngineState> {
        Arc::new(EngineState {
            store,
            remote,
            config,
            push_mutex: AsyncMutex::new(()),
            stop: Notify::new(),
        })
    }
}
