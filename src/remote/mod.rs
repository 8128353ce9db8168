//! The abstract remote capability the sync engine consumes.
//!
//! Listed by operation, exactly as the component design specifies: a real
//! HTTP-backed implementation lives in [`http`], and an in-process fake
//! used by the engine's own tests lives in [`fake`]. Neither is a
//! first-class concern of this crate — only the trait is.

pub mod fake;
pub mod http;

use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::error::GitmdfsError;

/// A remote issue as returned by `ListIssues`/`GetIssueIfChanged`/`CreateIssue`.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueSnapshot {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub state: String,
    pub author: String,
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub validator: String,
}

/// A remote comment as returned by `ListComments`/`CreateComment`.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentSnapshot {
    pub id: i64,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The field-patch the push phase sends to `UpdateIssue`/`CreateIssue`:
/// only the fields the caller decided to change are `Some`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IssuePatch {
    pub title: Option<String>,
    pub body: Option<String>,
    pub state: Option<String>,
    pub labels: Option<Vec<String>>,
}

/// Result of a conditional fetch keyed by the stored validator.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Unchanged,
    Updated(IssueSnapshot),
}

/// The operations the sync engine performs against the remote service.
/// Every call either succeeds, returns `GitmdfsError::RemoteTransport`, or
/// returns `GitmdfsError::RemoteRateLimit` carrying a reset deadline — the
/// engine is responsible for sleeping past rate limits and retrying, never
/// the capability itself.
#[async_trait]
pub trait RemoteCapability: Send + Sync {
    async fn list_issues(&self, repo: &str) -> Result<Vec<IssueSnapshot>, GitmdfsError>;

    async fn list_comments(
        &self,
        repo: &str,
        number: u64,
    ) -> Result<Vec<CommentSnapshot>, GitmdfsError>;

    async fn get_issue_if_changed(
        &self,
        repo: &str,
        number: u64,
        validator: &str,
    ) -> Result<FetchOutcome, GitmdfsError>;

    async fn update_issue(
        &self,
        repo: &str,
        number: u64,
        patch: &IssuePatch,
    ) -> Result<(), GitmdfsError>;

    async fn update_comment(&self, repo: &str, id: i64, body: &str) -> Result<(), GitmdfsError>;

    async fn create_comment(
        &self,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<CommentSnapshot, GitmdfsError>;

    async fn create_issue(
        &self,
        repo: &str,
        patch: &IssuePatch,
    ) -> Result<IssueSnapshot, GitmdfsError>;
}

/// Call `op`, sleeping past the reset deadline and retrying once per
/// rate-limit signal, the way the engine is required to for every
/// `RemoteCapability` call. `cancel` is raced against the sleep so a
/// `Stop` notified mid-wait cuts it short instead of queuing behind it.
pub async fn retrying_rate_limit<T, F, Fut>(cancel: &Notify, mut op: F) -> Result<T, GitmdfsError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, GitmdfsError>>,
{
    loop {
        match op().await {
            Err(GitmdfsError::RemoteRateLimit { reset_deadline }) => {
                let now = SystemTime::now();
                if let Ok(remaining) = reset_deadline.duration_since(now) {
                    tokio::select! {
                        _ = tokio::time::sleep(remaining) => {}
                        _ = cancel.notified() => {
                            return Err(GitmdfsError::RemoteRateLimit { reset_deadline });
                        }
                    }
                }
            }
            other => return other,
        }
    }
}
