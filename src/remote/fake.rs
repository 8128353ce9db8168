//! An in-process [`RemoteCapability`] fake, standing in for a real HTTP
//! client in engine tests the same way the teacher's tests seed SQLite
//! directly instead of calling GitLab.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::Utc;

use super::{CommentSnapshot, FetchOutcome, IssuePatch, IssueSnapshot, RemoteCapability};
use crate::error::GitmdfsError;

/// What the fake should do on its next call, useful for simulating S4
/// (offline serve) and S5 (rate-limited push racing a poll).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailMode {
    None,
    Transport,
    RateLimit,
}

struct Inner {
    issues: HashMap<u64, IssueSnapshot>,
    comments: HashMap<u64, Vec<CommentSnapshot>>,
    next_number: u64,
    next_comment_id: i64,
    fail_mode: FailMode,
    rate_limit_deadline: SystemTime,
    update_issue_calls: Vec<(u64, IssuePatch)>,
    create_issue_calls: Vec<IssuePatch>,
}

/// An in-memory stand-in for the remote issue tracker.
pub struct InMemoryRemote {
    inner: Mutex<Inner>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                issues: HashMap::new(),
                comments: HashMap::new(),
                next_number: 1,
                next_comment_id: 1,
                fail_mode: FailMode::None,
                rate_limit_deadline: SystemTime::now(),
                update_issue_calls: Vec::new(),
                create_issue_calls: Vec::new(),
            }),
        }
    }

    /// Seed a remote issue; returns the number it was stored under.
    pub fn seed_issue(&self, issue: IssueSnapshot) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let number = issue.number;
        inner.next_number = inner.next_number.max(number + 1);
        inner.issues.insert(number, issue);
        number
    }

    /// Replace a seeded issue's snapshot (simulating a remote-side edit
    /// observed on the next poll), refreshing its validator.
    pub fn push_remote_change(&self, number: u64, body: impl Into<String>, validator: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(issue) = inner.issues.get_mut(&number) {
            issue.body = body.into();
            issue.validator = validator.into();
            issue.updated_at = Utc::now();
        }
    }

    pub fn set_fail_mode(&self, mode: FailMode, deadline: SystemTime) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_mode = mode;
        inner.rate_limit_deadline = deadline;
    }

    pub fn clear_fail_mode(&self) {
        self.set_fail_mode(FailMode::None, SystemTime::now());
    }

    /// Issue numbers and the patch sent for each observed `UpdateIssue`.
    pub fn update_issue_calls(&self) -> Vec<(u64, IssuePatch)> {
        self.inner.lock().unwrap().update_issue_calls.clone()
    }

    pub fn create_issue_calls(&self) -> Vec<IssuePatch> {
        self.inner.lock().unwrap().create_issue_calls.clone()
    }

    fn check_fail(inner: &Inner) -> Result<(), GitmdfsError> {
        match inner.fail_mode {
            FailMode::None => Ok(()),
            FailMode::Transport => Err(GitmdfsError::remote_transport("simulated outage")),
            FailMode::RateLimit => Err(GitmdfsError::RemoteRateLimit {
                reset_deadline: inner.rate_limit_deadline,
            }),
        }
    }
}

#[async_trait]
impl RemoteCapability for InMemoryRemote {
    async fn list_issues(&self, _repo: &str) -> Result<Vec<IssueSnapshot>, GitmdfsError> {
        let inner = self.inner.lock().unwrap();
        Self::check_fail(&inner)?;
        let mut issues: Vec<IssueSnapshot> = inner.issues.values().cloned().collect();
        issues.sort_by_key(|i| i.number);
        Ok(issues)
    }

    async fn list_comments(
        &self,
        _repo: &str,
        number: u64,
    ) -> Result<Vec<CommentSnapshot>, GitmdfsError> {
        let inner = self.inner.lock().unwrap();
        Self::check_fail(&inner)?;
        Ok(inner.comments.get(&number).cloned().unwrap_or_default())
    }

    async fn get_issue_if_changed(
        &self,
        _repo: &str,
        number: u64,
        validator: &str,
    ) -> Result<FetchOutcome, GitmdfsError> {
        let inner = self.inner.lock().unwrap();
        Self::check_fail(&inner)?;
        match inner.issues.get(&number) {
            Some(issue) if issue.validator != validator => Ok(FetchOutcome::Updated(issue.clone())),
            Some(_) => Ok(FetchOutcome::Unchanged),
            None => Err(GitmdfsError::not_found(format!("issue {number}"))),
        }
    }

    async fn update_issue(
        &self,
        _repo: &str,
        number: u64,
        patch: &IssuePatch,
    ) -> Result<(), GitmdfsError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fail(&inner)?;
        inner.update_issue_calls.push((number, patch.clone()));
        if let Some(issue) = inner.issues.get_mut(&number) {
            if let Some(title) = &patch.title {
                issue.title = title.clone();
            }
            if let Some(body) = &patch.body {
                issue.body = body.clone();
            }
            if let Some(state) = &patch.state {
                issue.state = state.clone();
            }
            if let Some(labels) = &patch.labels {
                issue.labels = labels.clone();
            }
            issue.updated_at = Utc::now();
            issue.validator = format!("v{}", issue.updated_at.timestamp_millis());
        }
        Ok(())
    }

    async fn update_comment(&self, _repo: &str, id: i64, body: &str) -> Result<(), GitmdfsError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fail(&inner)?;
        for comments in inner.comments.values_mut() {
            if let Some(c) = comments.iter_mut().find(|c| c.id == id) {
                c.body = body.to_string();
                c.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn create_comment(
        &self,
        _repo: &str,
        number: u64,
        body: &str,
    ) -> Result<CommentSnapshot, GitmdfsError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fail(&inner)?;
        let id = inner.next_comment_id;
        inner.next_comment_id += 1;
        let snapshot = CommentSnapshot {
            id,
            author: "remote-user".to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        inner.comments.entry(number).or_default().push(snapshot.clone());
        Ok(snapshot)
    }

    async fn create_issue(
        &self,
        _repo: &str,
        patch: &IssuePatch,
    ) -> Result<IssueSnapshot, GitmdfsError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fail(&inner)?;
        inner.create_issue_calls.push(patch.clone());
        let number = inner.next_number;
        inner.next_number += 1;
        let snapshot = IssueSnapshot {
            number,
            title: patch.title.clone().unwrap_or_default(),
            body: patch.body.clone().unwrap_or_default(),
            state: patch.state.clone().unwrap_or_else(|| "open".to_string()),
            author: "local-user".to_string(),
            labels: patch.labels.clone().unwrap_or_default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            validator: "v1".to_string(),
        };
        inner.issues.insert(number, snapshot.clone());
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> IssueSnapshot {
        IssueSnapshot {
            number: 1,
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
    async fn list_issues_returns_seeded_snapshot() {
        let remote = InMemoryRemote::new();
        remote.seed_issue(sample());
        let issues = remote.list_issues("owner/repo").await.unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].title, "Test Issue");
    }

    #[tokio::test]
    async fn transport_failure_mode_surfaces_on_every_call() {
        let remote = InMemoryRemote::new();
        remote.seed_issue(sample());
        remote.set_fail_mode(FailMode::Transport, SystemTime::now());
        assert!(remote.list_issues("owner/repo").await.is_err());
        assert!(remote.get_issue_if_changed("owner/repo", 1, "v0").await.is_err());
    }

    #[tokio::test]
    async fn get_issue_if_changed_reports_unchanged_when_validator_matches() {
        let remote = InMemoryRemote::new();
        remote.seed_issue(sample());
        let outcome = remote
            .get_issue_if_changed("owner/repo", 1, "v0")
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::Unchanged);
    }

    #[tokio::test]
    async fn push_remote_change_is_observed_as_updated() {
        let remote = InMemoryRemote::new();
        remote.seed_issue(sample());
        remote.push_remote_change(1, "Remote change", "v1");
        let outcome = remote
            .get_issue_if_changed("owner/repo", 1, "v0")
            .await
            .unwrap();
        match outcome {
            FetchOutcome::Updated(snap) => assert_eq!(snap.body, "Remote change"),
            FetchOutcome::Unchanged => panic!("expected update"),
        }
    }
}
