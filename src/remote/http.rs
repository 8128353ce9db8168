//! A concrete HTTP-backed [`RemoteCapability`].
//!
//! Scope note: only the abstract capability above is specified; this is a
//! thin, illustrative transport built the way the teacher's `GitLabClient`
//! is (a `reqwest::Client`, a base URL, a bearer token, one small method
//! per endpoint) against a generic REST issue-tracker shape. Credential
//! discovery and the exact wire format of a specific tracker's API are
//! external collaborators this crate does not own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::{Duration, SystemTime};

use super::{CommentSnapshot, FetchOutcome, IssuePatch, IssueSnapshot, RemoteCapability};
use crate::error::GitmdfsError;

/// Configuration for the HTTP-backed remote capability.
#[derive(Debug, Clone)]
pub struct HttpRemoteConfig {
    pub base_url: String,
    pub token: String,
}

/// A `reqwest`-backed `RemoteCapability` talking to a generic issue-tracker
/// REST API (`GET/PATCH /repos/{repo}/issues`, `POST .../comments`, etc).
pub struct HttpRemote {
    client: Client,
    config: HttpRemoteConfig,
}

impl HttpRemote {
    pub fn new(config: HttpRemoteConfig) -> Result<Self, GitmdfsError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(GitmdfsError::from)?;
        Ok(Self { client, config })
    }

    fn issue_url(&self, repo: &str, number: u64) -> String {
        format!("{}/repos/{repo}/issues/{number}", self.config.base_url)
    }

    /// Translate a transport-level HTTP response into the engine's
    /// transport-failure / rate-limit signals, per the component design's
    /// "each call either succeeds, reports a transport failure, or reports
    /// a rate-limit signal" contract.
    fn classify_status(&self, status: StatusCode) -> Option<GitmdfsError> {
        if status == StatusCode::TOO_MANY_REQUESTS {
            let reset_deadline = SystemTime::now() + Duration::from_secs(60);
            return Some(GitmdfsError::RemoteRateLimit { reset_deadline });
        }
        if status.is_server_error() {
            return Some(GitmdfsError::remote_transport(format!(
                "server error: {status}"
            )));
        }
        if status.is_client_error() && status != StatusCode::NOT_FOUND {
            return Some(GitmdfsError::remote_transport(format!(
                "client error: {status}"
            )));
        }
        None
    }

    fn bearer(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.bearer_auth(&self.config.token)
    }
}

#[derive(Deserialize)]
struct WireIssue {
    number: u64,
    title: String,
    body: String,
    state: String,
    author: String,
    labels: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    etag: String,
}

impl From<WireIssue> for IssueSnapshot {
    fn from(w: WireIssue) -> Self {
        Self {
            number: w.number,
            title: w.title,
            body: w.body,
            state: w.state,
            author: w.author,
            labels: w.labels,
            created_at: w.created_at,
            updated_at: w.updated_at,
            validator: w.etag,
        }
    }
}

#[derive(Deserialize)]
struct WireComment {
    id: i64,
    author: String,
    body: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<WireComment> for CommentSnapshot {
    fn from(w: WireComment) -> Self {
        Self {
            id: w.id,
            author: w.author,
            body: w.body,
            created_at: w.created_at,
            updated_at: w.updated_at,
        }
    }
}

#[async_trait]
impl RemoteCapability for HttpRemote {
    async fn list_issues(&self, repo: &str) -> Result<Vec<IssueSnapshot>, GitmdfsError> {
        let url = format!("{}/repos/{repo}/issues", self.config.base_url);
        let resp = self.bearer(self.client.get(&url)).send().await?;
        if let Some(err) = self.classify_status(resp.status()) {
            return Err(err);
        }
        let wire: Vec<WireIssue> = resp.json().await?;
        Ok(wire.into_iter().map(Into::into).collect())
    }

    async fn list_comments(
        &self,
        repo: &str,
        number: u64,
    ) -> Result<Vec<CommentSnapshot>, GitmdfsError> {
        let url = format!("{}/comments", self.issue_url(repo, number));
        let resp = self.bearer(self.client.get(&url)).send().await?;
        if let Some(err) = self.classify_status(resp.status()) {
            return Err(err);
        }
        let wire: Vec<WireComment> = resp.json().await?;
        Ok(wire.into_iter().map(Into::into).collect())
    }

    async fn get_issue_if_changed(
        &self,
        repo: &str,
        number: u64,
        validator: &str,
    ) -> Result<FetchOutcome, GitmdfsError> {
        let resp = self
            .bearer(self.client.get(self.issue_url(repo, number)))
            .header("If-None-Match", validator)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::Unchanged);
        }
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(GitmdfsError::not_found(format!("issue {number}")));
        }
        if let Some(err) = self.classify_status(resp.status()) {
            return Err(err);
        }
        let wire: WireIssue = resp.json().await?;
        Ok(FetchOutcome::Updated(wire.into()))
    }

    async fn update_issue(
        &self,
        repo: &str,
        number: u64,
        patch: &IssuePatch,
    ) -> Result<(), GitmdfsError> {
        let resp = self
            .bearer(self.client.patch(self.issue_url(repo, number)))
            .json(&patch_body(patch))
            .send()
            .await?;
        if let Some(err) = self.classify_status(resp.status()) {
            return Err(err);
        }
        Ok(())
    }

    async fn update_comment(&self, repo: &str, id: i64, body: &str) -> Result<(), GitmdfsError> {
        let url = format!("{}/comments/{id}", repo_base(&self.config.base_url, repo));
        let resp = self
            .bearer(self.client.patch(url))
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await?;
        if let Some(err) = self.classify_status(resp.status()) {
            return Err(err);
        }
        Ok(())
    }

    async fn create_comment(
        &self,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<CommentSnapshot, GitmdfsError> {
        let url = format!("{}/comments", self.issue_url(repo, number));
        let resp = self
            .bearer(self.client.post(&url))
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await?;
        if let Some(err) = self.classify_status(resp.status()) {
            return Err(err);
        }
        let wire: WireComment = resp.json().await?;
        Ok(wire.into())
    }

    async fn create_issue(
        &self,
        repo: &str,
        patch: &IssuePatch,
    ) -> Result<IssueSnapshot, GitmdfsError> {
        let url = format!("{}/repos/{repo}/issues", self.config.base_url);
        let resp = self
            .bearer(self.client.post(&url))
            .json(&patch_body(patch))
            .send()
            .await?;
        if let Some(err) = self.classify_status(resp.status()) {
            return Err(err);
        }
        let wire: WireIssue = resp.json().await?;
        Ok(wire.into())
    }
}

fn repo_base(base_url: &str, repo: &str) -> String {
    format!("{base_url}/repos/{repo}")
}

fn patch_body(patch: &IssuePatch) -> serde_json::Value {
    serde_json::json!({
        "title": patch.title,
        "body": patch.body,
        "state": patch.state,
        "labels": patch.labels,
    })
}
