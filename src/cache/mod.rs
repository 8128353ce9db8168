//! Durable local cache of issues and comments.
//!
//! The single source of truth every other component acts on: a
//! transactional, single-writer key-value abstraction over typed rows,
//! backed by SQLite in WAL mode the way the teacher's database layer is.

pub mod pool;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub use pool::{create_pool, DbPool};
pub use store::CacheStore;

/// `open` or `closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

impl IssueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl From<&str> for IssueState {
    fn from(s: &str) -> Self {
        if s.eq_ignore_ascii_case("closed") {
            Self::Closed
        } else {
            Self::Open
        }
    }
}

/// A cached issue row, scoped to one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub repository: String,
    pub number: u64,
    pub title: String,
    pub body: String,
    pub state: IssueState,
    pub author: String,
    /// Kept sorted lexicographically so the encoder's output (and therefore
    /// `Getattr`'s reported size) is stable across calls.
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub validator: String,
    pub dirty: bool,
    pub local_updated_at: DateTime<Utc>,
}

/// Row shape as it comes back from SQLite before label/timestamp decoding.
#[derive(FromRow)]
struct IssueRow {
    repository: String,
    number: i64,
    title: String,
    body: String,
    state: String,
    author: String,
    labels: String,
    created_at: String,
    updated_at: String,
    validator: String,
    dirty: bool,
    local_updated_at: String,
}

impl IssueRow {
    fn into_issue(self) -> Result<Issue, crate::error::GitmdfsError> {
        Ok(Issue {
            repository: self.repository,
            number: self.number as u64,
            title: self.title,
            body: self.body,
            state: IssueState::from(self.state.as_str()),
            author: self.author,
            labels: decode_labels(&self.labels),
            created_at: parse_rfc3339(&self.created_at),
            updated_at: parse_rfc3339(&self.updated_at),
            validator: self.validator,
            dirty: self.dirty,
            local_updated_at: parse_rfc3339(&self.local_updated_at),
        })
    }
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn encode_labels(labels: &[String]) -> String {
    let mut sorted = labels.to_vec();
    sorted.sort();
    serde_json::to_string(&sorted).unwrap_or_else(|_| "[]".to_string())
}

fn decode_labels(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// A cached comment row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Comment {
    pub id: i64,
    pub repository: String,
    pub issue_number: i64,
    pub author: String,
    pub body: String,
    #[sqlx(rename = "created_at")]
    #[serde(skip)]
    raw_created_at: String,
    #[sqlx(rename = "updated_at")]
    #[serde(skip)]
    raw_updated_at: String,
    pub dirty: bool,
}

impl Comment {
    pub fn created_at(&self) -> DateTime<Utc> {
        parse_rfc3339(&self.raw_created_at)
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        parse_rfc3339(&self.raw_updated_at)
    }
}

/// A comment authored locally before the remote has assigned it an id.
#[derive(Debug, Clone, FromRow)]
pub struct PendingComment {
    pub local_seq: i64,
    pub repository: String,
    pub issue_number: i64,
    pub body: String,
    #[sqlx(rename = "created_at")]
    raw_created_at: String,
}

impl PendingComment {
    pub fn created_at(&self) -> DateTime<Utc> {
        parse_rfc3339(&self.raw_created_at)
    }
}

/// A new issue authored locally whose number the remote has not assigned.
#[derive(Debug, Clone)]
pub struct PendingIssue {
    pub local_seq: i64,
    pub repository: String,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Which issue fields `MarkDirty` is allowed to touch.
#[derive(Debug, Clone, Default)]
pub struct IssueFieldChanges {
    pub title: Option<String>,
    pub body: Option<String>,
    pub state: Option<IssueState>,
    pub labels: Option<Vec<String>>,
}

impl IssueFieldChanges {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.body.is_none() && self.state.is_none() && self.labels.is_none()
    }
}
