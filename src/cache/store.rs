//! The cache store's operations, as enumerated in the component design:
//! one async method per semantic operation, a single writer-side mutex
//! serializing mutations, and sqlx transactions for the multi-statement
//! ones so a crash or cancel leaves the prior committed set intact.

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::cache::{
    encode_labels, Comment, Issue, IssueFieldChanges, IssueRow, PendingComment, PendingIssue,
};
use crate::cache::pool::DbPool;
use crate::error::GitmdfsError;

/// A remote-origin comment about to be written into the cache, either
/// during hydration/poll replacement or after a pending comment's push
/// succeeds.
#[derive(Debug, Clone)]
pub struct RemoteComment {
    pub id: i64,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The durable cache: every operation either commits fully or leaves the
/// prior state untouched.
pub struct CacheStore {
    pool: DbPool,
    write_lock: Mutex<()>,
}

impl CacheStore {
    /// Wrap an already-open pool and ensure the schema exists.
    pub async fn open(pool: DbPool) -> Result<Self, GitmdfsError> {
        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), GitmdfsError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS issues (
                repository TEXT NOT NULL,
                number INTEGER NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                state TEXT NOT NULL,
                author TEXT NOT NULL,
                labels TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                validator TEXT NOT NULL DEFAULT '',
                dirty INTEGER NOT NULL DEFAULT 0,
                local_updated_at TEXT NOT NULL,
                PRIMARY KEY (repository, number)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS comments (
                id INTEGER NOT NULL,
                repository TEXT NOT NULL,
                issue_number INTEGER NOT NULL,
                author TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                dirty INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (repository, id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS pending_comments (
                local_seq INTEGER PRIMARY KEY AUTOINCREMENT,
                repository TEXT NOT NULL,
                issue_number INTEGER NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS pending_issues (
                local_seq INTEGER PRIMARY KEY AUTOINCREMENT,
                repository TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                labels TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---- Issues -------------------------------------------------------

    pub async fn upsert_issue(&self, issue: &Issue) -> Result<(), GitmdfsError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO issues
                (repository, number, title, body, state, author, labels, created_at, updated_at, validator, dirty, local_updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(repository, number) DO UPDATE SET
                title = excluded.title,
                body = excluded.body,
                state = excluded.state,
                author = excluded.author,
                labels = excluded.labels,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                validator = excluded.validator,
                dirty = excluded.dirty,
                local_updated_at = excluded.local_updated_at",
        )
        .bind(&issue.repository)
        .bind(issue.number as i64)
        .bind(&issue.title)
        .bind(&issue.body)
        .bind(issue.state.as_str())
        .bind(&issue.author)
        .bind(encode_labels(&issue.labels))
        .bind(issue.created_at.to_rfc3339())
        .bind(issue.updated_at.to_rfc3339())
        .bind(&issue.validator)
        .bind(issue.dirty)
        .bind(issue.local_updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_issue(&self, repository: &str, number: u64) -> Result<Option<Issue>, GitmdfsError> {
        let row: Option<IssueRow> = sqlx::query_as(
            "SELECT repository, number, title, body, state, author, labels, created_at, updated_at, validator, dirty, local_updated_at
             FROM issues WHERE repository = ? AND number = ?",
        )
        .bind(repository)
        .bind(number as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.map(IssueRow::into_issue).transpose()
    }

    pub async fn list_issues(&self, repository: &str) -> Result<Vec<Issue>, GitmdfsError> {
        let rows: Vec<IssueRow> = sqlx::query_as(
            "SELECT repository, number, title, body, state, author, labels, created_at, updated_at, validator, dirty, local_updated_at
             FROM issues WHERE repository = ? ORDER BY number ASC",
        )
        .bind(repository)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(IssueRow::into_issue).collect()
    }

    pub async fn mark_dirty(
        &self,
        repository: &str,
        number: u64,
        changes: &IssueFieldChanges,
    ) -> Result<(), GitmdfsError> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();

        let mut sets = vec!["dirty = 1".to_string(), "local_updated_at = ?".to_string()];
        if changes.title.is_some() {
            sets.push("title = ?".to_string());
        }
        if changes.body.is_some() {
            sets.push("body = ?".to_string());
        }
        if changes.state.is_some() {
            sets.push("state = ?".to_string());
        }
        if changes.labels.is_some() {
            sets.push("labels = ?".to_string());
        }

        let sql = format!(
            "UPDATE issues SET {} WHERE repository = ? AND number = ?",
            sets.join(", ")
        );
        let mut query = sqlx::query(&sql).bind(now);
        if let Some(title) = &changes.title {
            query = query.bind(title);
        }
        if let Some(body) = &changes.body {
            query = query.bind(body);
        }
        if let Some(state) = &changes.state {
            query = query.bind(state.as_str());
        }
        if let Some(labels) = &changes.labels {
            query = query.bind(encode_labels(labels));
        }
        let result = query
            .bind(repository)
            .bind(number as i64)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(GitmdfsError::not_found(format!(
                "issue {number} in {repository}"
            )));
        }
        Ok(())
    }

    pub async fn list_dirty_issues(&self, repository: &str) -> Result<Vec<Issue>, GitmdfsError> {
        let rows: Vec<IssueRow> = sqlx::query_as(
            "SELECT repository, number, title, body, state, author, labels, created_at, updated_at, validator, dirty, local_updated_at
             FROM issues WHERE repository = ? AND dirty = 1 ORDER BY number ASC",
        )
        .bind(repository)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(IssueRow::into_issue).collect()
    }

    pub async fn clear_dirty(&self, repository: &str, number: u64) -> Result<(), GitmdfsError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("UPDATE issues SET dirty = 0 WHERE repository = ? AND number = ?")
            .bind(repository)
            .bind(number as i64)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(GitmdfsError::not_found(format!(
                "issue {number} in {repository}"
            )));
        }
        Ok(())
    }

    // ---- Comments -------------------------------------------------------

    /// Replace the full comment set for an issue atomically. Used by the
    /// engine on hydration and poll; never touches `dirty`.
    pub async fn upsert_comments_of_issue(
        &self,
        repository: &str,
        issue_number: u64,
        comments: &[RemoteComment],
    ) -> Result<(), GitmdfsError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM comments WHERE repository = ? AND issue_number = ?")
            .bind(repository)
            .bind(issue_number as i64)
            .execute(&mut *tx)
            .await?;

        for comment in comments {
            sqlx::query(
                "INSERT INTO comments (id, repository, issue_number, author, body, created_at, updated_at, dirty)
                 VALUES (?, ?, ?, ?, ?, ?, ?, 0)",
            )
            .bind(comment.id)
            .bind(repository)
            .bind(issue_number as i64)
            .bind(&comment.author)
            .bind(&comment.body)
            .bind(comment.created_at.to_rfc3339())
            .bind(comment.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Insert a single comment into an issue's comment set, used when a
    /// pending comment's `CreateComment` call succeeds (as opposed to
    /// `upsert_comments_of_issue`'s full-set replacement used by
    /// hydration and poll).
    pub async fn insert_comment(
        &self,
        repository: &str,
        issue_number: u64,
        comment: &RemoteComment,
    ) -> Result<(), GitmdfsError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO comments (id, repository, issue_number, author, body, created_at, updated_at, dirty)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0)
             ON CONFLICT(repository, id) DO UPDATE SET
                body = excluded.body, updated_at = excluded.updated_at",
        )
        .bind(comment.id)
        .bind(repository)
        .bind(issue_number as i64)
        .bind(&comment.author)
        .bind(&comment.body)
        .bind(comment.created_at.to_rfc3339())
        .bind(comment.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_comments(
        &self,
        repository: &str,
        issue_number: u64,
    ) -> Result<Vec<Comment>, GitmdfsError> {
        let comments: Vec<Comment> = sqlx::query_as(
            "SELECT id, repository, issue_number, author, body, created_at, updated_at, dirty
             FROM comments WHERE repository = ? AND issue_number = ? ORDER BY created_at ASC",
        )
        .bind(repository)
        .bind(issue_number as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(comments)
    }

    pub async fn mark_comment_dirty(
        &self,
        repository: &str,
        id: i64,
        new_body: &str,
    ) -> Result<(), GitmdfsError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE comments SET body = ?, dirty = 1, updated_at = ? WHERE repository = ? AND id = ?",
        )
        .bind(new_body)
        .bind(Utc::now().to_rfc3339())
        .bind(repository)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(GitmdfsError::not_found(format!("comment {id}")));
        }
        Ok(())
    }

    pub async fn list_dirty_comments(&self, repository: &str) -> Result<Vec<Comment>, GitmdfsError> {
        let comments: Vec<Comment> = sqlx::query_as(
            "SELECT id, repository, issue_number, author, body, created_at, updated_at, dirty
             FROM comments WHERE repository = ? AND dirty = 1 ORDER BY issue_number ASC, created_at ASC",
        )
        .bind(repository)
        .fetch_all(&self.pool)
        .await?;
        Ok(comments)
    }

    pub async fn clear_comment_dirty(&self, repository: &str, id: i64) -> Result<(), GitmdfsError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("UPDATE comments SET dirty = 0 WHERE repository = ? AND id = ?")
            .bind(repository)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(GitmdfsError::not_found(format!("comment {id}")));
        }
        Ok(())
    }

    // ---- Pending rows ---------------------------------------------------

    pub async fn add_pending_comment(
        &self,
        repository: &str,
        issue_number: u64,
        body: &str,
    ) -> Result<i64, GitmdfsError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "INSERT INTO pending_comments (repository, issue_number, body, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(repository)
        .bind(issue_number as i64)
        .bind(body)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list_pending_comments(
        &self,
        repository: &str,
    ) -> Result<Vec<PendingComment>, GitmdfsError> {
        let rows: Vec<PendingComment> = sqlx::query_as(
            "SELECT local_seq, repository, issue_number, body, created_at
             FROM pending_comments WHERE repository = ? ORDER BY local_seq ASC",
        )
        .bind(repository)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn remove_pending_comment(&self, local_seq: i64) -> Result<(), GitmdfsError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM pending_comments WHERE local_seq = ?")
            .bind(local_seq)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_pending_issue(
        &self,
        repository: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<i64, GitmdfsError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "INSERT INTO pending_issues (repository, title, body, labels, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(repository)
        .bind(title)
        .bind(body)
        .bind(encode_labels(labels))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list_pending_issues(&self, repository: &str) -> Result<Vec<PendingIssue>, GitmdfsError> {
        #[derive(sqlx::FromRow)]
        struct Row {
            local_seq: i64,
            repository: String,
            title: String,
            body: String,
            labels: String,
            created_at: String,
        }
        let rows: Vec<Row> = sqlx::query_as(
            "SELECT local_seq, repository, title, body, labels, created_at
             FROM pending_issues WHERE repository = ? ORDER BY local_seq ASC",
        )
        .bind(repository)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| PendingIssue {
                local_seq: r.local_seq,
                repository: r.repository,
                title: r.title,
                body: r.body,
                labels: crate::cache::decode_labels(&r.labels),
                created_at: DateTime::parse_from_rfc3339(&r.created_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
            .collect())
    }

    pub async fn remove_pending_issue(&self, local_seq: i64) -> Result<(), GitmdfsError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM pending_issues WHERE local_seq = ?")
            .bind(local_seq)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{create_pool, IssueState};
    use crate::config::DEFAULT_CACHE_MMAP_BYTES;
    use tempfile::tempdir;

    async fn store() -> CacheStore {
        let dir = tempdir().unwrap();
        let pool = create_pool(&dir.path().join("cache.db"), DEFAULT_CACHE_MMAP_BYTES)
            .await
            .unwrap();
        // leak the tempdir so the file survives for the test's duration
        std::mem::forget(dir);
        CacheStore::open(pool).await.unwrap()
    }

    fn sample_issue(number: u64) -> Issue {
        Issue {
            repository: "owner/repo".to_string(),
            number,
            title: "Test Issue".to_string(),
            body: "Original body content".to_string(),
            state: IssueState::Open,
            author: "testuser".to_string(),
            labels: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            validator: "v1".to_string(),
            dirty: false,
            local_updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = store().await;
        store.upsert_issue(&sample_issue(1)).await.unwrap();
        let got = store.get_issue("owner/repo", 1).await.unwrap().unwrap();
        assert_eq!(got.title, "Test Issue");
        assert!(!got.dirty);
    }

    #[tokio::test]
    async fn list_issues_is_ordered_ascending() {
        let store = store().await;
        store.upsert_issue(&sample_issue(3)).await.unwrap();
        store.upsert_issue(&sample_issue(1)).await.unwrap();
        store.upsert_issue(&sample_issue(2)).await.unwrap();
        let nums: Vec<u64> = store
            .list_issues("owner/repo")
            .await
            .unwrap()
            .iter()
            .map(|i| i.number)
            .collect();
        assert_eq!(nums, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn mark_dirty_sets_flag_and_fails_on_missing_row() {
        let store = store().await;
        store.upsert_issue(&sample_issue(1)).await.unwrap();
        let changes = IssueFieldChanges {
            body: Some("Modified body content".to_string()),
            ..Default::default()
        };
        store.mark_dirty("owner/repo", 1, &changes).await.unwrap();
        let got = store.get_issue("owner/repo", 1).await.unwrap().unwrap();
        assert!(got.dirty);
        assert_eq!(got.body, "Modified body content");

        let err = store.mark_dirty("owner/repo", 99, &changes).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn clear_dirty_resets_flag() {
        let store = store().await;
        store.upsert_issue(&sample_issue(1)).await.unwrap();
        let changes = IssueFieldChanges {
            title: Some("New title".to_string()),
            ..Default::default()
        };
        store.mark_dirty("owner/repo", 1, &changes).await.unwrap();
        store.clear_dirty("owner/repo", 1).await.unwrap();
        let got = store.get_issue("owner/repo", 1).await.unwrap().unwrap();
        assert!(!got.dirty);
    }

    #[tokio::test]
    async fn upsert_comments_of_issue_replaces_full_set() {
        let store = store().await;
        store.upsert_issue(&sample_issue(1)).await.unwrap();
        let initial = vec![RemoteComment {
            id: 1,
            author: "a".to_string(),
            body: "first".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }];
        store
            .upsert_comments_of_issue("owner/repo", 1, &initial)
            .await
            .unwrap();
        assert_eq!(store.list_comments("owner/repo", 1).await.unwrap().len(), 1);

        let replacement = vec![RemoteComment {
            id: 2,
            author: "b".to_string(),
            body: "second".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }];
        store
            .upsert_comments_of_issue("owner/repo", 1, &replacement)
            .await
            .unwrap();
        let comments = store.list_comments("owner/repo", 1).await.unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].id, 2);
    }

    #[tokio::test]
    async fn pending_issue_lifecycle() {
        let store = store().await;
        let seq = store
            .add_pending_issue("owner/repo", "Draft Bug", "Repro steps", &[])
            .await
            .unwrap();
        let pending = store.list_pending_issues("owner/repo").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].title, "Draft Bug");

        store.remove_pending_issue(seq).await.unwrap();
        assert!(store.list_pending_issues("owner/repo").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_comment_lifecycle() {
        let store = store().await;
        store.upsert_issue(&sample_issue(1)).await.unwrap();
        let seq = store
            .add_pending_comment("owner/repo", 1, "a new comment")
            .await
            .unwrap();
        assert_eq!(store.list_pending_comments("owner/repo").await.unwrap().len(), 1);
        store.remove_pending_comment(seq).await.unwrap();
        assert!(store
            .list_pending_comments("owner/repo")
            .await
            .unwrap()
            .is_empty());
    }
}
