//! SQLite connection pool with WAL mode.
//!
//! Adapted from the teacher's connection-pool helper: same WAL/synchronous/
//! foreign-key/busy-timeout pragmas and the same verification-query-in-
//! constructor pattern, but the mmap window is sized per mount rather than
//! fixed, since how much of the cache file is worth memory-mapping depends
//! on how many issues a given repository's mount is caching (see
//! `GitmdfsConfig::cache_mmap_bytes`) — the teacher has no such per-mount
//! sizing knob because it never re-renders the same record this often.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};

/// Type alias for the cache store's connection pool.
pub type DbPool = Pool<Sqlite>;

/// Open (creating if needed) a WAL-mode SQLite pool at `db_path`.
///
/// `mmap_bytes` sets the `mmap_size` pragma: issue markdown is rebuilt from
/// the cache on every `Lookup`/`Getattr`/`Open` of a resident file, so
/// mapping the pages that hold the hot issue/comment rows avoids a regular
/// read syscall for each of those re-renders. Pass
/// [`crate::config::DEFAULT_CACHE_MMAP_BYTES`] absent a reason to size it
/// differently for a particular mount.
pub async fn create_pool(db_path: &Path, mmap_bytes: u64) -> Result<DbPool, sqlx::Error> {
    let db_url = format!("sqlite:{}", db_path.display());

    let connect_options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(30))
        .pragma("wal_autocheckpoint", "1000")
        .pragma("mmap_size", mmap_bytes.to_string());

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(connect_options)
        .await?;

    let mode: (String,) = sqlx::query_as("PRAGMA journal_mode")
        .fetch_one(&pool)
        .await?;
    debug_assert!(
        mode.0.eq_ignore_ascii_case("wal"),
        "WAL mode should be enabled, got: {}",
        mode.0
    );

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CACHE_MMAP_BYTES;
    use tempfile::tempdir;

    #[tokio::test]
    async fn enables_wal_and_foreign_keys() {
        let dir = tempdir().unwrap();
        let pool = create_pool(&dir.path().join("cache.db"), DEFAULT_CACHE_MMAP_BYTES)
            .await
            .unwrap();

        let mode: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode.0.to_lowercase(), "wal");

        let fk: (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(fk.0, 1);
    }

    #[tokio::test]
    async fn mmap_size_pragma_is_applied() {
        let dir = tempdir().unwrap();
        let pool = create_pool(&dir.path().join("cache.db"), 8 * 1024 * 1024)
            .await
            .unwrap();

        let mmap: (i64,) = sqlx::query_as("PRAGMA mmap_size")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mmap.0, 8 * 1024 * 1024);
    }

    #[tokio::test]
    async fn reopening_same_path_preserves_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.db");

        {
            let pool = create_pool(&path, DEFAULT_CACHE_MMAP_BYTES).await.unwrap();
            sqlx::query("CREATE TABLE t (x INTEGER)")
                .execute(&pool)
                .await
                .unwrap();
            sqlx::query("INSERT INTO t VALUES (42)")
                .execute(&pool)
                .await
                .unwrap();
        }

        let pool = create_pool(&path, DEFAULT_CACHE_MMAP_BYTES).await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT x FROM t")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0, 42);
    }
}
