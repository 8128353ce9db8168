//! Engine and mount configuration.
//!
//! Mirrors the shape of the teacher's `SyncConfig`: a plain, `serde`-able
//! value type with a `Default` impl, handed to the engine by whatever
//! constructs it. Parsing flags or environment variables is the launcher's
//! job, not this crate's.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the sync engine resolves a dirty local record against a newer
/// remote snapshot discovered during reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Keep the local record; the remote change is overwritten on the next
    /// successful push.
    PreferLocal,
    /// Back up the dirty local record to `.conflicts/<repo>/` and adopt the
    /// remote snapshot.
    PreferRemoteWithBackup,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self::PreferRemoteWithBackup
    }
}

/// Default debounce window: quiet time required after the most recent
/// `OnLocalChange` before the pusher pushes.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Default cadence of periodic conditional polling.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);

/// Default size of the cache pool's memory-mapped I/O window. Issue
/// markdown is re-rendered from the cache on every `Lookup`/`Getattr`/
/// `Open` of a file already resident in the kernel's dentry cache, so
/// mapping a generous window keeps those repeated reads off the regular
/// read syscall path; 64 MiB comfortably covers a few thousand cached
/// issues with comments without mapping the whole container file.
pub const DEFAULT_CACHE_MMAP_BYTES: u64 = 64 * 1024 * 1024;

/// Configuration accepted by [`crate::sync::SyncEngine::start`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitmdfsConfig {
    /// Repository this mount serves, `owner/name`.
    pub repository: String,

    /// Quiet time after the last local change before a push is attempted.
    #[serde(with = "duration_millis")]
    pub debounce_interval: Duration,

    /// Cadence of periodic conditional polling.
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,

    /// How reconcile resolves a dirty-local/changed-remote collision.
    pub conflict_policy: ConflictPolicy,

    /// Directory holding the cache container file and `.conflicts/`.
    pub cache_dir: PathBuf,

    /// Size, in bytes, of the cache pool's `mmap_size` pragma.
    pub cache_mmap_bytes: u64,
}

impl GitmdfsConfig {
    pub fn new(repository: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            repository: repository.into(),
            debounce_interval: DEFAULT_DEBOUNCE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            conflict_policy: ConflictPolicy::default(),
            cache_dir: cache_dir.into(),
            cache_mmap_bytes: DEFAULT_CACHE_MMAP_BYTES,
        }
    }

    /// Path to the SQLite container file for this mount's cache.
    pub fn db_path(&self) -> PathBuf {
        self.cache_dir.join("cache.db")
    }

    /// Directory holding conflict backups for this mount's repository.
    pub fn conflicts_dir(&self) -> PathBuf {
        self.cache_dir
            .join(".conflicts")
            .join(sanitize_repo_for_path(&self.repository))
    }
}

fn sanitize_repo_for_path(repository: &str) -> String {
    repository.replace('/', "__")
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_conflict_policy_is_prefer_remote_with_backup() {
        let cfg = GitmdfsConfig::new("owner/repo", "/tmp/gitmdfs");
        assert_eq!(cfg.conflict_policy, ConflictPolicy::PreferRemoteWithBackup);
        assert_eq!(cfg.debounce_interval, DEFAULT_DEBOUNCE);
    }

    #[test]
    fn conflicts_dir_is_scoped_by_sanitized_repo() {
        let cfg = GitmdfsConfig::new("owner/repo", "/tmp/gitmdfs");
        assert_eq!(
            cfg.conflicts_dir(),
            PathBuf::from("/tmp/gitmdfs/.conflicts/owner__repo")
        );
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = GitmdfsConfig::new("owner/repo", "/tmp/gitmdfs");
        let json = serde_json::to_string(&cfg).unwrap();
        let back: GitmdfsConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.repository, cfg.repository);
        assert_eq!(back.debounce_interval, cfg.debounce_interval);
    }
}
