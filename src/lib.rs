//! gitmdfs - mounts a remote issue tracker's issues as a local directory
//! of markdown files over FUSE.
//!
//! Wires the four components together the way the teacher's `run()`
//! bootstraps its own backend: open the cache, hydrate and start the
//! background sync engine, then hand the filesystem adapter to the kernel.

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod fs;
pub mod remote;
pub mod sync;

use std::path::Path;
use std::sync::Arc;

use cache::{create_pool, CacheStore};
use config::GitmdfsConfig;
use error::GitmdfsError;
use remote::RemoteCapability;
use sync::SyncEngine;

/// Open the cache, run initial hydration, start the background sync
/// engine, and mount the filesystem adapter at `mountpoint`. Blocks the
/// calling thread until the filesystem is unmounted.
///
/// Hydration failures are logged but not fatal: a mount with no network
/// access still serves whatever was cached on a previous run.
pub async fn mount(
    config: GitmdfsConfig,
    remote: Arc<dyn RemoteCapability>,
    mountpoint: impl AsRef<Path>,
) -> Result<(), GitmdfsError> {
    std::fs::create_dir_all(&config.cache_dir)?;
    std::fs::create_dir_all(config.conflicts_dir())?;

    let pool = create_pool(&config.db_path(), config.cache_mmap_bytes).await?;
    let store = Arc::new(CacheStore::open(pool).await?);

    let engine = SyncEngine::new(store.clone(), remote, config.clone());
    let (sync_handle, hydration_result) = engine.start().await;
    if let Err(e) = hydration_result {
        log::warn!("initial hydration failed, serving cached state: {e}");
    }

    let runtime = tokio::runtime::Handle::current();
    let adapter = fs::GitmdfsFs::new(runtime, store, sync_handle, config);

    fs::mount(adapter, mountpoint).map_err(GitmdfsError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::InMemoryRemote;
    use tempfile::tempdir;

    #[tokio::test]
    async fn mount_returns_io_error_for_nonexistent_mountpoint_parent() {
        let cache_dir = tempdir().unwrap();
        let config = GitmdfsConfig::new("owner/repo", cache_dir.path());
        let remote: Arc<dyn RemoteCapability> = Arc::new(InMemoryRemote::new());

        // `mount2` needs a real, existing mountpoint directory; a path
        // under a nonexistent parent should surface as a store/IO error
        // rather than panic.
        let result = mount(config, remote, "/nonexistent/gitmdfs-mountpoint").await;
        assert!(result.is_err());
    }
}
