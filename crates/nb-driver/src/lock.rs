use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("lock {id} is not held")]
    NotHeld { id: String, owner: Option<String> },

    #[error("local lock {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockInfo {
    pub id: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
}

/// Advisory mutex keyed by string, shared by every control-plane process.
#[async_trait]
pub trait PoolLock: Send + Sync + 'static {
    /// Take the lock if it is free. Never blocks.
    async fn try_acquire(&self, id: &str, owner: &str) -> Result<bool, LockError>;

    /// Release the lock. With an owner, only that owner's hold is released.
    /// Returns [`LockError::NotHeld`] when nothing matched.
    async fn release(&self, id: &str, owner: Option<&str>) -> Result<(), LockError>;

    async fn list(&self) -> Result<Vec<LockInfo>, LockError>;
}

/// Spin until the lock is taken.
pub async fn acquire(lock: &dyn PoolLock, id: &str, owner: &str, retry: Duration) -> Result<(), LockError> {
    let mut attempts = 0u32;
    while !lock.try_acquire(id, owner).await? {
        attempts += 1;
        if attempts % 12 == 0 {
            debug!(lock_id = id, owner, attempts, "still waiting for lock");
        }
        tokio::time::sleep(retry).await;
    }
    Ok(())
}

/// Release, logging instead of failing. Used on exit paths where the
/// primary result must win.
pub async fn release_quietly(lock: &dyn PoolLock, id: &str, owner: &str) {
    if let Err(e) = lock.release(id, Some(owner)).await {
        warn!(lock_id = id, owner, error = %e, "failed to release lock");
    }
}

/// A held lock. Dropping it without [`HeldLock::release`] hands the
/// release to a background task, so a cancelled holder cannot leak it.
pub struct HeldLock {
    lock: Arc<dyn PoolLock>,
    id: String,
    owner: String,
    released: bool,
}

impl HeldLock {
    /// Spin until the lock is taken, then guard it.
    pub async fn acquire(lock: Arc<dyn PoolLock>, id: &str, owner: &str, retry: Duration) -> Result<Self, LockError> {
        acquire(&*lock, id, owner, retry).await?;
        Ok(Self {
            lock,
            id: id.to_string(),
            owner: owner.to_string(),
            released: false,
        })
    }

    pub async fn release(mut self) {
        release_quietly(&*self.lock, &self.id, &self.owner).await;
        self.released = true;
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(lock_id = %self.id, owner = %self.owner, "lock dropped outside a runtime, left held");
            return;
        };
        warn!(lock_id = %self.id, owner = %self.owner, "lock holder cancelled, releasing");
        let lock = self.lock.clone();
        let id = std::mem::take(&mut self.id);
        let owner = std::mem::take(&mut self.owner);
        runtime.spawn(async move { release_quietly(&*lock, &id, &owner).await });
    }
}

// ── PostgreSQL ──────────────────────────────────────────────────────

pub struct PgPoolLock {
    pool: PgPool,
}

impl PgPoolLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PoolLock for PgPoolLock {
    async fn try_acquire(&self, id: &str, owner: &str) -> Result<bool, LockError> {
        Ok(nb_db::models::Lock::try_acquire(&self.pool, id, owner).await?)
    }

    async fn release(&self, id: &str, owner: Option<&str>) -> Result<(), LockError> {
        if nb_db::models::Lock::release(&self.pool, id, owner).await? {
            Ok(())
        } else {
            Err(LockError::NotHeld {
                id: id.to_string(),
                owner: owner.map(str::to_string),
            })
        }
    }

    async fn list(&self) -> Result<Vec<LockInfo>, LockError> {
        Ok(nb_db::models::Lock::list(&self.pool)
            .await?
            .into_iter()
            .map(|l| LockInfo {
                id: l.id,
                owner: l.owner,
                acquired_at: l.acquired_at,
            })
            .collect())
    }
}

// ── In-memory ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryPoolLock {
    held: Mutex<HashMap<String, LockInfo>>,
}

impl MemoryPoolLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> std::sync::MutexGuard<'_, HashMap<String, LockInfo>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PoolLock for MemoryPoolLock {
    async fn try_acquire(&self, id: &str, owner: &str) -> Result<bool, LockError> {
        let mut held = self.held();
        if held.contains_key(id) {
            return Ok(false);
        }
        held.insert(
            id.to_string(),
            LockInfo {
                id: id.to_string(),
                owner: owner.to_string(),
                acquired_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn release(&self, id: &str, owner: Option<&str>) -> Result<(), LockError> {
        let mut held = self.held();
        match held.get(id) {
            Some(info) if owner.is_none_or(|o| o == info.owner) => {
                held.remove(id);
                Ok(())
            }
            _ => Err(LockError::NotHeld {
                id: id.to_string(),
                owner: owner.map(str::to_string),
            }),
        }
    }

    async fn list(&self) -> Result<Vec<LockInfo>, LockError> {
        let mut locks: Vec<LockInfo> = self.held().values().cloned().collect();
        locks.sort_by(|a, b| a.acquired_at.cmp(&b.acquired_at).then_with(|| a.id.cmp(&b.id)));
        Ok(locks)
    }
}

// ── Local file lock ─────────────────────────────────────────────────

/// Exclusive lock file in the runtime directory, held until dropped.
#[derive(Debug)]
pub struct LocalFileLock {
    path: PathBuf,
}

impl LocalFileLock {
    /// Lock files older than this are left over from a crashed process.
    pub const STALE_AFTER: Duration = Duration::from_secs(60 * 60);

    /// Try to create `path` exclusively, retrying until `timeout`.
    /// Returns `Ok(None)` on timeout.
    pub async fn try_lock(path: &Path, timeout: Duration) -> Result<Option<Self>, LockError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|source| LockError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await
            {
                Ok(_) => {
                    return Ok(Some(Self {
                        path: path.to_path_buf(),
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Self::is_stale(path).await {
                        warn!(path = %path.display(), "removing stale lock file");
                        let _ = tokio::fs::remove_file(path).await;
                        continue;
                    }
                }
                Err(source) => {
                    return Err(LockError::Io {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn is_stale(path: &Path) -> bool {
        let Ok(meta) = tokio::fs::metadata(path).await else {
            return false;
        };
        meta.modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .is_some_and(|age| age > Self::STALE_AFTER)
    }
}

impl Drop for LocalFileLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_lock_is_exclusive_and_owner_checked() {
        let lock = MemoryPoolLock::new();
        assert!(lock.try_acquire("dd_host:global", "a").await.unwrap());
        assert!(!lock.try_acquire("dd_host:global", "b").await.unwrap());

        assert!(matches!(
            lock.release("dd_host:global", Some("b")).await,
            Err(LockError::NotHeld { .. })
        ));
        lock.release("dd_host:global", Some("a")).await.unwrap();
        assert!(matches!(
            lock.release("dd_host:global", Some("a")).await,
            Err(LockError::NotHeld { .. })
        ));
    }

    #[tokio::test]
    async fn forced_release_ignores_owner() {
        let lock = MemoryPoolLock::new();
        lock.try_acquire("x", "stuck-worker").await.unwrap();
        assert_eq!(lock.list().await.unwrap().len(), 1);

        lock.release("x", None).await.unwrap();
        assert!(lock.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let lock = std::sync::Arc::new(MemoryPoolLock::new());
        lock.try_acquire("x", "first").await.unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { acquire(&*lock, "x", "second", Duration::from_millis(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        lock.release("x", Some("first")).await.unwrap();
        waiter.await.unwrap().unwrap();
        assert_eq!(lock.list().await.unwrap()[0].owner, "second");
    }

    #[tokio::test]
    async fn dropped_holder_releases_in_background() {
        let lock: Arc<dyn PoolLock> = Arc::new(MemoryPoolLock::new());
        let held = HeldLock::acquire(lock.clone(), "x", "cancelled", Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(lock.list().await.unwrap().len(), 1);

        drop(held);
        tokio::time::timeout(
            Duration::from_secs(1),
            acquire(&*lock, "x", "next", Duration::from_millis(1)),
        )
        .await
        .expect("lock freed after drop")
        .unwrap();
    }

    #[tokio::test]
    async fn local_file_lock_times_out_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("housekeep.lock");

        let held = LocalFileLock::try_lock(&path, Duration::from_secs(1)).await.unwrap();
        assert!(held.is_some());

        let second = LocalFileLock::try_lock(&path, Duration::from_millis(100)).await.unwrap();
        assert!(second.is_none());

        drop(held);
        assert!(!path.exists());
        assert!(LocalFileLock::try_lock(&path, Duration::ZERO).await.unwrap().is_some());
    }
}
