use chrono::{DateTime, Utc};
use convoy_core::{ConvoyError, ConvoyResult, LockConfig};
use convoy_store::{insert, save, Collection, Store};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Persisted form of a held lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub name: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    /// Last time the holder confirmed it is still inside the critical section.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewed_at: Option<DateTime<Utc>>,
}

impl LockRecord {
    /// When the holder was last known to be alive.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.renewed_at.unwrap_or(self.acquired_at)
    }
}

/// Named, owner-attributed mutual exclusion on top of a [`Store`].
///
/// A lock is a record in [`Collection::Locks`] created with the store's
/// atomic create-if-absent, so it excludes other threads and other
/// processes sharing the same store alike.
pub struct LockManager {
    store: Arc<dyn Store>,
    owner: String,
    acquire_timeout: Duration,
    retry_interval: Duration,
    stale_after: Option<Duration>,
}

impl LockManager {
    /// Create a lock manager with default tuning and a fresh owner identity.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::from_config(store, &LockConfig::default())
    }

    pub fn from_config(store: Arc<dyn Store>, config: &LockConfig) -> Self {
        Self {
            store,
            owner: default_owner(),
            acquire_timeout: config.acquire_timeout(),
            retry_interval: config.retry_interval(),
            stale_after: config.stale_after(),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Option<Duration>) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Identity stamped on every lock this manager takes.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Take `name`, retrying with a fixed backoff until `timeout` elapses.
    pub async fn acquire(&self, name: &str, timeout: Duration) -> ConvoyResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let record = LockRecord {
                name: name.to_string(),
                owner: self.owner.clone(),
                acquired_at: Utc::now(),
                renewed_at: None,
            };
            if insert(self.store.as_ref(), Collection::Locks, name, &record).await? {
                debug!(lock = name, owner = %self.owner, "Lock acquired");
                return Ok(());
            }

            if let Some(stale_after) = self.stale_after {
                if self.reclaim_if_stale(name, stale_after).await? {
                    continue;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(lock = name, "Lock acquire timed out");
                return Err(ConvoyError::LockTimeout(name.to_string()));
            }
            tokio::time::sleep(self.retry_interval.min(deadline - now)).await;
        }
    }

    /// Release `name`. Only the recorded owner may release a lock.
    pub async fn release(&self, name: &str) -> ConvoyResult<()> {
        let Some(raw) = self.store.get(Collection::Locks, name).await? else {
            warn!(lock = name, owner = %self.owner, "Release of a lock that is not held");
            return Err(ConvoyError::LockNotFound(name.to_string()));
        };
        let record: LockRecord = serde_json::from_value(raw.clone())?;
        if record.owner != self.owner {
            warn!(
                lock = name,
                owner = %record.owner,
                caller = %self.owner,
                "Refusing to release a lock held by another owner"
            );
            return Err(ConvoyError::LockNotOwner {
                name: name.to_string(),
                owner: record.owner,
            });
        }
        if self
            .store
            .compare_and_delete(Collection::Locks, name, &raw)
            .await?
        {
            debug!(lock = name, "Lock released");
            Ok(())
        } else {
            warn!(lock = name, "Lock vanished before release");
            Err(ConvoyError::LockNotFound(name.to_string()))
        }
    }

    /// Run `f` while holding `name`, acquiring with the configured timeout.
    ///
    /// While `f` runs the lock is renewed well within the stale window, so a
    /// long critical section is never reclaimed from a live holder. The lock
    /// is released whether `f` succeeds or fails. A failed release is logged;
    /// the result of `f` is returned either way.
    pub async fn with_lock<T, F, Fut>(&self, name: &str, f: F) -> ConvoyResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ConvoyResult<T>>,
    {
        self.acquire(name, self.acquire_timeout).await?;
        let work = f();
        tokio::pin!(work);
        let result = match self.stale_after {
            None => work.await,
            Some(stale_after) => {
                let period = (stale_after / 3).max(Duration::from_millis(10));
                let mut renew = tokio::time::interval(period);
                renew.tick().await;
                loop {
                    tokio::select! {
                        result = &mut work => break result,
                        _ = renew.tick() => self.renew(name).await,
                    }
                }
            }
        };
        if let Err(e) = self.release(name).await {
            warn!(lock = name, error = %e, "Failed to release lock after critical section");
        }
        result
    }

    async fn renew(&self, name: &str) {
        match self.holder(name).await {
            Ok(Some(mut record)) if record.owner == self.owner => {
                record.renewed_at = Some(Utc::now());
                match save(self.store.as_ref(), Collection::Locks, name, &record).await {
                    Ok(()) => debug!(lock = name, "Lock renewed"),
                    Err(e) => warn!(lock = name, error = %e, "Failed to renew lock"),
                }
            }
            Ok(_) => warn!(lock = name, owner = %self.owner, "Lock lost while held"),
            Err(e) => warn!(lock = name, error = %e, "Failed to read lock for renewal"),
        }
    }

    /// Current holder of `name`, if any.
    pub async fn holder(&self, name: &str) -> ConvoyResult<Option<LockRecord>> {
        convoy_store::load(self.store.as_ref(), Collection::Locks, name).await
    }

    async fn reclaim_if_stale(&self, name: &str, stale_after: Duration) -> ConvoyResult<bool> {
        let Some(raw) = self.store.get(Collection::Locks, name).await? else {
            return Ok(false);
        };
        let record: LockRecord = serde_json::from_value(raw.clone())?;
        let age = (Utc::now() - record.last_seen()).to_std().unwrap_or_default();
        if age <= stale_after {
            return Ok(false);
        }
        let reclaimed = self
            .store
            .compare_and_delete(Collection::Locks, name, &raw)
            .await?;
        if reclaimed {
            warn!(
                lock = name,
                stale_owner = %record.owner,
                age_secs = age.as_secs(),
                "Reclaimed stale lock"
            );
        }
        Ok(reclaimed)
    }
}

fn default_owner() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{host}:{}:{}", std::process::id(), &suffix[..8])
}

/// Lock name guarding one task record.
pub(crate) fn task_lock(task_id: &str) -> String {
    format!("task:{task_id}")
}

/// Lock name guarding one workflow record.
pub(crate) fn workflow_lock(workflow_id: &str) -> String {
    format!("workflow:{workflow_id}")
}

pub(crate) const REGISTRY_LOCK: &str = "registry";
pub(crate) const CONTROLLER_LOCK: &str = "controller";

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use convoy_store::MemoryStore;

    fn manager(store: &Arc<dyn Store>, owner: &str) -> LockManager {
        LockManager::new(store.clone())
            .with_owner(owner)
            .with_acquire_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let locks = manager(&store, "p1");
        locks.acquire("registry", Duration::ZERO).await.unwrap();
        let holder = locks.holder("registry").await.unwrap().unwrap();
        assert_eq!(holder.owner, "p1");
        locks.release("registry").await.unwrap();
        assert!(locks.holder("registry").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_acquire_times_out() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let first = manager(&store, "p1");
        let second = manager(&store, "p2");
        first.acquire("task:t1", Duration::ZERO).await.unwrap();
        let err = second
            .acquire("task:t1", Duration::from_millis(120))
            .await
            .unwrap_err();
        assert!(matches!(err, ConvoyError::LockTimeout(ref n) if n == "task:t1"));
    }

    #[tokio::test]
    async fn test_release_by_non_owner_is_refused() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let first = manager(&store, "p1");
        let second = manager(&store, "p2");
        first.acquire("registry", Duration::ZERO).await.unwrap();
        let err = second.release("registry").await.unwrap_err();
        assert!(matches!(err, ConvoyError::LockNotOwner { ref owner, .. } if owner == "p1"));
        assert!(first.holder("registry").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_missing_lock() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let err = manager(&store, "p1").release("nothing").await.unwrap_err();
        assert!(matches!(err, ConvoyError::LockNotFound(_)));
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let first = Arc::new(manager(&store, "p1"));
        let second = manager(&store, "p2");
        first.acquire("registry", Duration::ZERO).await.unwrap();

        let releaser = first.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            releaser.release("registry").await.unwrap();
        });

        second
            .acquire("registry", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(second.holder("registry").await.unwrap().unwrap().owner, "p2");
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let locks = manager(&store, "p1");
        let result: ConvoyResult<()> = locks
            .with_lock("task:t1", || async {
                Err(ConvoyError::Validation("boom".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(locks.holder("task:t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let stale = LockRecord {
            name: "registry".into(),
            owner: "dead-process".into(),
            acquired_at: Utc::now() - chrono::Duration::seconds(600),
            renewed_at: None,
        };
        insert(store.as_ref(), Collection::Locks, "registry", &stale)
            .await
            .unwrap();

        let locks = manager(&store, "p1").with_stale_after(Some(Duration::from_secs(60)));
        locks.acquire("registry", Duration::ZERO).await.unwrap();
        assert_eq!(locks.holder("registry").await.unwrap().unwrap().owner, "p1");
    }

    #[tokio::test]
    async fn test_long_critical_section_is_not_reclaimed() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let stale_after = Some(Duration::from_millis(100));
        let holder = Arc::new(manager(&store, "p1").with_stale_after(stale_after));
        let other = manager(&store, "p2").with_stale_after(stale_after);

        let inside = holder.clone();
        let work = tokio::spawn(async move {
            inside
                .with_lock("controller", || async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Several stale windows pass while p1 is still working.
        let err = other
            .acquire("controller", Duration::from_millis(350))
            .await
            .unwrap_err();
        assert!(matches!(err, ConvoyError::LockTimeout(_)));
        let record = holder.holder("controller").await.unwrap().unwrap();
        assert_eq!(record.owner, "p1");
        assert!(record.renewed_at.is_some());

        work.await.unwrap().unwrap();
        assert!(holder.holder("controller").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fresh_lock_is_not_reclaimed() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let holder = manager(&store, "p1");
        holder.acquire("registry", Duration::ZERO).await.unwrap();
        let other = manager(&store, "p2").with_stale_after(Some(Duration::from_secs(60)));
        assert!(other.acquire("registry", Duration::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn test_with_lock_serializes_read_modify_write() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        convoy_store::save(store.as_ref(), Collection::Tasks, "counter", &0u32)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let locks = LockManager::new(store.clone())
                .with_owner(format!("p{i}"))
                .with_acquire_timeout(Duration::from_secs(5));
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                locks
                    .with_lock("counter", || async {
                        let n: u32 =
                            convoy_store::load(store.as_ref(), Collection::Tasks, "counter")
                                .await?
                                .unwrap_or_default();
                        tokio::task::yield_now().await;
                        convoy_store::save(store.as_ref(), Collection::Tasks, "counter", &(n + 1))
                            .await
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let n: u32 = convoy_store::load(store.as_ref(), Collection::Tasks, "counter")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 8);
    }
}
