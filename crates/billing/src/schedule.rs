//! Single-flight guard for periodic jobs
//!
//! A tick runs only if it can take the job's lock. The lock expires after
//! the job's time budget, and the run is cut off at the same budget, so a
//! stuck run can neither block later ticks forever nor overlap them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::BillingResult;

/// Proof of ownership returned by a successful acquire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    pub name: String,
    pub token: String,
}

#[async_trait]
pub trait JobLock: Send + Sync {
    /// Take the lock for `ttl`; `None` when someone else holds it
    async fn try_acquire(&self, name: &str, ttl: Duration) -> BillingResult<Option<LockGuard>>;

    /// Release only if the guard still owns the lock
    async fn release(&self, guard: &LockGuard) -> BillingResult<()>;
}

/// In-process lock, enough for a single worker
#[derive(Default)]
pub struct LocalJobLock {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl LocalJobLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobLock for LocalJobLock {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> BillingResult<Option<LockGuard>> {
        let mut held = self.held.lock().await;
        let now = Instant::now();
        if let Some((_, expires)) = held.get(name) {
            if *expires > now {
                return Ok(None);
            }
        }
        let token = Uuid::new_v4().to_string();
        held.insert(name.to_string(), (token.clone(), now + ttl));
        Ok(Some(LockGuard {
            name: name.to_string(),
            token,
        }))
    }

    async fn release(&self, guard: &LockGuard) -> BillingResult<()> {
        let mut held = self.held.lock().await;
        if held.get(&guard.name).is_some_and(|(t, _)| *t == guard.token) {
            held.remove(&guard.name);
        }
        Ok(())
    }
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Cross-process lock: `SET key token NX PX ttl`, compare-and-delete release
#[derive(Clone)]
pub struct RedisJobLock {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisJobLock {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            prefix: "clubpass:job-lock:".to_string(),
        }
    }

    pub async fn connect(redis_url: &str) -> BillingResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

#[async_trait]
impl JobLock for RedisJobLock {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> BillingResult<Option<LockGuard>> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(name))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(reply.map(|_| LockGuard {
            name: name.to_string(),
            token,
        }))
    }

    async fn release(&self, guard: &LockGuard) -> BillingResult<()> {
        let mut conn = self.conn.clone();
        let _deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.key(&guard.name))
            .arg(&guard.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// A named periodic job guarded by a [`JobLock`]
#[derive(Clone)]
pub struct ScheduledTask {
    name: &'static str,
    lock: Arc<dyn JobLock>,
    budget: Duration,
}

impl ScheduledTask {
    pub fn new(name: &'static str, lock: Arc<dyn JobLock>, budget: Duration) -> Self {
        Self { name, lock, budget }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run `job` unless another tick holds the lock. `None` means skipped or timed out.
    pub async fn run<F, Fut, T>(&self, job: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = match self.lock.try_acquire(self.name, self.budget).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                tracing::info!(job = self.name, "Previous run still in progress, skipping tick");
                return None;
            }
            Err(e) => {
                tracing::error!(job = self.name, error = %e, "Could not take job lock, skipping tick");
                return None;
            }
        };

        let started = Instant::now();
        let result = tokio::time::timeout(self.budget, job()).await;

        if let Err(e) = self.lock.release(&guard).await {
            tracing::warn!(job = self.name, error = %e, "Failed to release job lock; it will expire");
        }

        match result {
            Ok(out) => {
                tracing::debug!(
                    job = self.name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job finished"
                );
                Some(out)
            }
            Err(_) => {
                tracing::error!(
                    job = self.name,
                    budget_secs = self.budget.as_secs(),
                    "Job exceeded its time budget and was cancelled"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_lock_is_exclusive_until_released() {
        let lock = LocalJobLock::new();
        let guard = lock
            .try_acquire("autopay", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert!(lock
            .try_acquire("autopay", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
        assert!(lock
            .try_acquire("group-sync", Duration::from_secs(60))
            .await
            .unwrap()
            .is_some());

        lock.release(&guard).await.unwrap();
        assert!(lock
            .try_acquire("autopay", Duration::from_secs(60))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_stale_guard_cannot_release_new_owner() {
        let lock = LocalJobLock::new();
        let stale = lock
            .try_acquire("job", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _fresh = lock
            .try_acquire("job", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        lock.release(&stale).await.unwrap();
        assert!(lock
            .try_acquire("job", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let lock: Arc<dyn JobLock> = Arc::new(LocalJobLock::new());
        let task = ScheduledTask::new("sweep", lock.clone(), Duration::from_secs(5));
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (finish_tx, finish_rx) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let task = task.clone();
            tokio::spawn(async move {
                task.run(|| async move {
                    let _ = started_tx.send(());
                    let _ = finish_rx.await;
                    1
                })
                .await
            })
        };
        started_rx.await.unwrap();

        let second = task.run(|| async { 2 }).await;
        assert_eq!(second, None);

        finish_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap(), Some(1));
        assert_eq!(task.run(|| async { 3 }).await, Some(3));
    }

    #[tokio::test]
    async fn test_job_over_budget_is_cancelled_and_unlocked() {
        let lock: Arc<dyn JobLock> = Arc::new(LocalJobLock::new());
        let task = ScheduledTask::new("slow", lock, Duration::from_millis(10));

        let out = task
            .run(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
            })
            .await;
        assert!(out.is_none());
        assert_eq!(task.run(|| async { "ok" }).await, Some("ok"));
    }
}
