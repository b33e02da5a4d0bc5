//! Session pool: resume-key to session bindings.
//!
//! The [`SessionPool`] remembers which session serves each logical thread of
//! work so that later items reattach to the same process and scrollback. It
//! never spawns processes itself; it asks its [`SessionHost`] when there is
//! no usable binding.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::session::{HostError, SessionHost};

/// The session currently bound to a resume key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionBinding {
    pub session_key: String,
    /// Milliseconds since the Unix epoch.
    pub last_used_ms: u64,
}

/// Resume-key bookkeeping over a session host.
pub struct SessionPool<H> {
    host: Arc<H>,
    bindings: RwLock<HashMap<String, SessionBinding>>,
    /// Serializes acquisition per resume key so one key never ends up with
    /// two live sessions.
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<H: SessionHost> SessionPool<H> {
    pub fn new(host: Arc<H>) -> Self {
        Self {
            host,
            bindings: RwLock::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub const fn host(&self) -> &Arc<H> {
        &self.host
    }

    async fn key_lock(&self, resume_key: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.key_locks
                .lock()
                .await
                .entry(resume_key.to_string())
                .or_default(),
        )
    }

    /// Return the session bound to `resume_key`, spawning a new one if the
    /// binding is missing or its session is no longer usable.
    pub async fn acquire(&self, resume_key: &str) -> Result<String, HostError> {
        let lock = self.key_lock(resume_key).await;
        let _guard = lock.lock().await;

        let existing = self.bindings.read().await.get(resume_key).cloned();
        if let Some(binding) = existing {
            match self.host.session_status(&binding.session_key).await {
                Some(status) if status.is_usable() => {
                    debug!(resume_key, session_key = %binding.session_key, "Reusing session");
                    self.touch(resume_key).await;
                    return Ok(binding.session_key);
                }
                status => {
                    warn!(
                        resume_key,
                        session_key = %binding.session_key,
                        ?status,
                        "Bound session unusable, dropping binding"
                    );
                    self.bindings.write().await.remove(resume_key);
                }
            }
        }

        let session_key = self.host.spawn_or_reuse_session(resume_key).await?;
        info!(resume_key, session_key = %session_key, "Session bound");
        self.bindings.write().await.insert(
            resume_key.to_string(),
            SessionBinding {
                session_key: session_key.clone(),
                last_used_ms: now_ms(),
            },
        );
        Ok(session_key)
    }

    /// Mark the binding as just used. The session stays alive for reuse.
    pub async fn release(&self, resume_key: &str) -> bool {
        self.touch(resume_key).await
    }

    async fn touch(&self, resume_key: &str) -> bool {
        let mut bindings = self.bindings.write().await;
        let Some(binding) = bindings.get_mut(resume_key) else {
            return false;
        };
        binding.last_used_ms = now_ms();
        true
    }

    /// Forget the binding after its session terminated for good.
    pub async fn evict(&self, resume_key: &str) -> Option<SessionBinding> {
        let removed = self.bindings.write().await.remove(resume_key);
        if let Some(binding) = &removed {
            warn!(resume_key, session_key = %binding.session_key, "Session evicted");
        }
        removed
    }

    pub async fn get(&self, resume_key: &str) -> Option<SessionBinding> {
        self.bindings.read().await.get(resume_key).cloned()
    }

    /// Snapshot of every binding, ordered by resume key.
    pub async fn bindings(&self) -> BTreeMap<String, SessionBinding> {
        self.bindings
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Scrollback of the session bound to `resume_key`, for a reattaching observer.
    pub async fn replay(&self, resume_key: &str) -> Option<Result<Vec<u8>, HostError>> {
        let binding = self.get(resume_key).await?;
        Some(self.host.fetch_buffer(&binding.session_key).await)
    }

    /// Forward a resize to the bound session, if any.
    pub async fn resize(&self, resume_key: &str, cols: u16, rows: u16) -> bool {
        let Some(binding) = self.get(resume_key).await else {
            return false;
        };
        self.host.resize(&binding.session_key, cols, rows);
        true
    }
}

#[allow(clippy::cast_possible_truncation)]
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;
    use crate::session::testing::ScriptedHost;
    use std::time::Duration;

    fn pool() -> (Arc<ScriptedHost>, SessionPool<ScriptedHost>) {
        let host = Arc::new(ScriptedHost::new());
        let pool = SessionPool::new(Arc::clone(&host));
        (host, pool)
    }

    #[tokio::test]
    async fn acquire_spawns_then_reuses() {
        let (host, pool) = pool();
        let first = pool.acquire("issue-1:g").await.unwrap();
        let second = pool.acquire("issue-1:g").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(host.spawns().len(), 1);
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_sessions() {
        let (_host, pool) = pool();
        let a = pool.acquire("a").await.unwrap();
        let b = pool.acquire("b").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.bindings().await.len(), 2);
    }

    #[tokio::test]
    async fn errored_session_is_replaced() {
        let (host, pool) = pool();
        let first = pool.acquire("k").await.unwrap();
        host.set_session_status(&first, SessionStatus::Error);

        let second = pool.acquire("k").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(pool.get("k").await.unwrap().session_key, second);
    }

    #[tokio::test]
    async fn paused_session_is_still_reused() {
        let (host, pool) = pool();
        let first = pool.acquire("k").await.unwrap();
        host.set_session_status(&first, SessionStatus::Paused);
        assert_eq!(pool.acquire("k").await.unwrap(), first);
    }

    #[tokio::test]
    async fn spawn_failure_creates_no_binding() {
        let (host, pool) = pool();
        host.fail_next_spawn("k");
        let err = pool.acquire("k").await.unwrap_err();
        assert!(matches!(err, HostError::SpawnFailed { .. }));
        assert!(pool.get("k").await.is_none());

        // The next attempt goes through.
        assert!(pool.acquire("k").await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_acquire_spawns_once() {
        let host = Arc::new(ScriptedHost::new().with_spawn_delay(Duration::from_millis(20)));
        let pool = Arc::new(SessionPool::new(Arc::clone(&host)));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move { pool.acquire("same").await }));
        }
        let mut keys = Vec::new();
        for h in handles {
            keys.push(h.await.unwrap().unwrap());
        }
        keys.dedup();
        assert_eq!(keys.len(), 1);
        assert_eq!(host.spawns().len(), 1);
    }

    #[tokio::test]
    async fn release_updates_binding_in_place() {
        let (_host, pool) = pool();
        let key = pool.acquire("k").await.unwrap();
        let before = pool.get("k").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(pool.release("k").await);
        let after = pool.get("k").await.unwrap();
        assert_eq!(after.session_key, key);
        assert!(after.last_used_ms >= before.last_used_ms);
        assert!(!pool.release("missing").await);
    }

    #[tokio::test]
    async fn evict_removes_binding() {
        let (host, pool) = pool();
        pool.acquire("k").await.unwrap();
        assert!(pool.evict("k").await.is_some());
        assert!(pool.evict("k").await.is_none());
        pool.acquire("k").await.unwrap();
        assert_eq!(host.spawns().len(), 2);
    }

    #[tokio::test]
    async fn replay_and_resize_follow_binding() {
        let (host, pool) = pool();
        assert!(pool.replay("k").await.is_none());
        assert!(!pool.resize("k", 80, 24).await);

        let key = pool.acquire("k").await.unwrap();
        assert!(pool.replay("k").await.unwrap().unwrap().is_empty());
        assert!(pool.resize("k", 80, 24).await);
        assert_eq!(host.resizes(), vec![(key, 80, 24)]);
    }
}
