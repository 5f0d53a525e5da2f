//! Pooled, lifecycle-managed browser sessions.
//!
//! One live session per session identifier; acquire/release bookkeeping runs
//! under a per-identifier lock so distinct sessions never contend, while the
//! work itself runs outside any lock. Idle sessions expire on a sliding TTL
//! enforced by a sweep task; `destroy` force-closes everything at shutdown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use webscout_core::{ContextFactory, Error, ExecutionContext, Result};

pub const SESSION_TTL: Duration = Duration::from_secs(5 * 60);
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

const SESSIONS_SUBDIR: &str = "browser_sessions";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub cache_root: PathBuf,
    /// Sliding idle expiry, re-armed on every access.
    pub ttl: Duration,
    /// Upper bound on waiting for a session's bookkeeping lock.
    pub lock_timeout: Duration,
    /// How often the eviction sweep runs.
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cache_root: crate::cache_root(),
            ttl: SESSION_TTL,
            lock_timeout: LOCK_TIMEOUT,
            sweep_interval: SWEEP_INTERVAL,
        }
    }
}

/// One caller's isolated browsing environment.
///
/// The pool exclusively owns the execution context and its storage directory;
/// callers borrow it for the duration of one `with_session` scope.
pub struct Session<C> {
    session_id: String,
    context: C,
    storage_dir: PathBuf,
    /// Number of unresolved `with_session` scopes. Mutated only under the
    /// identifier's lock.
    active: AtomicU32,
    /// Millis since the manager's epoch; drives the sliding TTL.
    last_access_ms: AtomicU64,
}

impl<C> Session<C> {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn storage_dir(&self) -> &std::path::Path {
        &self.storage_dir
    }

    fn touch(&self, epoch: Instant) {
        self.last_access_ms
            .store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self, epoch: Instant) -> Duration {
        let now_ms = epoch.elapsed().as_millis() as u64;
        let last = self.last_access_ms.load(Ordering::Relaxed);
        Duration::from_millis(now_ms.saturating_sub(last))
    }
}

/// Per-identifier bookkeeping lock, reference-counted so the registry does
/// not grow with the set of identifiers ever seen.
struct KeyLock {
    mu: Mutex<()>,
    refs: AtomicUsize,
}

struct Inner<F: ContextFactory> {
    factory: F,
    cfg: SessionConfig,
    epoch: Instant,
    sessions: Mutex<HashMap<String, Arc<Session<F::Ctx>>>>,
    locks: Mutex<HashMap<String, Arc<KeyLock>>>,
    destroyed: AtomicBool,
}

pub struct SessionManager<F: ContextFactory> {
    inner: Arc<Inner<F>>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<F: ContextFactory> SessionManager<F> {
    /// Build a manager and start its eviction sweep. Must be called from
    /// within a tokio runtime.
    pub fn new(factory: F, cfg: SessionConfig) -> Self {
        let inner = Arc::new(Inner {
            factory,
            epoch: Instant::now(),
            sessions: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
            cfg,
        });

        let sweep = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweep.cfg.sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if sweep.destroyed.load(Ordering::SeqCst) {
                    break;
                }
                sweep.sweep().await;
            }
        });

        Self {
            inner,
            sweeper: Mutex::new(Some(handle)),
        }
    }

    /// Run `work` against the session for `session_id`, creating the session
    /// on first use. The active-use counter is incremented before `work` and
    /// decremented exactly once afterwards, on success and failure alike;
    /// `work`'s own outcome is returned either way.
    pub async fn with_session<T, Fut>(
        &self,
        session_id: &str,
        work: impl FnOnce(Arc<Session<F::Ctx>>) -> Fut,
    ) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<T>>,
    {
        let session = self.inner.acquire(session_id).await?;
        let out = work(session).await;
        self.inner.release(session_id).await?;
        out
    }

    /// Number of pooled sessions (idle and busy).
    pub async fn session_count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Active-use counter for one identifier; 0 when the session is absent.
    pub async fn active_count(&self, session_id: &str) -> u32 {
        match self.inner.sessions.lock().await.get(session_id) {
            Some(s) => s.active.load(Ordering::SeqCst),
            None => 0,
        }
    }

    /// Process-wide teardown: fail all subsequent `with_session` calls, then
    /// force-destroy every pooled session regardless of its counter.
    pub async fn destroy(&self) {
        info!("destroying all sessions");
        self.inner.destroyed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }

        let drained: Vec<(String, Arc<Session<F::Ctx>>)> = {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.drain().collect()
        };
        for (session_id, session) in drained {
            let active = session.active.load(Ordering::SeqCst);
            if active > 0 {
                warn!(%session_id, active, "force destroying busy session");
            }
            self.inner.destroy_session(&session).await;
        }
        self.inner.locks.lock().await.clear();
        info!("destroy complete");
    }
}

impl<F: ContextFactory> Inner<F> {
    async fn checkout_key_lock(&self, session_id: &str) -> Arc<KeyLock> {
        let mut locks = self.locks.lock().await;
        let kl = locks
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(KeyLock {
                    mu: Mutex::new(()),
                    refs: AtomicUsize::new(0),
                })
            })
            .clone();
        kl.refs.fetch_add(1, Ordering::SeqCst);
        kl
    }

    async fn checkin_key_lock(&self, session_id: &str) {
        let mut locks = self.locks.lock().await;
        if let Some(kl) = locks.get(session_id) {
            if kl.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
                locks.remove(session_id);
            }
        }
    }

    async fn acquire(&self, session_id: &str) -> Result<Arc<Session<F::Ctx>>> {
        let kl = self.checkout_key_lock(session_id).await;
        let out = self.acquire_locked(session_id, &kl).await;
        self.checkin_key_lock(session_id).await;
        out
    }

    async fn acquire_locked(&self, session_id: &str, kl: &KeyLock) -> Result<Arc<Session<F::Ctx>>> {
        let _guard = tokio::time::timeout(self.cfg.lock_timeout, kl.mu.lock())
            .await
            .map_err(|_| lock_timeout_error(session_id, self.cfg.lock_timeout))?;

        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Session("session manager is destroyed".to_string()));
        }

        let existing = self.sessions.lock().await.get(session_id).cloned();
        let session = match existing {
            Some(session) => session,
            None => {
                info!(session_id, "creating new session");
                let session = self.create_session(session_id).await?;
                self.sessions
                    .lock()
                    .await
                    .insert(session_id.to_string(), Arc::clone(&session));
                session
            }
        };

        let active = session.active.fetch_add(1, Ordering::SeqCst) + 1;
        session.touch(self.epoch);
        info!(session_id, active, "acquired session");
        Ok(session)
    }

    async fn release(&self, session_id: &str) -> Result<()> {
        let kl = self.checkout_key_lock(session_id).await;
        let out = self.release_locked(session_id, &kl).await;
        self.checkin_key_lock(session_id).await;
        out
    }

    async fn release_locked(&self, session_id: &str, kl: &KeyLock) -> Result<()> {
        let _guard = tokio::time::timeout(self.cfg.lock_timeout, kl.mu.lock())
            .await
            .map_err(|_| lock_timeout_error(session_id, self.cfg.lock_timeout))?;

        let Some(session) = self.sessions.lock().await.get(session_id).cloned() else {
            warn!(session_id, "release attempted but session does not exist");
            return Ok(());
        };

        let active = session.active.load(Ordering::SeqCst);
        if active == 0 {
            warn!(session_id, "release attempted with zero active uses");
            return Ok(());
        }
        session.active.store(active - 1, Ordering::SeqCst);
        session.touch(self.epoch);
        info!(session_id, active = active - 1, "released session");
        Ok(())
    }

    async fn create_session(&self, session_id: &str) -> Result<Arc<Session<F::Ctx>>> {
        let storage_dir = self.cfg.cache_root.join(SESSIONS_SUBDIR).join(session_id);
        std::fs::create_dir_all(&storage_dir).map_err(|e| {
            Error::Session(format!(
                "creating session directory {}: {e}",
                storage_dir.display()
            ))
        })?;
        let context = self.factory.create(&storage_dir).await?;
        info!(session_id, dir = %storage_dir.display(), "created session");
        Ok(Arc::new(Session {
            session_id: session_id.to_string(),
            context,
            storage_dir,
            active: AtomicU32::new(0),
            last_access_ms: AtomicU64::new(self.epoch.elapsed().as_millis() as u64),
        }))
    }

    async fn sweep(&self) {
        let expired: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .filter(|(_, s)| {
                    s.active.load(Ordering::SeqCst) == 0 && s.idle_for(self.epoch) >= self.cfg.ttl
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        for session_id in expired {
            let kl = self.checkout_key_lock(&session_id).await;
            let res = self.evict_locked(&session_id, &kl).await;
            self.checkin_key_lock(&session_id).await;
            if let Err(e) = res {
                warn!(%session_id, error = %e, "eviction deferred");
            }
        }
    }

    async fn evict_locked(&self, session_id: &str, kl: &KeyLock) -> Result<()> {
        let _guard = tokio::time::timeout(self.cfg.lock_timeout, kl.mu.lock())
            .await
            .map_err(|_| lock_timeout_error(session_id, self.cfg.lock_timeout))?;

        let Some(session) = self.sessions.lock().await.get(session_id).cloned() else {
            return Ok(());
        };
        // Re-check under the lock: the session may have been re-acquired or
        // touched since the sweep snapshot.
        if session.active.load(Ordering::SeqCst) > 0 || session.idle_for(self.epoch) < self.cfg.ttl
        {
            return Ok(());
        }

        self.sessions.lock().await.remove(session_id);
        info!(session_id, "evicting idle session");
        self.destroy_session(&session).await;
        Ok(())
    }

    /// Close the context and delete its storage. Both steps are best-effort:
    /// a failure is logged and never keeps the session pooled.
    async fn destroy_session(&self, session: &Session<F::Ctx>) {
        let session_id = session.session_id.as_str();
        info!(session_id, "finalizing session");
        match session.context.close().await {
            Ok(()) => info!(session_id, "browser context closed"),
            Err(e) => error!(session_id, error = %e, "error closing browser context"),
        }
        match remove_dir_if_present(&session.storage_dir) {
            Ok(()) => info!(session_id, "session directory removed"),
            Err(e) => error!(session_id, error = %e, "error removing session directory"),
        }
    }
}

fn remove_dir_if_present(dir: &std::path::Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn lock_timeout_error(session_id: &str, timeout: Duration) -> Error {
    Error::LockTimeout(format!(
        "session {session_id}: bookkeeping lock not acquired within {}ms",
        timeout.as_millis()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct StubShared {
        created: AtomicUsize,
        fail_next: AtomicBool,
        closed: std::sync::Mutex<Vec<Arc<AtomicBool>>>,
    }

    #[derive(Clone, Default)]
    struct StubFactory {
        shared: Arc<StubShared>,
    }

    struct StubCtx {
        closed: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ExecutionContext for StubCtx {
        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl ContextFactory for StubFactory {
        type Ctx = StubCtx;

        async fn create(&self, _storage_dir: &std::path::Path) -> Result<StubCtx> {
            if self.shared.fail_next.swap(false, Ordering::SeqCst) {
                return Err(Error::Browser("stub launch failure".to_string()));
            }
            self.shared.created.fetch_add(1, Ordering::SeqCst);
            let closed = Arc::new(AtomicBool::new(false));
            self.shared.closed.lock().unwrap().push(Arc::clone(&closed));
            Ok(StubCtx { closed })
        }
    }

    fn test_cfg(root: &std::path::Path, ttl_ms: u64, sweep_ms: u64) -> SessionConfig {
        SessionConfig {
            cache_root: root.to_path_buf(),
            ttl: Duration::from_millis(ttl_ms),
            lock_timeout: Duration::from_secs(2),
            sweep_interval: Duration::from_millis(sweep_ms),
        }
    }

    #[tokio::test]
    async fn with_session_reuses_the_same_context_per_identifier() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = StubFactory::default();
        let shared = Arc::clone(&factory.shared);
        let mgr = SessionManager::new(factory, test_cfg(tmp.path(), 60_000, 60_000));

        let p1 = mgr
            .with_session("alice", |s| async move { Ok(Arc::as_ptr(&s) as usize) })
            .await
            .unwrap();
        let p2 = mgr
            .with_session("alice", |s| async move { Ok(Arc::as_ptr(&s) as usize) })
            .await
            .unwrap();
        let p3 = mgr
            .with_session("bob", |s| async move { Ok(Arc::as_ptr(&s) as usize) })
            .await
            .unwrap();

        // Same identifier, same underlying session object; new identifier,
        // new one.
        assert_eq!(p1, p2);
        assert_ne!(p1, p3);
        assert_eq!(shared.created.load(Ordering::SeqCst), 2);
        assert_eq!(mgr.session_count().await, 2);
        mgr.destroy().await;
    }

    #[tokio::test]
    async fn counter_tracks_unresolved_scopes_under_concurrency() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = StubFactory::default();
        let shared = Arc::clone(&factory.shared);
        let mgr = Arc::new(SessionManager::new(
            factory,
            test_cfg(tmp.path(), 60_000, 60_000),
        ));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let mgr = Arc::clone(&mgr);
            tasks.push(tokio::spawn(async move {
                mgr.with_session("alice", |_s| async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(())
                })
                .await
            }));
        }
        // Give every task a chance to enter its scope, then observe overlap.
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(mgr.active_count("alice").await >= 2);

        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(mgr.active_count("alice").await, 0);
        assert_eq!(shared.created.load(Ordering::SeqCst), 1);
        mgr.destroy().await;
    }

    #[tokio::test]
    async fn work_failure_still_decrements_exactly_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(StubFactory::default(), test_cfg(tmp.path(), 60_000, 60_000));

        let out: Result<()> = mgr
            .with_session("alice", |_s| async move {
                Err(Error::Extract("boom".to_string()))
            })
            .await;
        assert!(matches!(out, Err(Error::Extract(_))));
        assert_eq!(mgr.active_count("alice").await, 0);
        // The session survives a failed scope.
        assert_eq!(mgr.session_count().await, 1);
        mgr.destroy().await;
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted_and_their_storage_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = StubFactory::default();
        let shared = Arc::clone(&factory.shared);
        let mgr = SessionManager::new(factory, test_cfg(tmp.path(), 100, 25));

        let dir = mgr
            .with_session("alice", |s| async move { Ok(s.storage_dir().to_path_buf()) })
            .await
            .unwrap();
        assert!(dir.is_dir());
        assert_eq!(mgr.session_count().await, 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(mgr.session_count().await, 0);
        assert!(!dir.exists());
        let closed = shared.closed.lock().unwrap();
        assert!(closed[0].load(Ordering::SeqCst));
        drop(closed);
        mgr.destroy().await;
    }

    #[tokio::test]
    async fn busy_sessions_are_never_evicted() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = StubFactory::default();
        let shared = Arc::clone(&factory.shared);
        let mgr = Arc::new(SessionManager::new(factory, test_cfg(tmp.path(), 50, 10)));

        let worker = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move {
                mgr.with_session("alice", |_s| async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(())
                })
                .await
            })
        };

        // Well past the TTL, but the scope is still open.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(mgr.session_count().await, 1);
        assert_eq!(mgr.active_count("alice").await, 1);

        worker.await.unwrap().unwrap();
        // Once idle, the sliding TTL runs out and the session goes away.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(mgr.session_count().await, 0);
        assert_eq!(shared.created.load(Ordering::SeqCst), 1);
        mgr.destroy().await;
    }

    #[tokio::test]
    async fn access_re_arms_the_ttl() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = StubFactory::default();
        let shared = Arc::clone(&factory.shared);
        let mgr = SessionManager::new(factory, test_cfg(tmp.path(), 250, 25));

        for _ in 0..4 {
            mgr.with_session("alice", |_s| async move { Ok(()) })
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        // 4 * 100ms > TTL, but each access re-armed the expiry.
        assert_eq!(mgr.session_count().await, 1);
        assert_eq!(shared.created.load(Ordering::SeqCst), 1);
        mgr.destroy().await;
    }

    #[tokio::test]
    async fn creation_failure_propagates_and_registers_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = StubFactory::default();
        let shared = Arc::clone(&factory.shared);
        shared.fail_next.store(true, Ordering::SeqCst);
        let mgr = SessionManager::new(factory, test_cfg(tmp.path(), 60_000, 60_000));

        let out: Result<()> = mgr.with_session("alice", |_s| async move { Ok(()) }).await;
        assert!(matches!(out, Err(Error::Browser(_))));
        assert_eq!(mgr.session_count().await, 0);

        // The next attempt starts clean.
        mgr.with_session("alice", |_s| async move { Ok(()) })
            .await
            .unwrap();
        assert_eq!(mgr.session_count().await, 1);
        mgr.destroy().await;
    }

    #[tokio::test]
    async fn destroy_is_terminal_and_force_closes_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = StubFactory::default();
        let shared = Arc::clone(&factory.shared);
        let mgr = SessionManager::new(factory, test_cfg(tmp.path(), 60_000, 60_000));

        mgr.with_session("alice", |_s| async move { Ok(()) })
            .await
            .unwrap();
        mgr.with_session("bob", |_s| async move { Ok(()) })
            .await
            .unwrap();
        mgr.destroy().await;

        assert_eq!(mgr.session_count().await, 0);
        for closed in shared.closed.lock().unwrap().iter() {
            assert!(closed.load(Ordering::SeqCst));
        }
        let out: Result<()> = mgr.with_session("carol", |_s| async move { Ok(()) }).await;
        assert!(matches!(out, Err(Error::Session(_))));
    }

    #[tokio::test]
    async fn key_lock_registry_does_not_grow_unbounded() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(StubFactory::default(), test_cfg(tmp.path(), 60_000, 60_000));
        for i in 0..16 {
            let id = format!("user-{i}");
            mgr.with_session(&id, |_s| async move { Ok(()) }).await.unwrap();
        }
        assert_eq!(mgr.inner.locks.lock().await.len(), 0);
        mgr.destroy().await;
    }
}
