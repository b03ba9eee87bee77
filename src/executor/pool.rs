// Session pool with per-host and global bounds

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{Connector, Session};
use crate::inventory::Host;
use crate::output::errors::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_per_host: usize,
    pub max_global: usize,
    /// How long `acquire` may wait for both slots
    pub acquire_timeout: Duration,
    /// Idle sessions older than this are closed instead of reused
    pub idle_ttl: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_per_host: 1,
            max_global: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_ttl: Duration::from_secs(300),
        }
    }
}

/// Point-in-time pool occupancy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub in_use: usize,
    pub idle: usize,
    pub per_host: BTreeMap<String, usize>,
}

struct IdleSession {
    session: Box<dyn Session>,
    since: Instant,
}

struct HostSlot {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleSession>>,
}

/// Owns sessions and hands them out as leases.
///
/// A lease holds one per-host permit and one global permit. Permits are
/// taken in that order so a host waiting on itself never pins a global slot.
pub struct ConnectionPool {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    global: Arc<Semaphore>,
    hosts: DashMap<String, Arc<HostSlot>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        let config = PoolConfig {
            max_per_host: config.max_per_host.max(1),
            max_global: config.max_global.max(1),
            ..config
        };

        ConnectionPool {
            global: Arc::new(Semaphore::new(config.max_global)),
            config,
            connector,
            hosts: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn slot(&self, host: &str) -> Arc<HostSlot> {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(HostSlot {
                    permits: Arc::new(Semaphore::new(self.config.max_per_host)),
                    idle: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }

    /// Lease a session for `host`, reusing an idle one when possible
    pub async fn acquire(&self, host: &Host) -> Result<Lease, EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Cancelled);
        }

        let slot = self.slot(&host.name);
        let started = Instant::now();

        let permits = tokio::time::timeout(self.config.acquire_timeout, async {
            let host_permit = slot.permits.clone().acquire_owned().await?;
            let global_permit = self.global.clone().acquire_owned().await?;
            Ok::<_, tokio::sync::AcquireError>((host_permit, global_permit))
        })
        .await;

        let (host_permit, global_permit) = match permits {
            Ok(Ok(permits)) => permits,
            Ok(Err(_)) => return Err(EngineError::Cancelled),
            Err(_) => {
                return Err(EngineError::PoolExhausted {
                    host: host.name.clone(),
                    waited: started.elapsed(),
                })
            }
        };

        let (reused, expired) = self.take_idle(&slot);
        for stale in expired {
            stale.close().await;
        }

        let (session, reused) = match reused {
            Some(session) => {
                trace!(host = %host.name, "reusing pooled session");
                (session, true)
            }
            None => {
                debug!(host = %host.name, "establishing session");
                (self.connector.connect(host).await?, false)
            }
        };

        Ok(Lease {
            host: host.name.clone(),
            session,
            slot,
            reused,
            _host_permit: host_permit,
            _global_permit: global_permit,
        })
    }

    /// Pop the freshest usable idle session; also hand back the stale ones
    fn take_idle(&self, slot: &HostSlot) -> (Option<Box<dyn Session>>, Vec<Box<dyn Session>>) {
        let mut idle = slot.idle.lock();
        let mut expired = Vec::new();

        while let Some(entry) = idle.pop() {
            if entry.session.is_alive() && entry.since.elapsed() < self.config.idle_ttl {
                return (Some(entry.session), expired);
            }
            expired.push(entry.session);
        }

        (None, expired)
    }

    /// Return a healthy session for reuse
    pub async fn release(&self, lease: Lease) {
        let Lease {
            host,
            session,
            slot,
            _host_permit,
            _global_permit,
            ..
        } = lease;

        if self.closed.load(Ordering::Acquire) || !session.is_alive() {
            debug!(host = %host, "closing returned session");
            session.close().await;
            return;
        }

        slot.idle.lock().push(IdleSession {
            session,
            since: Instant::now(),
        });
        // permits drop here, after the session is visible to the next waiter
    }

    /// Discard a broken session; the next acquire builds a new one
    pub async fn invalidate(&self, lease: Lease) {
        debug!(host = %lease.host, "invalidating session");
        let Lease { session, .. } = lease;
        session.close().await;
    }

    /// Close idle sessions past their TTL. Returns how many were closed.
    pub async fn reap_expired(&self) -> usize {
        let ttl = self.config.idle_ttl;
        let mut expired = Vec::new();

        for entry in self.hosts.iter() {
            let mut idle = entry.value().idle.lock();
            let (keep, stale): (Vec<_>, Vec<_>) = idle
                .drain(..)
                .partition(|s| s.session.is_alive() && s.since.elapsed() < ttl);
            *idle = keep;
            expired.extend(stale.into_iter().map(|s| s.session));
        }

        let count = expired.len();
        for session in expired {
            session.close().await;
        }
        if count > 0 {
            debug!(count, "reaped expired sessions");
        }
        count
    }

    /// Close every idle session and stop pooling returned ones
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::Release);

        let mut sessions = Vec::new();
        for entry in self.hosts.iter() {
            sessions.extend(entry.value().idle.lock().drain(..).map(|s| s.session));
        }

        debug!(count = sessions.len(), "closing pool");
        for session in sessions {
            session.close().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            in_use: self.config.max_global - self.global.available_permits(),
            ..Default::default()
        };

        for entry in self.hosts.iter() {
            let slot = entry.value();
            let in_use = self.config.max_per_host - slot.permits.available_permits();
            stats.idle += slot.idle.lock().len();
            if in_use > 0 {
                stats.per_host.insert(entry.key().clone(), in_use);
            }
        }

        stats
    }
}

/// Exclusive use of one session.
///
/// Dropping a lease without handing it back to the pool discards the
/// session, the same as `ConnectionPool::invalidate`.
pub struct Lease {
    host: String,
    session: Box<dyn Session>,
    slot: Arc<HostSlot>,
    reused: bool,
    _host_permit: OwnedSemaphorePermit,
    _global_permit: OwnedSemaphorePermit,
}

impl Lease {
    pub fn session(&self) -> &dyn Session {
        self.session.as_ref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether the session came from the idle list
    pub fn is_reused(&self) -> bool {
        self.reused
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("host", &self.host)
            .field("reused", &self.reused)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CommandResult;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counters {
        connects: AtomicUsize,
        closes: AtomicUsize,
    }

    struct FakeSession {
        host: String,
        counters: Arc<Counters>,
        alive: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Session for FakeSession {
        async fn exec(&self, _cmd: &str) -> Result<CommandResult, EngineError> {
            Ok(CommandResult::default())
        }

        fn host_name(&self) -> &str {
            &self.host
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeConnector {
        counters: Arc<Counters>,
        alive: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, host: &Host) -> Result<Box<dyn Session>, EngineError> {
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeSession {
                host: host.name.clone(),
                counters: self.counters.clone(),
                alive: self.alive.clone(),
            }))
        }
    }

    fn pool(config: PoolConfig) -> (Arc<ConnectionPool>, Arc<Counters>, Arc<AtomicBool>) {
        let counters = Arc::new(Counters::default());
        let alive = Arc::new(AtomicBool::new(true));
        let connector = Arc::new(FakeConnector {
            counters: counters.clone(),
            alive: alive.clone(),
        });
        (
            Arc::new(ConnectionPool::new(config, connector)),
            counters,
            alive,
        )
    }

    #[tokio::test]
    async fn test_release_reuses_session() {
        let (pool, counters, _) = pool(PoolConfig::default());
        let host = Host::new("web1");

        let lease = pool.acquire(&host).await.unwrap();
        assert!(!lease.is_reused());
        pool.release(lease).await;

        let lease = pool.acquire(&host).await.unwrap();
        assert!(lease.is_reused());
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_and_drop_discard_session() {
        let (pool, counters, _) = pool(PoolConfig::default());
        let host = Host::new("web1");

        let lease = pool.acquire(&host).await.unwrap();
        pool.invalidate(lease).await;
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);

        let lease = pool.acquire(&host).await.unwrap();
        assert!(!lease.is_reused());
        drop(lease);

        let lease = pool.acquire(&host).await.unwrap();
        assert!(!lease.is_reused());
        assert_eq!(counters.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_dead_session_not_reused() {
        let (pool, counters, alive) = pool(PoolConfig::default());
        let host = Host::new("web1");

        let lease = pool.acquire(&host).await.unwrap();
        pool.release(lease).await;
        alive.store(false, Ordering::SeqCst);

        let lease = pool.acquire(&host).await.unwrap();
        assert!(!lease.is_reused());
        assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_host_busy() {
        let config = PoolConfig {
            acquire_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (pool, _, _) = pool(config);
        let host = Host::new("db1");

        let _held = pool.acquire(&host).await.unwrap();
        let err = pool.acquire(&host).await.unwrap_err();
        match err {
            EngineError::PoolExhausted { host, waited } => {
                assert_eq!(host, "db1");
                assert!(waited >= Duration::from_millis(50));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_ttl_expires_sessions() {
        let config = PoolConfig {
            idle_ttl: Duration::from_secs(10),
            ..Default::default()
        };
        let (pool, counters, _) = pool(config);
        let host = Host::new("web1");

        let lease = pool.acquire(&host).await.unwrap();
        pool.release(lease).await;
        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(pool.reap_expired().await, 1);
        assert_eq!(pool.stats().idle, 0);

        let lease = pool.acquire(&host).await.unwrap();
        assert!(!lease.is_reused());
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_all_stops_pooling() {
        let (pool, counters, _) = pool(PoolConfig::default());
        let web = Host::new("web1");
        let db = Host::new("db1");

        let idle = pool.acquire(&web).await.unwrap();
        pool.release(idle).await;
        let outstanding = pool.acquire(&db).await.unwrap();

        pool.close_all().await;
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);

        pool.release(outstanding).await;
        assert_eq!(counters.closes.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().idle, 0);
        assert!(matches!(
            pool.acquire(&web).await,
            Err(EngineError::Cancelled)
        ));
    }

    async fn fence(pool: Arc<ConnectionPool>, hosts: Vec<Host>, units: usize) -> (usize, usize) {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let per_host_peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..units {
            let pool = pool.clone();
            let host = hosts[i % hosts.len()].clone();
            let current = current.clone();
            let peak = peak.clone();
            let per_host_peak = per_host_peak.clone();

            handles.push(tokio::spawn(async move {
                let lease = pool.acquire(&host).await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let stats = pool.stats();
                let on_host = stats.per_host.get(&host.name).copied().unwrap_or(0);
                per_host_peak.fetch_max(on_host, Ordering::SeqCst);

                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                pool.release(lease).await;
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        (
            peak.load(Ordering::SeqCst),
            per_host_peak.load(Ordering::SeqCst),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_per_host_bound_under_load() {
        let config = PoolConfig {
            max_per_host: 2,
            max_global: 10,
            ..Default::default()
        };
        let (pool, counters, _) = pool(config);

        let (peak, per_host) = fence(pool.clone(), vec![Host::new("web1")], 20).await;
        assert!(peak <= 2);
        assert!(per_host <= 2);
        assert!(counters.connects.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_global_bound_under_load() {
        let config = PoolConfig {
            max_per_host: 2,
            max_global: 3,
            ..Default::default()
        };
        let (pool, _, _) = pool(config);
        let hosts = (0..6).map(|i| Host::new(format!("node{i}"))).collect();

        let (peak, per_host) = fence(pool.clone(), hosts, 30).await;
        assert!(peak <= 3);
        assert!(per_host <= 2);
        assert_eq!(pool.stats().in_use, 0);
    }
}
