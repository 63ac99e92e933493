//! Reusable multiplexed transports keyed by (host, port, user, identity).
//!
//! Concurrent `acquire` calls for the same key are serialized by a per-key
//! reservation, so a key is opened at most once at a time. The whole-pool
//! mutexes only guard in-memory maps and are never held across I/O.

use crate::executor::{Multiplexer, Transport};
use crate::models::HostSpec;
use crate::repository::PoolStore;
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to open transport to {destination}: {reason}")]
    Open { destination: String, reason: String },

    #[error("Timed out talking to {0}")]
    Timeout(String),

    #[error("Failed to close transport {key}: {reason}")]
    Close { key: String, reason: String },

    #[error("Pool store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PooledConnection {
    pub key: String,
    pub destination: String,
    pub control_path: PathBuf,
    pub created_at: i64,
    pub last_used_at: i64,
    pub use_count: u64,
}

/// Deterministic key for a connection tuple, short enough for socket paths.
pub fn connection_key(host: &HostSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(host.user.as_bytes());
    hasher.update([0]);
    hasher.update(host.hostname.as_bytes());
    hasher.update([0]);
    hasher.update(host.port.to_be_bytes());
    hasher.update([0]);
    hasher.update(host.identity.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    store: Arc<dyn PoolStore>,
    mux: Arc<dyn Multiplexer>,
    control_dir: PathBuf,
    max_size: usize,
    max_age: Duration,
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    leases: Mutex<HashMap<String, usize>>,
    clock: AtomicI64,
}

/// A borrowed pool entry. Dropping it returns the borrow; the transport stays open.
pub struct PoolLease {
    inner: Arc<PoolInner>,
    conn: PooledConnection,
}

impl PoolLease {
    pub fn connection(&self) -> &PooledConnection {
        &self.conn
    }

    pub fn transport(&self) -> Transport {
        Transport::Multiplexed {
            control_path: self.conn.control_path.clone(),
        }
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        let mut leases = lock(&self.inner.leases);
        if let Some(count) = leases.get_mut(&self.conn.key) {
            *count -= 1;
            if *count == 0 {
                leases.remove(&self.conn.key);
            }
        }
    }
}

impl ConnectionPool {
    pub fn new(
        store: Arc<dyn PoolStore>,
        mux: Arc<dyn Multiplexer>,
        control_dir: impl Into<PathBuf>,
        max_size: usize,
        max_age: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                store,
                mux,
                control_dir: control_dir.into(),
                max_size: max_size.max(1),
                max_age,
                slots: Mutex::new(HashMap::new()),
                leases: Mutex::new(HashMap::new()),
                clock: AtomicI64::new(0),
            }),
        }
    }

    pub async fn acquire(
        &self,
        host: &HostSpec,
        identity: &Path,
    ) -> Result<PoolLease, ConnectionError> {
        let inner = &self.inner;
        let key = connection_key(host);
        let slot = inner.slot(&key);

        // The lease is taken under the reservation so eviction never sees the
        // entry both unreserved and unleased.
        let leased = {
            let _reservation = slot.lock().await;
            self.reuse_or_open(host, identity, &key).await
        };
        drop(slot);
        inner.prune_slot(&key);
        let lease = leased?;

        self.enforce_bound().await;
        Ok(lease)
    }

    /// Must be called with the key's reservation held.
    async fn reuse_or_open(
        &self,
        host: &HostSpec,
        identity: &Path,
        key: &str,
    ) -> Result<PoolLease, ConnectionError> {
        let inner = &self.inner;
        let existing = inner.store.get(key).await?;
        let reusable = match &existing {
            Some(conn) => inner.is_fresh(conn) && inner.mux.check(conn).await,
            None => false,
        };

        match existing {
            Some(mut conn) if reusable => {
                conn.last_used_at = inner.tick();
                conn.use_count += 1;
                inner.store.put(&conn).await?;
                tracing::debug!(key = %key, uses = conn.use_count, "reusing transport");
                Ok(inner.lease(conn))
            }
            stale => {
                if let Some(stale) = stale {
                    tracing::info!(key = %key, "replacing stale transport");
                    inner.discard(&stale).await;
                }
                let control_path = inner.control_dir.join(format!("{key}.sock"));
                inner.mux.open(host, identity, &control_path).await?;
                let now = inner.tick();
                let conn = PooledConnection {
                    key: key.to_string(),
                    destination: host.destination(),
                    control_path,
                    created_at: now,
                    last_used_at: now,
                    use_count: 1,
                };
                inner.store.put(&conn).await?;
                Ok(inner.lease(conn))
            }
        }
    }

    /// Closes and forgets one entry. Returns whether it existed.
    pub async fn evict(&self, key: &str) -> Result<bool, ConnectionError> {
        let slot = self.inner.slot(key);
        let existed = {
            let _reservation = slot.lock().await;
            let found = self.inner.store.get(key).await;
            if let Ok(Some(conn)) = &found {
                self.inner.discard(conn).await;
            }
            found.map(|conn| conn.is_some())
        };
        drop(slot);
        self.inner.prune_slot(key);
        existed
    }

    /// Best-effort teardown of every transport.
    pub async fn evict_all(&self) -> Result<usize, ConnectionError> {
        let entries = self.inner.store.list().await?;
        let count = entries.len();
        for conn in &entries {
            self.inner.discard(conn).await;
            self.inner.prune_slot(&conn.key);
        }
        tracing::info!(count, "evicted all pooled transports");
        Ok(count)
    }

    pub async fn list(&self) -> Result<Vec<PooledConnection>, ConnectionError> {
        self.inner.store.list().await
    }

    /// Drops least-recently-used entries beyond `max_size`, skipping borrowed
    /// or reserved ones, so the bound can be exceeded while all are in use.
    async fn enforce_bound(&self) {
        let inner = &self.inner;
        let mut entries = match inner.store.list().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("could not list pool entries: {}", e);
                return;
            }
        };
        if entries.len() <= inner.max_size {
            return;
        }

        entries.sort_by_key(|conn| conn.last_used_at);
        let mut excess = entries.len() - inner.max_size;
        for conn in entries {
            if excess == 0 {
                break;
            }
            let slot = inner.slot(&conn.key);
            let evicted = match slot.try_lock() {
                // Leases are only taken under the reservation, so this cannot go stale.
                Ok(_reservation) if !inner.is_leased(&conn.key) => {
                    tracing::debug!(key = %conn.key, "evicting least recently used transport");
                    inner.discard(&conn).await;
                    true
                }
                _ => false,
            };
            drop(slot);
            inner.prune_slot(&conn.key);
            if evicted {
                excess -= 1;
            }
        }
    }
}

impl PoolInner {
    fn slot(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.slots).entry(key.to_string()).or_default().clone()
    }

    /// Forgets a slot nobody holds or waits on. Cloning and pruning both
    /// happen under the map lock, so a holder's slot is never replaced.
    fn prune_slot(&self, key: &str) {
        let mut slots = lock(&self.slots);
        if slots.get(key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(key);
        }
    }

    fn lease(self: &Arc<Self>, conn: PooledConnection) -> PoolLease {
        *lock(&self.leases).entry(conn.key.clone()).or_insert(0) += 1;
        PoolLease {
            inner: self.clone(),
            conn,
        }
    }

    fn is_leased(&self, key: &str) -> bool {
        lock(&self.leases).contains_key(key)
    }

    fn is_fresh(&self, conn: &PooledConnection) -> bool {
        let age_ms = Utc::now().timestamp_millis() - conn.created_at;
        age_ms < self.max_age.as_millis() as i64
    }

    /// Millisecond timestamps that never repeat within this process, so LRU order is total.
    fn tick(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let prev = self
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            })
            .unwrap_or(now);
        now.max(prev + 1)
    }

    async fn discard(&self, conn: &PooledConnection) {
        if let Err(e) = self.mux.close(conn).await {
            tracing::warn!(key = %conn.key, "failed to close transport: {}", e);
        }
        if let Err(e) = self.store.remove(&conn.key).await {
            tracing::warn!(key = %conn.key, "failed to remove pool entry: {}", e);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MemoryPoolStore, SqlitePoolStore, establish_connection};
    use crate::services::test_support::{FakeMultiplexer, host};
    use std::time::Instant;

    fn pool(mux: Arc<FakeMultiplexer>, max_size: usize) -> ConnectionPool {
        ConnectionPool::new(
            Arc::new(MemoryPoolStore::new()),
            mux,
            "/run/relay",
            max_size,
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn keys_are_deterministic_and_tuple_sensitive() {
        let a = host("a");
        assert_eq!(connection_key(&a), connection_key(&a.clone()));
        assert_eq!(connection_key(&a).len(), 16);

        let mut other_port = a.clone();
        other_port.port = 2222;
        let mut other_identity = a.clone();
        other_identity.identity = "other".to_string();
        assert_ne!(connection_key(&a), connection_key(&other_port));
        assert_ne!(connection_key(&a), connection_key(&other_identity));
    }

    #[tokio::test]
    async fn reuses_a_live_transport() {
        let mux = Arc::new(FakeMultiplexer::default());
        let pool = pool(mux.clone(), 4);

        let first = pool.acquire(&host("a"), Path::new("/k")).await.unwrap();
        let first_path = first.connection().control_path.clone();
        drop(first);
        let second = pool.acquire(&host("a"), Path::new("/k")).await.unwrap();

        assert_eq!(second.connection().control_path, first_path);
        assert_eq!(second.connection().use_count, 2);
        assert_eq!(mux.opens(), 1);
        assert_eq!(mux.checks(), 1);
    }

    #[tokio::test]
    async fn concurrent_acquires_for_one_key_open_once() {
        let mux = Arc::new(FakeMultiplexer::with_open_delay(Duration::from_millis(50)));
        let pool = pool(mux.clone(), 4);

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    let lease = pool.acquire(&host("a"), Path::new("/k")).await.unwrap();
                    lease.connection().control_path.clone()
                })
            })
            .collect();

        let mut paths = Vec::new();
        for task in tasks {
            paths.push(task.await.unwrap());
        }
        paths.dedup();

        assert_eq!(paths.len(), 1);
        assert_eq!(mux.opens(), 1);
        assert_eq!(mux.live(), 1);
        assert_eq!(pool.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn different_keys_open_in_parallel() {
        let mux = Arc::new(FakeMultiplexer::with_open_delay(Duration::from_millis(200)));
        let pool = pool(mux.clone(), 10);

        let started = Instant::now();
        let tasks: Vec<_> = ["a", "b", "c", "d", "e"]
            .into_iter()
            .map(|name| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    pool.acquire(&host(name), Path::new("/k")).await.map(|_| ())
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(mux.opens(), 5);
        assert!(started.elapsed() < Duration::from_millis(800));
    }

    #[tokio::test]
    async fn destroyed_transport_is_replaced_transparently() {
        let mux = Arc::new(FakeMultiplexer::default());
        let pool = pool(mux.clone(), 4);

        let lease = pool.acquire(&host("a"), Path::new("/k")).await.unwrap();
        let path = lease.connection().control_path.clone();
        drop(lease);
        mux.destroy(&path);

        let lease = pool.acquire(&host("a"), Path::new("/k")).await.unwrap();
        assert_eq!(lease.connection().use_count, 1);
        assert_eq!(mux.opens(), 2);
        assert_eq!(mux.closes(), 1);
        assert_eq!(mux.live(), 1);
    }

    #[tokio::test]
    async fn aged_entries_are_recreated_without_probing() {
        let mux = Arc::new(FakeMultiplexer::default());
        let pool = ConnectionPool::new(
            Arc::new(MemoryPoolStore::new()),
            mux.clone(),
            "/run/relay",
            4,
            Duration::ZERO,
        );

        drop(pool.acquire(&host("a"), Path::new("/k")).await.unwrap());
        drop(pool.acquire(&host("a"), Path::new("/k")).await.unwrap());

        assert_eq!(mux.checks(), 0);
        assert_eq!(mux.opens(), 2);
    }

    #[tokio::test]
    async fn lru_entry_is_evicted_past_the_bound() {
        let mux = Arc::new(FakeMultiplexer::default());
        let pool = pool(mux.clone(), 2);

        let a = pool.acquire(&host("a"), Path::new("/k")).await.unwrap();
        let a_key = a.connection().key.clone();
        drop(a);
        drop(pool.acquire(&host("b"), Path::new("/k")).await.unwrap());
        drop(pool.acquire(&host("c"), Path::new("/k")).await.unwrap());

        let keys: Vec<String> = pool.list().await.unwrap().into_iter().map(|c| c.key).collect();
        assert_eq!(keys.len(), 2);
        assert!(!keys.contains(&a_key));
        assert_eq!(mux.closes(), 1);
        assert_eq!(mux.checks(), 0);

        // B is still pooled and only needs a liveness probe; A must be reopened.
        drop(pool.acquire(&host("b"), Path::new("/k")).await.unwrap());
        assert_eq!(mux.checks(), 1);
        assert_eq!(mux.opens(), 3);
        drop(pool.acquire(&host("a"), Path::new("/k")).await.unwrap());
        assert_eq!(mux.checks(), 1);
        assert_eq!(mux.opens(), 4);
    }

    #[tokio::test]
    async fn borrowed_entries_survive_eviction() {
        let mux = Arc::new(FakeMultiplexer::default());
        let pool = pool(mux.clone(), 1);

        let a = pool.acquire(&host("a"), Path::new("/k")).await.unwrap();
        let b = pool.acquire(&host("b"), Path::new("/k")).await.unwrap();

        assert_eq!(pool.list().await.unwrap().len(), 2);
        assert_eq!(mux.closes(), 0);

        drop(a);
        drop(b);
        drop(pool.acquire(&host("c"), Path::new("/k")).await.unwrap());
        assert_eq!(pool.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn evict_all_closes_everything_even_when_close_fails() {
        let mux = Arc::new(FakeMultiplexer::default());
        let pool = pool(mux.clone(), 4);
        for name in ["a", "b", "c"] {
            drop(pool.acquire(&host(name), Path::new("/k")).await.unwrap());
        }
        mux.fail_closes();

        assert_eq!(pool.evict_all().await.unwrap(), 3);
        assert!(pool.list().await.unwrap().is_empty());
        assert_eq!(mux.closes(), 3);
    }

    #[tokio::test]
    async fn evict_single_key() {
        let mux = Arc::new(FakeMultiplexer::default());
        let pool = pool(mux.clone(), 4);
        let key = pool
            .acquire(&host("a"), Path::new("/k"))
            .await
            .unwrap()
            .connection()
            .key
            .clone();

        assert!(pool.evict(&key).await.unwrap());
        assert!(!pool.evict(&key).await.unwrap());
        assert_eq!(mux.live(), 0);
    }

    #[tokio::test]
    async fn failed_open_surfaces_connection_error() {
        let mux = Arc::new(FakeMultiplexer::default());
        mux.fail_opens();
        let pool = pool(mux.clone(), 4);

        let result = pool.acquire(&host("a"), Path::new("/k")).await;
        assert!(matches!(result, Err(ConnectionError::Open { .. })));
        assert!(pool.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pools_sharing_a_store_reuse_each_others_transports() {
        let db = establish_connection("sqlite::memory:").await.unwrap();
        let mux = Arc::new(FakeMultiplexer::default());
        let worker_a = ConnectionPool::new(
            Arc::new(SqlitePoolStore::new(db.clone())),
            mux.clone(),
            "/run/relay",
            4,
            Duration::from_secs(3600),
        );
        let worker_b = ConnectionPool::new(
            Arc::new(SqlitePoolStore::new(db)),
            mux.clone(),
            "/run/relay",
            4,
            Duration::from_secs(3600),
        );

        drop(worker_a.acquire(&host("a"), Path::new("/k")).await.unwrap());
        let lease = worker_b.acquire(&host("a"), Path::new("/k")).await.unwrap();

        assert_eq!(mux.opens(), 1);
        assert_eq!(lease.connection().use_count, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn held_leases_are_never_evicted() {
        let mux = Arc::new(FakeMultiplexer::default());
        let pool = pool(mux.clone(), 1);

        let tasks: Vec<_> = (0..8)
            .map(|n| {
                let pool = pool.clone();
                let mux = mux.clone();
                tokio::spawn(async move {
                    for round in 0..25 {
                        let name = ["a", "b", "c"][(n + round) % 3];
                        let lease = pool.acquire(&host(name), Path::new("/k")).await.unwrap();
                        tokio::task::yield_now().await;
                        assert!(mux.is_live(&lease.connection().control_path));
                        assert!(pool.inner.is_leased(&lease.connection().key));
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(pool.list().await.unwrap().len() <= 3);
    }

    #[tokio::test]
    async fn reservation_slots_are_forgotten_once_unused() {
        let mux = Arc::new(FakeMultiplexer::default());
        let pool = pool(mux.clone(), 2);

        for name in ["a", "b", "c", "d"] {
            drop(pool.acquire(&host(name), Path::new("/k")).await.unwrap());
        }
        assert!(lock(&pool.inner.slots).is_empty());

        let key = pool.list().await.unwrap()[0].key.clone();
        assert!(pool.evict(&key).await.unwrap());
        for _ in 0..100 {
            assert!(!pool.evict("0123456789abcdef").await.unwrap());
        }
        assert!(lock(&pool.inner.slots).is_empty());

        let held = pool.acquire(&host("e"), Path::new("/k")).await.unwrap();
        pool.evict_all().await.unwrap();
        assert!(lock(&pool.inner.slots).is_empty());
        drop(held);
    }
}
