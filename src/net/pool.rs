use crate::net::connector::{ConnectOptions, ConnectionId, Connector, PooledSocket};
use crate::net::destination::{normalize, NormalizedKey};
use crate::net::reactor::{Reactor, WatcherId};
use crate::utils::error::{Result, SockPoolError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Configuration for connection pool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    /// How long a checked-in connection may sit unused before it is closed (milliseconds)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Passed through to the connector on every new connection
    #[serde(default)]
    pub connect: ConnectOptions,
}

fn default_idle_timeout_ms() -> u64 {
    10_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            connect: ConnectOptions::default(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// One live pooled connection.
///
/// The pool holds `socket` only while the connection is available; a checked-out socket
/// belongs to the caller.
struct ConnectionRecord<S> {
    id: ConnectionId,
    key: NormalizedKey,
    socket: Option<S>,
    available: bool,
    idle_watcher: Option<WatcherId>,
}

struct PoolState<S> {
    by_destination: HashMap<NormalizedKey, Vec<ConnectionRecord<S>>>,
    by_id: HashMap<ConnectionId, NormalizedKey>,
    /// Connections currently being opened, not yet recorded.
    pending: HashMap<NormalizedKey, usize>,
}

impl<S> Default for PoolState<S> {
    fn default() -> Self {
        Self {
            by_destination: HashMap::new(),
            by_id: HashMap::new(),
            pending: HashMap::new(),
        }
    }
}

fn lock_state<S>(state: &Mutex<PoolState<S>>) -> MutexGuard<'_, PoolState<S>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counts one in-flight connect attempt for as long as it lives.
struct PendingGuard<'a, S> {
    state: &'a Mutex<PoolState<S>>,
    key: NormalizedKey,
}

impl<'a, S> PendingGuard<'a, S> {
    fn acquire(state: &'a Mutex<PoolState<S>>, key: NormalizedKey) -> Self {
        *lock_state(state).pending.entry(key.clone()).or_insert(0) += 1;
        Self { state, key }
    }
}

impl<S> Drop for PendingGuard<'_, S> {
    fn drop(&mut self) {
        let mut state = lock_state(self.state);
        if let Some(count) = state.pending.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                state.pending.remove(&self.key);
            }
        }
    }
}

struct PoolInner<C: Connector> {
    connector: C,
    reactor: Reactor,
    config: PoolConfig,
    state: Mutex<PoolState<C::Connection>>,
    opened: AtomicU64,
}

impl<C: Connector> PoolInner<C> {
    /// Claim the first live idle connection for `key`, clearing dead ones on the way.
    /// Never suspends, so concurrent checkouts cannot both miss an idle connection.
    fn claim_idle(&self, key: &NormalizedKey) -> Option<C::Connection> {
        let mut state = lock_state(&self.state);
        loop {
            let records = state.by_destination.get_mut(key)?;
            let record = records.iter_mut().find(|record| record.available)?;

            if record.socket.as_ref().is_some_and(|socket| socket.is_alive()) {
                record.available = false;
                if let Some(watcher) = record.idle_watcher {
                    self.reactor.disable(watcher);
                }
                return record.socket.take();
            }

            let id = record.id;
            warn!("Discarding pooled connection {} to {}: peer closed", id, key);
            self.clear_locked(&mut state, id);
        }
    }

    async fn originate(
        &self,
        key: NormalizedKey,
        cancel: Option<&CancellationToken>,
    ) -> Result<C::Connection> {
        let token = cancel.cloned().unwrap_or_else(CancellationToken::new);
        let pending = PendingGuard::acquire(&self.state, key.clone());

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(SockPoolError::Cancelled),
            result = self.connector.connect(&key, &self.config.connect, &token) => {
                result.map_err(SockPoolError::Connector)
            }
        };
        drop(pending);

        let socket = outcome.inspect_err(|e| debug!("Connect to {} failed: {}", key, e))?;
        self.register(key, &socket);
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(socket)
    }

    fn register(&self, key: NormalizedKey, socket: &C::Connection) {
        let id = socket.id();
        let mut state = lock_state(&self.state);

        if state.by_id.contains_key(&id) {
            // The descriptor was reused after a caller dropped a checked-out socket
            // without checkin or clear.
            warn!("Connection id {} is still tracked; clearing stale record", id);
            self.clear_locked(&mut state, id);
        }

        state.by_id.insert(id, key.clone());
        let records = state.by_destination.entry(key.clone()).or_default();
        records.push(ConnectionRecord {
            id,
            key,
            socket: None,
            available: false,
            idle_watcher: None,
        });
        trace!("Registered connection {} ({} for destination)", id, records.len());
    }

    fn clear_locked(
        &self,
        state: &mut PoolState<C::Connection>,
        id: ConnectionId,
    ) -> Option<ConnectionRecord<C::Connection>> {
        let key = state.by_id.remove(&id)?;
        let Some(records) = state.by_destination.get_mut(&key) else {
            error!("Connection {} indexed under {} but not recorded", id, key);
            return None;
        };
        let Some(pos) = records.iter().position(|record| record.id == id) else {
            error!("Connection {} indexed under {} but not recorded", id, key);
            return None;
        };

        let record = records.remove(pos);
        if records.is_empty() {
            state.by_destination.remove(&key);
        }
        if let Some(watcher) = record.idle_watcher {
            self.reactor.cancel(watcher);
        }
        Some(record)
    }

    /// Idle timer callback. Between the timer firing and this call a checkout may have
    /// claimed the record, and a checkin may have re-armed `watcher`; both leave the
    /// connection alone.
    fn expire(&self, id: ConnectionId, watcher: WatcherId) {
        let mut state = lock_state(&self.state);
        let idle = state
            .by_id
            .get(&id)
            .and_then(|key| state.by_destination.get(key))
            .and_then(|records| records.iter().find(|record| record.id == id))
            .is_some_and(|record| record.available && record.idle_watcher == Some(watcher));

        if idle && !self.reactor.is_enabled(watcher) {
            if let Some(record) = self.clear_locked(&mut state, id) {
                debug!("Closed idle connection {} to {}", id, record.key);
            }
        } else {
            trace!("Idle timer for {} fired after checkout, ignoring", id);
        }
    }
}

impl<C: Connector> Drop for PoolInner<C> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for record in state.by_destination.values().flatten() {
            if let Some(watcher) = record.idle_watcher {
                self.reactor.cancel(watcher);
            }
        }
    }
}

/// Client-side socket pool keyed by normalized destination.
///
/// Cloning is cheap and every clone shares the same state.
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Create a new connection pool with the given configuration
    pub fn new(connector: C, reactor: Reactor, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                reactor,
                config,
                state: Mutex::new(PoolState::default()),
                opened: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    /// Get an idle connection to `uri` or open a new one.
    ///
    /// The reuse decision is made before the first suspension point. An already
    /// cancelled `cancel` fails immediately without touching pool state.
    pub async fn checkout(
        &self,
        uri: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<C::Connection> {
        if cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(SockPoolError::Cancelled);
        }

        let key = normalize(uri)?;

        if let Some(socket) = self.inner.claim_idle(&key) {
            trace!("Reusing pooled connection {} to {}", socket.id(), key);
            return Ok(socket);
        }

        debug!("Pool miss for {}, creating new connection", key);
        self.inner.originate(key, cancel).await
    }

    /// Return a connection to the pool and start its idle timer. A connection whose peer
    /// has gone away is cleared instead.
    pub fn checkin(&self, socket: C::Connection) -> Result<()> {
        let id = socket.id();
        let mut state = lock_state(&self.inner.state);

        let Some(key) = state.by_id.get(&id).cloned() else {
            error!("Checkin of connection {} that this pool does not own", id);
            return Err(SockPoolError::UnknownHandle(id));
        };

        if !socket.is_alive() {
            debug!("Connection {} to {} closed by peer, clearing", id, key);
            self.inner.clear_locked(&mut state, id);
            return Ok(());
        }

        let Some(record) = state
            .by_destination
            .get_mut(&key)
            .and_then(|records| records.iter_mut().find(|record| record.id == id))
        else {
            error!("Connection {} indexed under {} but not recorded", id, key);
            return Err(SockPoolError::UnknownHandle(id));
        };

        record.available = true;
        record.socket = Some(socket);
        let watcher = match record.idle_watcher {
            Some(watcher) => {
                self.inner.reactor.enable(watcher);
                watcher
            }
            None => {
                let watcher = self.arm_idle_timer(id);
                record.idle_watcher = Some(watcher);
                watcher
            }
        };
        // Idle connections alone must not keep the process running.
        self.inner.reactor.unreference(watcher);

        trace!("Returned connection {} to pool for {}", id, key);
        Ok(())
    }

    fn arm_idle_timer(&self, id: ConnectionId) -> WatcherId {
        let pool = Arc::downgrade(&self.inner);
        self.inner
            .reactor
            .delay(self.inner.config.idle_timeout(), move |watcher| {
                if let Some(inner) = pool.upgrade() {
                    inner.expire(id, watcher);
                }
            })
    }

    /// Remove a connection from the pool for good. An idle socket held by the pool is
    /// closed; a checked-out one stays with the caller.
    pub fn clear(&self, id: ConnectionId) -> Result<()> {
        let mut state = lock_state(&self.inner.state);
        match self.inner.clear_locked(&mut state, id) {
            Some(record) => {
                debug!("Cleared connection {} to {}", id, record.key);
                Ok(())
            }
            None => {
                error!("Clear of connection {} that this pool does not own", id);
                Err(SockPoolError::UnknownHandle(id))
            }
        }
    }

    /// [`clear`](Self::clear) for a checked-out socket, closing it.
    pub fn discard(&self, socket: C::Connection) -> Result<()> {
        self.clear(socket.id())
    }

    /// In-flight connect attempts for `key`.
    pub fn pending(&self, key: &NormalizedKey) -> usize {
        lock_state(&self.inner.state)
            .pending
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = lock_state(&self.inner.state);
        let (idle, in_use) = state
            .by_destination
            .values()
            .flatten()
            .fold((0, 0), |(idle, in_use), record| {
                if record.available {
                    (idle + 1, in_use)
                } else {
                    (idle, in_use + 1)
                }
            });

        PoolStats {
            idle,
            in_use,
            destinations: state.by_destination.len(),
            pending: state.pending.values().sum(),
            opened: self.inner.opened.load(Ordering::Relaxed),
        }
    }
}

/// Statistics about the connection pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections waiting in the pool
    pub idle: usize,
    /// Connections checked out by callers
    pub in_use: usize,
    /// Destinations with at least one recorded connection
    pub destinations: usize,
    /// Connect attempts in flight
    pub pending: usize,
    /// Connections opened over the pool's lifetime
    pub opened: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connector::SocketConnector;
    use tokio::net::TcpListener;

    fn pool(config: PoolConfig) -> ConnectionPool<SocketConnector> {
        ConnectionPool::new(SocketConnector, Reactor::new(), config)
    }

    #[tokio::test]
    async fn pool_creation_with_defaults() {
        let pool = pool(PoolConfig::default());
        assert_eq!(pool.stats(), PoolStats::default());
        assert_eq!(pool.config().idle_timeout(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn pool_reuses_connections() {
        let pool = pool(PoolConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("tcp://{}", listener.local_addr().unwrap());

        let pool_clone = pool.clone();
        let uri_clone = uri.clone();
        let conn_task = tokio::spawn(async move { pool_clone.checkout(&uri_clone, None).await });
        let (_server, _) = listener.accept().await.unwrap();
        let socket = conn_task.await.unwrap().unwrap();
        let id = socket.id();

        pool.checkin(socket).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.destinations, 1);

        // No accept needed: the idle connection comes back without dialing.
        let socket = pool.checkout(&uri, None).await.unwrap();
        assert_eq!(socket.id(), id);
        assert_eq!(pool.stats().opened, 1);
        assert_eq!(pool.stats().in_use, 1);
    }

    #[tokio::test]
    async fn connection_timeout_is_a_connector_failure() {
        let pool = pool(PoolConfig {
            connect: ConnectOptions {
                connect_timeout_ms: 100, // Very short timeout
                ..Default::default()
            },
            ..Default::default()
        });

        // TEST-NET-1 (non-routable). Hosts without a route fail fast instead.
        let started = std::time::Instant::now();
        let result = pool.checkout("tcp://192.0.2.1:9999", None).await;
        match result {
            Err(SockPoolError::Connector(_)) => {}
            other => panic!("expected connector failure, got {:?}", other.map(|s| s.id())),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(pool.stats().pending, 0);
        assert_eq!(pool.stats().destinations, 0);
    }

    fn idle_watcher(pool: &ConnectionPool<SocketConnector>, id: ConnectionId) -> WatcherId {
        lock_state(&pool.inner.state)
            .by_destination
            .values()
            .flatten()
            .find(|record| record.id == id)
            .and_then(|record| record.idle_watcher)
            .unwrap()
    }

    #[tokio::test]
    async fn late_expiry_spares_a_rearmed_connection() {
        let pool = pool(PoolConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("tcp://{}", listener.local_addr().unwrap());

        let socket = pool.checkout(&uri, None).await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();
        let id = socket.id();
        pool.checkin(socket).unwrap();
        let watcher = idle_watcher(&pool, id);

        // Timer fired, then a checkout and checkin re-armed it before the callback ran.
        let socket = pool.checkout(&uri, None).await.unwrap();
        pool.checkin(socket).unwrap();
        assert!(pool.reactor().is_enabled(watcher));
        pool.inner.expire(id, watcher);
        assert_eq!(pool.stats().idle, 1);

        // An expiry for a watcher that has fired and stayed disarmed clears the record.
        pool.reactor().disable(watcher);
        pool.inner.expire(id, watcher);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().destinations, 0);
    }

    #[tokio::test]
    async fn invalid_destination_fails_before_touching_state() {
        let pool = pool(PoolConfig::default());
        let result = pool.checkout("tcp://example.com:80/index.html", None).await;
        assert!(matches!(result, Err(SockPoolError::InvalidDestination { .. })));
        assert_eq!(pool.stats(), PoolStats::default());
    }
}
