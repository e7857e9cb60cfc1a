#![allow(dead_code)]

use sockpool::{
    ConnectOptions, ConnectionId, ConnectionPool, Connector, NormalizedKey, PoolConfig,
    PooledSocket, Reactor,
};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// In-memory connection whose liveness the test controls.
#[derive(Debug)]
pub struct FakeSocket {
    id: ConnectionId,
    alive: Arc<AtomicBool>,
}

impl FakeSocket {
    /// Flip to `false` to simulate the peer closing the connection.
    pub fn alive_flag(&self) -> Arc<AtomicBool> {
        self.alive.clone()
    }
}

impl PooledSocket for FakeSocket {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeState {
    calls: AtomicUsize,
    next_id: AtomicU64,
    fail_next: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

/// Connector that hands out [`FakeSocket`]s, optionally waiting for a permit per call.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<FakeState>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connect waits until the returned semaphore hands it a permit.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let connector = Self {
            state: Arc::new(FakeState {
                gate: Some(gate.clone()),
                ..Default::default()
            }),
        };
        (connector, gate)
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// The next `n` connects fail with `ConnectionRefused`.
    pub fn fail_next(&self, n: usize) {
        self.state.fail_next.store(n, Ordering::SeqCst);
    }
}

impl Connector for FakeConnector {
    type Connection = FakeSocket;

    async fn connect(
        &self,
        key: &NormalizedKey,
        _options: &ConnectOptions,
        cancel: &CancellationToken,
    ) -> io::Result<FakeSocket> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.state.gate {
            tokio::select! {
                permit = gate.acquire() => {
                    permit
                        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "gate closed"))?
                        .forget();
                }
                _ = cancel.cancelled() => {
                    return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"));
                }
            }
        }

        let failing = self
            .state
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("refused: {}", key),
            ));
        }

        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FakeSocket {
            id: ConnectionId::from(id),
            alive: Arc::new(AtomicBool::new(true)),
        })
    }
}

pub fn fake_pool(connector: FakeConnector, idle_timeout_ms: u64) -> ConnectionPool<FakeConnector> {
    let config = PoolConfig {
        idle_timeout_ms,
        ..Default::default()
    };
    ConnectionPool::new(connector, Reactor::new(), config)
}

/// Yield to other tasks until `condition` holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
