//! Watcher registry layered over the tokio runtime.
//!
//! Every readiness or timer callback is a *watcher*. A watcher can be enabled, disabled,
//! or cancelled for good. It can also be unreferenced, which means it no longer counts
//! towards [`Reactor::referenced_watchers`], the number a driver uses to decide whether
//! there is still work keeping the process alive.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::trace;

/// Identity of a reactor registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(u64);

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// A handle that can report read readiness.
pub trait Readiness: Send + Sync + 'static {
    fn readable(&self) -> impl Future<Output = io::Result<()>> + Send;
}

#[derive(Debug, Clone, Copy)]
struct Control {
    enabled: bool,
    cancelled: bool,
    /// Bumped on every disabled -> enabled transition so timers restart their countdown.
    generation: u64,
}

struct Registration {
    control: watch::Sender<Control>,
    referenced: bool,
}

struct ReactorInner {
    watchers: Mutex<HashMap<WatcherId, Registration>>,
    next_id: AtomicU64,
    alive: watch::Sender<usize>,
}

/// Cloneable handle to one watcher registry. Registering watchers requires a running
/// tokio runtime.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<ReactorInner>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    pub fn new() -> Self {
        let (alive, _) = watch::channel(0);
        Self {
            inner: Arc::new(ReactorInner {
                watchers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                alive,
            }),
        }
    }

    fn upgrade(weak: &Weak<ReactorInner>) -> Option<Reactor> {
        weak.upgrade().map(|inner| Reactor { inner })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WatcherId, Registration>> {
        self.inner
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_alive(&self, watchers: &HashMap<WatcherId, Registration>) {
        let count = watchers
            .values()
            .filter(|reg| reg.referenced && reg.control.borrow().enabled)
            .count();
        self.inner.alive.send_replace(count);
    }

    fn register(&self, enabled: bool) -> (WatcherId, watch::Receiver<Control>) {
        let id = WatcherId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (control, rx) = watch::channel(Control {
            enabled,
            cancelled: false,
            generation: 0,
        });

        let mut watchers = self.lock();
        watchers.insert(
            id,
            Registration {
                control,
                referenced: true,
            },
        );
        self.publish_alive(&watchers);
        (id, rx)
    }

    fn update(&self, id: WatcherId, modify: impl FnOnce(&mut Control) -> bool) {
        let mut watchers = self.lock();
        if let Some(reg) = watchers.get_mut(&id) {
            reg.control.send_if_modified(modify);
        }
        self.publish_alive(&watchers);
    }

    /// Single-shot expiry: disables the watcher if it is still armed at `generation`.
    fn fire(&self, id: WatcherId, generation: u64) -> bool {
        let mut watchers = self.lock();
        let Some(reg) = watchers.get_mut(&id) else {
            return false;
        };
        let fired = reg.control.send_if_modified(|c| {
            if c.enabled && c.generation == generation {
                c.enabled = false;
                true
            } else {
                false
            }
        });
        self.publish_alive(&watchers);
        fired
    }

    pub fn is_enabled(&self, id: WatcherId) -> bool {
        self.lock()
            .get(&id)
            .is_some_and(|reg| reg.control.borrow().enabled)
    }

    /// Run `callback` once `after` elapses. The watcher disables itself when it fires;
    /// enabling it again restarts the full countdown.
    pub fn delay<F>(&self, after: Duration, mut callback: F) -> WatcherId
    where
        F: FnMut(WatcherId) + Send + 'static,
    {
        let (id, mut control) = self.register(true);
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            loop {
                let generation = match control.wait_for(|c| c.enabled || c.cancelled).await {
                    Ok(c) if c.cancelled => break,
                    Ok(c) => c.generation,
                    Err(_) => break,
                };

                tokio::select! {
                    _ = tokio::time::sleep(after) => {
                        let Some(reactor) = Reactor::upgrade(&weak) else { break };
                        if reactor.fire(id, generation) {
                            trace!("Timer {} fired after {:?}", id, after);
                            callback(id);
                        }
                    }
                    changed = control.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            trace!("Timer {} finished", id);
        });

        id
    }

    /// Run `callback` whenever `source` is readable while the watcher is enabled.
    /// The watcher starts disabled.
    pub fn on_readable<S, F>(&self, source: Arc<S>, mut callback: F) -> WatcherId
    where
        S: Readiness,
        F: FnMut(WatcherId) + Send + 'static,
    {
        let (id, mut control) = self.register(false);
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            loop {
                match control.wait_for(|c| c.enabled || c.cancelled).await {
                    Ok(c) if c.cancelled => break,
                    Ok(_) => {}
                    Err(_) => break,
                }

                tokio::select! {
                    ready = source.readable() => {
                        if let Err(e) = ready {
                            trace!("Readiness error on {}: {}", id, e);
                        }
                        let Some(reactor) = Reactor::upgrade(&weak) else { break };
                        if reactor.is_enabled(id) {
                            callback(id);
                        }
                    }
                    changed = control.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            trace!("Readable watcher {} finished", id);
        });

        id
    }

    pub fn enable(&self, id: WatcherId) {
        self.update(id, |c| {
            if c.enabled || c.cancelled {
                return false;
            }
            c.enabled = true;
            c.generation += 1;
            true
        });
    }

    pub fn disable(&self, id: WatcherId) {
        self.update(id, |c| std::mem::replace(&mut c.enabled, false));
    }

    /// Permanently remove the watcher. Its task exits and its callback is dropped.
    pub fn cancel(&self, id: WatcherId) {
        let mut watchers = self.lock();
        if let Some(reg) = watchers.remove(&id) {
            reg.control.send_modify(|c| {
                c.enabled = false;
                c.cancelled = true;
            });
        }
        self.publish_alive(&watchers);
    }

    pub fn reference(&self, id: WatcherId) {
        let mut watchers = self.lock();
        if let Some(reg) = watchers.get_mut(&id) {
            reg.referenced = true;
        }
        self.publish_alive(&watchers);
    }

    pub fn unreference(&self, id: WatcherId) {
        let mut watchers = self.lock();
        if let Some(reg) = watchers.get_mut(&id) {
            reg.referenced = false;
        }
        self.publish_alive(&watchers);
    }

    /// Number of enabled, referenced watchers.
    pub fn referenced_watchers(&self) -> usize {
        *self.inner.alive.borrow()
    }

    /// Total registrations, enabled or not.
    pub fn registered_watchers(&self) -> usize {
        self.lock().len()
    }

    /// Resolves once no enabled, referenced watcher remains.
    pub async fn wait_unreferenced(&self) {
        let mut alive = self.inner.alive.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = alive.wait_for(|count| *count == 0).await;
    }
}
