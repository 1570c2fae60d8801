//! Coordination primitives shared by every trigger (timer, webhook, watcher).

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedMutexGuard, watch};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Collapses concurrent calls for the same key into one execution whose result every caller
/// receives.
pub struct SingleFlight<T> {
    calls: Mutex<HashMap<String, watch::Receiver<Option<T>>>>,
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run<F, Fut>(&self, key: &str, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let tx = loop {
            let mut rx = {
                let mut calls = lock(&self.calls);
                match calls.get(key) {
                    Some(rx) => rx.clone(),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        calls.insert(key.to_string(), rx);
                        break tx;
                    }
                }
            };
            let shared = rx.wait_for(Option::is_some).await.ok().and_then(|v| (*v).clone());
            if let Some(value) = shared {
                return value;
            }
            // The leader was dropped before finishing; its guard already removed the entry.
        };

        let _guard = FlightGuard {
            calls: &self.calls,
            key,
        };
        let value = work().await;
        let _ = tx.send(Some(value.clone()));
        value
    }

    pub fn in_flight(&self, key: &str) -> bool {
        lock(&self.calls).contains_key(key)
    }
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct FlightGuard<'a, T> {
    calls: &'a Mutex<HashMap<String, watch::Receiver<Option<T>>>>,
    key: &'a str,
}

impl<T> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        lock(self.calls).remove(self.key);
    }
}

type LockMap = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Exclusive async lock per transfer target (a local file name).
#[derive(Clone, Default)]
pub struct TargetLocks {
    locks: LockMap,
}

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> TargetGuard {
        let mutex = {
            let mut locks = lock(&self.locks);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        let guard = mutex.lock_owned().await;
        TargetGuard {
            locks: Arc::clone(&self.locks),
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    pub fn is_held(&self, key: &str) -> bool {
        lock(&self.locks)
            .get(key)
            .is_some_and(|mutex| mutex.try_lock().is_err())
    }
}

pub struct TargetGuard {
    locks: LockMap,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = lock(&self.locks);
        // Only the map holds the mutex once no caller is waiting on it.
        if locks
            .get(&self.key)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// Serializes reconciliation passes. A trigger that finds a pass running is coalesced into a
/// single follow-up pass run by the current holder.
#[derive(Default)]
pub struct PassGate {
    running: tokio::sync::Mutex<()>,
    rerun: AtomicBool,
}

pub enum GateEntry<'a> {
    Acquired(PassPermit<'a>),
    Coalesced,
}

pub struct PassPermit<'a> {
    gate: &'a PassGate,
    _guard: tokio::sync::MutexGuard<'a, ()>,
}

impl PassPermit<'_> {
    /// Consumes a pending rerun request, if one arrived while the pass was running.
    pub fn take_rerun(&self) -> bool {
        self.gate.rerun.swap(false, Ordering::SeqCst)
    }
}

impl PassGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> GateEntry<'_> {
        match self.running.try_lock() {
            Ok(guard) => {
                self.rerun.store(false, Ordering::SeqCst);
                GateEntry::Acquired(PassPermit {
                    gate: self,
                    _guard: guard,
                })
            }
            Err(_) => {
                self.rerun.store(true, Ordering::SeqCst);
                GateEntry::Coalesced
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    pub fn rerun_pending(&self) -> bool {
        self.rerun.load(Ordering::SeqCst)
    }
}
