//! Short-lived caches for expensive aggregate reads.
//!
//! A [`TtlCache`] sits in front of one remote fetch and is owned by the
//! component that needs it — there is no global cache object. An expired or
//! absent entry is always a miss; stale data is never returned silently.
//! Mutating operations invalidate the affected keys explicitly; the cache
//! does not observe mutations on its own.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::watch;

struct CacheEntry<V> {
    value: V,
    fetched_at: Instant,
}

/// A per-key cache where entries expire `ttl` after they were stored.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// A hit only while `now - fetched_at < ttl`; expired entries are evicted
    /// on the way out.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some(entry) if entry.fetched_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: K, value: V) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                key,
                CacheEntry {
                    value,
                    fetched_at: Instant::now(),
                },
            );
        }
    }

    /// Idempotent: invalidating an absent key is a no-op.
    pub fn invalidate(&self, key: &K) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }
}

// ---------------------------------------------------------------------------
// In-flight request deduplication
// ---------------------------------------------------------------------------

struct Flight {
    started: Instant,
    done: watch::Receiver<bool>,
}

/// Deduplicates concurrent fetches for the same key.
///
/// The first caller becomes the leader and receives a [`FlightGuard`];
/// followers wait until the leader finishes (guard dropped) and then re-check
/// the cache. Each flight carries its own timeout so a stuck request cannot
/// permanently block future requests for that key: a leader older than the
/// timeout is evicted and replaced.
pub struct Singleflight<K> {
    timeout: Duration,
    inflight: Mutex<HashMap<K, Flight>>,
}

/// Held by the leader for the duration of its fetch. Dropping it releases
/// every waiting follower.
pub struct FlightGuard {
    _tx: watch::Sender<bool>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let _ = self._tx.send(true);
    }
}

impl<K: Eq + Hash + Clone> Singleflight<K> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Join the flight for `key`.
    ///
    /// Returns `Some(guard)` when the caller should perform the fetch itself.
    /// Returns `None` after waiting for another caller's flight (or giving up
    /// on a stuck one) — the caller should re-check its cache then.
    pub async fn join(&self, key: K) -> Option<FlightGuard> {
        let waiter = {
            let mut inflight = match self.inflight.lock() {
                Ok(g) => g,
                Err(_) => return None,
            };
            let running = inflight
                .get(&key)
                .filter(|f| f.started.elapsed() < self.timeout)
                .map(|f| f.done.clone());

            match running {
                Some(rx) => rx,
                None => {
                    // No flight, or the current one is stuck: take over.
                    let (tx, rx) = watch::channel(false);
                    inflight.insert(
                        key.clone(),
                        Flight {
                            started: Instant::now(),
                            done: rx,
                        },
                    );
                    drop(inflight);
                    self.sweep(&key);
                    return Some(FlightGuard { _tx: tx });
                }
            }
        };

        let mut rx = waiter;
        let _ = tokio::time::timeout(self.timeout, rx.wait_for(|done| *done)).await;
        None
    }

    /// Drop completed or expired flights. Called opportunistically; the map
    /// stays small (one entry per hot key).
    fn sweep(&self, current: &K) {
        if let Ok(mut inflight) = self.inflight.lock() {
            inflight.retain(|k, f| {
                k == current || (!*f.done.borrow() && f.started.elapsed() < self.timeout)
            });
        }
    }
}
