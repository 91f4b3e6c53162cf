//! Keyed TTL cache with single-flight fetch.
//!
//! Concurrent misses on one key share a single fetch: the first caller
//! installs a shared future, later callers await the same one, and all of
//! them observe the same value or error. The fetch is driven by its own
//! spawned task, so it finishes even if every waiter goes away.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use crate::error::{StorageError, StorageResult};

type SharedFetch<V> = Shared<BoxFuture<'static, StorageResult<V>>>;

struct Flight<V> {
    id: u64,
    fut: SharedFetch<V>,
}

struct Inner<K, V> {
    entries: DashMap<K, (V, Instant)>,
    inflight: DashMap<K, Flight<V>>,
    next_flight: AtomicU64,
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Publish a finished fetch, unless it was invalidated meanwhile.
    ///
    /// Lock order is inflight then entries, everywhere.
    fn complete(&self, key: &K, id: u64, out: &StorageResult<V>, ttl: Option<Duration>) {
        if let Entry::Occupied(flight) = self.inflight.entry(key.clone()) {
            if flight.get().id != id {
                return;
            }
            if let (Ok(value), Some(ttl)) = (out, ttl) {
                if !ttl.is_zero() {
                    self.entries
                        .insert(key.clone(), (value.clone(), Instant::now() + ttl));
                }
            }
            flight.remove();
        }
    }

    fn fresh(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .and_then(|e| (now < e.1).then(|| e.0.clone()));
        if hit.is_none() {
            self.entries.remove_if(key, |_, (_, expires)| now >= *expires);
        }
        hit
    }
}

/// A coalescing TTL cache.
///
/// Cloning is cheap and shares the underlying storage.
pub struct CoalescingCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for CoalescingCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Default for CoalescingCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> CoalescingCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                inflight: DashMap::new(),
                next_flight: AtomicU64::new(0),
            }),
        }
    }

    /// Return the cached value, or run `fetch` once for all concurrent callers.
    ///
    /// `ttl` decides from the fetched value how long to keep it; `None`
    /// means the value is handed to the waiters but never stored.
    pub async fn get_or_fetch<F, Fut, T>(&self, key: K, ttl: T, fetch: F) -> StorageResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StorageResult<V>> + Send + 'static,
        T: FnOnce(&V) -> Option<Duration> + Send + 'static,
    {
        if let Some(value) = self.inner.fresh(&key) {
            trace!("cache hit");
            return Ok(value);
        }

        let fut = match self.inner.inflight.entry(key.clone()) {
            Entry::Occupied(flight) => {
                trace!("joining in-flight fetch");
                flight.get().fut.clone()
            }
            Entry::Vacant(slot) => {
                // A flight may have completed between the miss and this guard.
                if let Some(value) = self.inner.fresh(&key) {
                    return Ok(value);
                }
                let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
                let inner = Arc::clone(&self.inner);
                let work = fetch();
                let fut = async move {
                    // A panicking fetch fails its waiters like any other
                    // error and still retires the flight.
                    let out = AssertUnwindSafe(work)
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| Err(StorageError::other("fetch panicked")));
                    let keep = out.as_ref().ok().and_then(ttl);
                    inner.complete(&key, id, &out, keep);
                    out
                }
                .boxed()
                .shared();
                slot.insert(Flight {
                    id,
                    fut: fut.clone(),
                });
                tokio::spawn(fut.clone());
                fut
            }
        };
        fut.await
    }

    /// Cached value, if present and unexpired.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.fresh(key)
    }

    /// Store a value directly.
    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        self.inner
            .entries
            .insert(key, (value, Instant::now() + ttl));
    }

    /// Drop the entry and detach any in-flight fetch for `key`.
    ///
    /// A detached fetch still answers its waiters but is not stored.
    pub fn invalidate(&self, key: &K) {
        self.inner.inflight.remove(key);
        self.inner.entries.remove(key);
    }

    /// Invalidate every key matching `pred`.
    pub fn invalidate_where(&self, pred: impl Fn(&K) -> bool) {
        self.inner.inflight.retain(|k, _| !pred(k));
        self.inner.entries.retain(|k, _| !pred(k));
    }

    /// Number of stored entries, expired ones included until touched.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Whether a fetch is running for `key`.
    pub fn is_inflight(&self, key: &K) -> bool {
        self.inner.inflight.contains_key(key)
    }
}
