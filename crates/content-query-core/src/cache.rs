//! Hash-addressed result cache with single-flight population.
//!
//! Each [`QueryHash`] maps to one shared future. The first resolver of a
//! never-seen hash installs the future; every concurrent resolver of the
//! same hash clones and awaits it, so the corpus scan runs once and all of
//! them receive the same [`CacheEntry`].
//!
//! Dropping one waiter never cancels the computation for the others: the
//! shared future keeps making progress as long as anyone (including the
//! cache slot itself) holds it. Failed computations are evicted so a later
//! request can try again; successful ones stay until the whole cache is
//! discarded on corpus reload.
//!
//! `compute` runs synchronously inside the first poll of the shared future,
//! so a scan occupies the polling thread until it finishes. Callers on an
//! async runtime with very large corpora should resolve from a blocking
//! context (for example `tokio::task::spawn_blocking` with `block_on`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};

use crate::error::Result;
use crate::hash::QueryHash;
use crate::models::Document;

/// A published query result. Never mutated after creation.
#[derive(Debug)]
pub struct CacheEntry {
    pub hash: QueryHash,
    /// Matching documents in result order.
    pub documents: Vec<Arc<Document>>,
    pub created_at: DateTime<Utc>,
    /// Version of the store the result was computed against.
    pub store_version: u64,
}

type Slot = Shared<BoxFuture<'static, Result<Arc<CacheEntry>>>>;

#[derive(Default)]
pub struct QueryCache {
    slots: Mutex<HashMap<QueryHash, Slot>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A completed entry for `hash`, if one exists.
    pub fn get(&self, hash: &QueryHash) -> Option<Arc<CacheEntry>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(hash)
            .and_then(|slot| slot.peek())
            .and_then(|result| result.as_ref().ok().cloned())
    }

    /// Return the entry for `hash`, running `compute` only if no resolver
    /// has started it yet.
    pub async fn get_or_compute<F>(&self, hash: &QueryHash, compute: F) -> Result<Arc<CacheEntry>>
    where
        F: FnOnce() -> Result<CacheEntry> + Send + 'static,
    {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            match slots.get(hash) {
                Some(existing) => {
                    tracing::debug!(hash = %hash, "joining in-flight or cached query");
                    existing.clone()
                }
                None => {
                    let slot = async move { compute().map(Arc::new) }.boxed().shared();
                    slots.insert(hash.clone(), slot.clone());
                    slot
                }
            }
        };

        let result = slot.clone().await;
        if result.is_err() {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            if slots.get(hash).is_some_and(|current| current.ptr_eq(&slot)) {
                slots.remove(hash);
            }
        }
        result
    }

    /// Number of completed, successful entries.
    pub fn len(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .values()
            .filter(|slot| matches!(slot.peek(), Some(Ok(_))))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn hash(n: u8) -> QueryHash {
        QueryHash::parse(&format!("{:02x}", n).repeat(32)).unwrap()
    }

    fn entry(h: &QueryHash) -> CacheEntry {
        CacheEntry {
            hash: h.clone(),
            documents: Vec::new(),
            created_at: Utc::now(),
            store_version: 1,
        }
    }

    #[tokio::test]
    async fn test_second_lookup_reuses_entry() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let h = hash(1);

        let c = calls.clone();
        let h2 = h.clone();
        let first = cache
            .get_or_compute(&h, move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(entry(&h2))
            })
            .await
            .unwrap();
        let second = cache
            .get_or_compute(&h, || panic!("must not recompute"))
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&h).is_some());
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = QueryCache::new();
        let h = hash(2);

        let err = cache
            .get_or_compute(&h, || Err(QueryError::invalid("boom")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_descriptor");
        assert!(cache.get(&h).is_none());
        assert!(cache.is_empty());

        let h2 = h.clone();
        let ok = cache.get_or_compute(&h, move || Ok(entry(&h2))).await;
        assert!(ok.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancelled_waiter_leaves_computation_running() {
        let cache = Arc::new(QueryCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let h = hash(4);

        let first = {
            let cache = cache.clone();
            let calls = calls.clone();
            let started = started.clone();
            let h = h.clone();
            tokio::spawn(async move {
                let h2 = h.clone();
                cache
                    .get_or_compute(&h, move || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        started.store(true, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(300));
                        Ok(entry(&h2))
                    })
                    .await
            })
        };
        while !started.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let waiter = {
            let cache = cache.clone();
            let h = h.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute(&h, || panic!("must join the running computation"))
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        let first = first.await.unwrap().unwrap();
        let later = cache
            .get_or_compute(&h, || panic!("must not recompute"))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &later));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolvers_share_one_computation() {
        let cache = Arc::new(QueryCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let h = hash(3);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            let barrier = barrier.clone();
            let h = h.clone();
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                let h2 = h.clone();
                cache
                    .get_or_compute(&h, move || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        Ok(entry(&h2))
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut entries = Vec::new();
        for task in tasks {
            entries.push(task.await.unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for e in &entries[1..] {
            assert!(Arc::ptr_eq(&entries[0], e));
        }
    }
}
