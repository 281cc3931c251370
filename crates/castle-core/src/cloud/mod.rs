//! Cloud backends and the per-cluster cache that shares them between nodes.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{CastleError, Result};

pub mod docker;
pub mod ec2;
mod future;

pub use future::{wait_all, CloudFuture, CloudPromise};

/// A backend client shared by every node that uses it.
pub trait Cloud: Send + Sync + 'static {
    /// Release the backend. Called exactly once, by `CloudCache::close`.
    fn close(&self) -> anyhow::Result<()>;
}

struct Entry {
    any: Arc<dyn Any + Send + Sync>,
    cloud: Arc<dyn Cloud>,
}

#[derive(Default)]
struct CacheState {
    entries: BTreeMap<String, Entry>,
    closed: bool,
}

/// Cluster-wide cache of cloud clients keyed by a description string.
///
/// At most one client is constructed per key, even under concurrent access:
/// construction happens with the cache lock held.
#[derive(Default)]
pub struct CloudCache {
    state: Mutex<CacheState>,
}

impl CloudCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create<T, F>(&self, key: &str, create: F) -> Result<Arc<T>>
    where
        T: Cloud,
        F: FnOnce() -> Result<T>,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(CastleError::Cloud(format!(
                "cannot create {key}: the cloud cache is closed"
            )));
        }
        if let Some(entry) = state.entries.get(key) {
            return Arc::clone(&entry.any).downcast::<T>().map_err(|_| {
                CastleError::Cloud(format!("cloud cache entry {key} has an unexpected type"))
            });
        }
        tracing::debug!(cloud = key, "creating cloud client");
        let cloud = Arc::new(create()?);
        state.entries.insert(
            key.to_string(),
            Entry {
                any: cloud.clone(),
                cloud: cloud.clone(),
            },
        );
        Ok(cloud)
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every cached client once. Later calls do nothing; failures are
    /// logged and do not stop the remaining clients from closing.
    pub fn close(&self) {
        let entries = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.entries)
        };
        for (key, entry) in entries {
            if let Err(e) = entry.cloud.close() {
                tracing::error!(cloud = %key, "failed to close cloud: {e:#}");
            }
        }
    }
}

impl Drop for CloudCache {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCloud {
        closes: Arc<AtomicUsize>,
    }

    impl Cloud for CountingCloud {
        fn close(&self) -> anyhow::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct OtherCloud;

    impl Cloud for OtherCloud {
        fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn creates_once_per_key_and_closes_once() {
        let cache = CloudCache::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let creates = AtomicUsize::new(0);
        let make = || {
            creates.fetch_add(1, Ordering::SeqCst);
            Ok(CountingCloud {
                closes: Arc::clone(&closes),
            })
        };
        let a = cache.get_or_create("a", make).unwrap();
        let a2 = cache.get_or_create("a", make).unwrap();
        assert!(Arc::ptr_eq(&a, &a2));
        assert_eq!(creates.load(Ordering::SeqCst), 1);

        cache.close();
        cache.close();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(cache.get_or_create("a", make).is_err());
    }

    #[test]
    fn concurrent_lookups_share_one_client() {
        let cache = Arc::new(CloudCache::new());
        let creates = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let creates = Arc::clone(&creates);
                std::thread::spawn(move || {
                    cache
                        .get_or_create("DockerCloud{}", || {
                            creates.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            Ok(OtherCloud)
                        })
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(creates.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn mismatched_type_for_key_is_an_error() {
        let cache = CloudCache::new();
        cache.get_or_create("k", || Ok(OtherCloud)).unwrap();
        let res = cache.get_or_create("k", || {
            Ok(CountingCloud {
                closes: Arc::new(AtomicUsize::new(0)),
            })
        });
        assert!(res.is_err());
    }
}
