use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

use api::error::ApiError;

/// single-flight cache: concurrent callers asking for the same key share one
/// in-flight computation instead of racing to do the same expensive work.
/// the entry is dropped once the computation settles, so a later call for
/// the same key (after the backing file is invalidated) recomputes fresh.
pub struct AwaitCache<K, V> {
    inflight: DashMap<K, Arc<OnceCell<Result<V, ApiError>>>>,
}

impl<K, V> AwaitCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        AwaitCache {
            inflight: DashMap::new(),
        }
    }

    /// runs `compute` for `key` if no call for that key is already in
    /// flight; otherwise awaits the existing call's result
    pub async fn get_or_compute<F, Fut>(&self, key: K, compute: F) -> Result<V, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ApiError>>,
    {
        let cell = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = cell.get_or_init(compute).await.clone();

        // only the caller that actually populated the cell clears it; a
        // caller that merely awaited someone else's future leaves cleanup
        // to the populator to avoid racing two removals for the same key
        if let Some(entry) = self.inflight.get(&key) {
            if Arc::ptr_eq(entry.value(), &cell) {
                drop(entry);
                self.inflight.remove(&key);
            }
        }

        result
    }

    pub fn in_flight_count(&self) -> usize {
        self.inflight.len()
    }
}

impl<K, V> Default for AwaitCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_computation() {
        let cache: Arc<AwaitCache<String, i32>> = Arc::new(AwaitCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("k".to_string(), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn later_call_recomputes_after_settling() {
        let cache: AwaitCache<String, i32> = AwaitCache::new();
        let first = cache
            .get_or_compute("k".to_string(), || async move { Ok(1) })
            .await
            .unwrap();
        let second = cache
            .get_or_compute("k".to_string(), || async move { Ok(2) })
            .await
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }
}
