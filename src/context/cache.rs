use crate::{FlowError, NodeId};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type SlotLock = Arc<tokio::sync::Mutex<()>>;

/// Memoized node values of one execution context.
///
/// A cache may be layered on a parent: reads fall through to the parent when the local
/// layer has no entry, writes always stay local. Iteration scopes use this so that values
/// computed per loop element do not leak into the enclosing context.
///
/// Entries are guarded by a short-lived mutex; the check-compute-store sequence of
/// [`DataCache::get_or_try_insert_with`] is additionally serialized per node id, so two
/// tasks pulling the same node evaluate it once.
#[derive(Debug, Default)]
pub struct DataCache {
    entries: Mutex<HashMap<NodeId, Value>>,
    slots: Mutex<HashMap<NodeId, SlotLock>>,
    parent: Option<Arc<DataCache>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty layer on top of `parent`
    pub fn layered(parent: Arc<DataCache>) -> Self {
        Self {
            parent: Some(parent),
            ..Self::default()
        }
    }

    /// Look up a value in this layer, then in its ancestors
    pub fn get(&self, id: &NodeId) -> Option<Value> {
        if let Some(value) = locked(&self.entries).get(id) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|parent| parent.get(id))
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        locked(&self.entries).contains_key(id)
            || self.parent.as_ref().is_some_and(|parent| parent.contains(id))
    }

    pub fn set(&self, id: &NodeId, value: Value) {
        locked(&self.entries).insert(id.clone(), value);
    }

    /// Remove a value from this layer only
    pub fn remove(&self, id: &NodeId) -> Option<Value> {
        locked(&self.entries).remove(id)
    }

    /// Number of entries in this layer
    pub fn len(&self) -> usize {
        locked(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, id: &NodeId) -> SlotLock {
        locked(&self.slots).entry(id.clone()).or_default().clone()
    }

    /// Return the cached value for `id`, or compute it with `compute` exactly once.
    ///
    /// Concurrent callers for the same id wait for the first computation and observe its
    /// value. A failed computation stores nothing.
    pub async fn get_or_try_insert_with<F, Fut>(&self, id: &NodeId, compute: F) -> Result<Value, FlowError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, FlowError>>,
    {
        if let Some(value) = self.get(id) {
            return Ok(value);
        }

        let slot = self.slot(id);
        let _guard = slot.lock().await;

        if let Some(value) = self.get(id) {
            return Ok(value);
        }

        let value = compute().await?;
        self.set(id, value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_layered_reads_fall_through() {
        let parent = Arc::new(DataCache::new());
        parent.set(&NodeId::new("a"), json!(1));

        let child = DataCache::layered(parent.clone());
        assert_eq!(child.get(&NodeId::new("a")), Some(json!(1)));
        assert!(child.contains(&NodeId::new("a")));
        assert!(child.is_empty());

        child.set(&NodeId::new("a"), json!(2));
        assert_eq!(child.get(&NodeId::new("a")), Some(json!(2)));
        assert_eq!(parent.get(&NodeId::new("a")), Some(json!(1)));

        assert_eq!(child.remove(&NodeId::new("a")), Some(json!(2)));
        assert_eq!(child.get(&NodeId::new("a")), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_compute_once() {
        let cache = DataCache::new();
        let calls = AtomicUsize::new(0);
        let id = NodeId::new("n");

        for _ in 0..3 {
            let value = cache
                .get_or_try_insert_with(&id, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("computed"))
                })
                .await
                .unwrap();
            assert_eq!(value, json!("computed"));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_compute_stores_nothing() {
        let cache = DataCache::new();
        let id = NodeId::new("n");

        let result = cache
            .get_or_try_insert_with(&id, || async { Err(FlowError::evaluation("nope")) })
            .await;
        assert!(result.is_err());
        assert!(!cache.contains(&id));
    }

    #[tokio::test]
    async fn test_concurrent_compute_once() {
        let cache = Arc::new(DataCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_try_insert_with(&NodeId::new("shared"), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok(json!(7))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
