//! In-memory ordered key-value store with an advisory lock table.
//!
//! The production deployment would swap this for an embedded storage
//! engine behind the same [`Store`] trait; the consensus core never sees
//! the difference.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Store, StoreError};

/// Ordered map plus a lock table mapping lock name to holder identity.
#[derive(Debug, Default)]
pub struct MemStore {
    data: BTreeMap<String, String>,
    locks: BTreeMap<String, String>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    /// Current holder of a lock, if any.
    pub fn lock_holder(&self, key: &str) -> Option<String> {
        self.locks.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Store for MemStore {
    fn put(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<bool, StoreError> {
        Ok(self.data.remove(key).is_some())
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.data.get(key).cloned())
    }

    fn scan_all(&self) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn try_lock(&mut self, key: &str, holder: &str) -> Result<bool, StoreError> {
        match self.locks.get(key) {
            Some(current) => Ok(current == holder),
            None => {
                self.locks.insert(key.to_string(), holder.to_string());
                Ok(true)
            }
        }
    }

    fn unlock(&mut self, key: &str, holder: &str) -> Result<bool, StoreError> {
        match self.locks.get(key) {
            Some(current) if current == holder => {
                self.locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release_held(&mut self, holder: &str) -> Result<u64, StoreError> {
        let before = self.locks.len();
        self.locks.retain(|_, h| h != holder);
        Ok((before - self.locks.len()) as u64)
    }
}

/// Shared store handle: the apply engine writes through it, dirty reads and
/// the client API read through it.
pub type SharedStore = Arc<Mutex<MemStore>>;

pub fn shared_store() -> SharedStore {
    Arc::new(Mutex::new(MemStore::new()))
}

impl Store for SharedStore {
    fn put(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock().put(key, value)
    }

    fn delete(&mut self, key: &str) -> Result<bool, StoreError> {
        self.lock().delete(key)
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.lock().get(key)
    }

    fn scan_all(&self) -> Result<Vec<(String, String)>, StoreError> {
        self.lock().scan_all()
    }

    fn try_lock(&mut self, key: &str, holder: &str) -> Result<bool, StoreError> {
        self.lock().try_lock(key, holder)
    }

    fn unlock(&mut self, key: &str, holder: &str) -> Result<bool, StoreError> {
        self.lock().unlock(key, holder)
    }

    fn release_held(&mut self, holder: &str) -> Result<u64, StoreError> {
        self.lock().release_held(holder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let mut store = MemStore::new();
        store.put("foo", "bar").unwrap();
        assert_eq!(store.get("foo").unwrap(), Some("bar".to_string()));
    }

    #[test]
    fn test_get_missing() {
        let store = MemStore::new();
        assert_eq!(store.get("nope").unwrap(), None);
    }

    #[test]
    fn test_delete() {
        let mut store = MemStore::new();
        store.put("foo", "bar").unwrap();
        assert!(store.delete("foo").unwrap());
        assert!(!store.delete("foo").unwrap());
        assert_eq!(store.get("foo").unwrap(), None);
    }

    #[test]
    fn test_overwrite() {
        let mut store = MemStore::new();
        store.put("k", "v1").unwrap();
        store.put("k", "v2").unwrap();
        assert_eq!(store.get("k").unwrap(), Some("v2".to_string()));
    }

    #[test]
    fn test_scan_all_is_ordered() {
        let mut store = MemStore::new();
        store.put("b", "2").unwrap();
        store.put("a", "1").unwrap();
        store.put("c", "3").unwrap();

        let all = store.scan_all().unwrap();
        assert_eq!(
            all,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
                ("c".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn test_try_lock_free_and_contended() {
        let mut store = MemStore::new();
        assert!(store.try_lock("m", "alice").unwrap());
        // Re-acquiring your own lock succeeds.
        assert!(store.try_lock("m", "alice").unwrap());
        // Somebody else is refused.
        assert!(!store.try_lock("m", "bob").unwrap());
    }

    #[test]
    fn test_unlock_only_by_holder() {
        let mut store = MemStore::new();
        store.try_lock("m", "alice").unwrap();

        assert!(!store.unlock("m", "bob").unwrap());
        assert_eq!(store.lock_holder("m"), Some("alice".to_string()));

        assert!(store.unlock("m", "alice").unwrap());
        assert_eq!(store.lock_holder("m"), None);

        // Unlocking a free lock fails.
        assert!(!store.unlock("m", "alice").unwrap());
    }

    #[test]
    fn test_release_held_clears_all_holder_locks() {
        let mut store = MemStore::new();
        store.try_lock("m1", "alice").unwrap();
        store.try_lock("m2", "alice").unwrap();
        store.try_lock("m3", "bob").unwrap();

        assert_eq!(store.release_held("alice").unwrap(), 2);
        assert_eq!(store.lock_holder("m1"), None);
        assert_eq!(store.lock_holder("m2"), None);
        assert_eq!(store.lock_holder("m3"), Some("bob".to_string()));
    }
}
