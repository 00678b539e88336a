use hashbrown::HashMap;
use keep::mem::secured::SecuredBuf;
use std::sync::Mutex;

/// Concurrent key→secret mapping. Both keys and values live in hardened
/// memory and are scrubbed when an entry is replaced or removed. One mutex
/// serializes every operation.
pub struct SecretStore {
    map: Mutex<HashMap<SecuredBuf, SecuredBuf>>,
}

impl SecretStore {
    pub fn new() -> SecretStore {
        SecretStore {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts the entry only if `key` is absent. Returns whether the entry
    /// was inserted.
    pub fn add(&self, key: SecuredBuf, value: SecuredBuf) -> bool {
        let mut map = self.map.lock().expect("store mutex poisoned");

        match map.entry(key) {
            hashbrown::hash_map::Entry::Occupied(_) => false,
            hashbrown::hash_map::Entry::Vacant(entry) => {
                entry.insert(value);
                true
            }
        }
    }

    /// Inserts or overwrites the entry.
    pub fn update(&self, key: SecuredBuf, value: SecuredBuf) {
        let mut map = self.map.lock().expect("store mutex poisoned");
        map.insert(key, value);
    }

    /// Runs `operation` over the stored value while the store lock is held,
    /// so the produced reply cannot be invalidated by a concurrent
    /// mutation. Returns `None` when `key` is absent.
    pub fn with_value<R, F: FnOnce(&[u8]) -> R>(&self, key: &[u8], operation: F) -> Option<R> {
        let map = self.map.lock().expect("store mutex poisoned");
        map.get(key).map(|value| operation(value.as_slice()))
    }

    /// Removes the entry. Returns the number of removed entries (0 or 1).
    pub fn remove(&self, key: &[u8]) -> usize {
        let mut map = self.map.lock().expect("store mutex poisoned");

        match map.remove(key) {
            Some(_) => 1,
            None => 0,
        }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.map.lock().expect("store mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
