//! Process-wide shared dictionary.
//!
//! The only state mutated from several threads at once. Every access takes the
//! mutex with a bounded wait; a caller that cannot get the lock in time gets
//! [`ThreadError::LockTimeout`] instead of blocking the host.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::ThreadError;

/// Maximum time to wait for the shared store lock.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

static GLOBAL_STORE: OnceLock<Arc<SharedStore>> = OnceLock::new();

/// Thread-safe string-keyed map of JSON values.
#[derive(Debug)]
pub struct SharedStore {
    entries: Mutex<HashMap<String, Value>>,
    timeout: Duration,
}

impl Default for SharedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStore {
    /// A fresh, empty store using [`LOCK_TIMEOUT`].
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            timeout: LOCK_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_lock_timeout(timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// The store shared by every manager and worker in the process.
    pub fn global() -> Arc<SharedStore> {
        GLOBAL_STORE
            .get_or_init(|| Arc::new(SharedStore::new()))
            .clone()
    }

    pub fn lock_timeout(&self) -> Duration {
        self.timeout
    }

    /// Value stored under `key`, or `None` if there is none.
    pub fn get(&self, key: &str) -> Result<Option<Value>, ThreadError> {
        self.transaction(|entries| entries.get(key).cloned())
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Result<(), ThreadError> {
        let key = key.into();
        self.transaction(move |entries| {
            entries.insert(key, value);
        })
    }

    /// Remove `key`, returning the value it held.
    pub fn remove(&self, key: &str) -> Result<Option<Value>, ThreadError> {
        self.transaction(|entries| entries.remove(key))
    }

    /// All keys currently present, sorted.
    pub fn keys(&self) -> Result<Vec<String>, ThreadError> {
        self.transaction(|entries| {
            let mut keys: Vec<String> = entries.keys().cloned().collect();
            keys.sort();
            keys
        })
    }

    /// Run `f` with the map locked. Other threads observe either none or all
    /// of the changes `f` makes.
    pub fn transaction<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Value>) -> R,
    ) -> Result<R, ThreadError> {
        let mut entries = self
            .entries
            .try_lock_for(self.timeout)
            .ok_or(ThreadError::LockTimeout(self.timeout))?;
        Ok(f(&mut entries))
    }
}
