//! Per-thread reference registries.
//!
//! Each thread keeps its own table of integer handles (callbacks, script
//! values, ...) and a [`RefRegistry`] naming those handles per module. A handle
//! only means something on the thread that created it, so the registry value
//! itself cannot leave its thread. Another thread that needs a handle goes
//! through [`RefAccessor`], which looks it up by label, module and thread id in
//! a process-wide directory.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};

use crate::error::ThreadError;
use crate::store::LOCK_TIMEOUT;

/// Integer handle into a thread's private reference table.
pub type RefHandle = i32;

// ─────────────────────────────────────────────────────────────────────────────
// RefTable
// ─────────────────────────────────────────────────────────────────────────────

/// Slab of values addressed by integer handles. Handles start at 1 and freed
/// handles are reused.
#[derive(Debug)]
pub struct RefTable<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Default for RefTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RefTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, value: T) -> RefHandle {
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(value);
                index
            }
            None => {
                self.slots.push(Some(value));
                self.slots.len() - 1
            }
        };
        (index + 1) as RefHandle
    }

    fn index(&self, handle: RefHandle) -> Option<usize> {
        if handle < 1 {
            return None;
        }
        let index = (handle - 1) as usize;
        (index < self.slots.len()).then_some(index)
    }

    pub fn get(&self, handle: RefHandle) -> Option<&T> {
        self.index(handle).and_then(|i| self.slots[i].as_ref())
    }

    pub fn get_mut(&mut self, handle: RefHandle) -> Option<&mut T> {
        self.index(handle).and_then(|i| self.slots[i].as_mut())
    }

    pub fn remove(&mut self, handle: RefHandle) -> Option<T> {
        let index = self.index(handle)?;
        let value = self.slots[index].take()?;
        self.free.push(index);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Thread directory
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ThreadRefs {
    /// module -> handle of the module's reference table
    ref_tables: HashMap<String, RefHandle>,
    /// (module, label) -> handle
    labels: HashMap<(String, String), RefHandle>,
}

type Directory = DashMap<ThreadId, Arc<Mutex<ThreadRefs>>>;

static DIRECTORY: OnceLock<Directory> = OnceLock::new();

fn directory() -> &'static Directory {
    DIRECTORY.get_or_init(DashMap::new)
}

/// Registration of the current thread in the directory; removed when the
/// thread exits.
struct LocalEntry {
    thread: ThreadId,
    refs: Arc<Mutex<ThreadRefs>>,
}

impl LocalEntry {
    fn register() -> Self {
        let thread = thread::current().id();
        let refs = Arc::new(Mutex::new(ThreadRefs::default()));
        directory().insert(thread, Arc::clone(&refs));
        Self { thread, refs }
    }
}

impl Drop for LocalEntry {
    fn drop(&mut self) {
        directory().remove(&self.thread);
    }
}

thread_local! {
    static LOCAL: LocalEntry = LocalEntry::register();
}

// ─────────────────────────────────────────────────────────────────────────────
// RefRegistry
// ─────────────────────────────────────────────────────────────────────────────

/// The calling thread's registry of named handles.
///
/// Every access waits at most [`LOCK_TIMEOUT`] for the registry lock, which
/// [`RefAccessor`] may be holding from another thread.
pub struct RefRegistry {
    thread: ThreadId,
    refs: Arc<Mutex<ThreadRefs>>,
    timeout: Duration,
    _not_send: PhantomData<*const ()>,
}

impl RefRegistry {
    /// Registry of the calling thread.
    pub fn current() -> RefRegistry {
        LOCAL.with(|entry| RefRegistry {
            thread: entry.thread,
            refs: Arc::clone(&entry.refs),
            timeout: LOCK_TIMEOUT,
            _not_send: PhantomData,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    fn lock(&self) -> Result<MutexGuard<'_, ThreadRefs>, ThreadError> {
        self.refs
            .try_lock_for(self.timeout)
            .ok_or(ThreadError::LockTimeout(self.timeout))
    }

    /// Record the handle of `module`'s reference table, returning the previous
    /// one.
    pub fn set_ref_table(
        &self,
        module: &str,
        handle: RefHandle,
    ) -> Result<Option<RefHandle>, ThreadError> {
        Ok(self.lock()?.ref_tables.insert(module.to_string(), handle))
    }

    pub fn ref_table(&self, module: &str) -> Result<Option<RefHandle>, ThreadError> {
        Ok(self.lock()?.ref_tables.get(module).copied())
    }

    pub fn remove_ref_table(&self, module: &str) -> Result<bool, ThreadError> {
        Ok(self.lock()?.ref_tables.remove(module).is_some())
    }

    pub fn set_ref(
        &self,
        label: &str,
        module: &str,
        handle: RefHandle,
    ) -> Result<Option<RefHandle>, ThreadError> {
        Ok(self
            .lock()?
            .labels
            .insert((module.to_string(), label.to_string()), handle))
    }

    pub fn get_ref(&self, label: &str, module: &str) -> Result<RefHandle, ThreadError> {
        self.lock()?
            .labels
            .get(&(module.to_string(), label.to_string()))
            .copied()
            .ok_or_else(|| ThreadError::reference_not_found(label, module))
    }

    pub fn remove_ref(&self, label: &str, module: &str) -> Result<Option<RefHandle>, ThreadError> {
        Ok(self
            .lock()?
            .labels
            .remove(&(module.to_string(), label.to_string())))
    }

    /// Forget every label and reference table registered under `module`.
    pub fn clear_module(&self, module: &str) -> Result<(), ThreadError> {
        let mut refs = self.lock()?;
        refs.ref_tables.remove(module);
        refs.labels.retain(|(m, _), _| m != module);
        Ok(())
    }

    /// Forget everything registered on this thread.
    pub fn clear(&self) -> Result<(), ThreadError> {
        let mut refs = self.lock()?;
        refs.ref_tables.clear();
        refs.labels.clear();
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RefAccessor
// ─────────────────────────────────────────────────────────────────────────────

/// Privileged cross-thread access to another thread's named handles.
///
/// Intended for internal tooling only. The handle returned is only meaningful
/// to code running on `thread`.
#[derive(Debug, Clone)]
pub struct RefAccessor {
    timeout: Duration,
}

impl Default for RefAccessor {
    fn default() -> Self {
        Self::new()
    }
}

impl RefAccessor {
    pub fn new() -> Self {
        Self {
            timeout: LOCK_TIMEOUT,
        }
    }

    fn refs_for(&self, thread: ThreadId) -> Option<Arc<Mutex<ThreadRefs>>> {
        directory().get(&thread).map(|entry| Arc::clone(entry.value()))
    }

    pub fn get_handle(
        &self,
        label: &str,
        module: &str,
        thread: ThreadId,
    ) -> Result<RefHandle, ThreadError> {
        let refs = self
            .refs_for(thread)
            .ok_or_else(|| ThreadError::reference_not_found(label, module))?;
        let refs = refs
            .try_lock_for(self.timeout)
            .ok_or(ThreadError::LockTimeout(self.timeout))?;
        refs.labels
            .get(&(module.to_string(), label.to_string()))
            .copied()
            .ok_or_else(|| ThreadError::reference_not_found(label, module))
    }

    pub fn set_handle(
        &self,
        handle: RefHandle,
        label: &str,
        module: &str,
        thread: ThreadId,
    ) -> Result<(), ThreadError> {
        let refs = self.refs_for(thread).ok_or_else(|| {
            ThreadError::WorkerUnavailable(format!("no reference registry for {:?}", thread))
        })?;
        let mut refs = refs
            .try_lock_for(self.timeout)
            .ok_or(ThreadError::LockTimeout(self.timeout))?;
        refs.labels
            .insert((module.to_string(), label.to_string()), handle);
        Ok(())
    }
}
