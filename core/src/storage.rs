//! Process-wide typed storage (S, spec.md §4.4).
//!
//! A string-keyed, type-erased map protected by a single recursive mutex so
//! a handler may call into a helper that itself locks storage. Type
//! erasure follows the anymap-style pattern used for component storage in
//! the teacher's registry, but keyed by string rather than entity id and
//! torn down in reverse insertion order on shutdown.

use std::any::{Any, TypeId};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;

use crate::error::StorageError;

struct Entry {
    type_id: TypeId,
    type_name: &'static str,
    value: Box<dyn Any + Send>,
}

/// The process-wide store. Cheaply cloneable; every clone refers to the
/// same underlying table.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<ReentrantMutex<RefCell<IndexMap<String, Entry>>>>,
}

impl Storage {
    pub fn new() -> Storage {
        Storage { inner: Arc::new(ReentrantMutex::new(RefCell::new(IndexMap::new()))) }
    }

    /// Return the value under `key`, constructing it with `init` on miss.
    /// Re-entrant: `init` may itself call back into this `Storage`.
    pub fn get_or_insert<T, F>(&self, key: &str, init: F) -> crate::Result<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> T,
    {
        let guard = self.inner.lock();
        let mut table = guard.borrow_mut();
        if !table.contains_key(key) {
            table.insert(
                key.to_string(),
                Entry { type_id: TypeId::of::<T>(), type_name: std::any::type_name::<T>(), value: Box::new(init()) },
            );
        }
        let entry = table.get(key).expect("just inserted");
        downcast_clone::<T>(entry, key)
    }

    /// Return the value under `key`, failing if it is missing or was
    /// stored under a different type.
    pub fn get<T>(&self, key: &str) -> crate::Result<T>
    where
        T: Clone + Send + 'static,
    {
        let guard = self.inner.lock();
        let table = guard.borrow();
        let entry = table
            .get(key)
            .ok_or_else(|| StorageError::MissingKey(key.to_string()))?;
        downcast_clone::<T>(entry, key)
    }

    /// Overwrite (or create) the value under `key`.
    pub fn set<T>(&self, key: &str, value: T)
    where
        T: Send + 'static,
    {
        let guard = self.inner.lock();
        let mut table = guard.borrow_mut();
        table.insert(
            key.to_string(),
            Entry { type_id: TypeId::of::<T>(), type_name: std::any::type_name::<T>(), value: Box::new(value) },
        );
    }

    /// Remove the value under `key`, if present.
    pub fn remove(&self, key: &str) {
        let guard = self.inner.lock();
        guard.borrow_mut().shift_remove(key);
    }

    /// Drop every entry in reverse insertion order. Called once, at
    /// runtime shutdown.
    pub fn clear_in_reverse_order(&self) {
        let guard = self.inner.lock();
        let mut table = guard.borrow_mut();
        while !table.is_empty() {
            table.pop();
        }
    }
}

impl Default for Storage {
    fn default() -> Self {
        Storage::new()
    }
}

fn downcast_clone<T>(entry: &Entry, key: &str) -> crate::Result<T>
where
    T: Clone + Send + 'static,
{
    if entry.type_id != TypeId::of::<T>() {
        return Err(StorageError::TypeMismatch(format!(
            "{key} (stored as {}, requested as {})",
            entry.type_name,
            std::any::type_name::<T>()
        ))
        .into());
    }
    Ok(entry
        .value
        .downcast_ref::<T>()
        .expect("type id already checked")
        .clone())
}
