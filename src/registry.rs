//! Handle registry: the single owner of every loaded [`NativeContext`].
//!
//! One mutex guards both the handle map and the next-handle counter, so
//! register, lookup and release are each one atomic section. Handles start
//! at 1, only go up, and are never reused.
//!
//! Each context sits behind its own lock. [`HandleRegistry::lookup`] hands
//! out a [`ContextLease`] that keeps the context alive while a caller uses
//! it: a concurrent release removes the handle at once, and the context is
//! destroyed when the last in-flight lease is done with it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::inference::engine::NativeContext;

/// Opaque caller-facing identifier of a loaded context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelHandle(u64);

impl ModelHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Invalid context handle: {0}")]
    InvalidHandle(ModelHandle),

    #[error("Context limit reached ({limit} live)")]
    LimitReached { limit: usize },
}

type SharedContext = Arc<Mutex<NativeContext>>;

struct RegistryInner {
    contexts: HashMap<ModelHandle, SharedContext>,
    next_id: u64,
}

impl RegistryInner {
    fn insert(&mut self, context: SharedContext) -> ModelHandle {
        let handle = ModelHandle(self.next_id);
        self.next_id += 1;
        self.contexts.insert(handle, context);
        handle
    }
}

/// Thread-safe registry of loaded contexts.
pub struct HandleRegistry {
    inner: Mutex<RegistryInner>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                contexts: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Take ownership of `context` and return its new handle.
    pub fn register(&self, context: NativeContext) -> ModelHandle {
        let path = context.model_path().display().to_string();
        let shared = Arc::new(Mutex::new(context));
        let mut inner = self.inner.lock();
        let handle = inner.insert(shared);
        let live = inner.contexts.len();
        drop(inner);

        info!(handle = handle.id(), path, live, "Registered context");
        handle
    }

    /// Like [`register`](Self::register), but refuses once `limit` contexts
    /// are live. A refused context is dropped and consumes no handle.
    pub fn register_within(&self, context: NativeContext, limit: usize) -> Result<ModelHandle, RegistryError> {
        let path = context.model_path().display().to_string();
        let shared = Arc::new(Mutex::new(context));
        let mut inner = self.inner.lock();
        if inner.contexts.len() >= limit {
            drop(inner);
            warn!(limit, path, "Context limit reached, dropping loaded context");
            return Err(RegistryError::LimitReached { limit });
        }
        let handle = inner.insert(shared);
        let live = inner.contexts.len();
        drop(inner);

        info!(handle = handle.id(), path, live, "Registered context");
        Ok(handle)
    }

    /// Resolve `handle` for use. Ownership stays with the registry.
    pub fn lookup(&self, handle: ModelHandle) -> Result<ContextLease, RegistryError> {
        let inner = self.inner.lock();
        inner
            .contexts
            .get(&handle)
            .map(|context| ContextLease {
                handle,
                context: Arc::clone(context),
            })
            .ok_or(RegistryError::InvalidHandle(handle))
    }

    /// Drop the entry for `handle`. Unknown or already-released handles are a no-op.
    ///
    /// Returns whether a live entry was removed.
    pub fn release(&self, handle: ModelHandle) -> bool {
        let removed = self.inner.lock().contexts.remove(&handle);
        match removed {
            Some(context) => {
                // Destroyed here unless a lease is still in use.
                drop(context);
                info!(handle = handle.id(), "Released context");
                true
            }
            None => {
                debug!(handle = handle.id(), "Release of unknown handle ignored");
                false
            }
        }
    }

    /// Release every live context. Returns how many were removed.
    pub fn release_all(&self) -> usize {
        let drained: Vec<_> = self.inner.lock().contexts.drain().collect();
        let count = drained.len();
        drop(drained);
        if count > 0 {
            info!(count, "Released all contexts");
        }
        count
    }

    /// Live handles in ascending order.
    pub fn handles(&self) -> Vec<ModelHandle> {
        let mut handles: Vec<_> = self.inner.lock().contexts.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    pub fn len(&self) -> usize {
        self.inner.lock().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Temporary access to a registered context.
///
/// Holding a lease keeps the context alive past a concurrent release; do
/// not store it beyond the operation it was looked up for.
pub struct ContextLease {
    handle: ModelHandle,
    context: SharedContext,
}

impl ContextLease {
    pub fn handle(&self) -> ModelHandle {
        self.handle
    }

    /// Run `f` with exclusive access to the context.
    pub fn with<R>(&self, f: impl FnOnce(&mut NativeContext) -> R) -> R {
        let mut context = self.context.lock();
        f(&mut context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::llama_ffi::{LlamaEngine, LoadParams};
    use crate::loader::tiers::SelectedTier;
    use std::path::PathBuf;

    fn context(name: &str) -> NativeContext {
        NativeContext::new(
            Box::new(LlamaEngine::new()),
            PathBuf::from(name),
            SelectedTier {
                index: 0,
                name: "normal".to_string(),
                params: LoadParams::default(),
            },
            None,
        )
    }

    #[test]
    fn test_handles_start_at_one_and_increase() {
        let registry = HandleRegistry::new();
        let a = registry.register(context("a"));
        let b = registry.register(context("b"));
        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_handles_not_reused_after_release() {
        let registry = HandleRegistry::new();
        let a = registry.register(context("a"));
        registry.release(a);
        let b = registry.register(context("b"));
        assert!(b > a);
    }

    #[test]
    fn test_lookup_after_release_is_invalid() {
        let registry = HandleRegistry::new();
        let handle = registry.register(context("a"));
        assert!(registry.lookup(handle).is_ok());
        assert!(registry.release(handle));
        assert_eq!(
            registry.lookup(handle).err(),
            Some(RegistryError::InvalidHandle(handle))
        );
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = HandleRegistry::new();
        let handle = registry.register(context("a"));
        assert!(registry.release(handle));
        assert!(!registry.release(handle));
        assert!(!registry.release(ModelHandle::new(999)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_lease_outlives_release() {
        let registry = HandleRegistry::new();
        let handle = registry.register(context("kept"));
        let lease = registry.lookup(handle).unwrap();
        registry.release(handle);

        let path = lease.with(|ctx| ctx.model_path().to_path_buf());
        assert_eq!(path, PathBuf::from("kept"));
        assert!(registry.lookup(handle).is_err());
    }

    #[test]
    fn test_release_all() {
        let registry = HandleRegistry::new();
        registry.register(context("a"));
        registry.register(context("b"));
        assert_eq!(registry.release_all(), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.register(context("c")).id(), 3);
    }

    #[test]
    fn test_register_within_limit() {
        let registry = HandleRegistry::new();
        let a = registry.register_within(context("a"), 1).unwrap();
        assert_eq!(
            registry.register_within(context("b"), 1),
            Err(RegistryError::LimitReached { limit: 1 })
        );
        assert_eq!(registry.handles(), vec![a]);

        registry.release(a);
        // The refused context did not consume a handle.
        assert_eq!(registry.register_within(context("c"), 1).unwrap().id(), 2);
    }

    #[test]
    fn test_handles_sorted() {
        let registry = HandleRegistry::new();
        let a = registry.register(context("a"));
        let b = registry.register(context("b"));
        let c = registry.register(context("c"));
        registry.release(b);
        assert_eq!(registry.handles(), vec![a, c]);
    }
}
