//! Thread-safe observer registry
//!
//! Observers are notified in registration order on the notifying task.
//! A notification round holds the read lock throughout, so `attach` and
//! `detach` wait for rounds in flight: once `detach` returns, the observer
//! is never called again. Callbacks must not touch the registry they are
//! being notified from; doing so deadlocks.

use std::sync::{Arc, PoisonError, RwLock};

/// Ordered collection of shared observers.
pub struct Observable<T: ?Sized> {
    observers: RwLock<Vec<Arc<T>>>,
}

impl<T: ?Sized> Observable<T> {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Register `observer`. Returns it for chaining.
    pub fn attach(&self, observer: Arc<T>) -> Arc<T> {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&observer));
        observer
    }

    /// Remove the first registration of `observer` (by pointer identity).
    pub fn detach(&self, observer: &Arc<T>) -> bool {
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        match observers.iter().position(|o| Arc::ptr_eq(o, observer)) {
            Some(index) => {
                observers.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.observers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `f` for each observer in order. The first error stops the
    /// iteration and is returned.
    pub fn notify<E>(&self, mut f: impl FnMut(&T) -> Result<(), E>) -> Result<(), E> {
        let observers = self.observers.read().unwrap_or_else(PoisonError::into_inner);
        for observer in observers.iter() {
            f(observer)?;
        }
        Ok(())
    }
}

impl<T: ?Sized> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}
