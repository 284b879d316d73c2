//! Observer lists for lifecycle notifications.

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::DisconnectReason;
use crate::transport::entity::Entity;

/// Observer of a single entity event.
pub type EntityObserver = dyn Fn(&Arc<Entity>) + Send + Sync;

/// Observer of a teardown, with the reason that won.
pub type DisconnectObserver = dyn Fn(&Arc<Entity>, DisconnectReason) + Send + Sync;

/// Subscriber list.
///
/// Firing works on a snapshot (or a drained copy), so observers may subscribe
/// or fire further events without deadlocking.
pub struct ObserverList<F: ?Sized> {
    observers: Mutex<Vec<Arc<F>>>,
}

impl<F: ?Sized> ObserverList<F> {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, observer: Arc<F>) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Copy of the current observers; the list is kept.
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain the list. Used for one-shot events.
    pub fn take(&self) -> Vec<Arc<F>> {
        std::mem::take(&mut *self.observers.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<F: ?Sized> Default for ObserverList<F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_drains_and_snapshot_keeps() {
        let list: ObserverList<dyn Fn() -> u8 + Send + Sync> = ObserverList::new();
        list.subscribe(Arc::new(|| 1));
        list.subscribe(Arc::new(|| 2));

        let snapshot: Vec<u8> = list.snapshot().iter().map(|f| f()).collect();
        assert_eq!(snapshot, vec![1, 2]);
        assert_eq!(list.len(), 2);

        assert_eq!(list.take().len(), 2);
        assert!(list.is_empty());
        assert!(list.take().is_empty());
    }
}
