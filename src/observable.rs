//! Published values that notify subscribers with `(old, new)` on every change.

use tokio::sync::broadcast;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// A single mutation of an [`Observable`].
#[derive(Debug, Clone, PartialEq)]
pub struct Change<T> {
    pub old: T,
    pub new: T,
}

/// Stored value plus a broadcast of every mutation.
///
/// Mutation happens on whoever owns the value; subscribers only ever see
/// [`Change`] events, in the order the owner applied them.
#[derive(Debug)]
pub struct Observable<T> {
    value: T,
    changes: broadcast::Sender<Change<T>>,
}

impl<T: Clone> Observable<T> {
    pub fn new(value: T) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { value, changes }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Replace the value and emit the change, returning the previous value.
    pub fn set(&mut self, new: T) -> T {
        let old = std::mem::replace(&mut self.value, new.clone());
        // No subscribers is not an error
        let _ = self.changes.send(Change {
            old: old.clone(),
            new,
        });
        old
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Change<T>> {
        self.changes.subscribe()
    }
}

impl<T: Clone + Default> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_emits_old_and_new() {
        let mut value = Observable::new(1u32);
        let mut rx = value.subscribe();

        assert_eq!(value.set(2), 1);
        assert_eq!(value.set(3), 2);
        assert_eq!(*value.get(), 3);

        assert_eq!(
            rx.try_recv().expect("Test operation should succeed"),
            Change { old: 1, new: 2 }
        );
        assert_eq!(
            rx.try_recv().expect("Test operation should succeed"),
            Change { old: 2, new: 3 }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_set_without_subscribers() {
        let mut value: Observable<Option<String>> = Observable::default();
        value.set(Some("a".to_string()));
        assert_eq!(value.get().as_deref(), Some("a"));
    }
}
