//! Versioned copy-on-write snapshot cell
//!
//! Readers (including the real-time thread) get a consistent value without
//! blocking or allocating. Writers clone, modify and swap in a whole new
//! value; writers are serialized among themselves by a mutex the readers never
//! touch.
//!
//! The value replaced by a publish is parked on the writer side until the
//! next publish, so a reader holding a guard across one edit never ends up
//! dropping the last reference (and freeing) on its own thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::{ArcSwap, Guard};
use parking_lot::Mutex;

pub struct Snapshot<T> {
    current: ArcSwap<T>,
    version: AtomicU64,
    /// Serializes writers and holds the previously published value
    retired: Mutex<Option<Arc<T>>>,
}

impl<T> Snapshot<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: ArcSwap::from_pointee(value),
            version: AtomicU64::new(0),
            retired: Mutex::new(None),
        }
    }

    /// Lock-free read of the current value
    #[inline]
    pub fn load(&self) -> Guard<Arc<T>> {
        self.current.load()
    }

    /// Owned handle to the current value (bumps a refcount)
    pub fn load_full(&self) -> Arc<T> {
        self.current.load_full()
    }

    /// Incremented once per publish
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Replace the value wholesale
    pub fn publish(&self, value: T) {
        let mut retired = self.retired.lock();
        let previous = self.current.swap(Arc::new(value));
        self.version.fetch_add(1, Ordering::AcqRel);
        // Dropping the older retired value here frees it on the writer thread
        *retired = Some(previous);
    }
}

impl<T: Clone> Snapshot<T> {
    /// Clone the current value, edit the copy, publish it.
    ///
    /// Returns whatever the edit closure returns.
    pub fn update<R>(&self, edit: impl FnOnce(&mut T) -> R) -> R {
        let mut retired = self.retired.lock();
        let mut next = T::clone(&self.current.load());
        let out = edit(&mut next);
        let previous = self.current.swap(Arc::new(next));
        self.version.fetch_add(1, Ordering::AcqRel);
        *retired = Some(previous);
        out
    }
}

impl<T: Default> Default for Snapshot<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Snapshot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("version", &self.version())
            .field("current", &*self.load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_reader_keeps_consistent_value() {
        let cell = Snapshot::new(vec![1, 2, 3]);
        let guard = cell.load();

        cell.update(|v| v.push(4));

        // Old guard still sees the value it loaded
        assert_eq!(guard.len(), 3);
        assert_eq!(cell.load().len(), 4);
        assert_eq!(cell.version(), 1);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let cell = Arc::new(Snapshot::new(0u32));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    for _ in 0..250 {
                        cell.update(|v| *v += 1);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(**cell.load(), 1000);
        assert_eq!(cell.version(), 1000);
    }

    #[test]
    fn test_publish_replaces_value() {
        let cell = Snapshot::new("a".to_string());
        cell.publish("b".to_string());
        assert_eq!(cell.load().as_str(), "b");
        assert_eq!(*cell.load_full(), "b");
    }
}
