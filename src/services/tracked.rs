//! Registry of tracked threads.
//!
//! Insert and evict take a coarse map lock; diffing takes only the entry's
//! own lock, so different threads diff in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::models::{SourceId, ThreadPointer};
use crate::pipeline::ThreadTracker;

/// Shared handle to one thread's tracker.
pub type TrackerHandle = Arc<Mutex<ThreadTracker>>;

/// Lock a tracker entry, recovering from a poisoned lock.
pub fn lock_tracker(handle: &TrackerHandle) -> MutexGuard<'_, ThreadTracker> {
    handle.lock().unwrap_or_else(|e| e.into_inner())
}

/// At most one tracker per pointer.
#[derive(Debug, Default)]
pub struct TrackedThreads {
    entries: Mutex<HashMap<ThreadPointer, TrackerHandle>>,
}

impl TrackedThreads {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<ThreadPointer, TrackerHandle>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, pointer: &ThreadPointer) -> Option<TrackerHandle> {
        self.map().get(pointer).cloned()
    }

    pub fn contains(&self, pointer: &ThreadPointer) -> bool {
        self.map().contains_key(pointer)
    }

    /// Return the existing tracker, or insert the one built by `create`.
    ///
    /// The boolean is true when a new entry was inserted.
    pub fn get_or_insert_with(
        &self,
        pointer: &ThreadPointer,
        create: impl FnOnce() -> ThreadTracker,
    ) -> (TrackerHandle, bool) {
        let mut map = self.map();
        if let Some(existing) = map.get(pointer) {
            return (Arc::clone(existing), false);
        }
        let handle = Arc::new(Mutex::new(create()));
        map.insert(pointer.clone(), Arc::clone(&handle));
        (handle, true)
    }

    /// Drop a pointer's state. Returns whether it was tracked.
    pub fn remove(&self, pointer: &ThreadPointer) -> bool {
        self.map().remove(pointer).is_some()
    }

    /// Every tracked pointer of one board, with its tracker.
    pub fn entries_for(&self, source: &SourceId) -> Vec<(ThreadPointer, TrackerHandle)> {
        let mut entries: Vec<_> = self
            .map()
            .iter()
            .filter(|(pointer, _)| &pointer.source == source)
            .map(|(pointer, handle)| (pointer.clone(), Arc::clone(handle)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Post;

    fn tracker() -> ThreadTracker {
        ThreadTracker::start_tracking(Arc::new(|_: &Post| 0))
    }

    #[test]
    fn test_one_entry_per_pointer() {
        let tracked = TrackedThreads::new();
        let pointer = ThreadPointer::new(SourceId::new("a", "g"), 1);

        let (first, inserted) = tracked.get_or_insert_with(&pointer, tracker);
        assert!(inserted);
        let (second, inserted) = tracked.get_or_insert_with(&pointer, tracker);
        assert!(!inserted);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(tracked.len(), 1);
    }

    #[test]
    fn test_entries_for_filters_by_board() {
        let tracked = TrackedThreads::new();
        let g = SourceId::new("a", "g");
        for id in [3, 1, 2] {
            tracked.get_or_insert_with(&ThreadPointer::new(g.clone(), id), tracker);
        }
        tracked.get_or_insert_with(&ThreadPointer::new(SourceId::new("a", "v"), 9), tracker);

        let ids: Vec<u64> = tracked
            .entries_for(&g)
            .into_iter()
            .map(|(p, _)| p.thread_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_remove_untracks() {
        let tracked = TrackedThreads::new();
        let pointer = ThreadPointer::new(SourceId::new("a", "g"), 1);
        tracked.get_or_insert_with(&pointer, tracker);

        assert!(tracked.remove(&pointer));
        assert!(!tracked.remove(&pointer));
        assert!(!tracked.contains(&pointer));
        assert!(tracked.is_empty());
    }
}
