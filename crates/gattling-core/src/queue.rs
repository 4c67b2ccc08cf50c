//! Update notification queue
//!
//! The embedding application pushes (object path, interface name) pairs when
//! data behind a characteristic or descriptor changes; the server worker
//! drains one entry per processing tick and invokes the matching update
//! callback. Entries are pushed at the front and popped from the back, so
//! delivery is FIFO. This is the one data structure that crosses the
//! application/worker thread boundary, guarded by a single mutex.

use std::collections::VecDeque;
use std::sync::Mutex;

// ----------------------------------------------------------------------------
// Update Queue
// ----------------------------------------------------------------------------

/// One pending update notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEntry {
    pub object_path: String,
    pub interface_name: String,
}

/// Thread-safe queue of pending update notifications.
///
/// Shared as `Arc<UpdateQueue>` between the server handle (producer side)
/// and the worker (consumer side).
#[derive(Debug, Default)]
pub struct UpdateQueue {
    entries: Mutex<VecDeque<UpdateEntry>>,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an update to the front of the queue.
    pub fn push(&self, object_path: impl Into<String>, interface_name: impl Into<String>) {
        let entry = UpdateEntry {
            object_path: object_path.into(),
            interface_name: interface_name.into(),
        };
        self.entries
            .lock()
            .expect("update queue mutex poisoned")
            .push_front(entry);
    }

    /// Take the next update from the back of the queue.
    ///
    /// With `keep` set the entry is returned but left in place, so the next
    /// pop sees it again (idempotent re-delivery).
    pub fn pop(&self, keep: bool) -> Option<UpdateEntry> {
        let mut entries = self.entries.lock().expect("update queue mutex poisoned");
        if keep {
            entries.back().cloned()
        } else {
            entries.pop_back()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("update queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("update queue mutex poisoned")
            .clear();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_on_empty_returns_none() {
        let queue = UpdateQueue::new();
        assert!(queue.pop(false).is_none());
        assert!(queue.pop(true).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn keep_leaves_entry_in_place() {
        let queue = UpdateQueue::new();
        queue.push("/com/gattling/battery/level", "org.bluez.GattCharacteristic1");

        let peeked = queue.pop(true).unwrap();
        assert_eq!(peeked.object_path, "/com/gattling/battery/level");
        assert_eq!(queue.len(), 1);

        let taken = queue.pop(false).unwrap();
        assert_eq!(taken, peeked);
        assert!(queue.is_empty());
    }

    #[test]
    fn drains_in_fifo_order() {
        let queue = UpdateQueue::new();
        for i in 0..5 {
            queue.push(format!("/path/{i}"), "org.bluez.GattCharacteristic1");
        }
        assert_eq!(queue.len(), 5);

        for i in 0..5 {
            let entry = queue.pop(false).unwrap();
            assert_eq!(entry.object_path, format!("/path/{i}"));
        }
        assert!(queue.pop(false).is_none());
    }

    #[test]
    fn clear_empties_queue() {
        let queue = UpdateQueue::new();
        queue.push("/a", "i");
        queue.push("/b", "i");
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }
}
