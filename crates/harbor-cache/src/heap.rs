//! Min-heap of expiry deadlines with stable key lookup.
//!
//! Entries live in a `Vec` in heap order; a `HashMap` maps each key to its
//! current slot and is rewritten on every swap, so removal and update by
//! key stay O(log n).

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

/// One tracked key and when it expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapEntry {
    pub key: String,
    pub expires: Instant,
}

/// Deadline heap that notifies when its head changes.
#[derive(Debug)]
pub struct ExpiryHeap {
    entries: Vec<HeapEntry>,
    slots: HashMap<String, usize>,
    notify: mpsc::Sender<()>,
}

impl ExpiryHeap {
    /// Create an empty heap and the receiving half of its notification
    /// channel. At most one notification is ever pending.
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (notify, rx) = mpsc::channel(1);
        let heap = Self {
            entries: Vec::new(),
            slots: HashMap::new(),
            notify,
        };
        (heap, rx)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry that expires soonest.
    pub fn next(&self) -> Option<&HeapEntry> {
        self.entries.first()
    }

    /// Current heap slot of `key`.
    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.slots.get(key).copied()
    }

    pub fn get(&self, index: usize) -> Option<&HeapEntry> {
        self.entries.get(index)
    }

    /// Track `key` expiring `ttl` from now. A key already present is
    /// re-armed instead. Returns the key's slot after the insert.
    pub fn add(&mut self, key: impl Into<String>, ttl: Duration) -> usize {
        let key = key.into();
        if let Some(index) = self.index_of(&key) {
            self.update(index, ttl);
            return self.index_of(&key).unwrap_or(index);
        }
        let head = self.head();
        let index = self.entries.len();
        self.slots.insert(key.clone(), index);
        self.entries.push(HeapEntry {
            key: key.clone(),
            expires: Instant::now() + ttl,
        });
        self.sift_up(index);
        self.notify_if_head_changed(head);
        self.index_of(&key).unwrap_or(index)
    }

    /// Remove the entry at `index`. `None` if the slot is empty.
    pub fn remove(&mut self, index: usize) -> Option<HeapEntry> {
        if index >= self.entries.len() {
            return None;
        }
        let head = self.head();
        let last = self.entries.len() - 1;
        self.swap(index, last);
        let removed = self.entries.pop()?;
        self.slots.remove(&removed.key);
        if index < self.entries.len() {
            self.fix(index);
        }
        self.notify_if_head_changed(head);
        Some(removed)
    }

    /// Remove `key` if tracked.
    pub fn remove_key(&mut self, key: &str) -> Option<HeapEntry> {
        let index = self.index_of(key)?;
        self.remove(index)
    }

    /// Re-arm the entry at `index` to expire `ttl` from now. Returns false
    /// if the slot is empty.
    pub fn update(&mut self, index: usize, ttl: Duration) -> bool {
        if index >= self.entries.len() {
            return false;
        }
        let head = self.head();
        self.entries[index].expires = Instant::now() + ttl;
        self.fix(index);
        self.notify_if_head_changed(head);
        true
    }

    fn head(&self) -> Option<(String, Instant)> {
        self.entries.first().map(|e| (e.key.clone(), e.expires))
    }

    fn notify_if_head_changed(&self, before: Option<(String, Instant)>) {
        if self.head() != before {
            // Full means a wakeup is already pending.
            let _ = self.notify.try_send(());
        }
    }

    fn swap(&mut self, i: usize, j: usize) {
        if i == j {
            return;
        }
        self.entries.swap(i, j);
        if let Some(slot) = self.slots.get_mut(&self.entries[i].key) {
            *slot = i;
        }
        if let Some(slot) = self.slots.get_mut(&self.entries[j].key) {
            *slot = j;
        }
    }

    fn fix(&mut self, index: usize) {
        if !self.sift_down(index) {
            self.sift_up(index);
        }
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.entries[index].expires >= self.entries[parent].expires {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    /// Returns true if the entry moved.
    fn sift_down(&mut self, start: usize) -> bool {
        let n = self.entries.len();
        let mut index = start;
        loop {
            let left = 2 * index + 1;
            if left >= n {
                break;
            }
            let right = left + 1;
            let child = if right < n && self.entries[right].expires < self.entries[left].expires {
                right
            } else {
                left
            };
            if self.entries[child].expires >= self.entries[index].expires {
                break;
            }
            self.swap(index, child);
            index = child;
        }
        index > start
    }
}
