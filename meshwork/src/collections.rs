//! Ordered, deduplicating queue.
//!
//! [`HashedQueue`] keeps insertion order like a `VecDeque` and answers
//! membership in O(1) like a `HashSet`. It backs both the pending
//! discovery requests and the round-robin destination lists of the
//! routing tables.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// Insertion-ordered set with an optional length bound.
#[derive(Debug, Clone)]
pub struct HashedQueue<T> {
    order: VecDeque<T>,
    members: HashSet<T>,
    max_len: Option<usize>,
}

impl<T: Clone + Eq + Hash> HashedQueue<T> {
    /// Create an unbounded queue.
    pub fn new() -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            max_len: None,
        }
    }

    /// Create a queue that rejects items once `max_len` are queued.
    pub fn bounded(max_len: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            max_len: Some(max_len),
        }
    }

    /// Append `item` unless it is already queued or the queue is full.
    ///
    /// Returns `true` if the item was added.
    pub fn try_enqueue(&mut self, item: T) -> bool {
        if self.members.contains(&item) {
            return false;
        }
        if let Some(max) = self.max_len {
            if self.order.len() >= max {
                return false;
            }
        }
        self.members.insert(item.clone());
        self.order.push_back(item);
        true
    }

    /// Copy up to `count` items from the head without removing them.
    pub fn peek(&self, count: usize) -> Vec<T> {
        self.order.iter().take(count).cloned().collect()
    }

    /// Remove every item in `items` that is queued.
    pub fn remove_all(&mut self, items: &[T]) {
        for item in items {
            self.remove(item);
        }
    }

    /// Remove a single item. Returns `true` if it was queued.
    pub fn remove(&mut self, item: &T) -> bool {
        if !self.members.remove(item) {
            return false;
        }
        if let Some(pos) = self.order.iter().position(|queued| queued == item) {
            self.order.remove(pos);
        }
        true
    }

    /// Return the head and move it to the tail.
    pub fn rotate(&mut self) -> Option<T> {
        let head = self.order.pop_front()?;
        self.order.push_back(head.clone());
        Some(head)
    }

    /// Whether `item` is queued.
    pub fn contains(&self, item: &T) -> bool {
        self.members.contains(item)
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterate in queue order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.order.iter()
    }
}

impl<T: Clone + Eq + Hash> Default for HashedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
