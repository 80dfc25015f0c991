//! Bounded set of delivered event ids.

use std::collections::{HashSet, VecDeque};

/// Remembers the most recent `capacity` event ids; once full, the oldest id
/// is forgotten first.
#[derive(Debug, Clone)]
pub struct SeenEvents {
    capacity: usize,
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenEvents {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ids: HashSet::with_capacity(capacity.min(1024)),
            order: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Record `id`. Returns `true` the first time an id is seen.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.ids.remove(&oldest);
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Make room for `additional` ids without rehashing mid-batch.
    pub fn reserve(&mut self, additional: usize) {
        let room = additional.min(self.capacity.saturating_sub(self.ids.len()));
        self.ids.reserve(room);
        self.order.reserve(room);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
