use std::collections::{HashSet, VecDeque};

use bytes::Bytes;

/// The last `capacity` duplicate ids seen on one address, oldest first.
#[derive(Debug)]
pub struct DuplicateIdCache {
    capacity: usize,
    order: VecDeque<(Bytes, u64)>,
    ids: HashSet<Bytes>,
}

impl DuplicateIdCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    pub fn contains(&self, id: &[u8]) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Remembers `id`, stored under journal record `record_id`. Returns the
    /// record ids of entries pushed out of the cache.
    pub fn add(&mut self, id: Bytes, record_id: u64) -> Vec<u64> {
        if !self.ids.insert(id.clone()) {
            return Vec::new();
        }
        self.order.push_back((id, record_id));
        let mut evicted = Vec::new();
        while self.order.len() > self.capacity {
            if let Some((old, record)) = self.order.pop_front() {
                self.ids.remove(&old);
                evicted.push(record);
            }
        }
        evicted
    }
}
