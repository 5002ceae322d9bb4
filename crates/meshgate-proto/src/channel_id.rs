//! Cyclic channel id allocation

use crate::ChannelId;
use parking_lot::Mutex;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelIdError {
    #[error("No available channel ids")]
    Exhausted,
}

#[derive(Debug)]
struct AllocatorState {
    next: ChannelId,
    in_use: HashSet<ChannelId>,
}

/// Hands out ids from `1..=u32::MAX`, wrapping back to 1 and skipping ids
/// still in use. Id 0 is reserved as the "close all" sentinel.
#[derive(Debug)]
pub struct ChannelIdAllocator {
    state: Mutex<AllocatorState>,
}

impl ChannelIdAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    fn starting_at(next: ChannelId) -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                next: next.max(1),
                in_use: HashSet::new(),
            }),
        }
    }

    pub fn allocate(&self) -> Result<ChannelId, ChannelIdError> {
        let mut state = self.state.lock();
        let start = state.next;
        loop {
            let id = state.next;
            state.next = if id == ChannelId::MAX { 1 } else { id + 1 };

            if state.in_use.insert(id) {
                return Ok(id);
            }
            if state.next == start {
                return Err(ChannelIdError::Exhausted);
            }
        }
    }

    /// Return an id to the pool; false if it was not allocated
    pub fn release(&self, id: ChannelId) -> bool {
        self.state.lock().in_use.remove(&id)
    }

    pub fn is_in_use(&self, id: ChannelId) -> bool {
        self.state.lock().in_use.contains(&id)
    }

    pub fn in_use(&self) -> usize {
        self.state.lock().in_use.len()
    }
}

impl Default for ChannelIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocation_starts_at_one() {
        let ids = ChannelIdAllocator::new();
        assert_eq!(ids.allocate().unwrap(), 1);
        assert_eq!(ids.allocate().unwrap(), 2);
        assert_eq!(ids.in_use(), 2);
    }

    #[test]
    fn test_wraps_to_one_and_skips_ids_in_use() {
        let ids = ChannelIdAllocator::starting_at(u32::MAX - 1);
        assert_eq!(ids.allocate().unwrap(), u32::MAX - 1);
        assert_eq!(ids.allocate().unwrap(), u32::MAX);
        assert_eq!(ids.allocate().unwrap(), 1);

        // 2 is held by a long-lived channel when the cursor comes back around
        let ids = ChannelIdAllocator::new();
        let one = ids.allocate().unwrap();
        let two = ids.allocate().unwrap();
        assert!(ids.release(one));
        ids.state.lock().next = u32::MAX;
        assert_eq!(ids.allocate().unwrap(), u32::MAX);
        assert_eq!(ids.allocate().unwrap(), one);
        assert_eq!(ids.allocate().unwrap(), 3);
        assert!(ids.is_in_use(two));
    }

    #[test]
    fn test_no_id_issued_twice_while_in_use() {
        let ids = ChannelIdAllocator::new();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(ids.allocate().unwrap()));
        }
        assert!(ids.release(500));
        assert!(!ids.release(500));
        assert!(!ids.is_in_use(500));
    }
}
