//! Fixed-capacity FIFO that evicts its oldest item on overflow.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append `item`, returning the evicted oldest item when full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }
}

impl<T: Clone> RingBuffer<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_items_in_arrival_order() {
        let mut buf = RingBuffer::new(3);
        assert!(buf.is_empty());
        buf.push(1);
        buf.push(2);
        assert_eq!(buf.to_vec(), vec![1, 2]);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut buf = RingBuffer::new(3);
        for i in 1..=3 {
            assert_eq!(buf.push(i), None);
        }
        assert_eq!(buf.push(4), Some(1));
        assert_eq!(buf.push(5), Some(2));
        assert_eq!(buf.to_vec(), vec![3, 4, 5]);
        assert_eq!(buf.len(), buf.capacity());
    }

    #[test]
    fn zero_capacity_holds_one_item() {
        let mut buf = RingBuffer::new(0);
        buf.push("a");
        assert_eq!(buf.push("b"), Some("a"));
        assert_eq!(buf.to_vec(), vec!["b"]);
    }

    #[test]
    fn large_capacity_does_not_preallocate_everything() {
        let mut buf: RingBuffer<u32> = RingBuffer::new(10_000);
        for i in 0..10_050 {
            buf.push(i);
        }
        assert_eq!(buf.len(), 10_000);
        assert_eq!(buf.iter().next(), Some(&50));
        assert_eq!(buf.iter().next_back(), Some(&10_049));
    }
}
