//! Bounded window of recently seen dedup keys

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// Remembers the most recent keys, evicting the oldest at capacity and any
/// key older than the TTL.
#[derive(Debug)]
pub struct SeenWindow<K> {
    capacity: usize,
    ttl: Option<Duration>,
    order: VecDeque<(K, DateTime<Utc>)>,
    seen: HashSet<K>,
}

impl<K: Hash + Eq + Clone> SeenWindow<K> {
    /// Create a window holding at most `capacity` keys
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            order: VecDeque::with_capacity(capacity.min(4096)),
            seen: HashSet::new(),
        }
    }

    /// Record `key`; returns false if it was already in the window
    pub fn insert(&mut self, key: K) -> bool {
        self.insert_at(key, Utc::now())
    }

    pub(crate) fn insert_at(&mut self, key: K, now: DateTime<Utc>) -> bool {
        self.expire(now);
        if self.seen.contains(&key) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back((key, now));
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.seen.contains(key)
    }

    /// Remove expired keys
    pub fn cleanup(&mut self) {
        self.expire(Utc::now());
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        let Some(ttl) = self.ttl else {
            return;
        };
        while let Some((key, at)) = self.order.front() {
            if *at + ttl > now {
                break;
            }
            self.seen.remove(key);
            self.order.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_detected() {
        let mut window = SeenWindow::new(4, None);

        assert!(window.insert(1u64));
        assert!(!window.insert(1u64));
        assert!(window.insert(2u64));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_oldest_evicted_at_capacity() {
        let mut window = SeenWindow::new(3, None);
        for key in 0..4u64 {
            assert!(window.insert(key));
        }

        assert_eq!(window.len(), 3);
        assert!(!window.contains(&0));
        assert!(window.contains(&3));
        assert!(window.insert(0));
    }

    #[test]
    fn test_ttl_expiry() {
        let mut window = SeenWindow::new(10, Some(Duration::seconds(60)));
        let start = Utc::now();

        assert!(window.insert_at(1u64, start));
        assert!(!window.insert_at(1u64, start + Duration::seconds(30)));
        assert!(window.insert_at(1u64, start + Duration::seconds(61)));
        assert_eq!(window.len(), 1);
    }
}
