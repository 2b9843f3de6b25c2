//! Time-bounded set of request ids known to have timed out locally.
//!
//! When a call's ttl fires, its id is buried here for the same ttl so that a
//! late response can be told apart from a genuinely unknown id and dropped
//! without noise. Expired entries are reclaimed lazily on access.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct Tombstones {
    entries: HashMap<u32, Instant>,
}

impl Tombstones {
    pub fn new() -> Tombstones {
        Tombstones {
            entries: HashMap::new(),
        }
    }

    /// Record that `id` timed out and should be ignored for another `ttl`.
    pub fn add(&mut self, id: u32, ttl: Duration) {
        self.sweep();
        self.entries.insert(id, Instant::now() + ttl);
    }

    /// True iff `id` was buried and has not expired yet.
    pub fn contains(&mut self, id: u32) -> bool {
        match self.entries.get(&id) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                self.entries.remove(&id);
                false
            }
            None => false,
        }
    }

    /// Drop all entries, expired or not.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, expiry| *expiry > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn contains_until_expiry_test() {
        let mut tombstones = Tombstones::new();
        tombstones.add(7, Duration::from_millis(50));

        assert!(tombstones.contains(7));
        assert!(!tombstones.contains(8));

        tokio::time::advance(Duration::from_millis(51)).await;
        assert!(!tombstones.contains(7));
        assert!(tombstones.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn add_sweeps_expired_entries_test() {
        let mut tombstones = Tombstones::new();
        tombstones.add(1, Duration::from_millis(10));
        tombstones.add(2, Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(20)).await;
        tombstones.add(3, Duration::from_millis(10));

        assert_eq!(tombstones.len(), 2);
        assert!(tombstones.contains(2));
        assert!(tombstones.contains(3));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_test() {
        let mut tombstones = Tombstones::new();
        tombstones.add(1, Duration::from_secs(60));
        tombstones.clear();

        assert!(!tombstones.contains(1));
        assert!(tombstones.is_empty());
    }
}
