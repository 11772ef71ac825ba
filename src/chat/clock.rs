//! Lamport logical clock shared by every connection task of one process.
//!
//! One counter behind one lock. `tick` stamps a local event, `merge` folds in
//! a timestamp observed from a remote party. The value lives only as long as
//! the process; ordering across restarts is not a goal.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Thread-safe Lamport clock.
#[derive(Debug, Default)]
pub struct LamportClock {
    value: Mutex<u64>,
}

impl LamportClock {
    /// Create a clock starting at 0.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        // A panic while holding the guard cannot leave the counter half-written.
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advance by one and return the new value.
    pub fn tick(&self) -> u64 {
        let mut value = self.lock();
        *value += 1;
        *value
    }

    /// Observe a remote timestamp: `max(current, received) + 1`.
    pub fn merge(&self, received: u64) -> u64 {
        let mut value = self.lock();
        *value = (*value).max(received) + 1;
        *value
    }

    /// Current value, without advancing.
    pub fn peek(&self) -> u64 {
        *self.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn starts_at_zero() {
        let clock = LamportClock::new();
        assert_eq!(clock.peek(), 0);
    }

    #[test]
    fn tick_increments_and_returns() {
        let clock = LamportClock::new();
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.peek(), 2);
    }

    #[test]
    fn merge_takes_max_plus_one() {
        let clock = LamportClock::new();
        clock.tick();
        clock.tick();

        // Remote is ahead.
        assert_eq!(clock.merge(10), 11);
        // Remote is behind; local value still advances.
        assert_eq!(clock.merge(3), 12);
        // Equal.
        assert_eq!(clock.merge(12), 13);
    }

    #[test]
    fn tick_after_merge_is_one_more() {
        let clock = LamportClock::new();
        let merged = clock.merge(41);
        assert_eq!(merged, 42);
        assert_eq!(clock.tick(), merged + 1);
    }

    #[test]
    fn peek_does_not_mutate() {
        let clock = LamportClock::new();
        clock.tick();
        assert_eq!(clock.peek(), 1);
        assert_eq!(clock.peek(), 1);
    }

    #[test]
    fn concurrent_ticks_are_never_lost() {
        let clock = Arc::new(LamportClock::new());
        let v0 = clock.merge(99); // 100
        let threads = 8;
        let per_thread = 1_000;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let clock = Arc::clone(&clock);
                std::thread::spawn(move || {
                    for _ in 0..per_thread {
                        clock.tick();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(clock.peek(), v0 + (threads * per_thread) as u64);
    }

    #[test]
    fn concurrent_ticks_are_unique() {
        let clock = Arc::new(LamportClock::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = Arc::clone(&clock);
                std::thread::spawn(move || (0..500).map(|_| clock.tick()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 2_000);
        assert_eq!(seen.first(), Some(&1));
        assert_eq!(seen.last(), Some(&2_000));
    }
}
