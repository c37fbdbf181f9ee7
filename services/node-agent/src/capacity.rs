//! Trailing one-minute request counter.

use std::sync::{Mutex, PoisonError};

/// Number of one-second buckets in the window.
pub const WINDOW_BUCKETS: usize = 60;

/// Sixty per-second request buckets in a ring.
///
/// `head` is the bucket currently receiving requests. Rotating sums every
/// bucket, then retires the oldest one by zeroing it and making it the new
/// head, so the window always holds exactly [`WINDOW_BUCKETS`] buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityWindow {
    buckets: [u64; WINDOW_BUCKETS],
    head: usize,
}

impl CapacityWindow {
    pub fn new() -> Self {
        Self {
            buckets: [0; WINDOW_BUCKETS],
            head: WINDOW_BUCKETS - 1,
        }
    }

    pub fn add_request(&mut self) {
        self.buckets[self.head] = self.buckets[self.head].saturating_add(1);
    }

    /// Requests currently held by the window.
    pub fn total(&self) -> u64 {
        self.buckets.iter().sum()
    }

    /// Sum the window, then evict the oldest bucket and open a fresh one.
    pub fn rotate(&mut self) -> u64 {
        let total = self.total();
        let oldest = (self.head + 1) % WINDOW_BUCKETS;
        self.buckets[oldest] = 0;
        self.head = oldest;
        total
    }
}

impl Default for CapacityWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe handle around a [`CapacityWindow`].
///
/// Counting a request holds the lock for a single increment.
#[derive(Debug, Default)]
pub struct RequestCounter {
    window: Mutex<CapacityWindow>,
}

impl RequestCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_request(&self) {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add_request();
    }

    /// See [`CapacityWindow::rotate`].
    pub fn rotate(&self) -> u64 {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rotate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_rotate_reports_trailing_minute() {
        let mut window = CapacityWindow::new();
        for _ in 0..5 {
            window.add_request();
        }
        assert_eq!(window.rotate(), 5);

        window.add_request();
        assert_eq!(window.rotate(), 6);

        // 57 more rotations keep the first five inside the window
        for _ in 0..57 {
            window.rotate();
        }
        assert_eq!(window.total(), 6);

        // the 60th rotation after the first batch retires it
        window.rotate();
        assert_eq!(window.total(), 1);
        window.rotate();
        assert_eq!(window.total(), 0);
    }

    #[test]
    fn test_window_always_has_sixty_buckets() {
        let mut window = CapacityWindow::new();
        for _ in 0..(WINDOW_BUCKETS * 3 + 7) {
            window.add_request();
            window.rotate();
            assert_eq!(window.buckets.len(), WINDOW_BUCKETS);
            assert!(window.head < WINDOW_BUCKETS);
        }
        // the fresh head is empty, every other bucket saw one request
        assert_eq!(window.total(), (WINDOW_BUCKETS - 1) as u64);
    }

    #[test]
    fn test_concurrent_add_request() {
        let counter = Arc::new(RequestCounter::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.add_request();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(counter.rotate(), 8000);
    }
}
