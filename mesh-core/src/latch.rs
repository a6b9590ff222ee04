//! Single-flight latch.
//!
//! At most one holder at a time; a second caller is turned away instead of
//! queued. The latch is released when the guard drops, including on early
//! return and on cancellation of the owning future.

use std::sync::atomic::{AtomicBool, Ordering};

/// Non-blocking mutual exclusion for an operation.
#[derive(Debug, Default)]
pub struct SingleFlight {
    busy: AtomicBool,
}

impl SingleFlight {
    /// Create an open latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the latch, or `None` if someone else holds it.
    pub fn try_acquire(&self) -> Option<SingleFlightGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SingleFlightGuard { latch: self })
    }

    /// Whether the latch is currently held.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Holds the latch until dropped.
#[derive(Debug)]
#[must_use = "the latch is released as soon as the guard is dropped"]
pub struct SingleFlightGuard<'a> {
    latch: &'a SingleFlight,
}

impl Drop for SingleFlightGuard<'_> {
    fn drop(&mut self) {
        self.latch.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_refused() {
        let latch = SingleFlight::new();
        let guard = latch.try_acquire();
        assert!(guard.is_some());
        assert!(latch.is_busy());
        assert!(latch.try_acquire().is_none());
    }

    #[test]
    fn released_on_drop() {
        let latch = SingleFlight::new();
        {
            let _guard = latch.try_acquire().unwrap();
        }
        assert!(!latch.is_busy());
        assert!(latch.try_acquire().is_some());
    }

    #[test]
    fn exactly_one_winner_across_threads() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::{Arc, Barrier};

        let latch = Arc::new(SingleFlight::new());
        let wins = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));
        let hold = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (latch, wins, barrier, hold) = (
                    Arc::clone(&latch),
                    Arc::clone(&wins),
                    Arc::clone(&barrier),
                    Arc::clone(&hold),
                );
                std::thread::spawn(move || {
                    barrier.wait();
                    let guard = latch.try_acquire();
                    if guard.is_some() {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                    // keep the winner's guard alive until everyone has tried
                    hold.wait();
                    drop(guard);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }
}
