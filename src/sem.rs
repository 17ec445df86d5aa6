//! Futex-based counting semaphore used for worker sleep

use std::sync::atomic::{AtomicU32, Ordering};

/// Counting semaphore with a blocking `wait` and a non-blocking `signal`
///
/// The count lives in a single futex word: `wait` consumes a unit when one
/// is available and otherwise parks the thread on the word, `signal` adds a
/// unit and wakes one parked waiter. Signals are never lost; a signal sent
/// while nobody waits is banked for the next `wait`.
pub(crate) struct Semaphore {
    /// Number of unconsumed signals
    count: AtomicU32,
}
//
impl Semaphore {
    /// Set up a semaphore with an initial count
    pub fn new(count: u32) -> Self {
        Self {
            count: AtomicU32::new(count),
        }
    }

    /// Block until a signal can be consumed
    pub fn wait(&self) {
        let mut count = self.count.load(Ordering::Relaxed);
        loop {
            if count == 0 {
                atomic_wait::wait(&self.count, 0);
                count = self.count.load(Ordering::Relaxed);
                continue;
            }
            // Acquire pairs with the Release increment in signal(), so a
            // woken waiter observes everything that preceded the signal
            match self.count.compare_exchange_weak(
                count,
                count - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(changed) => count = changed,
            }
        }
    }

    /// Release one unit, waking a parked waiter if there is one
    pub fn signal(&self) {
        self.count.fetch_add(1, Ordering::Release);
        atomic_wait::wake_one(&self.count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    #[test]
    fn initial_count_is_consumable_without_signals() {
        let sem = Semaphore::new(3);
        sem.wait();
        sem.wait();
        sem.wait();
    }

    #[test]
    fn banked_signal_does_not_block() {
        let sem = Semaphore::new(0);
        sem.signal();
        sem.wait();
    }

    #[test]
    fn each_signal_releases_one_waiter() {
        const WAITERS: usize = 4;

        let sem = Arc::new(Semaphore::new(0));
        let released = Arc::new(AtomicUsize::new(0));

        let waiters: Vec<_> = (0..WAITERS)
            .map(|_| {
                let sem = sem.clone();
                let released = released.clone();
                thread::spawn(move || {
                    sem.wait();
                    released.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        // Give the waiters a moment to park, then release them one by one
        thread::sleep(Duration::from_millis(50));
        for _ in 0..WAITERS {
            sem.signal();
        }
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(released.load(Ordering::SeqCst), WAITERS);
    }
}
