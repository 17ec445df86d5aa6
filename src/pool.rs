//! Work-stealing thread pool

use crate::{
    deque::{Deque, Stealer},
    rng::VictimRng,
    sem::Semaphore,
    task::{DynTask, Future, Task},
};
use crossbeam_utils::CachePadded;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

/// Number of scheduling iterations during which a worker keeps trying its
/// own queue before it starts picking random victims
///
/// Biasing toward the own queue keeps task data in nearby caches; the
/// random fallback breaks up lasting imbalance between workers.
const SELF_STEAL_SPINS: usize = 100;

/// Work-stealing pool of OS worker threads
///
/// Submitted closures are placed round-robin onto per-worker deques and
/// executed by whichever worker gets to them first: workers drain their own
/// queue in preference and steal from random peers when it runs dry. Each
/// submission hands back a [`Future`] resolving with the closure's result.
///
/// Tasks run to completion on one worker; submission order does not imply
/// execution order.
///
/// # Teardown
///
/// Dropping the pool requests stop, wakes every worker and joins them. It
/// does **not** wait for submitted tasks to finish: callers who need their
/// results must await the futures before dropping the pool.
///
/// ```
/// use spindle::ThreadPool;
///
/// let mut pool = ThreadPool::with_threads(4);
/// let futures: Vec<_> = (0..64).map(|i| pool.submit(move || i * i)).collect();
/// for (i, future) in futures.into_iter().enumerate() {
///     assert_eq!(future.get(), i * i);
/// }
/// ```
pub struct ThreadPool {
    /// Owner sides of the per-worker deques, used for submission placement
    queues: Vec<Deque<DynTask>>,

    /// State shared with the workers
    shared: Arc<Shared>,

    /// Worker threads, joined on drop
    workers: Vec<JoinHandle<()>>,

    /// Round-robin cursor over `queues` for submissions
    rotating_index: usize,
}
//
impl ThreadPool {
    /// Create a pool with one worker per available hardware thread
    pub fn new() -> Self {
        let workers = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::with_threads(workers)
    }

    /// Create a pool with a specific number of workers
    ///
    /// `workers` must be nonzero.
    pub fn with_threads(workers: usize) -> Self {
        assert!(workers > 0, "a thread pool needs at least one worker");

        let mut queues = Vec::with_capacity(workers);
        let mut slots = Vec::with_capacity(workers);
        for _ in 0..workers {
            let queue = Deque::new();
            slots.push(CachePadded::new(WorkerSlot {
                sem: Semaphore::new(0),
                stealer: queue.stealer(),
            }));
            queues.push(queue);
        }
        let shared = Arc::new(Shared {
            slots: slots.into(),
            pending: CachePadded::new(AtomicI64::new(0)),
            stop: AtomicBool::new(false),
        });

        let seed: u64 = rand::random();
        let handles = (0..workers)
            .map(|index| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("spindle worker #{index}"))
                    .spawn(move || worker_loop(&shared, index, VictimRng::stream(seed, index)))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            queues,
            shared,
            workers: handles,
            rotating_index: 0,
        }
    }

    /// Number of worker threads
    pub fn worker_count(&self) -> usize {
        self.queues.len()
    }

    /// Enqueue a closure for execution and hand back its result channel
    ///
    /// The closure and everything it captures move into the pool, severing
    /// all borrows of the submitter's locals. The returned [`Future`]
    /// resolves with the closure's return value; if the closure panics, the
    /// panic is captured and resumed in [`Future::get()`] while the worker
    /// lives on.
    pub fn submit<F, R>(&mut self, f: F) -> Future<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (task, future) = Task::new(f);
        let slot = self.rotating_index % self.queues.len();
        self.rotating_index = self.rotating_index.wrapping_add(1);

        // The increment precedes the push, so a worker that stole the task
        // also observes pending > 0
        self.shared.pending.fetch_add(1, Ordering::Relaxed);
        self.queues[slot].push(Box::new(move || task.run()));
        self.shared.slots[slot].sem.signal();
        future
    }
}
//
impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}
//
impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.worker_count())
            .field("pending", &self.shared.pending.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
//
impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Stop requests target workers, not in-flight tasks: a worker only
        // acts on the request once the pending count has drained
        self.shared.stop.store(true, Ordering::Release);
        for slot in self.shared.slots.iter() {
            slot.sem.signal();
        }
        for worker in self.workers.drain(..) {
            worker.join().expect("worker thread panicked");
        }
    }
}

/// Sleep/wake and steal interface to one worker's queue
struct WorkerSlot {
    /// Sleep token: one signal per task placed on this slot, plus one
    /// shutdown signal from the pool destructor
    sem: Semaphore,

    /// Thief side of this worker's deque
    stealer: Stealer<DynTask>,
}

/// State shared between the pool handle and all workers
struct Shared {
    /// One slot per worker, padded so neighboring slots do not false-share
    slots: Box<[CachePadded<WorkerSlot>]>,

    /// Tasks submitted but not yet started; the workers' quiescence signal
    pending: CachePadded<AtomicI64>,

    /// Set by the pool destructor to release the workers
    stop: AtomicBool,
}

/// Per-worker scheduling loop
///
/// Workers consume exclusively through `steal`, their own queue included;
/// production on a queue's owner side happens only at submission. Each
/// worker waits on its own semaphore (`index` arrives by value).
fn worker_loop(shared: &Shared, index: usize, mut rng: VictimRng) {
    let slots = &shared.slots;
    loop {
        // Sleep until a submission lands on this slot, or until shutdown
        slots[index].sem.wait();

        let mut spin_count = 0;
        loop {
            // Prefer the own queue, divert to a random victim once it has
            // run dry for long enough
            let victim = if spin_count < SELF_STEAL_SPINS || !slots[index].stealer.is_empty() {
                index
            } else {
                rng.next_index(slots.len())
            };
            spin_count += 1;

            if let Some(task) = slots[victim].stealer.steal() {
                shared.pending.fetch_sub(1, Ordering::Release);
                task();
            }

            // Acquire pairs with the Release decrements, so the worker
            // parks only after observing the last finished task's writes
            if shared.pending.load(Ordering::Acquire) <= 0 {
                break;
            }
        }

        if shared.stop.load(Ordering::Acquire) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        panic::{self, AssertUnwindSafe},
        time::{Duration, Instant},
    };

    #[test]
    fn lifecycle() {
        // A pool with nothing submitted shuts down cleanly
        ThreadPool::new();
    }

    #[test]
    fn zero_workers_is_refused() {
        assert!(panic::catch_unwind(|| ThreadPool::with_threads(0)).is_err());
    }

    #[test]
    fn identity_fan_out() {
        const TASKS: usize = 100_000;

        let mut pool = ThreadPool::with_threads(4);
        let futures: Vec<_> = (0..TASKS).map(|i| pool.submit(move || i)).collect();
        for (i, future) in futures.into_iter().enumerate() {
            assert_eq!(future.get(), i);
        }
    }

    #[test]
    fn empty_task_flood() {
        const TASKS: usize = 1 << 21;

        let mut pool = ThreadPool::with_threads(8);
        let futures: Vec<_> = (0..TASKS).map(|_| pool.submit(|| ())).collect();
        for future in futures {
            future.get();
        }
    }

    #[test]
    fn destructor_churn() {
        for _ in 0..10_000 {
            drop(ThreadPool::new());
        }
    }

    #[test]
    fn varying_task_latency() {
        let mut pool = ThreadPool::with_threads(4);
        let started = Instant::now();
        let futures: Vec<_> = (0..40)
            .map(|i| {
                pool.submit(move || {
                    thread::sleep(Duration::from_millis(10 * i));
                    i
                })
            })
            .collect();
        for (i, future) in futures.into_iter().enumerate() {
            assert_eq!(future.get(), i as u64);
        }
        // The longest task alone sleeps 390ms
        assert!(started.elapsed() >= Duration::from_millis(390));
    }

    #[test]
    fn panicking_task_spares_its_worker() {
        let mut pool = ThreadPool::with_threads(1);

        let poisoned = pool.submit(|| -> u32 { panic!("task exploded") });
        let panicked = panic::catch_unwind(AssertUnwindSafe(move || poisoned.get()));
        assert!(panicked.is_err());

        // The lone worker survived and keeps executing
        assert_eq!(pool.submit(|| 7).get(), 7);
    }

    #[test]
    fn results_reach_the_submitter() {
        let mut pool = ThreadPool::with_threads(2);
        let sum = pool.submit(|| (0..1000u64).sum::<u64>());
        let concat = pool.submit(|| ["a", "b", "c"].concat());
        assert_eq!(sum.get(), 499_500);
        assert_eq!(concat.get(), "abc");
    }

    #[test]
    fn worker_count_matches_request() {
        assert_eq!(ThreadPool::with_threads(3).worker_count(), 3);
        assert!(ThreadPool::new().worker_count() >= 1);
    }
}
