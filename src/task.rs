//! Tasks and their one-shot result channels

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex},
    thread,
};

/// Type-erased, move-only, invoke-once work item stored in worker queues
pub(crate) type DynTask = Box<dyn FnOnce() + Send>;

/// A callable bound to the producer side of a result channel
///
/// Running the task consumes it: the callable is invoked exactly once and
/// either its return value or its panic payload is delivered to the paired
/// [`Future`]. Worker threads never observe the panic.
pub(crate) struct Task<F, R> {
    /// The bound computation
    callable: F,

    /// Producer side of the result channel
    channel: Arc<Channel<R>>,
}
//
impl<F, R> Task<F, R>
where
    F: FnOnce() -> R,
{
    /// Bind a callable to a fresh result channel
    pub fn new(callable: F) -> (Self, Future<R>) {
        let channel = Arc::new(Channel {
            result: Mutex::new(None),
            ready: Condvar::new(),
        });
        let task = Self {
            callable,
            channel: channel.clone(),
        };
        (task, Future { channel })
    }

    /// Invoke the callable and deliver its outcome
    pub fn run(self) {
        let Self { callable, channel } = self;
        let result = panic::catch_unwind(AssertUnwindSafe(callable));
        *channel.result.lock().unwrap() = Some(result);
        channel.ready.notify_all();
    }
}

/// Consumer-side handle to a submitted task's result
///
/// Obtained from [`ThreadPool::submit()`](crate::ThreadPool::submit). The
/// handle resolves exactly once, with the task's return value or with the
/// panic it raised.
pub struct Future<R> {
    channel: Arc<Channel<R>>,
}
//
impl<R> Future<R> {
    /// Block until the task has finished
    pub fn wait(&self) {
        let slot = self.channel.result.lock().unwrap();
        drop(
            self.channel
                .ready
                .wait_while(slot, |slot| slot.is_none())
                .unwrap(),
        );
    }

    /// Block until the task has finished, then deliver its result
    ///
    /// If the task panicked, the panic is resumed on the calling thread.
    pub fn get(self) -> R {
        let slot = self.channel.result.lock().unwrap();
        let mut slot = self
            .channel
            .ready
            .wait_while(slot, |slot| slot.is_none())
            .unwrap();
        crate::result_or_panic(slot.take().expect("result delivered exactly once"))
    }
}
//
impl<R> fmt::Debug for Future<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ready = self
            .channel
            .result
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false);
        f.debug_struct("Future").field("ready", &ready).finish()
    }
}

/// One-shot result channel: a write-once slot plus a latch
struct Channel<R> {
    /// Write-once result slot
    result: Mutex<Option<thread::Result<R>>>,

    /// Latch signalled when the slot is written
    ready: Condvar,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_rides_the_channel() {
        let (task, future) = Task::new(|| 6 * 7);
        task.run();
        future.wait();
        assert_eq!(future.get(), 42);
    }

    #[test]
    fn wait_blocks_until_run() {
        let (task, future) = Task::new(|| "done");
        let waiter = std::thread::spawn(move || {
            future.wait();
            future.get()
        });
        task.run();
        assert_eq!(waiter.join().unwrap(), "done");
    }

    #[test]
    fn panic_is_resumed_at_get() {
        let (task, future) = Task::new(|| -> u32 { panic!("task exploded") });
        // The worker-side invocation must not unwind
        task.run();
        let result = panic::catch_unwind(AssertUnwindSafe(move || future.get()));
        let payload = result.unwrap_err();
        assert_eq!(*payload.downcast_ref::<&str>().unwrap(), "task exploded");
    }

    #[test]
    fn type_erased_task_still_delivers() {
        let (task, future) = Task::new(|| vec![1, 2, 3]);
        let erased: DynTask = Box::new(move || task.run());
        erased();
        assert_eq!(future.get(), vec![1, 2, 3]);
    }
}
