//! Chase–Lev lock-free work-stealing deque

use crate::buffer::RingBuffer;
use crossbeam_utils::CachePadded;
use std::{
    cell::UnsafeCell,
    fmt, mem,
    sync::{
        atomic::{fence, AtomicI64, AtomicPtr, Ordering},
        Arc,
    },
};

/// Buffer capacity used by [`Deque::new()`]
///
/// Growth never shrinks back, so long-lived deques under heavy load are
/// better served by a generous initial capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Owner-side handle to a work-stealing deque
///
/// The owner pushes and pops at the bottom of the deque, turning it into a
/// LIFO stack; thieves remove from the top through [`Stealer`] handles,
/// observing pushed values in FIFO order. All operations are lock-free, and
/// `pop`/`steal` are wait-free per call (at most one CAS, no retry loop).
///
/// `push` and `pop` take `&mut self`, so the single-owner discipline of the
/// algorithm is enforced by the borrow checker rather than by convention:
/// the deque can move between threads, but only one thread at a time can
/// operate the bottom end.
///
/// The buffer doubles whenever a push finds it full. Replaced buffers are
/// kept alive until the deque and all its stealers are dropped, so thieves
/// never observe a dangling buffer pointer and no epoch or hazard-pointer
/// machinery is needed.
pub struct Deque<T> {
    inner: Arc<Inner<T>>,
}
//
impl<T> Deque<T> {
    /// Create a deque with the [default capacity](DEFAULT_CAPACITY)
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a deque with a specific initial buffer capacity
    ///
    /// `capacity` must be a positive power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner::new(capacity)),
        }
    }

    /// Set up a thief-side handle to this deque
    ///
    /// Stealers can be cloned and shared freely; any number of threads may
    /// steal concurrently with the owner's pushes and pops.
    pub fn stealer(&self) -> Stealer<T> {
        Stealer {
            inner: self.inner.clone(),
        }
    }

    /// Push a value at the bottom of the deque
    ///
    /// Grows the buffer when full. Allocation failure aborts, as is usual
    /// with the global allocator.
    pub fn push(&mut self, value: T) {
        // SAFETY: `&mut self` makes this thread the unique owner for the
        //         duration of the call.
        unsafe { self.inner.push(value) }
    }

    /// Pop the most recently pushed value, if any
    ///
    /// Returns `None` when the deque is empty or when a thief wins the race
    /// for the last element.
    pub fn pop(&mut self) -> Option<T> {
        // SAFETY: `&mut self` makes this thread the unique owner for the
        //         duration of the call.
        unsafe { self.inner.pop() }
    }

    /// Steal the oldest value, if any
    ///
    /// The owner may steal from its own deque; this is the same operation
    /// thieves perform and needs no owner privileges.
    pub fn steal(&self) -> Option<T> {
        self.inner.steal()
    }

    /// Number of elements currently in the deque
    ///
    /// Advisory under concurrent operations, but never negative.
    pub fn size(&self) -> usize {
        self.inner.size()
    }

    /// Whether the deque currently holds no elements
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Current buffer capacity
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}
//
impl<T> Default for Deque<T> {
    fn default() -> Self {
        Self::new()
    }
}
//
impl<T> fmt::Debug for Deque<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deque")
            .field("size", &self.size())
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

/// Thief-side handle to a work-stealing deque
///
/// Obtained from [`Deque::stealer()`]; see there for the concurrency
/// contract.
pub struct Stealer<T> {
    inner: Arc<Inner<T>>,
}
//
impl<T> Stealer<T> {
    /// Steal the oldest value, if any
    ///
    /// Returns `None` when the deque looks empty or when another thief (or
    /// the owner, on the last element) wins the race. A failed steal is
    /// never retried within the call; callers decide whether to try again.
    pub fn steal(&self) -> Option<T> {
        self.inner.steal()
    }

    /// Number of elements currently in the deque
    ///
    /// Advisory under concurrent operations, but never negative.
    pub fn size(&self) -> usize {
        self.inner.size()
    }

    /// Whether the deque currently holds no elements
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}
//
impl<T> Clone for Stealer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
//
impl<T> fmt::Debug for Stealer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stealer")
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

/// State shared between a [`Deque`] and its [`Stealer`]s
struct Inner<T> {
    /// Index of the oldest live element
    ///
    /// Advanced by CAS from `steal`, and from `pop` when racing for the
    /// last element. Monotonically non-decreasing.
    top: CachePadded<AtomicI64>,

    /// One past the newest live element
    ///
    /// Written only by the owner. Monotonically non-decreasing except for
    /// the tentative `bottom - 1` reservation at the start of `pop`, which
    /// is always undone when no element is removed.
    bottom: CachePadded<AtomicI64>,

    /// Current ring buffer
    ///
    /// Replaced only by the owner, when a push finds the buffer full.
    buffer: CachePadded<AtomicPtr<RingBuffer<T>>>,

    /// Buffers replaced by growth
    ///
    /// Mutated only by the owner and read by no one; the allocations are
    /// kept alive because an in-flight thief may still hold a pointer to a
    /// replaced buffer. Freed when the deque and all stealers are gone.
    retired: UnsafeCell<Vec<Box<RingBuffer<T>>>>,
}
//
impl<T> Inner<T> {
    fn new(capacity: usize) -> Self {
        let capacity = i64::try_from(capacity).expect("deque capacity out of range");
        let buffer = Box::into_raw(Box::new(RingBuffer::new(capacity)));
        Self {
            top: CachePadded::new(AtomicI64::new(0)),
            bottom: CachePadded::new(AtomicI64::new(0)),
            buffer: CachePadded::new(AtomicPtr::new(buffer)),
            retired: UnsafeCell::new(Vec::new()),
        }
    }

    fn size(&self) -> usize {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Relaxed);
        (bottom - top).max(0) as usize
    }

    fn capacity(&self) -> usize {
        // SAFETY: The current buffer stays valid for the lifetime of `self`;
        //         replaced buffers are retired, never freed.
        unsafe { (*self.buffer.load(Ordering::Relaxed)).capacity() as usize }
    }

    /// Owner-only: push at the bottom, growing the buffer when full
    ///
    /// # Safety
    ///
    /// May only be called by the single owner thread.
    unsafe fn push(&self, value: T) {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Acquire);
        let mut buffer = self.buffer.load(Ordering::Relaxed);

        if bottom - top > (*buffer).capacity() - 1 {
            buffer = self.grow(buffer, top, bottom);
        }

        (*buffer).write(bottom, value);

        // The cell write must be visible before the index store that makes
        // the slot observable; pairs with the Acquire loads in steal()
        fence(Ordering::Release);
        self.bottom.store(bottom + 1, Ordering::Relaxed);
    }

    /// Owner-only: replace the buffer with one of double capacity
    ///
    /// The old buffer goes on the retirement list, where it stays valid for
    /// any thief still holding a pointer to it.
    ///
    /// # Safety
    ///
    /// May only be called by the single owner thread, with `[top, bottom)`
    /// the currently live window.
    #[cold]
    unsafe fn grow(&self, old: *mut RingBuffer<T>, top: i64, bottom: i64) -> *mut RingBuffer<T> {
        let grown = Box::into_raw(Box::new((*old).grow(top, bottom)));
        self.buffer.store(grown, Ordering::Relaxed);
        (*self.retired.get()).push(Box::from_raw(old));
        grown
    }

    /// Owner-only: pop at the bottom
    ///
    /// # Safety
    ///
    /// May only be called by the single owner thread.
    unsafe fn pop(&self) -> Option<T> {
        let bottom = self.bottom.load(Ordering::Relaxed) - 1;
        let buffer = self.buffer.load(Ordering::Relaxed);
        self.bottom.store(bottom, Ordering::Relaxed);

        // Totally ordered against the fence in steal(): on a one-element
        // deque, exactly one of a racing pop/steal pair observes the
        // other's index update
        fence(Ordering::SeqCst);

        let top = self.top.load(Ordering::Relaxed);

        if top <= bottom {
            if top == bottom {
                // Last element: race any thieves for it
                let won = self
                    .top
                    .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok();
                self.bottom.store(bottom + 1, Ordering::Relaxed);
                if !won {
                    return None;
                }
            }
            // SAFETY: The element at `bottom` is live and now reserved for
            //         this thread: either `top < bottom` (thieves cannot
            //         reach it) or the CAS above won the race for it.
            Some((*buffer).read(bottom))
        } else {
            // Deque was empty; undo the reservation
            self.bottom.store(bottom + 1, Ordering::Relaxed);
            None
        }
    }

    /// Steal at the top; any thread
    fn steal(&self) -> Option<T> {
        let top = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let bottom = self.bottom.load(Ordering::Acquire);

        if top < bottom {
            // Acquire stands in for the consume ordering the algorithm asks
            // of this load; Rust exposes no consume
            let buffer = self.buffer.load(Ordering::Acquire);

            // SAFETY: A live element was published at `top` before the
            //         Acquire load of `bottom` observed `top < bottom`. The
            //         copy is speculative: it is kept only if the CAS below
            //         wins the element, and forgotten otherwise.
            let value = unsafe { (*buffer).read(top) };

            if self
                .top
                .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                // Lost the element to another thief or to the owner; the
                // winner owns it, so this copy must not drop
                mem::forget(value);
                return None;
            }
            Some(value)
        } else {
            None
        }
    }
}
//
impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let top = *self.top.get_mut();
        let bottom = *self.bottom.get_mut();
        let buffer = *self.buffer.get_mut();
        unsafe {
            // SAFETY: `&mut self` means no other handle is left; the live
            //         window `[top, bottom)` holds exactly the elements that
            //         were pushed and never removed.
            for index in top..bottom {
                drop((*buffer).read(index));
            }
            drop(Box::from_raw(buffer));
        }
        // Retired buffers are freed by the Vec they live in
    }
}
//
// SAFETY: Moving the shared state between threads moves the contained
//         elements, which is fine whenever T can be sent.
unsafe impl<T: Send> Send for Inner<T> {}
//
// SAFETY: Shared access is governed by the algorithm's synchronization:
//         `bottom`, `buffer` and `retired` are mutated only through the
//         owner methods (guarded by `&mut Deque`), `top` only by CAS, and
//         every element handed out was published by a Release/Acquire edge.
unsafe impl<T: Send> Sync for Inner<T> {}
