//! Lock-free single-producer single-consumer event queue.
//!
//! An unbounded queue of fixed-size records laid out as a linked list of
//! fixed-capacity blocks (32 KiB each, one preallocated at creation). The
//! producer publishes a batch with a release store of the block write index;
//! the consumer observes it with an acquire load, so a record is never
//! partially visible. Fully consumed blocks are recycled through a lock-free
//! freelist, keeping the steady-state producer path allocation-free.
//!
//! The producer/consumer roles are a usage contract: exactly one thread may
//! call [`SpscQueue::enqueue`] and exactly one may call [`SpscQueue::drain`].

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Bytes per queue block.
pub(crate) const BLOCK_BYTES: usize = 32 * 1024;

struct Block<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Producer cursor; a release store here publishes slots `[0, write)`.
    write: AtomicUsize,
    /// Consumer cursor; only the consumer reads or writes it.
    read: AtomicUsize,
    /// Link to the next block in the chain, or the freelist stack link.
    next: AtomicPtr<Block<T>>,
}

impl<T> Block<T> {
    fn boxed(cap: usize) -> *mut Self {
        let slots = (0..cap)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::into_raw(Box::new(Self {
            slots,
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// Unbounded SPSC queue of fixed-size records.
pub(crate) struct SpscQueue<T> {
    cap: usize,
    /// Consumer's current block.
    head: AtomicPtr<Block<T>>,
    /// Producer's current block.
    tail: AtomicPtr<Block<T>>,
    /// Treiber stack of spent blocks, linked through `Block::next`.
    free: AtomicPtr<Block<T>>,
}

// SAFETY: all cross-thread hand-off goes through the write/next atomics with
// acquire/release pairing; slot cells are only touched by the single producer
// (unpublished slots) or the single consumer (published slots).
unsafe impl<T: Send> Send for SpscQueue<T> {}
unsafe impl<T: Send> Sync for SpscQueue<T> {}

impl<T> SpscQueue<T> {
    pub(crate) fn new() -> Self {
        let cap = (BLOCK_BYTES / std::mem::size_of::<T>()).max(1);
        let first = Block::boxed(cap);
        Self {
            cap,
            head: AtomicPtr::new(first),
            tail: AtomicPtr::new(first),
            free: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Append one record. Producer thread only.
    pub(crate) fn enqueue(&self, item: T) {
        let tail = self.tail.load(Ordering::Relaxed);
        // SAFETY: the tail block is never freed while the producer holds it;
        // the consumer recycles a block only after following `next`, which is
        // only set once the producer has moved on.
        let block = unsafe { &*tail };
        let w = block.write.load(Ordering::Relaxed);
        if w < self.cap {
            // SAFETY: slot `w` is unpublished, so the producer has exclusive
            // access to it.
            unsafe { (*block.slots[w].get()).write(item) };
            block.write.store(w + 1, Ordering::Release);
            return;
        }

        let next = self.obtain_block();
        // SAFETY: a freshly obtained block is owned by the producer alone
        // until linked below.
        let next_ref = unsafe { &*next };
        unsafe { (*next_ref.slots[0].get()).write(item) };
        next_ref.write.store(1, Ordering::Relaxed);
        // The release link publishes both the reset block state and slot 0.
        block.next.store(next, Ordering::Release);
        self.tail.store(next, Ordering::Relaxed);
    }

    /// Pop a spent block off the freelist, or allocate. Producer thread only.
    fn obtain_block(&self) -> *mut Block<T> {
        let mut head = self.free.load(Ordering::Acquire);
        while !head.is_null() {
            // SAFETY: freelist blocks are quiescent; only this producer pops.
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };
            match self
                .free
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let block = unsafe { &*head };
                    block.write.store(0, Ordering::Relaxed);
                    block.read.store(0, Ordering::Relaxed);
                    block.next.store(ptr::null_mut(), Ordering::Relaxed);
                    return head;
                }
                Err(observed) => head = observed,
            }
        }
        Block::boxed(self.cap)
    }

    /// Consume every published record, in order. Consumer thread only.
    ///
    /// Records with heap payload handles must be freed (or forwarded) by the
    /// callback; the queue itself never interprets payloads.
    pub(crate) fn drain(&self, mut f: impl FnMut(T)) -> usize {
        let mut count = 0;
        loop {
            let head = self.head.load(Ordering::Relaxed);
            // SAFETY: the head block stays alive until this consumer recycles
            // it below.
            let block = unsafe { &*head };
            let r = block.read.load(Ordering::Relaxed);
            let w = block.write.load(Ordering::Acquire);
            for i in r..w {
                // SAFETY: slots `[r, w)` are published and consumed once.
                let item = unsafe { (*block.slots[i].get()).assume_init_read() };
                f(item);
            }
            count += w - r;
            if w > r {
                block.read.store(w, Ordering::Relaxed);
            }
            if w < self.cap {
                return count;
            }
            let next = block.next.load(Ordering::Acquire);
            if next.is_null() {
                return count;
            }
            self.head.store(next, Ordering::Relaxed);
            self.recycle(head);
        }
    }

    /// Push a fully consumed block onto the freelist. Consumer thread only.
    fn recycle(&self, block: *mut Block<T>) {
        let mut head = self.free.load(Ordering::Relaxed);
        loop {
            // SAFETY: the block was unlinked from the live chain above and is
            // exclusively ours until the CAS succeeds.
            unsafe { (*block).next.store(head, Ordering::Relaxed) };
            match self
                .free
                .compare_exchange_weak(head, block, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }
}

impl<T> Drop for SpscQueue<T> {
    fn drop(&mut self) {
        // Exclusive access: drop unconsumed records, then free every block in
        // the live chain and the freelist.
        let mut cursor = *self.head.get_mut();
        while !cursor.is_null() {
            // SAFETY: exclusive access via &mut self.
            let block = unsafe { &mut *cursor };
            let r = *block.read.get_mut();
            let w = *block.write.get_mut();
            for i in r..w {
                unsafe { (*block.slots[i].get()).assume_init_drop() };
            }
            let next = *block.next.get_mut();
            drop(unsafe { Box::from_raw(cursor) });
            cursor = next;
        }
        let mut cursor = *self.free.get_mut();
        while !cursor.is_null() {
            let block = unsafe { &mut *cursor };
            let next = *block.next.get_mut();
            drop(unsafe { Box::from_raw(cursor) });
            cursor = next;
        }
    }
}
