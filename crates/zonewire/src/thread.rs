//! Per-thread instrumentation state.
//!
//! A [`ThreadContext`] is created lazily on the first instrumentation call a
//! thread makes, registered with the profiler, and handed back to the thread
//! through a thread-local borrow. When the thread exits, the thread-local
//! destructor marks the context for deletion; the worker drains it one last
//! time and removes it from the registry. A context's queue is produced by
//! exactly one OS thread for its whole life.

use std::cell::{OnceCell, UnsafeCell};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::profiler::Profiler;
use crate::queue::SpscQueue;
use crate::record::{QueueEvent, SrcLocHandle};

/// Maximum zone nesting depth per thread.
pub(crate) const ZONE_STACK_SIZE: usize = 256;

const CANARY0: u32 = 0xDEAD_BEE0;
const CANARY1: u32 = 0xDEAD_BEE1;

/// One activation on the zone stack.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ZoneEntry {
    /// Verification id matched against `ZoneValidation` records.
    pub id: u32,
    /// Connection epoch at begin time; used to detect reconnect straddles.
    pub connection_id: u64,
    /// Begin-time source location, kept here so a straddling zone can be
    /// re-begun after a reconnect.
    pub srcloc: Option<SrcLocHandle>,
    pub active: bool,
}

const EMPTY_ENTRY: ZoneEntry = ZoneEntry {
    id: 0,
    connection_id: 0,
    srcloc: None,
    active: false,
};

/// Fixed-capacity zone stack bracketed by overflow canaries.
///
/// `repr(C)` keeps the canaries physically adjacent to the entry array so an
/// out-of-bounds write lands on one of them before anything else.
#[repr(C)]
pub(crate) struct ZoneStack {
    canary0: AtomicU32,
    entries: UnsafeCell<[ZoneEntry; ZONE_STACK_SIZE]>,
    canary1: AtomicU32,
    /// Top-of-stack index, -1 when empty. Owner thread only.
    idx: AtomicI32,
}

// SAFETY: `entries` and `idx` are only touched by the context's owning
// thread; the worker reads nothing but the canary atomics.
unsafe impl Sync for ZoneStack {}

impl ZoneStack {
    fn new() -> Self {
        Self {
            canary0: AtomicU32::new(CANARY0),
            entries: UnsafeCell::new([EMPTY_ENTRY; ZONE_STACK_SIZE]),
            canary1: AtomicU32::new(CANARY1),
            idx: AtomicI32::new(-1),
        }
    }

    /// Push an activation. Owner thread only; overflow is a programmer error
    /// and is not recovered.
    pub(crate) fn push(&self, entry: ZoneEntry) {
        let idx = self.idx.load(Ordering::Relaxed) + 1;
        assert!(
            (idx as usize) < ZONE_STACK_SIZE,
            "zone stack overflow: more than {ZONE_STACK_SIZE} nested zones"
        );
        // SAFETY: owner-thread exclusive access, index bounds just checked.
        unsafe { (*self.entries.get())[idx as usize] = entry };
        self.idx.store(idx, Ordering::Relaxed);
    }

    /// Pop the top activation. Owner thread only; underflow is a programmer
    /// error and is not recovered.
    pub(crate) fn pop(&self) -> ZoneEntry {
        let idx = self.idx.load(Ordering::Relaxed);
        assert!(idx >= 0, "zone stack underflow: end_zone without a begin_zone");
        // SAFETY: owner-thread exclusive access, index bounds just checked.
        let entry = unsafe { (*self.entries.get())[idx as usize] };
        self.idx.store(idx - 1, Ordering::Relaxed);
        entry
    }

    /// Whether both canaries still hold their sentinel values.
    pub(crate) fn canaries_intact(&self) -> bool {
        self.canary0.load(Ordering::Relaxed) == CANARY0
            && self.canary1.load(Ordering::Relaxed) == CANARY1
    }
}

/// Per-thread state: identity, event queue, zone stack, on-demand gating.
pub(crate) struct ThreadContext {
    /// Stable thread identity reported to the viewer.
    pub thread_id: u64,
    /// SPSC queue: this thread produces, the worker consumes.
    pub queue: SpscQueue<QueueEvent>,
    /// On-demand gate; set by the worker on connect, cleared on disconnect.
    pub is_active: AtomicBool,
    /// Set by the thread-local destructor; the worker drains and removes.
    pub marked_for_deletion: AtomicBool,
    pub stack: ZoneStack,
    /// Spin flag serializing end-zone against connection-epoch transitions.
    end_zone_lock: AtomicBool,
}

impl ThreadContext {
    pub(crate) fn new(thread_id: u64, is_active: bool) -> Self {
        Self {
            thread_id,
            queue: SpscQueue::new(),
            is_active: AtomicBool::new(is_active),
            marked_for_deletion: AtomicBool::new(false),
            stack: ZoneStack::new(),
            end_zone_lock: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn enqueue(&self, event: QueueEvent) {
        self.queue.enqueue(event);
    }

    /// Acquire the end-zone spin lock. Held for a few instructions only.
    #[inline]
    pub(crate) fn lock(&self) {
        while self
            .end_zone_lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    #[inline]
    pub(crate) fn unlock(&self) {
        self.end_zone_lock.store(false, Ordering::Release);
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    static REGISTRATION: OnceCell<Registration> = const { OnceCell::new() };
}

/// Stable identity of the calling thread, as reported to the viewer.
pub fn current_thread_id() -> u64 {
    THREAD_ID.try_with(|id| *id).unwrap_or(0)
}

/// Thread-local borrow of the registry-owned context; dropping it (thread
/// exit) marks the context for the worker to collect.
struct Registration {
    ctx: Arc<ThreadContext>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.ctx.marked_for_deletion.store(true, Ordering::Release);
    }
}

/// Run `f` against the calling thread's context, creating and registering it
/// on first use. Returns `None` when the profiler is not running or the
/// thread is shutting down.
#[inline]
pub(crate) fn with_current<R>(f: impl FnOnce(&Profiler, &ThreadContext) -> R) -> Option<R> {
    let profiler = Profiler::try_global()?;
    REGISTRATION
        .try_with(|cell| {
            let reg = cell.get_or_init(|| {
                let ctx = profiler.register_thread(current_thread_id());
                if let Some(name) = std::thread::current().name() {
                    set_thread_name(name);
                }
                Registration { ctx }
            });
            f(profiler, &reg.ctx)
        })
        .ok()
}

static THREAD_NAMES: OnceLock<Mutex<HashMap<u64, String>>> = OnceLock::new();

fn names() -> &'static Mutex<HashMap<u64, String>> {
    THREAD_NAMES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Record a display name for the calling thread, answered to viewer queries.
pub fn set_thread_name(name: &str) {
    names().lock().insert(current_thread_id(), name.to_owned());
}

/// Look up a thread's display name.
pub(crate) fn thread_name(id: u64) -> Option<String> {
    names().lock().get(&id).cloned()
}
