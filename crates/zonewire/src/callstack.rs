//! Depth-bounded callstack capture and deferred symbol resolution.
//!
//! Both capabilities are abstract: the host (or a platform integration
//! crate) installs a [`StackWalker`] and optionally a [`SymbolResolver`] at
//! startup. Without a walker, callstack-qualified operations degrade to
//! their plain record types and the requested depth is ignored. Symbol
//! resolution never happens on the instrumented thread; the worker transmits
//! raw addresses and resolves frames only when the viewer asks.

use std::sync::OnceLock;

/// Walks the current thread's stack to a bounded depth.
pub trait StackWalker: Send + Sync {
    /// Return up to `depth` return addresses, innermost first, or `None` if
    /// the walk is unavailable in the current context.
    fn capture(&self, depth: u8) -> Option<Vec<u64>>;
}

/// One resolved stack frame.
#[derive(Debug, Clone)]
pub struct SymbolFrame {
    pub name: String,
    pub file: String,
    pub line: u32,
}

/// Resolves raw addresses when the viewer queries them.
pub trait SymbolResolver: Send + Sync {
    /// Resolve an address to its frames (more than one when inlined).
    fn resolve(&self, addr: u64) -> Option<Vec<SymbolFrame>>;

    /// Machine code bytes backing a symbol, for viewer disassembly.
    fn symbol_code(&self, _addr: u64, _len: u32) -> Option<Vec<u8>> {
        None
    }
}

static WALKER: OnceLock<Box<dyn StackWalker>> = OnceLock::new();
static RESOLVER: OnceLock<Box<dyn SymbolResolver>> = OnceLock::new();

/// Install the process-wide stack walker. The first installation wins;
/// returns `false` if one was already present.
pub fn set_stack_walker(walker: Box<dyn StackWalker>) -> bool {
    WALKER.set(walker).is_ok()
}

/// Install the process-wide symbol resolver. The first installation wins.
pub fn set_symbol_resolver(resolver: Box<dyn SymbolResolver>) -> bool {
    RESOLVER.set(resolver).is_ok()
}

/// Whether callstack-qualified records can be produced at all.
pub(crate) fn has_walker() -> bool {
    WALKER.get().is_some()
}

pub(crate) fn resolver() -> Option<&'static dyn SymbolResolver> {
    RESOLVER.get().map(|r| r.as_ref())
}

/// Capture the current stack into a heap slab and return its handle, or
/// `None` when no walker is installed or the walk failed.
pub(crate) fn capture(depth: u8) -> Option<u64> {
    let walker = WALKER.get()?;
    let mut addrs = walker.capture(depth)?;
    addrs.truncate(depth as usize);
    Some(alloc_callstack(&addrs))
}

/// Heap slab layout: `[u64 count][count addresses]`.
fn alloc_callstack(addrs: &[u64]) -> u64 {
    let mut slab = Vec::with_capacity(addrs.len() + 1);
    slab.push(addrs.len() as u64);
    slab.extend_from_slice(addrs);
    Box::into_raw(slab.into_boxed_slice()) as *mut u64 as u64
}

/// Read the addresses behind a callstack handle.
///
/// # Safety
/// `handle` must come from [`capture`] and must not have been freed.
pub(crate) unsafe fn addresses<'a>(handle: u64) -> &'a [u64] {
    let ptr = handle as *const u64;
    let count = ptr.read() as usize;
    std::slice::from_raw_parts(ptr.add(1), count)
}

/// Free a callstack slab after transmission.
///
/// # Safety
/// `handle` must come from [`capture`] and must not be used afterwards.
pub(crate) unsafe fn free(handle: u64) {
    let count = (handle as *const u64).read() as usize;
    let slice = std::ptr::slice_from_raw_parts_mut(handle as *mut u64, count + 1);
    drop(Box::from_raw(slice));
}
