//! Queue records.
//!
//! [`QueueEvent`] is the fixed-size tagged record moved through the
//! per-thread and serial queues. Payload fields are `Copy`: static strings
//! and source locations are carried by reference (the address is the wire
//! identity), while owned payloads such as zone text, messages, packed
//! source locations, and callstacks are carried as raw heap handles.
//! Ownership of a handle transfers to the worker together with the record;
//! the worker frees it after transmission.

use crate::srcloc::SourceLocation;

/// Reference to a zone's source location as stored on the zone stack.
///
/// Kept on the stack entry (not in the queue) so a zone that straddles a
/// viewer reconnect can be re-begun with its original identity.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SrcLocHandle {
    Static(&'static SourceLocation),
    /// Packed runtime allocation; the payload may already have been freed by
    /// the worker, so only the identity may be used.
    Alloc(u64),
}

/// Value carried by a plot point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlotValue {
    I64(i64),
    F32(f32),
    F64(f64),
}

impl From<i64> for PlotValue {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<f32> for PlotValue {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

impl From<f64> for PlotValue {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

/// Display format configured for a plot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlotFormat {
    /// Plain numbers.
    Number = 0,
    /// Bytes, shown with binary prefixes.
    Memory = 1,
    /// Fractions shown as percentages.
    Percentage = 2,
}

/// A fixed-size event record.
///
/// Variants map one-to-one onto wire record types, except that callstack
/// qualification is a flag here and a distinct tag on the wire.
#[derive(Debug, Clone, Copy)]
pub enum QueueEvent {
    ZoneBegin {
        time: i64,
        srcloc: &'static SourceLocation,
        callstack: bool,
    },
    ZoneBeginAllocSrcLoc {
        time: i64,
        /// Packed source location handle; freed by the worker after send.
        srcloc: u64,
        callstack: bool,
    },
    /// Re-begin of a zone whose packed source location was already
    /// transmitted and freed; carries the identity only.
    ZoneBeginReplay {
        time: i64,
        srcloc_id: u64,
    },
    ZoneEnd {
        time: i64,
    },
    ZoneValidation {
        id: u32,
    },
    ZoneText {
        /// Heap text handle; freed by the worker after send.
        text: u64,
    },
    ZoneName {
        text: u64,
    },
    ZoneValue {
        value: u64,
    },
    Callstack {
        /// Heap callstack slab handle; freed by the worker after send.
        handle: u64,
    },
    FrameMark {
        time: i64,
        /// `None` marks the global frame counter's frame.
        name: Option<&'static str>,
    },
    FrameMarkStart {
        time: i64,
        name: &'static str,
    },
    FrameMarkEnd {
        time: i64,
        name: &'static str,
    },
    PlotData {
        name: &'static str,
        time: i64,
        value: PlotValue,
    },
    PlotConfig {
        name: &'static str,
        format: PlotFormat,
    },
    Message {
        time: i64,
        text: u64,
        callstack: bool,
    },
    MessageLiteral {
        time: i64,
        text: &'static str,
        callstack: bool,
    },
    MessageColor {
        time: i64,
        text: u64,
        color: u32,
        callstack: bool,
    },
    MessageLiteralColor {
        time: i64,
        text: &'static str,
        color: u32,
        callstack: bool,
    },
    MessageAppInfo {
        time: i64,
        text: u64,
    },
    MemAlloc {
        time: i64,
        thread: u64,
        ptr: u64,
        size: u64,
        callstack: bool,
    },
    MemFree {
        time: i64,
        thread: u64,
        ptr: u64,
        callstack: bool,
    },
    CallstackMemory {
        handle: u64,
    },
    GpuNewContext {
        cpu_time: i64,
        gpu_time: i64,
        period: f32,
        context: u8,
    },
    GpuZoneBegin {
        cpu_time: i64,
        srcloc: &'static SourceLocation,
        thread: u64,
        query_id: u16,
        context: u8,
        callstack: bool,
    },
    GpuZoneEnd {
        cpu_time: i64,
        thread: u64,
        query_id: u16,
        context: u8,
    },
    GpuTime {
        gpu_time: i64,
        query_id: u16,
        context: u8,
    },
    ParamSetup {
        idx: u32,
        name: &'static str,
        is_bool: bool,
        val: i32,
    },
}

// The queue moves records by value; keep them small enough that a 32 KiB
// block holds several hundred.
const _: () = assert!(std::mem::size_of::<QueueEvent>() <= 64);

/// Events replayed verbatim at every (re)connection.
///
/// Unlike live records these own their payloads for the life of the process.
#[derive(Debug, Clone)]
pub(crate) enum DeferredEvent {
    PlotConfig {
        name: &'static str,
        format: PlotFormat,
    },
    AppInfo {
        time: i64,
        text: String,
    },
    ParamSetup {
        idx: u32,
        name: &'static str,
        is_bool: bool,
        val: i32,
    },
    GpuNewContext {
        cpu_time: i64,
        gpu_time: i64,
        period: f32,
        context: u8,
    },
}

/// Length-prefixed heap text payload: `[u32 len][bytes]`.
pub(crate) fn alloc_text(text: &[u8]) -> u64 {
    let mut buf = Vec::with_capacity(4 + text.len());
    buf.extend_from_slice(&(text.len() as u32).to_le_bytes());
    buf.extend_from_slice(text);
    Box::into_raw(buf.into_boxed_slice()) as *mut u8 as u64
}

/// Read the text bytes behind a handle.
///
/// # Safety
/// `handle` must come from [`alloc_text`] and must not have been freed.
pub(crate) unsafe fn text_bytes<'a>(handle: u64) -> &'a [u8] {
    let ptr = handle as *const u8;
    let mut len_bytes = [0u8; 4];
    std::ptr::copy_nonoverlapping(ptr, len_bytes.as_mut_ptr(), 4);
    let len = u32::from_le_bytes(len_bytes) as usize;
    std::slice::from_raw_parts(ptr.add(4), len)
}

/// Free a text payload after transmission.
///
/// # Safety
/// `handle` must come from [`alloc_text`] and must not be used afterwards.
pub(crate) unsafe fn free_text(handle: u64) {
    let len = text_bytes(handle).len();
    let slice = std::ptr::slice_from_raw_parts_mut(handle as *mut u8, 4 + len);
    drop(Box::from_raw(slice));
}
