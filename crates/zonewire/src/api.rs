//! Host-facing instrumentation primitives.
//!
//! Every operation here is safe to call from any thread at any time: before
//! the profiler starts they are no-ops, in on-demand mode without a viewer
//! they are silently dropped, and none of them ever blocks the host beyond
//! the one-record serial-queue lock and the few-instruction end-zone spin.
//!
//! Zone begin/end must be paired on the same thread and nest to a depth of
//! 256; `ScopedZone` in this crate pairs them automatically.

use std::sync::atomic::Ordering;

use crate::callstack;
use crate::clock;
use crate::profiler::{ParameterCallback, Profiler};
use crate::record::{self, DeferredEvent, PlotFormat, PlotValue, QueueEvent, SrcLocHandle};
use crate::serial::FrameImage;
use crate::srcloc::{self, SourceLocation};
use crate::thread::{self, ThreadContext, ZoneEntry};

#[inline]
fn emit_validation(ctx: &ThreadContext, id: u32) {
    // Verification records exist to catch begin/end mismatches during
    // development; release builds skip them to keep the stream lean.
    if cfg!(debug_assertions) {
        ctx.enqueue(QueueEvent::ZoneValidation { id });
    }
}

fn begin_common(
    p: &Profiler,
    ctx: &ThreadContext,
    srcloc: SrcLocHandle,
    active: bool,
    depth: Option<u8>,
) {
    let id = p.next_zone_id();
    ctx.stack.push(ZoneEntry {
        id,
        connection_id: p.connection_id(),
        srcloc: Some(srcloc),
        active,
    });
    if !active {
        return;
    }
    emit_validation(ctx, id);
    let time = clock::now();
    let cs = depth.and_then(callstack::capture);
    match srcloc {
        SrcLocHandle::Static(s) => ctx.enqueue(QueueEvent::ZoneBegin {
            time,
            srcloc: s,
            callstack: cs.is_some(),
        }),
        SrcLocHandle::Alloc(h) => ctx.enqueue(QueueEvent::ZoneBeginAllocSrcLoc {
            time,
            srcloc: h,
            callstack: cs.is_some(),
        }),
    }
    if let Some(handle) = cs {
        ctx.enqueue(QueueEvent::Callstack { handle });
    }
}

/// Push an inactive activation so end_zone stays balanced even for gated
/// or inactive begins.
fn push_inactive(p: &Profiler, ctx: &ThreadContext) {
    ctx.stack.push(ZoneEntry {
        id: p.next_zone_id(),
        connection_id: p.connection_id(),
        srcloc: None,
        active: false,
    });
}

/// Open a zone identified by a static source location.
///
/// An `active: false` zone keeps the stack balanced but emits nothing.
#[inline]
pub fn begin_zone(srcloc: &'static SourceLocation, active: bool) {
    begin_zone_depth(srcloc, active, None);
}

/// Open a zone and capture a callstack bounded to `depth` frames.
///
/// Degrades to [`begin_zone`] when no stack walker is installed.
#[inline]
pub fn begin_zone_callstack(srcloc: &'static SourceLocation, active: bool, depth: u8) {
    begin_zone_depth(srcloc, active, Some(depth));
}

fn begin_zone_depth(srcloc: &'static SourceLocation, active: bool, depth: Option<u8>) {
    thread::with_current(|p, ctx| {
        if p.config.on_demand && !ctx.is_active.load(Ordering::Acquire) {
            push_inactive(p, ctx);
            return;
        }
        begin_common(p, ctx, SrcLocHandle::Static(srcloc), active, depth);
    });
}

/// Open a zone whose source location is only known at runtime. The packed
/// location is transmitted once and freed by the worker.
pub fn begin_zone_alloc(line: u32, file: &str, function: &str, name: Option<&str>, active: bool) {
    begin_zone_alloc_depth(line, file, function, name, active, None);
}

/// Runtime source location plus a bounded callstack capture.
pub fn begin_zone_alloc_callstack(
    line: u32,
    file: &str,
    function: &str,
    name: Option<&str>,
    active: bool,
    depth: u8,
) {
    begin_zone_alloc_depth(line, file, function, name, active, Some(depth));
}

fn begin_zone_alloc_depth(
    line: u32,
    file: &str,
    function: &str,
    name: Option<&str>,
    active: bool,
    depth: Option<u8>,
) {
    thread::with_current(|p, ctx| {
        if (p.config.on_demand && !ctx.is_active.load(Ordering::Acquire)) || !active {
            // Keep the stack balanced without paying for a packed buffer that
            // would never be transmitted.
            push_inactive(p, ctx);
            return;
        }
        let handle = srcloc::alloc_source_location(line, file, function, name);
        begin_common(p, ctx, SrcLocHandle::Alloc(handle), true, depth);
    });
}

/// Close the innermost zone opened on this thread.
pub fn end_zone() {
    thread::with_current(|p, ctx| {
        let zone = ctx.stack.pop();
        if !zone.active {
            return;
        }
        let time = clock::now();
        if p.config.on_demand {
            // The spin lock serializes this check against the worker flipping
            // the connection epoch, so the re-begin below cannot race a
            // disconnect. Symmetric unlock on every branch.
            ctx.lock();
            if !ctx.is_active.load(Ordering::Acquire) {
                ctx.unlock();
                return;
            }
            if zone.connection_id != p.connection_id() {
                // The viewer missed the begin: re-emit it with the end-time
                // timestamp so the zone appears zero-width but parented.
                emit_validation(ctx, zone.id);
                match zone.srcloc {
                    Some(SrcLocHandle::Static(s)) => ctx.enqueue(QueueEvent::ZoneBegin {
                        time,
                        srcloc: s,
                        callstack: false,
                    }),
                    Some(SrcLocHandle::Alloc(h)) => {
                        // The packed payload was freed after its first
                        // transmission; only the identity survives.
                        ctx.enqueue(QueueEvent::ZoneBeginReplay { time, srcloc_id: h });
                    }
                    None => {}
                }
            }
            ctx.unlock();
        }
        emit_validation(ctx, zone.id);
        ctx.enqueue(QueueEvent::ZoneEnd { time });
    });
}

/// Attach free-form text to the current zone.
pub fn zone_text(text: &str) {
    thread::with_current(|p, ctx| {
        if p.config.on_demand && !ctx.is_active.load(Ordering::Acquire) {
            return;
        }
        ctx.enqueue(QueueEvent::ZoneText {
            text: record::alloc_text(text.as_bytes()),
        });
    });
}

/// Override the current zone's displayed name.
pub fn zone_name(text: &str) {
    thread::with_current(|p, ctx| {
        if p.config.on_demand && !ctx.is_active.load(Ordering::Acquire) {
            return;
        }
        ctx.enqueue(QueueEvent::ZoneName {
            text: record::alloc_text(text.as_bytes()),
        });
    });
}

/// Attach a numeric value to the current zone.
pub fn zone_value(value: u64) {
    thread::with_current(|p, ctx| {
        if p.config.on_demand && !ctx.is_active.load(Ordering::Acquire) {
            return;
        }
        ctx.enqueue(QueueEvent::ZoneValue { value });
    });
}

/// Mark the end of the application's main frame and advance the global frame
/// counter.
#[inline]
pub fn frame_mark() {
    frame_mark_impl(None);
}

/// Mark a named auxiliary frame; does not advance the frame counter.
#[inline]
pub fn frame_mark_named(name: &'static str) {
    frame_mark_impl(Some(name));
}

fn frame_mark_impl(name: Option<&'static str>) {
    let Some(p) = Profiler::try_global() else {
        return;
    };
    if name.is_none() {
        p.frame_count.fetch_add(1, Ordering::Relaxed);
    }
    if p.config.on_demand && !p.is_connected() {
        return;
    }
    thread::with_current(|_, ctx| {
        ctx.enqueue(QueueEvent::FrameMark {
            time: clock::now(),
            name,
        });
    });
}

/// Open a discontinuous sub-frame. Must be paired with
/// [`frame_mark_end`] using the same name.
pub fn frame_mark_start(name: &'static str) {
    let Some(p) = Profiler::try_global() else {
        return;
    };
    if p.config.on_demand && !p.is_connected() {
        return;
    }
    p.serial.push(QueueEvent::FrameMarkStart {
        time: clock::now(),
        name,
    });
}

/// Close a sub-frame opened with [`frame_mark_start`].
pub fn frame_mark_end(name: &'static str) {
    let Some(p) = Profiler::try_global() else {
        return;
    };
    if p.config.on_demand && !p.is_connected() {
        return;
    }
    p.serial.push(QueueEvent::FrameMarkEnd {
        time: clock::now(),
        name,
    });
}

/// Submit a captured frame for the viewer's frame thumbnails.
///
/// `pixels` must hold `width * height * 4` RGBA bytes; they are copied
/// before returning. `offset` attributes the image to an already-closed
/// frame (`current frame - offset`); `flip` asks the viewer to mirror
/// vertically (bottom-up sources).
pub fn frame_image(pixels: &[u8], width: u16, height: u16, offset: u8, flip: bool) {
    let Some(p) = Profiler::try_global() else {
        return;
    };
    if p.config.on_demand && !p.is_connected() {
        return;
    }
    let expected = usize::from(width) * usize::from(height) * 4;
    assert_eq!(
        pixels.len(),
        expected,
        "frame image must be width * height * 4 RGBA bytes"
    );
    let frame = p
        .frame_count
        .load(Ordering::Relaxed)
        .saturating_sub(u64::from(offset));
    p.frame_images.push(FrameImage {
        pixels: pixels.to_vec().into_boxed_slice(),
        frame,
        width,
        height,
        flip,
    });
}

/// Record one point of a named plot.
pub fn plot(name: &'static str, value: impl Into<PlotValue>) {
    let Some(p) = Profiler::try_global() else {
        return;
    };
    if p.config.on_demand && !p.is_connected() {
        return;
    }
    thread::with_current(|_, ctx| {
        ctx.enqueue(QueueEvent::PlotData {
            name,
            time: clock::now(),
            value: value.into(),
        });
    });
}

/// Configure a plot's display format. Deferred: replayed to every viewer so
/// formatting survives reconnects.
pub fn configure_plot(name: &'static str, format: PlotFormat) {
    let Some(p) = Profiler::try_global() else {
        return;
    };
    p.defer(DeferredEvent::PlotConfig { name, format });
    thread::with_current(|_, ctx| {
        ctx.enqueue(QueueEvent::PlotConfig { name, format });
    });
}

/// Capture a callstack when requested and possible; emit the trailing
/// `Callstack` record right after the qualified record.
#[inline]
fn capture_for(depth: u8) -> Option<u64> {
    if depth > 0 {
        callstack::capture(depth)
    } else {
        None
    }
}

/// Log a message into the timeline. `callstack_depth > 0` also captures a
/// callstack when a walker is installed.
pub fn message(text: &str, callstack_depth: u8) {
    thread::with_current(|p, ctx| {
        if p.config.on_demand && !p.is_connected() {
            return;
        }
        let time = clock::now();
        let cs = capture_for(callstack_depth);
        ctx.enqueue(QueueEvent::Message {
            time,
            text: record::alloc_text(text.as_bytes()),
            callstack: cs.is_some(),
        });
        if let Some(handle) = cs {
            ctx.enqueue(QueueEvent::Callstack { handle });
        }
    });
}

/// Log a static message without copying it.
pub fn message_literal(text: &'static str, callstack_depth: u8) {
    thread::with_current(|p, ctx| {
        if p.config.on_demand && !p.is_connected() {
            return;
        }
        let time = clock::now();
        let cs = capture_for(callstack_depth);
        ctx.enqueue(QueueEvent::MessageLiteral {
            time,
            text,
            callstack: cs.is_some(),
        });
        if let Some(handle) = cs {
            ctx.enqueue(QueueEvent::Callstack { handle });
        }
    });
}

/// Log a colored message (0xRRGGBB).
pub fn message_color(text: &str, color: u32, callstack_depth: u8) {
    thread::with_current(|p, ctx| {
        if p.config.on_demand && !p.is_connected() {
            return;
        }
        let time = clock::now();
        let cs = capture_for(callstack_depth);
        ctx.enqueue(QueueEvent::MessageColor {
            time,
            text: record::alloc_text(text.as_bytes()),
            color,
            callstack: cs.is_some(),
        });
        if let Some(handle) = cs {
            ctx.enqueue(QueueEvent::Callstack { handle });
        }
    });
}

/// Log a colored static message.
pub fn message_literal_color(text: &'static str, color: u32, callstack_depth: u8) {
    thread::with_current(|p, ctx| {
        if p.config.on_demand && !p.is_connected() {
            return;
        }
        let time = clock::now();
        let cs = capture_for(callstack_depth);
        ctx.enqueue(QueueEvent::MessageLiteralColor {
            time,
            text,
            color,
            callstack: cs.is_some(),
        });
        if let Some(handle) = cs {
            ctx.enqueue(QueueEvent::Callstack { handle });
        }
    });
}

/// Report build/version information. Deferred: replayed to every viewer.
pub fn app_info(text: &str) {
    let Some(p) = Profiler::try_global() else {
        return;
    };
    let time = clock::now();
    p.defer(DeferredEvent::AppInfo {
        time,
        text: text.to_owned(),
    });
    thread::with_current(|_, ctx| {
        ctx.enqueue(QueueEvent::MessageAppInfo {
            time,
            text: record::alloc_text(text.as_bytes()),
        });
    });
}

fn mem_alloc_impl(ptr: u64, size: u64, depth: u8) {
    let Some(p) = Profiler::try_global() else {
        return;
    };
    if p.config.on_demand && !p.is_connected() {
        return;
    }
    let thread = thread::current_thread_id();
    let time = clock::now();
    let cs = if depth > 0 { callstack::capture(depth) } else { None };
    match cs {
        Some(handle) => p.serial.push_pair(
            QueueEvent::MemAlloc {
                time,
                thread,
                ptr,
                size,
                callstack: true,
            },
            QueueEvent::CallstackMemory { handle },
        ),
        None => p.serial.push(QueueEvent::MemAlloc {
            time,
            thread,
            ptr,
            size,
            callstack: false,
        }),
    }
}

fn mem_free_impl(ptr: u64, depth: u8) {
    let Some(p) = Profiler::try_global() else {
        return;
    };
    if p.config.on_demand && !p.is_connected() {
        return;
    }
    let thread = thread::current_thread_id();
    let time = clock::now();
    let cs = if depth > 0 { callstack::capture(depth) } else { None };
    match cs {
        Some(handle) => p.serial.push_pair(
            QueueEvent::MemFree {
                time,
                thread,
                ptr,
                callstack: true,
            },
            QueueEvent::CallstackMemory { handle },
        ),
        None => p.serial.push(QueueEvent::MemFree {
            time,
            thread,
            ptr,
            callstack: false,
        }),
    }
}

/// Report a heap allocation, globally ordered against all other memory
/// events.
#[inline]
pub fn mem_alloc(ptr: u64, size: u64) {
    mem_alloc_impl(ptr, size, 0);
}

/// Report a heap allocation with an attributing callstack.
#[inline]
pub fn mem_alloc_callstack(ptr: u64, size: u64, depth: u8) {
    mem_alloc_impl(ptr, size, depth);
}

/// Report a heap free.
#[inline]
pub fn mem_free(ptr: u64) {
    mem_free_impl(ptr, 0);
}

/// Report a heap free with an attributing callstack.
#[inline]
pub fn mem_free_callstack(ptr: u64, depth: u8) {
    mem_free_impl(ptr, depth);
}

/// Register the callback invoked when the viewer changes a parameter.
pub fn parameter_register(callback: ParameterCallback) {
    if let Some(p) = Profiler::try_global() {
        *p.param_callback.lock() = Some(callback);
    }
}

/// Declare a host parameter the viewer can change. Deferred: replayed to
/// every viewer.
pub fn parameter_setup(idx: u32, name: &'static str, is_bool: bool, val: i32) {
    let Some(p) = Profiler::try_global() else {
        return;
    };
    p.defer(DeferredEvent::ParamSetup {
        idx,
        name,
        is_bool,
        val,
    });
    thread::with_current(|_, ctx| {
        ctx.enqueue(QueueEvent::ParamSetup {
            idx,
            name,
            is_bool,
            val,
        });
    });
}

// --- GPU bridge surface -------------------------------------------------
//
// Used by timestamp bridge crates (zonewire-gpu); not intended for direct
// application use.

/// Reserve the next GPU context id. `None` before startup or once the 8-bit
/// space is exhausted.
pub fn gpu_next_context_id() -> Option<u8> {
    Profiler::try_global()?.next_gpu_context()
}

/// Announce a new GPU context with its CPU/GPU calibration pair. Deferred:
/// replayed to every viewer.
pub fn gpu_emit_new_context(gpu_time: i64, period: f32, context: u8) {
    let Some(p) = Profiler::try_global() else {
        return;
    };
    let cpu_time = clock::now();
    p.defer(DeferredEvent::GpuNewContext {
        cpu_time,
        gpu_time,
        period,
        context,
    });
    p.serial.push(QueueEvent::GpuNewContext {
        cpu_time,
        gpu_time,
        period,
        context,
    });
}

/// Emit the CPU-side begin of a GPU zone.
pub fn gpu_emit_zone_begin(
    srcloc: &'static SourceLocation,
    query_id: u16,
    context: u8,
    callstack_depth: u8,
) {
    let Some(p) = Profiler::try_global() else {
        return;
    };
    let thread = thread::current_thread_id();
    let cpu_time = clock::now();
    let cs = if callstack_depth > 0 {
        callstack::capture(callstack_depth)
    } else {
        None
    };
    let begin = QueueEvent::GpuZoneBegin {
        cpu_time,
        srcloc,
        thread,
        query_id,
        context,
        callstack: cs.is_some(),
    };
    match cs {
        Some(handle) => p
            .serial
            .push_pair(begin, QueueEvent::Callstack { handle }),
        None => p.serial.push(begin),
    }
}

/// Emit the CPU-side end of a GPU zone.
pub fn gpu_emit_zone_end(query_id: u16, context: u8) {
    let Some(p) = Profiler::try_global() else {
        return;
    };
    p.serial.push(QueueEvent::GpuZoneEnd {
        cpu_time: clock::now(),
        thread: thread::current_thread_id(),
        query_id,
        context,
    });
}

/// Emit one resolved GPU timestamp.
pub fn gpu_emit_time(gpu_time: i64, query_id: u16, context: u8) {
    let Some(p) = Profiler::try_global() else {
        return;
    };
    p.serial.push(QueueEvent::GpuTime {
        gpu_time,
        query_id,
        context,
    });
}

/// Whether collected GPU timestamps would reach a viewer; when `false`,
/// bridges should discard instead of emitting.
pub fn gpu_should_emit() -> bool {
    Profiler::try_global()
        .map(|p| !p.config.on_demand || p.is_connected())
        .unwrap_or(false)
}
