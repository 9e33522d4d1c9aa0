//! In-process performance profiler instrumentation client.
//!
//! Host applications annotate code with zones, frame marks, plots, messages,
//! and memory events; zonewire captures high-resolution timestamps with
//! minimal overhead on the instrumented thread and streams a compressed
//! binary event log to an external viewer over TCP.
//!
//! Instrumented threads write fixed-size records into per-thread lock-free
//! queues (or, for events that need global ordering, a briefly-locked serial
//! queue). A background worker drains the queues, resolves deferred payloads,
//! compresses the stream, and serves interactive viewer queries.
//!
//! # Usage
//!
//! Start the profiler once at application startup:
//!
//! ```no_run
//! zonewire::startup(zonewire::Config::default()).expect("profiler start");
//! ```
//!
//! Then instrument:
//!
//! ```no_run
//! use zonewire::{ScopedZone, SourceLocation};
//!
//! static RENDER: SourceLocation = SourceLocation {
//!     name: Some("render"),
//!     function: "render_frame",
//!     file: file!(),
//!     line: line!(),
//!     color: 0,
//! };
//!
//! fn render_frame() {
//!     let _zone = ScopedZone::new(&RENDER, true);
//!     // ... frame rendering code
//! }
//! ```
//!
//! Call [`frame_mark`] at the end of each frame. In on-demand mode
//! ([`Config::on_demand`]) nothing is recorded until a viewer connects, so
//! shipping builds pay near-zero cost while disconnected.

mod api;
mod callstack;
mod clock;
mod error;
mod profiler;
pub mod proto;
mod queue;
mod record;
mod scoped;
mod serial;
mod srcloc;
mod thread;
mod worker;

pub use api::{
    app_info, begin_zone, begin_zone_alloc, begin_zone_alloc_callstack, begin_zone_callstack,
    configure_plot, end_zone, frame_image, frame_mark, frame_mark_end, frame_mark_named,
    frame_mark_start, gpu_emit_new_context, gpu_emit_time, gpu_emit_zone_begin,
    gpu_emit_zone_end, gpu_next_context_id, gpu_should_emit, mem_alloc, mem_alloc_callstack,
    mem_free, mem_free_callstack, message, message_color, message_literal, message_literal_color,
    parameter_register, parameter_setup, plot, zone_name, zone_text, zone_value,
};
pub use callstack::{
    set_stack_walker, set_symbol_resolver, StackWalker, SymbolFrame, SymbolResolver,
};
pub use clock::{now, Calibration};
pub use error::{Error, Result};
pub use profiler::{
    has_shutdown_finished, is_connected, is_on_demand, listen_addr, request_shutdown, startup,
    Config, ParameterCallback,
};
pub use record::{PlotFormat, PlotValue};
pub use scoped::ScopedZone;
pub use srcloc::SourceLocation;
pub use thread::{current_thread_id, set_thread_name};
