//! Backend abstraction for command-queue timestamp collection.
//!
//! The bridge is written against these seams so the same context logic
//! drives any API with D3D12-style timestamp queries: a query heap the
//! command list writes `EndQuery` timestamps into, a CPU-readable readback
//! buffer the queries are resolved to before execution, and a per-queue
//! timestamp frequency plus calibration sample.

use crate::error::Result;

/// Hardware command queue kind. Copy queues need an explicit device
/// capability for timestamp queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Direct,
    Compute,
    Copy,
}

/// One GPU API backend.
pub trait GpuBackend {
    type Device;
    type Queue;
    type CommandList;
    type QueryHeap;
    type ReadbackBuffer;

    fn queue_kind(queue: &Self::Queue) -> QueueKind;

    /// Whether the device can service timestamp queries on copy queues.
    fn copy_queue_timestamps_supported(device: &Self::Device) -> bool;

    /// Ticks per second of the queue's timestamp counter.
    fn timestamp_frequency(queue: &Self::Queue) -> u64;

    /// A GPU timestamp correlated with "now"; the CPU half of the
    /// calibration pair is sampled by the profiler clock at the same moment.
    fn current_gpu_timestamp(queue: &Self::Queue) -> i64;

    /// Create a timestamp query heap with `slots` slots.
    fn create_query_heap(
        device: &Self::Device,
        kind: QueueKind,
        slots: u32,
    ) -> Result<Self::QueryHeap>;

    /// Create a CPU-readable buffer of `bytes` bytes for query resolution.
    fn create_readback_buffer(device: &Self::Device, bytes: u64) -> Result<Self::ReadbackBuffer>;

    /// Record a timestamp write into heap slot `index`.
    fn end_query(list: &mut Self::CommandList, heap: &Self::QueryHeap, index: u32);

    /// Record the resolve of heap slots `[first, first + count)` into the
    /// readback buffer.
    fn resolve_query_data(
        list: &mut Self::CommandList,
        heap: &Self::QueryHeap,
        first: u32,
        count: u32,
        readback: &Self::ReadbackBuffer,
    );

    /// Map the readback buffer and copy out the first `count` timestamps.
    /// The caller guarantees the GPU finished the resolved work.
    fn read_timestamps(readback: &Self::ReadbackBuffer, count: u32) -> Vec<i64>;
}
