//! Per-queue and per-allocator timestamp contexts.

use std::sync::atomic::{AtomicU32, Ordering};

use zonewire::SourceLocation;

use crate::backend::{GpuBackend, QueueKind};
use crate::error::{GpuError, Result};

/// Query heap slots requested initially; halved until creation succeeds.
pub const MAX_QUERY_SLOTS: u32 = 1024;

/// Command allocator contexts allowed per queue context. Query ids pack the
/// allocator index above a 10-bit counter, so the product must stay within
/// 16 bits.
pub const MAX_ALLOCATORS: u32 = 64;

/// Per-command-queue timestamp context.
///
/// Construction samples a correlated CPU/GPU clock pair, derives the
/// nanoseconds-per-tick period from the queue's timestamp frequency, and
/// announces the context to the viewer (deferred, so reconnecting viewers
/// learn it too). A copy queue on a device without copy-queue timestamp
/// support yields an inactive context that records nothing.
pub struct GpuQueueContext {
    inited: bool,
    context_id: u8,
    period_ns: f32,
    allocators: AtomicU32,
}

impl GpuQueueContext {
    pub fn new<B: GpuBackend>(device: &B::Device, queue: &B::Queue) -> Self {
        let inactive = Self {
            inited: false,
            context_id: 0,
            period_ns: 0.0,
            allocators: AtomicU32::new(0),
        };

        if B::queue_kind(queue) == QueueKind::Copy && !B::copy_queue_timestamps_supported(device)
        {
            tracing::warn!("copy-queue timestamp queries unsupported; GPU context inactive");
            return inactive;
        }
        let Some(context_id) = zonewire::gpu_next_context_id() else {
            tracing::warn!("GPU context id space exhausted; GPU context inactive");
            return inactive;
        };

        let frequency = B::timestamp_frequency(queue);
        if frequency == 0 {
            tracing::warn!("queue reports zero timestamp frequency; GPU context inactive");
            return inactive;
        }
        // Nanoseconds for one timestamp increment.
        let period_ns = 1e9_f32 / frequency as f32;
        let gpu_time = B::current_gpu_timestamp(queue);
        zonewire::gpu_emit_new_context(gpu_time, period_ns, context_id);

        Self {
            inited: true,
            context_id,
            period_ns,
            allocators: AtomicU32::new(0),
        }
    }

    pub fn is_inited(&self) -> bool {
        self.inited
    }

    pub fn id(&self) -> u8 {
        self.context_id
    }

    /// Nanoseconds per GPU tick, as reported to the viewer.
    pub fn period_ns(&self) -> f32 {
        self.period_ns
    }

    fn next_allocator_index(&self) -> Result<u32> {
        self.allocators
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n < MAX_ALLOCATORS).then_some(n + 1)
            })
            .map_err(|_| GpuError::TooManyAllocators(MAX_ALLOCATORS))
    }
}

struct Query {
    id: u32,
    index: u32,
}

/// Per-command-recorder timestamp context.
///
/// Owns a query heap and its readback buffer; holds a non-owning reference
/// to its queue context, which must outlive it. Query ids are
/// `(ctx_index << 10) | counter`, unique per connection until `collect`
/// resets the counter.
pub struct GpuCommandAllocatorContext<'q, B: GpuBackend> {
    queue_ctx: &'q GpuQueueContext,
    heap: Option<B::QueryHeap>,
    readback: Option<B::ReadbackBuffer>,
    ctx_index: u32,
    slots: u32,
    counter: u32,
    /// Mirror of open begin/end pairs so an inactive begin skips its end.
    active_stack: Vec<bool>,
    inited: bool,
}

impl<'q, B: GpuBackend> GpuCommandAllocatorContext<'q, B> {
    pub fn new(queue_ctx: &'q GpuQueueContext, device: &B::Device, kind: QueueKind) -> Result<Self> {
        let inactive = Self {
            queue_ctx,
            heap: None,
            readback: None,
            ctx_index: 0,
            slots: 0,
            counter: 0,
            active_stack: Vec::new(),
            inited: false,
        };

        if !queue_ctx.is_inited() {
            return Ok(inactive);
        }
        if kind == QueueKind::Copy && !B::copy_queue_timestamps_supported(device) {
            return Ok(inactive);
        }

        let ctx_index = queue_ctx.next_allocator_index()?;

        // Halve the heap until the device accepts it.
        let mut slots = MAX_QUERY_SLOTS;
        let heap = loop {
            match B::create_query_heap(device, kind, slots) {
                Ok(heap) => break heap,
                Err(_) if slots > 1 => slots /= 2,
                Err(e) => return Err(e),
            }
        };
        let readback = B::create_readback_buffer(device, u64::from(slots) * 8)?;

        Ok(Self {
            queue_ctx,
            heap: Some(heap),
            readback: Some(readback),
            ctx_index,
            slots,
            counter: 0,
            active_stack: Vec::new(),
            inited: true,
        })
    }

    pub fn is_inited(&self) -> bool {
        self.inited
    }

    pub fn context_id(&self) -> u8 {
        self.queue_ctx.id()
    }

    /// Query slots surviving the halving loop.
    pub fn slot_count(&self) -> u32 {
        self.slots
    }

    fn next_query(&mut self) -> Query {
        assert!(
            self.counter < self.slots,
            "GPU query slots exhausted; call pre_execute/collect more often"
        );
        let query = Query {
            id: (self.ctx_index << 10) | self.counter,
            index: self.counter,
        };
        self.counter += 1;
        query
    }

    /// Record a timestamp query and emit the CPU-side begin of a GPU zone.
    pub fn begin_zone(
        &mut self,
        srcloc: &'static SourceLocation,
        cmd_list: &mut B::CommandList,
        active: bool,
    ) {
        if !self.inited {
            return;
        }
        self.active_stack.push(active);
        if !active {
            return;
        }
        let query = self.next_query();
        B::end_query(cmd_list, self.heap.as_ref().expect("inited"), query.index);
        zonewire::gpu_emit_zone_begin(srcloc, query.id as u16, self.context_id(), 0);
    }

    /// Record the closing timestamp query of the innermost GPU zone.
    pub fn end_zone(&mut self, cmd_list: &mut B::CommandList) {
        if !self.inited {
            return;
        }
        let active = self
            .active_stack
            .pop()
            .expect("end_zone without a begin_zone");
        if !active {
            return;
        }
        let query = self.next_query();
        B::end_query(cmd_list, self.heap.as_ref().expect("inited"), query.index);
        zonewire::gpu_emit_zone_end(query.id as u16, self.context_id());
    }

    /// Resolve all queries written so far into the readback buffer. Must be
    /// recorded before the command list is submitted.
    pub fn pre_execute(&mut self, cmd_list: &mut B::CommandList) {
        if !self.inited || self.counter == 0 {
            return;
        }
        B::resolve_query_data(
            cmd_list,
            self.heap.as_ref().expect("inited"),
            0,
            self.counter,
            self.readback.as_ref().expect("inited"),
        );
    }

    /// Read back resolved timestamps and emit one `GpuTime` per slot. The
    /// caller guarantees the GPU completed the submitted work. Discards
    /// without emitting when no viewer would receive the data.
    pub fn collect(&mut self) {
        if !self.inited || self.counter == 0 {
            return;
        }
        if !zonewire::gpu_should_emit() {
            self.counter = 0;
            return;
        }
        let stamps = B::read_timestamps(self.readback.as_ref().expect("inited"), self.counter);
        for (index, gpu_time) in stamps.iter().enumerate().take(self.counter as usize) {
            let query_id = (self.ctx_index << 10) | index as u32;
            zonewire::gpu_emit_time(*gpu_time, query_id as u16, self.context_id());
        }
        self.counter = 0;
    }
}
