//! GPU command-queue timestamp bridge for the zonewire profiler.
//!
//! Pairs CPU-side zone records with GPU timestamp queries so the viewer can
//! place GPU work on the timeline. The bridge is backend-agnostic: implement
//! [`GpuBackend`] for an API with D3D12-style command-queue timestamp
//! queries and drive it with one [`GpuQueueContext`] per hardware queue and
//! one [`GpuCommandAllocatorContext`] per command recorder.
//!
//! ```ignore
//! let queue_ctx = GpuQueueContext::new::<MyBackend>(&device, &queue);
//! let mut alloc_ctx =
//!     GpuCommandAllocatorContext::<MyBackend>::new(&queue_ctx, &device, QueueKind::Direct)?;
//!
//! alloc_ctx.begin_zone(&DRAW_LOC, &mut cmd_list, true);
//! // ... record draw calls
//! alloc_ctx.end_zone(&mut cmd_list);
//! alloc_ctx.pre_execute(&mut cmd_list);
//! // submit, wait for completion
//! alloc_ctx.collect();
//! ```

mod backend;
mod context;
mod error;

pub use backend::{GpuBackend, QueueKind};
pub use context::{GpuCommandAllocatorContext, GpuQueueContext, MAX_ALLOCATORS, MAX_QUERY_SLOTS};
pub use error::{GpuError, Result};
