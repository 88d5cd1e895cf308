//! Mesh memory management.
//!
//! # Overview
//!
//! tl;dr - [MeshAllocator] hands out byte ranges of mesh (vertex + index) memory and compacts its
//! buffers when they get fragmented, so that the renderer never has to allocate GPU memory per
//! mesh.
//!
//! The memory management hierarchy is as follows:
//!
//! ## Backing buffers
//!
//! The lowest level is one large buffer of device memory, created through a [BackingAllocator].
//! Creating one is slow, so it happens rarely: once when the pool is made and then only when every
//! existing buffer is out of room.
//!
//! ## Arenas
//!
//! An [Arena] owns one backing buffer and splits it into [Block]s on the cpu (much faster!). Blocks
//! are kept in offset order in a [BlockList]. Allocation is first-fit. Freeing merges a block with
//! its free neighbours. When an arena has enough free bytes for a request but no single block big
//! enough, it compacts: every used block slides toward offset zero and all free space collects in
//! one block at the end. Each move is reported as a [Relocation].
//!
//! ## The pool
//!
//! [MeshAllocator] owns all arenas behind one lock and creates new ones on demand. Callers hold
//! [MeshAllocation] handles and resolve them through
//! [get_backing_storage](MeshAllocator::get_backing_storage), since compaction can move the bytes.
//! [barrier] builds the pipeline barriers that keep uploads and draws from stepping on each other.

pub mod arena;
pub mod backing;
pub mod barrier;
pub mod block;
pub mod pool;
#[cfg(feature = "wgpu-backing")]
pub mod wgpu_backing;

pub use arena::{Arena, ArenaId, ArenaStats, MeshAllocation, Relocation};
pub use backing::{BackingAllocator, BackingBuffer, BackingError, HostBackingAllocator, HostBuffer, HostBufferHandle};
pub use barrier::{AccessFlags, BarrierLog, BufferBarrier, CommandRecorder, PipelineBarrier, PipelineStages, QueueFamilies, UploadPhase};
pub use block::{Block, BlockId, BlockList};
pub use pool::{BackingRange, MeshAllocator, ResourceOf};

use crate::config::ConfigError;

#[derive(thiserror::Error, Debug)]
pub enum MeshMemoryError {
    #[error("Tried to allocate zero bytes of mesh memory")]
    ZeroSizedAllocation,
    #[error("Requested {requested} bytes but arenas only hold {arena_capacity} bytes")]
    AllocationTooLarge { requested: u64, arena_capacity: u64 },
    #[error("Requested {requested} bytes but a new arena would exceed the {max_total_allocation} byte ceiling")]
    PoolExhausted { requested: u64, max_total_allocation: u64 },
    #[error("Could not create a backing buffer for a new arena: {0}")]
    BackingCreation(#[from] BackingError),
    #[error("Invalid mesh memory configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Allocation refers to {0}, which this pool does not own")]
    UnknownArena(ArenaId),
    #[error("{arena} has no block {block}")]
    UnknownBlock { arena: ArenaId, block: BlockId },
    #[error("{block} in {arena} was freed twice")]
    DoubleFree { arena: ArenaId, block: BlockId },
}
