//! Pool of arenas.
//!
//! [MeshAllocator] is the entry point for mesh uploads. It hands out blocks from existing arenas
//! when possible and only creates a new arena (one backing buffer of `new_buffer_size` bytes) when
//! none of them can take the request, even after compaction.

use log::{error, info, trace};
use parking_lot::Mutex;

use super::arena::{Arena, ArenaId, ArenaStats, MeshAllocation, Relocation};
use super::backing::{BackingAllocator, BackingBuffer};
use super::barrier::{upload_barrier, CommandRecorder, QueueFamilies, UploadPhase};
use super::MeshMemoryError;
use crate::config::MeshMemoryConfig;

/// Shorthand for the resource type of an allocator's buffers.
pub type ResourceOf<A> = <<A as BackingAllocator>::Buffer as BackingBuffer>::Resource;

/// Where an allocation's bytes currently live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackingRange<R> {
    pub arena: ArenaId,
    pub resource: R,
    pub offset: u64,
    pub size: u64,
}

struct PoolInner<A: BackingAllocator> {
    arenas: Vec<Arena<A::Buffer>>,
    backing_allocator: A,
    next_arena_id: u32,
    relocations: Vec<Relocation>,
}

impl<A: BackingAllocator> PoolInner<A> {
    fn create_arena(&mut self, size: u64) -> Result<usize, MeshMemoryError> {
        let id = ArenaId(self.next_arena_id);
        let buffer = self.backing_allocator.create_buffer(id, size).map_err(|e| {
            error!("Could not create backing buffer of {} bytes for {}: {}", size, id, e);
            MeshMemoryError::BackingCreation(e)
        })?;
        self.next_arena_id += 1;
        self.arenas.push(Arena::new(id, buffer));
        info!("Created mesh memory {} with {} bytes ({} arenas total)", id, size, self.arenas.len());
        Ok(self.arenas.len() - 1)
    }

    fn arena_mut(&mut self, id: ArenaId) -> Result<&mut Arena<A::Buffer>, MeshMemoryError> {
        match self.arenas.get_mut(id.0 as usize) {
            Some(arena) if arena.id() == id => Ok(arena),
            _ => Err(MeshMemoryError::UnknownArena(id)),
        }
    }

    fn arena(&self, id: ArenaId) -> Result<&Arena<A::Buffer>, MeshMemoryError> {
        match self.arenas.get(id.0 as usize) {
            Some(arena) if arena.id() == id => Ok(arena),
            _ => Err(MeshMemoryError::UnknownArena(id)),
        }
    }

    fn reserved(&self) -> u64 {
        self.arenas.iter().map(|arena| arena.capacity()).sum()
    }

    fn collect_relocations(&mut self, arena: usize) {
        let moved = self.arenas[arena].take_relocations();
        self.relocations.extend(moved);
    }
}

/// Compacting sub-allocator for mesh data, spread over any number of fixed-size arenas.
///
/// All allocation and freeing is serialized behind one lock, which also covers arena creation.
/// Allocations are weak handles ([MeshAllocation]); freeing one twice, or freeing one from another
/// pool, is reported as an error instead of corrupting the pool.
///
/// Whenever allocations were made or freed in a frame, record
/// [emit_pre_mutation_barriers](MeshAllocator::emit_pre_mutation_barriers) before the frame's copy
/// commands and [emit_post_mutation_barriers](MeshAllocator::emit_post_mutation_barriers) after
/// them. Blocks moved by compaction are reported by
/// [take_relocations](MeshAllocator::take_relocations).
pub struct MeshAllocator<A: BackingAllocator> {
    inner: Mutex<PoolInner<A>>,
    new_buffer_size: u64,
    max_total_allocation: Option<u64>,
    allow_oversized_arenas: bool,
    granularity: u64,
    queues: QueueFamilies,
}

impl<A: BackingAllocator> MeshAllocator<A> {
    /// Creates the pool and its first arena.
    pub fn new(config: &MeshMemoryConfig, backing_allocator: A) -> Result<Self, MeshMemoryError> {
        let granularity = backing_allocator.size_granularity().max(1);
        config.validate(granularity)?;

        let mut inner = PoolInner {
            arenas: Vec::new(),
            backing_allocator,
            next_arena_id: 0,
            relocations: Vec::new(),
        };
        inner.create_arena(config.new_buffer_size)?;

        Ok(MeshAllocator {
            inner: Mutex::new(inner),
            new_buffer_size: config.new_buffer_size,
            max_total_allocation: config.max_total_allocation,
            allow_oversized_arenas: config.allow_oversized_arenas,
            granularity,
            queues: QueueFamilies {
                graphics: config.graphics_queue_family,
                copy: config.copy_queue_family,
            },
        })
    }

    /// Allocates `size` bytes of mesh memory.
    ///
    /// Existing arenas are tried in creation order (each compacting itself once if that would make
    /// room). If none can take the request, a new arena is created and the request is served from
    /// it. Requests are rounded up to the backing's size granularity.
    pub fn allocate(&self, size: u64) -> Result<MeshAllocation, MeshMemoryError> {
        if size == 0 {
            error!("Tried to allocate zero bytes of mesh memory");
            return Err(MeshMemoryError::ZeroSizedAllocation);
        }
        let size = round_up(size, self.granularity).ok_or(MeshMemoryError::AllocationTooLarge {
            requested: size,
            arena_capacity: self.new_buffer_size,
        })?;

        let oversized = size > self.new_buffer_size;
        if oversized && !self.allow_oversized_arenas {
            return Err(MeshMemoryError::AllocationTooLarge {
                requested: size,
                arena_capacity: self.new_buffer_size,
            });
        }

        let mut inner = self.inner.lock();

        // First try to allocate from an existing arena
        for index in 0..inner.arenas.len() {
            let allocation = inner.arenas[index].allocate(size);
            inner.collect_relocations(index);
            if let Some(allocation) = allocation {
                return Ok(allocation);
            }
        }

        let arena_size = if oversized { size } else { self.new_buffer_size };
        if let Some(max_total_allocation) = self.max_total_allocation {
            let over_ceiling = inner.reserved().checked_add(arena_size).map_or(true, |total| total > max_total_allocation);
            if over_ceiling {
                return Err(MeshMemoryError::PoolExhausted {
                    requested: size,
                    max_total_allocation,
                });
            }
        }

        let index = inner.create_arena(arena_size)?;
        let allocation = inner.arenas[index].allocate(size).ok_or(MeshMemoryError::AllocationTooLarge {
            requested: size,
            arena_capacity: arena_size,
        })?;
        trace!("Served {} byte request from new {}", size, allocation.arena);
        Ok(allocation)
    }

    /// Returns an allocation to its arena.
    pub fn free(&self, allocation: &MeshAllocation) -> Result<(), MeshMemoryError> {
        let mut inner = self.inner.lock();
        inner.arena_mut(allocation.arena)?.free(allocation)
    }

    /// Resolves a handle to its arena's resource and the block's current offset.
    pub fn get_backing_storage(&self, allocation: &MeshAllocation) -> Result<BackingRange<ResourceOf<A>>, MeshMemoryError> {
        let inner = self.inner.lock();
        let arena = inner.arena(allocation.arena)?;
        let block = arena.resolve(allocation)?;
        Ok(BackingRange {
            arena: arena.id(),
            resource: arena.backing().resource(),
            offset: block.offset,
            size: block.size,
        })
    }

    /// Records the barrier that makes uploads wait for earlier reads of every arena.
    pub fn emit_pre_mutation_barriers<C: CommandRecorder<ResourceOf<A>>>(&self, recorder: &mut C) {
        self.emit_barriers(UploadPhase::BeforeUpload, recorder);
    }

    /// Records the barrier that makes later reads of every arena wait for uploads.
    pub fn emit_post_mutation_barriers<C: CommandRecorder<ResourceOf<A>>>(&self, recorder: &mut C) {
        self.emit_barriers(UploadPhase::AfterUpload, recorder);
    }

    fn emit_barriers<C: CommandRecorder<ResourceOf<A>>>(&self, phase: UploadPhase, recorder: &mut C) {
        let inner = self.inner.lock();
        let buffers = inner.arenas.iter().map(|arena| (arena.backing().resource(), arena.capacity()));
        if let Some(barrier) = upload_barrier(phase, self.queues, buffers) {
            recorder.pipeline_barrier(barrier);
        }
    }

    /// Blocks moved by compaction since the last call, in the order they were moved.
    pub fn take_relocations(&self) -> Vec<Relocation> {
        std::mem::take(&mut self.inner.lock().relocations)
    }

    /// Runs `f` on the backing buffer of one arena, e.g. to upload into it.
    pub fn with_backing_mut<R>(&self, arena: ArenaId, f: impl FnOnce(&mut A::Buffer) -> R) -> Result<R, MeshMemoryError> {
        let mut inner = self.inner.lock();
        Ok(f(inner.arena_mut(arena)?.backing_mut()))
    }

    /// Runs `f` on every arena's backing buffer in creation order.
    pub fn for_each_backing_mut(&self, mut f: impl FnMut(ArenaId, &mut A::Buffer)) {
        let mut inner = self.inner.lock();
        for arena in inner.arenas.iter_mut() {
            f(arena.id(), arena.backing_mut());
        }
    }

    pub fn arena_count(&self) -> usize {
        self.inner.lock().arenas.len()
    }

    pub fn arena_stats(&self) -> Vec<ArenaStats> {
        self.inner.lock().arenas.iter().map(|arena| arena.stats()).collect()
    }

    /// Sum of all arena capacities.
    pub fn bytes_reserved(&self) -> u64 {
        self.inner.lock().reserved()
    }

    /// Bytes currently handed out to callers.
    pub fn bytes_used(&self) -> u64 {
        self.inner.lock().arenas.iter().map(|arena| arena.allocated()).sum()
    }

    /// Free bytes across all arenas, contiguous or not.
    pub fn bytes_available(&self) -> u64 {
        self.inner.lock().arenas.iter().map(|arena| arena.free_space()).sum()
    }

    pub fn new_buffer_size(&self) -> u64 {
        self.new_buffer_size
    }

    /// Checks every arena's invariants.
    pub fn check_invariants(&self) -> Result<(), String> {
        let inner = self.inner.lock();
        for arena in inner.arenas.iter() {
            arena.check_invariants()?;
        }
        Ok(())
    }
}

/// `None` if the rounded size doesn't fit in a `u64`.
fn round_up(size: u64, granularity: u64) -> Option<u64> {
    match size % granularity {
        0 => Some(size),
        remainder => size.checked_add(granularity - remainder),
    }
}

// Tests ///////////////////////////////////////////////////////////////////////////////////////////
