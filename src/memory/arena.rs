//! A single arena: one backing buffer plus the [BlockList] that carves it up.

use std::fmt;

use log::{debug, error, trace};

use super::backing::BackingBuffer;
use super::block::{Block, BlockId, BlockList};
use super::MeshMemoryError;

/// Identifies an arena within its pool. Assigned by the pool in creation order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaId(pub u32);

impl fmt::Display for ArenaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arena#{}", self.0)
    }
}

/// Weak reference to an allocation, handed out by [MeshAllocator::allocate](super::MeshAllocator::allocate).
///
/// Holding one does not keep the allocation alive. `offset` is where the block was placed when it
/// was allocated; compaction may move it later, so resolve the handle through
/// [MeshAllocator::get_backing_storage](super::MeshAllocator::get_backing_storage) before
/// recording copies or draws.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MeshAllocation {
    pub arena: ArenaId,
    pub block_id: BlockId,
    pub offset: u64,
    pub size: u64,
}

/// A used block that compaction moved toward the front of its arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Relocation {
    pub arena: ArenaId,
    pub block_id: BlockId,
    pub old_offset: u64,
    pub new_offset: u64,
    pub size: u64,
}

/// Snapshot of an arena's occupancy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ArenaStats {
    pub id: ArenaId,
    pub capacity: u64,
    pub allocated: u64,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub largest_free_block: u64,
}

#[derive(Debug)]
pub struct Arena<B: BackingBuffer> {
    id: ArenaId,
    capacity: u64,
    /// Sum of the sizes of all used blocks.
    allocated: u64,
    blocks: BlockList,
    backing: B,
    relocations: Vec<Relocation>,
}

impl<B: BackingBuffer> Arena<B> {
    /// Wraps a freshly created backing buffer. The whole buffer starts out as one free block.
    pub fn new(id: ArenaId, backing: B) -> Self {
        let capacity = backing.size();
        Arena {
            id,
            capacity,
            allocated: 0,
            blocks: BlockList::new(capacity),
            backing,
            relocations: Vec::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> ArenaId {
        self.id
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[inline]
    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    /// Total free bytes, whether or not they are contiguous.
    #[inline]
    pub fn free_space(&self) -> u64 {
        self.capacity - self.allocated
    }

    pub fn blocks(&self) -> &BlockList {
        &self.blocks
    }

    pub fn backing(&self) -> &B {
        &self.backing
    }

    pub fn backing_mut(&mut self) -> &mut B {
        &mut self.backing
    }

    /// Allocates `needed_size` bytes with a first-fit search.
    ///
    /// If no single free block is big enough but the arena has enough free space in total, the
    /// arena is compacted once and the search retried once. Returns `None` (with no side effects
    /// on the block list) when the arena's total free space is too small.
    pub fn allocate(&mut self, needed_size: u64) -> Option<MeshAllocation> {
        debug_assert!(needed_size > 0, "zero-sized allocations are rejected by the pool");
        if needed_size == 0 {
            return None;
        }
        self.allocate_internal(needed_size, true)
    }

    fn allocate_internal(&mut self, needed_size: u64, can_compact: bool) -> Option<MeshAllocation> {
        if needed_size > self.free_space() {
            return None;
        }

        let index = match self.blocks.first_fit(needed_size) {
            Some(index) => index,
            None if can_compact => {
                self.compact();
                return self.allocate_internal(needed_size, false);
            }
            None => return None,
        };

        let block = self.blocks.take(index, needed_size);
        let allocation = MeshAllocation {
            arena: self.id,
            block_id: block.id,
            offset: block.offset,
            size: block.size,
        };
        self.allocated += needed_size;
        self.debug_check();

        trace!("Allocated {} bytes at offset {} in {} as {}", needed_size, allocation.offset, self.id, allocation.block_id);
        Some(allocation)
    }

    /// Returns the block named by `allocation` to the free pool, merging it with free neighbours.
    ///
    /// Handles that don't name a live used block in this arena are rejected without touching any
    /// state.
    pub fn free(&mut self, allocation: &MeshAllocation) -> Result<(), MeshMemoryError> {
        let index = self.used_block_index(allocation)?;
        let size = self.blocks.get(index).map(|block| block.size).unwrap_or(0);

        self.blocks.release(index);
        self.allocated -= size;
        self.debug_check();

        trace!("Freed {} bytes from {} ({})", size, self.id, allocation.block_id);
        Ok(())
    }

    /// Current state of the used block named by `allocation`.
    pub fn resolve(&self, allocation: &MeshAllocation) -> Result<&Block, MeshMemoryError> {
        let index = self.used_block_index(allocation)?;
        self.blocks.get(index).ok_or(MeshMemoryError::UnknownBlock {
            arena: self.id,
            block: allocation.block_id,
        })
    }

    /// Slides every used block toward offset zero so that all free space ends up in one trailing
    /// free block. Moves are applied to the backing buffer in increasing offset order and logged
    /// as [Relocation]s.
    ///
    /// Does nothing when the only free space (if any) is already at the end of the arena.
    pub fn compact(&mut self) {
        let free_nodes = self.blocks.iter().filter(|block| block.free).count();
        let tail_is_free = self.blocks.iter().last().map(|block| block.free).unwrap_or(false);
        if free_nodes == 0 || (free_nodes == 1 && tail_is_free) {
            return;
        }

        let mut amount_compacted = 0;
        let mut bytes_moved = 0;
        for index in self.blocks.indices() {
            let Some(block) = self.blocks.get_mut(index) else {
                continue;
            };
            if block.free {
                // Contents of free blocks are don't-care, nothing to move.
                amount_compacted += block.size;
                continue;
            }
            if amount_compacted == 0 {
                continue;
            }

            let old_offset = block.offset;
            block.offset -= amount_compacted;
            let relocation = Relocation {
                arena: self.id,
                block_id: block.id,
                old_offset,
                new_offset: block.offset,
                size: block.size,
            };
            self.backing.move_region(relocation.old_offset, relocation.new_offset, relocation.size);
            bytes_moved += relocation.size;
            self.relocations.push(relocation);
        }

        self.blocks.collapse_free_to_tail(amount_compacted);
        self.debug_check();

        debug!(
            "Compacted {}: moved {} bytes, {} free bytes now contiguous, {} blocks remain",
            self.id,
            bytes_moved,
            amount_compacted,
            self.blocks.len()
        );
    }

    /// Relocations recorded since the last call.
    pub fn take_relocations(&mut self) -> Vec<Relocation> {
        std::mem::take(&mut self.relocations)
    }

    pub fn stats(&self) -> ArenaStats {
        let mut stats = ArenaStats {
            id: self.id,
            capacity: self.capacity,
            allocated: self.allocated,
            used_blocks: 0,
            free_blocks: 0,
            largest_free_block: 0,
        };
        for block in self.blocks.iter() {
            if block.free {
                stats.free_blocks += 1;
                stats.largest_free_block = stats.largest_free_block.max(block.size);
            } else {
                stats.used_blocks += 1;
            }
        }
        stats
    }

    /// Checks the block list invariants and that `allocated` matches the used blocks.
    pub fn check_invariants(&self) -> Result<(), String> {
        self.blocks.check_invariants()?;
        let used: u64 = self.blocks.iter().filter(|block| !block.free).map(|block| block.size).sum();
        if used != self.allocated {
            return Err(format!("{} records {} bytes allocated but its used blocks hold {}", self.id, self.allocated, used));
        }
        Ok(())
    }

    fn used_block_index(&self, allocation: &MeshAllocation) -> Result<usize, MeshMemoryError> {
        if allocation.arena != self.id {
            error!("Handle for {} was given to {}", allocation.arena, self.id);
            return Err(MeshMemoryError::UnknownArena(allocation.arena));
        }
        let Some(index) = self.blocks.find(allocation.block_id) else {
            error!("{} has no block {}, the handle is stale", self.id, allocation.block_id);
            return Err(MeshMemoryError::UnknownBlock {
                arena: self.id,
                block: allocation.block_id,
            });
        };
        match self.blocks.get(index) {
            Some(block) if !block.free => Ok(index),
            _ => {
                error!("{} in {} is already free", allocation.block_id, self.id);
                Err(MeshMemoryError::DoubleFree {
                    arena: self.id,
                    block: allocation.block_id,
                })
            }
        }
    }

    #[inline]
    fn debug_check(&self) {
        if cfg!(debug_assertions) {
            if let Err(problem) = self.check_invariants() {
                panic!("arena invariant broken: {}", problem);
            }
        }
    }
}

// Tests ///////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::backing::{BackingAllocator, HostBackingAllocator, HostBuffer};

    fn host_arena(size: u64) -> Arena<HostBuffer> {
        let buffer = HostBackingAllocator::new().create_buffer(ArenaId(0), size).unwrap();
        Arena::new(ArenaId(0), buffer)
    }

    fn layout(arena: &Arena<HostBuffer>) -> Vec<(u64, u64, bool)> {
        arena.blocks().iter().map(|b| (b.offset, b.size, b.free)).collect()
    }

    fn fill(arena: &mut Arena<HostBuffer>, allocation: &MeshAllocation, value: u8) {
        let data = vec![value; allocation.size as usize];
        arena.backing_mut().write(allocation.offset, &data).unwrap();
    }

    #[test]
    fn three_allocations_leave_trailing_free_block() {
        let mut arena = host_arena(1000);
        let a = arena.allocate(100).unwrap();
        let b = arena.allocate(200).unwrap();
        let c = arena.allocate(300).unwrap();
        assert_eq!((a.offset, b.offset, c.offset), (0, 100, 300));
        assert_eq!(layout(&arena), vec![(0, 100, false), (100, 200, false), (300, 300, false), (600, 400, true)]);
        assert_eq!(arena.allocated(), 600);
    }

    #[test]
    fn freeing_middle_block_leaves_a_hole() {
        let mut arena = host_arena(1000);
        arena.allocate(100).unwrap();
        let b = arena.allocate(200).unwrap();
        arena.allocate(300).unwrap();
        arena.free(&b).unwrap();
        assert_eq!(layout(&arena), vec![(0, 100, false), (100, 200, true), (300, 300, false), (600, 400, true)]);
        assert_eq!(arena.allocated(), 400);
        assert_eq!(arena.stats().largest_free_block, 400);
    }

    #[test]
    fn fragmented_request_compacts_once_and_succeeds() {
        let mut arena = host_arena(1000);
        let a = arena.allocate(100).unwrap();
        let b = arena.allocate(200).unwrap();
        let c = arena.allocate(300).unwrap();
        fill(&mut arena, &a, 0xAA);
        fill(&mut arena, &c, 0xCC);
        arena.free(&b).unwrap();

        let d = arena.allocate(500).unwrap();
        assert_eq!((d.offset, d.size), (400, 500));
        assert_eq!(layout(&arena), vec![(0, 100, false), (100, 300, false), (400, 500, false), (900, 100, true)]);

        // A stays put, C slid down by 200 and kept its contents.
        let relocations = arena.take_relocations();
        assert_eq!(relocations.len(), 1);
        assert_eq!(relocations[0].block_id, c.block_id);
        assert_eq!((relocations[0].old_offset, relocations[0].new_offset), (300, 100));
        assert_eq!(arena.resolve(&c).unwrap().offset, 100);
        assert!(arena.backing().read(0, 100).unwrap().iter().all(|&byte| byte == 0xAA));
        assert!(arena.backing().read(100, 300).unwrap().iter().all(|&byte| byte == 0xCC));
        assert!(arena.take_relocations().is_empty());
    }

    #[test]
    fn freeing_everything_restores_single_block() {
        let mut arena = host_arena(1000);
        let a = arena.allocate(100).unwrap();
        let b = arena.allocate(200).unwrap();
        let c = arena.allocate(300).unwrap();
        arena.free(&b).unwrap();
        let d = arena.allocate(500).unwrap();
        arena.free(&a).unwrap();
        arena.free(&c).unwrap();
        arena.free(&d).unwrap();
        assert_eq!(layout(&arena), vec![(0, 1000, true)]);
        assert_eq!(arena.allocated(), 0);
    }

    #[test]
    fn whole_arena_allocation() {
        let mut arena = host_arena(1000);
        let a = arena.allocate(1000).unwrap();
        assert_eq!((a.offset, a.size), (0, 1000));
        assert_eq!(arena.allocated(), 1000);
        assert_eq!(arena.stats().free_blocks, 0);
        assert_eq!(arena.allocate(1), None);
    }

    #[test]
    fn too_large_request_fails_without_side_effects() {
        let mut arena = host_arena(1000);
        arena.allocate(600).unwrap();
        let before = layout(&arena);
        assert_eq!(arena.allocate(401), None);
        assert_eq!(layout(&arena), before);
        assert_eq!(arena.allocate(1001), None);
        assert_eq!(layout(&arena), before);
        assert!(arena.take_relocations().is_empty());
    }

    #[test]
    fn exact_fragmented_fit_needs_one_compaction() {
        let mut arena = host_arena(100);
        let a = arena.allocate(25).unwrap();
        arena.allocate(25).unwrap();
        let c = arena.allocate(25).unwrap();
        arena.allocate(25).unwrap();
        arena.free(&a).unwrap();
        arena.free(&c).unwrap();
        // 50 bytes free in two 25-byte holes.
        let e = arena.allocate(50).unwrap();
        assert_eq!((e.offset, e.size), (50, 50));
        assert_eq!(arena.allocated(), 100);
        assert_eq!(arena.take_relocations().len(), 2);
    }

    #[test]
    fn allocate_then_free_round_trips_layout() {
        let mut arena = host_arena(1000);
        arena.allocate(100).unwrap();
        let b = arena.allocate(200).unwrap();
        arena.allocate(300).unwrap();
        arena.free(&b).unwrap();
        let before = layout(&arena);
        let count = arena.blocks().len();

        let x = arena.allocate(50).unwrap();
        arena.free(&x).unwrap();
        assert_eq!(layout(&arena), before);
        assert_eq!(arena.blocks().len(), count);
    }

    #[test]
    fn compaction_without_holes_is_noop() {
        let mut arena = host_arena(100);
        arena.allocate(40).unwrap();
        arena.allocate(40).unwrap();
        let before: Vec<Block> = arena.blocks().iter().cloned().collect();
        arena.compact();
        let after: Vec<Block> = arena.blocks().iter().cloned().collect();
        assert_eq!(before, after);
        assert!(arena.take_relocations().is_empty());

        let mut full = host_arena(10);
        full.allocate(10).unwrap();
        full.compact();
        assert_eq!(layout(&full), vec![(0, 10, false)]);
    }

    #[test]
    fn compaction_removes_leading_free_block() {
        let mut arena = host_arena(100);
        let a = arena.allocate(30).unwrap();
        let b = arena.allocate(30).unwrap();
        arena.free(&a).unwrap();
        arena.compact();
        assert_eq!(layout(&arena), vec![(0, 30, false), (30, 70, true)]);
        assert_eq!(arena.resolve(&b).unwrap().offset, 0);
        arena.check_invariants().unwrap();
    }

    #[test]
    fn stale_handles_are_rejected() {
        let mut arena = host_arena(100);
        let a = arena.allocate(10).unwrap();
        let b = arena.allocate(10).unwrap();
        arena.free(&a).unwrap();
        let before = layout(&arena);

        assert!(matches!(arena.free(&a), Err(MeshMemoryError::DoubleFree { .. }) | Err(MeshMemoryError::UnknownBlock { .. })));
        assert_eq!(layout(&arena), before);

        // A new allocation over the same bytes gets a new id, so the old handle stays stale.
        let c = arena.allocate(10).unwrap();
        assert_eq!(c.offset, a.offset);
        assert_ne!(c.block_id, a.block_id);
        assert!(arena.resolve(&a).is_err());

        let foreign = MeshAllocation { arena: ArenaId(7), ..b };
        assert!(matches!(arena.free(&foreign), Err(MeshMemoryError::UnknownArena(ArenaId(7)))));
        arena.free(&b).unwrap();
        assert!(matches!(arena.free(&b), Err(MeshMemoryError::DoubleFree { .. })));
    }

    #[test]
    fn invariants_hold_through_churn() {
        let mut arena = host_arena(4096);
        let mut live = Vec::new();
        for round in 0..200u64 {
            let size = (round * 37) % 300 + 1;
            if let Some(allocation) = arena.allocate(size) {
                live.push(allocation);
            }
            if round % 3 == 0 && !live.is_empty() {
                let victim = live.remove((round as usize * 7) % live.len());
                arena.free(&victim).unwrap();
            }
            arena.check_invariants().unwrap();
            let stats = arena.stats();
            assert_eq!(stats.used_blocks, live.len());
        }
        for allocation in live.drain(..) {
            arena.free(&allocation).unwrap();
        }
        assert_eq!(layout(&arena), vec![(0, 4096, true)]);
    }
}
