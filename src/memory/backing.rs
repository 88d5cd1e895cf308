//! Backing storage for arenas.
//!
//! An arena only does bookkeeping; the bytes themselves live in a [BackingBuffer] handed out by a
//! [BackingAllocator]. [HostBackingAllocator] keeps everything in CPU memory and moves bytes as
//! soon as compaction asks it to. The wgpu implementation lives in
//! [wgpu_backing](super::wgpu_backing) behind the `wgpu-backing` feature.

use std::fmt::Debug;

use log::trace;

use super::arena::ArenaId;

#[derive(thiserror::Error, Debug)]
pub enum BackingError {
    #[error("Out of backing memory: tried to reserve {requested} bytes with only {remaining} bytes left in the budget")]
    OutOfMemory { requested: u64, remaining: u64 },
    #[error("Access of {len} bytes at offset {offset} is outside a backing buffer of {size} bytes")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
    #[error("Could not reserve {requested} bytes of host memory")]
    CouldntReserveHostMemory { requested: u64 },
    #[error("Graphics device refused to create a backing buffer: {0}")]
    Device(String),
}

/// One fixed-size allocation of memory that an arena rations out.
pub trait BackingBuffer: Send {
    /// Cheap handle the caller binds or copies against, e.g. a GPU buffer.
    type Resource: Clone + Debug;

    /// Size in bytes. Never changes after creation.
    fn size(&self) -> u64;

    fn resource(&self) -> Self::Resource;

    /// Moves `len` bytes from `src_offset` to `dst_offset`. Compaction only ever moves data toward
    /// the front of the buffer, in increasing offset order, and the ranges may overlap.
    fn move_region(&mut self, src_offset: u64, dst_offset: u64, len: u64);
}

/// Creates backing buffers for new arenas.
pub trait BackingAllocator: Send {
    type Buffer: BackingBuffer;

    fn create_buffer(&mut self, arena: ArenaId, size: u64) -> Result<Self::Buffer, BackingError>;

    /// Allocation sizes get rounded up to a multiple of this many bytes.
    fn size_granularity(&self) -> u64 {
        1
    }
}

/// Handle to a [HostBuffer]. Identifies the arena the bytes belong to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostBufferHandle(pub ArenaId);

/// Backing buffer living in ordinary CPU memory.
#[derive(Debug)]
pub struct HostBuffer {
    arena: ArenaId,
    bytes: Vec<u8>,
}

impl HostBuffer {
    /// Zero-filled buffer of `size` bytes. Fails instead of aborting when the memory can't be had.
    pub fn new(arena: ArenaId, size: u64) -> Result<Self, BackingError> {
        let len = usize::try_from(size).map_err(|_| BackingError::CouldntReserveHostMemory { requested: size })?;
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| BackingError::CouldntReserveHostMemory { requested: size })?;
        bytes.resize(len, 0);
        Ok(HostBuffer { arena, bytes })
    }

    /// Copies `data` into the buffer at `offset`.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), BackingError> {
        let range = self.checked_range(offset, data.len() as u64)?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, offset: u64, len: u64) -> Result<&[u8], BackingError> {
        let range = self.checked_range(offset, len)?;
        Ok(&self.bytes[range])
    }

    fn checked_range(&self, offset: u64, len: u64) -> Result<std::ops::Range<usize>, BackingError> {
        let size = self.bytes.len() as u64;
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(offset as usize..end as usize),
            _ => Err(BackingError::OutOfBounds { offset, len, size }),
        }
    }
}

impl BackingBuffer for HostBuffer {
    type Resource = HostBufferHandle;

    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn resource(&self) -> HostBufferHandle {
        HostBufferHandle(self.arena)
    }

    fn move_region(&mut self, src_offset: u64, dst_offset: u64, len: u64) {
        let src = src_offset as usize;
        self.bytes.copy_within(src..src + len as usize, dst_offset as usize);
    }
}

/// Hands out [HostBuffer]s, optionally within a fixed byte budget so that running out of device
/// memory can be reproduced without a device.
#[derive(Debug, Default)]
pub struct HostBackingAllocator {
    budget: Option<u64>,
    reserved: u64,
}

impl HostBackingAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budget(budget: u64) -> Self {
        HostBackingAllocator {
            budget: Some(budget),
            reserved: 0,
        }
    }

    /// Bytes handed out so far.
    pub fn reserved(&self) -> u64 {
        self.reserved
    }
}

impl BackingAllocator for HostBackingAllocator {
    type Buffer = HostBuffer;

    fn create_buffer(&mut self, arena: ArenaId, size: u64) -> Result<HostBuffer, BackingError> {
        if let Some(budget) = self.budget {
            let remaining = budget.saturating_sub(self.reserved);
            if size > remaining {
                return Err(BackingError::OutOfMemory { requested: size, remaining });
            }
        }
        let buffer = HostBuffer::new(arena, size)?;
        self.reserved += size;
        trace!("Reserved {} bytes of host memory for {}", size, arena);
        Ok(buffer)
    }
}

// Tests ///////////////////////////////////////////////////////////////////////////////////////////
