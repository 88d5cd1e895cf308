//! Arenas backed by wgpu buffers.
//!
//! wgpu doesn't allow copying between overlapping ranges of one buffer, and compaction moves are
//! exactly that. So [WgpuBuffer::move_region] only queues a move, and
//! [WgpuBuffer::record_pending_moves] later replays the queue through a scratch buffer: each move
//! becomes a copy into the scratch buffer followed by a copy back to the destination. Copies
//! recorded into one encoder execute in order, so the scratch buffer can be reused for every move.
//!
//! wgpu tracks buffer hazards itself, so there is nothing to translate the upload barriers into.

use std::sync::Arc;

use log::{error, trace};

use super::arena::ArenaId;
use super::backing::{BackingAllocator, BackingBuffer, BackingError};

/// Usage every arena buffer is created with.
pub const ARENA_BUFFER_USAGES: wgpu::BufferUsages = wgpu::BufferUsages::VERTEX
    .union(wgpu::BufferUsages::INDEX)
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct PendingMove {
    src_offset: u64,
    dst_offset: u64,
    len: u64,
}

pub struct WgpuBuffer {
    arena: ArenaId,
    device: Arc<wgpu::Device>,
    buffer: Arc<wgpu::Buffer>,
    size: u64,
    pending_moves: Vec<PendingMove>,
    scratch: Option<wgpu::Buffer>,
}

impl WgpuBuffer {
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    /// Whether compaction moved data that hasn't been recorded yet.
    pub fn has_pending_moves(&self) -> bool {
        !self.pending_moves.is_empty()
    }

    /// Records every queued compaction move into `encoder`, oldest first. Must be recorded before
    /// any upload to the moved ranges, and submitted before the next draw that reads this arena.
    ///
    /// `Queue::write_buffer` uploads run at the start of the next `submit`, ahead of that submit's
    /// command buffers. Submit the encoder holding these moves in an earlier `submit` than any
    /// `write_buffer` into this arena, or a new allocation placed over a block's old location can
    /// be overwritten before the block is copied out of it.
    pub fn record_pending_moves(&mut self, encoder: &mut wgpu::CommandEncoder) {
        if self.pending_moves.is_empty() {
            return;
        }
        let largest = self.pending_moves.iter().map(|pending| pending.len).max().unwrap_or(0);
        let scratch_too_small = self.scratch.as_ref().map(|scratch| scratch.size() < largest).unwrap_or(true);
        if scratch_too_small {
            self.scratch = Some(self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&format!("mesh {} compaction scratch", self.arena)),
                size: largest,
                usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }));
        }
        let Some(scratch) = self.scratch.as_ref() else {
            return;
        };

        for pending in self.pending_moves.drain(..) {
            encoder.copy_buffer_to_buffer(&self.buffer, pending.src_offset, scratch, 0, pending.len);
            encoder.copy_buffer_to_buffer(scratch, 0, &self.buffer, pending.dst_offset, pending.len);
        }
        trace!("Recorded compaction copies for {}", self.arena);
    }
}

impl BackingBuffer for WgpuBuffer {
    type Resource = Arc<wgpu::Buffer>;

    fn size(&self) -> u64 {
        self.size
    }

    fn resource(&self) -> Arc<wgpu::Buffer> {
        self.buffer.clone()
    }

    fn move_region(&mut self, src_offset: u64, dst_offset: u64, len: u64) {
        self.pending_moves.push(PendingMove { src_offset, dst_offset, len });
    }
}

/// Creates one wgpu buffer per arena.
pub struct WgpuBackingAllocator {
    device: Arc<wgpu::Device>,
}

impl WgpuBackingAllocator {
    pub fn new(device: Arc<wgpu::Device>) -> Self {
        WgpuBackingAllocator { device }
    }
}

impl BackingAllocator for WgpuBackingAllocator {
    type Buffer = WgpuBuffer;

    fn create_buffer(&mut self, arena: ArenaId, size: u64) -> Result<WgpuBuffer, BackingError> {
        let max_buffer_size = self.device.limits().max_buffer_size;
        if size > max_buffer_size {
            return Err(BackingError::Device(format!(
                "{} bytes is over the device's maximum buffer size of {} bytes",
                size, max_buffer_size
            )));
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("mesh {}", arena)),
            size,
            usage: ARENA_BUFFER_USAGES,
            mapped_at_creation: false,
        });
        let out_of_memory = futures::executor::block_on(self.device.pop_error_scope());
        let invalid = futures::executor::block_on(self.device.pop_error_scope());
        if let Some(e) = out_of_memory.or(invalid) {
            error!("wgpu could not create {} byte buffer for {}: {}", size, arena, e);
            buffer.destroy();
            return Err(BackingError::Device(e.to_string()));
        }

        Ok(WgpuBuffer {
            arena,
            device: self.device.clone(),
            buffer: Arc::new(buffer),
            size,
            pending_moves: Vec::new(),
            scratch: None,
        })
    }

    fn size_granularity(&self) -> u64 {
        wgpu::COPY_BUFFER_ALIGNMENT
    }
}

// Tests ///////////////////////////////////////////////////////////////////////////////////////////
