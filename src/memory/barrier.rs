//! Pipeline barriers around arena uploads.
//!
//! Arenas are read by draw calls on the graphics queue and written by uploads (and compaction
//! moves) on the copy queue. Before any write the caller records [UploadPhase::BeforeUpload]
//! barriers so the write waits for earlier vertex/index reads; after the write it records
//! [UploadPhase::AfterUpload] barriers so later reads wait for the write. The barriers are plain
//! descriptors handed to a [CommandRecorder]; translating them into API calls is the recorder's
//! business.

use bitflags::bitflags;

bitflags! {
    /// Pipeline stages a barrier waits on or blocks.
    pub struct PipelineStages: u32 {
        const VERTEX_INPUT = 0b0001;
        const TRANSFER     = 0b0010;
    }
}

bitflags! {
    /// Memory accesses made visible or waited on by a barrier.
    pub struct AccessFlags: u32 {
        const VERTEX_ATTRIBUTE_READ = 0b0001;
        const INDEX_READ            = 0b0010;
        const TRANSFER_WRITE        = 0b0100;
    }
}

impl AccessFlags {
    /// Everything a draw call does with mesh memory.
    pub const MESH_READ: AccessFlags =
        AccessFlags::from_bits_truncate(AccessFlags::VERTEX_ATTRIBUTE_READ.bits() | AccessFlags::INDEX_READ.bits());
}

/// Queue families that share arena memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    /// Family of the queue that draws from the arenas.
    pub graphics: u32,
    /// Family of the queue that uploads into and compacts the arenas.
    pub copy: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UploadPhase {
    BeforeUpload,
    AfterUpload,
}

/// Barrier on one range of one buffer, including a queue family ownership transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferBarrier<R> {
    pub buffer: R,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
    pub offset: u64,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineBarrier<R> {
    pub src_stages: PipelineStages,
    pub dst_stages: PipelineStages,
    /// Dependencies are framebuffer-local ("by region").
    pub by_region: bool,
    pub buffer_barriers: Vec<BufferBarrier<R>>,
}

/// Anything that can have pipeline barriers recorded into it, such as a command buffer.
pub trait CommandRecorder<R> {
    fn pipeline_barrier(&mut self, barrier: PipelineBarrier<R>);
}

/// Recorder that just keeps every barrier it is given.
#[derive(Clone, Debug)]
pub struct BarrierLog<R> {
    pub barriers: Vec<PipelineBarrier<R>>,
}

impl<R> Default for BarrierLog<R> {
    fn default() -> Self {
        BarrierLog { barriers: Vec::new() }
    }
}

impl<R> BarrierLog<R> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<R> CommandRecorder<R> for BarrierLog<R> {
    fn pipeline_barrier(&mut self, barrier: PipelineBarrier<R>) {
        self.barriers.push(barrier);
    }
}

/// Builds the barrier for `phase` covering every `(buffer, size)` given, or `None` if there are no
/// buffers.
pub fn upload_barrier<R>(phase: UploadPhase, queues: QueueFamilies, buffers: impl IntoIterator<Item = (R, u64)>) -> Option<PipelineBarrier<R>> {
    let (src_stages, dst_stages, src_access, dst_access, src_queue_family, dst_queue_family) = match phase {
        UploadPhase::BeforeUpload => (
            PipelineStages::VERTEX_INPUT,
            PipelineStages::TRANSFER,
            AccessFlags::MESH_READ,
            AccessFlags::TRANSFER_WRITE,
            queues.graphics,
            queues.copy,
        ),
        UploadPhase::AfterUpload => (
            PipelineStages::TRANSFER,
            PipelineStages::VERTEX_INPUT,
            AccessFlags::TRANSFER_WRITE,
            AccessFlags::MESH_READ,
            queues.copy,
            queues.graphics,
        ),
    };

    let buffer_barriers: Vec<BufferBarrier<R>> = buffers
        .into_iter()
        .map(|(buffer, size)| BufferBarrier {
            buffer,
            src_access,
            dst_access,
            src_queue_family,
            dst_queue_family,
            offset: 0,
            size,
        })
        .collect();

    if buffer_barriers.is_empty() {
        return None;
    }
    Some(PipelineBarrier {
        src_stages,
        dst_stages,
        by_region: true,
        buffer_barriers,
    })
}

// Tests ///////////////////////////////////////////////////////////////////////////////////////////
