//! Compacting sub-allocator for mesh geometry.
//!
//! Vertex and index data for streamed-in chunks and models is rationed out of a few large backing
//! buffers instead of getting a buffer each. See [memory] for how the pieces fit together.
//!
//! ```
//! use gestalt_mesh_memory::config::MeshMemoryConfig;
//! use gestalt_mesh_memory::memory::{HostBackingAllocator, MeshAllocator};
//!
//! let config = MeshMemoryConfig { new_buffer_size: 4096, ..Default::default() };
//! let pool = MeshAllocator::new(&config, HostBackingAllocator::new()).unwrap();
//! let mesh = pool.allocate(1024).unwrap();
//! let storage = pool.get_backing_storage(&mesh).unwrap();
//! assert_eq!((storage.offset, storage.size), (0, 1024));
//! pool.free(&mesh).unwrap();
//! ```

pub mod config;
pub mod logger;
pub mod memory;

pub use config::MeshMemoryConfig;
pub use memory::{MeshAllocation, MeshAllocator, MeshMemoryError};
