//! GPU memory sub-allocation, resource lifecycle tracking and ray-tracing
//! acceleration structure builds.
//!
//! The device sits behind the [`GpuBackend`] trait; [`NullBackend`] is a
//! headless implementation for tests and dry runs. On top of it:
//! [`alloc`] packs batches of resources into shared memory blocks,
//! [`resources`] owns buffer/image/texture lifecycles, and [`accel`] builds
//! and refits acceleration structures.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]

pub mod accel;
pub mod alloc;
pub mod backend;
pub mod errors;
pub mod resources;

pub use accel::{AccelBuilder, AccelStructure, BlasInput};
pub use alloc::{
    AllocRequest, AllocationId, DedicatedAllocator, MemoryAllocator, MemoryBlock, PooledAllocator,
    SharedAllocator,
};
pub use backend::{GpuBackend, NullBackend};
pub use errors::{LucentError, Result};
pub use resources::{CopyEngine, ResourceManager, SamplerPool, Texture};
