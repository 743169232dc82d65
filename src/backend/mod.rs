//! Narrow device interface
//!
//! Everything this crate asks of the GPU goes through [`GpuBackend`]: physical
//! memory allocation, buffer/image object creation, binding at byte offsets,
//! acceleration-structure queries and synchronous command submission to one
//! queue. Device and instance initialization, capability negotiation and
//! pipeline construction live with the embedding application, behind whatever
//! implements this trait.
//!
//! The crate is single-threaded host-side by contract, so the trait takes
//! `&self` and implementations are free to use plain interior mutability
//! without locks. A backend is shared between the allocator, the resource
//! manager and the acceleration-structure builder as `Arc<dyn GpuBackend>`.
//!
//! [`NullBackend`] is a headless implementation that simulates the device,
//! used by the test suite and available to embedders for dry runs.

mod null;
mod types;

use std::ptr::NonNull;

use crate::errors::Result;

pub use null::NullBackend;
pub use types::{
    AccelBuildDesc, AccelHandle, AccelInstance, AccelKind, Access, AddressMode, AllocFlags,
    BufferHandle, BufferUsage, BuildFlags, BuildMode, BuildRange, BuildSizes, CommandBuffer,
    DedicatedResource, DeviceAddress, DeviceSize, Filter, Format, GeometryData, ImageDesc,
    ImageHandle, ImageLayout, ImageUsage, ImageViewHandle, MemoryHandle, MemoryProps,
    MemoryRequirements, PipelineStage, SamplerDesc, SamplerHandle, TriangleGeometry,
};

/// The device capability set this crate consumes.
///
/// All operations are synchronous. Destroy/free operations on null or unknown
/// handles are no-ops; every other failure surfaces as an error.
pub trait GpuBackend {
    // ------------------------------------------------------------------
    // Physical memory
    // ------------------------------------------------------------------

    /// Allocate one contiguous block of physical memory from a memory type
    /// compatible with `memory_type_bits` and carrying `properties`.
    fn allocate_memory(
        &self,
        size: DeviceSize,
        memory_type_bits: u32,
        properties: MemoryProps,
        flags: AllocFlags,
        dedicated: Option<DedicatedResource>,
    ) -> Result<MemoryHandle>;

    /// Release a physical allocation. No-op on the null handle.
    fn free_memory(&self, memory: MemoryHandle);

    /// Map `size` bytes at `offset` into host address space.
    fn map_memory(
        &self,
        memory: MemoryHandle,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<NonNull<u8>>;

    /// Unmap a previously mapped allocation.
    fn unmap_memory(&self, memory: MemoryHandle);

    // ------------------------------------------------------------------
    // Buffers
    // ------------------------------------------------------------------

    /// Create an unbound buffer object and report its memory requirements.
    fn create_buffer(
        &self,
        size: DeviceSize,
        usage: BufferUsage,
    ) -> Result<(BufferHandle, MemoryRequirements)>;

    fn destroy_buffer(&self, buffer: BufferHandle);

    /// Bind a buffer to physical memory at a byte offset. A buffer is bound
    /// at most once for its lifetime.
    fn bind_buffer_memory(
        &self,
        buffer: BufferHandle,
        memory: MemoryHandle,
        offset: DeviceSize,
    ) -> Result<()>;

    /// Device address of a bound buffer, or 0 for an unknown handle.
    fn buffer_device_address(&self, buffer: BufferHandle) -> DeviceAddress;

    /// Memory requirements of an existing buffer, `None` for an unknown handle.
    fn buffer_memory_requirements(&self, buffer: BufferHandle) -> Option<MemoryRequirements>;

    // ------------------------------------------------------------------
    // Images, views, samplers
    // ------------------------------------------------------------------

    /// Create an unbound image object and report its memory requirements.
    fn create_image(&self, desc: &ImageDesc) -> Result<(ImageHandle, MemoryRequirements)>;

    fn destroy_image(&self, image: ImageHandle);

    fn bind_image_memory(
        &self,
        image: ImageHandle,
        memory: MemoryHandle,
        offset: DeviceSize,
    ) -> Result<()>;

    /// Memory requirements of an existing image, `None` for an unknown handle.
    fn image_memory_requirements(&self, image: ImageHandle) -> Option<MemoryRequirements>;

    /// Create a full-resource view over a bound image.
    fn create_image_view(&self, image: ImageHandle, desc: &ImageDesc) -> Result<ImageViewHandle>;

    fn destroy_image_view(&self, view: ImageViewHandle);

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerHandle>;

    fn destroy_sampler(&self, sampler: SamplerHandle);

    // ------------------------------------------------------------------
    // Acceleration structures
    // ------------------------------------------------------------------

    /// Worst-case sizes for building `kind` over `geometries`, assuming at
    /// most `max_primitive_counts[i]` primitives in geometry `i`.
    fn accel_build_sizes(
        &self,
        kind: AccelKind,
        flags: BuildFlags,
        geometries: &[GeometryData],
        max_primitive_counts: &[u32],
    ) -> BuildSizes;

    /// Create a structure object placed in `buffer`. The buffer must carry
    /// [`BufferUsage::ACCEL_STORAGE`] and stay alive for the structure's
    /// lifetime.
    fn create_accel(
        &self,
        kind: AccelKind,
        buffer: BufferHandle,
        size: DeviceSize,
    ) -> Result<AccelHandle>;

    fn destroy_accel(&self, accel: AccelHandle);

    /// Device address of a structure, or 0 for an unknown handle.
    fn accel_device_address(&self, accel: AccelHandle) -> DeviceAddress;

    // ------------------------------------------------------------------
    // Command recording and submission
    // ------------------------------------------------------------------

    /// Allocate `count` command buffers from the construction-time pool,
    /// opened for recording.
    fn create_command_buffers(&self, count: usize) -> Result<Vec<CommandBuffer>>;

    /// Record one acceleration-structure build into `cmd`.
    fn cmd_build_accel(&self, cmd: CommandBuffer, desc: &AccelBuildDesc<'_>);

    /// Record a global memory barrier into `cmd`.
    fn cmd_memory_barrier(
        &self,
        cmd: CommandBuffer,
        src_stage: PipelineStage,
        dst_stage: PipelineStage,
        src_access: Access,
        dst_access: Access,
    );

    /// Close the given command buffers, submit them to the queue and block
    /// until the device signals completion.
    fn submit_and_wait(&self, cmds: &[CommandBuffer]) -> Result<()>;

    /// Return command buffers to the pool.
    fn free_command_buffers(&self, cmds: &[CommandBuffer]);
}
