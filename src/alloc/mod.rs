//! GPU memory sub-allocation
//!
//! Turns resource memory requirements into bound physical allocations behind
//! one backend-agnostic contract, [`MemoryAllocator`]:
//! - [`DedicatedAllocator`]: one physical allocation per call, flat table.
//! - [`PooledAllocator`]: suballocates from fixed-size chunks with a free
//!   list, for finer-grained reuse across the process lifetime.
//!
//! The batched path is the core algorithmic piece: all resources created in
//! one call are packed into a single physical allocation at computed,
//! alignment-respecting offsets ([`assign_offsets_with_padding`]). A batch
//! whose members report incompatible memory-type masks is rejected wholesale;
//! that signals caller misuse, not a transient fault, and creates no state.

mod dedicated;
mod pooled;

use std::cell::RefCell;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::backend::{
    AllocFlags, BufferHandle, DedicatedResource, DeviceSize, GpuBackend, ImageHandle,
    MemoryHandle, MemoryProps, MemoryRequirements,
};
use crate::errors::{LucentError, Result};

pub use dedicated::DedicatedAllocator;
pub use pooled::PooledAllocator;

slotmap::new_key_type! {
    /// Opaque ticket for one live allocation. Keys are generational: once
    /// freed, a stale id never resolves to a live block again, even if the
    /// backing slot is reused.
    pub struct AllocationId;
}

/// One bound, contiguous region of physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBlock {
    pub memory: MemoryHandle,
    pub offset: DeviceSize,
    pub size: DeviceSize,
}

/// Everything a single allocation needs to know.
#[derive(Debug, Clone, Copy)]
pub struct AllocRequest {
    pub requirements: MemoryRequirements,
    pub properties: MemoryProps,
    pub allocate_flags: AllocFlags,
    /// Set when the allocation backs exactly one resource.
    pub dedicated: Option<DedicatedResource>,
}

impl AllocRequest {
    #[must_use]
    pub fn new(requirements: MemoryRequirements, properties: MemoryProps) -> Self {
        Self {
            requirements,
            properties,
            allocate_flags: AllocFlags::empty(),
            dedicated: None,
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: AllocFlags) -> Self {
        self.allocate_flags = flags;
        self
    }

    #[must_use]
    pub fn dedicated_to(mut self, resource: DedicatedResource) -> Self {
        self.dedicated = Some(resource);
        self
    }
}

/// The backend-agnostic allocation contract. Callers must not depend on
/// which implementation sits behind it.
pub trait MemoryAllocator {
    /// Allocate one block satisfying `request`.
    fn allocate(&mut self, request: &AllocRequest) -> Result<AllocationId>;

    /// Pack the given buffers into one physical allocation and bind each at
    /// its computed offset. The whole batch is rejected if the buffers
    /// report incompatible memory-type masks.
    fn allocate_buffers(
        &mut self,
        properties: MemoryProps,
        flags: AllocFlags,
        buffers: &[BufferHandle],
    ) -> Result<AllocationId>;

    /// Image counterpart of [`MemoryAllocator::allocate_buffers`].
    fn allocate_images(
        &mut self,
        properties: MemoryProps,
        flags: AllocFlags,
        images: &[ImageHandle],
    ) -> Result<AllocationId>;

    /// Release one allocation. No-op on a stale or unknown id.
    fn free(&mut self, id: AllocationId);

    /// Release every live allocation. Idempotent, meant for full teardown.
    fn free_all(&mut self);

    /// The bound region behind `id`, or `None` for a stale id.
    fn block(&self, id: AllocationId) -> Option<MemoryBlock>;

    /// Map `size` bytes at `offset` within the allocation into host memory.
    fn map(&mut self, id: AllocationId, offset: DeviceSize, size: DeviceSize)
        -> Result<NonNull<u8>>;

    /// Unmap a previously mapped allocation. No-op on a stale id.
    fn unmap(&mut self, id: AllocationId);
}

/// Single-threaded shared handle to an allocator; the resource manager and
/// the acceleration-structure builder both borrow it per call.
pub type SharedAllocator = Rc<RefCell<dyn MemoryAllocator>>;

/// Wrap an allocator for sharing between components.
pub fn share<A: MemoryAllocator + 'static>(allocator: A) -> SharedAllocator {
    Rc::new(RefCell::new(allocator))
}

/// Round `value` up to the next multiple of `alignment` (a power of two).
#[inline]
#[must_use]
pub fn align_up(value: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    debug_assert!(alignment.is_power_of_two());
    value.next_multiple_of(alignment)
}

/// Offsets assigned to one packed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetPlan {
    /// Byte offset of each resource within the shared allocation;
    /// monotonically non-decreasing, each a multiple of its alignment.
    pub offsets: Vec<DeviceSize>,
    /// Total allocation size, padded to the last resource's alignment.
    pub total: DeviceSize,
    /// Memory-type mask shared by every resource in the batch.
    pub memory_type_bits: u32,
}

/// Compute packed offsets for a batch of requirements by prefix sum:
/// `offset[0] = 0`, `offset[i] = align_up(offset[i-1] + size[i-1], alignment[i])`.
///
/// Rejects an empty batch and any batch whose members disagree on
/// `memory_type_bits`; both are configuration errors that allocate nothing.
pub fn assign_offsets_with_padding(requirements: &[MemoryRequirements]) -> Result<OffsetPlan> {
    let Some(first) = requirements.first() else {
        return Err(LucentError::EmptyBatch);
    };

    for (index, req) in requirements.iter().enumerate().skip(1) {
        if req.memory_type_bits != first.memory_type_bits {
            return Err(LucentError::IncompatibleMemoryTypes {
                index,
                type_bits: req.memory_type_bits,
                expected: first.memory_type_bits,
            });
        }
    }

    let mut offsets = Vec::with_capacity(requirements.len());
    let mut cursor: DeviceSize = 0;
    for req in requirements {
        cursor = align_up(cursor, req.alignment);
        offsets.push(cursor);
        cursor += req.size;
    }
    let last = requirements[requirements.len() - 1];
    let total = align_up(cursor, last.alignment);

    Ok(OffsetPlan {
        offsets,
        total,
        memory_type_bits: first.memory_type_bits,
    })
}

/// Query the requirements of every buffer in a batch.
pub(crate) fn collect_buffer_requirements(
    backend: &dyn GpuBackend,
    buffers: &[BufferHandle],
) -> Result<Vec<MemoryRequirements>> {
    buffers
        .iter()
        .map(|&buf| {
            backend
                .buffer_memory_requirements(buf)
                .ok_or_else(|| LucentError::UnknownHandle(format!("{buf:?}")))
        })
        .collect()
}

/// Query the requirements of every image in a batch.
pub(crate) fn collect_image_requirements(
    backend: &dyn GpuBackend,
    images: &[ImageHandle],
) -> Result<Vec<MemoryRequirements>> {
    images
        .iter()
        .map(|&img| {
            backend
                .image_memory_requirements(img)
                .ok_or_else(|| LucentError::UnknownHandle(format!("{img:?}")))
        })
        .collect()
}
