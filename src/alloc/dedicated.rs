//! Direct per-call allocation backend.

use std::ptr::NonNull;
use std::sync::Arc;

use slotmap::SlotMap;

use crate::backend::{
    AllocFlags, BufferHandle, DeviceSize, GpuBackend, ImageHandle, MemoryProps,
};
use crate::errors::{LucentError, Result};

use super::{
    assign_offsets_with_padding, collect_buffer_requirements, collect_image_requirements,
    AllocRequest, AllocationId, MemoryAllocator, MemoryBlock,
};

/// Issues one physical device allocation per [`allocate`] call and keeps the
/// resulting blocks in a flat table. The simplest correct backend; every
/// free goes straight back to the device.
///
/// [`allocate`]: MemoryAllocator::allocate
pub struct DedicatedAllocator {
    backend: Arc<dyn GpuBackend>,
    blocks: SlotMap<AllocationId, MemoryBlock>,
}

impl DedicatedAllocator {
    #[must_use]
    pub fn new(backend: Arc<dyn GpuBackend>) -> Self {
        Self {
            backend,
            blocks: SlotMap::with_key(),
        }
    }

    /// Number of live allocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    fn allocate_batch(
        &mut self,
        properties: MemoryProps,
        flags: AllocFlags,
        requirements: &[crate::backend::MemoryRequirements],
        mut bind: impl FnMut(&dyn GpuBackend, usize, MemoryBlock) -> Result<()>,
    ) -> Result<AllocationId> {
        let plan = assign_offsets_with_padding(requirements)?;

        let memory =
            self.backend
                .allocate_memory(plan.total, plan.memory_type_bits, properties, flags, None)?;

        for (i, &offset) in plan.offsets.iter().enumerate() {
            let block = MemoryBlock {
                memory,
                offset,
                size: requirements[i].size,
            };
            if let Err(err) = bind(self.backend.as_ref(), i, block) {
                self.backend.free_memory(memory);
                return Err(err);
            }
        }

        Ok(self.blocks.insert(MemoryBlock {
            memory,
            offset: 0,
            size: plan.total,
        }))
    }
}

impl MemoryAllocator for DedicatedAllocator {
    fn allocate(&mut self, request: &AllocRequest) -> Result<AllocationId> {
        let memory = self.backend.allocate_memory(
            request.requirements.size,
            request.requirements.memory_type_bits,
            request.properties,
            request.allocate_flags,
            request.dedicated,
        )?;
        Ok(self.blocks.insert(MemoryBlock {
            memory,
            offset: 0,
            size: request.requirements.size,
        }))
    }

    fn allocate_buffers(
        &mut self,
        properties: MemoryProps,
        flags: AllocFlags,
        buffers: &[BufferHandle],
    ) -> Result<AllocationId> {
        let requirements = collect_buffer_requirements(self.backend.as_ref(), buffers)?;
        self.allocate_batch(properties, flags, &requirements, |backend, i, block| {
            backend.bind_buffer_memory(buffers[i], block.memory, block.offset)
        })
    }

    fn allocate_images(
        &mut self,
        properties: MemoryProps,
        flags: AllocFlags,
        images: &[ImageHandle],
    ) -> Result<AllocationId> {
        let requirements = collect_image_requirements(self.backend.as_ref(), images)?;
        self.allocate_batch(properties, flags, &requirements, |backend, i, block| {
            backend.bind_image_memory(images[i], block.memory, block.offset)
        })
    }

    fn free(&mut self, id: AllocationId) {
        if let Some(block) = self.blocks.remove(id) {
            self.backend.free_memory(block.memory);
        }
    }

    fn free_all(&mut self) {
        if !self.blocks.is_empty() {
            log::debug!("freeing {} outstanding allocations", self.blocks.len());
        }
        for (_, block) in self.blocks.drain() {
            self.backend.free_memory(block.memory);
        }
    }

    fn block(&self, id: AllocationId) -> Option<MemoryBlock> {
        self.blocks.get(id).copied()
    }

    fn map(
        &mut self,
        id: AllocationId,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<NonNull<u8>> {
        let block = self
            .blocks
            .get(id)
            .ok_or(LucentError::UnknownAllocation(id))?;
        self.backend
            .map_memory(block.memory, block.offset + offset, size)
    }

    fn unmap(&mut self, id: AllocationId) {
        if let Some(block) = self.blocks.get(id) {
            self.backend.unmap_memory(block.memory);
        }
    }
}

impl Drop for DedicatedAllocator {
    fn drop(&mut self) {
        self.free_all();
    }
}
