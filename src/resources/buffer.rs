//! Buffer creation paths.

use crate::alloc::AllocRequest;
use crate::backend::{AllocFlags, BufferHandle, BufferUsage, DeviceSize, MemoryProps};
use crate::errors::Result;

use super::ResourceManager;

/// Size and usage of one buffer in a batched create call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: DeviceSize,
    pub usage: BufferUsage,
}

impl BufferDesc {
    #[must_use]
    pub fn new(size: DeviceSize, usage: BufferUsage) -> Self {
        Self { size, usage }
    }
}

impl ResourceManager {
    /// Create a buffer bound to its own allocation.
    pub fn create_buffer(
        &mut self,
        size: DeviceSize,
        usage: BufferUsage,
        properties: MemoryProps,
        allocate_flags: AllocFlags,
    ) -> Result<BufferHandle> {
        let (buffer, requirements) = self.backend.create_buffer(size, usage)?;

        let mut allocator = self.allocator.borrow_mut();
        let id = match allocator
            .allocate(&AllocRequest::new(requirements, properties).with_flags(allocate_flags))
        {
            Ok(id) => id,
            Err(err) => {
                self.backend.destroy_buffer(buffer);
                return Err(err);
            }
        };

        let block = allocator
            .block(id)
            .expect("freshly allocated id resolves to a block");
        if let Err(err) = self
            .backend
            .bind_buffer_memory(buffer, block.memory, block.offset)
        {
            allocator.free(id);
            self.backend.destroy_buffer(buffer);
            return Err(err);
        }
        drop(allocator);

        self.buf_allocs.insert(buffer, id);
        Ok(buffer)
    }

    /// Create a buffer and upload `data` into it through the copy engine.
    pub fn create_buffer_with_data(
        &mut self,
        data: &[u8],
        usage: BufferUsage,
        properties: MemoryProps,
        allocate_flags: AllocFlags,
    ) -> Result<BufferHandle> {
        let buffer = self.create_buffer(
            data.len() as DeviceSize,
            usage | BufferUsage::TRANSFER_DST,
            properties,
            allocate_flags,
        )?;
        self.copy.update_buffer(buffer, 0, data);
        Ok(buffer)
    }

    /// Create several buffers packed into a single physical allocation.
    ///
    /// All buffers share one allocation id; see the type-level notes on
    /// shared-block destruction.
    pub fn create_buffers(
        &mut self,
        descs: &[BufferDesc],
        properties: MemoryProps,
        allocate_flags: AllocFlags,
    ) -> Result<Vec<BufferHandle>> {
        let mut buffers = Vec::with_capacity(descs.len());
        for desc in descs {
            match self.backend.create_buffer(desc.size, desc.usage) {
                Ok((buffer, _)) => buffers.push(buffer),
                Err(err) => {
                    for buffer in buffers {
                        self.backend.destroy_buffer(buffer);
                    }
                    return Err(err);
                }
            }
        }

        let id = match self
            .allocator
            .borrow_mut()
            .allocate_buffers(properties, allocate_flags, &buffers)
        {
            Ok(id) => id,
            Err(err) => {
                for buffer in buffers {
                    self.backend.destroy_buffer(buffer);
                }
                return Err(err);
            }
        };

        for &buffer in &buffers {
            self.buf_allocs.insert(buffer, id);
        }
        Ok(buffers)
    }

    /// Batched create-and-upload: one shared allocation, one upload per buffer.
    pub fn create_buffers_with_data(
        &mut self,
        items: &[(&[u8], BufferUsage)],
        properties: MemoryProps,
        allocate_flags: AllocFlags,
    ) -> Result<Vec<BufferHandle>> {
        let descs: Vec<BufferDesc> = items
            .iter()
            .map(|(data, usage)| BufferDesc {
                size: data.len() as DeviceSize,
                usage: *usage | BufferUsage::TRANSFER_DST,
            })
            .collect();

        let buffers = self.create_buffers(&descs, properties, allocate_flags)?;
        for (buffer, (data, _)) in buffers.iter().zip(items) {
            self.copy.update_buffer(*buffer, 0, data);
        }
        Ok(buffers)
    }
}
