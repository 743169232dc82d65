//! Pooled / suballocating backend.
//!
//! Carves small allocations out of large fixed-size chunks, one chunk list
//! per (memory-type mask, properties, flags) combination. Frees return the
//! range to the chunk's free list and coalesce with neighboring ranges, so
//! memory is reused across the process lifetime instead of churning device
//! allocations. Oversized requests and dedicated-resource hints bypass the
//! pool and get their own device allocation.

use std::ptr::NonNull;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use slotmap::SlotMap;

use crate::backend::{
    AllocFlags, BufferHandle, DeviceSize, GpuBackend, ImageHandle, MemoryHandle, MemoryProps,
};
use crate::errors::{LucentError, Result};

use super::{
    align_up, assign_offsets_with_padding, collect_buffer_requirements,
    collect_image_requirements, AllocRequest, AllocationId, MemoryAllocator, MemoryBlock,
};

const DEFAULT_CHUNK_SIZE: DeviceSize = 64 << 20; // 64 MiB

#[derive(Debug, Clone, Copy)]
struct FreeRange {
    offset: DeviceSize,
    size: DeviceSize,
}

struct Chunk {
    memory: MemoryHandle,
    size: DeviceSize,
    /// Free ranges sorted by offset, non-adjacent after coalescing.
    free: Vec<FreeRange>,
    live: usize,
}

impl Chunk {
    fn new(memory: MemoryHandle, size: DeviceSize) -> Self {
        Self {
            memory,
            size,
            free: vec![FreeRange { offset: 0, size }],
            live: 0,
        }
    }

    /// First-fit carve honoring `alignment`; front and tail remainders stay
    /// on the free list.
    fn carve(&mut self, size: DeviceSize, alignment: DeviceSize) -> Option<DeviceSize> {
        for i in 0..self.free.len() {
            let range = self.free[i];
            let aligned = align_up(range.offset, alignment);
            let end = range.offset + range.size;
            if aligned + size > end {
                continue;
            }

            self.free.remove(i);
            let mut insert_at = i;
            if aligned > range.offset {
                self.free.insert(
                    insert_at,
                    FreeRange {
                        offset: range.offset,
                        size: aligned - range.offset,
                    },
                );
                insert_at += 1;
            }
            if aligned + size < end {
                self.free.insert(
                    insert_at,
                    FreeRange {
                        offset: aligned + size,
                        size: end - (aligned + size),
                    },
                );
            }
            self.live += 1;
            return Some(aligned);
        }
        None
    }

    /// Return a range to the free list, merging with adjacent neighbors.
    fn give_back(&mut self, offset: DeviceSize, size: DeviceSize) {
        let pos = self
            .free
            .partition_point(|range| range.offset < offset);

        let mut merged = FreeRange { offset, size };
        // Merge with the predecessor if it ends exactly where we start.
        if pos > 0 && self.free[pos - 1].offset + self.free[pos - 1].size == offset {
            let prev = self.free.remove(pos - 1);
            merged = FreeRange {
                offset: prev.offset,
                size: prev.size + size,
            };
            self.free.insert(pos - 1, merged);
            self.merge_with_next(pos - 1);
        } else {
            self.free.insert(pos, merged);
            self.merge_with_next(pos);
        }
        self.live -= 1;
    }

    fn merge_with_next(&mut self, index: usize) {
        if index + 1 < self.free.len() {
            let current = self.free[index];
            let next = self.free[index + 1];
            if current.offset + current.size == next.offset {
                self.free[index].size += next.size;
                self.free.remove(index + 1);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PoolKey {
    memory_type_bits: u32,
    properties: MemoryProps,
    flags: AllocFlags,
}

enum Owner {
    Chunk { key: PoolKey, chunk: usize },
    Dedicated,
}

struct Suballocation {
    memory: MemoryHandle,
    offset: DeviceSize,
    size: DeviceSize,
    owner: Owner,
}

/// A [`MemoryAllocator`] that suballocates from pooled chunks.
pub struct PooledAllocator {
    backend: Arc<dyn GpuBackend>,
    chunk_size: DeviceSize,
    pools: FxHashMap<PoolKey, Vec<Chunk>>,
    blocks: SlotMap<AllocationId, Suballocation>,
}

impl PooledAllocator {
    #[must_use]
    pub fn new(backend: Arc<dyn GpuBackend>) -> Self {
        Self::with_chunk_size(backend, DEFAULT_CHUNK_SIZE)
    }

    #[must_use]
    pub fn with_chunk_size(backend: Arc<dyn GpuBackend>, chunk_size: DeviceSize) -> Self {
        Self {
            backend,
            chunk_size,
            pools: FxHashMap::default(),
            blocks: SlotMap::with_key(),
        }
    }

    /// Number of live allocations (pooled and dedicated).
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Number of device chunks currently held across all pools.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.pools.values().map(Vec::len).sum()
    }

    fn suballocate(&mut self, request: &AllocRequest) -> Result<AllocationId> {
        let req = request.requirements;

        // Oversized and dedicated requests are not worth pooling.
        if request.dedicated.is_some() || req.size > self.chunk_size / 2 {
            let memory = self.backend.allocate_memory(
                req.size,
                req.memory_type_bits,
                request.properties,
                request.allocate_flags,
                request.dedicated,
            )?;
            return Ok(self.blocks.insert(Suballocation {
                memory,
                offset: 0,
                size: req.size,
                owner: Owner::Dedicated,
            }));
        }

        let key = PoolKey {
            memory_type_bits: req.memory_type_bits,
            properties: request.properties,
            flags: request.allocate_flags,
        };
        let chunks = self.pools.entry(key).or_default();

        for (index, chunk) in chunks.iter_mut().enumerate() {
            if let Some(offset) = chunk.carve(req.size, req.alignment) {
                return Ok(self.blocks.insert(Suballocation {
                    memory: chunk.memory,
                    offset,
                    size: req.size,
                    owner: Owner::Chunk { key, chunk: index },
                }));
            }
        }

        let memory = self.backend.allocate_memory(
            self.chunk_size,
            req.memory_type_bits,
            request.properties,
            request.allocate_flags,
            None,
        )?;
        log::debug!(
            "new {} byte chunk for type mask {:#b}",
            self.chunk_size,
            req.memory_type_bits
        );
        let mut chunk = Chunk::new(memory, self.chunk_size);
        let offset = chunk
            .carve(req.size, req.alignment)
            .expect("fresh chunk always fits a request no larger than half its size");
        let index = chunks.len();
        chunks.push(chunk);

        Ok(self.blocks.insert(Suballocation {
            memory,
            offset,
            size: req.size,
            owner: Owner::Chunk { key, chunk: index },
        }))
    }
}

impl MemoryAllocator for PooledAllocator {
    fn allocate(&mut self, request: &AllocRequest) -> Result<AllocationId> {
        self.suballocate(request)
    }

    fn allocate_buffers(
        &mut self,
        properties: MemoryProps,
        flags: AllocFlags,
        buffers: &[BufferHandle],
    ) -> Result<AllocationId> {
        let requirements = collect_buffer_requirements(self.backend.as_ref(), buffers)?;
        let plan = assign_offsets_with_padding(&requirements)?;

        // The packed batch occupies one suballocation; alignment of the whole
        // batch is the strictest member alignment.
        let batch_alignment = requirements
            .iter()
            .map(|r| r.alignment)
            .max()
            .unwrap_or(1);
        let id = self.suballocate(&AllocRequest::new(
            crate::backend::MemoryRequirements {
                size: plan.total,
                alignment: batch_alignment,
                memory_type_bits: plan.memory_type_bits,
            },
            properties,
        ).with_flags(flags))?;

        let (memory, base_offset) = {
            let sub = &self.blocks[id];
            (sub.memory, sub.offset)
        };
        for (i, &offset) in plan.offsets.iter().enumerate() {
            if let Err(err) =
                self.backend
                    .bind_buffer_memory(buffers[i], memory, base_offset + offset)
            {
                self.free(id);
                return Err(err);
            }
        }
        Ok(id)
    }

    fn allocate_images(
        &mut self,
        properties: MemoryProps,
        flags: AllocFlags,
        images: &[ImageHandle],
    ) -> Result<AllocationId> {
        let requirements = collect_image_requirements(self.backend.as_ref(), images)?;
        let plan = assign_offsets_with_padding(&requirements)?;

        let batch_alignment = requirements
            .iter()
            .map(|r| r.alignment)
            .max()
            .unwrap_or(1);
        let id = self.suballocate(&AllocRequest::new(
            crate::backend::MemoryRequirements {
                size: plan.total,
                alignment: batch_alignment,
                memory_type_bits: plan.memory_type_bits,
            },
            properties,
        ).with_flags(flags))?;

        let (memory, base_offset) = {
            let sub = &self.blocks[id];
            (sub.memory, sub.offset)
        };
        for (i, &offset) in plan.offsets.iter().enumerate() {
            if let Err(err) =
                self.backend
                    .bind_image_memory(images[i], memory, base_offset + offset)
            {
                self.free(id);
                return Err(err);
            }
        }
        Ok(id)
    }

    fn free(&mut self, id: AllocationId) {
        let Some(sub) = self.blocks.remove(id) else {
            return;
        };
        match sub.owner {
            Owner::Dedicated => self.backend.free_memory(sub.memory),
            Owner::Chunk { key, chunk } => {
                if let Some(chunks) = self.pools.get_mut(&key) {
                    chunks[chunk].give_back(sub.offset, sub.size);
                }
            }
        }
    }

    fn free_all(&mut self) {
        for (_, sub) in self.blocks.drain() {
            if matches!(sub.owner, Owner::Dedicated) {
                self.backend.free_memory(sub.memory);
            }
        }
        for (_, chunks) in self.pools.drain() {
            for chunk in chunks {
                self.backend.free_memory(chunk.memory);
            }
        }
    }

    fn block(&self, id: AllocationId) -> Option<MemoryBlock> {
        self.blocks.get(id).map(|sub| MemoryBlock {
            memory: sub.memory,
            offset: sub.offset,
            size: sub.size,
        })
    }

    fn map(
        &mut self,
        id: AllocationId,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<NonNull<u8>> {
        let sub = self
            .blocks
            .get(id)
            .ok_or(LucentError::UnknownAllocation(id))?;
        self.backend.map_memory(sub.memory, sub.offset + offset, size)
    }

    fn unmap(&mut self, id: AllocationId) {
        if let Some(sub) = self.blocks.get(id) {
            self.backend.unmap_memory(sub.memory);
        }
    }
}

impl Drop for PooledAllocator {
    fn drop(&mut self) {
        self.free_all();
    }
}
