//! Resource lifecycle management
//!
//! [`ResourceManager`] owns the creation and destruction of buffer, image and
//! texture objects. Each created object is bound to exactly one allocation
//! obtained from the shared [`MemoryAllocator`]; the handle→allocation maps
//! here are bookkeeping back-references only. The device owns the objects,
//! the allocator owns the memory.
//!
//! Split by responsibility:
//! - `buffer.rs`: buffer creation (single, with-data, batched)
//! - `image.rs`: image and texture creation
//! - `sampler.rs`: the refcounted [`SamplerPool`]
//! - `copy.rs`: the external [`CopyEngine`] upload interface
//!
//! [`MemoryAllocator`]: crate::alloc::MemoryAllocator

mod buffer;
mod copy;
mod image;
mod sampler;

use std::rc::Rc;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::alloc::{AllocationId, SharedAllocator};
use crate::backend::{BufferHandle, GpuBackend, ImageHandle, ImageViewHandle, SamplerHandle};

pub use buffer::BufferDesc;
pub use copy::CopyEngine;
pub use sampler::SamplerPool;

/// An image together with its view and optional pooled sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Texture {
    pub image: ImageHandle,
    pub view: ImageViewHandle,
    pub sampler: Option<SamplerHandle>,
}

/// Owns buffer/image/texture lifecycles and tracks which allocation backs
/// each handle.
///
/// Buffers created through the batched paths share one allocation id. The
/// first destroyed sibling releases the shared block; later frees of the
/// same id are no-ops. The caller must not touch the surviving siblings
/// after that point, which matches the create-together, destroy-together
/// usage the batched paths exist for.
pub struct ResourceManager {
    pub(crate) backend: Arc<dyn GpuBackend>,
    pub(crate) allocator: SharedAllocator,
    pub(crate) copy: Rc<dyn CopyEngine>,

    pub(crate) buf_allocs: FxHashMap<BufferHandle, AllocationId>,
    pub(crate) img_allocs: FxHashMap<ImageHandle, AllocationId>,
    pub(crate) sampler_pool: SamplerPool,
}

impl ResourceManager {
    #[must_use]
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        allocator: SharedAllocator,
        copy: Rc<dyn CopyEngine>,
    ) -> Self {
        let sampler_pool = SamplerPool::new(backend.clone());
        Self {
            backend,
            allocator,
            copy,
            buf_allocs: FxHashMap::default(),
            img_allocs: FxHashMap::default(),
            sampler_pool,
        }
    }

    /// Number of tracked buffers.
    #[must_use]
    pub fn tracked_buffer_count(&self) -> usize {
        self.buf_allocs.len()
    }

    /// Number of tracked images.
    #[must_use]
    pub fn tracked_image_count(&self) -> usize {
        self.img_allocs.len()
    }

    /// Destroy a buffer, free its backing allocation and null the caller's
    /// handle. Unknown handles log a warning and mutate nothing.
    pub fn destroy_buffer(&mut self, buffer: &mut BufferHandle) {
        let Some(id) = self.buf_allocs.remove(buffer) else {
            log::warn!("destroy_buffer: unknown buffer {buffer:?}");
            return;
        };
        self.backend.destroy_buffer(*buffer);
        self.allocator.borrow_mut().free(id);
        *buffer = BufferHandle::NULL;
    }

    /// Destroy an image, free its backing allocation and null the caller's
    /// handle. Unknown handles log a warning and mutate nothing.
    pub fn destroy_image(&mut self, image: &mut ImageHandle) {
        let Some(id) = self.img_allocs.remove(image) else {
            log::warn!("destroy_image: unknown image {image:?}");
            return;
        };
        self.backend.destroy_image(*image);
        self.allocator.borrow_mut().free(id);
        *image = ImageHandle::NULL;
    }

    /// Destroy a texture: its image, its view, and release the pooled sampler.
    pub fn destroy_texture(&mut self, texture: &mut Texture) {
        self.destroy_image(&mut texture.image);

        if !texture.view.is_null() {
            self.backend.destroy_image_view(texture.view);
            texture.view = ImageViewHandle::NULL;
        }

        if let Some(sampler) = texture.sampler.take() {
            self.sampler_pool.release(sampler);
        }
    }

    /// Release a pooled sampler and null the caller's handle.
    pub fn destroy_sampler(&mut self, sampler: &mut SamplerHandle) {
        if !sampler.is_null() {
            self.sampler_pool.release(*sampler);
            *sampler = SamplerHandle::NULL;
        }
    }

    /// Destroy every tracked buffer and image and tear down the sampler
    /// pool. Both tracking maps are empty afterwards.
    pub fn cleanup(&mut self) {
        let mut allocator = self.allocator.borrow_mut();

        for (buffer, id) in self.buf_allocs.drain() {
            self.backend.destroy_buffer(buffer);
            allocator.free(id);
        }
        for (image, id) in self.img_allocs.drain() {
            self.backend.destroy_image(image);
            allocator.free(id);
        }
        drop(allocator);

        self.sampler_pool.deinit();
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}
