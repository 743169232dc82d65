//! Image and texture creation paths.

use crate::alloc::AllocRequest;
use crate::backend::{
    AllocFlags, ImageDesc, ImageHandle, ImageLayout, MemoryProps, SamplerDesc, SamplerHandle,
};
use crate::errors::Result;

use super::{ResourceManager, Texture};

impl ResourceManager {
    /// Create an image bound to its own device-local allocation.
    pub fn create_image(&mut self, desc: &ImageDesc) -> Result<ImageHandle> {
        let (image, requirements) = self.backend.create_image(desc)?;

        let mut allocator = self.allocator.borrow_mut();
        let id = match allocator.allocate(&AllocRequest::new(
            requirements,
            MemoryProps::DEVICE_LOCAL,
        )) {
            Ok(id) => id,
            Err(err) => {
                self.backend.destroy_image(image);
                return Err(err);
            }
        };

        let block = allocator
            .block(id)
            .expect("freshly allocated id resolves to a block");
        if let Err(err) = self
            .backend
            .bind_image_memory(image, block.memory, block.offset)
        {
            allocator.free(id);
            self.backend.destroy_image(image);
            return Err(err);
        }
        drop(allocator);

        self.img_allocs.insert(image, id);
        Ok(image)
    }

    /// Create an image and upload tightly packed texel data into it.
    pub fn create_image_with_data(
        &mut self,
        desc: &ImageDesc,
        data: &[u8],
        layout: ImageLayout,
    ) -> Result<ImageHandle> {
        let image = self.create_image(desc)?;
        self.copy.update_image(
            image,
            data,
            desc.width,
            desc.height,
            desc.format.bytes_per_pixel(),
            layout,
        );
        Ok(image)
    }

    /// Create several images packed into a single device-local allocation.
    pub fn create_images(&mut self, descs: &[ImageDesc]) -> Result<Vec<ImageHandle>> {
        let mut images = Vec::with_capacity(descs.len());
        for desc in descs {
            match self.backend.create_image(desc) {
                Ok((image, _)) => images.push(image),
                Err(err) => {
                    for image in images {
                        self.backend.destroy_image(image);
                    }
                    return Err(err);
                }
            }
        }

        let id = match self.allocator.borrow_mut().allocate_images(
            MemoryProps::DEVICE_LOCAL,
            AllocFlags::empty(),
            &images,
        ) {
            Ok(id) => id,
            Err(err) => {
                for image in images {
                    self.backend.destroy_image(image);
                }
                return Err(err);
            }
        };

        for &image in &images {
            self.img_allocs.insert(image, id);
        }
        Ok(images)
    }

    /// Create an image plus a matching view. When a sampler description is
    /// supplied, a cached sampler is acquired from the pool.
    pub fn create_texture(
        &mut self,
        desc: &ImageDesc,
        sampler: Option<&SamplerDesc>,
    ) -> Result<Texture> {
        let mut image = self.create_image(desc)?;

        let view = match self.backend.create_image_view(image, desc) {
            Ok(view) => view,
            Err(err) => {
                self.destroy_image(&mut image);
                return Err(err);
            }
        };

        let sampler = match sampler {
            Some(desc) => match self.sampler_pool.acquire(desc) {
                Ok(handle) => Some(handle),
                Err(err) => {
                    self.backend.destroy_image_view(view);
                    self.destroy_image(&mut image);
                    return Err(err);
                }
            },
            None => None,
        };

        Ok(Texture {
            image,
            view,
            sampler,
        })
    }

    /// Batched [`create_texture`]: images packed into one shared allocation,
    /// one view per image, all sharing the same pooled sampler when a
    /// description is supplied.
    ///
    /// [`create_texture`]: ResourceManager::create_texture
    pub fn create_textures(
        &mut self,
        descs: &[ImageDesc],
        sampler: Option<&SamplerDesc>,
    ) -> Result<Vec<Texture>> {
        let images = self.create_images(descs)?;

        let mut textures = Vec::with_capacity(images.len());
        for (&image, desc) in images.iter().zip(descs) {
            match self.backend.create_image_view(image, desc) {
                Ok(view) => textures.push(Texture {
                    image,
                    view,
                    sampler: None,
                }),
                Err(err) => {
                    for texture in &mut textures {
                        self.destroy_texture(texture);
                    }
                    for mut image in images[textures.len()..].to_vec() {
                        self.destroy_image(&mut image);
                    }
                    return Err(err);
                }
            }
        }

        if let Some(desc) = sampler {
            for index in 0..textures.len() {
                match self.sampler_pool.acquire(desc) {
                    Ok(handle) => textures[index].sampler = Some(handle),
                    Err(err) => {
                        for texture in &mut textures {
                            self.destroy_texture(texture);
                        }
                        return Err(err);
                    }
                }
            }
        }
        Ok(textures)
    }

    /// Acquire a pooled sampler directly.
    pub fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerHandle> {
        self.sampler_pool.acquire(desc)
    }
}
