//! Resource Manager Tests
//!
//! Tests for:
//! - Buffer/image/texture creation and destruction, including the
//!   warn-and-ignore path for unknown handles
//! - Upload plumbing through the CopyEngine seam
//! - Batched creation sharing one allocation
//! - Sampler pooling and refcounted release
//! - cleanup() draining every tracked object

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use lucent::alloc::{self, SharedAllocator};
use lucent::backend::{
    AllocFlags, BufferHandle, BufferUsage, Filter, Format, ImageDesc, ImageHandle, ImageLayout,
    ImageUsage, MemoryProps, SamplerDesc,
};
use lucent::{CopyEngine, DedicatedAllocator, LucentError, NullBackend, ResourceManager, Texture};
use lucent::resources::BufferDesc;

/// Records every upload the manager issues instead of copying anything.
#[derive(Default)]
struct RecordingCopy {
    buffer_uploads: RefCell<Vec<(BufferHandle, u64, Vec<u8>)>>,
    image_uploads: RefCell<Vec<(ImageHandle, usize, u32, u32, u32)>>,
}

impl CopyEngine for RecordingCopy {
    fn update_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        self.buffer_uploads
            .borrow_mut()
            .push((buffer, offset, data.to_vec()));
    }

    fn update_image(
        &self,
        image: ImageHandle,
        data: &[u8],
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
        _layout: ImageLayout,
    ) {
        self.image_uploads
            .borrow_mut()
            .push((image, data.len(), width, height, bytes_per_pixel));
    }
}

fn setup() -> (Arc<NullBackend>, Rc<RecordingCopy>, ResourceManager) {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = Arc::new(NullBackend::new());
    let allocator: SharedAllocator = alloc::share(DedicatedAllocator::new(backend.clone()));
    let copy = Rc::new(RecordingCopy::default());
    let manager = ResourceManager::new(backend.clone(), allocator, copy.clone());
    (backend, copy, manager)
}

fn sampler_desc() -> SamplerDesc {
    SamplerDesc {
        mag_filter: Filter::Linear,
        min_filter: Filter::Linear,
        mipmap_filter: Filter::Nearest,
        ..SamplerDesc::default()
    }
}

// ============================================================================
// Buffers
// ============================================================================

#[test]
fn buffer_create_and_destroy() {
    let (backend, _copy, mut manager) = setup();

    let mut buffer = manager
        .create_buffer(
            1024,
            BufferUsage::STORAGE,
            MemoryProps::DEVICE_LOCAL,
            AllocFlags::empty(),
        )
        .unwrap();
    assert!(!buffer.is_null());
    assert_eq!(manager.tracked_buffer_count(), 1);
    assert_eq!(backend.live_buffer_count(), 1);
    assert_eq!(backend.live_memory_count(), 1);

    manager.destroy_buffer(&mut buffer);
    assert!(buffer.is_null());
    assert_eq!(manager.tracked_buffer_count(), 0);
    assert_eq!(backend.live_buffer_count(), 0);
    assert_eq!(backend.live_memory_count(), 0);
}

#[test]
fn buffer_destroy_unknown_handle_changes_nothing() {
    let (backend, _copy, mut manager) = setup();

    let _tracked = manager
        .create_buffer(
            256,
            BufferUsage::UNIFORM,
            MemoryProps::DEVICE_LOCAL,
            AllocFlags::empty(),
        )
        .unwrap();

    let mut stranger = BufferHandle(0xbad);
    manager.destroy_buffer(&mut stranger);
    assert_eq!(stranger, BufferHandle(0xbad));
    assert_eq!(manager.tracked_buffer_count(), 1);
    assert_eq!(backend.live_buffer_count(), 1);
}

#[test]
fn buffer_double_destroy_is_harmless() {
    let (backend, _copy, mut manager) = setup();

    let mut buffer = manager
        .create_buffer(
            256,
            BufferUsage::STORAGE,
            MemoryProps::DEVICE_LOCAL,
            AllocFlags::empty(),
        )
        .unwrap();
    let mut stale = buffer;

    manager.destroy_buffer(&mut buffer);
    manager.destroy_buffer(&mut stale);
    assert_eq!(backend.live_buffer_count(), 0);
    assert_eq!(backend.live_memory_count(), 0);
}

#[test]
fn buffer_with_data_goes_through_the_copy_engine() {
    let (_backend, copy, mut manager) = setup();

    let payload = [0xabu8; 32];
    let buffer = manager
        .create_buffer_with_data(
            &payload,
            BufferUsage::VERTEX,
            MemoryProps::DEVICE_LOCAL,
            AllocFlags::empty(),
        )
        .unwrap();

    let uploads = copy.buffer_uploads.borrow();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].0, buffer);
    assert_eq!(uploads[0].1, 0);
    assert_eq!(uploads[0].2, payload);
}

#[test]
fn batched_buffers_share_one_allocation() {
    let (backend, _copy, mut manager) = setup();

    let buffers = manager
        .create_buffers(
            &[
                BufferDesc::new(100, BufferUsage::VERTEX),
                BufferDesc::new(200, BufferUsage::INDEX),
                BufferDesc::new(300, BufferUsage::STORAGE),
            ],
            MemoryProps::DEVICE_LOCAL,
            AllocFlags::empty(),
        )
        .unwrap();

    assert_eq!(buffers.len(), 3);
    assert_eq!(manager.tracked_buffer_count(), 3);
    assert_eq!(backend.live_buffer_count(), 3);
    assert_eq!(backend.live_memory_count(), 1);

    // First sibling destroyed releases the shared block; destroying the
    // rest still tears down the buffer objects without a double free.
    let mut buffers = buffers;
    for buffer in &mut buffers {
        manager.destroy_buffer(buffer);
    }
    assert_eq!(backend.live_buffer_count(), 0);
    assert_eq!(backend.live_memory_count(), 0);
}

#[test]
fn batched_buffers_with_data_upload_each_payload() {
    let (_backend, copy, mut manager) = setup();

    let a = [1u8; 16];
    let b = [2u8; 64];
    let buffers = manager
        .create_buffers_with_data(
            &[(&a, BufferUsage::VERTEX), (&b, BufferUsage::INDEX)],
            MemoryProps::DEVICE_LOCAL,
            AllocFlags::empty(),
        )
        .unwrap();

    let uploads = copy.buffer_uploads.borrow();
    assert_eq!(uploads.len(), 2);
    assert_eq!(uploads[0].0, buffers[0]);
    assert_eq!(uploads[0].2, a);
    assert_eq!(uploads[1].0, buffers[1]);
    assert_eq!(uploads[1].2, b);
}

// ============================================================================
// Images and textures
// ============================================================================

#[test]
fn image_create_and_destroy() {
    let (backend, _copy, mut manager) = setup();

    let desc = ImageDesc::new_2d(64, 64, Format::Rgba8Unorm, ImageUsage::SAMPLED);
    let mut image = manager.create_image(&desc).unwrap();
    assert_eq!(manager.tracked_image_count(), 1);
    assert_eq!(backend.live_image_count(), 1);

    manager.destroy_image(&mut image);
    assert!(image.is_null());
    assert_eq!(manager.tracked_image_count(), 0);
    assert_eq!(backend.live_image_count(), 0);
    assert_eq!(backend.live_memory_count(), 0);
}

#[test]
fn image_with_data_uploads_with_the_format_pixel_size() {
    let (_backend, copy, mut manager) = setup();

    let desc = ImageDesc::new_2d(4, 4, Format::Rgba16Float, ImageUsage::SAMPLED);
    let data = vec![0u8; 4 * 4 * 8];
    let image = manager
        .create_image_with_data(&desc, &data, ImageLayout::ShaderReadOnly)
        .unwrap();

    let uploads = copy.image_uploads.borrow();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0], (image, data.len(), 4, 4, 8));
}

#[test]
fn batched_images_share_one_allocation() {
    let (backend, _copy, mut manager) = setup();

    let descs = [
        ImageDesc::new_2d(32, 32, Format::Rgba8Unorm, ImageUsage::SAMPLED),
        ImageDesc::new_2d(128, 128, Format::Rgba8Unorm, ImageUsage::SAMPLED),
    ];
    let images = manager.create_images(&descs).unwrap();

    assert_eq!(images.len(), 2);
    assert_eq!(manager.tracked_image_count(), 2);
    assert_eq!(backend.live_image_count(), 2);
    assert_eq!(backend.live_memory_count(), 1);
}

#[test]
fn texture_bundles_image_view_and_pooled_sampler() {
    let (backend, _copy, mut manager) = setup();

    let desc = ImageDesc::new_2d(16, 16, Format::Rgba8Unorm, ImageUsage::SAMPLED);
    let mut texture = manager.create_texture(&desc, Some(&sampler_desc())).unwrap();
    assert!(!texture.image.is_null());
    assert!(!texture.view.is_null());
    assert!(texture.sampler.is_some());
    assert_eq!(backend.live_sampler_count(), 1);

    manager.destroy_texture(&mut texture);
    assert_eq!(texture, Texture::default());
    assert_eq!(backend.live_image_count(), 0);
    assert_eq!(backend.live_sampler_count(), 0);
}

#[test]
fn batched_textures_share_allocation_and_sampler() {
    let (backend, _copy, mut manager) = setup();

    let descs = [
        ImageDesc::new_2d(16, 16, Format::Rgba8Unorm, ImageUsage::SAMPLED),
        ImageDesc::new_2d(64, 64, Format::Rgba8Unorm, ImageUsage::SAMPLED),
    ];
    let mut textures = manager.create_textures(&descs, Some(&sampler_desc())).unwrap();

    assert_eq!(textures.len(), 2);
    assert_eq!(textures[0].sampler, textures[1].sampler);
    assert_eq!(backend.live_image_count(), 2);
    assert_eq!(backend.live_memory_count(), 1);
    assert_eq!(backend.live_sampler_count(), 1);

    manager.destroy_texture(&mut textures[0]);
    assert_eq!(backend.live_sampler_count(), 1);
    manager.destroy_texture(&mut textures[1]);
    assert_eq!(backend.live_sampler_count(), 0);
    assert_eq!(backend.live_image_count(), 0);
}

#[test]
fn texture_rolls_back_when_sampler_creation_fails() {
    let (backend, _copy, mut manager) = setup();

    let desc = ImageDesc::new_2d(16, 16, Format::Rgba8Unorm, ImageUsage::SAMPLED);
    backend.fail_next_sampler();
    let err = manager
        .create_texture(&desc, Some(&sampler_desc()))
        .unwrap_err();
    assert!(matches!(err, LucentError::ObjectCreateFailed(_)));

    // Neither the image nor its view survive the failed creation.
    assert_eq!(manager.tracked_image_count(), 0);
    assert_eq!(backend.live_image_count(), 0);
    assert_eq!(backend.live_view_count(), 0);
    assert_eq!(backend.live_memory_count(), 0);
}

#[test]
fn texture_without_sampler_request_gets_none() {
    let (backend, _copy, mut manager) = setup();

    let desc = ImageDesc::new_2d(16, 16, Format::Rgba8Unorm, ImageUsage::SAMPLED);
    let texture = manager.create_texture(&desc, None).unwrap();
    assert!(texture.sampler.is_none());
    assert_eq!(backend.live_sampler_count(), 0);
}

// ============================================================================
// Sampler pool
// ============================================================================

#[test]
fn identical_sampler_descriptions_share_one_device_sampler() {
    let (backend, _copy, mut manager) = setup();

    let first = manager.create_sampler(&sampler_desc()).unwrap();
    let second = manager.create_sampler(&sampler_desc()).unwrap();
    assert_eq!(first, second);
    assert_eq!(backend.live_sampler_count(), 1);

    let different = manager
        .create_sampler(&SamplerDesc {
            max_anisotropy: 16,
            ..sampler_desc()
        })
        .unwrap();
    assert_ne!(first, different);
    assert_eq!(backend.live_sampler_count(), 2);
}

#[test]
fn pooled_sampler_survives_until_its_last_user() {
    let (backend, _copy, mut manager) = setup();

    let desc = ImageDesc::new_2d(8, 8, Format::Rgba8Unorm, ImageUsage::SAMPLED);
    let mut tex_a = manager.create_texture(&desc, Some(&sampler_desc())).unwrap();
    let mut tex_b = manager.create_texture(&desc, Some(&sampler_desc())).unwrap();
    assert_eq!(tex_a.sampler, tex_b.sampler);
    assert_eq!(backend.live_sampler_count(), 1);

    manager.destroy_texture(&mut tex_a);
    assert_eq!(backend.live_sampler_count(), 1);

    manager.destroy_texture(&mut tex_b);
    assert_eq!(backend.live_sampler_count(), 0);
}

// ============================================================================
// Cleanup
// ============================================================================

#[test]
fn cleanup_drains_everything() {
    let (backend, _copy, mut manager) = setup();

    manager
        .create_buffer(
            512,
            BufferUsage::STORAGE,
            MemoryProps::DEVICE_LOCAL,
            AllocFlags::empty(),
        )
        .unwrap();
    let desc = ImageDesc::new_2d(32, 32, Format::Rgba8Unorm, ImageUsage::SAMPLED);
    manager.create_texture(&desc, Some(&sampler_desc())).unwrap();

    manager.cleanup();
    assert_eq!(manager.tracked_buffer_count(), 0);
    assert_eq!(manager.tracked_image_count(), 0);
    assert_eq!(backend.live_buffer_count(), 0);
    assert_eq!(backend.live_image_count(), 0);
    assert_eq!(backend.live_memory_count(), 0);
    assert_eq!(backend.live_sampler_count(), 0);

    // Second cleanup is a no-op.
    manager.cleanup();
    assert_eq!(backend.live_memory_count(), 0);
}

#[test]
fn drop_behaves_like_cleanup() {
    let (backend, _copy, mut manager) = setup();

    manager
        .create_buffer(
            128,
            BufferUsage::UNIFORM,
            MemoryProps::DEVICE_LOCAL,
            AllocFlags::empty(),
        )
        .unwrap();
    assert_eq!(backend.live_buffer_count(), 1);

    drop(manager);
    assert_eq!(backend.live_buffer_count(), 0);
    assert_eq!(backend.live_memory_count(), 0);
}
