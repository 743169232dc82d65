//! Acceleration Structure Builder Tests
//!
//! Tests for:
//! - BLAS batch builds: one structure per input, one shared backing
//!   allocation, scratch released before returning
//! - TLAS build and refit: handle/address stability across refits,
//!   capacity enforcement, refit-before-build rejection
//! - Single-BLAS refits and full teardown
//! - AccelInstance record layout

use std::sync::Arc;

use lucent::accel::{AccelBuilder, BlasInput};
use lucent::alloc::{self, SharedAllocator};
use lucent::backend::{
    AccelInstance, BufferHandle, BufferUsage, BuildFlags, GpuBackend, TriangleGeometry,
};
use lucent::{DedicatedAllocator, LucentError, NullBackend};

fn setup() -> (Arc<NullBackend>, AccelBuilder) {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = Arc::new(NullBackend::new());
    let allocator: SharedAllocator = alloc::share(DedicatedAllocator::new(backend.clone()));
    let builder = AccelBuilder::new(backend.clone(), allocator);
    (backend, builder)
}

fn triangles(primitive_count: u32) -> BlasInput {
    BlasInput::triangles(
        TriangleGeometry {
            vertex_address: 0x1000,
            vertex_stride: 12,
            max_vertex: primitive_count * 3,
            index_address: 0,
        },
        primitive_count,
    )
}

/// Instance buffer with a valid device address, as the TLAS path requires.
fn instance_buffer(backend: &NullBackend, count: u64) -> BufferHandle {
    let size = count * std::mem::size_of::<AccelInstance>() as u64;
    let (buffer, _) = backend
        .create_buffer(
            size,
            BufferUsage::ACCEL_BUILD_INPUT | BufferUsage::SHADER_DEVICE_ADDRESS,
        )
        .unwrap();
    buffer
}

// ============================================================================
// BLAS batch
// ============================================================================

#[test]
fn blas_batch_builds_one_structure_per_input() {
    let (backend, mut builder) = setup();

    builder
        .build_blas(
            vec![triangles(10), triangles(20), triangles(30)],
            BuildFlags::PREFER_FAST_TRACE,
        )
        .unwrap();

    assert_eq!(builder.blas_count(), 3);
    for index in 0..3 {
        let blas = builder.blas(index).unwrap();
        assert!(!blas.handle.is_null());
        assert_ne!(blas.device_address, 0);
        assert_eq!(backend.accel_build_generation(blas.handle), 1);
    }

    // Distinct structures, distinct addresses.
    assert_ne!(builder.blas_device_address(0), builder.blas_device_address(1));
    assert_ne!(builder.blas_device_address(1), builder.blas_device_address(2));

    // Backing sizes 896/1536/2176 packed at 256-byte alignment land at
    // offsets {0, 1024, 2560}; the shared block pads out to 4864, and the
    // reported total is that padded aggregate, not the raw sum.
    assert_eq!(builder.total_blas_size(), 4864);

    // Whole batch went down in one submission.
    assert_eq!(backend.submit_count(), 1);
}

#[test]
fn blas_batch_shares_one_allocation_and_frees_scratch() {
    let (backend, mut builder) = setup();

    builder
        .build_blas(vec![triangles(8), triangles(8)], BuildFlags::empty())
        .unwrap();

    // One block behind every backing buffer; the scratch allocation made
    // during the build is gone by the time the call returns.
    assert_eq!(backend.live_memory_count(), 1);
}

#[test]
fn blas_empty_batch_is_rejected() {
    let (backend, mut builder) = setup();

    assert!(matches!(
        builder.build_blas(Vec::new(), BuildFlags::empty()),
        Err(LucentError::EmptyBatch)
    ));
    assert_eq!(builder.blas_count(), 0);
    assert_eq!(backend.submit_count(), 0);
}

#[test]
fn blas_rebuild_replaces_the_previous_batch() {
    let (backend, mut builder) = setup();

    builder
        .build_blas(vec![triangles(4), triangles(4), triangles(4)], BuildFlags::empty())
        .unwrap();
    let old_handle = builder.blas(0).unwrap().handle;

    builder
        .build_blas(vec![triangles(16)], BuildFlags::empty())
        .unwrap();

    assert_eq!(builder.blas_count(), 1);
    assert_eq!(backend.accel_build_generation(old_handle), 0);
    assert_eq!(backend.live_memory_count(), 1);
}

#[test]
fn blas_update_refits_in_place() {
    let (backend, mut builder) = setup();

    builder
        .build_blas(
            vec![triangles(10).with_flags(BuildFlags::ALLOW_UPDATE)],
            BuildFlags::empty(),
        )
        .unwrap();
    let handle = builder.blas(0).unwrap().handle;
    let address = builder.blas_device_address(0);

    builder
        .update_blas(0, triangles(10), BuildFlags::ALLOW_UPDATE)
        .unwrap();

    assert_eq!(builder.blas(0).unwrap().handle, handle);
    assert_eq!(builder.blas_device_address(0), address);
    assert_eq!(backend.accel_build_generation(handle), 2);
    // Update scratch was transient as well.
    assert_eq!(backend.live_memory_count(), 1);
}

#[test]
fn blas_scratch_is_reclaimed_when_command_allocation_fails() {
    let (backend, mut builder) = setup();

    backend.fail_next_command_buffers();
    let err = builder
        .build_blas(vec![triangles(8)], BuildFlags::empty())
        .unwrap_err();
    assert!(matches!(err, LucentError::ObjectCreateFailed(_)));

    // The batch backing block survives; the scratch allocation does not.
    assert_eq!(backend.live_memory_count(), 1);
    assert_eq!(backend.submit_count(), 0);
}

#[test]
fn blas_update_scratch_is_reclaimed_when_command_allocation_fails() {
    let (backend, mut builder) = setup();

    builder
        .build_blas(
            vec![triangles(8).with_flags(BuildFlags::ALLOW_UPDATE)],
            BuildFlags::empty(),
        )
        .unwrap();

    backend.fail_next_command_buffers();
    let err = builder
        .update_blas(0, triangles(8), BuildFlags::ALLOW_UPDATE)
        .unwrap_err();
    assert!(matches!(err, LucentError::ObjectCreateFailed(_)));
    assert_eq!(backend.live_memory_count(), 1);
}

#[test]
fn blas_update_out_of_range_is_rejected() {
    let (_backend, mut builder) = setup();

    let err = builder
        .update_blas(3, triangles(4), BuildFlags::empty())
        .unwrap_err();
    assert!(matches!(err, LucentError::UnknownBlas { index: 3, count: 0 }));
}

// ============================================================================
// TLAS build and refit
// ============================================================================

#[test]
fn tlas_build_then_refit_preserves_the_structure() {
    let (backend, mut builder) = setup();
    let instances = instance_buffer(&backend, 4);

    builder
        .build_tlas(4, instances, 0, BuildFlags::ALLOW_UPDATE, false)
        .unwrap();
    let tlas = *builder.tlas().unwrap();
    assert_ne!(tlas.device_address, 0);
    assert_eq!(backend.accel_build_generation(tlas.handle), 1);

    // Refit with fewer instances: same structure, one more executed build.
    builder
        .build_tlas(2, instances, 0, BuildFlags::ALLOW_UPDATE, true)
        .unwrap();
    let refitted = *builder.tlas().unwrap();
    assert_eq!(refitted.handle, tlas.handle);
    assert_eq!(refitted.device_address, tlas.device_address);
    assert_eq!(backend.accel_build_generation(tlas.handle), 2);
}

#[test]
fn tlas_refit_over_capacity_fails_before_device_work() {
    let (backend, mut builder) = setup();
    let instances = instance_buffer(&backend, 16);

    builder
        .build_tlas(4, instances, 0, BuildFlags::ALLOW_UPDATE, false)
        .unwrap();
    let submits = backend.submit_count();

    let err = builder
        .build_tlas(8, instances, 0, BuildFlags::ALLOW_UPDATE, true)
        .unwrap_err();
    assert!(matches!(
        err,
        LucentError::RefitCapacityExceeded {
            requested: 8,
            capacity: 4,
        }
    ));
    assert_eq!(backend.submit_count(), submits);
}

#[test]
fn tlas_refit_without_build_is_rejected() {
    let (backend, mut builder) = setup();
    let instances = instance_buffer(&backend, 4);

    assert!(matches!(
        builder.build_tlas(4, instances, 0, BuildFlags::ALLOW_UPDATE, true),
        Err(LucentError::RefitWithoutBuild)
    ));
    assert_eq!(backend.submit_count(), 0);
}

#[test]
fn tlas_rebuild_resets_capacity() {
    let (backend, mut builder) = setup();
    let instances = instance_buffer(&backend, 16);

    builder
        .build_tlas(4, instances, 0, BuildFlags::ALLOW_UPDATE, false)
        .unwrap();
    // A full rebuild with a larger count raises the refit ceiling.
    builder
        .build_tlas(16, instances, 0, BuildFlags::ALLOW_UPDATE, false)
        .unwrap();
    builder
        .build_tlas(16, instances, 0, BuildFlags::ALLOW_UPDATE, true)
        .unwrap();
    assert_eq!(backend.submit_count(), 3);
}

#[test]
fn tlas_scratch_is_reclaimed_when_command_allocation_fails() {
    let (backend, mut builder) = setup();
    let instances = instance_buffer(&backend, 4);

    backend.fail_next_command_buffers();
    let err = builder
        .build_tlas(4, instances, 0, BuildFlags::empty(), false)
        .unwrap_err();
    assert!(matches!(err, LucentError::ObjectCreateFailed(_)));

    // Only the TLAS backing block remains allocated.
    assert_eq!(backend.live_memory_count(), 1);
    assert_eq!(backend.submit_count(), 0);
}

#[test]
fn tlas_build_rejects_unknown_instance_buffer() {
    let (_backend, mut builder) = setup();

    let err = builder
        .build_tlas(4, BufferHandle::NULL, 0, BuildFlags::empty(), false)
        .unwrap_err();
    assert!(matches!(err, LucentError::UnknownHandle(_)));
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn destroy_releases_every_structure_and_allocation() {
    let (backend, mut builder) = setup();
    let instances = instance_buffer(&backend, 4);

    builder
        .build_blas(vec![triangles(10), triangles(20)], BuildFlags::empty())
        .unwrap();
    builder
        .build_tlas(4, instances, 0, BuildFlags::empty(), false)
        .unwrap();
    assert!(backend.live_memory_count() > 0);

    builder.destroy();
    assert_eq!(builder.blas_count(), 0);
    assert!(builder.tlas().is_none());
    assert_eq!(backend.live_memory_count(), 0);

    // Idempotent.
    builder.destroy();
    assert_eq!(backend.live_memory_count(), 0);
}

#[test]
fn drop_tears_down_like_destroy() {
    let (backend, mut builder) = setup();

    builder
        .build_blas(vec![triangles(10)], BuildFlags::empty())
        .unwrap();
    assert_eq!(backend.live_memory_count(), 1);

    drop(builder);
    assert_eq!(backend.live_memory_count(), 0);
}

// ============================================================================
// Instance records
// ============================================================================

#[test]
fn instance_record_layout_matches_the_wire_format() {
    assert_eq!(std::mem::size_of::<AccelInstance>(), 64);

    let instance = AccelInstance::new(glam::Mat4::IDENTITY, 7, 0xff, 0xdead_0000);
    assert_eq!(instance.transform[0], [1.0, 0.0, 0.0, 0.0]);
    assert_eq!(instance.transform[1], [0.0, 1.0, 0.0, 0.0]);
    assert_eq!(instance.transform[2], [0.0, 0.0, 1.0, 0.0]);
    assert_eq!(instance.custom_index_and_mask, 0xff00_0007);
    assert_eq!(instance.blas_address, 0xdead_0000);

    // Pod: the record can go straight into an upload buffer.
    let bytes: &[u8] = bytemuck::bytes_of(&instance);
    assert_eq!(bytes.len(), 64);
}
