//! The build/update state machine.

use std::sync::Arc;

use crate::alloc::{AllocRequest, AllocationId, SharedAllocator};
use crate::backend::{
    AccelBuildDesc, AccelKind, Access, AllocFlags, BufferHandle, BufferUsage, BuildFlags,
    BuildMode, BuildRange, DeviceAddress, DeviceSize, GeometryData, GpuBackend, MemoryProps,
    PipelineStage,
};
use crate::errors::{LucentError, Result};

use super::{AccelStructure, BlasInput};

const SCRATCH_USAGE: BufferUsage =
    BufferUsage::STORAGE.union(BufferUsage::SHADER_DEVICE_ADDRESS);
const ACCEL_BUFFER_USAGE: BufferUsage =
    BufferUsage::ACCEL_STORAGE.union(BufferUsage::SHADER_DEVICE_ADDRESS);

/// Transient build scratch; created and released inside one build call.
struct ScratchBuffer {
    buffer: BufferHandle,
    alloc: AllocationId,
    address: DeviceAddress,
}

/// Builds and refits acceleration structures against one queue,
/// synchronously: every build call records, submits and waits before
/// returning.
pub struct AccelBuilder {
    backend: Arc<dyn GpuBackend>,
    allocator: SharedAllocator,

    blas: Vec<AccelStructure>,
    blas_inputs: Vec<BlasInput>,
    /// One shared block behind every BLAS backing buffer of the last batch.
    blas_alloc: Option<AllocationId>,
    total_blas_size: DeviceSize,

    tlas: Option<AccelStructure>,
    tlas_alloc: Option<AllocationId>,
    /// Instance count of the original TLAS build; refits may not exceed it.
    tlas_capacity: u32,
}

impl AccelBuilder {
    #[must_use]
    pub fn new(backend: Arc<dyn GpuBackend>, allocator: SharedAllocator) -> Self {
        Self {
            backend,
            allocator,
            blas: Vec::new(),
            blas_inputs: Vec::new(),
            blas_alloc: None,
            total_blas_size: 0,
            tlas: None,
            tlas_alloc: None,
            tlas_capacity: 0,
        }
    }

    // ------------------------------------------------------------------
    // Accessors, consumed by the downstream renderer
    // ------------------------------------------------------------------

    #[must_use]
    pub fn blas_count(&self) -> usize {
        self.blas.len()
    }

    #[must_use]
    pub fn blas(&self, index: usize) -> Option<&AccelStructure> {
        self.blas.get(index)
    }

    /// Device address of one bottom-level structure, 0 if out of range.
    #[must_use]
    pub fn blas_device_address(&self, index: usize) -> DeviceAddress {
        self.blas.get(index).map_or(0, |b| b.device_address)
    }

    #[must_use]
    pub fn tlas(&self) -> Option<&AccelStructure> {
        self.tlas.as_ref()
    }

    /// Device address of the top-level structure, 0 before the first build.
    #[must_use]
    pub fn tlas_device_address(&self) -> DeviceAddress {
        self.tlas.as_ref().map_or(0, |t| t.device_address)
    }

    /// Backing-store size of the last BLAS batch: the per-structure sizes
    /// plus the alignment padding between them, as held by the shared block.
    #[must_use]
    pub fn total_blas_size(&self) -> DeviceSize {
        self.total_blas_size
    }

    // ------------------------------------------------------------------
    // BLAS batch build
    // ------------------------------------------------------------------

    /// Build one bottom-level structure per input, all backing buffers
    /// packed into a single allocation, scratch shared serially across the
    /// batch. A previous batch is torn down first.
    pub fn build_blas(&mut self, inputs: Vec<BlasInput>, common_flags: BuildFlags) -> Result<()> {
        if inputs.is_empty() {
            return Err(LucentError::EmptyBatch);
        }
        if !self.blas.is_empty() {
            self.destroy_blas_batch();
        }

        let count = inputs.len();
        let mut buffers = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        let mut max_scratch: DeviceSize = 0;

        for input in &inputs {
            let sizes = self.backend.accel_build_sizes(
                AccelKind::BottomLevel,
                common_flags | input.flags,
                &input.geometries,
                &input.primitive_counts(),
            );
            max_scratch = max_scratch.max(sizes.build_scratch_size);

            let buffer = match self.backend.create_buffer(sizes.accel_size, ACCEL_BUFFER_USAGE) {
                Ok((buffer, _)) => buffer,
                Err(err) => {
                    self.destroy_partial(&handles, &buffers);
                    return Err(err);
                }
            };
            buffers.push(buffer);
            match self
                .backend
                .create_accel(AccelKind::BottomLevel, buffer, sizes.accel_size)
            {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    self.destroy_partial(&handles, &buffers);
                    return Err(err);
                }
            }
        }

        let alloc = match self.allocator.borrow_mut().allocate_buffers(
            MemoryProps::DEVICE_LOCAL,
            AllocFlags::DEVICE_ADDRESS,
            &buffers,
        ) {
            Ok(id) => id,
            Err(err) => {
                self.destroy_partial(&handles, &buffers);
                return Err(err);
            }
        };
        // The shared block is the padded aggregate of the per-structure
        // sizes, so report its actual extent rather than the raw sum.
        let total_size = self
            .allocator
            .borrow()
            .block(alloc)
            .map_or(0, |block| block.size);

        self.blas = handles
            .iter()
            .zip(&buffers)
            .map(|(&handle, &buffer)| AccelStructure {
                handle,
                buffer,
                device_address: self.backend.accel_device_address(handle),
            })
            .collect();
        self.blas_alloc = Some(alloc);
        self.total_blas_size = total_size;
        self.blas_inputs = inputs;

        let scratch = self.alloc_scratch(max_scratch)?;

        let cmds = match self.backend.create_command_buffers(count) {
            Ok(cmds) => cmds,
            Err(err) => {
                self.free_scratch(scratch);
                return Err(err);
            }
        };
        for (index, input) in self.blas_inputs.iter().enumerate() {
            let cmd = cmds[index];
            self.backend.cmd_build_accel(
                cmd,
                &AccelBuildDesc {
                    kind: AccelKind::BottomLevel,
                    mode: BuildMode::Build,
                    flags: common_flags | input.flags,
                    src: crate::backend::AccelHandle::NULL,
                    dst: self.blas[index].handle,
                    geometries: &input.geometries,
                    ranges: &input.ranges,
                    scratch: scratch.address,
                },
            );
            // Promote the freshly written structure from write-visible to
            // read-visible before the next build reuses the scratch buffer.
            self.backend.cmd_memory_barrier(
                cmd,
                PipelineStage::ACCEL_BUILD,
                PipelineStage::ACCEL_BUILD,
                Access::ACCEL_WRITE,
                Access::ACCEL_READ,
            );
        }

        let submitted = self.backend.submit_and_wait(&cmds);
        self.backend.free_command_buffers(&cmds);
        self.free_scratch(scratch);
        submitted
    }

    // ------------------------------------------------------------------
    // TLAS build / refit
    // ------------------------------------------------------------------

    /// Build (or refit, when `update` is set) the top-level structure over
    /// `instance_count` instance records starting at `buffer_offset` inside
    /// `instance_buffer`.
    ///
    /// A refit reuses the existing structure as both source and destination
    /// and preserves its handle and device address. Refitting with more
    /// instances than the original build fails with
    /// [`LucentError::RefitCapacityExceeded`] before any device work.
    pub fn build_tlas(
        &mut self,
        instance_count: u32,
        instance_buffer: BufferHandle,
        buffer_offset: DeviceSize,
        flags: BuildFlags,
        update: bool,
    ) -> Result<()> {
        if update {
            if self.tlas.is_none() {
                return Err(LucentError::RefitWithoutBuild);
            }
            if instance_count > self.tlas_capacity {
                return Err(LucentError::RefitCapacityExceeded {
                    requested: instance_count as usize,
                    capacity: self.tlas_capacity as usize,
                });
            }
        }

        let base = self.backend.buffer_device_address(instance_buffer);
        if base == 0 {
            return Err(LucentError::UnknownHandle(format!("{instance_buffer:?}")));
        }
        let geometries = [GeometryData::Instances {
            address: base + buffer_offset,
            count: instance_count,
        }];
        let ranges = [BuildRange::from_count(instance_count)];

        let sizes = self.backend.accel_build_sizes(
            AccelKind::TopLevel,
            flags,
            &geometries,
            &[instance_count],
        );

        if !update {
            self.destroy_tlas();

            let (buffer, _) = self
                .backend
                .create_buffer(sizes.accel_size, ACCEL_BUFFER_USAGE)?;
            let alloc = match self.allocator.borrow_mut().allocate_buffers(
                MemoryProps::DEVICE_LOCAL,
                AllocFlags::DEVICE_ADDRESS,
                std::slice::from_ref(&buffer),
            ) {
                Ok(id) => id,
                Err(err) => {
                    self.backend.destroy_buffer(buffer);
                    return Err(err);
                }
            };
            let handle = match self
                .backend
                .create_accel(AccelKind::TopLevel, buffer, sizes.accel_size)
            {
                Ok(handle) => handle,
                Err(err) => {
                    self.allocator.borrow_mut().free(alloc);
                    self.backend.destroy_buffer(buffer);
                    return Err(err);
                }
            };

            self.tlas = Some(AccelStructure {
                handle,
                buffer,
                device_address: self.backend.accel_device_address(handle),
            });
            self.tlas_alloc = Some(alloc);
            self.tlas_capacity = instance_count;
        }

        let tlas = self.tlas.as_ref().expect("TLAS exists past this point");
        let scratch_size = if update {
            sizes.update_scratch_size
        } else {
            sizes.build_scratch_size
        };
        let scratch = self.alloc_scratch(scratch_size)?;

        let cmds = match self.backend.create_command_buffers(1) {
            Ok(cmds) => cmds,
            Err(err) => {
                self.free_scratch(scratch);
                return Err(err);
            }
        };
        self.backend.cmd_build_accel(
            cmds[0],
            &AccelBuildDesc {
                kind: AccelKind::TopLevel,
                mode: if update { BuildMode::Update } else { BuildMode::Build },
                flags,
                src: if update {
                    tlas.handle
                } else {
                    crate::backend::AccelHandle::NULL
                },
                dst: tlas.handle,
                geometries: &geometries,
                ranges: &ranges,
                scratch: scratch.address,
            },
        );
        self.backend.cmd_memory_barrier(
            cmds[0],
            PipelineStage::ACCEL_BUILD,
            PipelineStage::ACCEL_BUILD,
            Access::ACCEL_WRITE,
            Access::ACCEL_READ,
        );

        let submitted = self.backend.submit_and_wait(&cmds);
        self.backend.free_command_buffers(&cmds);
        self.free_scratch(scratch);
        submitted
    }

    // ------------------------------------------------------------------
    // Single-BLAS update
    // ------------------------------------------------------------------

    /// Refit one existing bottom-level structure in place against new
    /// geometry data, with scratch sized for this structure alone.
    pub fn update_blas(&mut self, index: usize, input: BlasInput, flags: BuildFlags) -> Result<()> {
        let Some(target) = self.blas.get(index) else {
            return Err(LucentError::UnknownBlas {
                index,
                count: self.blas.len(),
            });
        };
        let target = *target;

        let sizes = self.backend.accel_build_sizes(
            AccelKind::BottomLevel,
            flags,
            &input.geometries,
            &input.primitive_counts(),
        );
        let scratch = self.alloc_scratch(sizes.update_scratch_size)?;

        let cmds = match self.backend.create_command_buffers(1) {
            Ok(cmds) => cmds,
            Err(err) => {
                self.free_scratch(scratch);
                return Err(err);
            }
        };
        self.backend.cmd_build_accel(
            cmds[0],
            &AccelBuildDesc {
                kind: AccelKind::BottomLevel,
                mode: BuildMode::Update,
                flags,
                src: target.handle,
                dst: target.handle,
                geometries: &input.geometries,
                ranges: &input.ranges,
                scratch: scratch.address,
            },
        );
        self.backend.cmd_memory_barrier(
            cmds[0],
            PipelineStage::ACCEL_BUILD,
            PipelineStage::ACCEL_BUILD,
            Access::ACCEL_WRITE,
            Access::ACCEL_READ,
        );

        let submitted = self.backend.submit_and_wait(&cmds);
        self.backend.free_command_buffers(&cmds);
        self.free_scratch(scratch);
        submitted?;

        self.blas_inputs[index] = input;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Destroy every structure and backing allocation. Idempotent.
    pub fn destroy(&mut self) {
        self.destroy_blas_batch();
        self.destroy_tlas();
    }

    /// Tear down structures and buffers of a batch that never reached a
    /// usable state.
    fn destroy_partial(&self, handles: &[crate::backend::AccelHandle], buffers: &[BufferHandle]) {
        for &handle in handles {
            self.backend.destroy_accel(handle);
        }
        for &buffer in buffers {
            self.backend.destroy_buffer(buffer);
        }
    }

    fn destroy_blas_batch(&mut self) {
        for blas in self.blas.drain(..) {
            self.backend.destroy_accel(blas.handle);
            self.backend.destroy_buffer(blas.buffer);
        }
        if let Some(alloc) = self.blas_alloc.take() {
            self.allocator.borrow_mut().free(alloc);
        }
        self.blas_inputs.clear();
        self.total_blas_size = 0;
    }

    fn destroy_tlas(&mut self) {
        if let Some(tlas) = self.tlas.take() {
            self.backend.destroy_accel(tlas.handle);
            self.backend.destroy_buffer(tlas.buffer);
        }
        if let Some(alloc) = self.tlas_alloc.take() {
            self.allocator.borrow_mut().free(alloc);
        }
        self.tlas_capacity = 0;
    }

    // ------------------------------------------------------------------
    // Scratch
    // ------------------------------------------------------------------

    fn alloc_scratch(&self, size: DeviceSize) -> Result<ScratchBuffer> {
        let (buffer, requirements) = self.backend.create_buffer(size, SCRATCH_USAGE)?;

        let mut allocator = self.allocator.borrow_mut();
        let alloc = match allocator.allocate(
            &AllocRequest::new(requirements, MemoryProps::DEVICE_LOCAL)
                .with_flags(AllocFlags::DEVICE_ADDRESS),
        ) {
            Ok(id) => id,
            Err(err) => {
                self.backend.destroy_buffer(buffer);
                return Err(err);
            }
        };

        let block = allocator
            .block(alloc)
            .expect("freshly allocated id resolves to a block");
        if let Err(err) = self
            .backend
            .bind_buffer_memory(buffer, block.memory, block.offset)
        {
            allocator.free(alloc);
            self.backend.destroy_buffer(buffer);
            return Err(err);
        }
        drop(allocator);

        Ok(ScratchBuffer {
            buffer,
            alloc,
            address: self.backend.buffer_device_address(buffer),
        })
    }

    fn free_scratch(&self, scratch: ScratchBuffer) {
        self.backend.destroy_buffer(scratch.buffer);
        self.allocator.borrow_mut().free(scratch.alloc);
    }
}

impl Drop for AccelBuilder {
    fn drop(&mut self) {
        self.destroy();
    }
}
