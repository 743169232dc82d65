//! Headless device backend
//!
//! Simulates the narrow device surface of [`GpuBackend`] entirely on the
//! host: allocations are plain byte vectors, handles come from one monotonic
//! counter, device addresses are fabricated but unique and non-zero, and
//! recorded build commands only take effect when `submit_and_wait` runs.
//!
//! This is what the test suite runs against, and what embedders can use for
//! dry runs on machines without a capable device. The size model for
//! acceleration structures is deterministic: sizes grow linearly with the
//! primitive count, so offset and padding arithmetic is exercised with
//! realistic-looking numbers.

use std::cell::RefCell;
use std::ptr::NonNull;

use rustc_hash::FxHashMap;

use crate::errors::{LucentError, Result};

use super::types::{
    AccelBuildDesc, AccelHandle, AccelKind, Access, AllocFlags, BufferHandle, BufferUsage,
    BuildFlags, BuildMode, BuildSizes, CommandBuffer, DedicatedResource, DeviceAddress,
    DeviceSize, GeometryData, ImageDesc, ImageHandle, ImageViewHandle, MemoryHandle, MemoryProps,
    MemoryRequirements, PipelineStage, SamplerDesc, SamplerHandle,
};
use super::GpuBackend;

const DEFAULT_BUFFER_ALIGNMENT: DeviceSize = 256;
const DEFAULT_IMAGE_ALIGNMENT: DeviceSize = 4096;
const DEFAULT_TYPE_BITS: u32 = 0b1;

struct MemoryObj {
    size: DeviceSize,
    // Heap storage never resizes after allocation, so mapped pointers into it
    // stay valid until the allocation is freed.
    data: Vec<u8>,
    mapped: bool,
}

struct BufferObj {
    requirements: MemoryRequirements,
    usage: BufferUsage,
    bound: Option<(MemoryHandle, DeviceSize)>,
    address: DeviceAddress,
}

struct ImageObj {
    requirements: MemoryRequirements,
    bound: Option<(MemoryHandle, DeviceSize)>,
}

struct AccelObj {
    kind: AccelKind,
    buffer: BufferHandle,
    size: DeviceSize,
    address: DeviceAddress,
    /// Number of executed builds/updates targeting this structure.
    generation: u64,
}

enum RecordedCmd {
    Build {
        kind: AccelKind,
        mode: BuildMode,
        src: AccelHandle,
        dst: AccelHandle,
    },
    Barrier,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    next_address: DeviceAddress,
    memory: FxHashMap<u64, MemoryObj>,
    buffers: FxHashMap<u64, BufferObj>,
    images: FxHashMap<u64, ImageObj>,
    views: FxHashMap<u64, u64>,
    samplers: FxHashMap<u64, SamplerDesc>,
    accels: FxHashMap<u64, AccelObj>,
    commands: FxHashMap<u64, Vec<RecordedCmd>>,
    forced_type_bits: Option<u32>,
    fail_next_sampler: bool,
    fail_next_command_buffers: bool,
    submit_count: u64,
}

impl State {
    fn fresh_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn fresh_address(&mut self, span: DeviceSize) -> DeviceAddress {
        let addr = self.next_address;
        self.next_address += span.max(1).next_multiple_of(256);
        addr
    }
}

/// A [`GpuBackend`] without a GPU.
pub struct NullBackend {
    state: RefCell<State>,
    buffer_alignment: DeviceSize,
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NullBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::with_buffer_alignment(DEFAULT_BUFFER_ALIGNMENT)
    }

    /// A backend whose buffers report the given placement alignment.
    #[must_use]
    pub fn with_buffer_alignment(alignment: DeviceSize) -> Self {
        assert!(alignment.is_power_of_two(), "alignment must be a power of two");
        let state = State {
            next_address: 0x0010_0000,
            ..State::default()
        };
        Self {
            state: RefCell::new(state),
            buffer_alignment: alignment,
        }
    }

    /// Force the memory-type mask reported for the next created buffer.
    /// Used to provoke the batched-allocation compatibility check.
    pub fn force_next_buffer_type_bits(&self, type_bits: u32) {
        self.state.borrow_mut().forced_type_bits = Some(type_bits);
    }

    /// Make the next sampler creation fail, to exercise rollback paths.
    pub fn fail_next_sampler(&self) {
        self.state.borrow_mut().fail_next_sampler = true;
    }

    /// Make the next command-buffer allocation fail, to exercise rollback
    /// paths.
    pub fn fail_next_command_buffers(&self) {
        self.state.borrow_mut().fail_next_command_buffers = true;
    }

    /// Number of physical allocations currently live.
    #[must_use]
    pub fn live_memory_count(&self) -> usize {
        self.state.borrow().memory.len()
    }

    /// Number of buffer objects currently live.
    #[must_use]
    pub fn live_buffer_count(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    /// Number of image objects currently live.
    #[must_use]
    pub fn live_image_count(&self) -> usize {
        self.state.borrow().images.len()
    }

    /// Number of image views currently live.
    #[must_use]
    pub fn live_view_count(&self) -> usize {
        self.state.borrow().views.len()
    }

    /// Number of sampler objects currently live.
    #[must_use]
    pub fn live_sampler_count(&self) -> usize {
        self.state.borrow().samplers.len()
    }

    /// Number of `submit_and_wait` calls executed so far.
    #[must_use]
    pub fn submit_count(&self) -> u64 {
        self.state.borrow().submit_count
    }

    /// How many executed builds have targeted `accel`. Zero until the first
    /// submit that contains a build for it.
    #[must_use]
    pub fn accel_build_generation(&self, accel: AccelHandle) -> u64 {
        self.state
            .borrow()
            .accels
            .get(&accel.0)
            .map_or(0, |a| a.generation)
    }
}

impl GpuBackend for NullBackend {
    fn allocate_memory(
        &self,
        size: DeviceSize,
        memory_type_bits: u32,
        properties: MemoryProps,
        _flags: AllocFlags,
        _dedicated: Option<DedicatedResource>,
    ) -> Result<MemoryHandle> {
        if memory_type_bits == 0 {
            return Err(LucentError::NoCompatibleMemoryType {
                type_bits: memory_type_bits,
                properties: properties.bits(),
            });
        }
        let mut state = self.state.borrow_mut();
        let handle = state.fresh_handle();
        state.memory.insert(
            handle,
            MemoryObj {
                size,
                data: vec![0u8; size as usize],
                mapped: false,
            },
        );
        Ok(MemoryHandle(handle))
    }

    fn free_memory(&self, memory: MemoryHandle) {
        self.state.borrow_mut().memory.remove(&memory.0);
    }

    fn map_memory(
        &self,
        memory: MemoryHandle,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<NonNull<u8>> {
        let mut state = self.state.borrow_mut();
        let Some(obj) = state.memory.get_mut(&memory.0) else {
            return Err(LucentError::MapFailed(format!(
                "unknown memory handle {memory:?}"
            )));
        };
        if offset + size > obj.size {
            return Err(LucentError::MapFailed(format!(
                "map range {offset}..{} exceeds allocation size {}",
                offset + size,
                obj.size
            )));
        }
        obj.mapped = true;
        // Safety: offset is within the vector, heap storage outlives the map.
        let ptr = unsafe { obj.data.as_mut_ptr().add(offset as usize) };
        NonNull::new(ptr).ok_or_else(|| LucentError::MapFailed("null host pointer".into()))
    }

    fn unmap_memory(&self, memory: MemoryHandle) {
        if let Some(obj) = self.state.borrow_mut().memory.get_mut(&memory.0) {
            obj.mapped = false;
        }
    }

    fn create_buffer(
        &self,
        size: DeviceSize,
        usage: BufferUsage,
    ) -> Result<(BufferHandle, MemoryRequirements)> {
        let mut state = self.state.borrow_mut();
        let type_bits = state.forced_type_bits.take().unwrap_or(DEFAULT_TYPE_BITS);
        let requirements = MemoryRequirements {
            size,
            alignment: self.buffer_alignment,
            memory_type_bits: type_bits,
        };
        let handle = state.fresh_handle();
        let address = state.fresh_address(size);
        state.buffers.insert(
            handle,
            BufferObj {
                requirements,
                usage,
                bound: None,
                address,
            },
        );
        Ok((BufferHandle(handle), requirements))
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        self.state.borrow_mut().buffers.remove(&buffer.0);
    }

    fn bind_buffer_memory(
        &self,
        buffer: BufferHandle,
        memory: MemoryHandle,
        offset: DeviceSize,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let Some(mem_size) = state.memory.get(&memory.0).map(|m| m.size) else {
            return Err(LucentError::BindFailed(format!(
                "unknown memory handle {memory:?}"
            )));
        };
        let Some(buf) = state.buffers.get_mut(&buffer.0) else {
            return Err(LucentError::BindFailed(format!(
                "unknown buffer handle {buffer:?}"
            )));
        };
        if buf.bound.is_some() {
            return Err(LucentError::BindFailed(format!(
                "buffer {buffer:?} is already bound"
            )));
        }
        if offset % buf.requirements.alignment != 0 {
            return Err(LucentError::BindFailed(format!(
                "offset {offset} violates alignment {}",
                buf.requirements.alignment
            )));
        }
        if offset + buf.requirements.size > mem_size {
            return Err(LucentError::BindFailed(format!(
                "bind range {offset}..{} exceeds allocation size {mem_size}",
                offset + buf.requirements.size
            )));
        }
        buf.bound = Some((memory, offset));
        Ok(())
    }

    fn buffer_device_address(&self, buffer: BufferHandle) -> DeviceAddress {
        self.state
            .borrow()
            .buffers
            .get(&buffer.0)
            .map_or(0, |b| b.address)
    }

    fn buffer_memory_requirements(&self, buffer: BufferHandle) -> Option<MemoryRequirements> {
        self.state
            .borrow()
            .buffers
            .get(&buffer.0)
            .map(|b| b.requirements)
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<(ImageHandle, MemoryRequirements)> {
        let mut state = self.state.borrow_mut();
        let texel_bytes = DeviceSize::from(desc.format.bytes_per_pixel());
        // Flat mip-0 footprint; a real device pads per mip level.
        let size = (DeviceSize::from(desc.width) * DeviceSize::from(desc.height) * texel_bytes)
            .next_multiple_of(DEFAULT_IMAGE_ALIGNMENT);
        let requirements = MemoryRequirements {
            size,
            alignment: DEFAULT_IMAGE_ALIGNMENT,
            memory_type_bits: DEFAULT_TYPE_BITS,
        };
        let handle = state.fresh_handle();
        state.images.insert(
            handle,
            ImageObj {
                requirements,
                bound: None,
            },
        );
        Ok((ImageHandle(handle), requirements))
    }

    fn destroy_image(&self, image: ImageHandle) {
        self.state.borrow_mut().images.remove(&image.0);
    }

    fn bind_image_memory(
        &self,
        image: ImageHandle,
        memory: MemoryHandle,
        offset: DeviceSize,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.memory.contains_key(&memory.0) {
            return Err(LucentError::BindFailed(format!(
                "unknown memory handle {memory:?}"
            )));
        }
        let Some(img) = state.images.get_mut(&image.0) else {
            return Err(LucentError::BindFailed(format!(
                "unknown image handle {image:?}"
            )));
        };
        if img.bound.is_some() {
            return Err(LucentError::BindFailed(format!(
                "image {image:?} is already bound"
            )));
        }
        img.bound = Some((memory, offset));
        Ok(())
    }

    fn image_memory_requirements(&self, image: ImageHandle) -> Option<MemoryRequirements> {
        self.state
            .borrow()
            .images
            .get(&image.0)
            .map(|i| i.requirements)
    }

    fn create_image_view(&self, image: ImageHandle, _desc: &ImageDesc) -> Result<ImageViewHandle> {
        let mut state = self.state.borrow_mut();
        if !state.images.contains_key(&image.0) {
            return Err(LucentError::ObjectCreateFailed(format!(
                "view over unknown image {image:?}"
            )));
        }
        let handle = state.fresh_handle();
        state.views.insert(handle, image.0);
        Ok(ImageViewHandle(handle))
    }

    fn destroy_image_view(&self, view: ImageViewHandle) {
        self.state.borrow_mut().views.remove(&view.0);
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerHandle> {
        let mut state = self.state.borrow_mut();
        if state.fail_next_sampler {
            state.fail_next_sampler = false;
            return Err(LucentError::ObjectCreateFailed(
                "sampler creation refused".into(),
            ));
        }
        let handle = state.fresh_handle();
        state.samplers.insert(handle, *desc);
        Ok(SamplerHandle(handle))
    }

    fn destroy_sampler(&self, sampler: SamplerHandle) {
        self.state.borrow_mut().samplers.remove(&sampler.0);
    }

    fn accel_build_sizes(
        &self,
        _kind: AccelKind,
        _flags: BuildFlags,
        geometries: &[GeometryData],
        max_primitive_counts: &[u32],
    ) -> BuildSizes {
        debug_assert_eq!(geometries.len(), max_primitive_counts.len());
        let prims: DeviceSize = max_primitive_counts.iter().map(|&c| DeviceSize::from(c)).sum();
        BuildSizes {
            accel_size: 256 + 64 * prims,
            build_scratch_size: 128 + 32 * prims,
            update_scratch_size: 64 + 16 * prims,
        }
    }

    fn create_accel(
        &self,
        kind: AccelKind,
        buffer: BufferHandle,
        size: DeviceSize,
    ) -> Result<AccelHandle> {
        let mut state = self.state.borrow_mut();
        if !state.buffers.contains_key(&buffer.0) {
            return Err(LucentError::ObjectCreateFailed(format!(
                "acceleration structure over unknown buffer {buffer:?}"
            )));
        }
        let handle = state.fresh_handle();
        let address = state.fresh_address(size);
        state.accels.insert(
            handle,
            AccelObj {
                kind,
                buffer,
                size,
                address,
                generation: 0,
            },
        );
        Ok(AccelHandle(handle))
    }

    fn destroy_accel(&self, accel: AccelHandle) {
        self.state.borrow_mut().accels.remove(&accel.0);
    }

    fn accel_device_address(&self, accel: AccelHandle) -> DeviceAddress {
        self.state
            .borrow()
            .accels
            .get(&accel.0)
            .map_or(0, |a| a.address)
    }

    fn create_command_buffers(&self, count: usize) -> Result<Vec<CommandBuffer>> {
        let mut state = self.state.borrow_mut();
        if state.fail_next_command_buffers {
            state.fail_next_command_buffers = false;
            return Err(LucentError::ObjectCreateFailed(
                "command buffer allocation refused".into(),
            ));
        }
        let mut cmds = Vec::with_capacity(count);
        for _ in 0..count {
            let handle = state.fresh_handle();
            state.commands.insert(handle, Vec::new());
            cmds.push(CommandBuffer(handle));
        }
        Ok(cmds)
    }

    fn cmd_build_accel(&self, cmd: CommandBuffer, desc: &AccelBuildDesc<'_>) {
        if let Some(recorded) = self.state.borrow_mut().commands.get_mut(&cmd.0) {
            recorded.push(RecordedCmd::Build {
                kind: desc.kind,
                mode: desc.mode,
                src: desc.src,
                dst: desc.dst,
            });
        }
    }

    fn cmd_memory_barrier(
        &self,
        cmd: CommandBuffer,
        _src_stage: PipelineStage,
        _dst_stage: PipelineStage,
        _src_access: Access,
        _dst_access: Access,
    ) {
        if let Some(recorded) = self.state.borrow_mut().commands.get_mut(&cmd.0) {
            recorded.push(RecordedCmd::Barrier);
        }
    }

    fn submit_and_wait(&self, cmds: &[CommandBuffer]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        for cmd in cmds {
            let recorded = state.commands.remove(&cmd.0).ok_or_else(|| {
                LucentError::SubmitFailed(format!("unknown command buffer {cmd:?}"))
            })?;
            for entry in &recorded {
                if let RecordedCmd::Build { kind, mode, src, dst } = entry {
                    if *mode == BuildMode::Update && src.is_null() {
                        return Err(LucentError::SubmitFailed(
                            "update build with null source structure".into(),
                        ));
                    }
                    let Some(accel) = state.accels.get_mut(&dst.0) else {
                        return Err(LucentError::SubmitFailed(format!(
                            "build targets unknown structure {dst:?}"
                        )));
                    };
                    debug_assert_eq!(accel.kind, *kind);
                    debug_assert!(accel.size > 0 && !accel.buffer.is_null());
                    accel.generation += 1;
                }
            }
            // Submitted command buffers are single-use; re-open empty.
            state.commands.insert(cmd.0, Vec::new());
        }
        state.submit_count += 1;
        Ok(())
    }

    fn free_command_buffers(&self, cmds: &[CommandBuffer]) {
        let mut state = self.state.borrow_mut();
        for cmd in cmds {
            state.commands.remove(&cmd.0);
        }
    }
}
