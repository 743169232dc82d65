//! Value types shared across the device interface.
//!
//! Handles are opaque `u64` newtypes; the zero value is reserved as the null
//! handle. Flag sets mirror the device-level bits the crate actually consumes,
//! nothing more.

use std::num::NonZeroU64;

use bytemuck::{Pod, Zeroable};

/// Byte size or byte offset on the device.
pub type DeviceSize = u64;

/// A GPU-visible pointer-like value into bound memory. Stable while the
/// backing allocation is neither freed nor moved. Zero is the null address.
pub type DeviceAddress = u64;

macro_rules! define_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(pub u64);

        impl $name {
            /// The null handle.
            pub const NULL: Self = Self(0);

            #[inline]
            #[must_use]
            pub fn is_null(self) -> bool {
                self.0 == 0
            }

            #[inline]
            #[must_use]
            pub fn from_raw(raw: NonZeroU64) -> Self {
                Self(raw.get())
            }
        }
    };
}

define_handle!(
    /// A physical device memory allocation.
    MemoryHandle
);
define_handle!(
    /// An opaque buffer object.
    BufferHandle
);
define_handle!(
    /// An opaque image object.
    ImageHandle
);
define_handle!(
    /// A view over an image.
    ImageViewHandle
);
define_handle!(
    /// A sampler object.
    SamplerHandle
);
define_handle!(
    /// An acceleration structure object.
    AccelHandle
);
define_handle!(
    /// A recorded command sequence.
    CommandBuffer
);

/// Memory requirements reported by the device for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    /// Required backing size in bytes.
    pub size: DeviceSize,
    /// Required placement alignment in bytes. Always a power of two.
    pub alignment: DeviceSize,
    /// Mask of memory types this resource can be bound to.
    pub memory_type_bits: u32,
}

bitflags::bitflags! {
    /// Buffer usage bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC          = 1 << 0;
        const TRANSFER_DST          = 1 << 1;
        const UNIFORM               = 1 << 2;
        const STORAGE               = 1 << 3;
        const INDEX                 = 1 << 4;
        const VERTEX                = 1 << 5;
        const SHADER_DEVICE_ADDRESS = 1 << 6;
        /// Backing store of an acceleration structure.
        const ACCEL_STORAGE         = 1 << 7;
        /// Read-only input to an acceleration structure build.
        const ACCEL_BUILD_INPUT     = 1 << 8;
    }

    /// Image usage bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC     = 1 << 0;
        const TRANSFER_DST     = 1 << 1;
        const SAMPLED          = 1 << 2;
        const STORAGE          = 1 << 3;
        const COLOR_ATTACHMENT = 1 << 4;
        const DEPTH_ATTACHMENT = 1 << 5;
    }

    /// Memory property bits requested for an allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemoryProps: u32 {
        const DEVICE_LOCAL  = 1 << 0;
        const HOST_VISIBLE  = 1 << 1;
        const HOST_COHERENT = 1 << 2;
        const HOST_CACHED   = 1 << 3;
    }

    /// Extra allocation behavior bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocFlags: u32 {
        /// The allocation must support device-address queries on bound buffers.
        const DEVICE_ADDRESS = 1 << 0;
    }

    /// Acceleration structure build preference bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BuildFlags: u32 {
        /// The structure may later be refit in place.
        const ALLOW_UPDATE      = 1 << 0;
        const ALLOW_COMPACTION  = 1 << 1;
        const PREFER_FAST_TRACE = 1 << 2;
        const PREFER_FAST_BUILD = 1 << 3;
        const LOW_MEMORY        = 1 << 4;
    }

    /// Memory access bits for barriers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Access: u32 {
        const ACCEL_WRITE = 1 << 0;
        const ACCEL_READ  = 1 << 1;
    }

    /// Pipeline stage bits for barriers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PipelineStage: u32 {
        const ACCEL_BUILD = 1 << 0;
    }
}

/// Hint attached to an allocation that backs exactly one resource, letting
/// the device pick a dedicated allocation path for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedicatedResource {
    Buffer(BufferHandle),
    Image(ImageHandle),
}

// ============================================================================
// Images
// ============================================================================

/// Texel formats the resource layer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba16Float,
    Rgba32Float,
    R32Float,
    Depth32Float,
}

impl Format {
    #[must_use]
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Rgba8Unorm | Self::Bgra8Unorm | Self::R32Float | Self::Depth32Float => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }
}

/// Image layout the upload path transitions an image into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageLayout {
    #[default]
    ShaderReadOnly,
    General,
    TransferDst,
}

/// Description of a 2D image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub mip_levels: u32,
    pub usage: ImageUsage,
}

impl ImageDesc {
    /// A single-mip 2D image.
    #[must_use]
    pub fn new_2d(width: u32, height: u32, format: Format, usage: ImageUsage) -> Self {
        Self {
            width,
            height,
            format,
            mip_levels: 1,
            usage,
        }
    }
}

// ============================================================================
// Samplers
// ============================================================================

/// Texel filtering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
}

/// Coordinate wrapping mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
}

/// Sampler description. Doubles as the sampler-pool cache key: two
/// structurally equal descriptions always resolve to the same device sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SamplerDesc {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub mipmap_filter: Filter,
    pub address_mode: AddressMode,
    /// Anisotropic filtering sample count, 0 disables.
    pub max_anisotropy: u8,
}

// ============================================================================
// Acceleration structures
// ============================================================================

/// The two acceleration structure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelKind {
    BottomLevel,
    TopLevel,
}

/// Full build versus in-place refit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    Build,
    Update,
}

/// Triangle geometry referenced by device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleGeometry {
    pub vertex_address: DeviceAddress,
    pub vertex_stride: DeviceSize,
    /// Highest vertex index addressable by the build.
    pub max_vertex: u32,
    /// Index buffer address, or 0 for non-indexed geometry.
    pub index_address: DeviceAddress,
}

/// One geometry entry of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryData {
    /// BLAS input.
    Triangles(TriangleGeometry),
    /// TLAS input: an array of [`AccelInstance`] records at `address`.
    Instances {
        address: DeviceAddress,
        count: u32,
    },
}

/// Primitive range of one geometry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildRange {
    pub primitive_count: u32,
    pub primitive_offset: u32,
    pub first_vertex: u32,
    pub transform_offset: u32,
}

impl BuildRange {
    #[must_use]
    pub fn from_count(primitive_count: u32) -> Self {
        Self {
            primitive_count,
            ..Self::default()
        }
    }
}

/// Sizes the device reports for a pending build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildSizes {
    /// Required backing-store size of the structure itself.
    pub accel_size: DeviceSize,
    /// Worst-case transient scratch for a full build.
    pub build_scratch_size: DeviceSize,
    /// Worst-case transient scratch for an in-place update.
    pub update_scratch_size: DeviceSize,
}

/// Everything one recorded build command needs.
#[derive(Debug, Clone, Copy)]
pub struct AccelBuildDesc<'a> {
    pub kind: AccelKind,
    pub mode: BuildMode,
    pub flags: BuildFlags,
    /// Source structure for update mode, [`AccelHandle::NULL`] for a build.
    pub src: AccelHandle,
    pub dst: AccelHandle,
    pub geometries: &'a [GeometryData],
    pub ranges: &'a [BuildRange],
    pub scratch: DeviceAddress,
}

/// One instance record of a top-level build, in the exact layout the device
/// consumes from the instance buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct AccelInstance {
    /// Row-major 3x4 object-to-world transform.
    pub transform: [[f32; 4]; 3],
    /// 24-bit custom index in the low bits, 8-bit visibility mask in the high bits.
    pub custom_index_and_mask: u32,
    /// 24-bit SBT record offset in the low bits, 8-bit instance flags in the high bits.
    pub sbt_offset_and_flags: u32,
    /// Device address of the referenced bottom-level structure.
    pub blas_address: DeviceAddress,
}

impl AccelInstance {
    /// Build an instance record from a column-major world transform.
    #[must_use]
    pub fn new(transform: glam::Mat4, custom_index: u32, mask: u8, blas_address: DeviceAddress) -> Self {
        let rows = [
            transform.row(0).to_array(),
            transform.row(1).to_array(),
            transform.row(2).to_array(),
        ];
        Self {
            transform: rows,
            custom_index_and_mask: (custom_index & 0x00ff_ffff) | (u32::from(mask) << 24),
            sbt_offset_and_flags: 0,
            blas_address,
        }
    }
}
