//! Acceleration structure builds
//!
//! [`AccelBuilder`] drives the multi-stage, synchronously submitted build
//! pipeline for bottom-level (one per geometry input) and top-level (one per
//! builder) acceleration structures:
//!
//! 1. query backing and worst-case scratch sizes from the device,
//! 2. create backing buffers and structure objects,
//! 3. pack every backing buffer of a batch into one allocation,
//! 4. record build commands, each followed by a write→read memory barrier,
//! 5. submit to the queue, block until completion, release scratch.
//!
//! Scratch for a BLAS batch is a single buffer sized to the maximum scratch
//! requirement across the batch and reused serially, so at most one scratch
//! allocation is ever live per builder.

mod builder;

use smallvec::SmallVec;

use crate::backend::{
    AccelHandle, BufferHandle, BuildFlags, BuildRange, DeviceAddress, GeometryData,
    TriangleGeometry,
};

pub use builder::AccelBuilder;

/// Geometry input for one bottom-level structure.
#[derive(Debug, Clone)]
pub struct BlasInput {
    /// Geometry entries, one build range each.
    pub geometries: SmallVec<[GeometryData; 1]>,
    pub ranges: SmallVec<[BuildRange; 1]>,
    /// Per-input build flags, OR-ed with the batch-wide flags.
    pub flags: BuildFlags,
}

impl BlasInput {
    /// Single triangle-geometry input.
    #[must_use]
    pub fn triangles(geometry: TriangleGeometry, primitive_count: u32) -> Self {
        Self {
            geometries: smallvec::smallvec![GeometryData::Triangles(geometry)],
            ranges: smallvec::smallvec![BuildRange::from_count(primitive_count)],
            flags: BuildFlags::empty(),
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: BuildFlags) -> Self {
        self.flags = flags;
        self
    }

    fn primitive_counts(&self) -> SmallVec<[u32; 1]> {
        self.ranges.iter().map(|r| r.primitive_count).collect()
    }
}

/// A built acceleration structure and its backing buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelStructure {
    pub handle: AccelHandle,
    pub buffer: BufferHandle,
    pub device_address: DeviceAddress,
}
