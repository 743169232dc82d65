//! Error Types
//!
//! This module defines the error types used throughout the crate.
//!
//! # Overview
//!
//! The main error type [`LucentError`] covers all failure modes including:
//! - Device memory allocation and binding failures
//! - Object creation failures (buffers, images, acceleration structures)
//! - Command submission failures
//! - Caller configuration errors (incompatible memory-type masks, stale ids)
//!
//! # Usage
//!
//! All fallible APIs return [`Result<T>`] which is an alias for
//! `std::result::Result<T, LucentError>`.
//!
//! Device-level failures carry no recovery path: the crate performs no retry,
//! eviction or backoff, so callers targeting build-time usage are expected to
//! treat them as fatal. Configuration errors are safe to correct and retry.

use thiserror::Error;

use crate::alloc::AllocationId;

/// The main error type for the Lucent GPU core.
#[derive(Error, Debug)]
pub enum LucentError {
    // ========================================================================
    // Device Errors (fatal by contract)
    // ========================================================================
    /// The device failed to allocate physical memory.
    #[error("Device memory allocation of {size} bytes failed: {reason}")]
    AllocationFailed {
        /// Requested allocation size in bytes
        size: u64,
        /// Device-reported reason
        reason: String,
    },

    /// No memory type satisfies the requested type mask and property flags.
    #[error("No compatible memory type for mask {type_bits:#b} with properties {properties:#x}")]
    NoCompatibleMemoryType {
        /// Resource-reported memory-type mask
        type_bits: u32,
        /// Requested property flag bits
        properties: u32,
    },

    /// A device object (buffer, image, view, sampler, structure) could not be created.
    #[error("Device object creation failed: {0}")]
    ObjectCreateFailed(String),

    /// Binding a resource to memory at an offset failed.
    #[error("Memory bind failed: {0}")]
    BindFailed(String),

    /// Mapping a memory block into host address space failed.
    #[error("Memory map failed: {0}")]
    MapFailed(String),

    /// Submitting recorded command buffers to the queue failed.
    #[error("Command submission failed: {0}")]
    SubmitFailed(String),

    // ========================================================================
    // Configuration Errors (non-fatal, caller may correct and retry)
    // ========================================================================
    /// A batched allocation mixed resources with incompatible memory-type masks.
    #[error(
        "Batched allocation rejected: resource {index} reports memory-type mask \
         {type_bits:#b}, expected {expected:#b}"
    )]
    IncompatibleMemoryTypes {
        /// Index of the first offending resource in the batch
        index: usize,
        /// The offending mask
        type_bits: u32,
        /// The mask shared by the preceding resources
        expected: u32,
    },

    /// A batched allocation was called with no resources.
    #[error("Batched allocation rejected: empty resource list")]
    EmptyBatch,

    /// A resource handle passed into a batched allocation is unknown to the device.
    #[error("Unknown resource handle in batch: {0}")]
    UnknownHandle(String),

    /// An allocation id does not refer to a live block.
    #[error("Unknown or freed allocation id: {0:?}")]
    UnknownAllocation(AllocationId),

    /// A BLAS index does not refer to a built structure.
    #[error("BLAS index {index} out of range ({count} structures built)")]
    UnknownBlas {
        /// The offending index
        index: usize,
        /// Number of structures currently built
        count: usize,
    },

    /// A TLAS refit was requested before any TLAS build.
    #[error("TLAS refit requested but no TLAS has been built")]
    RefitWithoutBuild,

    /// A TLAS refit carried more instances than the original build.
    #[error("TLAS refit with {requested} instances exceeds built capacity of {capacity}")]
    RefitCapacityExceeded {
        /// Instance count of the refit request
        requested: usize,
        /// Instance count the structure was originally built for
        capacity: usize,
    },
}

/// Alias for `Result<T, LucentError>`.
pub type Result<T> = std::result::Result<T, LucentError>;
