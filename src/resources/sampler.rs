//! Refcounted sampler cache.
//!
//! Sampler objects are tiny and devices cap how many can exist, so identical
//! descriptions share one device sampler. Acquire/release is refcounted;
//! the device object is destroyed when the last reference goes away.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::backend::{GpuBackend, SamplerDesc, SamplerHandle};
use crate::errors::Result;

struct Entry {
    handle: SamplerHandle,
    refs: usize,
}

/// Caches device samplers by description.
pub struct SamplerPool {
    backend: Arc<dyn GpuBackend>,
    by_desc: FxHashMap<SamplerDesc, Entry>,
    by_handle: FxHashMap<SamplerHandle, SamplerDesc>,
}

impl SamplerPool {
    #[must_use]
    pub fn new(backend: Arc<dyn GpuBackend>) -> Self {
        Self {
            backend,
            by_desc: FxHashMap::default(),
            by_handle: FxHashMap::default(),
        }
    }

    /// Get the sampler for `desc`, creating it on first acquire. Acquiring
    /// an identical description twice returns the same handle.
    pub fn acquire(&mut self, desc: &SamplerDesc) -> Result<SamplerHandle> {
        if let Some(entry) = self.by_desc.get_mut(desc) {
            entry.refs += 1;
            return Ok(entry.handle);
        }

        let handle = self.backend.create_sampler(desc)?;
        self.by_desc.insert(*desc, Entry { handle, refs: 1 });
        self.by_handle.insert(handle, *desc);
        Ok(handle)
    }

    /// Drop one reference; the device sampler dies with the last one.
    /// Unknown handles log a warning and mutate nothing.
    pub fn release(&mut self, sampler: SamplerHandle) {
        let Some(desc) = self.by_handle.get(&sampler).copied() else {
            log::warn!("release: unknown sampler {sampler:?}");
            return;
        };

        let entry = self
            .by_desc
            .get_mut(&desc)
            .expect("by_desc and by_handle stay in sync");
        entry.refs -= 1;
        if entry.refs == 0 {
            self.by_desc.remove(&desc);
            self.by_handle.remove(&sampler);
            self.backend.destroy_sampler(sampler);
        }
    }

    /// Number of distinct device samplers currently alive.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_desc.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_desc.is_empty()
    }

    /// Destroy every cached sampler regardless of outstanding references.
    /// Full-teardown path.
    pub fn deinit(&mut self) {
        for (_, entry) in self.by_desc.drain() {
            self.backend.destroy_sampler(entry.handle);
        }
        self.by_handle.clear();
    }
}

impl Drop for SamplerPool {
    fn drop(&mut self) {
        self.deinit();
    }
}
