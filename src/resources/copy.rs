//! Upload interface consumed from the embedding application.

use crate::backend::{BufferHandle, DeviceSize, ImageHandle, ImageLayout};

/// Pushes host data into device resources. Supplied by the embedding
/// application; the resource manager only calls it right after binding a
/// freshly created resource, so implementations may assume exclusive access.
pub trait CopyEngine {
    /// Write `data` into `buffer` starting at `offset`.
    fn update_buffer(&self, buffer: BufferHandle, offset: DeviceSize, data: &[u8]);

    /// Write tightly packed texel `data` into `image` and leave it in
    /// `layout`.
    fn update_image(
        &self,
        image: ImageHandle,
        data: &[u8],
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
        layout: ImageLayout,
    );
}
