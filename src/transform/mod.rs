//! Image transformation capability
//!
//! The worker treats encoding as a black box: it hands over source bytes and
//! gets transformed bytes back. [`ImageProcessor`] implements it with the
//! `image` crate; [`MockImageTransform`] is a deterministic stand-in.

pub mod mock;
pub mod processor;

pub use mock::MockImageTransform;
pub use processor::ImageProcessor;

use crate::models::TargetFormat;
use crate::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ImageTransform: Send + Sync {
    /// Downscale to `width` (keeping aspect ratio) and re-encode.
    async fn compress(&self, image: &[u8], width: u32) -> Result<Vec<u8>>;

    /// Re-encode into `target`.
    async fn convert(&self, image: &[u8], target: TargetFormat) -> Result<Vec<u8>>;
}
