use super::ImageTransform;
use crate::models::TargetFormat;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Fake transform that tags the input bytes instead of decoding them.
#[derive(Clone)]
pub struct MockImageTransform {
    compress_count: Arc<Mutex<usize>>,
    convert_count: Arc<Mutex<usize>>,
    should_fail: Arc<Mutex<bool>>,
}

impl MockImageTransform {
    pub fn new() -> Self {
        Self {
            compress_count: Arc::new(Mutex::new(0)),
            convert_count: Arc::new(Mutex::new(0)),
            should_fail: Arc::new(Mutex::new(false)),
        }
    }

    pub fn with_failure(self, should_fail: bool) -> Self {
        *self.should_fail.lock().unwrap() = should_fail;
        self
    }

    pub fn get_compress_count(&self) -> usize {
        *self.compress_count.lock().unwrap()
    }

    pub fn get_convert_count(&self) -> usize {
        *self.convert_count.lock().unwrap()
    }

    fn check_failure(&self) -> Result<()> {
        if *self.should_fail.lock().unwrap() {
            return Err(Error::UnsupportedFormat("mock failure".to_string()));
        }
        Ok(())
    }
}

impl Default for MockImageTransform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageTransform for MockImageTransform {
    async fn compress(&self, image: &[u8], width: u32) -> Result<Vec<u8>> {
        self.check_failure()?;
        *self.compress_count.lock().unwrap() += 1;

        let mut out = format!("compressed:{}:", width).into_bytes();
        out.extend_from_slice(image);
        Ok(out)
    }

    async fn convert(&self, image: &[u8], target: TargetFormat) -> Result<Vec<u8>> {
        self.check_failure()?;
        *self.convert_count.lock().unwrap() += 1;

        let mut out = format!("converted:{}:", target.extension()).into_bytes();
        out.extend_from_slice(image);
        Ok(out)
    }
}
