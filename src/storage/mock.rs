use super::{validate_key, Storage};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// In-memory object store with call counters and failure injection.
#[derive(Clone)]
pub struct MockStorage {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    base_url: String,
    put_count: Arc<Mutex<usize>>,
    get_count: Arc<Mutex<usize>>,
    failing_gets: Arc<Mutex<usize>>,
    failing_puts: Arc<Mutex<usize>>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self {
            files: Arc::new(Mutex::new(HashMap::new())),
            base_url: "mem://bucket".to_string(),
            put_count: Arc::new(Mutex::new(0)),
            get_count: Arc::new(Mutex::new(0)),
            failing_gets: Arc::new(Mutex::new(0)),
            failing_puts: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_file(self, key: String, content: Vec<u8>) -> Self {
        self.files.lock().unwrap().insert(key, content);
        self
    }

    /// The next `count` gets fail with a transient transport error.
    pub fn with_failing_gets(self, count: usize) -> Self {
        *self.failing_gets.lock().unwrap() = count;
        self
    }

    /// The next `count` puts fail with a transient upload error.
    pub fn with_failing_puts(self, count: usize) -> Self {
        *self.failing_puts.lock().unwrap() = count;
        self
    }

    pub fn get_put_count(&self) -> usize {
        *self.put_count.lock().unwrap()
    }

    pub fn get_get_count(&self) -> usize {
        *self.get_count.lock().unwrap()
    }

    pub fn get_files(&self) -> HashMap<String, Vec<u8>> {
        self.files.lock().unwrap().clone()
    }

    fn take_failure(counter: &Mutex<usize>) -> bool {
        let mut remaining = counter.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }
}

impl Default for MockStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MockStorage {
    async fn put(&self, name: &str, content: &[u8]) -> Result<String> {
        validate_key(name)?;
        *self.put_count.lock().unwrap() += 1;

        if Self::take_failure(&self.failing_puts) {
            return Err(Error::Upload(format!("Mock upload failure for {}", name)));
        }

        self.files
            .lock()
            .unwrap()
            .insert(name.to_string(), content.to_vec());
        Ok(format!("{}/{}", self.base_url, name))
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        validate_key(name)?;
        *self.get_count.lock().unwrap() += 1;

        if Self::take_failure(&self.failing_gets) {
            return Err(Error::Transport(format!("Mock transport failure for {}", name)));
        }

        self.files
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }
}
