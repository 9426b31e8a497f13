//! imgqueue - asynchronous image compression and conversion jobs
//!
//! Producers upload a source image, record a Queued request and publish a
//! job to a durable queue. Workers consume jobs, transform the image, store
//! the result and move the request to Done. Delivery is at-least-once; the
//! forward-only request status makes redelivered jobs harmless.

pub mod broker;
pub mod config;
pub mod enqueue;
pub mod error;
pub mod models;
pub mod processor;
pub mod requests;
pub mod retry;
pub mod status;
pub mod storage;
pub mod transform;
pub mod worker;

pub use error::{Error, Result};
