//! Request records shared with the API tier
//!
//! The worker only advances status through [`StatusSink`]. The producer side
//! and readers use the wider [`RequestStore`]. Both implementations enforce
//! the forward-only transitions of [`Status`](crate::status::Status).

pub mod memory;
pub mod postgres;

pub use memory::MemoryRequestStore;
pub use postgres::PgRequestStore;

use crate::models::{ImageRef, NewRequest, RequestRecord};
use crate::status::{Status, Transition};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Status writes performed by the job processor.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Advance the request to `status`. Moving backwards is an error;
    /// writing the current status again is [`Transition::Unchanged`].
    async fn update_status(&self, request_id: Uuid, status: Status) -> Result<Transition>;

    /// Move a Processing request to Done with its result. Completing an
    /// already-done request with the same result is a no-op.
    async fn complete_request(
        &self,
        request_id: Uuid,
        result: &ImageRef,
        completed_at: DateTime<Utc>,
    ) -> Result<Transition>;

    /// Attach a permanent failure note. Status is left untouched.
    async fn record_failure(&self, request_id: Uuid, reason: &str) -> Result<()>;
}

/// Full access to request records.
#[async_trait]
pub trait RequestStore: StatusSink {
    /// Create the uploaded-image, resulted-image and status rows for a new
    /// request in one all-or-nothing write.
    async fn create_request(&self, request: &NewRequest) -> Result<RequestRecord>;

    async fn get_request(&self, request_id: Uuid) -> Result<Option<RequestRecord>>;

    /// Remove every row of a request; used to roll back a failed enqueue.
    async fn delete_request(&self, request_id: Uuid) -> Result<()>;
}
