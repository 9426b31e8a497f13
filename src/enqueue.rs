//! Producer side: upload a source image, record the request, publish the job.

use crate::broker::{MessageBroker, QueueInfo, DEFAULT_EXCHANGE};
use crate::models::{ImageRef, NewRequest, Operation, RequestRecord};
use crate::requests::RequestStore;
use crate::storage::Storage;
use crate::Result;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// A job as submitted by a user, before anything is stored.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: Option<String>,
    pub operation: Operation,
    /// Storage key for the source; results are named after it.
    pub source_name: String,
    pub content: Vec<u8>,
    pub width: Option<u32>,
}

pub struct Enqueuer {
    store: Arc<dyn RequestStore>,
    broker: Arc<dyn MessageBroker>,
    storage: Arc<dyn Storage>,
    queue: String,
}

impl Enqueuer {
    pub fn new(
        store: Arc<dyn RequestStore>,
        broker: Arc<dyn MessageBroker>,
        storage: Arc<dyn Storage>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            store,
            broker,
            storage,
            queue: queue.into(),
        }
    }

    /// Declare the job queue so publishes are routed even before a worker
    /// has started.
    pub async fn prepare(&self) -> Result<QueueInfo> {
        self.broker.declare_queue(&self.queue).await
    }

    /// Store the source, create a Queued request and publish its job.
    ///
    /// If publishing fails the request rows are deleted again, so no request
    /// is left Queued without a job. The uploaded source is kept.
    #[instrument(skip_all, fields(operation = %job.operation, source = %job.source_name))]
    pub async fn submit(&self, job: NewJob) -> Result<RequestRecord> {
        let mut request = NewRequest {
            id: Uuid::new_v4(),
            user_id: job.user_id,
            operation: job.operation,
            source: ImageRef::new(job.source_name.clone(), String::new()),
            width: job.width,
        };
        // Reject bad input before anything is written.
        let message = request.job_message();
        message.validate()?;
        message.result_name()?;

        request.source.location = self.storage.put(&job.source_name, &job.content).await?;
        let record = self.store.create_request(&request).await?;
        let payload = request.job_message().to_bytes()?;

        if let Err(err) = self
            .broker
            .publish(DEFAULT_EXCHANGE, &self.queue, &payload)
            .await
        {
            error!(request_id = %record.id, error = %err, "Publish failed, removing request");
            if let Err(rollback) = self.store.delete_request(record.id).await {
                error!(request_id = %record.id, error = %rollback, "Failed to remove unpublished request");
            }
            return Err(err);
        }

        info!(request_id = %record.id, queue = %self.queue, "Job submitted");
        Ok(record)
    }
}
