//! Turns one delivered job into a stored result and a Done request.

use crate::models::{ImageRef, JobMessage, Operation, TargetFormat};
use crate::requests::StatusSink;
use crate::retry::{Repeater, RetrySettings, TransientOnly};
use crate::status::{Status, Transition};
use crate::storage::Storage;
use crate::transform::ImageTransform;
use crate::{Error, Result};
use chrono::Utc;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Step of the pipeline a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decode,
    Begin,
    Fetch,
    Transform,
    Store,
    Record,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Decode => "decode",
            Stage::Begin => "begin",
            Stage::Fetch => "fetch",
            Stage::Transform => "transform",
            Stage::Store => "store",
            Stage::Record => "record",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed job, with enough context to log and settle it.
#[derive(Debug)]
pub struct ProcessError {
    pub request_id: Option<Uuid>,
    pub operation: Option<Operation>,
    pub stage: Stage,
    pub source: Error,
}

impl ProcessError {
    fn decode(source: Error) -> Self {
        Self {
            request_id: None,
            operation: None,
            stage: Stage::Decode,
            source,
        }
    }

    fn at(job: &JobMessage, stage: Stage) -> impl FnOnce(Error) -> ProcessError + '_ {
        move |source| ProcessError {
            request_id: Some(job.request_id),
            operation: Some(job.operation),
            stage,
            source,
        }
    }

    /// Whether the broker should hand the job out again.
    pub fn requeue(&self) -> bool {
        self.source.is_transient() || matches!(self.source, Error::Cancelled)
    }

    /// The transform and upload succeeded but Done was never recorded.
    pub fn is_unrecorded_result(&self) -> bool {
        self.stage == Stage::Record
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage failed", self.stage)?;
        if let Some(id) = self.request_id {
            write!(f, " for request {}", id)?;
        }
        if let Some(operation) = self.operation {
            write!(f, " ({})", operation)?;
        }
        write!(f, ": {}", self.source)
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Successful handling of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Done {
        request_id: Uuid,
        result: ImageRef,
        transition: Transition,
    },
    /// A redelivered job whose request was already Done.
    AlreadyDone { request_id: Uuid },
}

/// Executes jobs against injected storage, transform and status collaborators.
pub struct JobProcessor {
    storage: Arc<dyn Storage>,
    transform: Arc<dyn ImageTransform>,
    sink: Arc<dyn StatusSink>,
    retry: RetrySettings,
}

impl JobProcessor {
    pub fn new(
        storage: Arc<dyn Storage>,
        transform: Arc<dyn ImageTransform>,
        sink: Arc<dyn StatusSink>,
        retry: RetrySettings,
    ) -> Self {
        Self {
            storage,
            transform,
            sink,
            retry,
        }
    }

    /// Decode a delivery body and process the job it describes.
    pub async fn process(
        &self,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> std::result::Result<Completion, ProcessError> {
        let job = JobMessage::from_slice(body).map_err(ProcessError::decode)?;
        self.process_job(&job, cancel).await
    }

    #[instrument(
        name = "process_job",
        skip_all,
        fields(request_id = %job.request_id, operation = %job.operation)
    )]
    pub async fn process_job(
        &self,
        job: &JobMessage,
        cancel: &CancellationToken,
    ) -> std::result::Result<Completion, ProcessError> {
        let result_name = job.result_name().map_err(ProcessError::at(job, Stage::Decode))?;

        match self
            .retrying(cancel, || {
                self.sink.update_status(job.request_id, Status::Processing)
            })
            .await
        {
            Ok(Transition::Applied) => {}
            Ok(Transition::Unchanged) => {
                info!("Request already processing; resuming redelivered job");
            }
            Err(Error::InvalidTransition {
                from: Status::Done, ..
            }) => {
                info!("Request already done; skipping redelivered job");
                return Ok(Completion::AlreadyDone {
                    request_id: job.request_id,
                });
            }
            Err(e) => return Err(ProcessError::at(job, Stage::Begin)(e)),
        }

        let source = self
            .retrying(cancel, || self.storage.get(&job.source_name))
            .await
            .map_err(ProcessError::at(job, Stage::Fetch))?;

        let output = self
            .transform(job, &source)
            .await
            .map_err(ProcessError::at(job, Stage::Transform))?;

        let location = self
            .retrying(cancel, || self.storage.put(&result_name, &output))
            .await
            .map_err(ProcessError::at(job, Stage::Store))?;

        let result = ImageRef::new(result_name, location);
        let completed_at = Utc::now();
        let transition = self
            .retrying(cancel, || {
                self.sink
                    .complete_request(job.request_id, &result, completed_at)
            })
            .await
            .map_err(ProcessError::at(job, Stage::Record))?;

        info!(
            result = %result.name,
            location = %result.location,
            bytes = output.len(),
            "Job done"
        );

        Ok(Completion::Done {
            request_id: job.request_id,
            result,
            transition,
        })
    }

    /// Note a permanent failure on the request, if there is one to note it on.
    /// The write is retried like any other status write; an error means the
    /// note is missing.
    pub async fn record_failure(
        &self,
        err: &ProcessError,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(request_id) = err.request_id else {
            return Ok(());
        };
        let reason = format!("{}: {}", err.stage, err.source);
        self.retrying(cancel, || self.sink.record_failure(request_id, &reason))
            .await
            .inspect_err(|e| warn!(%request_id, "Failed to record job failure: {}", e))
    }

    async fn transform(&self, job: &JobMessage, source: &[u8]) -> Result<Vec<u8>> {
        match job.operation {
            Operation::Compression => {
                let width = job
                    .width
                    .ok_or_else(|| Error::InvalidJob("compression requires a width".to_string()))?;
                self.transform.compress(source, width).await
            }
            Operation::Conversion => {
                let target = TargetFormat::for_source(&job.source_name)?;
                self.transform.convert(source, target).await
            }
        }
    }

    async fn retrying<T, F, Fut>(&self, cancel: &CancellationToken, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        Repeater::new(self.retry.backoff(), TransientOnly)
            .run(cancel, op)
            .await
            .map_err(Error::from)
    }
}
