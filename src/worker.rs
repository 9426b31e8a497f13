//! Consumer loop: pulls deliveries off the job queue and settles each one.

use crate::broker::{Delivery, MessageBroker};
use crate::processor::{Completion, JobProcessor, ProcessError};
use crate::{Error, Result};
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counts of how deliveries were settled during one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: usize,
    pub already_done: usize,
    pub requeued: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Completed,
    AlreadyDone,
    Requeued,
    Rejected,
}

pub struct Worker {
    broker: Arc<dyn MessageBroker>,
    processor: Arc<JobProcessor>,
    queue: String,
    prefetch: u16,
    consumer_tag: String,
}

impl Worker {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        processor: Arc<JobProcessor>,
        queue: impl Into<String>,
        prefetch: u16,
    ) -> Self {
        Self {
            broker,
            processor,
            queue: queue.into(),
            prefetch,
            consumer_tag: format!("imgqueue-{}", std::process::id()),
        }
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    /// Consume until `cancel` fires or the broker ends the stream, then close
    /// the broker. A job in hand when `cancel` fires stops at its next retry
    /// wait or stage boundary and is requeued.
    pub async fn run(&self, cancel: CancellationToken) -> Result<WorkerStats> {
        let info = self.broker.declare_queue(&self.queue).await?;
        info!(
            queue = %info.name,
            messages = info.message_count,
            consumers = info.consumer_count,
            "Queue declared"
        );
        self.broker.set_prefetch(self.prefetch).await?;

        let mut deliveries = self.broker.consume(&self.queue, &self.consumer_tag).await?;
        info!(queue = %self.queue, prefetch = self.prefetch, "Waiting for jobs");

        let mut stats = WorkerStats::default();
        let mut failure = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Shutdown requested, stopping consumer");
                    break;
                }
                next = deliveries.next() => next,
            };

            match next {
                None => {
                    info!("Delivery stream ended");
                    break;
                }
                Some(Err(err)) => {
                    error!(error = %err, "Error receiving delivery, stopping consumer");
                    failure = Some(err);
                    break;
                }
                Some(Ok(delivery)) => match self.handle(delivery, &cancel).await {
                    Settled::Completed => stats.completed += 1,
                    Settled::AlreadyDone => stats.already_done += 1,
                    Settled::Requeued => stats.requeued += 1,
                    Settled::Rejected => stats.rejected += 1,
                },
            }
        }

        // Unsettled prefetched deliveries go back to the queue with the stream.
        drop(deliveries);
        if let Err(err) = self.broker.close().await {
            warn!(error = %err, "Failed to close broker connection");
        }
        info!(?stats, "Worker stopped");

        match failure {
            Some(err) => Err(err),
            None => Ok(stats),
        }
    }

    async fn handle(&self, delivery: Delivery, cancel: &CancellationToken) -> Settled {
        if delivery.redelivered {
            debug!("Handling redelivered message");
        }

        match self.processor.process(&delivery.body, cancel).await {
            Ok(Completion::Done { request_id, .. }) => {
                if let Err(err) = delivery.ack().await {
                    warn!(%request_id, error = %err, "Failed to ack completed job");
                }
                Settled::Completed
            }
            Ok(Completion::AlreadyDone { request_id }) => {
                if let Err(err) = delivery.ack().await {
                    warn!(%request_id, error = %err, "Failed to ack duplicate job");
                }
                Settled::AlreadyDone
            }
            Err(err) => {
                log_failure(&err);
                let requeue = err.requeue() || !self.note_failure(&err, cancel).await;
                if let Err(nack_err) = delivery.nack(requeue).await {
                    warn!(error = %nack_err, requeue, "Failed to nack job");
                }
                if requeue {
                    Settled::Requeued
                } else {
                    Settled::Rejected
                }
            }
        }
    }

    /// Record a permanent failure before the job is dropped. Returns false
    /// when the note could not be written yet and the job must stay queued.
    async fn note_failure(&self, err: &ProcessError, cancel: &CancellationToken) -> bool {
        match self.processor.record_failure(err, cancel).await {
            Ok(()) => true,
            Err(e) if e.is_transient() || matches!(e, Error::Cancelled) => {
                warn!(stage = %err.stage, "Failure note not recorded, requeueing job");
                false
            }
            Err(_) => true,
        }
    }
}

fn log_failure(err: &ProcessError) {
    let request_id = err.request_id.map(|id| id.to_string()).unwrap_or_default();
    let operation = err.operation.map(|op| op.as_str()).unwrap_or_default();

    if err.is_unrecorded_result() {
        error!(
            request_id = %request_id,
            operation = %operation,
            stage = %err.stage,
            error = %err.source,
            "Result stored but completion not recorded"
        );
    } else if err.requeue() {
        warn!(
            request_id = %request_id,
            operation = %operation,
            stage = %err.stage,
            error = %err.source,
            "Job failed, requeueing"
        );
    } else {
        error!(
            request_id = %request_id,
            operation = %operation,
            stage = %err.stage,
            error = %err.source,
            "Job failed permanently"
        );
    }
}
