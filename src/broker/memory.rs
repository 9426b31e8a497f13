use super::{Acknowledger, Delivery, DeliveryStream, MessageBroker, QueueInfo, DEFAULT_EXCHANGE};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::warn;

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Message>,
    in_flight: usize,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, QueueState>,
    /// 0 means unlimited, as in AMQP.
    prefetch: u16,
    published: usize,
    acked: Vec<Vec<u8>>,
    nacked: Vec<(Vec<u8>, bool)>,
    closed: bool,
}

impl State {
    fn can_deliver(&self, queue: &QueueState) -> bool {
        self.prefetch == 0 || queue.in_flight < usize::from(self.prefetch)
    }
}

/// In-process broker with AMQP-like delivery semantics.
///
/// Unsettled deliveries that are dropped go back to the front of their
/// queue, as they would when an AMQP channel closes.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published_count(&self) -> usize {
        self.state.lock().unwrap().published
    }

    /// Bodies of acknowledged deliveries, in settle order.
    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().acked.clone()
    }

    /// Bodies of rejected deliveries with their requeue flag.
    pub fn nacked(&self) -> Vec<(Vec<u8>, bool)> {
        self.state.lock().unwrap().nacked.clone()
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    pub fn in_flight(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map_or(0, |q| q.in_flight)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn settle(&self, queue: &str, message: Message, outcome: Settlement) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        q.in_flight = q.in_flight.saturating_sub(1);

        match outcome {
            Settlement::Ack => state.acked.push(message.body),
            Settlement::Nack { requeue } => {
                if requeue {
                    q.ready.push_front(Message {
                        body: message.body.clone(),
                        redelivered: true,
                    });
                }
                state.nacked.push((message.body, requeue));
            }
            Settlement::Abandoned => q.ready.push_front(Message {
                body: message.body,
                redelivered: true,
            }),
        }
        drop(guard);
        self.notify.notify_waiters();
    }

    async fn next_delivery(&self, queue: &str) -> Option<Result<Delivery>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return None;
                }
                let deliverable = match state.queues.get(queue) {
                    Some(q) => state.can_deliver(q),
                    None => {
                        return Some(Err(Error::Invariant(format!(
                            "queue '{}' was deleted",
                            queue
                        ))))
                    }
                };
                if deliverable {
                    if let Some(q) = state.queues.get_mut(queue) {
                        if let Some(message) = q.ready.pop_front() {
                            q.in_flight += 1;
                            let acker = MemoryAcker {
                                broker: self.clone(),
                                queue: queue.to_string(),
                                message: message.clone(),
                                settled: AtomicBool::new(false),
                            };
                            return Some(Ok(Delivery::new(
                                message.body,
                                message.redelivered,
                                Box::new(acker),
                            )));
                        }
                    }
                }
            }
            notified.await;
        }
    }
}

enum Settlement {
    Ack,
    Nack { requeue: bool },
    Abandoned,
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn declare_queue(&self, name: &str) -> Result<QueueInfo> {
        let mut state = self.state.lock().unwrap();
        let queue = state.queues.entry(name.to_string()).or_default();
        Ok(QueueInfo {
            name: name.to_string(),
            message_count: queue.ready.len() as u32,
            consumer_count: 0,
        })
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.state.lock().unwrap().prefetch = count;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        if exchange != DEFAULT_EXCHANGE {
            return Err(Error::Invariant(format!(
                "memory broker only routes through the default exchange, got '{}'",
                exchange
            )));
        }

        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Error::Invariant("memory broker is closed".to_string()));
        }
        state.published += 1;
        match state.queues.get_mut(routing_key) {
            Some(queue) => queue.ready.push_back(Message {
                body: payload.to_vec(),
                redelivered: false,
            }),
            // Unroutable messages are dropped, as with the AMQP default exchange.
            None => warn!(routing_key, "Dropping message for undeclared queue"),
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream> {
        if !self.state.lock().unwrap().queues.contains_key(queue) {
            return Err(Error::Invariant(format!("queue '{}' is not declared", queue)));
        }

        let broker = self.clone();
        let queue = queue.to_string();
        let stream = futures::stream::unfold((broker, queue), |(broker, queue)| async move {
            let next = broker.next_delivery(&queue).await?;
            Some((next, (broker, queue)))
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_waiters();
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    message: Message,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self, outcome: Settlement) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(Error::Invariant("delivery already settled".to_string()));
        }
        self.broker
            .settle(&self.queue, self.message.clone(), outcome);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(Settlement::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(Settlement::Nack { requeue })
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if !self.settled.swap(true, Ordering::SeqCst) {
            self.broker
                .settle(&self.queue, self.message.clone(), Settlement::Abandoned);
        }
    }
}
