//! Job request queue and the worker loop that feeds the dispatcher.
//!
//! Delivery is at-least-once: a received message stays in flight until it is
//! acknowledged, retried or dead-lettered, and a retried message becomes
//! visible again after its delay.

use crate::dispatcher::JobDispatcher;
use crate::error::{MessageDisposition, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

/// A message received from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: u64,
    pub body: String,
    /// How many times this message has been received, this delivery included.
    pub receive_count: u32,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Receives the next visible message, if any.
    async fn receive(&self) -> Result<Option<QueueMessage>>;

    async fn ack(&self, message: &QueueMessage) -> Result<()>;

    /// Returns the message to the queue, visible again after `delay`.
    async fn retry(&self, message: &QueueMessage, delay: Duration) -> Result<()>;

    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message: QueueMessage,
    pub reason: String,
}

#[derive(Debug)]
struct Pending {
    message: QueueMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    ready: VecDeque<Pending>,
    in_flight: HashMap<u64, QueueMessage>,
    dead_letters: Vec<DeadLetter>,
}

/// In-process queue with visibility delays and a dead-letter list.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
}

impl InMemoryJobQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a message body and returns its id.
    pub async fn send(&self, body: impl Into<String>) -> u64 {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        state.ready.push_back(Pending {
            message: QueueMessage { id, body: body.into(), receive_count: 0 },
            visible_at: Instant::now(),
        });
        debug!(message_id = id, "Message enqueued");
        id
    }

    /// Makes every in-flight message visible again, as if its consumer died
    /// before acknowledging it.
    pub async fn requeue_in_flight(&self) -> usize {
        let mut state = self.state.lock().await;
        let messages: Vec<QueueMessage> = state.in_flight.drain().map(|(_, m)| m).collect();
        let count = messages.len();
        let now = Instant::now();
        for message in messages {
            state.ready.push_back(Pending { message, visible_at: now });
        }
        count
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.clone()
    }

    /// No message is waiting or in flight.
    pub async fn is_drained(&self) -> bool {
        let state = self.state.lock().await;
        state.ready.is_empty() && state.in_flight.is_empty()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn receive(&self) -> Result<Option<QueueMessage>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let Some(index) = state.ready.iter().position(|p| p.visible_at <= now) else {
            return Ok(None);
        };
        let Some(Pending { mut message, .. }) = state.ready.remove(index) else {
            return Ok(None);
        };
        message.receive_count += 1;
        state.in_flight.insert(message.id, message.clone());
        Ok(Some(message))
    }

    async fn ack(&self, message: &QueueMessage) -> Result<()> {
        if self.state.lock().await.in_flight.remove(&message.id).is_none() {
            debug!(message_id = message.id, "Ack for a message that is not in flight");
        }
        Ok(())
    }

    async fn retry(&self, message: &QueueMessage, delay: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(message) = state.in_flight.remove(&message.id) {
            state.ready.push_back(Pending { message, visible_at: Instant::now() + delay });
        }
        Ok(())
    }

    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(message) = state.in_flight.remove(&message.id) {
            state.dead_letters.push(DeadLetter { message, reason: reason.to_string() });
        }
        Ok(())
    }
}

/// Configuration for the queue worker.
#[derive(Debug, Clone)]
pub struct QueueWorkerConfig {
    /// Interval for polling the queue when empty.
    pub idle_poll: Duration,
    /// Visibility delay applied to messages left for redelivery.
    pub retry_delay: Duration,
}

impl Default for QueueWorkerConfig {
    fn default() -> Self {
        Self {
            idle_poll: Duration::from_millis(100),
            retry_delay: Duration::from_secs(30),
        }
    }
}

/// Feeds queue messages to the dispatcher one at a time and settles each
/// message according to the outcome.
pub struct QueueWorker {
    queue: Arc<dyn JobQueue>,
    dispatcher: Arc<JobDispatcher>,
    config: QueueWorkerConfig,
}

impl std::fmt::Debug for QueueWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWorker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QueueWorker {
    #[must_use]
    pub fn new(queue: Arc<dyn JobQueue>, dispatcher: Arc<JobDispatcher>, config: QueueWorkerConfig) -> Self {
        Self { queue, dispatcher, config }
    }

    /// Processes one message. Returns `None` when no message was visible.
    pub async fn process_next(&self) -> Result<Option<MessageDisposition>> {
        let Some(message) = self.queue.receive().await? else {
            return Ok(None);
        };

        match self.dispatcher.handle_message(&message.body).await {
            Ok(outcome) => {
                debug!(message_id = message.id, outcome = ?outcome, "Message dispatched");
                self.queue.ack(&message).await?;
                Ok(Some(MessageDisposition::Ack))
            }
            Err(e) => {
                let disposition = e.disposition();
                match disposition {
                    MessageDisposition::Ack => {
                        debug!(message_id = message.id, reason = %e, "Message acknowledged");
                        self.queue.ack(&message).await?;
                    }
                    MessageDisposition::Retry => {
                        info!(
                            message_id = message.id,
                            receive_count = message.receive_count,
                            reason = %e,
                            "Message left for redelivery"
                        );
                        self.queue.retry(&message, self.config.retry_delay).await?;
                    }
                    MessageDisposition::DeadLetter => {
                        warn!(message_id = message.id, reason = %e, "Message dead-lettered");
                        self.queue.dead_letter(&message, &e.to_string()).await?;
                    }
                }
                Ok(Some(disposition))
            }
        }
    }

    /// Runs until the shutdown channel changes, draining every visible
    /// message on each tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Queue worker started");
        let mut interval = time::interval(self.config.idle_poll);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Queue worker shutdown signal received");
                    break;
                }
                _ = interval.tick() => {
                    loop {
                        match self.process_next().await {
                            Ok(Some(_)) => {}
                            Ok(None) => break,
                            Err(e) => {
                                error!(error = %e, "Queue receive failed");
                                break;
                            }
                        }
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }
        info!("Queue worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_retry_hides_message_until_delay_elapses() {
        let queue = InMemoryJobQueue::new();
        queue.send("{}").await;

        let message = queue.receive().await.unwrap().unwrap();
        assert_eq!(message.receive_count, 1);
        queue.retry(&message, Duration::from_secs(30)).await.unwrap();
        assert!(queue.receive().await.unwrap().is_none());

        time::advance(Duration::from_secs(30)).await;
        let message = queue.receive().await.unwrap().unwrap();
        assert_eq!(message.receive_count, 2);
        queue.ack(&message).await.unwrap();
        assert!(queue.is_drained().await);
    }

    #[tokio::test]
    async fn test_dead_letter_keeps_reason() {
        let queue = InMemoryJobQueue::new();
        queue.send("not json").await;
        let message = queue.receive().await.unwrap().unwrap();
        queue.dead_letter(&message, "invalid job request").await.unwrap();

        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "invalid job request");
        assert!(queue.is_drained().await);
    }

    #[tokio::test]
    async fn test_requeue_in_flight_redelivers() {
        let queue = InMemoryJobQueue::new();
        queue.send("a").await;
        let first = queue.receive().await.unwrap().unwrap();
        assert_eq!(queue.in_flight_len().await, 1);

        assert_eq!(queue.requeue_in_flight().await, 1);
        let again = queue.receive().await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.receive_count, 2);
    }
}
