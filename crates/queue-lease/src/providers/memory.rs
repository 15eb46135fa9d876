//! In-memory queue transport for testing and development.
//!
//! This module provides a queue with the delivery semantics of SQS:
//! - Messages are delivered in enqueue order, up to a batch size per receive
//! - Received messages are hidden for the queue's visibility timeout
//! - Expired leases return the message to the queue; the next delivery gets a
//!   new receipt handle and an incremented delivery count
//! - Delete and visibility changes require a live receipt handle
//! - Receive calls can long-poll for new messages
//!
//! Lease deadlines use `tokio::time`, so tests can drive expiry with a paused
//! clock. Named queues are shared by every transport in the process that uses
//! the same name, which lets a producer and a consumer built from the same
//! configuration talk to each other.

use crate::error::QueueError;
use crate::message::{MessageId, ReceiptHandle, ReceivedMessage, Timestamp};
use crate::provider::ProviderType;
use crate::transport::Transport;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Longest wait a receive will honor; longer waits are capped here.
const MAX_WAIT: Duration = Duration::from_secs(86_400 * 365);

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// Process-wide registry of named queues
fn named_queues() -> &'static Mutex<HashMap<String, Arc<SharedQueue>>> {
    static QUEUES: OnceLock<Mutex<HashMap<String, Arc<SharedQueue>>>> = OnceLock::new();
    QUEUES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Queue state shared by every transport handle attached to it
#[derive(Default)]
struct SharedQueue {
    state: Mutex<QueueState>,
    /// Wakes long-polling receivers when messages become available
    arrivals: Notify,
}

impl SharedQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct QueueState {
    next_sequence: u64,
    /// Visible messages keyed by enqueue sequence, so iteration is FIFO
    ready: BTreeMap<u64, StoredMessage>,
    /// Leased messages keyed by receipt handle
    in_flight: HashMap<String, InFlightMessage>,
}

/// A message stored in the queue with metadata
struct StoredMessage {
    sequence: u64,
    message_id: MessageId,
    body: String,
    delivery_count: u32,
    enqueued_at: Timestamp,
}

/// A message currently being processed
struct InFlightMessage {
    message: StoredMessage,
    visible_at: Instant,
}

impl QueueState {
    fn enqueue(&mut self, body: String) -> MessageId {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let message_id = MessageId::new();
        self.ready.insert(
            sequence,
            StoredMessage {
                sequence,
                message_id: message_id.clone(),
                body,
                delivery_count: 0,
                enqueued_at: Timestamp::now(),
            },
        );
        message_id
    }

    /// Return every message whose lease ran out to the visible set
    fn reclaim_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, leased)| leased.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in &expired {
            if let Some(leased) = self.in_flight.remove(receipt) {
                self.ready.insert(leased.message.sequence, leased.message);
            }
        }

        expired.len()
    }

    fn lease(&mut self, max_messages: u32, visibility: Duration, now: Instant) -> Vec<ReceivedMessage> {
        self.reclaim_expired(now);

        let mut delivered = Vec::new();
        while delivered.len() < max_messages as usize {
            let Some((_, mut message)) = self.ready.pop_first() else {
                break;
            };

            message.delivery_count += 1;
            let receipt = uuid::Uuid::new_v4().to_string();

            delivered.push(
                ReceivedMessage::new(
                    message.message_id.clone(),
                    message.body.clone(),
                    ReceiptHandle::new(receipt.clone(), ProviderType::InMemory),
                )
                .with_delivery_count(message.delivery_count)
                .with_attribute(
                    "SentTimestamp".to_string(),
                    message
                        .enqueued_at
                        .as_datetime()
                        .timestamp_millis()
                        .to_string(),
                ),
            );

            self.in_flight.insert(
                receipt,
                InFlightMessage {
                    message,
                    visible_at: now + visibility,
                },
            );
        }

        delivered
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.in_flight.values().map(|leased| leased.visible_at).min()
    }
}

// ============================================================================
// InMemoryTransport
// ============================================================================

/// In-memory queue transport
pub struct InMemoryTransport {
    queue: Arc<SharedQueue>,
    name: String,
    visibility_timeout: Duration,
    closed: AtomicBool,
}

impl InMemoryTransport {
    /// Create a transport on a private queue
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            queue: Arc::new(SharedQueue::default()),
            name: "in-memory".to_string(),
            visibility_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Attach to the process-wide queue called `name`, creating it if needed
    pub fn named(name: &str, visibility_timeout: Duration) -> Self {
        let queue = {
            let mut queues = named_queues()
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(queues.entry(name.to_string()).or_default())
        };

        Self {
            queue,
            name: name.to_string(),
            visibility_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Open another handle on the same queue
    ///
    /// Closing one handle does not close the others.
    pub fn share(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            name: self.name.clone(),
            visibility_timeout: self.visibility_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of messages currently visible to receivers
    pub fn visible_count(&self) -> usize {
        let mut state = self.queue.lock();
        state.reclaim_expired(Instant::now());
        state.ready.len()
    }

    /// Number of messages currently leased to a receiver
    pub fn in_flight_count(&self) -> usize {
        let mut state = self.queue.lock();
        state.reclaim_expired(Instant::now());
        state.in_flight.len()
    }

    /// Check whether this handle has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::closed("in-memory transport"));
        }
        Ok(())
    }

    fn receipt_not_found(receipt: &ReceiptHandle) -> QueueError {
        QueueError::MessageNotFound {
            receipt: receipt.handle().to_string(),
        }
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(
            crate::provider::DEFAULT_VISIBILITY_TIMEOUT_SECONDS as u64,
        ))
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn receive(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let deadline = Instant::now() + wait.min(MAX_WAIT);

        loop {
            // Register for wakeups before looking, so a send in between is not missed
            let arrival = self.queue.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();
            self.ensure_open()?;

            let (messages, next_expiry) = {
                let mut state = self.queue.lock();
                let messages = state.lease(max_messages, self.visibility_timeout, Instant::now());
                (messages, state.next_expiry())
            };

            if !messages.is_empty() || Instant::now() >= deadline {
                debug!(
                    queue = %self.name,
                    count = messages.len(),
                    "Received messages from in-memory queue"
                );
                return Ok(messages);
            }

            let wake_at = next_expiry.map_or(deadline, |expiry| expiry.min(deadline));
            tokio::select! {
                _ = arrival => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.ensure_open()?;

        let mut state = self.queue.lock();
        state.reclaim_expired(Instant::now());
        state
            .in_flight
            .remove(receipt.handle())
            .map(|_| ())
            .ok_or_else(|| Self::receipt_not_found(receipt))
    }

    async fn send(&self, body: &str) -> Result<MessageId, QueueError> {
        self.ensure_open()?;

        let max_size = ProviderType::InMemory.max_message_size();
        if body.len() > max_size {
            return Err(QueueError::MessageTooLarge {
                size: body.len(),
                max_size,
            });
        }

        let message_id = self.queue.lock().enqueue(body.to_string());
        self.queue.arrivals.notify_waiters();
        Ok(message_id)
    }

    async fn change_visibility(
        &self,
        receipt: &ReceiptHandle,
        timeout_seconds: u32,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;

        let now = Instant::now();
        let returned_to_queue = {
            let mut state = self.queue.lock();
            state.reclaim_expired(now);

            if timeout_seconds == 0 {
                let leased = state
                    .in_flight
                    .remove(receipt.handle())
                    .ok_or_else(|| Self::receipt_not_found(receipt))?;
                state.ready.insert(leased.message.sequence, leased.message);
                true
            } else {
                let leased = state
                    .in_flight
                    .get_mut(receipt.handle())
                    .ok_or_else(|| Self::receipt_not_found(receipt))?;
                leased.visible_at = now + Duration::from_secs(timeout_seconds as u64);
                false
            }
        };

        if returned_to_queue {
            self.queue.arrivals.notify_waiters();
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Long polls on this handle recheck the flag when woken.
        self.queue.arrivals.notify_waiters();
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemory
    }
}
