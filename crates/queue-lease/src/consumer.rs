//! Message consumer with lease keepalive.
//!
//! A [`QueueConsumer`] receives batches from its transport and, when
//! heartbeats are enabled, keeps every received message leased until it is
//! acknowledged. Acknowledgement deletes the message first and only then
//! stops its keepalive, so a failed delete leaves the lease running.

use crate::error::{QueueError, ValidationError};
use crate::heartbeat::{HeartbeatScheduler, HeartbeatStats};
use crate::lease::LeaseRegistry;
use crate::message::ReceivedMessage;
use crate::provider::QueueConfig;
use crate::transport::{create_transport, Transport, TransportOwnership};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;

/// Interface for receiving and acknowledging messages
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Receive a batch without waiting for messages to arrive
    async fn receive(&self) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Receive a batch, waiting up to `timeout` for the first message
    async fn receive_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Delete a processed message and stop its keepalive
    async fn acknowledge_message(&self, message: &ReceivedMessage) -> Result<(), QueueError>;

    /// Extend the visibility of a message once, right now
    async fn send_heartbeat(&self, message: &ReceivedMessage) -> Result<(), QueueError>;

    /// Stop all keepalives and release the transport if owned
    fn close(&self);

    /// Number of messages currently kept alive
    fn active_leases(&self) -> usize;

    /// Heartbeat counters; all zero when heartbeats are disabled
    fn heartbeat_stats(&self) -> HeartbeatStats;
}

/// Consumer over any [`Transport`]
pub struct QueueConsumer {
    config: QueueConfig,
    transport: Arc<dyn Transport>,
    ownership: TransportOwnership,
    leases: LeaseRegistry,
    heartbeats: Option<HeartbeatScheduler>,
    closed: AtomicBool,
}

impl QueueConsumer {
    /// Create a consumer with a transport built from `config`
    ///
    /// No network call is made; connection problems surface on the first
    /// receive.
    pub fn new(config: QueueConfig) -> Result<Self, QueueError> {
        let transport = create_transport(&config)?;
        Self::with_transport(config, transport, TransportOwnership::Owned)
    }

    /// Create a consumer over an existing transport
    ///
    /// With [`TransportOwnership::External`] the transport stays open when the
    /// consumer closes.
    pub fn with_transport(
        config: QueueConfig,
        transport: Arc<dyn Transport>,
        ownership: TransportOwnership,
    ) -> Result<Self, QueueError> {
        config.validate()?;

        let heartbeats = if config.heartbeat.is_enabled() {
            Some(HeartbeatScheduler::new(
                Arc::clone(&transport),
                config.heartbeat,
            )?)
        } else {
            None
        };

        info!(
            provider = %transport.provider_type(),
            queue_url = %config.queue_url,
            max_messages = config.receive.max_messages,
            heartbeat_interval_seconds = config.heartbeat.interval_seconds,
            heartbeat_pool_size = config.heartbeat.worker_pool_size,
            "Created queue consumer"
        );

        Ok(Self {
            config,
            transport,
            ownership,
            leases: LeaseRegistry::new(),
            heartbeats,
            closed: AtomicBool::new(false),
        })
    }

    /// Configuration the consumer was built from
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::closed("consumer"));
        }
        Ok(())
    }

    /// Start a keepalive for each message of a freshly received batch
    ///
    /// A message whose keepalive cannot be started is still returned to the
    /// caller; it simply expires at the queue's visibility timeout.
    fn lease_batch(&self, heartbeats: &HeartbeatScheduler, messages: &[ReceivedMessage]) {
        for message in messages {
            match heartbeats.schedule(message) {
                Ok(handle) => {
                    if self
                        .leases
                        .register(message.message_id.clone(), handle)
                        .is_some()
                    {
                        debug!(
                            message_id = %message.message_id,
                            "Message redelivered while still leased"
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        message_id = %message.message_id,
                        error = %e,
                        "Failed to start heartbeat for message"
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for QueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConsumer")
            .field("config", &self.config)
            .field("ownership", &self.ownership)
            .field("leases", &self.leases)
            .field("heartbeats", &self.heartbeats)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl MessageConsumer for QueueConsumer {
    async fn receive(&self) -> Result<Vec<ReceivedMessage>, QueueError> {
        self.receive_with_timeout(Duration::ZERO).await
    }

    async fn receive_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        self.ensure_open()?;

        let messages = self
            .transport
            .receive(self.config.receive.max_messages, timeout)
            .await?;

        if let Some(heartbeats) = &self.heartbeats {
            self.lease_batch(heartbeats, &messages);
        }

        debug!(
            count = messages.len(),
            active_leases = self.leases.len(),
            "Received batch"
        );
        Ok(messages)
    }

    async fn acknowledge_message(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        self.ensure_open()?;

        self.transport.delete(&message.receipt_handle).await?;

        if let Some(lease) = self.leases.remove(&message.message_id) {
            lease.cancel();
        }

        debug!(message_id = %message.message_id, "Acknowledged message");
        Ok(())
    }

    async fn send_heartbeat(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        self.ensure_open()?;

        let Some(extension_seconds) = self.config.heartbeat.extension_seconds() else {
            return Err(ValidationError::OutOfRange {
                field: "heartbeat.interval_seconds".to_string(),
                message: format!(
                    "heartbeats are disabled (interval {})",
                    self.config.heartbeat.interval_seconds
                ),
            }
            .into());
        };

        self.transport
            .change_visibility(&message.receipt_handle, extension_seconds)
            .await?;

        debug!(
            message_id = %message.message_id,
            visibility_timeout = extension_seconds,
            "Sent manual heartbeat"
        );
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Consumer already closed");
            return;
        }

        let cancelled = self.leases.cancel_all();
        if let Some(heartbeats) = &self.heartbeats {
            heartbeats.shutdown();
        }
        if self.ownership.closes_transport() {
            self.transport.close();
        }

        info!(
            cancelled_leases = cancelled,
            transport_closed = self.ownership.closes_transport(),
            "Closed queue consumer"
        );
    }

    fn active_leases(&self) -> usize {
        self.leases.len()
    }

    fn heartbeat_stats(&self) -> HeartbeatStats {
        self.heartbeats
            .as_ref()
            .map(HeartbeatScheduler::stats)
            .unwrap_or_default()
    }
}

/// Builds consumers from configuration
pub struct ConsumerFactory;

impl ConsumerFactory {
    /// Create a consumer for the provider named in `config`
    ///
    /// # Errors
    ///
    /// Fails synchronously on an unknown provider or incomplete
    /// configuration; no network call is made.
    pub fn create(config: QueueConfig) -> Result<Box<dyn MessageConsumer>, QueueError> {
        Ok(Box::new(QueueConsumer::new(config)?))
    }
}
