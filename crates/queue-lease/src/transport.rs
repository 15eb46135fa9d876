//! Transport trait implemented by each queue provider.
//!
//! A transport performs the raw wire calls against the queue service. It
//! knows nothing about leases or heartbeats; those live in the consumer.

use crate::error::QueueError;
use crate::message::{MessageId, ReceiptHandle, ReceivedMessage};
use crate::provider::{ProviderType, QueueConfig};
use crate::providers::{InMemoryTransport, SqsTransport};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;

/// Interface implemented by specific queue providers (SQS, in-memory)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Receive up to `max_messages`, waiting up to `wait` for the first one
    async fn receive(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Delete an in-flight message
    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// Enqueue a message body
    async fn send(&self, body: &str) -> Result<MessageId, QueueError>;

    /// Set the visibility timeout of an in-flight message, counted from now
    async fn change_visibility(
        &self,
        receipt: &ReceiptHandle,
        timeout_seconds: u32,
    ) -> Result<(), QueueError>;

    /// Release the connection; later calls fail with [`QueueError::Closed`]
    fn close(&self);

    /// Get provider type
    fn provider_type(&self) -> ProviderType;
}

/// Who is responsible for closing a transport
///
/// A consumer or producer closes only transports it owns. A transport handed
/// in by the caller stays open until the caller closes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportOwnership {
    /// Created by (or handed over to) the wrapping component
    Owned,
    /// Owned by the caller and shared with the wrapping component
    External,
}

impl TransportOwnership {
    pub fn closes_transport(&self) -> bool {
        matches!(self, Self::Owned)
    }
}

/// Build the transport selected by the configuration's provider tag
///
/// Validation happens first, so an incomplete configuration or an unknown
/// provider fails before any network call.
pub fn create_transport(config: &QueueConfig) -> Result<Arc<dyn Transport>, QueueError> {
    let transport: Arc<dyn Transport> = match config.validate()? {
        ProviderType::AwsSqs => Arc::new(SqsTransport::new(config)?),
        ProviderType::InMemory => Arc::new(InMemoryTransport::named(
            &config.queue_url,
            Duration::from_secs(config.visibility_timeout_seconds as u64),
        )),
    };

    Ok(transport)
}
