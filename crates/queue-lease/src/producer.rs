//! Typed message producer.
//!
//! A [`QueueProducer`] turns a payload into a message body with its
//! transformer and hands the body to the transport. Each send is a single
//! attempt; retry decisions are left to the caller (see
//! [`QueueError::should_retry`]).

use crate::error::{QueueError, SerializationError};
use crate::message::MessageId;
use crate::provider::QueueConfig;
use crate::transport::{create_transport, Transport, TransportOwnership};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[cfg(test)]
#[path = "producer_tests.rs"]
mod tests;

/// Converts a payload into the message body sent on the wire
pub type PayloadTransformer<T> =
    Box<dyn Fn(&T) -> Result<String, SerializationError> + Send + Sync>;

/// Interface for sending typed payloads
#[async_trait]
pub trait MessageProducer<T>: Send + Sync
where
    T: Send + Sync,
{
    /// Transform and enqueue one payload
    async fn send(&self, payload: &T) -> Result<MessageId, QueueError>;

    /// Release the transport if owned; later sends fail
    fn close(&self);
}

/// Producer over any [`Transport`]
pub struct QueueProducer<T> {
    transport: Arc<dyn Transport>,
    ownership: TransportOwnership,
    transformer: PayloadTransformer<T>,
    closed: AtomicBool,
}

impl<T> QueueProducer<T>
where
    T: Send + Sync + 'static,
{
    /// Create a producer for `config` with a custom transformer
    pub fn with_transformer<F>(config: QueueConfig, transformer: F) -> Result<Self, QueueError>
    where
        F: Fn(&T) -> Result<String, SerializationError> + Send + Sync + 'static,
    {
        let transport = create_transport(&config)?;

        info!(
            provider = %transport.provider_type(),
            queue_url = %config.queue_url,
            "Created queue producer"
        );

        Ok(Self::from_transport(
            transport,
            TransportOwnership::Owned,
            Box::new(transformer),
        ))
    }

    /// Create a producer over an existing transport
    pub fn from_transport(
        transport: Arc<dyn Transport>,
        ownership: TransportOwnership,
        transformer: PayloadTransformer<T>,
    ) -> Self {
        Self {
            transport,
            ownership,
            transformer,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl<T> QueueProducer<T>
where
    T: Display + Send + Sync + 'static,
{
    /// Create a producer that sends each payload's `Display` output
    pub fn new(config: QueueConfig) -> Result<Self, QueueError> {
        Self::with_transformer(config, display_transformer::<T>)
    }
}

impl<T> QueueProducer<T>
where
    T: Serialize + Send + Sync + 'static,
{
    /// Create a producer that sends each payload as JSON
    pub fn json(config: QueueConfig) -> Result<Self, QueueError> {
        Self::with_transformer(config, json_transformer::<T>)
    }
}

fn display_transformer<T: Display>(payload: &T) -> Result<String, SerializationError> {
    Ok(payload.to_string())
}

fn json_transformer<T: Serialize>(payload: &T) -> Result<String, SerializationError> {
    Ok(serde_json::to_string(payload)?)
}

impl<T> std::fmt::Debug for QueueProducer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueProducer")
            .field("provider", &self.transport.provider_type())
            .field("ownership", &self.ownership)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl<T> MessageProducer<T> for QueueProducer<T>
where
    T: Send + Sync + 'static,
{
    async fn send(&self, payload: &T) -> Result<MessageId, QueueError> {
        if self.is_closed() {
            return Err(QueueError::closed("producer"));
        }

        let body = (self.transformer)(payload)?;
        let message_id = self.transport.send(&body).await?;

        debug!(
            message_id = %message_id,
            size = body.len(),
            "Sent message"
        );
        Ok(message_id)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Producer already closed");
            return;
        }

        if self.ownership.closes_transport() {
            self.transport.close();
        }
        info!(
            transport_closed = self.ownership.closes_transport(),
            "Closed queue producer"
        );
    }
}

/// Builds producers from configuration
pub struct ProducerFactory;

impl ProducerFactory {
    /// Create a producer that sends each payload's `Display` output
    pub fn create<T>(config: QueueConfig) -> Result<Box<dyn MessageProducer<T>>, QueueError>
    where
        T: Display + Send + Sync + 'static,
    {
        Ok(Box::new(QueueProducer::<T>::new(config)?))
    }

    /// Create a producer that sends each payload as JSON
    pub fn create_json<T>(config: QueueConfig) -> Result<Box<dyn MessageProducer<T>>, QueueError>
    where
        T: Serialize + Send + Sync + 'static,
    {
        Ok(Box::new(QueueProducer::<T>::json(config)?))
    }

    /// Create a producer with a custom transformer
    pub fn create_with_transformer<T, F>(
        config: QueueConfig,
        transformer: F,
    ) -> Result<Box<dyn MessageProducer<T>>, QueueError>
    where
        T: Send + Sync + 'static,
        F: Fn(&T) -> Result<String, SerializationError> + Send + Sync + 'static,
    {
        Ok(Box::new(QueueProducer::with_transformer(
            config,
            transformer,
        )?))
    }
}
