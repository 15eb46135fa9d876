//! # Queue Lease
//!
//! Provider-agnostic queue consumer and producer for SQS-style queues, with
//! background lease keepalive for messages that take a while to process.
//!
//! This library provides:
//! - One transport interface with AWS SQS and in-memory implementations
//! - A consumer that receives batches and keeps each message leased until it
//!   is acknowledged
//! - A typed producer with pluggable payload transformers
//! - Configuration loading from files and environment variables
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all queue operations
//! - [`message`] - Message structures and receipt handles
//! - [`provider`] - Provider types and configuration
//! - [`transport`] - Transport trait and provider selection
//! - [`providers`] - SQS and in-memory transports
//! - [`lease`] - Lease registry for in-flight messages
//! - [`heartbeat`] - Periodic visibility extension
//! - [`consumer`] / [`producer`] - Call-site interfaces and factories
//!
//! ## Example
//!
//! ```no_run
//! use queue_lease::{ConsumerFactory, HeartbeatConfig, MessageConsumer, QueueConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), queue_lease::QueueError> {
//! let config = QueueConfig::sqs(
//!     "https://sqs.us-east-1.amazonaws.com/123456789012/requests",
//!     "us-east-1",
//! )
//! .with_max_messages(5)
//! .with_heartbeat(HeartbeatConfig::every(30));
//!
//! let consumer = ConsumerFactory::create(config)?;
//! for message in consumer.receive_with_timeout(Duration::from_secs(20)).await? {
//!     // Long-running work; the lease is extended in the background
//!     consumer.acknowledge_message(&message).await?;
//! }
//! consumer.close();
//! # Ok(())
//! # }
//! ```

pub mod consumer;
pub mod error;
pub mod heartbeat;
pub mod lease;
pub mod message;
pub mod producer;
pub mod provider;
pub mod providers;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use consumer::{ConsumerFactory, MessageConsumer, QueueConsumer};
pub use error::{ConfigurationError, QueueError, SerializationError, ValidationError};
pub use heartbeat::{HeartbeatScheduler, HeartbeatStats, FAILURE_ESCALATION_THRESHOLD};
pub use lease::{LeaseHandle, LeaseRegistry};
pub use message::{MessageId, ReceiptHandle, ReceivedMessage, Timestamp};
pub use producer::{MessageProducer, PayloadTransformer, ProducerFactory, QueueProducer};
pub use provider::{HeartbeatConfig, ProviderType, QueueConfig, ReceiveConfig};
pub use providers::{InMemoryTransport, SqsTransport};
pub use transport::{create_transport, Transport, TransportOwnership};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
