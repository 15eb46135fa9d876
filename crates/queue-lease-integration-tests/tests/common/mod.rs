//! Common test utilities for queue-lease integration tests
//!
//! This module provides:
//! - A transport wrapper that records every visibility change
//! - Builders for consumers over private in-memory queues

use async_trait::async_trait;
use queue_lease::{
    HeartbeatConfig, InMemoryTransport, MessageId, ProviderType, QueueConfig, QueueConsumer,
    QueueError, ReceiptHandle, ReceivedMessage, Transport, TransportOwnership,
};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

/// One recorded `change_visibility` call
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct Extension {
    pub receipt: String,
    pub timeout_seconds: u32,
    pub at: Instant,
}

/// Delegates to an in-memory queue and records visibility changes
#[derive(Clone)]
#[allow(dead_code)]
pub struct CountingTransport {
    inner: Arc<InMemoryTransport>,
    extensions: Arc<Mutex<Vec<Extension>>>,
}

#[allow(dead_code)]
impl CountingTransport {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(InMemoryTransport::new(visibility_timeout)),
            extensions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn queue(&self) -> &InMemoryTransport {
        &self.inner
    }

    pub fn extensions(&self) -> Vec<Extension> {
        self.extensions.lock().unwrap().clone()
    }

    pub fn extension_count(&self) -> usize {
        self.extensions.lock().unwrap().len()
    }

    /// Extensions requested for one receipt handle
    pub fn extensions_for(&self, message: &ReceivedMessage) -> usize {
        let receipt = message.receipt_handle.handle();
        self.extensions
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.receipt == receipt)
            .count()
    }
}

#[async_trait]
impl Transport for CountingTransport {
    async fn receive(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        self.inner.receive(max_messages, wait).await
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.inner.delete(receipt).await
    }

    async fn send(&self, body: &str) -> Result<MessageId, QueueError> {
        self.inner.send(body).await
    }

    async fn change_visibility(
        &self,
        receipt: &ReceiptHandle,
        timeout_seconds: u32,
    ) -> Result<(), QueueError> {
        self.extensions.lock().unwrap().push(Extension {
            receipt: receipt.handle().to_string(),
            timeout_seconds,
            at: Instant::now(),
        });
        self.inner.change_visibility(receipt, timeout_seconds).await
    }

    fn close(&self) {
        self.inner.close();
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemory
    }
}

/// Consumer over a private recorded queue
#[allow(dead_code)]
pub fn consumer_with(
    transport: &CountingTransport,
    max_messages: u32,
    heartbeat: HeartbeatConfig,
) -> QueueConsumer {
    let config = QueueConfig::in_memory(unique_queue_name("lease"))
        .with_max_messages(max_messages)
        .with_heartbeat(heartbeat);

    QueueConsumer::with_transport(
        config,
        Arc::new(transport.clone()),
        TransportOwnership::External,
    )
    .unwrap()
}

/// Queue name that no other test shares
pub fn unique_queue_name(prefix: &str) -> String {
    format!("{}-{}", prefix, MessageId::new())
}
