//! Message types and delivery identifiers.

use crate::error::ValidationError;
use crate::provider::ProviderType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Provider-assigned identifier of a message, stable for one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4();
        Self(id.to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// Opaque, delivery-scoped token used to delete or extend an in-flight message
///
/// A redelivery of the same message produces a new handle; handles from an
/// earlier delivery are rejected by the provider once the lease has expired.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle {
    handle: String,
    provider_type: ProviderType,
}

impl ReceiptHandle {
    /// Create new receipt handle
    pub fn new(handle: String, provider_type: ProviderType) -> Self {
        Self {
            handle,
            provider_type,
        }
    }

    /// Get handle string
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Get provider type
    pub fn provider_type(&self) -> ProviderType {
        self.provider_type
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Receipt handles can be several hundred bytes long
        const SHOWN: usize = 16;
        match self.handle.char_indices().nth(SHOWN) {
            Some((cut, _)) => write!(f, "{}...", &self.handle[..cut]),
            None => write!(f, "{}", self.handle),
        }
    }
}

/// A message received from the queue with its lease token
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub body: String,
    pub receipt_handle: ReceiptHandle,
    pub attributes: HashMap<String, String>,
    pub delivery_count: u32,
    pub received_at: Timestamp,
}

impl ReceivedMessage {
    /// Create a received message for the first delivery attempt
    pub fn new(message_id: MessageId, body: String, receipt_handle: ReceiptHandle) -> Self {
        Self {
            message_id,
            body,
            receipt_handle,
            attributes: HashMap::new(),
            delivery_count: 1,
            received_at: Timestamp::now(),
        }
    }

    /// Set the number of times the provider has delivered this message
    pub fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.delivery_count = delivery_count;
        self
    }

    /// Add a provider attribute
    pub fn with_attribute(mut self, key: String, value: String) -> Self {
        self.attributes.insert(key, value);
        self
    }

    /// Check whether this delivery is a redelivery of an earlier attempt
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
