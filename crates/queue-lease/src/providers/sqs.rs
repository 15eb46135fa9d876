//! AWS SQS transport using the HTTP Query API.
//!
//! This module talks to SQS (or an SQS-compatible endpoint such as LocalStack)
//! with direct HTTP calls instead of the AWS SDK, so tests can mock the wire
//! responses.
//!
//! ## Authentication
//!
//! Requests are signed with AWS Signature Version 4. Credentials come from the
//! [`QueueConfig`] when both keys are set there, otherwise from the
//! `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and (optionally)
//! `AWS_SESSION_TOKEN` environment variables. Without credentials the
//! transport can still be constructed; its calls fail with
//! [`QueueError::AuthenticationFailed`].
//!
//! ## Request Format
//!
//! Each call is a `POST` to the endpoint root with a form-encoded body holding
//! `Action`, `Version`, `QueueUrl` and the action parameters. Message bodies
//! are sent as-is; SQS returns them unchanged on receive.
//!
//! ## Limits
//!
//! The SQS service limits are checked before any request is sent:
//! - receive batch size: 1 to 10 messages
//! - long-poll wait: clamped to 0 to 20 seconds
//! - message body: at most 256 KiB
//! - visibility timeout: 0 to 43200 seconds

use crate::error::{ConfigurationError, QueueError, SerializationError, ValidationError};
use crate::message::{MessageId, ReceiptHandle, ReceivedMessage};
use crate::provider::{ProviderType, QueueConfig, SQS_MAX_BATCH_SIZE};
use crate::transport::Transport;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client as HttpClient;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

#[cfg(test)]
#[path = "sqs_tests.rs"]
mod tests;

/// SQS Query API version sent with every request
const API_VERSION: &str = "2012-11-05";

/// Longest long-poll wait SQS accepts
pub const MAX_WAIT_SECONDS: u64 = 20;

/// Longest visibility timeout SQS accepts (12 hours)
pub const MAX_VISIBILITY_TIMEOUT_SECONDS: u32 = 43_200;

/// HTTP timeout; must exceed the longest long-poll wait
const HTTP_TIMEOUT: Duration = Duration::from_secs(MAX_WAIT_SECONDS + 10);

// ============================================================================
// Error Types
// ============================================================================

/// SQS specific errors
#[derive(Debug, thiserror::Error)]
enum SqsError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("SQS service error: {code}: {message}")]
    Service { code: String, message: String },

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Invalid receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("Malformed response: {0}")]
    Serialization(String),
}

impl SqsError {
    /// Map SQS error to QueueError
    fn into_queue_error(self) -> QueueError {
        match self {
            Self::Authentication(message) => QueueError::AuthenticationFailed { message },
            Self::Network(message) => QueueError::ConnectionFailed { message },
            Self::Service { code, message } => QueueError::ProviderError {
                provider: ProviderType::AwsSqs.tag().to_string(),
                code,
                message,
            },
            Self::QueueNotFound(queue) => QueueError::QueueNotFound { queue },
            Self::InvalidReceipt(receipt) => QueueError::MessageNotFound { receipt },
            Self::Serialization(message) => {
                QueueError::SerializationError(SerializationError::InvalidResponse { message })
            }
        }
    }
}

// ============================================================================
// AWS Signature V4 Signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// Static AWS credentials
#[derive(Clone)]
struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl Credentials {
    /// Credentials from the configuration, falling back to the environment
    fn resolve(config: &QueueConfig) -> Option<Self> {
        if let (Some(access_key_id), Some(secret_access_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            return Some(Self {
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                session_token: None,
            });
        }

        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
        Some(Self {
            access_key_id,
            secret_access_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        })
    }
}

/// AWS Signature Version 4 signer for request authentication
///
/// Implements the AWS Signature V4 signing process:
/// 1. Create canonical request (method, URI, query, headers, payload)
/// 2. Create string to sign (algorithm, timestamp, scope, request hash)
/// 3. Derive signing key (4-level HMAC chain)
/// 4. Calculate signature and build Authorization header
#[derive(Clone)]
struct AwsV4Signer {
    credentials: Credentials,
    region: String,
    service: String,
}

impl AwsV4Signer {
    fn new(credentials: Credentials, region: String) -> Self {
        Self {
            credentials,
            region,
            service: "sqs".to_string(),
        }
    }

    /// Sign a request with an empty query string
    ///
    /// Returns the headers to add to the request: `Authorization`,
    /// `x-amz-date`, `host` and, for temporary credentials,
    /// `x-amz-security-token`.
    fn sign_request(
        &self,
        method: &str,
        host: &str,
        path: &str,
        body: &str,
        timestamp: &DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        // Canonical headers (must be sorted by name)
        let mut canonical_headers = format!("host:{}\nx-amz-date:{}\n", host, amz_date);
        let mut signed_headers = "host;x-amz-date".to_string();
        if let Some(token) = &self.credentials.session_token {
            canonical_headers.push_str(&format!("x-amz-security-token:{}\n", token));
            signed_headers.push_str(";x-amz-security-token");
        }

        let payload_hash = format!("{:x}", Sha256::digest(body.as_bytes()));

        // Form-encoded POST bodies leave the canonical query string empty
        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method, path, canonical_headers, signed_headers, payload_hash
        );

        let algorithm = "AWS4-HMAC-SHA256";
        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let canonical_request_hash = format!("{:x}", Sha256::digest(canonical_request.as_bytes()));

        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            algorithm, amz_date, credential_scope, canonical_request_hash
        );

        let signature = self.calculate_signature(&string_to_sign, &date_stamp);

        let authorization_header = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            algorithm, self.credentials.access_key_id, credential_scope, signed_headers, signature
        );

        let mut headers = vec![
            ("Authorization".to_string(), authorization_header),
            ("x-amz-date".to_string(), amz_date),
            ("host".to_string(), host.to_string()),
        ];
        if let Some(token) = &self.credentials.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }

        headers
    }

    /// Derive the signing key and sign `string_to_sign`
    ///
    /// kSecret = "AWS4" + secret, then HMAC over date, region, service and
    /// "aws4_request" in turn.
    fn calculate_signature(&self, string_to_sign: &str, date_stamp: &str) -> String {
        let k_secret = format!("AWS4{}", self.credentials.secret_access_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = hmac_sha256(&k_signing, string_to_sign.as_bytes());

        hex::encode(signature)
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Encode parameters as an `application/x-www-form-urlencoded` body
fn encode_form(params: &[(&str, String)]) -> String {
    let mut pairs = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>();
    pairs.sort();
    pairs.join("&")
}

// ============================================================================
// SqsTransport
// ============================================================================

/// Transport bound to a single SQS queue
pub struct SqsTransport {
    http_client: HttpClient,
    signer: Option<AwsV4Signer>,
    queue_url: String,
    endpoint: Url,
    host: String,
    closed: AtomicBool,
}

impl SqsTransport {
    /// Create a transport for the queue named in `config`
    ///
    /// No request is made here; an unreachable endpoint or bad credentials
    /// surface on the first call.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the queue URL or region is missing or
    /// the endpoint is not a valid URL.
    pub fn new(config: &QueueConfig) -> Result<Self, QueueError> {
        if config.queue_url.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "queue_url".to_string(),
            }
            .into());
        }
        if config.region.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "region".to_string(),
            }
            .into());
        }

        let endpoint = match config.endpoint_override() {
            Some(endpoint) => endpoint.to_string(),
            None => format!("https://sqs.{}.amazonaws.com", config.region),
        };
        let endpoint = Url::parse(&endpoint).map_err(|e| ConfigurationError::Invalid {
            message: format!("Invalid endpoint '{}': {}", endpoint, e),
        })?;

        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(ConfigurationError::Invalid {
                    message: format!("Endpoint '{}' has no host", endpoint),
                }
                .into())
            }
        };

        let signer = Credentials::resolve(config)
            .map(|credentials| AwsV4Signer::new(credentials, config.region.clone()));
        if signer.is_none() {
            warn!(
                queue_url = %config.queue_url,
                "No AWS credentials configured; SQS requests will fail"
            );
        }

        let http_client = HttpClient::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            http_client,
            signer,
            queue_url: config.queue_url.clone(),
            endpoint,
            host,
            closed: AtomicBool::new(false),
        })
    }

    /// Queue URL this transport is bound to
    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    /// Endpoint requests are sent to
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::closed("SQS transport"));
        }
        Ok(())
    }

    /// Send one signed Query API call and return the response body
    async fn call(&self, action: &str, params: Vec<(&str, String)>) -> Result<String, SqsError> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| SqsError::Authentication("No credentials configured".to_string()))?;

        let mut form = vec![
            ("Action", action.to_string()),
            ("Version", API_VERSION.to_string()),
            ("QueueUrl", self.queue_url.clone()),
        ];
        form.extend(params);
        let body = encode_form(&form);

        let auth_headers =
            signer.sign_request("POST", &self.host, self.endpoint.path(), &body, &Utc::now());

        let mut request = self
            .http_client
            .post(self.endpoint.clone())
            .header("content-type", "application/x-www-form-urlencoded");
        for (key, value) in auth_headers {
            request = request.header(key.as_str(), value);
        }

        let response = request.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                SqsError::Network(format!("Request timeout: {}", e))
            } else if e.is_connect() {
                SqsError::Network(format!("Connection failed: {}", e))
            } else {
                SqsError::Network(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let response_body = response
            .text()
            .await
            .map_err(|e| SqsError::Network(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(self.parse_error_response(&response_body, status.as_u16()));
        }

        Ok(response_body)
    }

    /// Parse an error response from XML
    fn parse_error_response(&self, xml: &str, status_code: u16) -> SqsError {
        use quick_xml::events::Event;
        use quick_xml::Reader;

        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut error_code = None;
        let mut error_message = None;
        let mut in_error = false;
        let mut in_code = false;
        let mut in_message = false;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => match e.name().as_ref() {
                    b"Error" => in_error = true,
                    b"Code" if in_error => in_code = true,
                    b"Message" if in_error => in_message = true,
                    _ => {}
                },
                Ok(Event::Text(e)) => {
                    if in_code {
                        error_code = e.unescape().ok().map(|s| s.into_owned());
                    } else if in_message {
                        error_message = e.unescape().ok().map(|s| s.into_owned());
                    }
                }
                Ok(Event::End(ref e)) => match e.name().as_ref() {
                    b"Error" => in_error = false,
                    b"Code" => in_code = false,
                    b"Message" => in_message = false,
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Err(_) => break,
                _ => {}
            }
            buf.clear();
        }

        let code = error_code.unwrap_or_else(|| format!("HTTP{}", status_code));
        let message = error_message.unwrap_or_else(|| "Unknown error".to_string());

        match code.as_str() {
            "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" => {
                SqsError::QueueNotFound(self.queue_url.clone())
            }
            "InvalidClientTokenId"
            | "UnrecognizedClientException"
            | "SignatureDoesNotMatch"
            | "IncompleteSignature"
            | "MissingAuthenticationToken"
            | "ExpiredToken"
            | "AccessDenied"
            | "AccessDeniedException" => {
                SqsError::Authentication(format!("{}: {}", code, message))
            }
            "ReceiptHandleIsInvalid"
            | "InvalidReceiptHandle"
            | "AWS.SimpleQueueService.MessageNotInflight"
            | "MessageNotInflight" => SqsError::InvalidReceipt(message),
            _ if status_code == 401 || status_code == 403 => {
                SqsError::Authentication(format!("{}: {}", code, message))
            }
            _ => SqsError::Service { code, message },
        }
    }

    /// Parse a SendMessage XML response
    fn parse_send_message_response(xml: &str) -> Result<MessageId, SqsError> {
        use quick_xml::events::Event;
        use quick_xml::Reader;

        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut in_message_id = false;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"MessageId" => {
                    in_message_id = true;
                }
                Ok(Event::Text(e)) if in_message_id => {
                    let message_id = e
                        .unescape()
                        .map_err(|e| SqsError::Serialization(format!("Failed to parse XML: {}", e)))?;
                    return MessageId::from_str(&message_id)
                        .map_err(|e| SqsError::Serialization(e.to_string()));
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(SqsError::Serialization(format!("XML parsing error: {}", e)))
                }
                _ => {}
            }
            buf.clear();
        }

        Err(SqsError::Serialization(
            "MessageId not found in response".to_string(),
        ))
    }

    /// Parse a ReceiveMessage XML response
    ///
    /// Text is not trimmed so message bodies keep their whitespace. A message
    /// without a receipt handle cannot be acknowledged and is skipped.
    fn parse_receive_message_response(xml: &str) -> Result<Vec<ReceivedMessage>, SqsError> {
        use quick_xml::events::Event;
        use quick_xml::Reader;

        let mut reader = Reader::from_str(xml);

        let mut messages = Vec::new();
        let mut current: Option<Draft> = None;
        let mut attribute_name: Option<String> = None;

        let mut in_message_id = false;
        let mut in_receipt_handle = false;
        let mut in_body = false;
        let mut in_attribute_name = false;
        let mut in_attribute_value = false;

        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => match e.name().as_ref() {
                    b"Message" => current = Some(Draft::default()),
                    b"MessageId" if current.is_some() => in_message_id = true,
                    b"ReceiptHandle" if current.is_some() => in_receipt_handle = true,
                    b"Body" if current.is_some() => in_body = true,
                    b"Name" if current.is_some() => in_attribute_name = true,
                    b"Value" if current.is_some() => in_attribute_value = true,
                    _ => {}
                },
                Ok(Event::Text(e)) => {
                    if let Some(draft) = current.as_mut() {
                        let text = e
                            .unescape()
                            .map_err(|e| {
                                SqsError::Serialization(format!("Failed to parse XML: {}", e))
                            })?
                            .into_owned();

                        if in_message_id {
                            draft.message_id = Some(text.trim().to_string());
                        } else if in_receipt_handle {
                            draft.receipt_handle = Some(text.trim().to_string());
                        } else if in_body {
                            draft.body.get_or_insert_with(String::new).push_str(&text);
                        } else if in_attribute_name {
                            attribute_name = Some(text.trim().to_string());
                        } else if in_attribute_value {
                            if let Some(name) = attribute_name.take() {
                                draft.attributes.insert(name, text.trim().to_string());
                            }
                        }
                    }
                }
                Ok(Event::End(ref e)) => match e.name().as_ref() {
                    b"MessageId" => in_message_id = false,
                    b"ReceiptHandle" => in_receipt_handle = false,
                    b"Body" => in_body = false,
                    b"Name" => in_attribute_name = false,
                    b"Value" => in_attribute_value = false,
                    b"Message" => {
                        if let Some(message) = current.take().and_then(Draft::finish) {
                            messages.push(message);
                        }
                    }
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(SqsError::Serialization(format!("XML parsing error: {}", e)))
                }
                _ => {}
            }
            buf.clear();
        }

        Ok(messages)
    }
}

/// Fields of a `<Message>` element collected while parsing
#[derive(Default)]
struct Draft {
    message_id: Option<String>,
    receipt_handle: Option<String>,
    body: Option<String>,
    attributes: HashMap<String, String>,
}

impl Draft {
    fn finish(self) -> Option<ReceivedMessage> {
        let Some(receipt_handle) = self.receipt_handle.filter(|r| !r.is_empty()) else {
            warn!(
                message_id = ?self.message_id,
                "Skipping SQS message without a receipt handle"
            );
            return None;
        };

        let message_id = self
            .message_id
            .as_deref()
            .and_then(|id| MessageId::from_str(id).ok())
            .unwrap_or_default();
        let delivery_count = self
            .attributes
            .get("ApproximateReceiveCount")
            .and_then(|count| count.parse().ok())
            .unwrap_or(1);

        let mut message = ReceivedMessage::new(
            message_id,
            self.body.unwrap_or_default(),
            ReceiptHandle::new(receipt_handle, ProviderType::AwsSqs),
        )
        .with_delivery_count(delivery_count);
        message.attributes = self.attributes;

        Some(message)
    }
}

impl fmt::Debug for SqsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsTransport")
            .field("queue_url", &self.queue_url)
            .field("endpoint", &self.endpoint.as_str())
            .field("has_credentials", &self.signer.is_some())
            .finish()
    }
}

#[async_trait]
impl Transport for SqsTransport {
    async fn receive(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        self.ensure_open()?;

        if max_messages == 0 || max_messages > SQS_MAX_BATCH_SIZE {
            return Err(ValidationError::OutOfRange {
                field: "max_messages".to_string(),
                message: format!("must be between 1 and {}", SQS_MAX_BATCH_SIZE),
            }
            .into());
        }

        let wait_time_seconds = wait.as_secs().min(MAX_WAIT_SECONDS);

        let response = self
            .call(
                "ReceiveMessage",
                vec![
                    ("MaxNumberOfMessages", max_messages.to_string()),
                    ("WaitTimeSeconds", wait_time_seconds.to_string()),
                    ("AttributeName.1", "All".to_string()),
                ],
            )
            .await
            .map_err(SqsError::into_queue_error)?;

        let messages =
            Self::parse_receive_message_response(&response).map_err(SqsError::into_queue_error)?;

        debug!(
            queue_url = %self.queue_url,
            count = messages.len(),
            "Received messages from SQS"
        );
        Ok(messages)
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.ensure_open()?;

        // DeleteMessage returns an empty result on success
        self.call(
            "DeleteMessage",
            vec![("ReceiptHandle", receipt.handle().to_string())],
        )
        .await
        .map_err(SqsError::into_queue_error)?;

        Ok(())
    }

    async fn send(&self, body: &str) -> Result<MessageId, QueueError> {
        self.ensure_open()?;

        let max_size = ProviderType::AwsSqs.max_message_size();
        if body.len() > max_size {
            return Err(QueueError::MessageTooLarge {
                size: body.len(),
                max_size,
            });
        }

        let response = self
            .call("SendMessage", vec![("MessageBody", body.to_string())])
            .await
            .map_err(SqsError::into_queue_error)?;

        let message_id =
            Self::parse_send_message_response(&response).map_err(SqsError::into_queue_error)?;

        debug!(
            queue_url = %self.queue_url,
            message_id = %message_id,
            "Sent message to SQS"
        );
        Ok(message_id)
    }

    async fn change_visibility(
        &self,
        receipt: &ReceiptHandle,
        timeout_seconds: u32,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;

        if timeout_seconds > MAX_VISIBILITY_TIMEOUT_SECONDS {
            return Err(ValidationError::OutOfRange {
                field: "visibility_timeout".to_string(),
                message: format!(
                    "{} exceeds the maximum of {} seconds",
                    timeout_seconds, MAX_VISIBILITY_TIMEOUT_SECONDS
                ),
            }
            .into());
        }

        self.call(
            "ChangeMessageVisibility",
            vec![
                ("ReceiptHandle", receipt.handle().to_string()),
                ("VisibilityTimeout", timeout_seconds.to_string()),
            ],
        )
        .await
        .map_err(SqsError::into_queue_error)?;

        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::AwsSqs
    }
}
