//! Integration tests for the SQS transport against a mocked HTTP endpoint
//!
//! These tests verify:
//! - Query API requests are signed form posts to the endpoint override
//! - Send and receive responses are parsed into messages
//! - SQS error codes map onto queue errors
//! - A consumer keeps an SQS message leased until it is acknowledged

use queue_lease::{
    HeartbeatConfig, MessageConsumer, QueueConfig, QueueConsumer, QueueError, ReceiptHandle,
    SqsTransport, Transport,
};
use std::time::Duration;
use wiremock::matchers::{body_string_contains, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SEND_RESPONSE: &str = r#"<SendMessageResponse xmlns="http://queue.amazonaws.com/doc/2012-11-05/">
    <SendMessageResult>
        <MD5OfMessageBody>fafb00f5732ab283681e124bf8747ed1</MD5OfMessageBody>
        <MessageId>5fea7756-0ea4-451a-a703-a558b933e274</MessageId>
    </SendMessageResult>
    <ResponseMetadata>
        <RequestId>27daac76-34dd-47df-bd01-1f6e873584a0</RequestId>
    </ResponseMetadata>
</SendMessageResponse>"#;

const RECEIVE_RESPONSE: &str = r#"<ReceiveMessageResponse>
    <ReceiveMessageResult>
        <Message>
            <MessageId>first-id</MessageId>
            <ReceiptHandle>receipt-one</ReceiptHandle>
            <MD5OfBody>fafb00f5732ab283681e124bf8747ed1</MD5OfBody>
            <Body>{"order":1,"note":"a &lt; b"}</Body>
            <Attribute>
                <Name>ApproximateReceiveCount</Name>
                <Value>3</Value>
            </Attribute>
            <Attribute>
                <Name>SentTimestamp</Name>
                <Value>1705320000000</Value>
            </Attribute>
        </Message>
        <Message>
            <MessageId>second-id</MessageId>
            <ReceiptHandle>receipt-two</ReceiptHandle>
            <Body>plain text</Body>
        </Message>
    </ReceiveMessageResult>
    <ResponseMetadata>
        <RequestId>b6633655-283d-45b4-aee4-4e84e0ae6afa</RequestId>
    </ResponseMetadata>
</ReceiveMessageResponse>"#;

const SINGLE_RECEIVE_RESPONSE: &str = r#"<ReceiveMessageResponse>
    <ReceiveMessageResult>
        <Message>
            <MessageId>leased-id</MessageId>
            <ReceiptHandle>leased-receipt</ReceiptHandle>
            <Body>work</Body>
        </Message>
    </ReceiveMessageResult>
</ReceiveMessageResponse>"#;

const EMPTY_RESULT: &str = r#"<ChangeMessageVisibilityResponse>
    <ResponseMetadata>
        <RequestId>6a7a282a-d013-4a59-aba9-335b0fa48bed</RequestId>
    </ResponseMetadata>
</ChangeMessageVisibilityResponse>"#;

fn error_response(code: &str, message: &str) -> String {
    format!(
        r#"<ErrorResponse>
    <Error>
        <Type>Sender</Type>
        <Code>{}</Code>
        <Message>{}</Message>
        <Detail/>
    </Error>
    <RequestId>42d59b56-7407-4c4a-be0f-4c88daeea257</RequestId>
</ErrorResponse>"#,
        code, message
    )
}

fn config_for(server: &MockServer) -> QueueConfig {
    QueueConfig::sqs(format!("{}/000000000000/jobs", server.uri()), "us-east-1")
        .with_endpoint(server.uri())
        .with_credentials("test", "test")
}

fn transport_for(server: &MockServer) -> SqsTransport {
    SqsTransport::new(&config_for(server)).unwrap()
}

/// Verify that a send is a signed form post and returns the SQS message id
#[tokio::test]
async fn test_send_message() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(header_exists("authorization"))
        .and(header_exists("x-amz-date"))
        .and(body_string_contains("Action=SendMessage"))
        .and(body_string_contains("Version=2012-11-05"))
        .and(body_string_contains("MessageBody=hello"))
        .respond_with(ResponseTemplate::new(200).set_body_string(SEND_RESPONSE))
        .expect(1)
        .mount(&server)
        .await;
    let transport = transport_for(&server);

    // Act
    let message_id = transport.send("hello").await.unwrap();

    // Assert
    assert_eq!(message_id.as_str(), "5fea7756-0ea4-451a-a703-a558b933e274");
}

/// Verify that a receive response is parsed into messages with attributes
#[tokio::test]
async fn test_receive_messages() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=ReceiveMessage"))
        .and(body_string_contains("MaxNumberOfMessages=5"))
        .and(body_string_contains("WaitTimeSeconds=20"))
        .respond_with(ResponseTemplate::new(200).set_body_string(RECEIVE_RESPONSE))
        .expect(1)
        .mount(&server)
        .await;
    let transport = transport_for(&server);

    // Act: long-poll waits beyond the SQS maximum are clamped
    let messages = transport
        .receive(5, Duration::from_secs(60))
        .await
        .unwrap();

    // Assert
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].message_id.as_str(), "first-id");
    assert_eq!(messages[0].body, r#"{"order":1,"note":"a < b"}"#);
    assert_eq!(messages[0].receipt_handle.handle(), "receipt-one");
    assert_eq!(messages[0].delivery_count, 3);
    assert_eq!(
        messages[0].attributes.get("SentTimestamp").map(String::as_str),
        Some("1705320000000")
    );
    assert_eq!(messages[1].body, "plain text");
    assert_eq!(messages[1].delivery_count, 1);
}

/// Verify that delete and visibility changes carry the receipt handle
#[tokio::test]
async fn test_delete_and_change_visibility() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=ChangeMessageVisibility"))
        .and(body_string_contains("ReceiptHandle=receipt-one"))
        .and(body_string_contains("VisibilityTimeout=60"))
        .respond_with(ResponseTemplate::new(200).set_body_string(EMPTY_RESULT))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=DeleteMessage"))
        .and(body_string_contains("ReceiptHandle=receipt-one"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<DeleteMessageResponse/>"))
        .expect(1)
        .mount(&server)
        .await;
    let transport = transport_for(&server);
    let receipt = ReceiptHandle::new(
        "receipt-one".to_string(),
        queue_lease::ProviderType::AwsSqs,
    );

    // Act
    transport.change_visibility(&receipt, 60).await.unwrap();
    transport.delete(&receipt).await.unwrap();
}

/// Verify that a missing queue maps to QueueNotFound
#[tokio::test]
async fn test_missing_queue_error() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string(error_response(
            "AWS.SimpleQueueService.NonExistentQueue",
            "The specified queue does not exist for this wsdl version.",
        )))
        .mount(&server)
        .await;
    let transport = transport_for(&server);

    // Act
    let result = transport.send("orphan").await;

    // Assert
    match result {
        Err(QueueError::QueueNotFound { queue }) => assert!(queue.ends_with("/jobs")),
        other => panic!("Expected QueueNotFound, got {:?}", other),
    }
}

/// Verify that a rejected signature maps to AuthenticationFailed
#[tokio::test]
async fn test_signature_rejected() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403).set_body_string(error_response(
            "SignatureDoesNotMatch",
            "The request signature we calculated does not match.",
        )))
        .mount(&server)
        .await;
    let transport = transport_for(&server);

    // Act
    let result = transport.receive(1, Duration::ZERO).await;

    // Assert
    let error = result.unwrap_err();
    assert!(matches!(error, QueueError::AuthenticationFailed { .. }));
    assert!(!error.is_transient());
}

/// Verify that an expired receipt maps to MessageNotFound
#[tokio::test]
async fn test_invalid_receipt_error() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=ChangeMessageVisibility"))
        .respond_with(ResponseTemplate::new(400).set_body_string(error_response(
            "ReceiptHandleIsInvalid",
            "The input receipt handle is invalid.",
        )))
        .mount(&server)
        .await;
    let transport = transport_for(&server);
    let receipt = ReceiptHandle::new("stale".to_string(), queue_lease::ProviderType::AwsSqs);

    // Act
    let result = transport.change_visibility(&receipt, 30).await;

    // Assert
    assert!(matches!(result, Err(QueueError::MessageNotFound { .. })));
}

/// Verify that a server error without a body keeps the HTTP status as code
#[tokio::test]
async fn test_server_error_without_body() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let transport = transport_for(&server);

    // Act
    let result = transport.send("retry later").await;

    // Assert
    match result {
        Err(QueueError::ProviderError { provider, code, .. }) => {
            assert_eq!(provider, "sqs");
            assert_eq!(code, "HTTP503");
        }
        other => panic!("Expected ProviderError, got {:?}", other),
    }
}

/// Verify that a closed transport fails without touching the network
#[tokio::test]
async fn test_closed_transport_makes_no_requests() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(SEND_RESPONSE))
        .expect(0)
        .mount(&server)
        .await;
    let transport = transport_for(&server);

    // Act
    transport.close();
    let result = transport.send("late").await;

    // Assert
    assert!(matches!(result, Err(QueueError::Closed { .. })));
}

/// Verify that a consumer extends an SQS lease until the message is acknowledged
#[tokio::test]
async fn test_consumer_heartbeats_until_acknowledged() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=ReceiveMessage"))
        .respond_with(ResponseTemplate::new(200).set_body_string(SINGLE_RECEIVE_RESPONSE))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=ChangeMessageVisibility"))
        .and(body_string_contains("ReceiptHandle=leased-receipt"))
        .and(body_string_contains("VisibilityTimeout=2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(EMPTY_RESULT))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=DeleteMessage"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<DeleteMessageResponse/>"))
        .expect(1)
        .mount(&server)
        .await;

    let consumer = QueueConsumer::new(
        config_for(&server).with_heartbeat(HeartbeatConfig::every(1)),
    )
    .unwrap();

    // Act
    let batch = consumer.receive().await.unwrap();
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    consumer.acknowledge_message(&batch[0]).await.unwrap();
    let fires_at_ack = consumer.heartbeat_stats().fires;
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    // Assert
    assert_eq!(batch.len(), 1);
    assert!(fires_at_ack >= 2, "got {} fires", fires_at_ack);
    assert_eq!(consumer.heartbeat_stats().fires, fires_at_ack);
    assert_eq!(consumer.heartbeat_stats().failures, 0);
    assert_eq!(consumer.active_leases(), 0);

    consumer.close();
}
