//! Tests for provider types and configuration.

use super::*;
use serial_test::serial;
use std::io::Write;

#[test]
fn test_heartbeat_config_defaults() {
    let config = HeartbeatConfig::default();
    assert_eq!(config.interval_seconds, -1);
    assert_eq!(config.worker_pool_size, 2);
    assert!(!config.is_enabled());
    assert_eq!(config.interval(), None);
    assert_eq!(config.extension_seconds(), None);
}

#[test]
fn test_heartbeat_config_custom_values() {
    let config = HeartbeatConfig::new(30, 5);
    assert_eq!(config.interval_seconds, 30);
    assert_eq!(config.worker_pool_size, 5);
    assert!(config.is_enabled());
    assert_eq!(config.interval(), Some(Duration::from_secs(30)));
    assert_eq!(config.extension_seconds(), Some(60));
}

#[test]
fn test_zero_interval_disables_heartbeats() {
    assert!(!HeartbeatConfig::every(0).is_enabled());
    assert!(!HeartbeatConfig::every(-5).is_enabled());
    assert!(HeartbeatConfig::every(1).is_enabled());
}

#[test]
fn test_provider_tag_parsing() {
    assert_eq!("sqs".parse::<ProviderType>().unwrap(), ProviderType::AwsSqs);
    assert_eq!(
        "AWS-SQS".parse::<ProviderType>().unwrap(),
        ProviderType::AwsSqs
    );
    assert_eq!(
        "in-memory".parse::<ProviderType>().unwrap(),
        ProviderType::InMemory
    );
    assert_eq!(
        " memory ".parse::<ProviderType>().unwrap(),
        ProviderType::InMemory
    );
}

#[test]
fn test_unknown_provider_tag_is_rejected() {
    match "kafka".parse::<ProviderType>() {
        Err(ConfigurationError::UnsupportedProvider { provider, .. }) => {
            assert_eq!(provider, "kafka");
        }
        other => panic!("Expected UnsupportedProvider, got: {:?}", other),
    }
}

#[test]
fn test_provider_limits() {
    assert_eq!(ProviderType::AwsSqs.max_message_size(), 256 * 1024);
    assert_eq!(ProviderType::AwsSqs.max_batch_size(), 10);
    assert_eq!(ProviderType::InMemory.max_message_size(), 10 * 1024 * 1024);
}

#[test]
fn test_queue_config_defaults() {
    let config = QueueConfig::default();
    assert_eq!(config.provider, "sqs");
    assert_eq!(config.receive.max_messages, 1);
    assert_eq!(config.heartbeat, HeartbeatConfig::default());
    assert_eq!(config.visibility_timeout_seconds, 30);
    assert!(config.endpoint.is_none());
}

#[test]
fn test_sqs_config_validates() {
    let config = QueueConfig::sqs("requestQueue", "us-east-1")
        .with_heartbeat(HeartbeatConfig::new(5, 5));

    assert_eq!(config.validate().unwrap(), ProviderType::AwsSqs);
    assert_eq!(config.heartbeat.interval_seconds, 5);
    assert_eq!(config.heartbeat.worker_pool_size, 5);
}

#[test]
fn test_sqs_config_requires_queue_url() {
    let config = QueueConfig::sqs("", "us-east-1");
    match config.validate() {
        Err(ConfigurationError::Missing { key }) => assert_eq!(key, "queue_url"),
        other => panic!("Expected missing queue_url, got: {:?}", other),
    }
}

#[test]
fn test_sqs_config_requires_region() {
    let config = QueueConfig::sqs("queue", " ");
    match config.validate() {
        Err(ConfigurationError::Missing { key }) => assert_eq!(key, "region"),
        other => panic!("Expected missing region, got: {:?}", other),
    }
}

#[test]
fn test_in_memory_config_does_not_need_region() {
    let config = QueueConfig::in_memory("jobs");
    assert_eq!(config.validate().unwrap(), ProviderType::InMemory);
}

#[test]
fn test_batch_size_limits_are_enforced() {
    let too_large = QueueConfig::sqs("queue", "us-east-1").with_max_messages(11);
    assert!(matches!(
        too_large.validate(),
        Err(ConfigurationError::Invalid { .. })
    ));

    let zero = QueueConfig::in_memory("jobs").with_max_messages(0);
    assert!(matches!(
        zero.validate(),
        Err(ConfigurationError::Invalid { .. })
    ));

    let in_memory_large = QueueConfig::in_memory("jobs").with_max_messages(50);
    assert!(in_memory_large.validate().is_ok());
}

#[test]
fn test_zero_worker_pool_is_rejected() {
    let config =
        QueueConfig::in_memory("jobs").with_heartbeat(HeartbeatConfig::new(10, 0));
    assert!(matches!(
        config.validate(),
        Err(ConfigurationError::Invalid { .. })
    ));
}

#[test]
fn test_empty_endpoint_is_treated_as_absent() {
    let config = QueueConfig::sqs("queue", "us-east-1").with_endpoint("");
    assert_eq!(config.endpoint_override(), None);

    let config = QueueConfig::sqs("queue", "us-east-1").with_endpoint("http://localhost:4566");
    assert_eq!(config.endpoint_override(), Some("http://localhost:4566"));
}

#[test]
fn test_debug_output_redacts_secret() {
    let config = QueueConfig::sqs("queue", "us-east-1").with_credentials("AKID", "very-secret");
    let debug = format!("{:?}", config);

    assert!(debug.contains("AKID"));
    assert!(!debug.contains("very-secret"));
}

#[test]
#[serial]
fn test_load_from_toml_file() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    writeln!(
        file,
        r#"
provider = "sqs"
queue_url = "http://localhost:4566/000000000000/orders"
region = "eu-west-1"
endpoint = "http://localhost:4566"

[receive]
max_messages = 5

[heartbeat]
interval_seconds = 10
"#
    )
    .unwrap();

    let config = QueueConfig::load(Some(file.path())).unwrap();

    assert_eq!(config.provider_type().unwrap(), ProviderType::AwsSqs);
    assert_eq!(config.region, "eu-west-1");
    assert_eq!(config.receive.max_messages, 5);
    assert_eq!(config.heartbeat.interval_seconds, 10);
    // Unset fields keep their defaults
    assert_eq!(config.heartbeat.worker_pool_size, 2);
    assert_eq!(config.visibility_timeout_seconds, 30);
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    writeln!(
        file,
        r#"
provider = "in-memory"
queue_url = "jobs"

[heartbeat]
interval_seconds = 10
"#
    )
    .unwrap();

    std::env::set_var("QUEUE_LEASE__HEARTBEAT__INTERVAL_SECONDS", "3");
    let result = QueueConfig::load(Some(file.path()));
    std::env::remove_var("QUEUE_LEASE__HEARTBEAT__INTERVAL_SECONDS");

    let config = result.unwrap();
    assert_eq!(config.heartbeat.interval_seconds, 3);
    assert_eq!(config.queue_url, "jobs");
}

#[test]
#[serial]
fn test_load_missing_file_fails() {
    let result = QueueConfig::load(Some(Path::new("/nonexistent/queue-lease.toml")));
    assert!(matches!(result, Err(ConfigurationError::Parsing { .. })));
}
