//! # Queue-Lease CLI
//!
//! Command-line interface for sending and receiving queue messages.
//!
//! This module provides CLI commands for:
//! - Sending payloads to a queue
//! - Receiving a batch with the lease kept alive while it is held
//! - Validating and printing the resolved configuration

use clap::{Args, Parser, Subcommand};
use queue_lease::{
    ConfigurationError, MessageConsumer, MessageProducer, QueueConfig, QueueConsumer, QueueError,
    QueueProducer, ReceivedMessage,
};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// ============================================================================
// CLI Structure
// ============================================================================

/// Queue-Lease CLI - queue messages with lease keepalive
#[derive(Parser, Debug)]
#[command(name = "queue-lease")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Send and receive queue messages with lease keepalive")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "QUEUE_LEASE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Logging level or filter directive
    #[arg(short, long, default_value = "warn", global = true)]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(flatten)]
    pub overrides: ConfigOverrides,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Command-line values that take precedence over file and environment settings
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    /// Queue provider (sqs, in-memory)
    #[arg(long, global = true)]
    pub provider: Option<String>,

    /// Queue URL (SQS) or queue name (in-memory)
    #[arg(long, global = true)]
    pub queue_url: Option<String>,

    /// AWS region
    #[arg(long, global = true)]
    pub region: Option<String>,

    /// Endpoint override, e.g. http://localhost:4566
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    /// Heartbeat interval in seconds, -1 disables heartbeats
    #[arg(long, global = true, allow_hyphen_values = true)]
    pub heartbeat_interval: Option<i32>,

    /// Maximum messages per receive
    #[arg(long, global = true)]
    pub max_messages: Option<u32>,
}

impl ConfigOverrides {
    /// Apply every override that was given on the command line
    pub fn apply(&self, config: &mut QueueConfig) {
        if let Some(provider) = &self.provider {
            config.provider = provider.clone();
        }
        if let Some(queue_url) = &self.queue_url {
            config.queue_url = queue_url.clone();
        }
        if let Some(region) = &self.region {
            config.region = region.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = Some(endpoint.clone());
        }
        if let Some(interval) = self.heartbeat_interval {
            config.heartbeat.interval_seconds = interval;
        }
        if let Some(max_messages) = self.max_messages {
            config.receive.max_messages = max_messages;
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send one message per payload and print the message ids
    Send {
        /// Message bodies
        #[arg(required = true)]
        payloads: Vec<String>,
    },

    /// Receive one batch and print each message as a JSON line
    Receive {
        /// Long-poll wait in seconds
        #[arg(short, long, default_value = "0")]
        wait: u64,

        /// Seconds to hold the batch before finishing, with leases kept alive
        #[arg(long, default_value = "0")]
        hold: u64,

        /// Acknowledge every received message
        #[arg(short, long)]
        ack: bool,
    },

    /// Validate and print the resolved configuration
    Config {
        /// Output format for configuration
        #[arg(short = 'f', long, default_value = "toml")]
        format: ConfigFormat,
    },
}

/// Configuration format options
#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// TOML format
    Toml,
    /// JSON format
    Json,
}

// ============================================================================
// Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Output error: {message}")]
    Output { message: String },
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) | Self::Queue(QueueError::ConfigurationError(_)) => 1,
            Self::Queue(_) => 2,
            Self::InvalidArgument { .. } => 3,
            Self::Io(_) | Self::Output { .. } => 4,
        }
    }
}

// ============================================================================
// Command Execution
// ============================================================================

/// Parse the command line and run it
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();
    initialize_logging(&cli)?;
    run(cli).await
}

/// Run a parsed command line
pub async fn run(cli: Cli) -> Result<(), CliError> {
    let config = resolve_config(&cli)?;
    let mut out = std::io::stdout();

    match cli.command {
        Commands::Send { payloads } => send(config, &payloads, &mut out).await,
        Commands::Receive { wait, hold, ack } => {
            receive(
                config,
                Duration::from_secs(wait),
                Duration::from_secs(hold),
                ack,
                &mut out,
            )
            .await
        }
        Commands::Config { format } => print_config(&config, &format, &mut out),
    }
}

/// Load configuration, apply command-line overrides and validate the result
pub fn resolve_config(cli: &Cli) -> Result<QueueConfig, CliError> {
    let mut config = QueueConfig::load(cli.config.as_deref())?;
    cli.overrides.apply(&mut config);
    let provider = config.validate()?;

    debug!(provider = %provider, queue_url = %config.queue_url, "Resolved configuration");
    Ok(config)
}

async fn send(
    config: QueueConfig,
    payloads: &[String],
    out: &mut impl Write,
) -> Result<(), CliError> {
    let producer = QueueProducer::<String>::new(config)?;
    let result = send_all(&producer, payloads, out).await;
    producer.close();
    result
}

async fn send_all(
    producer: &QueueProducer<String>,
    payloads: &[String],
    out: &mut impl Write,
) -> Result<(), CliError> {
    for payload in payloads {
        let message_id = producer.send(payload).await?;
        writeln!(out, "{}", message_id)?;
    }
    info!(count = payloads.len(), "Sent messages");
    Ok(())
}

async fn receive(
    config: QueueConfig,
    wait: Duration,
    hold: Duration,
    ack: bool,
    out: &mut impl Write,
) -> Result<(), CliError> {
    let consumer = QueueConsumer::new(config)?;
    let result = receive_batch(&consumer, wait, hold, ack, out).await;
    consumer.close();
    result
}

async fn receive_batch(
    consumer: &QueueConsumer,
    wait: Duration,
    hold: Duration,
    ack: bool,
    out: &mut impl Write,
) -> Result<(), CliError> {
    let messages = consumer.receive_with_timeout(wait).await?;
    info!(count = messages.len(), "Received batch");

    for message in &messages {
        writeln!(out, "{}", message_line(message))?;
    }
    out.flush()?;

    if !hold.is_zero() && !messages.is_empty() {
        info!(
            hold_seconds = hold.as_secs(),
            active_leases = consumer.active_leases(),
            "Holding batch"
        );
        tokio::time::sleep(hold).await;
    }

    if ack {
        for message in &messages {
            consumer.acknowledge_message(message).await?;
        }
    } else if !messages.is_empty() {
        warn!(
            count = messages.len(),
            "Leaving messages unacknowledged; they reappear after the visibility timeout"
        );
    }

    Ok(())
}

/// One JSON line describing a received message
pub fn message_line(message: &ReceivedMessage) -> serde_json::Value {
    serde_json::json!({
        "message_id": message.message_id.to_string(),
        "body": message.body,
        "receipt_handle": message.receipt_handle.handle(),
        "delivery_count": message.delivery_count,
        "attributes": message.attributes,
    })
}

fn print_config(
    config: &QueueConfig,
    format: &ConfigFormat,
    out: &mut impl Write,
) -> Result<(), CliError> {
    let mut shown = config.clone();
    if shown.secret_access_key.is_some() {
        shown.secret_access_key = Some("<redacted>".to_string());
    }

    let rendered = match format {
        ConfigFormat::Toml => toml::to_string(&shown).map_err(|e| CliError::Output {
            message: e.to_string(),
        })?,
        ConfigFormat::Json => serde_json::to_string_pretty(&shown).map_err(|e| CliError::Output {
            message: e.to_string(),
        })?,
    };

    writeln!(out, "{}", rendered.trim_end())?;
    Ok(())
}

/// Install the global tracing subscriber; logs go to stderr
pub fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .map_err(|e| CliError::InvalidArgument {
            arg: "log-level".to_string(),
            message: e.to_string(),
        })?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if cli.json_logs {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    // A subscriber installed earlier in the process stays in place
    if installed.is_err() {
        debug!("Tracing subscriber already installed");
    }
    Ok(())
}
