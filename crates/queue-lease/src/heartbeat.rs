//! Periodic visibility extension for in-flight messages.
//!
//! The [`HeartbeatScheduler`] spawns one task per leased message. Each task
//! waits one interval, then asks the transport to extend the message's
//! visibility by two intervals, and repeats until its lease is cancelled or
//! the scheduler shuts down. A shared semaphore bounds how many extensions
//! run at the same time across all leases.
//!
//! Failed extensions are logged and the schedule carries on; a message whose
//! extensions keep failing will eventually become visible again and be
//! redelivered, which is the normal at-least-once outcome.

use crate::error::{QueueError, ValidationError};
use crate::lease::LeaseHandle;
use crate::message::{MessageId, ReceiptHandle, ReceivedMessage};
use crate::provider::HeartbeatConfig;
use crate::transport::Transport;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "heartbeat_tests.rs"]
mod tests;

/// Consecutive failed extensions of one lease that trigger an error log
pub const FAILURE_ESCALATION_THRESHOLD: u32 = 3;

/// Snapshot of the scheduler's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatStats {
    /// Extension requests sent
    pub fires: u64,
    /// Extension requests that failed
    pub failures: u64,
    /// Failure streaks that reached [`FAILURE_ESCALATION_THRESHOLD`]
    pub escalations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    fires: AtomicU64,
    failures: AtomicU64,
    escalations: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> HeartbeatStats {
        HeartbeatStats {
            fires: self.fires.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
        }
    }
}

/// Bounded pool of lease keepalive tasks
pub struct HeartbeatScheduler {
    transport: Arc<dyn Transport>,
    interval: Duration,
    extension_seconds: u32,
    permits: Arc<Semaphore>,
    counters: Arc<Counters>,
    shutdown: watch::Sender<bool>,
    shut_down: AtomicBool,
}

impl HeartbeatScheduler {
    /// Create a scheduler extending leases through `transport`
    ///
    /// # Errors
    ///
    /// Returns a validation error if heartbeats are disabled in `config` or
    /// the worker pool is empty.
    pub fn new(transport: Arc<dyn Transport>, config: HeartbeatConfig) -> Result<Self, QueueError> {
        let (Some(interval), Some(extension_seconds)) = (config.interval(), config.extension_seconds())
        else {
            return Err(ValidationError::OutOfRange {
                field: "heartbeat.interval_seconds".to_string(),
                message: format!(
                    "must be positive to schedule heartbeats, got {}",
                    config.interval_seconds
                ),
            }
            .into());
        };

        if config.worker_pool_size == 0 {
            return Err(ValidationError::OutOfRange {
                field: "heartbeat.worker_pool_size".to_string(),
                message: "must be at least 1".to_string(),
            }
            .into());
        }

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            transport,
            interval,
            extension_seconds,
            permits: Arc::new(Semaphore::new(config.worker_pool_size)),
            counters: Arc::new(Counters::default()),
            shutdown,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Start keeping `message` alive
    ///
    /// The first extension happens one interval from now. Must be called from
    /// within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn schedule(&self, message: &ReceivedMessage) -> Result<LeaseHandle, QueueError> {
        if self.is_shut_down() {
            return Err(QueueError::closed("heartbeat scheduler"));
        }

        let (cancel, cancelled) = watch::channel(false);
        let task = LeaseTask {
            transport: Arc::clone(&self.transport),
            message_id: message.message_id.clone(),
            receipt: message.receipt_handle.clone(),
            interval: self.interval,
            extension_seconds: self.extension_seconds,
            permits: Arc::clone(&self.permits),
            counters: Arc::clone(&self.counters),
        };
        let join = tokio::spawn(task.run(cancelled, self.shutdown.subscribe()));

        debug!(
            message_id = %message.message_id,
            interval_seconds = self.interval.as_secs(),
            "Scheduled heartbeat"
        );

        Ok(LeaseHandle::new(message.message_id.clone(), cancel, join))
    }

    /// Stop accepting leases and stop every running keepalive task
    ///
    /// An extension already in progress completes; no new one starts.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.permits.close();
        self.shutdown.send_replace(true);
        info!(stats = ?self.stats(), "Heartbeat scheduler shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Current counter values
    pub fn stats(&self) -> HeartbeatStats {
        self.counters.snapshot()
    }

    /// Time between two extensions of one lease
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Visibility timeout requested by each extension
    pub fn extension_seconds(&self) -> u32 {
        self.extension_seconds
    }
}

impl std::fmt::Debug for HeartbeatScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatScheduler")
            .field("interval", &self.interval)
            .field("extension_seconds", &self.extension_seconds)
            .field("available_permits", &self.permits.available_permits())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Everything one keepalive task needs
struct LeaseTask {
    transport: Arc<dyn Transport>,
    message_id: MessageId,
    receipt: ReceiptHandle,
    interval: Duration,
    extension_seconds: u32,
    permits: Arc<Semaphore>,
    counters: Arc<Counters>,
}

/// Resolves once the flag is set or its sender is gone
async fn raised(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|raised| *raised).await;
}

impl LeaseTask {
    async fn run(
        self,
        mut cancelled: watch::Receiver<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticks = interval_at(Instant::now() + self.interval, self.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failure_streak = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = raised(&mut cancelled) => break,
                _ = raised(&mut shutdown) => break,
                _ = ticks.tick() => {}
            }

            let permit = tokio::select! {
                biased;
                _ = raised(&mut cancelled) => break,
                _ = raised(&mut shutdown) => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            self.fire(&mut failure_streak).await;
            drop(permit);
        }

        debug!(message_id = %self.message_id, "Heartbeat stopped");
    }

    async fn fire(&self, failure_streak: &mut u32) {
        self.counters.fires.fetch_add(1, Ordering::Relaxed);

        match self
            .transport
            .change_visibility(&self.receipt, self.extension_seconds)
            .await
        {
            Ok(()) => {
                if *failure_streak > 0 {
                    info!(
                        message_id = %self.message_id,
                        failed_attempts = *failure_streak,
                        "Visibility extension recovered"
                    );
                }
                *failure_streak = 0;
                debug!(
                    message_id = %self.message_id,
                    visibility_timeout = self.extension_seconds,
                    "Extended message visibility"
                );
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                *failure_streak += 1;
                warn!(
                    message_id = %self.message_id,
                    error = %e,
                    consecutive_failures = *failure_streak,
                    "Failed to extend message visibility"
                );

                if *failure_streak == FAILURE_ESCALATION_THRESHOLD {
                    self.counters.escalations.fetch_add(1, Ordering::Relaxed);
                    error!(
                        message_id = %self.message_id,
                        error = %e,
                        consecutive_failures = *failure_streak,
                        "Visibility extension keeps failing; message may be redelivered"
                    );
                }
            }
        }
    }
}
