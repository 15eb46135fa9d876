//! Lease bookkeeping for in-flight messages.
//!
//! Every message received with heartbeats enabled owns a keepalive task. The
//! [`LeaseRegistry`] maps the message id to the [`LeaseHandle`] of that task
//! so the acknowledgement path can find and stop it.

use crate::message::MessageId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

#[cfg(test)]
#[path = "lease_tests.rs"]
mod tests;

/// Handle to the keepalive task of one message
///
/// Cancelling stops future heartbeats; a heartbeat already running is not
/// interrupted. Dropping the handle stops the task as well.
pub struct LeaseHandle {
    message_id: MessageId,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LeaseHandle {
    pub(crate) fn new(message_id: MessageId, cancel: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self {
            message_id,
            cancel,
            task,
        }
    }

    /// Id of the message this lease keeps alive
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Stop future heartbeats
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Check whether the lease was cancelled
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Check whether the keepalive task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl std::fmt::Debug for LeaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseHandle")
            .field("message_id", &self.message_id)
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Concurrent map of message id to lease handle
///
/// At most one handle is held per message id. The lock is never held across
/// an await point.
#[derive(Default)]
pub struct LeaseRegistry {
    leases: Mutex<HashMap<MessageId, LeaseHandle>>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn leases(&self) -> MutexGuard<'_, HashMap<MessageId, LeaseHandle>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the lease of a message
    ///
    /// A lease already registered for the same id is replaced, cancelled and
    /// returned; the latest delivery of a message owns its keepalive.
    pub fn register(&self, message_id: MessageId, handle: LeaseHandle) -> Option<LeaseHandle> {
        let replaced = self.leases().insert(message_id, handle);

        if let Some(previous) = &replaced {
            previous.cancel();
            debug!(
                message_id = %previous.message_id(),
                "Replaced existing lease"
            );
        }

        replaced
    }

    /// Remove and return the lease of a message, if any
    ///
    /// The handle is not cancelled here; callers decide when to stop it.
    pub fn remove(&self, message_id: &MessageId) -> Option<LeaseHandle> {
        self.leases().remove(message_id)
    }

    /// Cancel and drop every registered lease, returning how many there were
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<LeaseHandle> = self.leases().drain().map(|(_, handle)| handle).collect();

        for handle in &drained {
            handle.cancel();
        }

        drained.len()
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.leases().contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.leases().len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases().is_empty()
    }
}

impl std::fmt::Debug for LeaseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseRegistry")
            .field("active", &self.len())
            .finish()
    }
}
