//! Queue provider implementations.
//!
//! This module contains concrete implementations of the [`Transport`](crate::Transport)
//! trait for the supported queue backends.

pub mod memory;
pub mod sqs;

pub use memory::InMemoryTransport;
pub use sqs::SqsTransport;
