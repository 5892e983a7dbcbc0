//! Error taxonomy.
//!
//! Only genuine resource exhaustion surfaces as an `Error`. Misuse (wrong
//! unlock order, unlock by non-owner, destroying a running thread) trips
//! `debug_assert!` instead; timeouts come back as `bool` returns; and
//! cooperative cancellation travels as a confined unwinding payload that
//! never escapes the dying thread.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The OS refused to create a thread or kernel object.
    #[error("out of operating system resources: {0}")]
    ResourceExhaustion(#[source] io::Error),
}
