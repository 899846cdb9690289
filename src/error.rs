//! Structured error types for the outbox.
//!
//! `OutboxError` is the only error type that crosses a public API boundary.
//! Store backends and transports may use `anyhow::Error` internally for
//! ergonomics; it gets wrapped before it reaches a caller of [`crate::Outbox`]
//! or [`crate::store::OutboxStore`].

use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the outbox facade and scheduler.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// An operation was attempted before `init()`.
    #[error("outbox used before init()")]
    NotInitialized,

    /// The entry store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The transport failed in a way that could not be classified as a
    /// normal [`crate::transport::SendResult`] (e.g. it panicked or the
    /// adapter itself returned `Err`).
    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),

    /// A caller-supplied `idempotency_key` was empty or longer than 256
    /// characters.
    #[error("invalid idempotency key: must be 1..=256 chars")]
    InvalidIdempotencyKey,

    /// A caller-supplied `channel` was empty.
    #[error("channel must not be empty")]
    EmptyChannel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_initialized_message() {
        assert_eq!(OutboxError::NotInitialized.to_string(), "outbox used before init()");
    }

    #[test]
    fn test_store_error_wraps_and_displays() {
        let err = OutboxError::Store(StoreError::NotInitialized);
        assert!(err.to_string().contains("store error"));
    }

    #[test]
    fn test_transport_error_preserves_source() {
        let err = OutboxError::Transport(anyhow::anyhow!("connection reset"));
        assert!(err.to_string().contains("connection reset"));
    }
}
