//! Errors - publish 側と consume 側のエラー分類
//!
//! - publish 側（`BatchOverflowError`, `PublishError`）は同期的に呼び出し元へ返す
//! - consume 側（`DeliveryError`, `HandlerError`）は error handler にのみ流す

use thiserror::Error;

use super::ids::LeaseId;
use super::message::OutboundMessage;

/// A message did not fit the remaining batch budget.
///
/// The rejected message is handed back so the caller can start a new batch.
#[derive(Debug, Error)]
#[error(
    "message of {size} bytes does not fit batch ({used}/{max_bytes} bytes, {count}/{max_messages} messages)"
)]
pub struct BatchOverflowError {
    pub size: usize,
    pub used: usize,
    pub max_bytes: usize,
    pub count: usize,
    pub max_messages: usize,
    message: OutboundMessage,
}

impl BatchOverflowError {
    pub(crate) fn new(
        message: OutboundMessage,
        used: usize,
        max_bytes: usize,
        count: usize,
        max_messages: usize,
    ) -> Self {
        Self {
            size: message.size_hint(),
            used,
            max_bytes,
            count,
            max_messages,
            message,
        }
    }

    pub fn message(&self) -> &OutboundMessage {
        &self.message
    }

    pub fn into_message(self) -> OutboundMessage {
        self.message
    }
}

/// Sending a batch failed. None of its messages were delivered.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("batch of {count} messages / {bytes} bytes exceeds transport limits")]
    BatchTooLarge { count: usize, bytes: usize },

    #[error("message of {0} bytes exceeds the maximum batch size")]
    MessageTooLarge(usize),

    #[error("client is closed")]
    Closed,

    #[error("transport failure: {0}")]
    Transport(String),
}

/// The transport failed to deliver or settle a message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// The lease expired or the message was redelivered under a newer lease.
    #[error("lease lost: {0}")]
    LeaseLost(LeaseId),

    #[error("client is closed")]
    Closed,

    #[error("transport failure: {0}")]
    Transport(String),
}

/// A message handler failed. The message stays unacknowledged.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn other(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Other(Box::new(err))
    }
}
