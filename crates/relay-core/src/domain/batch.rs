//! MessageBatch - size-bounded, ordered group of outbound messages.
//!
//! # 設計原則
//! - 予算（件数・バイト数）を超える追加は拒否し、batch は変更しない
//! - 分割はしない（新しい batch を作るかどうかは呼び出し側が決める）
//! - 送信時に `Sender::send_batch` が所有権ごと受け取る（送信後は不変）

use serde::{Deserialize, Serialize};

use super::errors::BatchOverflowError;
use super::message::OutboundMessage;

/// Budget of a single batch, set by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLimits {
    pub max_messages: usize,
    pub max_bytes: usize,
}

impl BatchLimits {
    pub fn new(max_messages: usize, max_bytes: usize) -> Self {
        Self {
            max_messages,
            max_bytes,
        }
    }

    /// Does a batch of `count` messages totalling `bytes` fit?
    pub fn admits(&self, count: usize, bytes: usize) -> bool {
        count <= self.max_messages && bytes <= self.max_bytes
    }
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self::new(100, 256 * 1024)
    }
}

#[derive(Debug, Clone)]
pub struct MessageBatch {
    limits: BatchLimits,
    messages: Vec<OutboundMessage>,
    size_bytes: usize,
}

impl MessageBatch {
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            limits,
            messages: Vec::new(),
            size_bytes: 0,
        }
    }

    /// Append if the message fits; `false` leaves the batch untouched.
    pub fn try_add(&mut self, message: impl Into<OutboundMessage>) -> bool {
        self.try_push(message.into()).is_ok()
    }

    /// Like `try_add`, but returns the rejected message inside the error.
    pub fn try_push(&mut self, message: OutboundMessage) -> Result<(), BatchOverflowError> {
        let size = message.size_hint();
        let fits = self
            .limits
            .admits(self.messages.len() + 1, self.size_bytes.saturating_add(size));
        if !fits {
            return Err(BatchOverflowError::new(
                message,
                self.size_bytes,
                self.limits.max_bytes,
                self.messages.len(),
                self.limits.max_messages,
            ));
        }
        self.size_bytes += size;
        self.messages.push(message);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn remaining_bytes(&self) -> usize {
        self.limits.max_bytes.saturating_sub(self.size_bytes)
    }

    pub fn limits(&self) -> BatchLimits {
        self.limits
    }

    /// Messages in insertion order.
    pub fn messages(&self) -> &[OutboundMessage] {
        &self.messages
    }

    pub(crate) fn into_messages(self) -> Vec<OutboundMessage> {
        self.messages
    }
}
