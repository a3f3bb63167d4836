//! Handler - processor が呼び出す callback と、その引数
//!
//! # 設計原則
//! - message handler は 1 通ごとに `ProcessMessageContext` を受け取る
//! - settle（complete / abandon）は context 経由で行う
//! - 失敗はすべて `ProcessErrorContext` として error handler に届く
//! - error handler が失敗しても processor は止まらない

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, warn};

use crate::domain::{DeliveryError, HandlerError, MessageId, ReceivedMessage};
use crate::ports::Transport;

/// Message callback.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &ProcessMessageContext) -> Result<(), HandlerError>;
}

/// Error callback. Receives failures from every stage of processing.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn on_error(&self, ctx: &ProcessErrorContext);
}

/// One delivery handed to a message handler.
pub struct ProcessMessageContext {
    queue: String,
    message: ReceivedMessage,
    transport: Arc<dyn Transport>,
    settled: AtomicBool,
}

impl ProcessMessageContext {
    pub(crate) fn new(queue: String, message: ReceivedMessage, transport: Arc<dyn Transport>) -> Self {
        Self {
            queue,
            message,
            transport,
            settled: AtomicBool::new(false),
        }
    }

    pub fn message(&self) -> &ReceivedMessage {
        &self.message
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Removes the message from the queue. Fails with `LeaseLost` when the
    /// lease expired or the message was already settled.
    pub async fn complete(&self, message: &ReceivedMessage) -> Result<(), DeliveryError> {
        self.transport.complete(&self.queue, message.lease()).await?;
        self.mark_settled(message);
        Ok(())
    }

    /// Makes the message deliverable again right away.
    pub async fn abandon(
        &self,
        message: &ReceivedMessage,
        reason: Option<String>,
    ) -> Result<(), DeliveryError> {
        self.transport
            .abandon(&self.queue, message.lease(), reason)
            .await?;
        self.mark_settled(message);
        Ok(())
    }

    /// Whether the delivered message has been completed or abandoned.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    fn mark_settled(&self, message: &ReceivedMessage) {
        if message.lease() == self.message.lease() {
            self.settled.store(true, Ordering::Release);
        }
    }
}

/// Stage of processing an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Receive,
    UserCallback,
    Complete,
    Abandon,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

#[derive(Debug)]
pub struct ProcessErrorContext {
    pub queue: String,
    pub source: ErrorSource,
    pub error: ProcessError,
    /// Present when the error concerns a specific delivery.
    pub message_id: Option<MessageId>,
}

/// Error handler that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingErrorHandler;

#[async_trait]
impl ErrorHandler for LoggingErrorHandler {
    async fn on_error(&self, ctx: &ProcessErrorContext) {
        let message_id = ctx.message_id.map(|id| id.to_string()).unwrap_or_default();
        match ctx.source {
            ErrorSource::Receive => warn!(
                queue = %ctx.queue,
                error = %ctx.error,
                "receive failed"
            ),
            source => error!(
                queue = %ctx.queue,
                ?source,
                message_id = %message_id,
                error = %ctx.error,
                "message processing failed"
            ),
        }
    }
}
