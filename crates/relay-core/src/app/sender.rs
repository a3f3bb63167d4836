//! Sender - 1 つの queue への publish

use std::sync::Arc;

use tracing::{debug, info};

use crate::app::client::ClientInner;
use crate::domain::{MessageBatch, OutboundMessage, PublishError};

/// Publishes batches to one queue.
pub struct Sender {
    queue: String,
    client: Arc<ClientInner>,
}

impl Sender {
    pub(crate) fn new(queue: String, client: Arc<ClientInner>) -> Self {
        Self { queue, client }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Empty batch sized to the transport's limits.
    pub fn create_batch(&self) -> MessageBatch {
        MessageBatch::new(self.client.transport().batch_limits())
    }

    /// Sends every message in `batch` atomically. An empty batch is a no-op.
    pub async fn send_batch(&self, batch: MessageBatch) -> Result<(), PublishError> {
        if self.client.is_closed() {
            return Err(PublishError::Closed);
        }
        if batch.is_empty() {
            debug!(queue = %self.queue, "skipping empty batch");
            return Ok(());
        }

        let (count, bytes) = (batch.len(), batch.size_bytes());
        self.client
            .transport()
            .send_batch(&self.queue, batch.into_messages())
            .await?;

        info!(queue = %self.queue, count, bytes, "batch sent");
        Ok(())
    }

    /// Sends a single message as a batch of one.
    pub async fn send_message(&self, message: impl Into<OutboundMessage>) -> Result<(), PublishError> {
        let mut batch = self.create_batch();
        batch
            .try_push(message.into())
            .map_err(|err| PublishError::MessageTooLarge(err.size))?;
        self.send_batch(batch).await
    }
}
