//! Transport port - メッセージキュー本体
//!
//! 配送・lease・再配送・永続化はすべて transport の責務です。
//! Sender / Processor はこの trait だけを通して transport を使います。
//!
//! # 実装
//! - `impls::InMemoryTransport`（開発・テスト用）

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{
    BatchLimits, DeliveryError, LeaseId, OutboundMessage, PublishError, QueueCounts,
    ReceivedMessage,
};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Budget every batch sent through this transport must respect.
    fn batch_limits(&self) -> BatchLimits;

    /// Enqueue all messages atomically: either every message becomes
    /// deliverable or none does.
    async fn send_batch(
        &self,
        queue: &str,
        messages: Vec<OutboundMessage>,
    ) -> Result<(), PublishError>;

    /// Lease the next deliverable message, waiting up to `max_wait`.
    /// `Ok(None)` means nothing arrived in time.
    async fn receive(
        &self,
        queue: &str,
        max_wait: Duration,
    ) -> Result<Option<ReceivedMessage>, DeliveryError>;

    /// Settle a delivery as done. The message is removed permanently.
    async fn complete(&self, queue: &str, lease: LeaseId) -> Result<(), DeliveryError>;

    /// Release a delivery so the message becomes deliverable again right away.
    async fn abandon(
        &self,
        queue: &str,
        lease: LeaseId,
        reason: Option<String>,
    ) -> Result<(), DeliveryError>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts, DeliveryError>;

    /// Release transport resources. Subsequent calls fail with `Closed`.
    async fn close(&self);
}
