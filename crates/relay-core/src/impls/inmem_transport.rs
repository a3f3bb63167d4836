//! InMemoryTransport - 開発・テスト用の transport
//!
//! # 実装詳細
//! - queue ごとに `QueueState`（records + ready + leases）を持つ
//! - `receive` はロックを持ったまま待たない（Notify で send を待つ）
//! - lease の期限は注入された Clock で判定する（テストは FixedClock）
//! - 期限切れ lease の回収は `receive` / `counts` / `reclaim_expired` の中で行う

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::domain::{
    BatchLimits, DeliveryError, LeaseId, MessageId, MessageState, OutboundMessage, PublishError,
    QueueCounts, ReceivedMessage,
};
use crate::ports::clock::to_time_delta;
use crate::ports::{Clock, IdGenerator, SystemClock, Transport, UlidGenerator};

/// Per-queue delivery settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// How long a delivered message stays invisible before redelivery.
    pub visibility_timeout: Duration,

    /// Deliveries allowed before a message is dead-lettered. `None` = unlimited.
    pub max_delivery_count: Option<u32>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(60),
            max_delivery_count: Some(10),
        }
    }
}

/// A message the queue gave up on.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: MessageId,
    pub content: OutboundMessage,
    pub delivery_count: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Copy)]
struct ActiveLease {
    id: LeaseId,
    locked_until: DateTime<Utc>,
}

#[derive(Debug)]
struct MessageRecord {
    id: MessageId,
    content: OutboundMessage,
    state: MessageState,
    enqueued_at: DateTime<Utc>,
    delivery_count: u32,
    lease: Option<ActiveLease>,
    last_error: Option<String>,
}

enum Released {
    Requeued,
    DeadLettered,
}

struct QueueState {
    options: QueueOptions,

    /// Live messages (pending or in flight). Settled ones are dropped.
    records: HashMap<MessageId, MessageRecord>,

    /// Delivery order (MessageIds only).
    ready: VecDeque<MessageId>,

    /// Active lease -> message.
    leases: HashMap<LeaseId, MessageId>,

    acknowledged: u64,
    dead_letters: Vec<DeadLetter>,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            records: HashMap::new(),
            ready: VecDeque::new(),
            leases: HashMap::new(),
            acknowledged: 0,
            dead_letters: Vec::new(),
        }
    }

    fn enqueue(&mut self, id: MessageId, content: OutboundMessage, now: DateTime<Utc>) {
        let record = MessageRecord {
            id,
            content,
            state: MessageState::Pending,
            enqueued_at: now,
            delivery_count: 0,
            lease: None,
            last_error: None,
        };
        self.records.insert(id, record);
        self.ready.push_back(id);
    }

    /// Return every expired lease to the queue. Oldest expiry first.
    fn reclaim_expired(&mut self, now: DateTime<Utc>) -> usize {
        let mut expired: Vec<(DateTime<Utc>, MessageId)> = self
            .records
            .values()
            .filter(|r| r.state == MessageState::InFlight)
            .filter_map(|r| r.lease.map(|l| (l.locked_until, r.id)))
            .filter(|(locked_until, _)| *locked_until <= now)
            .collect();
        expired.sort();

        for (_, id) in &expired {
            self.release(*id, "lease expired".to_string());
        }
        expired.len()
    }

    /// Drop the current lease of `id` and requeue or dead-letter it.
    fn release(&mut self, id: MessageId, reason: String) -> Option<Released> {
        let max_delivery_count = self.options.max_delivery_count;
        let record = self.records.get_mut(&id)?;
        if let Some(lease) = record.lease.take() {
            self.leases.remove(&lease.id);
        }

        let exhausted = max_delivery_count.is_some_and(|max| record.delivery_count >= max);
        if exhausted {
            let record = self.records.remove(&id)?;
            warn!(
                message_id = %record.id,
                delivery_count = record.delivery_count,
                %reason,
                "message dead-lettered"
            );
            self.dead_letters.push(DeadLetter {
                id: record.id,
                content: record.content,
                delivery_count: record.delivery_count,
                reason,
            });
            return Some(Released::DeadLettered);
        }

        record.state = MessageState::Pending;
        record.last_error = Some(reason);
        self.ready.push_back(id);
        Some(Released::Requeued)
    }

    fn lease_next(&mut self, now: DateTime<Utc>, ids: &dyn IdGenerator) -> Option<ReceivedMessage> {
        let visibility = to_time_delta(self.options.visibility_timeout);
        while let Some(id) = self.ready.pop_front() {
            let Some(record) = self.records.get_mut(&id) else {
                continue;
            };
            if !record.state.is_deliverable() {
                continue;
            }

            let lease = ActiveLease {
                id: ids.generate_lease_id(),
                locked_until: now + visibility,
            };
            record.state = MessageState::InFlight;
            record.delivery_count += 1;
            record.lease = Some(lease);
            self.leases.insert(lease.id, id);

            if let Some(previous) = &record.last_error {
                debug!(message_id = %id, delivery_count = record.delivery_count, previous = %previous, "redelivering");
            }
            return Some(ReceivedMessage::new(
                id,
                lease.id,
                record.content.clone(),
                record.enqueued_at,
                lease.locked_until,
                record.delivery_count,
            ));
        }
        None
    }

    /// Resolve a lease that is still valid at `now`.
    fn leased_message(&self, lease: LeaseId, now: DateTime<Utc>) -> Result<MessageId, DeliveryError> {
        let id = *self
            .leases
            .get(&lease)
            .ok_or(DeliveryError::LeaseLost(lease))?;
        let valid = self
            .records
            .get(&id)
            .and_then(|r| r.lease)
            .is_some_and(|l| l.id == lease && l.locked_until > now);
        if valid {
            Ok(id)
        } else {
            Err(DeliveryError::LeaseLost(lease))
        }
    }

    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts {
            acknowledged: self.acknowledged,
            dead_lettered: self.dead_letters.len(),
            ..QueueCounts::default()
        };
        for record in self.records.values() {
            match record.state {
                MessageState::Pending => counts.pending += 1,
                MessageState::InFlight => counts.in_flight += 1,
                MessageState::Acknowledged | MessageState::Failed => {}
            }
        }
        counts
    }
}

#[derive(Default)]
struct TransportState {
    queues: HashMap<String, QueueState>,

    /// Injected failures still to hand out.
    send_faults: u32,
    receive_faults: u32,
}

/// In-process transport with leases, visibility timeout, and dead-lettering.
///
/// # 使用例
/// ```ignore
/// let transport = InMemoryTransport::default();
/// transport.create_queue("orders", QueueOptions::default()).await;
/// transport.send_batch("orders", vec!["0".into()]).await?;
/// let msg = transport.receive("orders", Duration::from_secs(1)).await?;
/// ```
pub struct InMemoryTransport {
    state: Mutex<TransportState>,
    notify: Notify,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator<Arc<dyn Clock>>,
    limits: BatchLimits,
    closed: AtomicBool,
}

impl InMemoryTransport {
    pub fn new(clock: Arc<dyn Clock>, limits: BatchLimits) -> Self {
        Self {
            state: Mutex::new(TransportState::default()),
            notify: Notify::new(),
            ids: UlidGenerator::new(Arc::clone(&clock)),
            clock,
            limits,
            closed: AtomicBool::new(false),
        }
    }

    /// Declare a queue. Returns `false` if it already existed (options unchanged).
    pub async fn create_queue(&self, name: &str, options: QueueOptions) -> bool {
        let mut state = self.state.lock().await;
        if state.queues.contains_key(name) {
            return false;
        }
        state.queues.insert(name.to_string(), QueueState::new(options));
        debug!(queue = name, ?options, "queue created");
        true
    }

    /// Requeue (or dead-letter) every expired lease now instead of on the
    /// next receive. Returns how many leases expired.
    pub async fn reclaim_expired(&self, queue: &str) -> Result<usize, DeliveryError> {
        let reclaimed = {
            let mut state = self.state.lock().await;
            let now = self.clock.now();
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| DeliveryError::QueueNotFound(queue.to_string()))?;
            q.reclaim_expired(now)
        };
        if reclaimed > 0 {
            self.notify.notify_waiters();
        }
        Ok(reclaimed)
    }

    pub async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, DeliveryError> {
        let state = self.state.lock().await;
        let q = state
            .queues
            .get(queue)
            .ok_or_else(|| DeliveryError::QueueNotFound(queue.to_string()))?;
        Ok(q.dead_letters.clone())
    }

    /// Make the next `n` sends fail (nothing is enqueued).
    pub async fn inject_send_failures(&self, n: u32) {
        self.state.lock().await.send_faults = n;
    }

    /// Make the next `n` receives fail.
    pub async fn inject_receive_failures(&self, n: u32) {
        self.state.lock().await.receive_faults = n;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), BatchLimits::default())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn batch_limits(&self) -> BatchLimits {
        self.limits
    }

    async fn send_batch(
        &self,
        queue: &str,
        messages: Vec<OutboundMessage>,
    ) -> Result<(), PublishError> {
        if self.is_closed() {
            return Err(PublishError::Closed);
        }
        let count = messages.len();
        let bytes = messages.iter().map(OutboundMessage::size_hint).sum::<usize>();
        if !self.limits.admits(count, bytes) {
            return Err(PublishError::BatchTooLarge { count, bytes });
        }

        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if state.send_faults > 0 {
                state.send_faults -= 1;
                return Err(PublishError::Transport("injected send failure".to_string()));
            }
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| PublishError::QueueNotFound(queue.to_string()))?;

            // 全件を同じロック内で追加する（部分的な batch は見えない）
            let now = self.clock.now();
            for message in messages {
                q.enqueue(self.ids.generate_message_id(), message, now);
            }
        }

        debug!(queue, count, bytes, "batch enqueued");
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        max_wait: Duration,
    ) -> Result<Option<ReceivedMessage>, DeliveryError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            // 状態を見る前に登録しておく（send の通知を取りこぼさない）
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                if self.is_closed() {
                    return Err(DeliveryError::Closed);
                }
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                if state.receive_faults > 0 {
                    state.receive_faults -= 1;
                    return Err(DeliveryError::Transport(
                        "injected receive failure".to_string(),
                    ));
                }
                let q = state
                    .queues
                    .get_mut(queue)
                    .ok_or_else(|| DeliveryError::QueueNotFound(queue.to_string()))?;

                let now = self.clock.now();
                q.reclaim_expired(now);
                if let Some(message) = q.lease_next(now, &self.ids) {
                    return Ok(Some(message));
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn complete(&self, queue: &str, lease: LeaseId) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        let mut state = self.state.lock().await;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| DeliveryError::QueueNotFound(queue.to_string()))?;

        let id = q.leased_message(lease, self.clock.now())?;
        q.leases.remove(&lease);
        if let Some(record) = q.records.remove(&id) {
            q.acknowledged += 1;
            debug!(queue, message_id = %record.id, delivery_count = record.delivery_count, "message completed");
        }
        Ok(())
    }

    async fn abandon(
        &self,
        queue: &str,
        lease: LeaseId,
        reason: Option<String>,
    ) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        let released = {
            let mut state = self.state.lock().await;
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| DeliveryError::QueueNotFound(queue.to_string()))?;

            let id = q.leased_message(lease, self.clock.now())?;
            q.release(id, reason.unwrap_or_else(|| "abandoned".to_string()))
        };
        if matches!(released, Some(Released::Requeued)) {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        let mut state = self.state.lock().await;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| DeliveryError::QueueNotFound(queue.to_string()))?;
        q.reclaim_expired(self.clock.now());
        Ok(q.counts())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("in-memory transport closed");
        }
        self.notify.notify_waiters();
    }
}
