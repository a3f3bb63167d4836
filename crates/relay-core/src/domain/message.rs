//! Messages: what a producer sends and what a consumer receives.

use std::borrow::Cow;
use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::ids::{LeaseId, MessageId};

/// A message built by the producer, before the transport assigns an id.
///
/// The body is opaque bytes. Text bodies go through `From<&str>` / `From<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutboundMessage {
    body: Bytes,
    subject: Option<String>,
    content_type: Option<String>,
    correlation_id: Option<String>,
    properties: BTreeMap<String, String>,
}

impl OutboundMessage {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set an application property (last write wins).
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Bytes this message counts against a batch budget.
    pub fn size_hint(&self) -> usize {
        let optional = [&self.subject, &self.content_type, &self.correlation_id]
            .into_iter()
            .flatten()
            .map(String::len)
            .sum::<usize>();
        let properties = self
            .properties
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum::<usize>();
        self.body.len() + optional + properties
    }
}

impl From<&str> for OutboundMessage {
    fn from(body: &str) -> Self {
        Self::new(Bytes::copy_from_slice(body.as_bytes()))
    }
}

impl From<String> for OutboundMessage {
    fn from(body: String) -> Self {
        Self::new(body)
    }
}

/// A message as delivered to a consumer.
///
/// Carries the lease of *this* delivery: settling (complete/abandon) goes
/// through the lease, so a stale copy cannot settle a redelivered message.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    id: MessageId,
    lease: LeaseId,
    content: OutboundMessage,
    enqueued_at: DateTime<Utc>,
    locked_until: DateTime<Utc>,
    delivery_count: u32,
}

impl ReceivedMessage {
    pub fn new(
        id: MessageId,
        lease: LeaseId,
        content: OutboundMessage,
        enqueued_at: DateTime<Utc>,
        locked_until: DateTime<Utc>,
        delivery_count: u32,
    ) -> Self {
        Self {
            id,
            lease,
            content,
            enqueued_at,
            locked_until,
            delivery_count,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    pub fn body(&self) -> &Bytes {
        self.content.body()
    }

    /// Body decoded as UTF-8, with invalid sequences replaced.
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.content.body())
    }

    pub fn subject(&self) -> Option<&str> {
        self.content.subject()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content.content_type()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.content.correlation_id()
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        self.content.properties()
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn locked_until(&self) -> DateTime<Utc> {
        self.locked_until
    }

    /// 1 on first delivery, incremented on every redelivery.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }
}
