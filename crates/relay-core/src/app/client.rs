//! RelayClient - transport への接続と、sender / processor の生成
//!
//! client は transport を 1 つ所有し、そこから作った sender と processor で共有します。
//! dispose は processor がすべて止まってからでないと受け付けません。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, info};

use crate::app::config::RelayConfig;
use crate::app::processor::ProcessorBuilder;
use crate::app::sender::Sender;
use crate::domain::{DeliveryError, QueueCounts};
use crate::impls::InMemoryTransport;
use crate::ports::{SystemClock, Transport};

const MEMORY_SCHEME: &str = "memory://";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unsupported endpoint `{0}`: only memory:// endpoints are available")]
    UnsupportedEndpoint(String),

    #[error("connection string has no Endpoint entry")]
    MissingEndpoint,

    #[error("{0} processor(s) still running; stop them before disposing the client")]
    ProcessorsActive(usize),
}

pub(crate) struct ClientInner {
    endpoint: String,
    transport: Arc<dyn Transport>,
    lifecycle: Mutex<Lifecycle>,
}

/// `closed` and `active` are only read or written together, under one lock.
#[derive(Debug, Default)]
struct Lifecycle {
    closed: bool,
    active: usize,
}

impl ClientInner {
    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lifecycle().closed
    }

    /// Registers a running processor. `None` once the client is disposed.
    pub(crate) fn acquire(self: &Arc<Self>) -> Option<ActivityGuard> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.closed {
            return None;
        }
        lifecycle.active += 1;
        Some(ActivityGuard {
            client: Arc::clone(self),
        })
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps the client's active-processor count up while held.
///
/// A processor shares one guard (behind an `Arc`) with every task it spawns;
/// the count drops only after the last of those tasks has finished.
pub(crate) struct ActivityGuard {
    client: Arc<ClientInner>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        let mut lifecycle = self.client.lifecycle();
        lifecycle.active = lifecycle.active.saturating_sub(1);
    }
}

/// Entry point: owns the transport and hands out senders and processors.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("endpoint", &self.inner.endpoint)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl RelayClient {
    /// Connects to the endpoint in `config` and declares the configured queue.
    pub async fn connect(config: &RelayConfig) -> Result<Self, ClientError> {
        let endpoint = parse_endpoint(&config.connection.endpoint)?;
        let transport = InMemoryTransport::new(Arc::new(SystemClock), config.batch.limits());
        transport
            .create_queue(&config.connection.queue, config.queue.options())
            .await;

        info!(
            endpoint = %endpoint,
            queue = %config.connection.queue,
            "client connected"
        );
        Ok(Self::with_transport(endpoint, Arc::new(transport)))
    }

    /// Wraps an existing transport. Queues must already exist on it.
    pub fn with_transport(endpoint: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                endpoint: endpoint.into(),
                transport,
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn create_sender(&self, queue: impl Into<String>) -> Sender {
        Sender::new(queue.into(), Arc::clone(&self.inner))
    }

    pub fn create_processor(&self, queue: impl Into<String>) -> ProcessorBuilder {
        ProcessorBuilder::new(queue.into(), Arc::clone(&self.inner))
    }

    pub async fn queue_counts(&self, queue: &str) -> Result<QueueCounts, DeliveryError> {
        self.inner.transport.counts(queue).await
    }

    /// Closes the transport. Every processor must be stopped first.
    pub async fn dispose(self) -> Result<(), ClientError> {
        {
            let mut lifecycle = self.inner.lifecycle();
            if lifecycle.active > 0 {
                return Err(ClientError::ProcessorsActive(lifecycle.active));
            }
            if lifecycle.closed {
                debug!(endpoint = %self.inner.endpoint, "client already disposed");
                return Ok(());
            }
            lifecycle.closed = true;
        }
        self.inner.transport.close().await;
        info!(endpoint = %self.inner.endpoint, "client disposed");
        Ok(())
    }
}

/// Accepts `memory://<ns>` or a connection string with an `Endpoint=` entry.
/// Returns the normalized endpoint.
fn parse_endpoint(raw: &str) -> Result<String, ClientError> {
    let raw = raw.trim();
    let endpoint = if raw.contains('=') {
        raw.split(';')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case("endpoint"))
            .map(|(_, value)| value.trim())
            .ok_or(ClientError::MissingEndpoint)?
    } else {
        raw
    };

    match endpoint.strip_prefix(MEMORY_SCHEME) {
        Some(namespace) if !namespace.trim_end_matches('/').is_empty() => {
            Ok(format!("{MEMORY_SCHEME}{}", namespace.trim_end_matches('/')))
        }
        _ => Err(ClientError::UnsupportedEndpoint(endpoint.to_string())),
    }
}
