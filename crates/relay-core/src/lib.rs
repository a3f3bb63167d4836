//! relay-core
//!
//! Queue messaging core: batched publishing and push-style consumption over a
//! pluggable transport.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, message, batch, state, errors）
//! - **ports**: 抽象化レイヤー（Transport, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryTransport）
//! - **app**: アプリケーションロジック（client, sender, processor, config）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

pub use crate::app::{
    ClientError, ConfigError, ErrorHandler, ErrorSource, LoggingErrorHandler, MessageHandler,
    ProcessError, ProcessErrorContext, ProcessMessageContext, Processor, ProcessorBuilder,
    ProcessorError, ProcessorOptions, RelayClient, RelayConfig, Sender, load_config,
};
pub use crate::domain::{
    BatchLimits, BatchOverflowError, DeliveryError, HandlerError, LeaseId, MessageBatch,
    MessageId, OutboundMessage, ProcessorState, PublishError, QueueCounts, ReceivedMessage,
};
pub use crate::impls::{InMemoryTransport, QueueOptions};
pub use crate::ports::{Clock, FixedClock, SystemClock, Transport};
