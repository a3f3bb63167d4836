//! App - アプリケーション層
//!
//! ports を組み合わせて client / sender / processor を実装します。
//!
//! # 主要コンポーネント
//! - **RelayClient**: transport の所有者。sender と processor を作る
//! - **Sender**: batch 単位の publish
//! - **Processor**: push 型 consume（pump + workers + error task）
//! - **RelayConfig**: TOML 設定

pub mod client;
pub mod config;
pub mod handler;
pub mod processor;
pub mod sender;

pub use self::client::{ClientError, RelayClient};
pub use self::config::{ConfigError, RelayConfig, load_config};
pub use self::handler::{
    ErrorHandler, ErrorSource, LoggingErrorHandler, MessageHandler, ProcessError,
    ProcessErrorContext, ProcessMessageContext,
};
pub use self::processor::{Processor, ProcessorBuilder, ProcessorError, ProcessorOptions};
pub use self::sender::Sender;
