//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTransport**: プロセス内の transport（開発・テスト用）

pub mod inmem_transport;

pub use self::inmem_transport::{DeadLetter, InMemoryTransport, QueueOptions};
