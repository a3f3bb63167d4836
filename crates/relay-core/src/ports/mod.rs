//! Ports - 抽象化レイヤー
//!
//! 外部の仕組み（時刻、ID 生成、メッセージキュー）への interface です。
//! 実装は `impls` に置きます。

pub mod clock;
pub mod id_generator;
pub mod transport;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::transport::Transport;
