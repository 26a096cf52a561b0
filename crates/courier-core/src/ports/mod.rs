//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部システム（Redis など）や時刻・ID 生成への
//! インターフェースを提供し、実装の詳細を隠蔽します。

pub mod broker;
pub mod clock;
pub mod id_generator;

pub use self::broker::{Broker, QueueCounts, RetryDisposition};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
