//! Impls - Broker の実装
//!
//! # 含まれる実装
//! - **InMemoryBroker**: 単一プロセス用（テスト・開発）
//! - **RedisBroker**: 複数プロセスで共有する永続キュー（feature `redis`）

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use self::memory::{InMemoryBroker, MemoryBrokerConfig};
#[cfg(feature = "redis")]
pub use self::redis::{RedisBroker, RedisBrokerConfig};
