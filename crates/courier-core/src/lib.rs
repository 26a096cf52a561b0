//! courier-core
//!
//! At-least-once background task queue: distribute tasks to a broker, process
//! them with a pool of async workers, retry with backoff, dead-letter what
//! cannot succeed.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task_type, envelope, options, state, errors）
//! - **ports**: 抽象化レイヤー（Broker, Clock, IdGenerator）
//! - **queue**: TaskRecord / Lease / RetryPolicy / キュー優先度
//! - **impls**: Broker 実装（InMemoryBroker, RedisBroker）
//! - **typed**: 型付き Task API（Task, Handler, HandlerRegistry, TaskContext）
//! - **app**: Distributor, Processor, worker/reaper ループ, status
//! - **config**: ProcessorConfig（env 読み込み）
//! - **observability**: tracing の初期化

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod typed;

pub use app::{BuildError, Distributor, Processor, ProcessorBuilder};
pub use config::ProcessorConfig;
pub use domain::{CourierError, CourierResult, TaskId, TaskOptions, TaskState, TaskType};
pub use impls::InMemoryBroker;
#[cfg(feature = "redis")]
pub use impls::{RedisBroker, RedisBrokerConfig};
pub use ports::Broker;
pub use queue::RetryPolicy;
pub use typed::{Handler, HandlerRegistry, Task, TaskContext};
