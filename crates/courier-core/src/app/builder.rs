//! ProcessorBuilder - Processor の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::future::Future;
use std::sync::Arc;

use super::processor::Processor;
use crate::config::ProcessorConfig;
use crate::domain::{CourierError, CourierResult, TaskType};
use crate::ports::{Broker, Clock, SystemClock};
use crate::typed::{Handler, HandlerRegistry, Task, TaskContext};

/// ProcessorBuilder は Processor を構築
///
/// # 使用例
/// ```ignore
/// let processor = ProcessorBuilder::new(broker)
///     .config(ProcessorConfig::from_env()?)
///     .register::<SendVerifyEmail, _>(VerifyEmailHandler::new(mailer))
///     .expect_tasks(&[SendVerifyEmail::TYPE])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_tasks() で期待される task_type を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError を返す（起動後に dead-letter の山を作らない）
pub struct ProcessorBuilder {
    broker: Arc<dyn Broker>,
    registry: HandlerRegistry,
    config: ProcessorConfig,
    clock: Arc<dyn Clock>,
    expected_tasks: Option<Vec<String>>,
}

/// BuildError は Processor 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error(transparent)]
    Config(CourierError),
}

impl ProcessorBuilder {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            registry: HandlerRegistry::new(),
            config: ProcessorConfig::default(),
            clock: Arc::new(SystemClock),
            expected_tasks: None,
        }
    }

    pub fn config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Start from an existing registry (handlers registered later are added).
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Handler を登録
    pub fn register<T: Task, H: Handler<T> + 'static>(mut self, handler: H) -> Self {
        self.registry.register::<T, H>(handler);
        self
    }

    pub fn register_fn<F, Fut>(mut self, task_type: impl Into<TaskType>, f: F) -> Self
    where
        F: Fn(Vec<u8>, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CourierResult<()>> + Send + 'static,
    {
        self.registry.register_fn(task_type, f);
        self
    }

    /// 期待される task_type のリストを設定
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    /// # 検証
    /// - expect_tasks() で設定された task_type が全て登録されているか
    /// - ProcessorConfig::validate()
    pub fn build(self) -> Result<Processor, BuildError> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|t| !self.registry.contains(&TaskType::new(t.as_str())))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }
        Processor::new(self.broker, self.registry, self.config, self.clock)
            .map_err(BuildError::Config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryBroker;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct SendVerifyEmail {
        username: String,
    }

    impl Task for SendVerifyEmail {
        const TYPE: &'static str = "email:verify";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct SendWelcome {
        username: String,
    }

    impl Task for SendWelcome {
        const TYPE: &'static str = "email:welcome";
    }

    struct Noop;

    #[async_trait]
    impl Handler<SendVerifyEmail> for Noop {
        async fn handle(&self, _task: SendVerifyEmail, _ctx: TaskContext) -> Result<(), CourierError> {
            Ok(())
        }
    }

    fn builder() -> ProcessorBuilder {
        ProcessorBuilder::new(Arc::new(InMemoryBroker::new()))
    }

    #[test]
    fn build_success() {
        let processor = builder()
            .register::<SendVerifyEmail, _>(Noop)
            .expect_tasks(&[SendVerifyEmail::TYPE])
            .build();
        assert!(processor.is_ok());
    }

    #[test]
    fn build_missing_task_types() {
        let processor = builder()
            .register::<SendVerifyEmail, _>(Noop)
            .expect_tasks(&[SendVerifyEmail::TYPE, SendWelcome::TYPE])
            .build();
        assert!(matches!(
            processor,
            Err(BuildError::MissingTaskTypes(missing)) if missing == vec![SendWelcome::TYPE.to_string()]
        ));
    }

    #[test]
    fn build_without_expectations() {
        assert!(builder().build().is_ok());
    }

    #[test]
    fn invalid_config_fails_build() {
        let processor = builder()
            .config(ProcessorConfig::default().with_queues(vec![]))
            .build();
        assert!(matches!(processor, Err(BuildError::Config(CourierError::Config(_)))));
    }
}
