//! HandlerRegistry - Handler の登録と管理
//!
//! # 学習ポイント
//! - HashMap での型消去された trait object の管理
//! - Generic methods での登録と型安全性
//! - Arc による共有所有権（worker 間で handler を共有）

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tracing::warn;

use super::context::TaskContext;
use super::handler::{DynHandler, FnHandler, Handler, TypedHandler};
use super::task::Task;
use crate::domain::{CourierResult, TaskType};

/// task_type → handler の対応表
///
/// # 使用例
/// ```ignore
/// let mut registry = HandlerRegistry::new();
/// registry
///     .register::<SendVerifyEmail, _>(VerifyEmailHandler::new(mailer))
///     .register_fn("report:nightly", |payload, ctx| async move { Ok(()) });
///
/// let handler = registry.get(&TaskType::new("email:verify"));
/// ```
///
/// 同じ task_type を二度登録すると後勝ち（warn ログを出す）。
/// 起動後は読み取り専用で、worker からは `Arc<HandlerRegistry>` で共有される。
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn DynHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Typed registration; the payload is JSON-decoded into `T`.
    pub fn register<T, H>(&mut self, handler: H) -> &mut Self
    where
        T: Task,
        H: Handler<T> + 'static,
    {
        self.insert(T::task_type(), Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    /// Raw registration over payload bytes.
    pub fn register_fn<F, Fut>(&mut self, task_type: impl Into<TaskType>, f: F) -> &mut Self
    where
        F: Fn(Vec<u8>, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CourierResult<()>> + Send + 'static,
    {
        self.insert(task_type.into(), Arc::new(FnHandler::new(f)))
    }

    /// Register an already type-erased handler.
    pub fn register_dyn(
        &mut self,
        task_type: impl Into<TaskType>,
        handler: Arc<dyn DynHandler>,
    ) -> &mut Self {
        self.insert(task_type.into(), handler)
    }

    fn insert(&mut self, task_type: TaskType, handler: Arc<dyn DynHandler>) -> &mut Self {
        if self.handlers.insert(task_type.clone(), handler).is_some() {
            warn!(task_type = %task_type, "handler re-registered; previous handler replaced");
        }
        self
    }

    pub fn get(&self, task_type: &TaskType) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &TaskType) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered types, sorted.
    pub fn registered_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.keys().cloned().collect();
        types.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CourierError, TaskEnvelope, TaskId};
    use crate::queue::{ClaimedTask, Lease};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;
    use ulid::Ulid;

    #[derive(Debug, Serialize, Deserialize)]
    struct VerifyEmail {
        username: String,
    }

    impl Task for VerifyEmail {
        const TYPE: &'static str = "email:verify";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Welcome {
        username: String,
    }

    impl Task for Welcome {
        const TYPE: &'static str = "email:welcome";
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Handler<VerifyEmail> for Counting {
        async fn handle(&self, _task: VerifyEmail, _ctx: TaskContext) -> Result<(), CourierError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl Handler<Welcome> for Counting {
        async fn handle(&self, _task: Welcome, _ctx: TaskContext) -> Result<(), CourierError> {
            self.0.fetch_add(100, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ctx(task_type: &str) -> TaskContext {
        let now = Utc::now();
        let task_id = TaskId::from_ulid(Ulid::new());
        let claim = ClaimedTask {
            envelope: TaskEnvelope::new(task_id, TaskType::new(task_type), vec![], now),
            lease: Lease {
                task_id,
                lease_id: Ulid::new().into(),
                expires_at: now,
            },
            retry_count: 0,
            last_error: None,
        };
        TaskContext::from_claim(&claim, now, CancellationToken::new())
    }

    #[tokio::test]
    async fn register_and_get() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry.register::<VerifyEmail, _>(Counting(calls.clone()));

        let handler = registry.get(&TaskType::new("email:verify")).unwrap();
        handler
            .handle_dyn(br#"{"username":"alice"}"#.to_vec(), ctx("email:verify"))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.get(&TaskType::new("email:unknown")).is_none());
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry
            .register::<VerifyEmail, _>(Counting(first.clone()))
            .register::<VerifyEmail, _>(Counting(second.clone()));

        assert_eq!(registry.len(), 1);
        let handler = registry.get(&TaskType::new(VerifyEmail::TYPE)).unwrap();
        handler
            .handle_dyn(br#"{"username":"bob"}"#.to_vec(), ctx(VerifyEmail::TYPE))
            .await
            .unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn types_are_not_confused() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry
            .register::<VerifyEmail, _>(Counting(calls.clone()))
            .register::<Welcome, _>(Counting(calls.clone()))
            .register_fn("report:nightly", |_payload, _ctx| async { Ok::<(), CourierError>(()) });

        assert_eq!(
            registry.registered_types(),
            vec![
                TaskType::new("email:verify"),
                TaskType::new("email:welcome"),
                TaskType::new("report:nightly"),
            ]
        );

        let welcome = registry.get(&TaskType::new(Welcome::TYPE)).unwrap();
        welcome
            .handle_dyn(br#"{"username":"carol"}"#.to_vec(), ctx(Welcome::TYPE))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 100);
    }
}
