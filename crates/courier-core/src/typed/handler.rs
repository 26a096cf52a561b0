//! Handler trait - Task を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<T, H> / FnHandler<F> → DynHandler)

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::context::TaskContext;
use super::task::Task;
use crate::domain::{CourierError, CourierResult};

/// Handler は Task を実行する
///
/// # 使用例
/// ```ignore
/// struct VerifyEmailHandler { mailer: Arc<dyn Mailer> }
///
/// #[async_trait]
/// impl Handler<SendVerifyEmail> for VerifyEmailHandler {
///     async fn handle(&self, task: SendVerifyEmail, ctx: TaskContext) -> Result<(), CourierError> {
///         self.mailer.send(&task.username).await.map_err(CourierError::handler)
///     }
/// }
/// ```
///
/// Delivery is at-least-once: the same task may run more than once, possibly
/// concurrently with a timed-out earlier attempt. Handlers must be idempotent.
///
/// Return `CourierError::Permanent` to skip the remaining retries.
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T, ctx: TaskContext) -> Result<(), CourierError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// HashMap<TaskType, Arc<dyn DynHandler>> に格納するための型消去層。
/// payload は raw bytes のまま渡され、decode は各実装の責務。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, payload: Vec<u8>, ctx: TaskContext) -> CourierResult<()>;
}

/// `Handler<T>` adapter: decodes the JSON payload into `T`.
pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(&self, payload: Vec<u8>, ctx: TaskContext) -> CourierResult<()> {
        // 壊れた payload は何度 retry しても直らない → Codec (Permanent)
        let task: T = serde_json::from_slice(&payload)?;
        self.handler.handle(task, ctx).await
    }
}

/// Closure adapter over raw payload bytes.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> DynHandler for FnHandler<F>
where
    F: Fn(Vec<u8>, TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = CourierResult<()>> + Send,
{
    async fn handle_dyn(&self, payload: Vec<u8>, ctx: TaskContext) -> CourierResult<()> {
        (self.f)(payload, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorKind, TaskEnvelope, TaskId, TaskType};
    use crate::queue::{ClaimedTask, Lease};
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;
    use ulid::Ulid;

    #[derive(Debug, Serialize, Deserialize)]
    struct Greet {
        name: String,
    }

    impl Task for Greet {
        const TYPE: &'static str = "test:greet";
    }

    struct GreetHandler;

    #[async_trait]
    impl Handler<Greet> for GreetHandler {
        async fn handle(&self, task: Greet, _ctx: TaskContext) -> Result<(), CourierError> {
            if task.name.is_empty() {
                return Err(CourierError::handler("empty name"));
            }
            Ok(())
        }
    }

    fn ctx() -> TaskContext {
        let now = Utc::now();
        let task_id = TaskId::from_ulid(Ulid::new());
        let claim = ClaimedTask {
            envelope: TaskEnvelope::new(task_id, TaskType::new(Greet::TYPE), vec![], now),
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
    async fn typed_handler_decodes_json_payload() {
        let handler = TypedHandler::<Greet, _>::new(GreetHandler);

        handler
            .handle_dyn(br#"{"name":"alice"}"#.to_vec(), ctx())
            .await
            .unwrap();

        let err = handler
            .handle_dyn(br#"{"name":""}"#.to_vec(), ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn undecodable_payload_is_permanent() {
        let handler = TypedHandler::<Greet, _>::new(GreetHandler);
        let err = handler.handle_dyn(b"not json".to_vec(), ctx()).await.unwrap_err();
        assert!(matches!(err, CourierError::Codec(_)));
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[tokio::test]
    async fn fn_handler_receives_raw_bytes() {
        let handler = FnHandler::new(|payload: Vec<u8>, ctx: TaskContext| async move {
            assert_eq!(ctx.task_type().as_str(), "test:greet");
            if payload == b"ok" {
                Ok(())
            } else {
                Err(CourierError::permanent("bad"))
            }
        });

        handler.handle_dyn(b"ok".to_vec(), ctx()).await.unwrap();
        assert!(handler.handle_dyn(b"no".to_vec(), ctx()).await.is_err());
    }
}
