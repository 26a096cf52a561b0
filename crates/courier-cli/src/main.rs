//! Startup wiring demo: "send verification email after sign-up".
//!
//! Uses the in-memory broker unless built with `--features redis` and
//! `REDIS_URL` is set. The mailer and the user repository are in-process
//! stand-ins.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use courier_core::app::{status_report, describe};
use courier_core::ports::{Clock, SystemClock};
use courier_core::{
    Broker, CourierError, Distributor, Handler, InMemoryBroker, ProcessorBuilder,
    ProcessorConfig, RetryPolicy, Task, TaskContext, TaskId, TaskOptions, TaskState,
};

#[derive(Debug, Serialize, Deserialize)]
struct SendVerifyEmail {
    username: String,
}

impl Task for SendVerifyEmail {
    const TYPE: &'static str = "task:send_verify_email";
}

#[derive(Debug, Clone)]
struct User {
    username: String,
    full_name: String,
    email: String,
}

#[derive(Debug, Clone)]
struct VerifyEmail {
    username: String,
    email: String,
    secret_code: String,
}

/// Business persistence the handler depends on.
#[async_trait]
trait Repository: Send + Sync {
    async fn get_user(&self, username: &str) -> Option<User>;
    async fn create_verify_email(&self, record: VerifyEmail);
}

#[derive(Default)]
struct InMemoryRepository {
    users: Mutex<HashMap<String, User>>,
    verify_emails: Mutex<Vec<VerifyEmail>>,
}

impl InMemoryRepository {
    async fn add_user(&self, user: User) {
        self.users.lock().await.insert(user.username.clone(), user);
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_user(&self, username: &str) -> Option<User> {
        self.users.lock().await.get(username).cloned()
    }

    async fn create_verify_email(&self, record: VerifyEmail) {
        self.verify_emails.lock().await.push(record);
    }
}

#[async_trait]
trait Mailer: Send + Sync {
    async fn send_email(&self, subject: &str, content: &str, to: &str) -> Result<(), String>;
}

/// Logs instead of sending; fails the first `failures` sends like a flaky SMTP relay.
struct LogMailer {
    failures: AtomicU32,
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send_email(&self, subject: &str, content: &str, to: &str) -> Result<(), String> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(format!("smtp 421: service not available (left={left})"));
        }
        info!(to, subject, content, "email sent");
        Ok(())
    }
}

struct SendVerifyEmailHandler {
    repo: Arc<dyn Repository>,
    mailer: Arc<dyn Mailer>,
}

#[async_trait]
impl Handler<SendVerifyEmail> for SendVerifyEmailHandler {
    async fn handle(&self, task: SendVerifyEmail, ctx: TaskContext) -> Result<(), CourierError> {
        // a missing user will not appear by retrying
        let user = self
            .repo
            .get_user(&task.username)
            .await
            .ok_or_else(|| CourierError::permanent(format!("user {} doesn't exist", task.username)))?;

        let record = VerifyEmail {
            username: user.username.clone(),
            email: user.email.clone(),
            secret_code: ctx.task_id().to_key(),
        };
        let content = format!(
            "Hello {},<br/>Thank you for registering with us!<br/>Please verify your email: \
             http://localhost:8080/v1/verify_email?username={}&secret_code={}",
            user.full_name, record.username, record.secret_code
        );
        self.mailer
            .send_email("Welcome to Swift Bank", &content, &record.email)
            .await
            .map_err(CourierError::handler)?;
        self.repo.create_verify_email(record).await;

        info!(task_id = %ctx.task_id(), username = %task.username, retry_count = ctx.retry_count(), "verify email sent");
        Ok(())
    }
}

#[cfg(feature = "redis")]
async fn connect_broker(clock: Arc<dyn Clock>) -> Result<Arc<dyn Broker>, CourierError> {
    if let Ok(url) = std::env::var("REDIS_URL") {
        let config = courier_core::RedisBrokerConfig::new(url);
        let broker = courier_core::RedisBroker::connect(config, clock).await?;
        return Ok(Arc::new(broker));
    }
    info!("REDIS_URL not set; using in-memory broker");
    Ok(Arc::new(InMemoryBroker::with_clock(clock)))
}

#[cfg(not(feature = "redis"))]
async fn connect_broker(clock: Arc<dyn Clock>) -> Result<Arc<dyn Broker>, CourierError> {
    info!("using in-memory broker");
    Ok(Arc::new(InMemoryBroker::with_clock(clock)))
}

fn processor_config() -> Result<ProcessorConfig, CourierError> {
    let config = ProcessorConfig::from_env()?;
    // short demo backoff, keeping any COURIER_RETRY_MULTIPLIER override
    let retry = RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(5))
        .with_multiplier(config.retry.multiplier);
    let mut config = config.with_retry(retry);
    if std::env::var("COURIER_QUEUES").is_err() {
        config = config.with_queue("critical", 10).with_queue("default", 5);
    }
    config.validate()?;
    Ok(config)
}

async fn wait_settled(broker: &dyn Broker, ids: &[TaskId]) -> Result<(), CourierError> {
    loop {
        let mut settled = 0;
        for id in ids {
            let state = broker.task(*id).await?.map(|r| r.state);
            if matches!(state, Some(TaskState::Completed | TaskState::Dead) | None) {
                settled += 1;
            }
        }
        if settled == ids.len() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    courier_core::observability::init();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let broker = connect_broker(Arc::clone(&clock)).await?;

    let repo = Arc::new(InMemoryRepository::default());
    repo.add_user(User {
        username: "alice".into(),
        full_name: "Alice Liddell".into(),
        email: "alice@example.com".into(),
    })
    .await;
    let mailer = Arc::new(LogMailer {
        failures: AtomicU32::new(2),
    });

    let mut processor = ProcessorBuilder::new(Arc::clone(&broker))
        .config(processor_config()?)
        .clock(Arc::clone(&clock))
        .register::<SendVerifyEmail, _>(SendVerifyEmailHandler {
            repo: repo.clone(),
            mailer,
        })
        .expect_tasks(&[SendVerifyEmail::TYPE])
        .build()?;
    processor.start()?;

    // request side: what the sign-up endpoint would do after creating the user
    let distributor = Distributor::with_clock(Arc::clone(&broker), clock);
    let mut ids = Vec::new();
    for username in ["alice", "mallory"] {
        let options = TaskOptions::new()
            .queue("critical")
            .max_retry(10)
            .process_in(Duration::from_secs(1))
            .unique(format!("verify:{username}"), Duration::from_secs(60 * 60));
        ids.push(
            distributor
                .distribute_task(&SendVerifyEmail { username: username.into() }, options.clone())
                .await?,
        );
        // a double-submitted form is deduplicated
        match distributor
            .distribute_task(&SendVerifyEmail { username: username.into() }, options)
            .await
        {
            Err(err) if err.is_duplicate() => info!(username, "duplicate verify email suppressed"),
            Err(err) => return Err(err.into()),
            Ok(id) => warn!(task_id = %id, "duplicate was not suppressed"),
        }
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        err = processor.fatal() => warn!(error = %err, "processor failed"),
        res = tokio::time::timeout(Duration::from_secs(30), wait_settled(broker.as_ref(), &ids)) => {
            match res {
                Ok(settled) => settled?,
                Err(_) => warn!("tasks still running after 30s"),
            }
        }
    }
    processor.stop().await;

    let now = SystemClock.now();
    for id in &ids {
        if let Some(record) = broker.task(*id).await? {
            info!("{}", describe(&record, now));
        }
    }
    for queue in status_report(broker.as_ref()).await?.queues {
        info!(queue = %queue.queue, counts = ?queue.counts, "queue status");
    }
    info!(sent = repo.verify_emails.lock().await.len(), "done");
    Ok(())
}
