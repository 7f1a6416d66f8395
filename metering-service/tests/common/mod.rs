//! Common test utilities for metering-service integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use metering_service::models::{FailurePage, FailureRecord, ServiceInstance, UsageFailure, UsagePayload};
use metering_service::services::{
    Escalator, FailureQueue, FixedClock, InMemoryFailureQueue, InMemoryInstanceStore,
    NotificationSender, NotificationSummary, ReconciliationController, RetryPolicy,
    StaticTokenProvider, TokenProvider, UsageSubmitter,
};
use service_core::error::AppError;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,metering_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub const PRODUCT: &str = "Acme DB";

/// Mid-March 2025; scheduled runs bill February.
pub fn reference_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 15, 10, 30, 0).unwrap()
}

pub fn february_start_ms() -> i64 {
    Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0)
        .unwrap()
        .timestamp_millis()
}

pub fn march_start_ms() -> i64 {
    Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0)
        .unwrap()
        .timestamp_millis()
}

/// An instance created well before the reference month.
pub fn instance(id: &str) -> ServiceInstance {
    ServiceInstance::new(
        id,
        "plan-standard",
        "eu-de",
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
    )
}

/// What the scripted submitter does with one call.
#[derive(Debug, Clone)]
pub enum Step {
    AcceptAll,
    FailAll(String),
    /// Fail only the listed instance ids.
    FailIds(Vec<String>, String),
    Error,
}

/// Usage submitter that replays a script, then falls back to a default step.
pub struct ScriptedSubmitter {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    batch_size: usize,
    pub calls: Mutex<Vec<Vec<UsagePayload>>>,
}

impl ScriptedSubmitter {
    pub fn new(script: Vec<Step>, fallback: Step) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            batch_size: 100,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn accepting() -> Self {
        Self::new(Vec::new(), Step::AcceptAll)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn submitted(&self) -> Vec<UsagePayload> {
        self.calls.lock().unwrap().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl UsageSubmitter for ScriptedSubmitter {
    async fn submit(
        &self,
        _token: &str,
        payloads: &[UsagePayload],
    ) -> Result<Vec<UsageFailure>, AppError> {
        self.calls.lock().unwrap().push(payloads.to_vec());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match step {
            Step::AcceptAll => Ok(Vec::new()),
            Step::FailAll(message) => Ok(payloads
                .iter()
                .map(|p| UsageFailure::new(p.clone(), message.clone()))
                .collect()),
            Step::FailIds(ids, message) => {
                let ids: HashSet<String> = ids.into_iter().collect();
                Ok(payloads
                    .iter()
                    .filter(|p| ids.contains(&p.resource_instance_id))
                    .map(|p| UsageFailure::new(p.clone(), message.clone()))
                    .collect())
            }
            Step::Error => Err(AppError::InternalError(anyhow::anyhow!("submitter exploded"))),
        }
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// Token provider that always fails and counts its calls.
#[derive(Default)]
pub struct FailingTokenProvider {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TokenProvider for FailingTokenProvider {
    async fn access_token(&self) -> Result<String, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AppError::AuthError(anyhow::anyhow!("IAM unavailable")))
    }
}

/// Queue whose writes always fail; reads see an empty queue.
#[derive(Default)]
pub struct BrokenQueue;

#[async_trait]
impl FailureQueue for BrokenQueue {
    async fn seed(&self, _failures: &[UsageFailure]) -> Result<(), AppError> {
        Err(AppError::DatabaseError(anyhow::anyhow!("disk full")))
    }

    async fn clear(&self) -> Result<(), AppError> {
        Err(AppError::DatabaseError(anyhow::anyhow!("disk full")))
    }

    async fn next_page(&self, _cursor: Option<i64>, _limit: usize) -> Result<FailurePage, AppError> {
        Ok(FailurePage::default())
    }

    async fn list_all(&self) -> Result<Vec<FailureRecord>, AppError> {
        Ok(Vec::new())
    }

    async fn count(&self) -> Result<usize, AppError> {
        Ok(0)
    }
}

/// In-memory queue that gains one undecodable row with its first seeded
/// generation.
pub struct CorruptingQueue {
    pub inner: Arc<InMemoryFailureQueue>,
    corrupted: AtomicBool,
}

impl CorruptingQueue {
    pub fn new(inner: Arc<InMemoryFailureQueue>) -> Self {
        Self {
            inner,
            corrupted: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl FailureQueue for CorruptingQueue {
    async fn seed(&self, failures: &[UsageFailure]) -> Result<(), AppError> {
        self.inner.seed(failures).await?;
        if !self.corrupted.swap(true, Ordering::SeqCst) {
            self.inner.push_record("{\"plan_id\":", "Initial billing failure").await;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), AppError> {
        self.inner.clear().await
    }

    async fn next_page(&self, cursor: Option<i64>, limit: usize) -> Result<FailurePage, AppError> {
        self.inner.next_page(cursor, limit).await
    }

    async fn list_all(&self) -> Result<Vec<FailureRecord>, AppError> {
        self.inner.list_all().await
    }

    async fn count(&self) -> Result<usize, AppError> {
        self.inner.count().await
    }
}

/// Notification sender that keeps every summary.
#[derive(Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<NotificationSummary>>,
}

impl RecordingSender {
    pub fn summaries(&self) -> Vec<NotificationSummary> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send(&self, summary: &NotificationSummary) -> Result<(), AppError> {
        self.sent.lock().unwrap().push(summary.clone());
        Ok(())
    }
}

/// Controller wired to in-memory collaborators.
pub struct Harness {
    pub controller: Arc<ReconciliationController>,
    pub queue: Arc<InMemoryFailureQueue>,
    pub instances: Arc<InMemoryInstanceStore>,
    pub submitter: Arc<ScriptedSubmitter>,
    pub sender: Arc<RecordingSender>,
}

pub struct HarnessBuilder {
    instances: Vec<ServiceInstance>,
    submitter: ScriptedSubmitter,
    tokens: Arc<dyn TokenProvider>,
    queue: Option<Arc<dyn FailureQueue>>,
    policy: RetryPolicy,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        init_tracing();
        Self {
            instances: Vec::new(),
            submitter: ScriptedSubmitter::accepting(),
            tokens: Arc::new(StaticTokenProvider::new("test-token")),
            queue: None,
            policy: RetryPolicy::new(3, Duration::ZERO),
        }
    }

    pub fn instances(mut self, ids: &[&str]) -> Self {
        self.instances = ids.iter().map(|id| instance(id)).collect();
        self
    }

    pub fn submitter(mut self, submitter: ScriptedSubmitter) -> Self {
        self.submitter = submitter;
        self
    }

    pub fn tokens(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = tokens;
        self
    }

    /// Replace the in-memory queue the controller writes to.
    pub fn queue(mut self, queue: Arc<dyn FailureQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Harness {
        let queue = Arc::new(InMemoryFailureQueue::new());
        let instances = Arc::new(InMemoryInstanceStore::new(self.instances));
        let submitter = Arc::new(self.submitter);
        let sender = Arc::new(RecordingSender::default());

        let controller_queue: Arc<dyn FailureQueue> = match self.queue {
            Some(q) => q,
            None => queue.clone(),
        };

        let controller = ReconciliationController::new(
            controller_queue,
            instances.clone(),
            self.tokens,
            submitter.clone(),
            Escalator::new(sender.clone(), PRODUCT),
            self.policy,
        )
        .with_clock(Arc::new(FixedClock(reference_now())));

        Harness {
            controller: Arc::new(controller),
            queue,
            instances,
            submitter,
            sender,
        }
    }
}
