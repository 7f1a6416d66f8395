//! Billing reconciliation runs.
//!
//! A run seeds the failure queue, drains it through the metering API up to
//! the retry policy's attempt limit, rewriting the queue with whatever is
//! still failing after each pass, and escalates what remains at the end.
//! Single-instance billing bypasses the queue entirely.

use crate::models::{BillingContext, FailureRecord, ServiceInstance, UsageFailure, UsagePayload};
use crate::services::metering::UsageSubmitter;
use crate::services::metrics::{record_billing_run, record_error, set_failure_queue_depth};
use crate::services::notification::Escalator;
use crate::services::payload::{build_usage_payload, Clock, SystemClock};
use crate::services::queue::{FailurePages, FailureQueue};
use crate::services::retry::{run_with_retry, AttemptOutcome, RetryOutcome, RetryPolicy};
use crate::services::{InstanceStore, TokenProvider};
use service_core::error::AppError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Reason stored for records written by the initial seeding.
pub const INITIAL_FAILURE_MESSAGE: &str = "Initial billing failure";

/// How a reconciliation run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every record was accepted; the queue is empty.
    Succeeded { attempts: u32, submitted: usize },
    /// Attempts ran out; `remaining` records stay queued and were escalated.
    Escalated { attempts: u32, remaining: usize },
    /// Another run was already active.
    Skipped,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded { .. } => "succeeded",
            RunOutcome::Escalated { .. } => "escalated",
            RunOutcome::Skipped => "skipped",
        }
    }
}

/// Clears the run-in-progress flag when the run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ReconciliationController {
    queue: Arc<dyn FailureQueue>,
    instances: Arc<dyn InstanceStore>,
    tokens: Arc<dyn TokenProvider>,
    submitter: Arc<dyn UsageSubmitter>,
    escalator: Escalator,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    run_active: AtomicBool,
}

impl ReconciliationController {
    pub fn new(
        queue: Arc<dyn FailureQueue>,
        instances: Arc<dyn InstanceStore>,
        tokens: Arc<dyn TokenProvider>,
        submitter: Arc<dyn UsageSubmitter>,
        escalator: Escalator,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            instances,
            tokens,
            submitter,
            escalator,
            policy,
            clock: Arc::new(SystemClock),
            run_active: AtomicBool::new(false),
        }
    }

    /// Replace the reference clock used for billing windows.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn escalator(&self) -> &Escalator {
        &self.escalator
    }

    /// Whether a queue-backed run is in progress.
    pub fn is_run_active(&self) -> bool {
        self.run_active.load(Ordering::SeqCst)
    }

    fn try_begin_run(&self) -> Option<RunGuard<'_>> {
        self.run_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard(&self.run_active))
    }

    /// Scheduled monthly run: bill every active instance for the previous
    /// month. Returns [`RunOutcome::Skipped`] if a run is already active.
    #[instrument(skip(self))]
    pub async fn run_scheduled(&self) -> Result<RunOutcome, AppError> {
        let Some(_guard) = self.try_begin_run() else {
            info!("Billing run already in progress, skipping scheduled run");
            record_billing_run(RunOutcome::Skipped.as_str());
            return Ok(RunOutcome::Skipped);
        };

        info!("Starting scheduled billing run");
        let result = match self.seed_from_instances().await {
            Ok(seeded) => self.attempt_and_escalate(seeded).await,
            Err(e) => Err(e),
        };
        finish_run(&result);
        result
    }

    /// Admin retry: resubmit whatever is outstanding in the queue under the
    /// same attempt/escalation rules. Returns the records still failing.
    #[instrument(skip(self))]
    pub async fn retry_all_failures(&self) -> Result<Vec<FailureRecord>, AppError> {
        let _guard = self.try_begin_run().ok_or_else(|| {
            AppError::Conflict(anyhow::anyhow!("A billing run is already in progress"))
        })?;

        let outstanding = self.queue.list_all().await?;
        let mut failures = Vec::with_capacity(outstanding.len());
        let mut undecodable = Vec::new();
        for record in outstanding {
            match record.to_usage_failure() {
                Ok(failure) => failures.push(failure),
                Err(e) => {
                    report_undecodable(&record, &e);
                    undecodable.push(record);
                }
            }
        }
        if !undecodable.is_empty() {
            self.escalator.escalate_undecodable(&undecodable).await;
        }

        info!(records = failures.len(), "Retrying outstanding billing failures");
        self.queue.seed(&failures).await?;
        set_failure_queue_depth(failures.len());

        let result = self.attempt_and_escalate(failures.len()).await;
        finish_run(&result);

        match result? {
            RunOutcome::Escalated { .. } => self.queue.list_all().await,
            _ => Ok(Vec::new()),
        }
    }

    /// Bill one instance immediately, outside the queue. Errors if the
    /// metering API did not accept the record.
    #[instrument(skip(self, instance), fields(instance_id = %instance.instance_id))]
    pub async fn submit_billing_for_instance(
        &self,
        instance: &ServiceInstance,
        ctx: BillingContext,
    ) -> Result<(), AppError> {
        let payload = build_usage_payload(instance, ctx, self.clock.now());
        let token = self.tokens.access_token().await?;
        let failures = self
            .submitter
            .submit(&token, std::slice::from_ref(&payload))
            .await?;

        match failures.first() {
            None => {
                info!(
                    dry_run = ctx.dry_run,
                    start = payload.start,
                    "Instance billing submitted"
                );
                Ok(())
            }
            Some(failure) => {
                warn!(reason = %failure.message, "Instance billing failed");
                Err(AppError::BadGateway(format!(
                    "Billing for instance: {} failed: {}",
                    instance.instance_id, failure.message
                )))
            }
        }
    }

    /// Admin "submit billing" by instance id; always a manual trigger.
    pub async fn submit_billing_for_instance_id(
        &self,
        instance_id: &str,
        dry_run: bool,
    ) -> Result<(), AppError> {
        let instance = self
            .instances
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Instance {} missing", instance_id)))?;

        self.submit_billing_for_instance(&instance, BillingContext::manual(dry_run))
            .await
    }

    /// Final bill for an instance that is being deprovisioned.
    pub async fn bill_deprovisioned_instance(
        &self,
        instance: &ServiceInstance,
    ) -> Result<(), AppError> {
        self.submit_billing_for_instance(instance, BillingContext::manual(false))
            .await
    }

    async fn seed_from_instances(&self) -> Result<usize, AppError> {
        let instances = self.instances.list_active_instances().await?;
        let now = self.clock.now();
        let failures: Vec<UsageFailure> = instances
            .iter()
            .map(|instance| {
                UsageFailure::new(
                    build_usage_payload(instance, BillingContext::scheduled(), now),
                    INITIAL_FAILURE_MESSAGE,
                )
            })
            .collect();

        self.queue.seed(&failures).await?;
        set_failure_queue_depth(failures.len());
        info!(instances = failures.len(), "Billing failure queue seeded from instances");
        Ok(failures.len())
    }

    async fn attempt_and_escalate(&self, submitted: usize) -> Result<RunOutcome, AppError> {
        let outcome =
            run_with_retry(&self.policy, "billing_reconciliation", |attempt| self.attempt(attempt))
                .await?;

        match outcome {
            RetryOutcome::Succeeded { attempts } => Ok(RunOutcome::Succeeded {
                attempts,
                submitted,
            }),
            RetryOutcome::Exhausted { attempts, last } => {
                self.escalator.escalate(&last).await;
                Ok(RunOutcome::Escalated {
                    attempts,
                    remaining: last.len(),
                })
            }
        }
    }

    /// One pass over the queue. The queue is cleared when everything was
    /// accepted, otherwise rewritten with exactly this pass's failures.
    #[instrument(skip(self))]
    async fn attempt(
        &self,
        attempt: u32,
    ) -> Result<AttemptOutcome<Vec<UsageFailure>>, AppError> {
        let token = self.tokens.access_token().await.map_err(|e| {
            error!(error = %e, attempt, "Failed to acquire access token for billing");
            record_error("token");
            e
        })?;

        let mut failures = Vec::new();
        let mut undecodable = Vec::new();
        let mut processed = 0usize;
        let mut pages = FailurePages::new(self.queue.as_ref(), self.submitter.batch_size());

        while let Some(page) = pages.next().await? {
            let payloads = decode_page(page, &mut undecodable);
            processed += payloads.len();
            if !payloads.is_empty() {
                failures.extend(self.submitter.submit(&token, &payloads).await?);
            }
        }

        info!(attempt, processed, failures = failures.len(), "Billing attempt finished");

        // The rewrite below removes these rows, so they are reported first.
        if !undecodable.is_empty() {
            self.escalator.escalate_undecodable(&undecodable).await;
        }

        if failures.is_empty() {
            self.queue.clear().await?;
            set_failure_queue_depth(0);
            Ok(AttemptOutcome::Success)
        } else {
            self.queue.seed(&failures).await?;
            set_failure_queue_depth(failures.len());
            Ok(AttemptOutcome::Retryable(failures))
        }
    }
}

/// Payloads of a queue page. Rows that no longer decode can never be
/// billed; they are moved to `undecodable`.
fn decode_page(page: Vec<FailureRecord>, undecodable: &mut Vec<FailureRecord>) -> Vec<UsagePayload> {
    let mut payloads = Vec::with_capacity(page.len());
    for record in page {
        match record.usage_payload() {
            Ok(payload) => payloads.push(payload),
            Err(e) => {
                report_undecodable(&record, &e);
                undecodable.push(record);
            }
        }
    }
    payloads
}

fn report_undecodable(record: &FailureRecord, error: &dyn std::fmt::Display) {
    error!(id = record.id, error = %error, "Undecodable billing failure record");
    record_error("corrupt_failure_record");
}

fn finish_run(result: &Result<RunOutcome, AppError>) {
    match result {
        Ok(outcome) => {
            info!(outcome = ?outcome, "Billing run finished");
            record_billing_run(outcome.as_str());
        }
        Err(e) => {
            error!(error = %e, "Billing run aborted");
            record_billing_run("error");
        }
    }
}
