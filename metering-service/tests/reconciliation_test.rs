//! Integration tests for billing reconciliation runs.

mod common;

use async_trait::async_trait;
use common::{
    february_start_ms, march_start_ms, BrokenQueue, CorruptingQueue, FailingTokenProvider,
    HarnessBuilder, ScriptedSubmitter, Step,
};
use metering_service::models::{UsageFailure, UsagePayload};
use metering_service::services::{FailureQueue, RetryPolicy, RunOutcome, UsageSubmitter};
use service_core::error::AppError;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Notify;

const SERVER_ERROR: &str = "Billing request failed unexpectedly. Check logs for information.";

#[tokio::test]
async fn all_accepted_run_empties_queue_without_escalation() {
    let h = HarnessBuilder::new()
        .instances(&["inst-a", "inst-b", "inst-c"])
        .build();

    let outcome = h.controller.run_scheduled().await.unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Succeeded {
            attempts: 1,
            submitted: 3
        }
    );
    assert_eq!(h.queue.count().await.unwrap(), 0);
    assert!(h.sender.summaries().is_empty());

    let submitted = h.submitter.submitted();
    assert_eq!(submitted.len(), 3);
    for payload in &submitted {
        assert_eq!(payload.start, february_start_ms());
        assert_eq!(payload.end, payload.start);
        assert_eq!(payload.measured_usage[0].quantity, 1);
    }
}

#[tokio::test]
async fn duplicate_record_is_retried_on_next_attempt() {
    let submitter = ScriptedSubmitter::new(
        vec![Step::FailIds(vec!["inst-b".to_string()], "Duplicate record".to_string())],
        Step::AcceptAll,
    );
    let h = HarnessBuilder::new()
        .instances(&["inst-a", "inst-b", "inst-c"])
        .submitter(submitter)
        .build();

    let outcome = h.controller.run_scheduled().await.unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Succeeded {
            attempts: 2,
            submitted: 3
        }
    );

    let calls = h.submitter.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].len(), 3);
    assert_eq!(calls[1].len(), 1);
    assert_eq!(calls[1][0].resource_instance_id, "inst-b");

    assert_eq!(h.queue.count().await.unwrap(), 0);
    assert!(h.sender.summaries().is_empty());
}

#[tokio::test]
async fn persistent_failures_are_escalated_once_and_left_queued() {
    let submitter = ScriptedSubmitter::new(Vec::new(), Step::FailAll(SERVER_ERROR.to_string()));
    let h = HarnessBuilder::new()
        .instances(&["inst-a", "inst-b"])
        .submitter(submitter)
        .build();

    let outcome = h.controller.run_scheduled().await.unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Escalated {
            attempts: 3,
            remaining: 2
        }
    );
    assert_eq!(h.submitter.call_count(), 3);

    let summaries = h.sender.summaries();
    assert_eq!(summaries.len(), 1);
    assert_eq!(
        summaries[0].subject,
        "[Service Broker Acme DB] Billing for 2 instances failed"
    );
    assert!(summaries[0].body_text.contains(&format!("inst-a: {}", SERVER_ERROR)));

    let remaining = h.queue.list_all().await.unwrap();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().all(|r| r.message == SERVER_ERROR));
}

#[tokio::test]
async fn queue_is_drained_in_batch_sized_pages() {
    let h = HarnessBuilder::new()
        .instances(&["inst-1", "inst-2", "inst-3", "inst-4", "inst-5"])
        .submitter(ScriptedSubmitter::accepting().with_batch_size(2))
        .build();

    h.controller.run_scheduled().await.unwrap();

    let sizes: Vec<usize> = h
        .submitter
        .calls
        .lock()
        .unwrap()
        .iter()
        .map(Vec::len)
        .collect();
    assert_eq!(sizes, vec![2, 2, 1]);

    let ids: Vec<String> = h
        .submitter
        .submitted()
        .into_iter()
        .map(|p| p.resource_instance_id)
        .collect();
    assert_eq!(ids, vec!["inst-1", "inst-2", "inst-3", "inst-4", "inst-5"]);
}

#[tokio::test]
async fn queued_failures_never_exceed_instance_count() {
    let submitter = ScriptedSubmitter::new(Vec::new(), Step::FailAll(SERVER_ERROR.to_string()))
        .with_batch_size(2);
    let h = HarnessBuilder::new()
        .instances(&["inst-1", "inst-2", "inst-3", "inst-4", "inst-5"])
        .submitter(submitter)
        .build();

    let outcome = h.controller.run_scheduled().await.unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Escalated {
            attempts: 3,
            remaining: 5
        }
    );
    // three pages per attempt
    assert_eq!(h.submitter.call_count(), 9);
    assert_eq!(h.queue.count().await.unwrap(), 5);
    assert_eq!(h.sender.summaries()[0].failure_count, 5);
}

#[tokio::test]
async fn token_failure_aborts_run_before_any_submission() {
    let tokens = Arc::new(FailingTokenProvider::default());
    let h = HarnessBuilder::new()
        .instances(&["inst-a", "inst-b"])
        .tokens(tokens.clone())
        .build();

    let result = h.controller.run_scheduled().await;

    assert!(matches!(result, Err(AppError::AuthError(_))));
    assert_eq!(tokens.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.submitter.call_count(), 0);
    // queue keeps the seeded records
    assert_eq!(h.queue.count().await.unwrap(), 2);
    assert!(h.sender.summaries().is_empty());
    assert!(!h.controller.is_run_active());
}

#[tokio::test]
async fn persistence_failure_propagates() {
    let h = HarnessBuilder::new()
        .instances(&["inst-a"])
        .queue(Arc::new(BrokenQueue))
        .build();

    let result = h.controller.run_scheduled().await;

    assert!(matches!(result, Err(AppError::DatabaseError(_))));
    assert_eq!(h.submitter.call_count(), 0);
    assert!(!h.controller.is_run_active());
}

#[tokio::test]
async fn failed_rewrite_keeps_previous_failure_set() {
    let fail = || Step::FailAll(SERVER_ERROR.to_string());
    let submitter = ScriptedSubmitter::new(
        vec![
            fail(),
            fail(),
            fail(),
            fail(),
            fail(),
            Step::FailAll("upstream said \0".to_string()),
        ],
        Step::AcceptAll,
    )
    .with_batch_size(1);
    let h = HarnessBuilder::new()
        .instances(&["inst-a", "inst-b", "inst-c"])
        .submitter(submitter)
        .policy(RetryPolicy::new(2, std::time::Duration::ZERO))
        .build();

    let result = h.controller.run_scheduled().await;

    assert!(matches!(result, Err(AppError::DatabaseError(_))));
    assert_eq!(h.submitter.call_count(), 6);
    assert!(h.sender.summaries().is_empty());
    assert!(!h.controller.is_run_active());

    // the first attempt's failure set survives the rejected rewrite whole
    let remaining = h.queue.list_all().await.unwrap();
    assert_eq!(remaining.len(), 3);
    assert!(remaining.iter().all(|r| r.message == SERVER_ERROR));
}

#[tokio::test]
async fn undecodable_row_is_escalated_before_it_is_cleared() {
    let h = HarnessBuilder::new().instances(&["inst-a", "inst-b"]);
    let inner = Arc::new(metering_service::services::InMemoryFailureQueue::new());
    let h = h.queue(Arc::new(CorruptingQueue::new(inner.clone()))).build();

    let outcome = h.controller.run_scheduled().await.unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Succeeded {
            attempts: 1,
            submitted: 2
        }
    );
    assert_eq!(h.submitter.submitted().len(), 2);
    assert_eq!(inner.count().await.unwrap(), 0);

    let summaries = h.sender.summaries();
    assert_eq!(summaries.len(), 1);
    assert_eq!(
        summaries[0].subject,
        "[Service Broker Acme DB] 1 billing records could not be decoded"
    );
    assert!(summaries[0].body_text.contains("{\"plan_id\":"));
}

#[tokio::test]
async fn manual_retry_escalates_undecodable_rows() {
    let h = HarnessBuilder::new()
        .instances(&["inst-a"])
        .submitter(ScriptedSubmitter::new(
            vec![Step::FailAll(SERVER_ERROR.to_string())],
            Step::AcceptAll,
        ))
        .policy(RetryPolicy::no_retry())
        .build();

    h.controller.run_scheduled().await.unwrap();
    h.queue.push_record("not a payload", "Duplicate record").await;

    let remaining = h.controller.retry_all_failures().await.unwrap();

    assert!(remaining.is_empty());
    assert_eq!(h.queue.count().await.unwrap(), 0);
    let last_call = h.submitter.calls.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last_call.len(), 1);
    assert_eq!(last_call[0].resource_instance_id, "inst-a");

    let summaries = h.sender.summaries();
    assert_eq!(summaries.len(), 2);
    assert!(summaries[1]
        .body_text
        .contains("Duplicate record (stored payload: not a payload)"));
}

#[tokio::test]
async fn submitter_error_ends_run_without_escalation() {
    let h = HarnessBuilder::new()
        .instances(&["inst-a"])
        .submitter(ScriptedSubmitter::new(vec![Step::Error], Step::AcceptAll))
        .build();

    let result = h.controller.run_scheduled().await;

    assert!(matches!(result, Err(AppError::InternalError(_))));
    assert_eq!(h.submitter.call_count(), 1);
    assert!(h.sender.summaries().is_empty());
}

#[tokio::test]
async fn empty_instance_list_succeeds_trivially() {
    let h = HarnessBuilder::new().build();

    let outcome = h.controller.run_scheduled().await.unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Succeeded {
            attempts: 1,
            submitted: 0
        }
    );
    assert_eq!(h.submitter.call_count(), 0);
}

#[tokio::test]
async fn manual_dry_run_bills_current_month_with_zero_quantity() {
    let submitter = ScriptedSubmitter::new(
        vec![Step::FailAll(SERVER_ERROR.to_string())],
        Step::AcceptAll,
    );
    let h = HarnessBuilder::new()
        .instances(&["inst-a", "inst-b"])
        .submitter(submitter)
        .policy(RetryPolicy::no_retry())
        .build();

    // leave two records in the queue
    h.controller.run_scheduled().await.unwrap();
    let before = h.queue.list_all().await.unwrap();
    assert_eq!(before.len(), 2);

    h.controller
        .submit_billing_for_instance_id("inst-a", true)
        .await
        .unwrap();

    let last_call = h.submitter.calls.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last_call.len(), 1);
    assert_eq!(last_call[0].resource_instance_id, "inst-a");
    assert_eq!(last_call[0].start, march_start_ms());
    assert_eq!(last_call[0].measured_usage[0].quantity, 0);

    assert_eq!(h.queue.list_all().await.unwrap(), before);
}

#[tokio::test]
async fn single_instance_failure_is_bad_gateway() {
    let h = HarnessBuilder::new()
        .instances(&["inst-a"])
        .submitter(ScriptedSubmitter::new(
            Vec::new(),
            Step::FailAll(SERVER_ERROR.to_string()),
        ))
        .build();

    let err = h
        .controller
        .submit_billing_for_instance_id("inst-a", false)
        .await
        .unwrap_err();

    match err {
        AppError::BadGateway(msg) => {
            assert!(msg.contains("inst-a"));
            assert!(msg.contains(SERVER_ERROR));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    // single-instance billing is never retried
    assert_eq!(h.submitter.call_count(), 1);
    assert_eq!(h.queue.count().await.unwrap(), 0);
}

#[tokio::test]
async fn unknown_instance_is_not_found() {
    let h = HarnessBuilder::new().instances(&["inst-a"]).build();

    let result = h
        .controller
        .submit_billing_for_instance_id("inst-missing", false)
        .await;

    assert!(matches!(result, Err(AppError::NotFound(_))));
    assert_eq!(h.submitter.call_count(), 0);
}

#[tokio::test]
async fn deprovisioned_instance_is_billed_for_current_month() {
    let h = HarnessBuilder::new().build();

    h.controller
        .bill_deprovisioned_instance(&common::instance("inst-gone"))
        .await
        .unwrap();

    let submitted = h.submitter.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].start, march_start_ms());
    assert_eq!(submitted[0].measured_usage[0].quantity, 1);
}

#[tokio::test]
async fn manual_retry_resubmits_outstanding_records() {
    let submitter = ScriptedSubmitter::new(
        vec![Step::FailIds(vec!["inst-b".to_string()], SERVER_ERROR.to_string())],
        Step::AcceptAll,
    );
    let h = HarnessBuilder::new()
        .instances(&["inst-a", "inst-b"])
        .submitter(submitter)
        .policy(RetryPolicy::no_retry())
        .build();

    let outcome = h.controller.run_scheduled().await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Escalated {
            attempts: 1,
            remaining: 1
        }
    );

    let remaining = h.controller.retry_all_failures().await.unwrap();

    assert!(remaining.is_empty());
    assert_eq!(h.queue.count().await.unwrap(), 0);
    let last_call = h.submitter.calls.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last_call.len(), 1);
    assert_eq!(last_call[0].resource_instance_id, "inst-b");
    // the retried record keeps its original billing window
    assert_eq!(last_call[0].start, february_start_ms());
}

#[tokio::test]
async fn manual_retry_returns_records_still_failing() {
    let h = HarnessBuilder::new()
        .instances(&["inst-a"])
        .submitter(ScriptedSubmitter::new(
            Vec::new(),
            Step::FailAll(SERVER_ERROR.to_string()),
        ))
        .policy(RetryPolicy::no_retry())
        .build();

    h.controller.run_scheduled().await.unwrap();
    let remaining = h.controller.retry_all_failures().await.unwrap();

    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].message, SERVER_ERROR);
    assert_eq!(remaining[0].usage_payload().unwrap().resource_instance_id, "inst-a");
    // one escalation per run
    assert_eq!(h.sender.summaries().len(), 2);
}

#[tokio::test]
async fn manual_retry_on_empty_queue_is_a_no_op() {
    let h = HarnessBuilder::new().build();

    let remaining = h.controller.retry_all_failures().await.unwrap();

    assert!(remaining.is_empty());
    assert_eq!(h.submitter.call_count(), 0);
    assert!(h.sender.summaries().is_empty());
}

/// Blocks inside `submit` until released.
#[derive(Default)]
struct GatedSubmitter {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl UsageSubmitter for GatedSubmitter {
    async fn submit(
        &self,
        _token: &str,
        _payloads: &[UsagePayload],
    ) -> Result<Vec<UsageFailure>, AppError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(Vec::new())
    }

    fn batch_size(&self) -> usize {
        10
    }
}

#[tokio::test]
async fn overlapping_runs_are_skipped_or_rejected() {
    use metering_service::services::{
        Escalator, InMemoryFailureQueue, InMemoryInstanceStore, ReconciliationController,
        StaticTokenProvider,
    };

    let gate = Arc::new(GatedSubmitter::default());
    let controller = Arc::new(ReconciliationController::new(
        Arc::new(InMemoryFailureQueue::new()),
        Arc::new(InMemoryInstanceStore::new(vec![common::instance("inst-a")])),
        Arc::new(StaticTokenProvider::new("t")),
        gate.clone(),
        Escalator::new(Arc::new(common::RecordingSender::default()), "Acme"),
        RetryPolicy::no_retry(),
    ));

    let running = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.run_scheduled().await })
    };

    gate.entered.notified().await;
    assert!(controller.is_run_active());

    assert_eq!(controller.run_scheduled().await.unwrap(), RunOutcome::Skipped);
    assert!(matches!(
        controller.retry_all_failures().await,
        Err(AppError::Conflict(_))
    ));

    // single-instance billing is not guarded
    let single = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .submit_billing_for_instance_id("inst-a", true)
                .await
        })
    };
    gate.entered.notified().await;

    gate.release.notify_waiters();
    single.await.unwrap().unwrap();
    let first = running.await.unwrap().unwrap();
    assert!(matches!(first, RunOutcome::Succeeded { attempts: 1, .. }));
    assert!(!controller.is_run_active());
}
