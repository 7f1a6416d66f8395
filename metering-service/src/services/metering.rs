//! Metering API client.
//!
//! Posts batches of usage records to
//! `{endpoint}/v4/metering/resources/{resource_id}/usage` and classifies the
//! response into the records that still need to be billed.

use crate::config::MeteringApiConfig;
use crate::models::{UsageFailure, UsagePayload};
use crate::services::metrics::{record_usage_failures, record_usage_submission};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use service_core::error::AppError;
use std::fmt;
use std::str::FromStr;
use tracing::instrument;

/// Usage path relative to the metering endpoint.
pub const USAGE_API_PATH: &str = "/v4/metering/resources/{resource_id}/usage";

/// Per-item status reported for a record that was already accepted.
pub const DUPLICATE_RECORD_STATUS: u16 = 409;

pub const UNEXPECTED_FAILURE_MESSAGE: &str =
    "Billing request failed unexpectedly. Check logs for information.";
pub const MALFORMED_RESPONSE_MESSAGE: &str = "Malformed multi-status response from metering API";

/// Which rejected items of a multi-status response are kept for retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RejectionPolicy {
    /// Only duplicate-record items are retried; every other rejected item is
    /// logged and dropped.
    #[default]
    DuplicateOnly,
    /// Every item outside 2xx is retried.
    AllRejected,
}

impl RejectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DuplicateOnly => "duplicate_only",
            Self::AllRejected => "all_rejected",
        }
    }
}

impl fmt::Display for RejectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RejectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "duplicate_only" => Ok(Self::DuplicateOnly),
            "all_rejected" => Ok(Self::AllRejected),
            other => Err(format!("Unknown rejection policy: {}", other)),
        }
    }
}

/// Body of a 202 multi-status response.
#[derive(Debug, Deserialize)]
pub struct UsageBatchResponse {
    pub resources: Vec<UsageItemResult>,
}

/// Result for one submitted record, aligned by index with the request.
#[derive(Debug, Deserialize)]
pub struct UsageItemResult {
    pub status: u16,
    #[serde(default)]
    pub message: Option<String>,
}

impl UsageItemResult {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Submits usage batches and reports the records that were not accepted.
#[async_trait]
pub trait UsageSubmitter: Send + Sync {
    /// Submit one batch. An empty result means every record was accepted.
    async fn submit(
        &self,
        token: &str,
        payloads: &[UsagePayload],
    ) -> Result<Vec<UsageFailure>, AppError>;

    /// Largest batch accepted by [`UsageSubmitter::submit`].
    fn batch_size(&self) -> usize;
}

/// HTTP client for the metering API.
#[derive(Clone)]
pub struct MeteringClient {
    client: Client,
    usage_url: String,
    page_size: usize,
    policy: RejectionPolicy,
}

impl MeteringClient {
    pub fn new(config: &MeteringApiConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            usage_url: usage_url(&config.endpoint, &config.resource_id),
            page_size: config.page_size.max(1),
            policy: config.rejection_policy,
        })
    }

    pub fn usage_url(&self) -> &str {
        &self.usage_url
    }

    pub fn policy(&self) -> RejectionPolicy {
        self.policy
    }
}

/// Full usage URL for a resource.
pub fn usage_url(endpoint: &str, resource_id: &str) -> String {
    format!(
        "{}{}",
        endpoint.trim_end_matches('/'),
        USAGE_API_PATH.replace("{resource_id}", resource_id)
    )
}

#[async_trait]
impl UsageSubmitter for MeteringClient {
    #[instrument(skip(self, token, payloads), fields(batch = payloads.len()))]
    async fn submit(
        &self,
        token: &str,
        payloads: &[UsagePayload],
    ) -> Result<Vec<UsageFailure>, AppError> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }
        if payloads.len() > self.page_size {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Usage batch of {} exceeds page size {}",
                payloads.len(),
                self.page_size
            )));
        }

        let response = match self
            .client
            .post(&self.usage_url)
            .bearer_auth(token)
            .json(payloads)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "Usage submission failed before a response was received");
                record_usage_submission("transport_error");
                record_usage_failures("transport", payloads.len());
                return Ok(fail_all(payloads, UNEXPECTED_FAILURE_MESSAGE));
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(status = %status, error = %e, "Failed to read usage response body");
                record_usage_submission("transport_error");
                record_usage_failures("transport", payloads.len());
                return Ok(fail_all(payloads, UNEXPECTED_FAILURE_MESSAGE));
            }
        };

        tracing::debug!(status = %status, body = %body, "Usage API response");

        let failures = classify_response(status, &body, payloads, self.policy);
        record_usage_submission(status.as_str());
        if !failures.is_empty() {
            record_usage_failures(status.as_str(), failures.len());
        }
        Ok(failures)
    }

    fn batch_size(&self) -> usize {
        self.page_size
    }
}

/// Map a metering API response onto the records that were not accepted.
pub fn classify_response(
    status: StatusCode,
    body: &str,
    payloads: &[UsagePayload],
    policy: RejectionPolicy,
) -> Vec<UsageFailure> {
    match status {
        StatusCode::CREATED => Vec::new(),
        StatusCode::ACCEPTED => classify_multi_status(body, payloads, policy),
        other if !other.is_success() => {
            tracing::error!(status = %other, body = %body, "Usage API rejected the batch");
            fail_all(payloads, UNEXPECTED_FAILURE_MESSAGE)
        }
        other => {
            tracing::error!(status = %other, body = %body, "Unexpected success status from usage API");
            fail_all(
                payloads,
                &format!("Billing request failed with status: {}", other.as_u16()),
            )
        }
    }
}

fn classify_multi_status(
    body: &str,
    payloads: &[UsagePayload],
    policy: RejectionPolicy,
) -> Vec<UsageFailure> {
    let parsed: UsageBatchResponse = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::error!(error = %e, body = %body, "Unparseable multi-status usage response");
            return fail_all(payloads, MALFORMED_RESPONSE_MESSAGE);
        }
    };

    if parsed.resources.len() != payloads.len() {
        tracing::error!(
            expected = payloads.len(),
            received = parsed.resources.len(),
            "Multi-status usage response is not aligned with the request"
        );
        return fail_all(payloads, MALFORMED_RESPONSE_MESSAGE);
    }

    parsed
        .resources
        .into_iter()
        .zip(payloads)
        .filter(|(item, _)| !item.is_success())
        .filter_map(|(item, payload)| {
            let duplicate = item.status == DUPLICATE_RECORD_STATUS;
            if !duplicate && policy == RejectionPolicy::DuplicateOnly {
                tracing::warn!(
                    instance_id = %payload.resource_instance_id,
                    status = item.status,
                    message = item.message.as_deref().unwrap_or(""),
                    "Rejected usage record dropped by duplicate-only policy"
                );
                return None;
            }

            let message = item.message.unwrap_or_else(|| {
                format!(
                    "Usage record for {} rejected with status: {}",
                    payload.resource_instance_id, item.status
                )
            });
            Some(UsageFailure::new(payload.clone(), message))
        })
        .collect()
}

fn fail_all(payloads: &[UsagePayload], message: &str) -> Vec<UsageFailure> {
    payloads
        .iter()
        .map(|payload| UsageFailure::new(payload.clone(), message))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MeasuredUsage, INSTANCE_MEASURE};

    fn payloads(n: usize) -> Vec<UsagePayload> {
        (0..n)
            .map(|i| UsagePayload {
                plan_id: "plan".to_string(),
                resource_instance_id: format!("inst-{}", i),
                start: 1_000,
                end: 1_000,
                region: "eu-de".to_string(),
                measured_usage: vec![MeasuredUsage {
                    measure: INSTANCE_MEASURE.to_string(),
                    quantity: 1,
                }],
            })
            .collect()
    }

    #[test]
    fn usage_url_substitutes_resource_id() {
        assert_eq!(
            usage_url("https://metering.example.com/", "svc-123"),
            "https://metering.example.com/v4/metering/resources/svc-123/usage"
        );
    }

    #[test]
    fn created_means_no_failures() {
        let failures = classify_response(StatusCode::CREATED, "", &payloads(3), RejectionPolicy::default());
        assert!(failures.is_empty());
    }

    #[test]
    fn error_status_fails_whole_batch_with_generic_reason() {
        let batch = payloads(2);
        let failures = classify_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "down",
            &batch,
            RejectionPolicy::default(),
        );
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].message, UNEXPECTED_FAILURE_MESSAGE);
        assert_eq!(failures[1].payload, batch[1]);

        let failures = classify_response(
            StatusCode::BAD_REQUEST,
            "",
            &payloads(1),
            RejectionPolicy::AllRejected,
        );
        assert_eq!(failures[0].message, UNEXPECTED_FAILURE_MESSAGE);
    }

    #[test]
    fn plain_ok_is_not_treated_as_acceptance() {
        let failures = classify_response(StatusCode::OK, "{}", &payloads(1), RejectionPolicy::default());
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].message, "Billing request failed with status: 200");

        let failures = classify_response(StatusCode::NO_CONTENT, "", &payloads(1), RejectionPolicy::default());
        assert_eq!(failures[0].message, "Billing request failed with status: 204");
    }

    #[test]
    fn multi_status_keeps_duplicates_only_by_default() {
        let batch = payloads(3);
        let body = r#"{"resources":[
            {"status":201},
            {"status":409,"message":"duplicate usage for inst-1"},
            {"status":400,"message":"bad region"}
        ]}"#;
        let failures = classify_response(StatusCode::ACCEPTED, body, &batch, RejectionPolicy::DuplicateOnly);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].payload, batch[1]);
        assert_eq!(failures[0].message, "duplicate usage for inst-1");
    }

    #[test]
    fn multi_status_keeps_every_rejection_when_configured() {
        let batch = payloads(3);
        let body = r#"{"resources":[{"status":201},{"status":409},{"status":400,"message":"bad region"}]}"#;
        let failures = classify_response(StatusCode::ACCEPTED, body, &batch, RejectionPolicy::AllRejected);
        assert_eq!(failures.len(), 2);
        assert_eq!(
            failures[0].message,
            "Usage record for inst-1 rejected with status: 409"
        );
        assert_eq!(failures[1].message, "bad region");
    }

    #[test]
    fn misaligned_multi_status_fails_whole_batch() {
        let body = r#"{"resources":[{"status":201}]}"#;
        let failures = classify_response(StatusCode::ACCEPTED, body, &payloads(2), RejectionPolicy::default());
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|f| f.message == MALFORMED_RESPONSE_MESSAGE));
    }

    #[test]
    fn unparseable_multi_status_fails_whole_batch() {
        let failures = classify_response(
            StatusCode::ACCEPTED,
            r#"{"items":[]}"#,
            &payloads(1),
            RejectionPolicy::default(),
        );
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].message, MALFORMED_RESPONSE_MESSAGE);
    }

    #[test]
    fn rejection_policy_parses_config_values() {
        assert_eq!("duplicate_only".parse::<RejectionPolicy>(), Ok(RejectionPolicy::DuplicateOnly));
        assert_eq!(" ALL_REJECTED ".parse::<RejectionPolicy>(), Ok(RejectionPolicy::AllRejected));
        assert!("sometimes".parse::<RejectionPolicy>().is_err());
    }
}
