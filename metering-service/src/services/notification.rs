//! Escalation of billing failures to a human channel.

use crate::config::{SmtpConfig, SnsConfig};
use crate::models::{FailureRecord, UsageFailure};
use crate::services::metrics::record_escalation;
use askama::Template;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use chrono::Utc;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::instrument;

/// Human-readable digest of the records that could not be billed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationSummary {
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
    pub failure_count: usize,
}

#[derive(Template)]
#[template(source = "{% for line in lines %}<p>{{ line }}</p>{% endfor %}", ext = "html")]
struct SummaryHtml<'a> {
    lines: &'a [String],
}

impl NotificationSummary {
    pub fn from_failures(product: &str, failures: &[UsageFailure]) -> Self {
        let lines = failures
            .iter()
            .map(|f| summary_line(Some(&f.payload.resource_instance_id), &f.message))
            .collect();
        Self::build(failed_subject(product, failures.len()), lines)
    }

    /// Records whose payload cannot be decoded are listed by message only.
    pub fn from_records(product: &str, records: &[FailureRecord]) -> Self {
        let lines = records
            .iter()
            .map(|r| {
                let instance = r.usage_payload().ok().map(|p| p.resource_instance_id);
                summary_line(instance.as_deref(), &r.message)
            })
            .collect();
        Self::build(failed_subject(product, records.len()), lines)
    }

    /// Stored rows that can no longer be billed, listed with their raw
    /// payload so they can be billed by hand.
    pub fn from_undecodable(product: &str, records: &[FailureRecord]) -> Self {
        let lines = records
            .iter()
            .map(|r| format!("record {}: {} (stored payload: {})", r.id, r.message, r.payload))
            .collect();
        Self::build(
            format!(
                "[Service Broker {}] {} billing records could not be decoded",
                product,
                records.len()
            ),
            lines,
        )
    }

    fn build(subject: String, lines: Vec<String>) -> Self {
        let mut body_text = String::new();
        for line in &lines {
            body_text.push_str(line);
            body_text.push_str("\n\n");
        }

        let body_html = SummaryHtml { lines: &lines }.render().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to render HTML summary");
            String::new()
        });

        Self {
            subject,
            body_text,
            body_html,
            failure_count: lines.len(),
        }
    }
}

fn failed_subject(product: &str, count: usize) -> String {
    format!(
        "[Service Broker {}] Billing for {} instances failed",
        product, count
    )
}

fn summary_line(instance_id: Option<&str>, message: &str) -> String {
    match instance_id {
        Some(id) if !id.is_empty() => format!("{}: {}", id, message),
        _ => message.to_string(),
    }
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, summary: &NotificationSummary) -> Result<(), AppError>;
}

/// Sends summaries by email.
pub struct SmtpNotificationSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

/// TLS mode for the relay: implicit TLS when `tls` is set, otherwise a
/// plain connection upgraded with STARTTLS if the relay offers it.
fn smtp_tls(config: &SmtpConfig) -> Result<Tls, AppError> {
    let parameters = TlsParameters::builder(config.host.clone())
        .dangerous_accept_invalid_certs(!config.verify_cert)
        .build()
        .map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("Invalid SMTP TLS settings: {}", e))
        })?;

    Ok(if config.tls {
        Tls::Wrapper(parameters)
    } else {
        Tls::Opportunistic(parameters)
    })
}

impl SmtpNotificationSender {
    pub fn new(config: &SmtpConfig) -> Result<Self, AppError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            .port(config.port)
            .tls(smtp_tls(config)?);
        if !config.user.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.user.clone(),
                config.password.expose_secret().clone(),
            ));
        }

        let from: Mailbox = config.from.parse().map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("Invalid SMTP_FROM address: {}", e))
        })?;

        let to = config
            .to
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<Mailbox>().map_err(|e| {
                    AppError::ConfigError(anyhow::anyhow!("Invalid SMTP_TO address {}: {}", s, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if to.is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SMTP_TO must name at least one recipient"
            )));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            to,
        })
    }
}

#[async_trait]
impl NotificationSender for SmtpNotificationSender {
    #[instrument(skip(self, summary), fields(subject = %summary.subject))]
    async fn send(&self, summary: &NotificationSummary) -> Result<(), AppError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(summary.subject.clone());
        for recipient in &self.to {
            builder = builder.to(recipient.clone());
        }

        let message = builder
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(summary.body_text.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(summary.body_html.clone()),
                    ),
            )
            .map_err(AppError::from)?;

        self.transport
            .send(message)
            .await
            .map_err(|e| AppError::EmailError(format!("Failed to send email: {}", e)))?;

        tracing::info!(recipients = self.to.len(), "Billing failure email sent");
        Ok(())
    }
}

/// Writes summaries to the log. Used when no mail relay is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotificationSender;

#[async_trait]
impl NotificationSender for LogNotificationSender {
    async fn send(&self, summary: &NotificationSummary) -> Result<(), AppError> {
        tracing::error!(
            subject = %summary.subject,
            failures = summary.failure_count,
            body = %summary.body_text,
            "Billing failure escalation"
        );
        Ok(())
    }
}

/// Publishes summaries to a pub-sub topic as plain text.
pub struct SnsNotificationSender {
    client: aws_sdk_sns::Client,
    topic_arn: String,
}

impl SnsNotificationSender {
    pub fn new(client: aws_sdk_sns::Client, topic_arn: impl Into<String>) -> Self {
        Self {
            client,
            topic_arn: topic_arn.into(),
        }
    }

    /// Build a client from the standard AWS environment.
    pub async fn from_config(config: &SnsConfig) -> Result<Self, AppError> {
        let topic_arn = config.topic_arn.clone().ok_or_else(|| {
            AppError::ConfigError(anyhow::anyhow!("SNS_TOPIC_ARN is required for pub-sub notifications"))
        })?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared_config = loader.load().await;

        Ok(Self::new(aws_sdk_sns::Client::new(&shared_config), topic_arn))
    }

    pub fn topic_arn(&self) -> &str {
        &self.topic_arn
    }
}

#[async_trait]
impl NotificationSender for SnsNotificationSender {
    #[instrument(skip(self, summary), fields(subject = %summary.subject, topic = %self.topic_arn))]
    async fn send(&self, summary: &NotificationSummary) -> Result<(), AppError> {
        let output = self
            .client
            .publish()
            .topic_arn(&self.topic_arn)
            .subject(&summary.subject)
            .message(&summary.body_text)
            .send()
            .await
            .map_err(|e| {
                AppError::BadGateway(format!(
                    "Failed to publish notification: {}",
                    aws_sdk_sns::error::DisplayErrorContext(&e)
                ))
            })?;

        tracing::info!(
            message_id = output.message_id().unwrap_or_default(),
            "Notification published"
        );
        Ok(())
    }
}

/// Formats and dispatches the final failure set of a run.
#[derive(Clone)]
pub struct Escalator {
    sender: Arc<dyn NotificationSender>,
    test_channel: Option<Arc<dyn NotificationSender>>,
    product: String,
}

impl Escalator {
    pub fn new(sender: Arc<dyn NotificationSender>, product: impl Into<String>) -> Self {
        Self {
            sender,
            test_channel: None,
            product: product.into(),
        }
    }

    /// Route admin test notifications to their own channel.
    pub fn with_test_channel(mut self, channel: Arc<dyn NotificationSender>) -> Self {
        self.test_channel = Some(channel);
        self
    }

    /// Dispatch a summary of `failures`. Dispatch errors are logged and
    /// swallowed; returns whether the notification went out.
    #[instrument(skip(self, failures), fields(failures = failures.len()))]
    pub async fn escalate(&self, failures: &[UsageFailure]) -> bool {
        let summary = NotificationSummary::from_failures(&self.product, failures);
        self.dispatch(&summary).await
    }

    /// Report stored rows that were removed from the queue because their
    /// payload no longer decodes.
    #[instrument(skip(self, records), fields(records = records.len()))]
    pub async fn escalate_undecodable(&self, records: &[FailureRecord]) -> bool {
        let summary = NotificationSummary::from_undecodable(&self.product, records);
        self.dispatch(&summary).await
    }

    async fn dispatch(&self, summary: &NotificationSummary) -> bool {
        match self.sender.send(summary).await {
            Ok(()) => {
                record_escalation("sent");
                tracing::warn!(failures = summary.failure_count, "Billing failures escalated");
                true
            }
            Err(e) => {
                record_escalation("failed");
                tracing::error!(error = %e, failures = summary.failure_count, "Failed to dispatch billing escalation");
                false
            }
        }
    }

    /// Send a two-item sample summary to verify the channel.
    pub async fn send_test_notification(&self) -> Result<(), AppError> {
        let now = Utc::now();
        let samples: Vec<FailureRecord> = (1..=2)
            .map(|i| FailureRecord {
                id: i,
                payload: "{}".to_string(),
                message: format!("Billing for instance {} failed", i),
                created_utc: now,
                updated_utc: now,
            })
            .collect();
        let summary = NotificationSummary::from_records(&self.product, &samples);
        self.test_channel
            .as_ref()
            .unwrap_or(&self.sender)
            .send(&summary)
            .await
    }
}
