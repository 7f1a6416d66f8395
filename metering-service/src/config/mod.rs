//! Configuration module for metering-service.

use crate::services::metering::RejectionPolicy;
use secrecy::SecretString;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MeteringConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub metering: MeteringApiConfig,
    pub iam: IamConfig,
    pub billing: BillingJobConfig,
    pub smtp: SmtpConfig,
    pub sns: SnsConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct MeteringApiConfig {
    /// Base URL of the metering API, without the `/v4/...` path.
    pub endpoint: String,
    /// Catalog resource id substituted into the usage path.
    pub resource_id: String,
    /// Records per submission batch and per queue page.
    pub page_size: usize,
    pub rejection_policy: RejectionPolicy,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct IamConfig {
    pub endpoint: String,
    pub api_key: SecretString,
}

#[derive(Debug, Clone)]
pub struct BillingJobConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub backoff: Duration,
    /// Product tag used in escalation subjects.
    pub product: String,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Implicit TLS from the first byte (usually port 465). Without it the
    /// connection is plain and upgraded with STARTTLS when offered.
    pub tls: bool,
    /// Reject relays whose certificate does not validate.
    pub verify_cert: bool,
    pub user: String,
    pub password: SecretString,
    pub from: String,
    pub to: String,
}

/// Pub-sub channel for admin test notifications. Credentials and region
/// come from the standard AWS environment.
#[derive(Debug, Clone, Default)]
pub struct SnsConfig {
    pub topic_arn: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
}

impl MeteringConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let rejection_policy = env::var("METERING_REJECTION_POLICY")
            .unwrap_or_else(|_| "duplicate_only".to_string())
            .parse::<RejectionPolicy>()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let smtp_tls = parsed("SMTP_TLS", false);

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "metering-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: required("DATABASE_URL")?,
                max_connections: parsed("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parsed("DATABASE_MIN_CONNECTIONS", 2),
            },
            metering: MeteringApiConfig {
                endpoint: required("USAGE_ENDPOINT")?,
                resource_id: required("GLOBAL_CATALOG_SERVICE_ID")?,
                page_size: parsed("METERING_PAGE_SIZE", 100usize).max(1),
                rejection_policy,
                timeout: Duration::from_secs(parsed("METERING_TIMEOUT_SECS", 30)),
            },
            iam: IamConfig {
                endpoint: required("IAM_ENDPOINT")?,
                api_key: SecretString::new(required("IAM_API_KEY")?),
            },
            billing: BillingJobConfig {
                enabled: parsed("BILLING_JOB_ENABLED", true),
                max_attempts: parsed("BILLING_MAX_ATTEMPTS", 3u32).max(1),
                backoff: Duration::from_secs(parsed("BILLING_BACKOFF_SECS", 60)),
                product: env::var("BROKER_PRODUCT").unwrap_or_default(),
            },
            smtp: SmtpConfig {
                enabled: parsed("SMTP_ENABLED", false),
                host: env::var("SMTP_HOST").unwrap_or_default(),
                port: parsed("SMTP_PORT", if smtp_tls { 465 } else { 587 }),
                tls: smtp_tls,
                verify_cert: parsed("SMTP_VERIFY_CERT", false),
                user: env::var("SMTP_USER").unwrap_or_default(),
                password: SecretString::new(env::var("SMTP_PASSWORD").unwrap_or_default()),
                from: env::var("SMTP_FROM").unwrap_or_default(),
                to: env::var("SMTP_TO").unwrap_or_default(),
            },
            sns: SnsConfig {
                topic_arn: non_empty("SNS_TOPIC_ARN"),
                region: non_empty("AWS_REGION"),
                endpoint: non_empty("SNS_ENDPOINT"),
            },
        })
    }
}

fn required(key: &str) -> Result<String, AppError> {
    env::var(key).map_err(|_| AppError::ConfigError(anyhow::anyhow!("{} is required", key)))
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
