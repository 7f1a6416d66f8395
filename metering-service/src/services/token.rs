//! Bearer tokens for outbound metering calls.

use crate::config::IamConfig;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use service_core::error::AppError;
use tracing::instrument;

const IAM_IDENTITY_TOKEN_PATH: &str = "/identity/token";
const IAM_GRANT_TYPE: &str = "urn:ibm:params:oauth:grant-type:apikey";

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A fresh access token. Fetched once per attempt; never cached here.
    async fn access_token(&self) -> Result<String, AppError>;
}

/// Exchanges an IAM API key for an access token.
#[derive(Clone)]
pub struct IamTokenProvider {
    client: Client,
    token_url: String,
    api_key: SecretString,
}

#[derive(Debug, Deserialize)]
struct IamTokenResponse {
    #[serde(default)]
    access_token: Option<String>,
}

impl IamTokenProvider {
    pub fn new(config: &IamConfig) -> Self {
        Self {
            client: Client::new(),
            token_url: format!(
                "{}{}",
                config.endpoint.trim_end_matches('/'),
                IAM_IDENTITY_TOKEN_PATH
            ),
            api_key: config.api_key.clone(),
        }
    }
}

#[async_trait]
impl TokenProvider for IamTokenProvider {
    #[instrument(skip(self))]
    async fn access_token(&self) -> Result<String, AppError> {
        let response = self
            .client
            .post(&self.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("grant_type", IAM_GRANT_TYPE),
                ("apikey", self.api_key.expose_secret().as_str()),
            ])
            .send()
            .await
            .map_err(|e| AppError::AuthError(anyhow::anyhow!("IAM token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "IAM token request rejected");
            return Err(AppError::AuthError(anyhow::anyhow!(
                "IAM token request failed with status: {}",
                status.as_u16()
            )));
        }

        let token: IamTokenResponse = response.json().await.map_err(|e| {
            AppError::AuthError(anyhow::anyhow!("Invalid IAM token response: {}", e))
        })?;

        token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::AuthError(anyhow::anyhow!("Failed to retrieve IAM access token")))
    }
}

/// Always returns the same token.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String, AppError> {
        Ok(self.token.clone())
    }
}
