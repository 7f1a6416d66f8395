//! Failure queue models.

use super::UsagePayload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A usage record that has not been accepted yet, before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageFailure {
    pub payload: UsagePayload,
    pub message: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl UsageFailure {
    pub fn new(payload: UsagePayload, message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            payload,
            message: message.into(),
            created_utc: now,
            updated_utc: now,
        }
    }
}

/// A persisted row of the failure queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct FailureRecord {
    pub id: i64,
    /// JSON-serialized [`UsagePayload`].
    pub payload: String,
    pub message: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl FailureRecord {
    pub fn usage_payload(&self) -> Result<UsagePayload, serde_json::Error> {
        UsagePayload::from_json(&self.payload)
    }

    /// Turn the row back into an outstanding failure, keeping its creation
    /// time.
    pub fn to_usage_failure(&self) -> Result<UsageFailure, serde_json::Error> {
        Ok(UsageFailure {
            payload: self.usage_payload()?,
            message: self.message.clone(),
            created_utc: self.created_utc,
            updated_utc: Utc::now(),
        })
    }
}

/// One page of the failure queue in ascending id order.
#[derive(Debug, Clone, Default)]
pub struct FailurePage {
    pub records: Vec<FailureRecord>,
    /// Cursor for the following page; `None` once the queue is exhausted.
    pub next_cursor: Option<i64>,
}
