//! Usage (metering) record model.

use serde::{Deserialize, Serialize};

/// Measure name used for the monthly per-instance record.
pub const INSTANCE_MEASURE: &str = "INSTANCE";

/// How a billing request was triggered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BillingContext {
    /// Manual triggers bill the current month; the scheduled job bills the
    /// previous one.
    pub manual_trigger: bool,
    /// Dry runs submit a zero quantity.
    pub dry_run: bool,
}

impl BillingContext {
    /// Context used by the scheduled monthly run.
    pub fn scheduled() -> Self {
        Self {
            manual_trigger: false,
            dry_run: false,
        }
    }

    /// Context used by admin and deprovision triggers.
    pub fn manual(dry_run: bool) -> Self {
        Self {
            manual_trigger: true,
            dry_run,
        }
    }
}

/// A single measure within a usage record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasuredUsage {
    pub measure: String,
    pub quantity: u64,
}

/// Usage record as accepted by the metering API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsagePayload {
    pub plan_id: String,
    pub resource_instance_id: String,
    /// Window start, epoch milliseconds.
    pub start: i64,
    /// Window end, epoch milliseconds.
    pub end: i64,
    pub region: String,
    pub measured_usage: Vec<MeasuredUsage>,
}

impl UsagePayload {
    /// Serialize to the JSON stored in the failure queue.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
