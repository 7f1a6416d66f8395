//! Service instance model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A provisioned broker instance. Owned by the provisioning flow; billing
/// only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ServiceInstance {
    pub instance_id: String,
    pub plan_id: String,
    pub region: String,
    pub created_utc: DateTime<Utc>,
}

impl ServiceInstance {
    pub fn new(
        instance_id: impl Into<String>,
        plan_id: impl Into<String>,
        region: impl Into<String>,
        created_utc: DateTime<Utc>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            plan_id: plan_id.into(),
            region: region.into(),
            created_utc,
        }
    }
}
