//! Read-only access to provisioned service instances.

use crate::models::ServiceInstance;
use crate::services::metrics::DB_QUERY_DURATION;
use async_trait::async_trait;
use service_core::error::AppError;
use sqlx::postgres::PgPool;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::instrument;

#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Every instance that should be billed by the monthly run.
    async fn list_active_instances(&self) -> Result<Vec<ServiceInstance>, AppError>;

    async fn get_instance(&self, instance_id: &str) -> Result<Option<ServiceInstance>, AppError>;
}

/// Instances read from the provisioning `service_instance` table.
///
/// `create_date` is stored without a zone and interpreted as UTC.
#[derive(Clone)]
pub struct PgInstanceStore {
    pool: PgPool,
}

impl PgInstanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstanceStore for PgInstanceStore {
    #[instrument(skip(self))]
    async fn list_active_instances(&self) -> Result<Vec<ServiceInstance>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_active_instances"])
            .start_timer();

        let instances = sqlx::query_as::<_, ServiceInstance>(
            r#"
            SELECT instance_id,
                   COALESCE(plan_id, '') AS plan_id,
                   COALESCE(region, '') AS region,
                   create_date AT TIME ZONE 'UTC' AS created_utc
            FROM service_instance
            WHERE enabled = TRUE
            ORDER BY instance_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list service instances: {}", e))
        })?;

        timer.observe_duration();
        Ok(instances)
    }

    #[instrument(skip(self))]
    async fn get_instance(&self, instance_id: &str) -> Result<Option<ServiceInstance>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_instance"])
            .start_timer();

        let instance = sqlx::query_as::<_, ServiceInstance>(
            r#"
            SELECT instance_id,
                   COALESCE(plan_id, '') AS plan_id,
                   COALESCE(region, '') AS region,
                   create_date AT TIME ZONE 'UTC' AS created_utc
            FROM service_instance
            WHERE instance_id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get service instance: {}", e))
        })?;

        timer.observe_duration();
        Ok(instance)
    }
}

/// Instance store backed by a map; every stored instance counts as active.
#[derive(Default)]
pub struct InMemoryInstanceStore {
    instances: RwLock<BTreeMap<String, ServiceInstance>>,
}

impl InMemoryInstanceStore {
    pub fn new(instances: impl IntoIterator<Item = ServiceInstance>) -> Self {
        Self {
            instances: RwLock::new(
                instances
                    .into_iter()
                    .map(|i| (i.instance_id.clone(), i))
                    .collect(),
            ),
        }
    }

    pub async fn insert(&self, instance: ServiceInstance) {
        self.instances
            .write()
            .await
            .insert(instance.instance_id.clone(), instance);
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn list_active_instances(&self) -> Result<Vec<ServiceInstance>, AppError> {
        Ok(self.instances.read().await.values().cloned().collect())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<ServiceInstance>, AppError> {
        Ok(self.instances.read().await.get(instance_id).cloned())
    }
}
