//! Application startup and lifecycle management.

use crate::config::MeteringConfig;
use crate::services::{
    get_metrics, init_metrics, BillingScheduler, Database, Escalator, IamTokenProvider,
    LogNotificationSender, MeteringClient, MonthlySchedule, NotificationSender, PgFailureQueue,
    PgInstanceStore, ReconciliationController, RetryPolicy, SmtpNotificationSender,
    SnsNotificationSender,
};
use axum::{
    extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get, Json,
    Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// State for health check endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub db: Arc<Database>,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "metering-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "metering-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Operational HTTP surface: health, readiness and metrics.
pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Pick the escalation channel: SMTP when enabled, otherwise the log.
pub fn notification_sender(config: &MeteringConfig) -> Result<Arc<dyn NotificationSender>, AppError> {
    if config.smtp.enabled {
        tracing::info!(host = %config.smtp.host, port = config.smtp.port, "Escalating billing failures by email");
        Ok(Arc::new(SmtpNotificationSender::new(&config.smtp)?))
    } else {
        tracing::info!("SMTP disabled - billing failures will be escalated to the log");
        Ok(Arc::new(LogNotificationSender))
    }
}

/// Pub-sub channel for admin test notifications, when a topic is configured.
pub async fn test_notification_channel(
    config: &MeteringConfig,
) -> Result<Option<Arc<dyn NotificationSender>>, AppError> {
    if config.sns.topic_arn.is_none() {
        return Ok(None);
    }
    let sender = SnsNotificationSender::from_config(&config.sns).await?;
    tracing::info!(topic = %sender.topic_arn(), "Test notifications will be published to SNS");
    Ok(Some(Arc::new(sender)))
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    db: Arc<Database>,
    controller: Arc<ReconciliationController>,
    scheduler: Arc<BillingScheduler>,
    billing_enabled: bool,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: MeteringConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: MeteringConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: MeteringConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);

        let submitter = MeteringClient::new(&config.metering)?;
        tracing::info!(
            usage_url = %submitter.usage_url(),
            page_size = config.metering.page_size,
            rejection_policy = %config.metering.rejection_policy,
            "Metering client configured"
        );

        let mut escalator =
            Escalator::new(notification_sender(&config)?, config.billing.product.clone());
        if let Some(channel) = test_notification_channel(&config).await? {
            escalator = escalator.with_test_channel(channel);
        }

        let controller = Arc::new(ReconciliationController::new(
            Arc::new(PgFailureQueue::new(db.pool().clone())),
            Arc::new(PgInstanceStore::new(db.pool().clone())),
            Arc::new(IamTokenProvider::new(&config.iam)),
            Arc::new(submitter),
            escalator,
            RetryPolicy::new(config.billing.max_attempts, config.billing.backoff),
        ));

        let scheduler = Arc::new(BillingScheduler::new(
            controller.clone(),
            MonthlySchedule,
        ));

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(http_port = port, "Metering service listener bound");

        Ok(Self {
            port,
            listener,
            db,
            controller,
            scheduler,
            billing_enabled: config.billing.enabled,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn controller(&self) -> Arc<ReconciliationController> {
        self.controller.clone()
    }

    pub fn scheduler(&self) -> Arc<BillingScheduler> {
        self.scheduler.clone()
    }

    /// Start the billing scheduler (if enabled) and serve until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        if self.billing_enabled {
            self.scheduler.start();
        } else {
            tracing::info!("Billing job disabled by configuration");
        }

        let app = router(HealthState {
            db: self.db.clone(),
        });

        tracing::info!(
            service = "metering-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, app).await.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
