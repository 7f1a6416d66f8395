//! Services module for metering-service.

pub mod database;
pub mod instances;
pub mod metering;
pub mod metrics;
pub mod notification;
pub mod payload;
pub mod queue;
pub mod reconciliation;
pub mod retry;
pub mod scheduler;
pub mod token;

pub use database::Database;
pub use instances::{InMemoryInstanceStore, InstanceStore, PgInstanceStore};
pub use metering::{MeteringClient, RejectionPolicy, UsageSubmitter};
pub use metrics::{get_metrics, init_metrics};
pub use notification::{
    Escalator, LogNotificationSender, NotificationSender, NotificationSummary,
    SmtpNotificationSender, SnsNotificationSender,
};
pub use payload::{build_usage_payload, Clock, FixedClock, SystemClock};
pub use queue::{FailurePages, FailureQueue, InMemoryFailureQueue, PgFailureQueue};
pub use reconciliation::{ReconciliationController, RunOutcome};
pub use retry::RetryPolicy;
pub use scheduler::{BillingScheduler, MonthlySchedule};
pub use token::{IamTokenProvider, StaticTokenProvider, TokenProvider};
