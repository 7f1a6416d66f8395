//! Domain models for metering-service.

mod failure;
mod instance;
mod usage;

pub use failure::{FailurePage, FailureRecord, UsageFailure};
pub use instance::ServiceInstance;
pub use usage::{BillingContext, MeasuredUsage, UsagePayload, INSTANCE_MEASURE};
