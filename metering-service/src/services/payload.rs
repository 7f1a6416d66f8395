//! Metering payload construction and billing window arithmetic.

use crate::models::{BillingContext, MeasuredUsage, ServiceInstance, UsagePayload, INSTANCE_MEASURE};
use chrono::{DateTime, Datelike, Duration, Months, NaiveTime, Utc};

/// Hours added to the creation time when a window would start before the
/// instance existed.
pub const CREATION_BUFFER_HOURS: i64 = 2;

/// Source of the reference time for billing windows.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock in UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a single instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Start of the billing window for `created_utc` as seen at `now`.
///
/// Manual triggers bill from the first of the current month, the scheduled
/// job from the first of the previous month. The result never precedes the
/// instance's creation: such windows are moved to creation plus
/// [`CREATION_BUFFER_HOURS`].
pub fn billing_window_start(
    created_utc: DateTime<Utc>,
    ctx: BillingContext,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let today = now.date_naive();
    let mut month_start = today.with_day(1).unwrap_or(today);

    if !ctx.manual_trigger {
        month_start = month_start
            .checked_sub_months(Months::new(1))
            .unwrap_or(month_start);
    }

    let start = month_start.and_time(NaiveTime::MIN).and_utc();
    if start < created_utc {
        created_utc + Duration::hours(CREATION_BUFFER_HOURS)
    } else {
        start
    }
}

/// Build the monthly usage record for an instance.
pub fn build_usage_payload(
    instance: &ServiceInstance,
    ctx: BillingContext,
    now: DateTime<Utc>,
) -> UsagePayload {
    let start = billing_window_start(instance.created_utc, ctx, now).timestamp_millis();
    let quantity = if ctx.dry_run { 0 } else { 1 };

    UsagePayload {
        plan_id: instance.plan_id.clone(),
        resource_instance_id: instance.instance_id.clone(),
        start,
        end: start,
        region: instance.region.clone(),
        measured_usage: vec![MeasuredUsage {
            measure: INSTANCE_MEASURE.to_string(),
            quantity,
        }],
    }
}
