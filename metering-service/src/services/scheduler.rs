//! Monthly trigger for reconciliation runs.

use crate::services::payload::{Clock, SystemClock};
use crate::services::reconciliation::ReconciliationController;
use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Fires at 00:00 UTC on the first day of every month (`0 0 1 * *`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonthlySchedule;

impl MonthlySchedule {
    /// The first fire time strictly after `now`.
    pub fn next_fire_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let this_month = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
            .unwrap_or(now.date_naive())
            .and_hms_opt(0, 0, 0)
            .unwrap_or(now.naive_utc());
        let next = this_month
            .checked_add_months(Months::new(1))
            .unwrap_or(this_month);
        Utc.from_utc_datetime(&next)
    }
}

struct Running {
    shutdown: CancellationToken,
    timer: JoinHandle<()>,
}

pub struct BillingScheduler {
    controller: Arc<ReconciliationController>,
    schedule: MonthlySchedule,
    clock: Arc<dyn Clock>,
    running: Mutex<Option<Running>>,
}

impl BillingScheduler {
    pub fn new(controller: Arc<ReconciliationController>, schedule: MonthlySchedule) -> Self {
        Self {
            controller,
            schedule,
            clock: Arc::new(SystemClock),
            running: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Start the timer task. Returns false if it was already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return false;
        }

        let shutdown = CancellationToken::new();
        let timer = tokio::spawn(timer_loop(
            self.controller.clone(),
            self.schedule,
            self.clock.clone(),
            shutdown.clone(),
        ));

        *running = Some(Running { shutdown, timer });
        info!("Billing scheduler started");
        true
    }

    /// Cancel the timer and wait for it to exit. An in-flight run is left
    /// to finish. Returns false if the scheduler was not running.
    pub async fn stop(&self) -> bool {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(running) = running else {
            return false;
        };

        running.shutdown.cancel();
        if let Err(e) = running.timer.await {
            warn!(error = %e, "Billing scheduler timer ended abnormally");
        }
        info!("Billing scheduler stopped");
        true
    }
}

async fn timer_loop(
    controller: Arc<ReconciliationController>,
    schedule: MonthlySchedule,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
) {
    let mut next_fire = schedule.next_fire_after(clock.now());

    loop {
        let wait = (next_fire - clock.now()).to_std().unwrap_or(Duration::ZERO);
        info!(next_fire = %next_fire, "Next billing run scheduled");

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {
                let controller = controller.clone();
                tokio::spawn(async move {
                    if let Err(e) = controller.run_scheduled().await {
                        error!(error = %e, "Scheduled billing run failed");
                    }
                });
                next_fire = schedule.next_fire_after(next_fire);
            }
        }
    }
}
