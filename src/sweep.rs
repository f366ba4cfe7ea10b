use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::idempotency::TokenGuard;
use crate::notify::{Reminder, ReminderDispatcher};

/// Time from `now` until the next wall-clock `at`, strictly in the future.
pub fn until_next(now: NaiveDateTime, at: NaiveTime) -> Duration {
    let today = now.date().and_time(at);
    let next = if today > now {
        today
    } else {
        today + TimeDelta::days(1)
    };
    (next - now).to_std().unwrap_or_default()
}

/// Daily at `at`: everything still pending for today becomes missed.
pub async fn run_missed_sweep(engine: Arc<Engine>, at: NaiveTime) {
    loop {
        tokio::time::sleep(until_next(engine.clock().now(), at)).await;
        let today = engine.clock().today();
        let report = engine.mark_missed(today).await;
        if report.failed > 0 {
            warn!(
                "missed sweep for {today}: {} marked, {} failed, retrying next run",
                report.missed, report.failed
            );
        } else {
            info!(
                "missed sweep for {today}: {} marked across {} schedules",
                report.missed, report.schedules
            );
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReminderReport {
    pub sent: usize,
    pub failed: usize,
}

/// Hand every pending appointment on `date` to the dispatcher. Read only.
pub async fn send_reminders(
    engine: &Engine,
    dispatcher: &dyn ReminderDispatcher,
    date: NaiveDate,
) -> ReminderReport {
    let mut report = ReminderReport::default();
    for appointment in engine.pending_on(date).await {
        let reminder = Reminder::from(&appointment);
        match dispatcher.dispatch(&reminder).await {
            Ok(()) => report.sent += 1,
            Err(e) => {
                report.failed += 1;
                warn!("reminder for appointment {} failed: {e}", appointment.id);
            }
        }
    }
    metrics::counter!(crate::observability::REMINDERS_TOTAL, "status" => "sent").increment(report.sent as u64);
    metrics::counter!(crate::observability::REMINDERS_TOTAL, "status" => "failed").increment(report.failed as u64);
    report
}

/// Daily at `at`: remind everyone booked for tomorrow.
pub async fn run_reminder_sweep(engine: Arc<Engine>, dispatcher: Arc<dyn ReminderDispatcher>, at: NaiveTime) {
    loop {
        tokio::time::sleep(until_next(engine.clock().now(), at)).await;
        let Some(tomorrow) = engine.clock().today().succ_opt() else {
            continue;
        };
        let report = send_reminders(&engine, dispatcher.as_ref(), tomorrow).await;
        info!("reminders for {tomorrow}: {} sent, {} failed", report.sent, report.failed);
    }
}

/// Periodically drops expired idempotency markers.
pub async fn run_token_sweep(tokens: Arc<TokenGuard>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let evicted = tokens.evict_expired();
        if evicted > 0 {
            debug!("evicted {evicted} expired tokens");
        }
    }
}

/// Compacts the WAL once enough frames accumulate since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
