use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking attempts. Labels: outcome.
pub const BOOKINGS_TOTAL: &str = "slotbook_bookings_total";

/// Histogram: booking latency in seconds, token check to commit.
pub const BOOKING_DURATION_SECONDS: &str = "slotbook_booking_duration_seconds";

/// Counter: appointments cancelled by patients.
pub const CANCELLATIONS_TOTAL: &str = "slotbook_cancellations_total";

/// Counter: successful check-ins.
pub const CHECKINS_TOTAL: &str = "slotbook_checkins_total";

/// Counter: appointments moved to missed by the daily sweep.
pub const MISSED_TOTAL: &str = "slotbook_missed_total";

/// Counter: reminders handed to the dispatcher. Labels: status.
pub const REMINDERS_TOTAL: &str = "slotbook_reminders_total";

/// Counter: idempotency tokens issued.
pub const TOKENS_ISSUED_TOTAL: &str = "slotbook_tokens_issued_total";

/// Counter: idempotency tokens rejected (unknown, consumed, or expired).
pub const TOKENS_REJECTED_TOTAL: &str = "slotbook_tokens_rejected_total";

/// Counter: reservations refused because the schedule was full.
pub const CAPACITY_EXHAUSTED_TOTAL: &str = "slotbook_capacity_exhausted_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: live schedules held in memory.
pub const SCHEDULES_ACTIVE: &str = "slotbook_schedules_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (frames per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
