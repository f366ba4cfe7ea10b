use std::sync::Arc;

use tracing::info;

use slotbook::booking::BookingService;
use slotbook::clock::{Clock, SystemClock};
use slotbook::config::Config;
use slotbook::directory::InMemoryDirectory;
use slotbook::engine::Engine;
use slotbook::idempotency::TokenGuard;
use slotbook::notify::{LogDispatcher, NotifyHub, ReminderDispatcher};
use slotbook::sweep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    slotbook::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.data_dir.join("slotbook.wal");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(
        Engine::new(wal_path.clone(), notify, clock)?.with_checkin_window(config.checkin_window),
    );
    let tokens = Arc::new(TokenGuard::new(config.token_ttl));
    let directory = Arc::new(InMemoryDirectory::new());
    let service = BookingService::new(engine.clone(), tokens.clone(), directory);

    info!("slotbook started");
    info!("  wal: {}", wal_path.display());
    info!("  schedules loaded: {}", service.engine().schedule_count());
    info!("  missed sweep at {}, reminders at {}", config.missed_sweep_at, config.reminder_at);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let dispatcher: Arc<dyn ReminderDispatcher> = Arc::new(LogDispatcher);
    let tasks = vec![
        tokio::spawn(sweep::run_missed_sweep(engine.clone(), config.missed_sweep_at)),
        tokio::spawn(sweep::run_reminder_sweep(engine.clone(), dispatcher, config.reminder_at)),
        tokio::spawn(sweep::run_token_sweep(tokens, config.token_sweep_every)),
        tokio::spawn(sweep::run_compactor(engine.clone(), config.compact_threshold)),
    ];

    // Graceful shutdown on SIGTERM/ctrl-c
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    info!("shutdown signal received, stopping sweeps");
    for task in tasks {
        task.abort();
    }

    match engine.compact_wal().await {
        Ok(()) => info!("WAL compacted"),
        Err(e) => tracing::warn!("final compaction failed: {e}"),
    }
    info!("slotbook stopped");
    Ok(())
}
