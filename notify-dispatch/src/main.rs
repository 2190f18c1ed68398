use std::time::Duration;

use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use notify_dispatch::channels::DispatcherRegistry;
use notify_dispatch::clock::SystemClock;
use notify_dispatch::config::DispatchConfig;
use notify_dispatch::dispatch::DispatchEngine;
use notify_dispatch::logging::init_logging;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Terminal records older than this are evicted.
const TERMINAL_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DispatchConfig::load()?;

    // Keep the guard alive so buffered log lines are flushed on exit.
    let (logging_config, _guard) = init_logging(&config.log_dir, config.log_filter.as_deref())?;
    let cancel_token = CancellationToken::new();
    logging_config.start_retention_cleanup(cancel_token.clone());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?config.masked(),
        "Starting notify-dispatch"
    );

    let dispatchers = DispatcherRegistry::from_config(&config.channels)?;
    info!(channels = ?dispatchers.channels(), "Channel dispatchers ready");

    let engine = DispatchEngine::builder(config.engine_config())
        .clock(SystemClock::shared())
        .dispatchers(dispatchers)
        .build();

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run_loop().await })
    };

    {
        let engine = engine.clone();
        let cancel_token = cancel_token.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PRUNE_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = interval.tick() => {
                        engine.prune_terminal(TERMINAL_RETENTION);
                    }
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let report = engine.shutdown(config.drain_timeout()).await;
    cancel_token.cancel();
    if let Err(e) = runner.await {
        error!(error = %e, "Dispatch loop task failed");
    }

    let stats = engine.stats();
    info!(
        cancelled = report.cancelled.len(),
        drained = report.drained,
        delivered = stats.totals.delivered,
        exhausted = stats.totals.exhausted,
        "notify-dispatch stopped"
    );

    Ok(())
}
