use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use openshelf::clock::SystemClock;
use openshelf::config::Config;
use openshelf::engine::Engine;
use openshelf::scheduler::{IntervalScheduler, Scheduler};
use openshelf::seed::{self, Seed};
use openshelf::sweeper::Sweeper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    openshelf::observability::init(config.metrics_port);

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let engine = Arc::new(Engine::open(
        config.wal_path(),
        config.engine_settings(),
        Arc::new(SystemClock),
    )?);

    if let Some(path) = &config.seed_path {
        let seed = Seed::load(path)?;
        seed::import(&engine, &seed).await?;
    }

    for problem in engine.verify_invariants().await {
        tracing::error!(
            book_id = %problem.book_id,
            recorded = %problem.recorded,
            derived = %problem.derived,
            "book status disagrees with its ledger"
        );
    }

    info!("openshelf started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  hold_ttl: {}s", config.hold_ttl.as_secs());
    info!("  sweep_interval: {}s", config.sweep_interval.as_secs());
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let scheduler = IntervalScheduler::new();
    let sweeper = scheduler.on_tick(Arc::new(Sweeper::new(engine.clone())), config.sweep_interval);

    // Graceful shutdown on SIGTERM/ctrl-c: let the current sweep finish
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    info!("shutdown signal received, stopping sweeper");
    scheduler.shutdown();
    sweeper.await?;

    info!("openshelf stopped");
    Ok(())
}
