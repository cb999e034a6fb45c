use std::sync::Arc;
use std::time::Duration;

use mia_core::config::MiaConfig;
use mia_scheduler::{
    action_fn, Details, MemoryTaskLog, SchedulerHandle, SchedulerSettings, TracingErrorSink,
};
use tracing::{info, warn};

const HEARTBEAT_TASK: &str = "heartbeat";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // config first so its log filter can serve as the RUST_LOG fallback
    let config_path = std::env::var("MIA_CONFIG").ok();
    let config = MiaConfig::load(config_path.as_deref());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                let filter = config
                    .as_ref()
                    .map(|c| c.logging.filter.clone())
                    .unwrap_or_else(|_| mia_core::config::DEFAULT_LOG_FILTER.to_string());
                filter.into()
            }),
        )
        .init();

    let config = config.unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        MiaConfig::default()
    });

    let scheduler = build_scheduler(&config)?;
    if config.self_optimization.enabled {
        warn!("self-optimization enabled but no learning backend is attached to the daemon; skipping");
    }

    let running = scheduler.start();
    info!(
        tick_secs = config.scheduler.tick_secs,
        "mia scheduler running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    running.shutdown().await;

    let listing = scheduler.list_tasks()?;
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

/// Build the scheduler handle and register the configured built-in tasks.
fn build_scheduler(config: &MiaConfig) -> anyhow::Result<SchedulerHandle> {
    let settings = SchedulerSettings::from(&config.scheduler);
    let scheduler = SchedulerHandle::new(
        settings,
        Arc::new(TracingErrorSink::new()),
        Arc::new(MemoryTaskLog::new()),
    );

    if let Some(secs) = config.scheduler.heartbeat_secs {
        let heartbeat = action_fn(|ctx| async move {
            info!(at = %ctx.fired_at, "heartbeat");
            Ok(())
        });
        scheduler.add_periodic_task(HEARTBEAT_TASK, Duration::from_secs(secs), heartbeat, Details::new())?;
    }

    Ok(scheduler)
}
