//! Time broker daemon: binds the configured listeners and dispatches
//! pipeline steps until interrupted.

use anyhow::Context;
use tracing::{error, info};

use time_broker::config::BrokerConfig;
use time_broker::core::AppResult;
use time_broker::runtime::{bind_from_config, TokioSpawner};
use time_broker::util::init_tracing;

fn main() -> AppResult<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cfg = BrokerConfig::from_env()
        .map_err(anyhow::Error::msg)
        .context("loading broker configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.worker_threads)
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    runtime.block_on(serve(cfg))
}

async fn serve(cfg: BrokerConfig) -> AppResult<()> {
    let broker = bind_from_config(&cfg, TokioSpawner::current()).await?;

    let dispatcher = broker.dispatcher().clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received shutdown signal"),
            Err(e) => error!(error = %e, "failed to listen for ctrl-c; shutting down"),
        }
        dispatcher.shutdown();
    });

    broker.serve().await?;
    info!("shutdown complete");
    Ok(())
}
