//!   coverage-rs:   radio coverage aggregation engine
//!
//!  Turns a stream of station observations into per-cell coverage statistics
//!  kept in current, day, month and year accumulators.
//!

mod cache;
mod clock;
mod config;
mod engine;
mod error;
mod key;
mod meta;
mod network;
mod record;
mod rollup;
mod stations;
mod store;

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::Config;
use crate::engine::Engine;
use crate::error::Error;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_args();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    info!("coverage-rs starting...");
    info!("Configuration: {:?}", config);

    let cancel = CancellationToken::new();
    let engine = Arc::new(Engine::open(&config, cancel.clone())?);

    // Start the runtime
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        // Buckets left behind by a previous run
        match engine.rollover().await {
            Ok(stats) => info!("Startup rollover done, {} source cells", stats.source),
            Err(Error::Cancelled) => {}
            Err(e) => error!("Startup rollover failed: {}", e),
        }

        let net_handle = if config.net {
            let engine = Arc::clone(&engine);
            let cfg = config.clone();
            let cancel = cancel.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = network::run_servers(cfg, engine, cancel).await {
                    error!("Network error: {}", e);
                }
            }))
        } else {
            None
        };

        // Periodic flush of the write-behind cache
        let flush_handle = {
            let engine = Arc::clone(&engine);
            let cancel = cancel.clone();
            let period = config.flush_interval();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            engine.flush(false).await;
                        }
                    }
                }
            })
        };

        // Rollover at every bucket boundary
        let rollover_handle = {
            let engine = Arc::clone(&engine);
            let cancel = cancel.clone();
            let clock = clock::AccumulatorClock::new(config.rollup_period());
            tokio::spawn(async move {
                loop {
                    let wait = clock.until_next_boundary(Utc::now());
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {
                            match engine.rollover().await {
                                Ok(_) | Err(Error::Cancelled) => {}
                                Err(e) => error!("Rollover failed: {}", e),
                            }
                        }
                    }
                }
            })
        };

        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down");
        cancel.cancel();

        if let Some(h) = net_handle {
            h.await.ok();
        }
        flush_handle.await.ok();
        rollover_handle.await.ok();
        engine.shutdown().await;
    });

    Ok(())
}
