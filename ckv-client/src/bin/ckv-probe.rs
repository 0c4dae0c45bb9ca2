//! # Store Probe
//!
//! Waits for the configured store to come up, then prints its allow-listed
//! memory metrics as JSON. Configuration comes from `CKV_REDIS_*`; log level
//! from `RUST_LOG` (default `info`).

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use ckv_client::{Backoff, StoreClient, StoreConfig};

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = StoreConfig::from_env().context("reading store configuration")?;
    tracing::info!(url = %config.url().redacted(), "probing store");

    let client = StoreClient::connect_ready(&config, &Backoff::default()).context("waiting for store")?;
    let stats = client.memory_stats().context("reading memory stats")?;

    let report = serde_json::json!({
        "url": config.url().redacted(),
        "pool": {
            "idle": client.pool_stats().idle,
            "active": client.pool_stats().active,
        },
        "memory": stats,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
