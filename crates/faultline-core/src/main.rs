// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Faultline Coordinator
//!
//! Serves a synthetic bit-flip campaign to whatever minions connect. Useful
//! for smoke-testing a minion fleet against a real coordinator.
//!
//! `FAULTLINE_DEMO_JOBS` sets the campaign size (default 1000).

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{error, info, warn};

use faultline_core::{CampaignManager, CoordinatorConfig, Json};

/// Synthetic experiments: flip one bit of one register after some cycles.
///
/// Minions answer with any JSON value, so experiments and reports share the
/// untyped representation.
fn demo_campaign(size: u64) -> Vec<Json<Value>> {
    (0..size)
        .map(|n| {
            Json(json!({
                "register": n % 16,
                "bit": (n / 16) % 32,
                "cycle": n * 1000,
            }))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("faultline_core=info".parse()?),
        )
        .init();

    info!("Starting Faultline Coordinator");

    let config = CoordinatorConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    let size: u64 = std::env::var("FAULTLINE_DEMO_JOBS")
        .unwrap_or_else(|_| "1000".to_string())
        .parse()
        .context("FAULTLINE_DEMO_JOBS must be a non-negative integer")?;

    info!(
        addr = %config.server.bind_addr,
        build_id = config.build_id,
        jobs = size,
        "Configuration loaded"
    );

    let manager = CampaignManager::new(config);
    let campaign = demo_campaign(size);

    tokio::select! {
        outcome = manager.run(campaign) => {
            let outcome = outcome?;
            info!(
                done = outcome.results.len(),
                failed = outcome.failed.len(),
                requeued = outcome.stats.requeued,
                "Campaign finished"
            );
            if !outcome.is_success() {
                warn!(failed = ?outcome.failed, "Some experiments never produced a result");
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down...");
        }
    }

    info!("Shutdown complete");
    Ok(())
}
