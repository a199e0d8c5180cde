// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic progress reporting.
//!
//! Logs queue depth, completed work, smoothed throughput and, when the
//! campaign announced its size, an ETA.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::campaign::CampaignHandle;
use crate::state::CampaignStats;

/// Weight of the newest sample in the throughput average.
const RATE_SMOOTHING: f64 = 0.1;

/// Exponentially smoothed jobs-per-second estimate.
#[derive(Debug, Clone, Default)]
pub struct ThroughputEstimate {
    last: Option<(u64, Instant)>,
    rate: Option<f64>,
}

impl ThroughputEstimate {
    /// Feed the number of finished jobs observed at `now`; returns the
    /// updated rate once two samples exist.
    pub fn update(&mut self, finished: u64, now: Instant) -> Option<f64> {
        if let Some((prev, at)) = self.last {
            let elapsed = now.saturating_duration_since(at).as_secs_f64();
            if elapsed > 0.0 {
                let sample = finished.saturating_sub(prev) as f64 / elapsed;
                self.rate = Some(match self.rate {
                    Some(rate) => rate + RATE_SMOOTHING * (sample - rate),
                    None => sample,
                });
            }
        }
        self.last = Some((finished, now));
        self.rate
    }

    /// Current estimate in jobs per second.
    pub fn rate(&self) -> Option<f64> {
        self.rate
    }
}

/// Time left for `remaining` jobs at `rate` jobs per second.
pub fn eta(remaining: u64, rate: f64) -> Option<Duration> {
    if remaining == 0 {
        return Some(Duration::ZERO);
    }
    if !rate.is_finite() || rate <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(remaining as f64 / rate).ok()
}

/// `HH:MM:SS`, hours unbounded.
pub fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Background task logging campaign progress.
pub struct ProgressReporter<P> {
    campaign: CampaignHandle<P>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl<P> ProgressReporter<P> {
    /// Reporter for `campaign`, stopped through `shutdown`.
    pub fn new(campaign: CampaignHandle<P>, interval: Duration, shutdown: Arc<Notify>) -> Self {
        Self {
            campaign,
            interval,
            shutdown,
        }
    }

    /// Report every interval until the shutdown signal arrives.
    pub async fn run(&self) {
        debug!(interval_ms = self.interval.as_millis() as u64, "Progress reporter started");
        let mut estimate = ThroughputEstimate::default();

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => break,

                _ = tokio::time::sleep(self.interval) => {
                    let stats = self.campaign.stats();
                    let rate = estimate.update(finished(&stats), Instant::now());
                    self.report(&stats, rate);
                }
            }
        }

        debug!("Progress reporter stopped");
    }

    fn report(&self, stats: &CampaignStats, rate: Option<f64>) {
        let total = total(stats);
        let remaining = total.saturating_sub(finished(stats));
        let eta = rate
            .and_then(|r| eta(remaining, r))
            .map(format_eta)
            .unwrap_or_else(|| "--:--:--".to_string());

        info!(
            pending = stats.pending,
            in_flight = stats.in_flight,
            done = stats.done,
            failed = stats.failed,
            skipped = stats.skipped,
            total,
            minions = stats.active_minions,
            jobs_per_sec = rate.unwrap_or(0.0),
            %eta,
            "Campaign progress"
        );

        if let Some((id, minion, out_for)) = self.campaign.state().sample_in_flight() {
            debug!(
                workload_id = %id,
                %minion,
                out_for_ms = out_for.as_millis() as u64,
                "In flight"
            );
        }
    }
}

/// Jobs no longer needing a minion, counting skipped ones.
fn finished(stats: &CampaignStats) -> u64 {
    stats.done + stats.failed + stats.skipped
}

/// Announced campaign size, or what has been enqueued so far.
fn total(stats: &CampaignStats) -> u64 {
    if stats.announced_total > 0 {
        stats.announced_total
    } else {
        stats.total_enqueued + stats.skipped
    }
}
