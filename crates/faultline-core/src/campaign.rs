// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Campaign manager.
//!
//! A [`CampaignManager`] owns the pending queue and in-flight registry for one
//! run. The campaign definition fills the queue through a [`CampaignHandle`]
//! while minions are already being served, and [`CampaignManager::run`]
//! returns once every job has settled. Results can be consumed as they
//! arrive through [`CampaignHandle::next_result`].
//!
//! # Example
//!
//! ```rust,ignore
//! use faultline_core::{CampaignManager, CoordinatorConfig, Json};
//!
//! let experiments: Vec<Json<BitFlip>> = plan_experiments();
//! let outcome = CampaignManager::new(CoordinatorConfig::from_env()?)
//!     .run(experiments)
//!     .await?;
//! assert!(outcome.is_success());
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use faultline_protocol::FramedServer;
use tokio::net::TcpStream;
use tokio::sync::{Notify, watch};
use tracing::{error, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::CampaignError;
use crate::job::{JobState, WorkloadId};
use crate::minion::MinionSession;
use crate::payload::Serializable;
use crate::progress::ProgressReporter;
use crate::state::{CampaignState, CampaignStats};

/// A research run's job generator.
///
/// `populate` may add jobs incrementally; minions start consuming as soon as
/// the first job is queued. Filling is declared finished automatically when
/// `populate` returns successfully.
#[async_trait]
pub trait Campaign<P: Serializable>: Send + 'static {
    /// Add this campaign's jobs through `handle`.
    async fn populate(&mut self, handle: &CampaignHandle<P>) -> anyhow::Result<()>;
}

#[async_trait]
impl<P: Serializable> Campaign<P> for Vec<P> {
    async fn populate(&mut self, handle: &CampaignHandle<P>) -> anyhow::Result<()> {
        handle.set_total_count(self.len() as u64);
        for data in self.drain(..) {
            handle.add_job(data)?;
        }
        Ok(())
    }
}

/// Cloneable access to a running campaign.
pub struct CampaignHandle<P> {
    state: Arc<CampaignState<P>>,
}

impl<P> Clone for CampaignHandle<P> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<P> std::fmt::Debug for CampaignHandle<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CampaignHandle")
            .field("build_id", &self.state.build_id())
            .finish_non_exhaustive()
    }
}

impl<P> CampaignHandle<P> {
    pub(crate) fn state(&self) -> &CampaignState<P> {
        &self.state
    }

    /// Enqueue one experiment and return the workload id it was given.
    pub fn add_job(&self, data: P) -> Result<WorkloadId, CampaignError> {
        self.state.add_job(data)
    }

    /// Declare that no more jobs will be added.
    ///
    /// Minions asking for work after the queue drains are told to exit.
    pub fn finish_filling(&self) {
        self.state.finish_filling();
    }

    /// Whether filling has been declared finished.
    pub fn is_filling_finished(&self) -> bool {
        self.state.is_filling_finished()
    }

    /// Announce the campaign size for progress reporting.
    pub fn set_total_count(&self, total: u64) {
        self.state.set_total_count(total);
    }

    /// Count `count` jobs as done without running them (for progress only).
    pub fn skip_jobs(&self, count: u64) {
        self.state.skip_jobs(count);
    }

    /// Build id minions must present.
    pub fn build_id(&self) -> u64 {
        self.state.build_id()
    }

    /// Lifecycle position of a workload, `None` if the id was never issued.
    pub fn job_state(&self, id: WorkloadId) -> Option<JobState> {
        self.state.state_of(id)
    }

    /// Current counters.
    pub fn stats(&self) -> CampaignStats {
        self.state.stats()
    }

    /// Whether every job has settled and filling is finished.
    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    /// Wait until the campaign is complete.
    pub async fn wait_complete(&self) {
        let mut complete = self.state.subscribe_complete();
        // The sender lives in the state this handle keeps alive.
        let _ = complete.wait_for(|done| *done).await;
    }

    /// Wait for the next committed result.
    ///
    /// Returns `None` once the campaign is complete (or its run stopped) and
    /// every result has been taken. A workload that produced more than one
    /// result is yielded again; the later value supersedes the earlier one.
    /// Results taken here are not repeated in [`CampaignOutcome::results`].
    pub async fn next_result(&self) -> Option<(WorkloadId, P)> {
        self.state.next_result().await
    }
}

/// Result of a finished campaign.
#[derive(Debug)]
pub struct CampaignOutcome<P> {
    /// Result per workload not already taken through
    /// [`CampaignHandle::next_result`]. When a job ran more than once, the
    /// last result received is the one kept.
    pub results: BTreeMap<WorkloadId, P>,
    /// Workloads given up on.
    pub failed: Vec<WorkloadId>,
    /// Counters at completion.
    pub stats: CampaignStats,
}

impl<P> CampaignOutcome<P> {
    /// True when every enqueued job reached `Done`.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.stats.done == self.stats.total_enqueued
    }
}

/// Coordinator for one campaign.
pub struct CampaignManager<P> {
    config: CoordinatorConfig,
    handle: CampaignHandle<P>,
}

impl<P: Serializable> CampaignManager<P> {
    /// Create a manager with fresh, empty state.
    pub fn new(config: CoordinatorConfig) -> Self {
        let state = Arc::new(CampaignState::new(&config));
        Self {
            config,
            handle: CampaignHandle { state },
        }
    }

    /// Handle for adding jobs and reading progress.
    pub fn handle(&self) -> CampaignHandle<P> {
        self.handle.clone()
    }

    /// Get the configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Bind the configured listener and run `campaign` to completion.
    pub async fn run<C: Campaign<P>>(
        self,
        campaign: C,
    ) -> Result<CampaignOutcome<P>, CampaignError> {
        let server = FramedServer::bind(self.config.server.clone())?;
        self.run_on(server, campaign).await
    }

    /// Run `campaign` to completion, serving minions on `server`.
    ///
    /// There is no timeout: a campaign whose jobs never get a minion simply
    /// never completes.
    pub async fn run_on<C: Campaign<P>>(
        self,
        server: FramedServer,
        mut campaign: C,
    ) -> Result<CampaignOutcome<P>, CampaignError> {
        let addr = server.local_addr()?;
        info!(
            %addr,
            build_id = self.handle.build_id(),
            max_attempts = self.config.max_attempts,
            "Campaign starting"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sessions = self.handle.clone();
        let server_task = tokio::spawn(async move {
            server
                .run_until(
                    move |stream, peer| {
                        let campaign = sessions.clone();
                        async move {
                            let session: MinionSession<P, TcpStream> =
                                MinionSession::from_framed(campaign, stream, peer.to_string());
                            // Errors are logged by the session.
                            let _ = session.run().await;
                        }
                    },
                    shutdown_rx,
                )
                .await
        });

        let progress_stop = Arc::new(Notify::new());
        let progress_task = if self.config.progress_interval.is_zero() {
            None
        } else {
            let reporter = ProgressReporter::new(
                self.handle.clone(),
                self.config.progress_interval,
                progress_stop.clone(),
            );
            Some(tokio::spawn(async move { reporter.run().await }))
        };

        let filler = self.handle.clone();
        let mut populate = tokio::spawn(async move {
            let result = campaign.populate(&filler).await;
            if result.is_ok() {
                filler.finish_filling();
            }
            result
        });

        let mut populated = false;
        let run_result = loop {
            tokio::select! {
                joined = &mut populate, if !populated => {
                    populated = true;
                    let failure = match joined {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(e),
                        Err(e) => Some(anyhow::Error::new(e)),
                    };
                    if let Some(e) = failure {
                        error!(error = %e, "Campaign population failed");
                        break Err(CampaignError::Populate(e));
                    }
                }
                _ = self.handle.wait_complete() => break Ok(()),
            }
        };

        // Stop accepting. Sessions still connected get DIE on their next
        // request once the queue is finished.
        if run_result.is_err() {
            self.handle.finish_filling();
        }
        let _ = shutdown_tx.send(true);
        match server_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Server stopped with error"),
            Err(e) => warn!(error = %e, "Server task panicked"),
        }
        progress_stop.notify_one();
        if let Some(task) = progress_task {
            let _ = task.await;
        }
        // Release result consumers even when the run failed early.
        self.handle.state().close_results();

        run_result?;

        let stats = self.handle.stats();
        let (results, failed) = self.handle.state().take_settled();
        info!(
            done = stats.done,
            failed = failed.len(),
            requeued = stats.requeued,
            redundant = stats.redundant_results,
            "Campaign finished"
        );

        Ok(CampaignOutcome {
            results,
            failed,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Json;

    fn manager() -> CampaignManager<Json<u32>> {
        CampaignManager::new(CoordinatorConfig {
            build_id: 11,
            progress_interval: std::time::Duration::ZERO,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_vec_campaign_populates_in_order() {
        let manager = manager();
        let handle = manager.handle();

        let mut jobs = vec![Json(10), Json(20), Json(30)];
        jobs.populate(&handle).await.unwrap();

        assert!(jobs.is_empty());
        let stats = handle.stats();
        assert_eq!(stats.total_enqueued, 3);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.announced_total, 3);
        assert_eq!(handle.job_state(WorkloadId::new(3)), Some(JobState::Pending));
    }

    #[tokio::test]
    async fn test_handle_clones_share_state() {
        let manager = manager();
        let a = manager.handle();
        let b = a.clone();

        a.add_job(Json(1)).unwrap();
        b.skip_jobs(5);
        assert_eq!(b.stats().total_enqueued, 1);
        assert_eq!(a.stats().skipped, 5);
        assert_eq!(a.build_id(), 11);
        assert!(format!("{:?}", a).contains("build_id"));
    }

    #[tokio::test]
    async fn test_results_stream_until_complete() {
        let manager = manager();
        let handle = manager.handle();
        let state = handle.state();

        let first = handle.add_job(Json(1)).unwrap();
        let second = handle.add_job(Json(2)).unwrap();
        for _ in 0..2 {
            let job = state.next_job().await.unwrap();
            state.dispatch(job, "minion-a").unwrap();
        }

        state.commit(first, Json(10));
        assert_eq!(handle.next_result().await, Some((first, Json(10))));

        let consumer = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.next_result().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        state.commit(second, Json(20));
        assert_eq!(consumer.await.unwrap(), Some((second, Json(20))));

        // Filling is still open, so the stream stays open too.
        let waiting = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.next_result().await })
        };
        handle.finish_filling();
        assert_eq!(waiting.await.unwrap(), None);

        let (results, failed) = state.take_settled();
        assert!(results.is_empty());
        assert!(failed.is_empty());
        assert_eq!(handle.stats().done, 2);
    }

    #[test]
    fn test_outcome_success() {
        // Results streamed out during the run still count as done.
        let outcome = CampaignOutcome::<&str> {
            results: BTreeMap::new(),
            failed: Vec::new(),
            stats: CampaignStats {
                total_enqueued: 1,
                done: 1,
                ..Default::default()
            },
        };
        assert!(outcome.is_success());

        let outcome = CampaignOutcome::<&str> {
            results: BTreeMap::new(),
            failed: vec![WorkloadId::new(1)],
            stats: CampaignStats {
                total_enqueued: 1,
                failed: 1,
                ..Default::default()
            },
        };
        assert!(!outcome.is_success());
    }
}
