// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared bookkeeping for one campaign run.
//!
//! A job is owned by exactly one place at a time: the pending queue, the
//! in-flight registry, or the done/failed collections. The `outstanding`
//! count covers jobs that have been added but not yet settled, which includes
//! the short stretch where a session holds a job between dequeue and
//! registry insert. Completion is declared only when that count is zero and
//! filling has finished.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::counter::SynchronizedCounter;
use crate::error::{CampaignError, SessionError};
use crate::job::{InFlight, Job, JobState, WorkloadId};
use crate::payload::ExperimentData;
use crate::queue::PendingQueue;
use crate::registry::InFlightRegistry;

/// Metrics counters. Informational only.
#[derive(Debug, Default)]
pub struct CampaignMetrics {
    /// Sessions currently connected.
    pub active_minions: SynchronizedCounter,
    /// Jobs handed to a minion, redispatches included.
    pub dispatched: SynchronizedCounter,
    /// Results that arrived for a job that was already settled.
    pub redundant_results: SynchronizedCounter,
}

/// Point-in-time view of a campaign.
///
/// Fields are read one after another, so the view is only exact when no
/// session is mid-transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CampaignStats {
    /// Workload ids issued so far.
    pub total_enqueued: u64,
    /// Jobs waiting in the queue.
    pub pending: u64,
    /// Jobs assigned to a minion.
    pub in_flight: u64,
    /// Jobs with a committed result.
    pub done: u64,
    /// Jobs given up on.
    pub failed: u64,
    /// Jobs sent back to the head of the queue.
    pub requeued: u64,
    /// Pushes onto the pending queue, requeues included.
    pub queue_pushes: u64,
    /// Jobs taken off the pending queue by a session.
    pub queue_pops: u64,
    /// Results for jobs that were already settled.
    pub redundant_results: u64,
    /// Dispatches, redispatches included.
    pub dispatched: u64,
    /// Connected minions.
    pub active_minions: u64,
    /// Jobs the campaign skipped (counted as done for progress).
    pub skipped: u64,
    /// Campaign size announced up front (0 when unknown).
    pub announced_total: u64,
}

impl CampaignStats {
    /// Jobs accounted for by some container.
    pub fn accounted(&self) -> u64 {
        self.pending + self.in_flight + self.done + self.failed
    }

    /// Every push onto the queue is either still queued or was taken.
    pub fn queue_balanced(&self) -> bool {
        self.queue_pushes == self.queue_pops + self.pending
    }
}

/// What happened to a returned result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    /// First result for the job; the job is now done.
    Accepted,
    /// The job was already settled or is tracked elsewhere.
    Redundant,
}

/// State shared between the campaign manager, its handle and every session.
#[derive(Debug)]
pub struct CampaignState<P> {
    build_id: u64,
    max_attempts: u32,
    pending: PendingQueue<Job<P>>,
    in_flight: InFlightRegistry<InFlight<P>>,
    done: Mutex<BTreeSet<WorkloadId>>,
    /// Committed results not yet taken by a consumer.
    results: PendingQueue<(WorkloadId, P)>,
    failed: Mutex<BTreeSet<WorkloadId>>,
    next_id: AtomicU32,
    outstanding: AtomicU64,
    filling_finished: Mutex<bool>,
    announced_total: AtomicU64,
    skipped: AtomicU64,
    metrics: CampaignMetrics,
    complete: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<P> CampaignState<P> {
    pub(crate) fn new(config: &CoordinatorConfig) -> Self {
        let (complete, _) = watch::channel(false);
        Self {
            build_id: config.build_id,
            max_attempts: config.max_attempts,
            pending: PendingQueue::new(),
            in_flight: InFlightRegistry::new(config.pick_window),
            done: Mutex::new(BTreeSet::new()),
            results: PendingQueue::new(),
            failed: Mutex::new(BTreeSet::new()),
            next_id: AtomicU32::new(1),
            outstanding: AtomicU64::new(0),
            filling_finished: Mutex::new(false),
            announced_total: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            metrics: CampaignMetrics::default(),
            complete,
        }
    }

    pub(crate) fn build_id(&self) -> u64 {
        self.build_id
    }

    pub(crate) fn metrics(&self) -> &CampaignMetrics {
        &self.metrics
    }

    pub(crate) fn add_job(&self, data: P) -> Result<WorkloadId, CampaignError> {
        let filling_finished = lock(&self.filling_finished);
        if *filling_finished {
            return Err(CampaignError::FillingFinished);
        }
        let raw = self
            .next_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_add(1))
            .map_err(|_| CampaignError::WorkloadIdsExhausted)?;
        let id = WorkloadId::new(raw);
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        // Enqueue under the filling lock so a concurrent finish cannot close
        // the queue between allocation and push.
        self.pending.enqueue(Job::new(ExperimentData::new(id, data)));
        drop(filling_finished);
        Ok(id)
    }

    pub(crate) fn finish_filling(&self) {
        {
            let mut filling_finished = lock(&self.filling_finished);
            if *filling_finished {
                return;
            }
            *filling_finished = true;
        }
        self.pending.finish();
        info!(
            total = self.total_enqueued(),
            "Campaign filling finished"
        );
        if self.outstanding.load(Ordering::SeqCst) == 0 {
            self.mark_complete();
        }
    }

    pub(crate) fn is_filling_finished(&self) -> bool {
        *lock(&self.filling_finished)
    }

    pub(crate) fn set_total_count(&self, total: u64) {
        self.announced_total.store(total, Ordering::Relaxed);
    }

    pub(crate) fn skip_jobs(&self, count: u64) {
        self.skipped.fetch_add(count, Ordering::Relaxed);
    }

    /// Wait for the next job; `None` once the campaign has no more work.
    pub(crate) async fn next_job(&self) -> Option<Job<P>> {
        self.pending.dequeue_blocking().await
    }

    /// Move a dequeued job into the in-flight registry.
    pub(crate) fn dispatch(&self, job: Job<P>, minion: &str) -> Result<(), SessionError> {
        let id = job.workload_id();
        let entry = InFlight {
            job,
            minion: minion.to_string(),
            dispatched_at: Instant::now(),
        };
        self.in_flight
            .insert(id, entry)
            .map_err(|_| SessionError::DuplicateDispatch(id))?;
        self.metrics.dispatched.increment();
        Ok(())
    }

    /// Record a result for `id`. The last result received for a workload
    /// is the one kept.
    pub(crate) fn commit(&self, id: WorkloadId, result: P) -> Commit {
        let tracked = self.in_flight.remove(id).is_some();
        let mut done = lock(&self.done);
        let already_done = done.contains(&id);

        if already_done {
            // Streamed after the first one; consumers see it as a newer value.
            self.results.enqueue((id, result));
        } else if tracked {
            done.insert(id);
            // Queued before settling so the stream is never finished ahead
            // of its last result.
            self.results.enqueue((id, result));
            drop(done);
            self.settle();
            return Commit::Accepted;
        }

        self.metrics.redundant_results.increment();
        warn!(workload_id = %id, already_done, "Redundant result");
        Commit::Redundant
    }

    /// Take `id` back from the registry after its dispatch went wrong.
    ///
    /// The job returns to the head of the queue, or is marked failed once
    /// it has used up its attempts.
    pub(crate) fn lose(&self, id: WorkloadId, reason: &SessionError) -> Option<JobState> {
        let InFlight { mut job, minion, .. } = self.in_flight.remove(id)?;
        job.attempts += 1;

        if self.max_attempts > 0 && job.attempts >= self.max_attempts {
            warn!(
                workload_id = %id,
                %minion,
                attempts = job.attempts,
                error = %reason,
                "Job exhausted its attempts"
            );
            self.fail(id);
            return Some(JobState::Failed);
        }

        debug!(
            workload_id = %id,
            %minion,
            attempts = job.attempts,
            error = %reason,
            "Requeueing job"
        );
        self.pending.requeue(job);
        Some(JobState::Pending)
    }

    /// Take `id` back after its dispatch never reached the minion.
    ///
    /// The minion never saw the job, so this does not count as an attempt.
    pub(crate) fn requeue_undelivered(&self, id: WorkloadId, reason: &SessionError) -> bool {
        let Some(InFlight { job, minion, .. }) = self.in_flight.remove(id) else {
            return false;
        };
        debug!(
            workload_id = %id,
            %minion,
            attempts = job.attempts,
            error = %reason,
            "Requeueing undelivered job"
        );
        self.pending.requeue(job);
        true
    }

    /// Settle `id` as failed. The job must not be in any container.
    pub(crate) fn fail(&self, id: WorkloadId) {
        if lock(&self.failed).insert(id) {
            self.settle();
        }
    }

    fn settle(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 && self.is_filling_finished() {
            self.mark_complete();
        }
    }

    fn mark_complete(&self) {
        if !self.complete.send_replace(true) {
            self.results.finish();
            info!(
                done = lock(&self.done).len(),
                failed = lock(&self.failed).len(),
                "Campaign complete"
            );
        }
    }

    pub(crate) fn subscribe_complete(&self) -> watch::Receiver<bool> {
        self.complete.subscribe()
    }

    pub(crate) fn is_complete(&self) -> bool {
        *self.complete.borrow()
    }

    /// Wait for the next committed result; `None` once the result stream is
    /// closed and drained.
    pub(crate) async fn next_result(&self) -> Option<(WorkloadId, P)> {
        self.results.dequeue_blocking().await
    }

    /// End the result stream without waiting for completion.
    pub(crate) fn close_results(&self) {
        self.results.finish();
    }

    fn total_enqueued(&self) -> u64 {
        u64::from(self.next_id.load(Ordering::SeqCst)) - 1
    }

    pub(crate) fn state_of(&self, id: WorkloadId) -> Option<JobState> {
        if id.get() == 0 || u64::from(id.get()) > self.total_enqueued() {
            return None;
        }
        if self.in_flight.contains(id) {
            Some(JobState::InFlight)
        } else if lock(&self.done).contains(&id) {
            Some(JobState::Done)
        } else if lock(&self.failed).contains(&id) {
            Some(JobState::Failed)
        } else {
            Some(JobState::Pending)
        }
    }

    /// Diagnostic look at one in-flight job: id, minion, time out.
    pub(crate) fn sample_in_flight(&self) -> Option<(WorkloadId, String, Duration)> {
        self.in_flight.pick_one_with(|id, entry| {
            (*id, entry.minion.clone(), entry.dispatched_at.elapsed())
        })
    }

    pub(crate) fn stats(&self) -> CampaignStats {
        let (queue_pushes, queue_pops, pending) = self.pending.counts();
        CampaignStats {
            total_enqueued: self.total_enqueued(),
            pending: pending as u64,
            in_flight: self.in_flight.len() as u64,
            done: lock(&self.done).len() as u64,
            failed: lock(&self.failed).len() as u64,
            requeued: self.pending.total_requeued(),
            queue_pushes,
            queue_pops,
            redundant_results: self.metrics.redundant_results.value(),
            dispatched: self.metrics.dispatched.value(),
            active_minions: self.metrics.active_minions.value(),
            skipped: self.skipped.load(Ordering::Relaxed),
            announced_total: self.announced_total.load(Ordering::Relaxed),
        }
    }

    /// Move the unconsumed results and the failed ids out of the state.
    ///
    /// Results already taken through [`next_result`](Self::next_result) are
    /// not repeated. Where a workload has several, the latest wins.
    pub(crate) fn take_settled(&self) -> (BTreeMap<WorkloadId, P>, Vec<WorkloadId>) {
        let mut results = BTreeMap::new();
        while let Some((id, result)) = self.results.dequeue_nonblocking() {
            results.insert(id, result);
        }
        let failed = std::mem::take(&mut *lock(&self.failed))
            .into_iter()
            .collect();
        (results, failed)
    }
}
