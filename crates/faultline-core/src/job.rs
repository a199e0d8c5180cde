// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job identity and lifecycle.

use std::fmt;
use std::time::Instant;

use crate::payload::ExperimentData;

/// Identifier of one job within a campaign.
///
/// Issued at enqueue time starting from 1 and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadId(u32);

impl WorkloadId {
    /// Wrap a raw wire value.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw value carried in control messages.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<WorkloadId> for u32 {
    fn from(id: WorkloadId) -> Self {
        id.0
    }
}

/// Where a job currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting in the pending queue.
    Pending,
    /// Assigned to a minion, awaiting its result.
    InFlight,
    /// A result was committed.
    Done,
    /// Gave up on the job.
    Failed,
}

/// A unit of work moving between the pending queue and the in-flight registry.
#[derive(Debug)]
pub struct Job<P> {
    /// Experiment payload with its workload id.
    pub data: ExperimentData<P>,
    /// Number of dispatches that ended without a result.
    pub attempts: u32,
}

impl<P> Job<P> {
    /// A fresh job that has never been dispatched.
    pub fn new(data: ExperimentData<P>) -> Self {
        Self { data, attempts: 0 }
    }

    /// The job's workload id.
    pub fn workload_id(&self) -> WorkloadId {
        self.data.workload_id
    }
}

/// Registry entry for a dispatched job.
#[derive(Debug)]
pub struct InFlight<P> {
    /// The job, owned by the registry while it is out.
    pub job: Job<P>,
    /// Peer the job was handed to.
    pub minion: String,
    /// When the job was handed out.
    pub dispatched_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_id_ordering_and_display() {
        let a = WorkloadId::new(2);
        let b = WorkloadId::new(10);
        assert!(a < b);
        assert_eq!(a.to_string(), "2");
        assert_eq!(u32::from(b), 10);
        assert_eq!(b.get(), 10);
    }

    #[test]
    fn test_new_job_has_no_attempts() {
        let job = Job::new(ExperimentData::new(WorkloadId::new(3), "payload"));
        assert_eq!(job.attempts, 0);
        assert_eq!(job.workload_id(), WorkloadId::new(3));
    }
}
