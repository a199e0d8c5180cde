// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for faultline-core.
//!
//! Session errors never escape a session: they decide whether the job in
//! hand is requeued and are then logged. Only [`CampaignError`] reaches the
//! caller of a campaign run.

use faultline_protocol::{Command, FrameError, ServerError};
use thiserror::Error;

use crate::job::WorkloadId;
use crate::payload::PayloadError;

/// Broad classes of session failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// The connection failed or closed mid-message.
    Transport,
    /// The minion broke the protocol.
    Protocol,
    /// A job was about to be dispatched while already in flight.
    DuplicateDispatch,
    /// A payload could not be decoded.
    Payload,
}

/// Errors that end a minion session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    /// The connection dropped or failed.
    #[error("transport error: {0}")]
    Transport(#[source] FrameError),

    /// A frame arrived but could not be used (oversized length prefix,
    /// undecodable control message).
    #[error("malformed frame: {0}")]
    MalformedFrame(#[source] FrameError),

    /// The minion sent a command that is not valid at this point.
    #[error("unexpected command: expected {expected}, got {got}")]
    UnexpectedCommand {
        /// Command the session was waiting for.
        expected: Command,
        /// Raw command value received.
        got: i32,
    },

    /// The minion sent a message while waiting for its next job.
    #[error("unsolicited message while awaiting work: command {got}")]
    Unsolicited {
        /// Raw command value received.
        got: i32,
    },

    /// The minion was built for a different run.
    #[error("build id mismatch: expected {expected}, got {got}")]
    BuildIdMismatch {
        /// This coordinator's build id.
        expected: u64,
        /// Build id presented by the minion.
        got: u64,
    },

    /// The minion returned a result for a job it was not given.
    #[error("result for workload {got} while workload {expected} was dispatched")]
    WorkloadMismatch {
        /// Workload that was dispatched.
        expected: WorkloadId,
        /// Workload id in the result header.
        got: u32,
    },

    /// The workload was already in the in-flight registry.
    #[error("workload {0} is already in flight")]
    DuplicateDispatch(WorkloadId),

    /// The result payload could not be decoded.
    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),
}

impl From<FrameError> for SessionError {
    fn from(err: FrameError) -> Self {
        if err.is_transport() {
            Self::Transport(err)
        } else {
            Self::MalformedFrame(err)
        }
    }
}

impl SessionError {
    /// Classify this error.
    pub fn kind(&self) -> SessionErrorKind {
        match self {
            Self::Transport(_) => SessionErrorKind::Transport,
            Self::MalformedFrame(_)
            | Self::UnexpectedCommand { .. }
            | Self::Unsolicited { .. }
            | Self::BuildIdMismatch { .. }
            | Self::WorkloadMismatch { .. } => SessionErrorKind::Protocol,
            Self::DuplicateDispatch(_) => SessionErrorKind::DuplicateDispatch,
            Self::Payload(_) => SessionErrorKind::Payload,
        }
    }

    /// Whether the job in hand goes back to the pending queue.
    ///
    /// Only a duplicate dispatch keeps its hands off: the entry already in
    /// the registry still owns that workload.
    pub fn requeues_job(&self) -> bool {
        self.kind() != SessionErrorKind::DuplicateDispatch
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::MalformedFrame(_) => "MALFORMED_FRAME",
            Self::UnexpectedCommand { .. } => "UNEXPECTED_COMMAND",
            Self::Unsolicited { .. } => "UNSOLICITED_MESSAGE",
            Self::BuildIdMismatch { .. } => "BUILD_ID_MISMATCH",
            Self::WorkloadMismatch { .. } => "WORKLOAD_MISMATCH",
            Self::DuplicateDispatch(_) => "DUPLICATE_DISPATCH",
            Self::Payload(_) => "PAYLOAD_ERROR",
        }
    }
}

/// Errors returned by a campaign run.
#[derive(Debug, Error)]
pub enum CampaignError {
    /// The listener could not be set up or failed.
    #[error("server error: {0}")]
    Server(#[from] ServerError),

    /// Jobs were added after filling was declared finished.
    #[error("cannot add jobs after filling has finished")]
    FillingFinished,

    /// The 32-bit workload id space is used up.
    #[error("workload ids exhausted")]
    WorkloadIdsExhausted,

    /// The campaign definition failed while producing jobs.
    #[error("campaign population failed: {0:#}")]
    Populate(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broken_pipe() -> FrameError {
        FrameError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe broken",
        ))
    }

    #[test]
    fn test_frame_error_classification() {
        assert_eq!(
            SessionError::from(broken_pipe()).kind(),
            SessionErrorKind::Transport
        );
        assert_eq!(
            SessionError::from(FrameError::ConnectionClosed).kind(),
            SessionErrorKind::Transport
        );
        assert_eq!(
            SessionError::from(FrameError::FrameTooLarge(usize::MAX)).kind(),
            SessionErrorKind::Protocol
        );
    }

    #[test]
    fn test_requeue_policy() {
        assert!(SessionError::from(FrameError::ConnectionClosed).requeues_job());
        assert!(
            SessionError::BuildIdMismatch {
                expected: 1,
                got: 2
            }
            .requeues_job()
        );
        assert!(!SessionError::DuplicateDispatch(WorkloadId::new(1)).requeues_job());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            SessionError::UnexpectedCommand {
                expected: Command::NeedWork,
                got: 4
            }
            .error_code(),
            "UNEXPECTED_COMMAND"
        );
        assert_eq!(
            SessionError::Unsolicited { got: 3 }.error_code(),
            "UNSOLICITED_MESSAGE"
        );
        assert_eq!(
            SessionError::DuplicateDispatch(WorkloadId::new(3)).error_code(),
            "DUPLICATE_DISPATCH"
        );
    }

    #[test]
    fn test_error_display() {
        let err = SessionError::UnexpectedCommand {
            expected: Command::ResultFollows,
            got: 1,
        };
        assert_eq!(
            err.to_string(),
            "unexpected command: expected RESULT_FOLLOWS, got 1"
        );

        let err = SessionError::WorkloadMismatch {
            expected: WorkloadId::new(5),
            got: 6,
        };
        assert_eq!(
            err.to_string(),
            "result for workload 6 while workload 5 was dispatched"
        );

        let err = CampaignError::Populate(anyhow::anyhow!("generator crashed"));
        assert!(err.to_string().contains("generator crashed"));
    }
}
