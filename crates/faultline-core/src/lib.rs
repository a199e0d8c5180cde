// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Faultline Core - Fault-Injection Campaign Coordinator
//!
//! This crate hands out fault-injection experiments to a fleet of minions,
//! collects their results and guarantees that every experiment eventually
//! produces exactly one recorded result, however often minions crash.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐        ┌─────────────────────────────────────────┐
//! │  Campaign definition │ add_   │             CampaignManager             │
//! │  (impl Campaign<P>)  │──job──►│                                         │
//! └──────────────────────┘        │  PendingQueue ──dispatch──► InFlight    │
//!                                 │       ▲                     Registry    │
//!                                 │       └────── requeue ◄──────┘  │       │
//!                                 │                           commit│       │
//!                                 │                                 ▼       │
//!                                 │                              results    │
//!                                 └───────────────────▲─────────────────────┘
//!                                                     │ one MinionSession
//!                                                     │ per connection
//!                         ┌───────────────────────────┴──────────────┐
//!                         │ FramedServer (faultline-protocol, TCP)   │
//!                         └───────────────────────────▲──────────────┘
//!                                                     │ length-prefixed frames
//!                                  ┌──────────┐ ┌──────────┐ ┌──────────┐
//!                                  │ minion 1 │ │ minion 2 │ │ minion N │
//!                                  └──────────┘ └──────────┘ └──────────┘
//! ```
//!
//! # Job Lifecycle
//!
//! ```text
//!   add_job ──► PENDING ──dispatch──► IN_FLIGHT ──result──► DONE
//!                  ▲                      │
//!                  └──── lost (requeue) ──┤
//!                                         └── attempts used up ──► FAILED
//! ```
//!
//! A job is in exactly one of the pending queue, the in-flight registry or the
//! settled results at any quiescent point. A lost job goes back to the head
//! of the queue so it is the next one handed out.
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `FAULTLINE_BIND_ADDR` | `0.0.0.0` | Listen address |
//! | `FAULTLINE_PORT` | `1111` | Listen port |
//! | `FAULTLINE_BUILD_ID` | start time | Run identifier minions must present |
//! | `FAULTLINE_MAX_ATTEMPTS` | `0` | Lost dispatches before a job fails (0 = never) |
//! | `FAULTLINE_PICK_WINDOW` | `50000` | In-flight diagnostic pick window |
//! | `FAULTLINE_PROGRESS_INTERVAL_MS` | `500` | Progress log period (0 = off) |
//! | `FAULTLINE_BACKLOG` | `1024` | Listen backlog |
//! | `FAULTLINE_MAX_SESSIONS` | `0` | Concurrent minion limit (0 = none) |
//! | `FAULTLINE_TCP_NODELAY` | `true` | Disable Nagle on minion sockets |
//!
//! # Modules
//!
//! - [`campaign`]: Campaign manager, handle and outcome
//! - [`minion`]: Per-connection session state machine
//! - [`queue`], [`registry`], [`counter`]: Synchronized containers
//! - [`payload`]: Experiment and result encoding
//! - [`progress`]: Throughput and ETA reporting

#![deny(missing_docs)]

/// Campaign manager, the handle given to campaign definitions, and outcomes.
pub mod campaign;

/// Coordinator configuration loaded from environment variables.
pub mod config;

/// Atomic counter shared between sessions.
pub mod counter;

/// Session and campaign error types.
pub mod error;

/// Workload identifiers and job lifecycle types.
pub mod job;

/// Minion session handler.
pub mod minion;

/// Experiment and result payload encoding.
pub mod payload;

/// Periodic progress reporting.
pub mod progress;

/// Pending job queue.
pub mod queue;

/// Registry of jobs currently out with minions.
pub mod registry;

mod state;

pub use campaign::{Campaign, CampaignHandle, CampaignManager, CampaignOutcome};
pub use config::{ConfigError, CoordinatorConfig};
pub use counter::SynchronizedCounter;
pub use error::{CampaignError, SessionError, SessionErrorKind};
pub use job::{JobState, WorkloadId};
pub use minion::{Minion, MinionSession, SessionEnd, SessionState};
pub use payload::{ExperimentData, Json, PayloadError, Serializable};
pub use queue::PendingQueue;
pub use registry::InFlightRegistry;
pub use state::{CampaignStats, Commit};
