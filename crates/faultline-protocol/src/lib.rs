// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Faultline Protocol - TCP + Protobuf communication layer
//!
//! This crate provides the wire protocol spoken between the campaign
//! coordinator and the minions that execute fault-injection experiments.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    faultline-protocol                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Session: NEED_WORK / WORK_FOLLOWS / RESULT_FOLLOWS / DIE   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf control messages (prost)           │
//! │                 + opaque experiment payloads                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: 4-byte big-endian length prefix                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: TCP (tokio + socket2)                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Session sequence
//!
//! ```text
//! minion      -> coordinator : NEED_WORK(build_id)
//! coordinator -> minion      : WORK_FOLLOWS(workload_id)
//! coordinator -> minion      : <experiment payload>
//! minion      -> coordinator : RESULT_FOLLOWS(build_id, workload_id)
//! minion      -> coordinator : <result payload>
//! ```
//!
//! Once the campaign has no more work, NEED_WORK is answered with DIE.
//!
//! # Usage
//!
//! ```ignore
//! use faultline_protocol::{MinionClient, MinionClientConfig, WorkAssignment};
//!
//! let mut client = MinionClient::connect(&MinionClientConfig::default()).await?;
//! while let WorkAssignment::Work { workload_id, payload } = client.request_work(build_id).await? {
//!     let result = run_experiment(&payload);
//!     client.send_result(build_id, workload_id, &result).await?;
//! }
//! ```

pub mod client;
pub mod frame;
pub mod message;
pub mod server;

// Re-export main types
pub use client::{ClientError, MinionClient, MinionClientConfig, WorkAssignment};
pub use frame::{FrameError, FramedStream, MAX_FRAME_SIZE, read_frame, write_frame};
pub use message::{Command, ControlMessage};
pub use server::{DEFAULT_PORT, FramedServer, ServerError, TcpServerConfig};
