// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control messages exchanged between the coordinator and minions.
//!
//! The schema is small and stable, so it is declared directly with prost
//! derives instead of being generated from a `.proto` file:
//!
//! ```text
//! enum Command { UNSPECIFIED = 0; NEED_WORK = 1; WORK_FOLLOWS = 2; RESULT_FOLLOWS = 3; DIE = 4; }
//! message ControlMessage { Command command = 1; uint64 build_id = 2; uint32 workload_id = 3; }
//! ```

/// Control command carried by every [`ControlMessage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Command {
    /// Decode default. Never valid on the wire.
    Unspecified = 0,
    /// Minion asks for a job.
    NeedWork = 1,
    /// Coordinator assigns a job; the payload frame follows.
    WorkFollows = 2,
    /// Minion returns a result; the payload frame follows.
    ResultFollows = 3,
    /// No more work will ever be available; the minion should disconnect.
    Die = 4,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Unspecified => "UNSPECIFIED",
            Command::NeedWork => "NEED_WORK",
            Command::WorkFollows => "WORK_FOLLOWS",
            Command::ResultFollows => "RESULT_FOLLOWS",
            Command::Die => "DIE",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol envelope preceding every payload exchange.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ControlMessage {
    #[prost(enumeration = "Command", tag = "1")]
    pub command: i32,
    /// Identifies the coordinator run; minions built for another run are rejected.
    #[prost(uint64, tag = "2")]
    pub build_id: u64,
    /// Job the following payload belongs to (WORK_FOLLOWS / RESULT_FOLLOWS only).
    #[prost(uint32, tag = "3")]
    pub workload_id: u32,
}

impl ControlMessage {
    pub fn new(command: Command, build_id: u64, workload_id: u32) -> Self {
        Self {
            command: command as i32,
            build_id,
            workload_id,
        }
    }

    pub fn need_work(build_id: u64) -> Self {
        Self::new(Command::NeedWork, build_id, 0)
    }

    pub fn work_follows(build_id: u64, workload_id: u32) -> Self {
        Self::new(Command::WorkFollows, build_id, workload_id)
    }

    pub fn result_follows(build_id: u64, workload_id: u32) -> Self {
        Self::new(Command::ResultFollows, build_id, workload_id)
    }

    pub fn die(build_id: u64) -> Self {
        Self::new(Command::Die, build_id, 0)
    }
}
