// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Atomic counters for campaign metrics.

use std::sync::atomic::{AtomicU64, Ordering};

/// A counter that can be bumped from any session.
///
/// Each call is atomic on its own; nothing is promised across calls. Used for
/// metrics only, never for correctness decisions.
#[derive(Debug, Default)]
pub struct SynchronizedCounter {
    value: AtomicU64,
}

impl SynchronizedCounter {
    /// Counter starting at zero.
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Add one and return the new value.
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Subtract one (stopping at zero) and return the new value.
    pub fn decrement(&self) -> u64 {
        match self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => 0,
        }
    }

    /// Current value. Stale as soon as it is returned.
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}
