// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry of jobs currently assigned to minions.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::job::WorkloadId;

/// Default number of entries [`InFlightRegistry::pick_one`] rotates over.
pub const DEFAULT_PICK_WINDOW: usize = 50_000;

/// Keyed store of in-flight jobs.
///
/// Every operation runs in one critical section, so callers never observe a
/// half-applied insert or remove. Insert refuses to overwrite: that refusal is
/// what keeps a job from being dispatched twice.
#[derive(Debug)]
pub struct InFlightRegistry<T> {
    state: Mutex<RegistryState<T>>,
    window: usize,
}

#[derive(Debug)]
struct RegistryState<T> {
    entries: BTreeMap<WorkloadId, T>,
    cursor: usize,
}

impl<T> Default for InFlightRegistry<T> {
    fn default() -> Self {
        Self::new(DEFAULT_PICK_WINDOW)
    }
}

impl<T> InFlightRegistry<T> {
    /// Empty registry whose `pick_one` looks at most `window` entries deep.
    pub fn new(window: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                entries: BTreeMap::new(),
                cursor: 0,
            }),
            window: window.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `value` under `id`.
    ///
    /// Returns the value back if `id` is already present; the existing entry
    /// is left untouched.
    pub fn insert(&self, id: WorkloadId, value: T) -> Result<(), T> {
        let mut state = self.lock();
        if state.entries.contains_key(&id) {
            return Err(value);
        }
        state.entries.insert(id, value);
        Ok(())
    }

    /// Remove and return the entry for `id`.
    pub fn remove(&self, id: WorkloadId) -> Option<T> {
        self.lock().entries.remove(&id)
    }

    /// Whether `id` is in flight.
    pub fn contains(&self, id: WorkloadId) -> bool {
        self.lock().entries.contains_key(&id)
    }

    /// Number of in-flight entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Id of some in-flight entry, without removing it.
    pub fn pick_one(&self) -> Option<WorkloadId> {
        self.pick_one_with(|id, _| *id)
    }

    /// Look at some in-flight entry without removing it.
    ///
    /// Successive calls walk a round-robin cursor over the first `window`
    /// entries in id order, so repeated picks spread across entries while each
    /// call costs at most `window` steps.
    pub fn pick_one_with<R>(&self, f: impl FnOnce(&WorkloadId, &T) -> R) -> Option<R> {
        let mut state = self.lock();
        let span = state.entries.len().min(self.window);
        if span == 0 {
            return None;
        }
        let index = state.cursor % span;
        state.cursor = (state.cursor + 1) % self.window;
        state.entries.iter().nth(index).map(|(id, value)| f(id, value))
    }
}
