// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pending job queue shared by all minion sessions.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

/// FIFO queue with blocking and non-blocking dequeue.
///
/// The lock is only held for the push or pop itself, never across an await.
/// Once [`finish`](Self::finish) has been called, a blocking dequeue on an
/// empty queue returns `None` instead of waiting for work that will never
/// arrive.
#[derive(Debug)]
pub struct PendingQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Notify,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    finished: bool,
    /// Items ever pushed, requeues included.
    pushed: u64,
    /// Items ever popped.
    popped: u64,
    requeued: u64,
}

impl<T> Default for PendingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingQueue<T> {
    /// Empty, unfinished queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                finished: false,
                pushed: 0,
                popped: 0,
                requeued: 0,
            }),
            available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item and wake one blocked dequeuer.
    pub fn enqueue(&self, item: T) {
        {
            let mut state = self.lock();
            state.items.push_back(item);
            state.pushed += 1;
        }
        self.available.notify_one();
    }

    /// Put an item back at the head so it is the next one handed out.
    pub fn requeue(&self, item: T) {
        {
            let mut state = self.lock();
            state.items.push_front(item);
            state.pushed += 1;
            state.requeued += 1;
        }
        self.available.notify_one();
    }

    /// Remove the oldest item, waiting until one is available.
    ///
    /// Returns `None` when the queue is empty and finished.
    pub async fn dequeue_blocking(&self) -> Option<T> {
        loop {
            // Register interest before looking, so an enqueue between the
            // check and the await still wakes us.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    state.popped += 1;
                    return Some(item);
                }
                if state.finished {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Remove the oldest item if there is one.
    pub fn dequeue_nonblocking(&self) -> Option<T> {
        let mut state = self.lock();
        let item = state.items.pop_front()?;
        state.popped += 1;
        Some(item)
    }

    /// Mark that no more items will be enqueued and release every waiter
    /// that finds the queue empty.
    pub fn finish(&self) {
        self.lock().finished = true;
        self.available.notify_waiters();
    }

    /// Whether [`finish`](Self::finish) has been called.
    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Current number of queued items.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Items that were put back with [`requeue`](Self::requeue).
    pub fn total_requeued(&self) -> u64 {
        self.lock().requeued
    }

    /// Snapshot of `(pushed, popped, queued)` taken under one lock.
    pub fn counts(&self) -> (u64, u64, usize) {
        let state = self.lock();
        (state.pushed, state.popped, state.items.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = PendingQueue::new();
        for i in 1..=5 {
            queue.enqueue(i);
        }
        for i in 1..=5 {
            assert_eq!(queue.dequeue_blocking().await, Some(i));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_requeue_goes_to_head() {
        let queue = PendingQueue::new();
        queue.enqueue(2);
        queue.enqueue(3);
        queue.requeue(1);

        assert_eq!(queue.dequeue_nonblocking(), Some(1));
        assert_eq!(queue.dequeue_nonblocking(), Some(2));
        assert_eq!(queue.dequeue_nonblocking(), Some(3));
        assert_eq!(queue.total_requeued(), 1);
    }

    #[test]
    fn test_nonblocking_on_empty() {
        let queue: PendingQueue<u32> = PendingQueue::new();
        assert_eq!(queue.dequeue_nonblocking(), None);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_blocking_dequeue_waits_for_enqueue() {
        let queue = Arc::new(PendingQueue::new());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue_blocking().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.enqueue("job");
        let got = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert_eq!(got, Some("job"));
    }

    #[tokio::test]
    async fn test_finish_releases_all_waiters() {
        let queue: Arc<PendingQueue<u32>> = Arc::new(PendingQueue::new());

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.dequeue_blocking().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.finish();

        for waiter in waiters {
            let got = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
            assert_eq!(got, None);
        }
    }

    #[tokio::test]
    async fn test_finished_queue_still_drains() {
        let queue = PendingQueue::new();
        queue.enqueue(1);
        queue.finish();

        assert_eq!(queue.dequeue_blocking().await, Some(1));
        assert_eq!(queue.dequeue_blocking().await, None);

        // A lost job can still come back after filling is finished.
        queue.requeue(1);
        assert_eq!(queue.dequeue_blocking().await, Some(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumers_get_each_item_once() {
        let queue = Arc::new(PendingQueue::new());
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut got = Vec::new();
                    while let Some(item) = queue.dequeue_blocking().await {
                        got.push(item);
                    }
                    got
                })
            })
            .collect();

        for i in 0..1000u32 {
            queue.enqueue(i);
        }
        queue.finish();

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(timeout(Duration::from_secs(10), consumer).await.unwrap().unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..1000).collect::<Vec<_>>());

        let (pushed, popped, queued) = queue.counts();
        assert_eq!(pushed, popped + queued as u64);
        assert_eq!(queued, 0);
    }

    #[tokio::test]
    async fn test_counts_track_pushes_and_pops() {
        let queue = PendingQueue::new();
        queue.enqueue('a');
        queue.enqueue('b');
        queue.dequeue_nonblocking();
        queue.requeue('a');

        assert_eq!(queue.counts(), (3, 1, 2));
        assert_eq!(queue.total_requeued(), 1);
        assert!(!queue.is_finished());
    }
}
