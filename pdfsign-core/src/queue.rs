// SPDX-License-Identifier: MIT
//
// PDF Sign Service: Multi-Tenant PDF Signing and Verification
// Copyright (c) 2025 PDF Sign Service Contributors
//
// https://github.com/pdfsign/pdfsign-service

//! Three-band priority queue with FIFO semantics per band
//!
//! Producers wait when their band is full, consumers wait when every band is
//! empty. A pop always takes from the highest non-empty band.

use crate::model::Priority;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Thread-safe bounded priority queue
///
/// # Design
///
/// - One `VecDeque` per band behind a single `parking_lot::Mutex`
/// - A semaphore per band counts free slots (backpressure on push)
/// - One semaphore counts queued items (wakes idle consumers)
///
/// The item semaphore never holds more permits than there are queued items, so
/// a consumer that obtained a permit always finds an item.
pub struct PriorityQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for PriorityQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct QueueInner<T> {
    state: Mutex<QueueState<T>>,
    free_slots: [Semaphore; 3],
    ready: Semaphore,
    capacity: usize,
}

struct QueueState<T> {
    bands: [VecDeque<T>; 3],
    stats: QueueStats,
}

/// Lifetime counters per band, indexed low, medium, high
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushes: [u64; 3],
    pub pops: [u64; 3],
}

impl<T> PriorityQueue<T> {
    /// Create a queue whose bands each hold `capacity` items
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    bands: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                    stats: QueueStats::default(),
                }),
                free_slots: [
                    Semaphore::new(capacity),
                    Semaphore::new(capacity),
                    Semaphore::new(capacity),
                ],
                ready: Semaphore::new(0),
                capacity,
            }),
        }
    }

    /// Append an item to its band, waiting while the band is full
    pub async fn push(&self, item: T, priority: Priority) -> Result<()> {
        let band = priority.index();
        let permit = self.inner.free_slots[band]
            .acquire()
            .await
            .map_err(|_| Error::Shutdown)?;
        permit.forget();

        {
            let mut state = self.inner.state.lock();
            state.bands[band].push_back(item);
            state.stats.pushes[band] += 1;
        }

        self.inner.ready.add_permits(1);
        Ok(())
    }

    /// Take the oldest item of the highest non-empty band, waiting while all are empty
    pub async fn pop(&self) -> Result<T> {
        let permit = self.inner.ready.acquire().await.map_err(|_| Error::Shutdown)?;
        permit.forget();
        self.take_highest()
            .ok_or_else(|| Error::Internal("queue permit without item".to_string()))
    }

    /// Non-blocking pop
    pub fn try_pop(&self) -> Option<T> {
        let permit = self.inner.ready.try_acquire().ok()?;
        permit.forget();
        self.take_highest()
    }

    fn take_highest(&self) -> Option<T> {
        let (item, band) = {
            let mut state = self.inner.state.lock();
            let (item, band) = Priority::PREFERENCE.iter().find_map(|p| {
                let band = p.index();
                state.bands[band].pop_front().map(|item| (item, band))
            })?;
            state.stats.pops[band] += 1;
            (item, band)
        };
        self.inner.free_slots[band].add_permits(1);
        Some(item)
    }

    /// Items queued in one band
    pub fn len(&self, priority: Priority) -> usize {
        self.inner.state.lock().bands[priority.index()].len()
    }

    /// Items queued across all bands
    pub fn len_all(&self) -> usize {
        self.inner.state.lock().bands.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len_all() == 0
    }

    /// Per-band capacity
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.state.lock().stats.clone()
    }

    /// Wake every waiting producer and consumer with [`Error::Shutdown`]
    pub fn close(&self) {
        self.inner.ready.close();
        for slots in &self.inner.free_slots {
            slots.close();
        }
    }
}
