//! Bounded tracking of publishes awaiting a broker ack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// An entry removed from the queue.
#[derive(Debug)]
pub struct Tracked<E> {
    pub id: u64,
    pub enqueued_at: Instant,
    pub item: E,
}

struct Slot<E> {
    enqueued_at: Instant,
    item: E,
    _permit: OwnedSemaphorePermit,
}

/// Arena of in-flight entries whose size never exceeds `capacity`.
///
/// Each entry holds a semaphore permit, so `enqueue` waits for a free slot
/// and capacity is released exactly when the entry is removed.
pub struct AckTrackingQueue<E> {
    capacity: usize,
    capacity_timeout: Duration,
    permits: Arc<Semaphore>,
    entries: Mutex<HashMap<u64, Slot<E>>>,
    next_id: AtomicU64,
    drained: Notify,
}

impl<E> AckTrackingQueue<E> {
    pub fn new(capacity: usize, capacity_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            capacity_timeout,
            permits: Arc::new(Semaphore::new(capacity)),
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            drained: Notify::new(),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u64, Slot<E>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track `item`, waiting up to the capacity timeout for a free slot.
    /// Gives the item back when the queue stays full.
    pub async fn enqueue(&self, item: E) -> Result<u64, E> {
        let permit = match tokio::time::timeout(
            self.capacity_timeout,
            self.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            _ => return Err(item),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries().insert(
            id,
            Slot {
                enqueued_at: Instant::now(),
                item,
                _permit: permit,
            },
        );
        Ok(id)
    }

    /// Remove an entry, releasing its slot. `None` if already removed.
    pub fn remove(&self, id: u64) -> Option<Tracked<E>> {
        let (slot, now_empty) = {
            let mut entries = self.entries();
            let slot = entries.remove(&id);
            (slot, entries.is_empty())
        };
        if now_empty {
            self.drained.notify_waiters();
        }
        slot.map(|slot| Tracked {
            id,
            enqueued_at: slot.enqueued_at,
            item: slot.item,
        })
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Occupancy as a whole percentage of capacity, 0..=100.
    pub fn occupancy_percent(&self) -> u32 {
        (self.len() * 100 / self.capacity) as u32
    }

    /// Wait until the queue is empty or `timeout` elapses. Returns whether it drained.
    pub async fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.drained.notified();
            if self.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_empty();
            }
        }
    }
}
