//! Fixed-capacity history of recently processed items.
//!
//! A [`StatusRing`] keeps the last N entries in a preallocated slot vector
//! with a write cursor. Adding never blocks, never grows and never fails; the
//! oldest slot is overwritten. Overwritten values can be forwarded to an
//! "evicted" channel so a collaborator can archive them, best effort.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::models::JobHistory;

struct Slots<T> {
    slots: Vec<Option<T>>,
    cursor: usize,
}

/// Circular buffer of the most recent `capacity` entries.
pub struct StatusRing<T> {
    inner: Mutex<Slots<T>>,
    capacity: usize,
    evicted: Option<mpsc::Sender<T>>,
}

impl<T: Clone> StatusRing<T> {
    /// Create a ring holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Slots {
                slots: (0..capacity).map(|_| None).collect(),
                cursor: 0,
            }),
            capacity,
            evicted: None,
        }
    }

    /// Forward overwritten entries to `tx`. Sends are `try_send`; when the
    /// channel is full or closed the entry is dropped.
    pub fn with_evicted(mut self, tx: mpsc::Sender<T>) -> Self {
        self.evicted = Some(tx);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.lock().slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write `entry` into the oldest slot.
    pub fn add(&self, entry: T) {
        if self.capacity == 0 {
            return;
        }

        let previous = {
            let mut ring = self.lock();
            let idx = ring.cursor;
            ring.cursor = (idx + 1) % self.capacity;
            ring.slots[idx].replace(entry)
        };

        if let (Some(old), Some(tx)) = (previous, self.evicted.as_ref()) {
            if tx.try_send(old).is_err() {
                trace!(
                    subsystem = "core",
                    component = "status_ring",
                    "Evicted entry dropped, channel full or closed"
                );
            }
        }
    }

    /// Snapshot of the occupied slots in buffer order.
    pub fn get_all(&self) -> Vec<T> {
        self.lock().slots.iter().flatten().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Key of a job history ring.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RingKey {
    pub agent_id: Uuid,
    pub name: String,
    pub resource_id: String,
}

impl RingKey {
    pub fn of(history: &JobHistory) -> Self {
        Self {
            agent_id: history.agent_id,
            name: history.name.clone(),
            resource_id: history.resource_id.clone(),
        }
    }
}

/// One [`StatusRing`] per `(agent_id, name, resource_id)`.
///
/// Explicitly constructed and passed to the components that record history;
/// there is no process-wide instance.
pub struct StatusRingManager {
    rings: Mutex<HashMap<RingKey, Arc<StatusRing<JobHistory>>>>,
    capacity: usize,
    evicted: Option<mpsc::Sender<JobHistory>>,
}

impl StatusRingManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            rings: Mutex::new(HashMap::new()),
            capacity,
            evicted: None,
        }
    }

    /// Share one evicted channel across every ring created by this manager.
    pub fn with_evicted(mut self, tx: mpsc::Sender<JobHistory>) -> Self {
        self.evicted = Some(tx);
        self
    }

    /// Record `history` in the ring for its key, creating the ring if needed.
    pub fn add(&self, history: JobHistory) {
        self.ring(RingKey::of(&history)).add(history);
    }

    /// Snapshot of the ring for `key`; empty when nothing was recorded.
    pub fn get(&self, key: &RingKey) -> Vec<JobHistory> {
        let ring = self.lock().get(key).cloned();
        ring.map(|r| r.get_all()).unwrap_or_default()
    }

    pub fn keys(&self) -> Vec<RingKey> {
        let mut keys: Vec<_> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn ring(&self, key: RingKey) -> Arc<StatusRing<JobHistory>> {
        let mut rings = self.lock();
        rings
            .entry(key)
            .or_insert_with(|| {
                let ring = StatusRing::new(self.capacity);
                Arc::new(match self.evicted.clone() {
                    Some(tx) => ring.with_evicted(tx),
                    None => ring,
                })
            })
            .clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RingKey, Arc<StatusRing<JobHistory>>>> {
        self.rings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_never_exceeds_capacity() {
        let ring = StatusRing::new(3);
        for i in 0..100 {
            ring.add(i);
            assert!(ring.len() <= 3);
        }
        let mut all = ring.get_all();
        all.sort();
        assert_eq!(all, vec![97, 98, 99]);
    }

    #[test]
    fn test_ring_buffer_order_after_wrap() {
        let ring = StatusRing::new(3);
        for i in 1..=4 {
            ring.add(i);
        }
        // Slot 0 was overwritten by 4.
        assert_eq!(ring.get_all(), vec![4, 2, 3]);
    }

    #[test]
    fn test_ring_partial_fill() {
        let ring = StatusRing::new(5);
        ring.add("a");
        ring.add("b");
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.get_all(), vec!["a", "b"]);
    }

    #[test]
    fn test_zero_capacity_ring_ignores_adds() {
        let ring = StatusRing::new(0);
        ring.add(1);
        assert!(ring.is_empty());
        assert!(ring.get_all().is_empty());
    }

    #[test]
    fn test_evicted_entries_forwarded() {
        let (tx, mut rx) = mpsc::channel(10);
        let ring = StatusRing::new(2).with_evicted(tx);
        ring.add(1);
        ring.add(2);
        assert!(rx.try_recv().is_err());

        ring.add(3);
        ring.add(4);
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_evicted_channel_does_not_block() {
        let (tx, mut rx) = mpsc::channel(1);
        let ring = StatusRing::new(1).with_evicted(tx);
        for i in 0..10 {
            ring.add(i);
        }
        assert_eq!(rx.try_recv().unwrap(), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(ring.get_all(), vec![9]);
    }

    #[test]
    fn test_manager_keeps_one_ring_per_key() {
        let manager = StatusRingManager::new(2);
        let agent = Uuid::new_v4();
        for i in 0..5 {
            let mut h = JobHistory::start("push", "config_items", "res-1").with_agent(agent);
            h.success_count = i;
            manager.add(h);
        }
        manager.add(JobHistory::start("push", "config_items", "res-2").with_agent(agent));

        assert_eq!(manager.keys().len(), 2);
        let key = RingKey {
            agent_id: agent,
            name: "push".into(),
            resource_id: "res-1".into(),
        };
        let mut counts: Vec<_> = manager.get(&key).iter().map(|h| h.success_count).collect();
        counts.sort();
        assert_eq!(counts, vec![3, 4]);
    }

    #[test]
    fn test_manager_unknown_key_is_empty() {
        let manager = StatusRingManager::new(2);
        let key = RingKey {
            agent_id: Uuid::nil(),
            name: "none".into(),
            resource_id: "none".into(),
        };
        assert!(manager.get(&key).is_empty());
    }

    #[test]
    fn test_ring_shared_across_threads() {
        let ring = Arc::new(StatusRing::new(8));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let ring = ring.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        ring.add(t * 100 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ring.len(), 8);
    }
}
