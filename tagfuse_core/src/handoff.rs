//! Cross-context handoff between the receive loop and the render tick.
//!
//! The receive side only ever pushes into small per-endpoint queues; all
//! filter mutation happens when the render side drains them. A full queue
//! overwrites its oldest entry, so under sustained overload the newest
//! measurements win and the loss is counted.

use crate::endpoint::{EndpointId, Measurement, TagUid, TimedMeasurement};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Default depth of each per-endpoint queue.
pub const DEFAULT_HANDOFF_DEPTH: usize = 10;

// ============================================================================
// BOUNDED QUEUE
// ============================================================================

/// Bounded FIFO guarded by a mutex, overwrite-oldest when full.
#[derive(Debug)]
pub struct HandoffQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    overwritten: AtomicU64,
}

impl<T> HandoffQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            overwritten: AtomicU64::new(0),
        }
    }

    /// Enqueues `item`. Returns `true` if the oldest entry was overwritten.
    pub fn push(&self, item: T) -> bool {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let overwrote = items.len() == self.capacity;
        if overwrote {
            items.pop_front();
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        items.push_back(item);
        overwrote
    }

    /// Takes every queued entry, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries lost to overwrite since creation.
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}

// ============================================================================
// INBOX
// ============================================================================

type QueueMap = BTreeMap<EndpointId, Arc<HandoffQueue<TimedMeasurement>>>;

/// Routing table of per-endpoint queues, shared by both contexts.
#[derive(Debug, Clone)]
pub struct Inbox {
    queues: Arc<RwLock<QueueMap>>,
    depth: usize,
}

impl Inbox {
    pub fn new(depth: usize) -> Self {
        Self {
            queues: Arc::new(RwLock::new(BTreeMap::new())),
            depth: depth.max(1),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_HANDOFF_DEPTH)
    }

    /// Handle for the receive context.
    pub fn sender(&self) -> InboxSender {
        InboxSender {
            inbox: self.clone(),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    fn queue(&self, endpoint: EndpointId) -> Arc<HandoffQueue<TimedMeasurement>> {
        if let Some(queue) = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&endpoint)
        {
            return Arc::clone(queue);
        }
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            queues
                .entry(endpoint)
                .or_insert_with(|| Arc::new(HandoffQueue::new(self.depth))),
        )
    }

    /// Drains every queue, endpoints in id order, entries in arrival order.
    pub fn drain_all(&self) -> Vec<(EndpointId, Vec<TimedMeasurement>)> {
        let queues: Vec<_> = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, q)| (*id, Arc::clone(q)))
            .collect();
        queues
            .into_iter()
            .filter_map(|(id, q)| {
                let items = q.drain();
                (!items.is_empty()).then_some((id, items))
            })
            .collect()
    }

    /// Drops the queues of every endpoint on `tag`, with their contents.
    pub fn remove_tag(&self, tag: TagUid) {
        self.queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|id, _| id.tag != tag);
    }

    /// Drops empty queues whose tag fails `keep`. Returns how many went.
    pub fn prune<F>(&self, keep: F) -> usize
    where
        F: Fn(TagUid) -> bool,
    {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        let before = queues.len();
        queues.retain(|id, q| keep(id.tag) || !q.is_empty());
        before - queues.len()
    }

    /// Number of endpoint queues currently allocated.
    pub fn queue_count(&self) -> usize {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Measurements currently queued across all endpoints.
    pub fn pending(&self) -> usize {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|q| q.len())
            .sum()
    }

    /// Measurements lost to overwrite across all endpoints.
    pub fn overwritten(&self) -> u64 {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|q| q.overwritten())
            .sum()
    }
}

impl Default for Inbox {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Producer half of an [`Inbox`].
#[derive(Debug, Clone)]
pub struct InboxSender {
    inbox: Inbox,
}

impl InboxSender {
    /// Queues a measurement that arrived at local time `arrival`.
    /// Returns `true` if an older measurement was overwritten.
    pub fn push(&self, endpoint: EndpointId, arrival: f64, measurement: Measurement) -> bool {
        let overwrote = self
            .inbox
            .queue(endpoint)
            .push(TimedMeasurement::new(arrival, measurement));
        if overwrote {
            tracing::debug!(%endpoint, "Handoff queue full, oldest measurement overwritten");
        }
        overwrote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;
    use std::thread;

    fn fix(x: f64) -> Measurement {
        Measurement::Position {
            device_ticks: None,
            position: Vector3::new(x, 0.0, 0.0),
        }
    }

    #[test]
    fn test_queue_fifo() {
        let queue = HandoffQueue::new(4);
        for i in 0..3 {
            assert!(!queue.push(i));
        }
        assert_eq!(queue.drain(), vec![0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_overwrites_oldest() {
        let queue = HandoffQueue::new(3);
        for i in 0..5 {
            queue.push(i);
        }
        assert_eq!(queue.overwritten(), 2);
        assert_eq!(queue.drain(), vec![2, 3, 4]);
    }

    #[test]
    fn test_inbox_routes_per_endpoint() {
        let inbox = Inbox::new(10);
        let sender = inbox.sender();
        let a = EndpointId::new(TagUid(2), 0);
        let b = EndpointId::new(TagUid(1), 1);

        sender.push(a, 1.0, fix(1.0));
        sender.push(b, 1.1, fix(2.0));
        sender.push(a, 1.2, fix(3.0));
        assert_eq!(inbox.pending(), 3);

        let drained = inbox.drain_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, b);
        assert_eq!(drained[1].0, a);
        let arrivals: Vec<f64> = drained[1].1.iter().map(|m| m.arrival).collect();
        assert_eq!(arrivals, vec![1.0, 1.2]);
        assert_eq!(inbox.pending(), 0);
    }

    #[test]
    fn test_inbox_remove_tag() {
        let inbox = Inbox::new(10);
        let sender = inbox.sender();
        sender.push(EndpointId::new(TagUid(1), 0), 0.0, fix(0.0));
        sender.push(EndpointId::new(TagUid(2), 0), 0.0, fix(0.0));
        inbox.remove_tag(TagUid(1));
        let drained = inbox.drain_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0.tag, TagUid(2));
    }

    #[test]
    fn test_prune_drops_empty_queues_of_unknown_tags() {
        let inbox = Inbox::new(10);
        let sender = inbox.sender();
        for uid in 0..1000u16 {
            sender.push(EndpointId::new(TagUid(uid), 0), 0.0, fix(0.0));
        }
        assert_eq!(inbox.queue_count(), 1000);

        inbox.drain_all();
        // Tag 5 stays registered; a pending entry for tag 9 survives until drained.
        sender.push(EndpointId::new(TagUid(9), 0), 0.1, fix(0.0));
        let pruned = inbox.prune(|tag| tag == TagUid(5));
        assert_eq!(pruned, 998);
        assert_eq!(inbox.queue_count(), 2);
        assert_eq!(inbox.pending(), 1);
    }

    #[test]
    fn test_concurrent_producer_keeps_order() {
        let inbox = Inbox::new(1000);
        let sender = inbox.sender();
        let id = EndpointId::new(TagUid(7), 0);

        let producer = thread::spawn(move || {
            for i in 0..500 {
                sender.push(id, i as f64, fix(0.0));
            }
        });

        let mut seen = Vec::new();
        while seen.len() < 500 {
            for (_, items) in inbox.drain_all() {
                seen.extend(items.into_iter().map(|m| m.arrival));
            }
        }
        producer.join().unwrap();

        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(inbox.overwritten(), 0);
    }
}
