use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::policy::DriveModeDecision;

pub type SubscriberId = u64;

/// Opaque handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberHandle {
    id: SubscriberId,
}

impl SubscriberHandle {
    pub fn id(&self) -> SubscriberId {
        self.id
    }
}

/// Delivery accounting for one subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberStatus {
    /// Set while the backlog keeps overflowing; cleared once drained.
    pub lagging: bool,
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("fan-out channel closed")]
    Closed,
    #[error("subscriber evicted after {0} consecutive overflows")]
    Evicted(u32),
}

#[derive(Debug, Default)]
struct SlotQueue {
    backlog: VecDeque<DriveModeDecision>,
    status: SubscriberStatus,
    overflow_strikes: u32,
    closed: bool,
    evicted: bool,
}

#[derive(Debug, Default)]
struct SlotShared {
    queue: Mutex<SlotQueue>,
    notify: Notify,
}

type SlotMap = HashMap<SubscriberId, Arc<SlotShared>>;

/// Fan-out of decision changes to independent subscribers.
///
/// `publish` walks every registered slot and appends under that slot's own
/// lock, so a slow consumer holds nothing that delays its peers. Overflow
/// policy per slot: drop the oldest backlog entry, count a strike; strikes
/// reset on any non-overflowing delivery, and `max_lag_strikes` consecutive
/// strikes evict the subscriber.
#[derive(Debug)]
pub struct DecisionFanout {
    slots: Arc<Mutex<SlotMap>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    max_lag_strikes: u32,
}

impl DecisionFanout {
    pub fn new(queue_capacity: usize, max_lag_strikes: u32) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            max_lag_strikes: max_lag_strikes.max(1),
        }
    }

    /// Registers a subscriber. The stream yields every decision change
    /// published after this call, in emission order.
    pub fn subscribe(&self) -> (SubscriberHandle, DecisionStream) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(SlotShared::default());
        lock_unpoisoned(&self.slots).insert(id, slot.clone());
        debug!("subscriber {} registered", id);

        let handle = SubscriberHandle { id };
        let stream = DecisionStream {
            id,
            slot,
            slots: self.slots.clone(),
            max_lag_strikes: self.max_lag_strikes,
        };
        (handle, stream)
    }

    /// Removes a subscriber. Its pending `recv` resolves on the next wakeup.
    pub fn unsubscribe(&self, handle: &SubscriberHandle) {
        if let Some(slot) = lock_unpoisoned(&self.slots).remove(&handle.id) {
            lock_unpoisoned(&slot.queue).closed = true;
            slot.notify.notify_waiters();
            debug!("subscriber {} unregistered", handle.id);
        }
    }

    /// Delivers one decision change to all subscribers. Never blocks; returns
    /// the number of backlogs the decision was appended to.
    pub fn publish(&self, decision: DriveModeDecision) -> usize {
        let mut slots = lock_unpoisoned(&self.slots);
        let mut delivered = 0;
        let mut evicted = Vec::new();

        for (id, slot) in slots.iter() {
            let mut queue = lock_unpoisoned(&slot.queue);
            if queue.closed {
                continue;
            }

            if queue.backlog.len() >= self.queue_capacity {
                queue.backlog.pop_front();
                queue.status.dropped += 1;
                queue.overflow_strikes += 1;
                if !queue.status.lagging {
                    queue.status.lagging = true;
                    warn!("subscriber {} is lagging, dropping its oldest backlog entry", id);
                }
                if queue.overflow_strikes >= self.max_lag_strikes {
                    queue.closed = true;
                    queue.evicted = true;
                    evicted.push(*id);
                    drop(queue);
                    slot.notify.notify_waiters();
                    continue;
                }
            } else {
                queue.overflow_strikes = 0;
            }

            queue.backlog.push_back(decision.clone());
            delivered += 1;
            drop(queue);
            slot.notify.notify_one();
        }

        for id in evicted {
            slots.remove(&id);
            warn!(
                "subscriber {} evicted after {} consecutive overflows",
                id, self.max_lag_strikes
            );
        }

        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        lock_unpoisoned(&self.slots).len()
    }

    /// Status of one subscriber; `None` once it has been removed or evicted.
    pub fn status(&self, handle: &SubscriberHandle) -> Option<SubscriberStatus> {
        lock_unpoisoned(&self.slots)
            .get(&handle.id)
            .map(|slot| lock_unpoisoned(&slot.queue).status.clone())
    }
}

/// Receiving side of one subscription.
///
/// Dropping the stream unregisters the subscriber; the producer stops
/// queueing for it on the next publish.
#[derive(Debug)]
pub struct DecisionStream {
    id: SubscriberId,
    slot: Arc<SlotShared>,
    slots: Arc<Mutex<SlotMap>>,
    max_lag_strikes: u32,
}

impl DecisionStream {
    /// Waits for the next decision change.
    ///
    /// Backlogged entries are drained in order before errors are surfaced,
    /// except eviction, which is reported as soon as it happens.
    pub async fn recv(&mut self) -> Result<DriveModeDecision, FanoutError> {
        loop {
            let notified = self.slot.notify.notified();
            {
                let mut queue = lock_unpoisoned(&self.slot.queue);
                if queue.evicted {
                    return Err(FanoutError::Evicted(self.max_lag_strikes));
                }
                if let Some(decision) = queue.backlog.pop_front() {
                    queue.status.delivered += 1;
                    if queue.backlog.is_empty() {
                        queue.status.lagging = false;
                    }
                    return Ok(decision);
                }
                if queue.closed {
                    return Err(FanoutError::Closed);
                }
            }
            notified.await;
        }
    }
}

impl Drop for DecisionStream {
    fn drop(&mut self) {
        lock_unpoisoned(&self.slots).remove(&self.id);
        lock_unpoisoned(&self.slot.queue).closed = true;
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::event::EmotionLabel;
    use crate::policy::{DriveMode, DriveModeDecision};
    use chrono::Utc;

    fn decision(mode: DriveMode, reason: &str) -> DriveModeDecision {
        DriveModeDecision {
            mode,
            triggering_emotion: EmotionLabel::Sad,
            effective_from: Utc::now(),
            reason: reason.to_string(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_changes_in_emission_order() {
        let fanout = DecisionFanout::new(8, 3);
        let (_handle, mut stream) = fanout.subscribe();

        fanout.publish(decision(DriveMode::Restricted, "first"));
        fanout.publish(decision(DriveMode::Normal, "second"));

        assert_eq!(stream.recv().await.unwrap().reason, "first");
        assert_eq!(stream.recv().await.unwrap().reason, "second");
    }

    #[tokio::test]
    async fn events_before_subscribe_are_not_replayed() {
        let fanout = DecisionFanout::new(8, 3);
        fanout.publish(decision(DriveMode::Restricted, "early"));

        let (_handle, mut stream) = fanout.subscribe();
        fanout.publish(decision(DriveMode::Normal, "late"));

        assert_eq!(stream.recv().await.unwrap().reason, "late");
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_marks_lagging() {
        let fanout = DecisionFanout::new(2, 10);
        let (handle, mut stream) = fanout.subscribe();

        fanout.publish(decision(DriveMode::Restricted, "a"));
        fanout.publish(decision(DriveMode::Normal, "b"));
        fanout.publish(decision(DriveMode::Restricted, "c"));

        let status = fanout.status(&handle).unwrap();
        assert!(status.lagging);
        assert_eq!(status.dropped, 1);

        // Oldest entry went overboard, the rest arrives in order.
        assert_eq!(stream.recv().await.unwrap().reason, "b");
        assert_eq!(stream.recv().await.unwrap().reason, "c");

        // Draining the backlog clears the lagging mark.
        assert!(!fanout.status(&handle).unwrap().lagging);
    }

    #[tokio::test]
    async fn persistent_overflow_evicts_the_subscriber() {
        let fanout = DecisionFanout::new(1, 2);
        let (handle, mut stream) = fanout.subscribe();

        fanout.publish(decision(DriveMode::Restricted, "a"));
        fanout.publish(decision(DriveMode::Normal, "b")); // strike 1
        fanout.publish(decision(DriveMode::Restricted, "c")); // strike 2, evicted

        assert!(fanout.status(&handle).is_none());
        assert_eq!(fanout.subscriber_count(), 0);
        assert!(matches!(stream.recv().await, Err(FanoutError::Evicted(2))));
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_disturb_healthy_peer() {
        let fanout = DecisionFanout::new(1, 2);
        let (_lazy_handle, lazy_stream) = fanout.subscribe();
        let (_handle, mut healthy) = fanout.subscribe();

        for reason in ["a", "b", "c", "d"] {
            fanout.publish(decision(DriveMode::Restricted, reason));
            assert_eq!(healthy.recv().await.unwrap().reason, reason);
        }

        drop(lazy_stream);
    }

    #[tokio::test]
    async fn unsubscribe_wakes_and_closes_the_stream() {
        let fanout = DecisionFanout::new(4, 3);
        let (handle, mut stream) = fanout.subscribe();

        let receiver = tokio::spawn(async move { stream.recv().await });
        tokio::task::yield_now().await;

        fanout.unsubscribe(&handle);
        assert!(matches!(receiver.await.unwrap(), Err(FanoutError::Closed)));
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropping_a_stream_unregisters_it() {
        let fanout = DecisionFanout::new(4, 3);
        let (handle, stream) = fanout.subscribe();
        assert_eq!(fanout.subscriber_count(), 1);

        drop(stream);
        assert_eq!(fanout.subscriber_count(), 0);
        assert!(fanout.status(&handle).is_none());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let fanout = DecisionFanout::new(4, 3);
        assert_eq!(fanout.publish(decision(DriveMode::Normal, "nobody")), 0);
    }
}
