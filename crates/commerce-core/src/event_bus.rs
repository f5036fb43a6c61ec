//! Event Bus (§4.2).
//!
//! Per-session multi-subscriber pub/sub for progress events. Modeled on the
//! per-client backpressure queue the Transport layer already uses for
//! WebSocket fan-out: each subscriber gets its own bounded, drop-oldest
//! queue so one slow consumer can never stall the publisher or another
//! subscriber.

use commerce_types::{Event, EventPayload};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

struct SubscriberQueue {
    session_id: String,
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn new(session_id: String, capacity: usize) -> Self {
        Self {
            session_id,
            queue: Mutex::new(VecDeque::new()),
            capacity,
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, event: Event) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_waiters();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Pulls the next event, synthesizing a `Dropped` marker first if this
    /// subscriber's queue overflowed since the last call.
    async fn recv(&self) -> Option<Event> {
        loop {
            let dropped = self.dropped.swap(0, Ordering::Relaxed);
            if dropped > 0 {
                return Some(Event {
                    session_id: self.session_id.clone(),
                    run_id: String::new(),
                    timestamp: chrono::Utc::now(),
                    payload: EventPayload::Dropped { count: dropped },
                });
            }

            if let Some(event) = self.queue.lock().pop_front() {
                return Some(event);
            }

            if self.closed.load(Ordering::SeqCst) {
                return None;
            }

            self.notify.notified().await;
        }
    }
}

struct Topic {
    subscribers: DashMap<u64, Arc<SubscriberQueue>>,
}

/// A live subscription to one session's event stream. Dropping it
/// unsubscribes.
pub struct Subscription {
    session_id: String,
    id: u64,
    queue: Arc<SubscriberQueue>,
    bus: EventBus,
}

impl Subscription {
    pub async fn recv(&self) -> Option<Event> {
        self.queue.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.session_id, self.id);
    }
}

#[derive(Clone)]
pub struct EventBus {
    topics: Arc<DashMap<String, Topic>>,
    buffer_capacity: usize,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            buffer_capacity,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Non-blocking: delivers to every current subscriber's queue and
    /// returns immediately regardless of how full those queues are.
    pub fn publish(&self, session_id: &str, event: Event) {
        if let Some(topic) = self.topics.get(session_id) {
            for sub in topic.subscribers.iter() {
                sub.value().push(event.clone());
            }
        }
    }

    /// Valid even if the session doesn't exist yet; the subscriber simply
    /// receives whatever is published from this point on.
    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let topic_entry = self
            .topics
            .entry(session_id.to_string())
            .or_insert_with(|| Topic {
                subscribers: DashMap::new(),
            });
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(session_id.to_string(), self.buffer_capacity));
        topic_entry.subscribers.insert(id, queue.clone());

        Subscription {
            session_id: session_id.to_string(),
            id,
            queue,
            bus: self.clone(),
        }
    }

    fn unsubscribe(&self, session_id: &str, id: u64) {
        if let Some(topic) = self.topics.get(session_id) {
            topic.subscribers.remove(&id);
            let empty = topic.subscribers.is_empty();
            drop(topic);
            if empty {
                self.topics.remove(session_id);
            }
        }
    }

    /// Closes every subscriber queue for a session, waking any pending
    /// `recv()` calls with `None` so WebSocket handlers can exit cleanly.
    pub fn close_session(&self, session_id: &str) {
        if let Some(topic) = self.topics.get(session_id) {
            for sub in topic.subscribers.iter() {
                sub.value().close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commerce_types::StageStatus;

    fn stage_update_event(session_id: &str, n: u32) -> Event {
        Event {
            session_id: session_id.to_string(),
            run_id: "r1".to_string(),
            timestamp: chrono::Utc::now(),
            payload: EventPayload::StageUpdate {
                stage_id: commerce_types::StageId::Search,
                status: StageStatus::Processing,
                message: Some(format!("tick {n}")),
                data: None,
            },
        }
    }

    #[tokio::test]
    async fn late_subscriber_sees_only_future_events() {
        let bus = EventBus::new(8);
        bus.publish("s1", stage_update_event("s1", 0));

        let sub = bus.subscribe("s1");
        bus.publish("s1", stage_update_event("s1", 1));

        let received = sub.recv().await.unwrap();
        match received.payload {
            EventPayload::StageUpdate { message, .. } => {
                assert_eq!(message, Some("tick 1".to_string()));
            }
            _ => panic!("unexpected payload"),
        }
    }

    #[tokio::test]
    async fn overflow_emits_dropped_marker_before_next_real_event() {
        let bus = EventBus::new(2);
        let sub = bus.subscribe("s1");

        for n in 0..5 {
            bus.publish("s1", stage_update_event("s1", n));
        }

        let first = sub.recv().await.unwrap();
        match first.payload {
            EventPayload::Dropped { count } => assert_eq!(count, 3),
            other => panic!("expected Dropped marker, got {other:?}"),
        }

        let second = sub.recv().await.unwrap();
        assert!(matches!(second.payload, EventPayload::StageUpdate { .. }));
    }

    #[tokio::test]
    async fn unsubscribe_drops_cleanly() {
        let bus = EventBus::new(8);
        {
            let _sub = bus.subscribe("s1");
            assert!(bus.topics.contains_key("s1"));
        }
        assert!(!bus.topics.contains_key("s1"));
    }

    #[tokio::test]
    async fn subscribe_before_session_exists_is_valid() {
        let bus = EventBus::new(8);
        let sub = bus.subscribe("never-created-yet");
        bus.publish("never-created-yet", stage_update_event("never-created-yet", 0));
        assert!(sub.recv().await.is_some());
    }
}
