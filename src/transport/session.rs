use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;
use tokio::sync::Notify;
use uuid::Uuid;

/// Per-session cap on queued notification frames before drop-oldest applies.
pub const SESSION_NOTIFICATION_BOUND: usize = 1024;

#[derive(Debug)]
enum Frame {
    Response(String),
    Notification(String),
}

impl Frame {
    fn into_text(self) -> String {
        match self {
            Self::Response(text) | Self::Notification(text) => text,
        }
    }
}

#[derive(Debug, Default)]
struct FrameQueue {
    frames: VecDeque<Frame>,
    queued_notifications: usize,
}

/// Ordered outbound frame queue with per-session backpressure.
///
/// Responses are never dropped. Notifications beyond the bound evict the
/// oldest queued notification, so a slow client falls behind on events
/// without stalling the publishers or losing replies.
#[derive(Debug)]
pub struct OutboundQueue {
    inner: Mutex<FrameQueue>,
    notify: Notify,
    notification_bound: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl OutboundQueue {
    #[must_use]
    pub fn new(notification_bound: usize) -> Self {
        Self {
            inner: Mutex::new(FrameQueue::default()),
            notify: Notify::new(),
            notification_bound,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueues a response frame. Responses bypass the notification bound.
    pub fn push_response(&self, frame: String) {
        let mut inner = self.inner.lock().expect("outbound queue lock poisoned");
        inner.frames.push_back(Frame::Response(frame));
        drop(inner);
        self.notify.notify_one();
    }

    /// Enqueues a notification frame, evicting the oldest queued
    /// notification once the bound is reached.
    pub fn push_notification(&self, frame: String) {
        let mut inner = self.inner.lock().expect("outbound queue lock poisoned");
        if inner.queued_notifications >= self.notification_bound {
            let oldest = inner
                .frames
                .iter()
                .position(|frame| matches!(frame, Frame::Notification(_)));
            if let Some(index) = oldest {
                inner.frames.remove(index);
                inner.queued_notifications -= 1;
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        inner.frames.push_back(Frame::Notification(frame));
        inner.queued_notifications += 1;
        drop(inner);
        self.notify.notify_one();
    }

    /// Dequeues the next frame in submission order, waiting when empty.
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().expect("outbound queue lock poisoned");
                if let Some(frame) = inner.frames.pop_front() {
                    if matches!(frame, Frame::Notification(_)) {
                        inner.queued_notifications -= 1;
                    }
                    return Some(frame.into_text());
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks the queue closed and wakes any pending `pop`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Total notifications evicted because the client fell behind.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("outbound queue lock poisoned")
            .frames
            .len()
    }
}

/// One accepted client connection.
#[derive(Debug)]
pub struct SessionHandle {
    id: Uuid,
    origin: Option<String>,
    connected_at: OffsetDateTime,
    outbound: OutboundQueue,
    subscriptions: Mutex<HashSet<String>>,
}

impl SessionHandle {
    #[must_use]
    pub fn new(origin: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin,
            connected_at: OffsetDateTime::now_utc(),
            outbound: OutboundQueue::new(SESSION_NOTIFICATION_BOUND),
            subscriptions: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    #[must_use]
    pub fn connected_at(&self) -> OffsetDateTime {
        self.connected_at
    }

    #[must_use]
    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// Registers this session on `stream`. Returns whether it was new.
    pub fn subscribe(&self, stream: &str) -> bool {
        self.subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .insert(stream.to_owned())
    }

    /// Removes this session from `stream`. Returns whether it was present.
    pub fn unsubscribe(&self, stream: &str) -> bool {
        self.subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .remove(stream)
    }

    #[must_use]
    pub fn is_subscribed(&self, stream: &str) -> bool {
        self.subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .contains(stream)
    }

    /// Clears every subscription; part of session teardown.
    pub fn unsubscribe_all(&self) {
        self.subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .clear();
    }
}

/// Tracks live sessions and enforces the admission cap.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, Arc<SessionHandle>>>,
    max_connections: AtomicUsize,
    dropped_total: AtomicU64,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(max_connections: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_connections: AtomicUsize::new(max_connections),
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Admits a new session, or rejects it when the cap is reached.
    pub fn try_admit(&self, origin: Option<String>) -> Option<Arc<SessionHandle>> {
        let mut sessions = self.sessions.lock().expect("session registry lock poisoned");
        if sessions.len() >= self.max_connections.load(Ordering::Relaxed) {
            return None;
        }
        let handle = Arc::new(SessionHandle::new(origin));
        sessions.insert(handle.id(), Arc::clone(&handle));
        Some(handle)
    }

    /// Removes a session, closing its outbound queue and clearing its
    /// subscriptions. Safe to call twice.
    pub fn remove(&self, session_id: Uuid) {
        let handle = self
            .sessions
            .lock()
            .expect("session registry lock poisoned")
            .remove(&session_id);
        if let Some(handle) = handle {
            self.dropped_total
                .fetch_add(handle.outbound().dropped(), Ordering::Relaxed);
            handle.unsubscribe_all();
            handle.outbound().close();
        }
    }

    #[must_use]
    pub fn get(&self, session_id: Uuid) -> Option<Arc<SessionHandle>> {
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .get(&session_id)
            .cloned()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .len()
    }

    /// Applies a new admission cap; existing sessions are unaffected.
    pub fn set_max_connections(&self, max_connections: usize) {
        self.max_connections
            .store(max_connections, Ordering::Relaxed);
    }

    /// Pushes a notification frame to every session subscribed to `stream`.
    pub fn broadcast_to_stream(&self, stream: &str, frame: &str) {
        let handles: Vec<Arc<SessionHandle>> = self
            .sessions
            .lock()
            .expect("session registry lock poisoned")
            .values()
            .cloned()
            .collect();
        for handle in handles {
            if handle.is_subscribed(stream) {
                handle.outbound().push_notification(frame.to_owned());
            }
        }
    }

    /// Notifications dropped across all sessions, past and present.
    #[must_use]
    pub fn dropped_notifications(&self) -> u64 {
        let live: u64 = self
            .sessions
            .lock()
            .expect("session registry lock poisoned")
            .values()
            .map(|handle| handle.outbound().dropped())
            .sum();
        self.dropped_total.load(Ordering::Relaxed) + live
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn pop_preserves_submission_order() {
        let queue = OutboundQueue::new(8);
        queue.push_notification("n1".to_owned());
        queue.push_response("r1".to_owned());
        queue.push_notification("n2".to_owned());

        assert_eq!(Some("n1".to_owned()), queue.pop().await);
        assert_eq!(Some("r1".to_owned()), queue.pop().await);
        assert_eq!(Some("n2".to_owned()), queue.pop().await);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_notification_only() {
        let queue = OutboundQueue::new(2);
        queue.push_response("r1".to_owned());
        queue.push_notification("n1".to_owned());
        queue.push_notification("n2".to_owned());
        queue.push_notification("n3".to_owned());

        assert_eq!(1, queue.dropped());
        assert_eq!(3, queue.len());
        assert_eq!(Some("r1".to_owned()), queue.pop().await);
        assert_eq!(Some("n2".to_owned()), queue.pop().await);
        assert_eq!(Some("n3".to_owned()), queue.pop().await);
    }

    #[tokio::test]
    async fn closed_empty_queue_pops_none() {
        let queue = OutboundQueue::new(2);
        queue.push_response("r1".to_owned());
        queue.close();
        assert_eq!(Some("r1".to_owned()), queue.pop().await);
        assert_eq!(None, queue.pop().await);
    }

    #[test]
    fn admission_cap_is_enforced() {
        let registry = SessionRegistry::new(2);
        let first = registry.try_admit(None).expect("first session admitted");
        let _second = registry.try_admit(None).expect("second session admitted");
        assert!(registry.try_admit(None).is_none());

        registry.remove(first.id());
        assert!(registry.try_admit(None).is_some());
    }

    #[test]
    fn broadcast_reaches_subscribed_sessions_only() {
        let registry = SessionRegistry::new(4);
        let watcher = registry.try_admit(None).expect("watcher admitted");
        let bystander = registry.try_admit(None).expect("bystander admitted");
        watcher.subscribe("all");

        registry.broadcast_to_stream("all", "frame");
        assert_eq!(1, watcher.outbound().len());
        assert_eq!(0, bystander.outbound().len());
    }

    #[test]
    fn removal_accumulates_dropped_counters() {
        let registry = SessionRegistry::new(4);
        let handle = registry.try_admit(None).expect("session admitted");
        handle.subscribe("all");
        for index in 0..(SESSION_NOTIFICATION_BOUND + 5) {
            handle.outbound().push_notification(format!("n{index}"));
        }
        assert_eq!(5, registry.dropped_notifications());
        registry.remove(handle.id());
        assert_eq!(5, registry.dropped_notifications());
    }
}
