//! The fleet event bus: subscription registry, dispatcher, and durable queue.
//!
//! One [`EventBus`] is constructed at process start and shared by handle;
//! connection handlers, background workers, and the drain tick all talk to the
//! same instance. A single mutex guards the registry and the queue and is
//! never held across an await: dispatch snapshots the matching handlers under
//! the lock, releases it, then invokes them. Re-entrant subscribe/unsubscribe
//! calls from inside a handler therefore cannot corrupt iteration, and a
//! handler may still be invoked once right after its own unsubscribe.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time;
use tracing::{debug, info};
use uuid::Uuid;

use armada_core::{Event, EventType, Subscriber, SubscriberType, Subscription};

/// Async delivery callback. Returning `false` reports a failed delivery to
/// this subscriber; it does not block delivery to others.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, bool> + Send + Sync>;

/// Queue drain cadence: fixed 1-second ticks, unbounded retries, no backoff.
pub const DRAIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Inner {
    handlers: HashMap<Uuid, (Subscriber, EventHandler)>,
    queue: VecDeque<Event>,
}

/// The process-wide publish/subscribe bus.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("event bus lock poisoned")
    }

    /// Register a handler under a fresh subscription id. Never fails.
    pub fn subscribe<F, Fut>(
        &self,
        kind: SubscriberType,
        event_type: EventType,
        id: Option<String>,
        handler: F,
    ) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let subscription = Subscription::new(Subscriber::new(kind, event_type, id));
        let handler: EventHandler = Arc::new(move |event| Box::pin(handler(event)));
        self.inner().handlers.insert(
            subscription.id,
            (subscription.subscriber.clone(), handler),
        );
        debug!(
            subscription = %subscription.id,
            event_type = %event_type,
            "registered subscription"
        );
        subscription
    }

    /// Remove a subscription by id. Removing an unknown id is a no-op.
    pub fn unsubscribe(&self, subscription_id: Uuid) {
        if self.inner().handlers.remove(&subscription_id).is_some() {
            debug!(subscription = %subscription_id, "removed subscription");
        }
    }

    /// The distinct subscribers currently matching an event.
    pub fn subscribers_for(&self, event: &Event) -> Vec<Subscriber> {
        let inner = self.inner();
        let mut seen = HashSet::new();
        inner
            .handlers
            .values()
            .filter(|(subscriber, _)| subscriber.matches(event))
            .filter_map(|(subscriber, _)| seen.insert(subscriber.clone()).then(|| subscriber.clone()))
            .collect()
    }

    /// Deliver an event to every matching handler. Returns `true` iff at least
    /// one subscriber matched and no handler reported failure.
    pub async fn notify(&self, event: &Event) -> bool {
        let matched: Vec<EventHandler> = {
            let inner = self.inner();
            inner
                .handlers
                .values()
                .filter(|(subscriber, _)| subscriber.matches(event))
                .map(|(_, handler)| handler.clone())
                .collect()
        };
        if matched.is_empty() {
            debug!(event_type = %event.kind, "no subscribers, unsuccessful delivery");
            return false;
        }
        let mut success = true;
        for handler in matched {
            if !handler(event.clone()).await {
                success = false;
            }
        }
        success
    }

    /// Append an event to the durable queue; the drain tick delivers it.
    pub fn enqueue(&self, event: Event) {
        self.inner().queue.push_back(event);
    }

    pub fn queue_len(&self) -> usize {
        self.inner().queue.len()
    }

    /// Pop every currently queued event and deliver it. Non-ephemeral events
    /// that fail delivery are re-appended for the next tick; ephemeral ones
    /// are dropped.
    pub async fn drain(&self) {
        let pending: Vec<Event> = self.inner().queue.drain(..).collect();
        if pending.is_empty() {
            return;
        }
        debug!(pending = pending.len(), "draining event queue");
        let mut undelivered = Vec::new();
        for event in pending {
            let delivered = self.notify(&event).await;
            if !delivered && !event.ephemeral {
                undelivered.push(event);
            }
        }
        if !undelivered.is_empty() {
            let mut inner = self.inner();
            for event in undelivered {
                inner.queue.push_back(event);
            }
        }
    }

    /// Drain the queue on a fixed tick, forever.
    pub async fn run_drain_loop(self: Arc<Self>, period: Duration) {
        info!(period_ms = period.as_millis() as u64, "running event queue worker");
        let mut tick = time::interval(period);
        loop {
            tick.tick().await;
            self.drain().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_core::Recipient;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> impl Fn(Event) -> BoxFuture<'static, bool> {
        move |_event| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            })
        }
    }

    fn install_for(id: Option<&str>) -> Event {
        let recipient = match id {
            Some(id) => Recipient::single(SubscriberType::Agent, id),
            None => Recipient::broadcast(SubscriberType::Agent),
        };
        Event::new(EventType::InstallSoftware, Some(recipient), json!({}))
    }

    #[tokio::test]
    async fn test_notify_reaches_matching_subscribers_only() {
        let bus = EventBus::new();
        let hits_a1 = Arc::new(AtomicUsize::new(0));
        let hits_any = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            SubscriberType::Agent,
            EventType::InstallSoftware,
            Some("A1".to_string()),
            counting_handler(hits_a1.clone()),
        );
        bus.subscribe(
            SubscriberType::Agent,
            EventType::InstallSoftware,
            None,
            counting_handler(hits_any.clone()),
        );

        assert!(bus.notify(&install_for(Some("A1"))).await);
        assert!(bus.notify(&install_for(Some("A2"))).await);
        assert!(bus.notify(&install_for(None)).await);

        assert_eq!(hits_a1.load(Ordering::SeqCst), 2); // own id + broadcast
        assert_eq!(hits_any.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_notify_without_subscribers_is_unsuccessful() {
        let bus = EventBus::new();
        assert!(!bus.notify(&install_for(None)).await);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let bus = EventBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            SubscriberType::Agent,
            EventType::InstallSoftware,
            None,
            |_event| async { false },
        );
        bus.subscribe(
            SubscriberType::Agent,
            EventType::InstallSoftware,
            None,
            counting_handler(delivered.clone()),
        );

        assert!(!bus.notify(&install_for(None)).await);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_durable_event_waits_for_a_subscriber() {
        let bus = EventBus::new();
        let mut event = install_for(Some("A1"));
        event.ephemeral = false;
        bus.enqueue(event);

        // A few ticks with nobody listening: the event stays queued.
        bus.drain().await;
        bus.drain().await;
        assert_eq!(bus.queue_len(), 1);

        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            SubscriberType::Agent,
            EventType::InstallSoftware,
            Some("A1".to_string()),
            counting_handler(hits.clone()),
        );
        bus.drain().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_ephemeral_event_dropped_after_one_tick() {
        let bus = EventBus::new();
        bus.enqueue(install_for(Some("A1")));
        assert_eq!(bus.queue_len(), 1);
        bus.drain().await;
        assert_eq!(bus.queue_len(), 0);

        // And it is gone: a late subscriber sees nothing.
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            SubscriberType::Agent,
            EventType::InstallSoftware,
            None,
            counting_handler(hits.clone()),
        );
        bus.drain().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery_and_tolerates_unknown_ids() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let subscription = bus.subscribe(
            SubscriberType::Agent,
            EventType::InstallSoftware,
            None,
            counting_handler(hits.clone()),
        );

        assert!(bus.notify(&install_for(None)).await);
        bus.unsubscribe(subscription.id);
        bus.unsubscribe(subscription.id); // second removal is a no-op
        bus.unsubscribe(Uuid::new_v4());

        assert!(!bus.notify(&install_for(None)).await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reentrant_unsubscribe_during_dispatch() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));

        // The handler tears down its own subscription mid-dispatch. The
        // snapshot means this neither deadlocks nor skips other handlers.
        let bus_handle = bus.clone();
        let own_id = Arc::new(Mutex::new(None::<Uuid>));
        let own_id_handle = own_id.clone();
        let subscription = bus.subscribe(
            SubscriberType::Agent,
            EventType::InstallSoftware,
            None,
            move |_event| {
                let bus = bus_handle.clone();
                let own_id = own_id_handle.clone();
                async move {
                    if let Some(id) = *own_id.lock().unwrap() {
                        bus.unsubscribe(id);
                    }
                    true
                }
            },
        );
        *own_id.lock().unwrap() = Some(subscription.id);
        bus.subscribe(
            SubscriberType::Agent,
            EventType::InstallSoftware,
            None,
            counting_handler(hits.clone()),
        );

        assert!(bus.notify(&install_for(None)).await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Only the surviving subscriber is left.
        let subscribers = bus.subscribers_for(&install_for(None));
        assert_eq!(subscribers.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_for_deduplicates() {
        let bus = EventBus::new();
        bus.subscribe(
            SubscriberType::Agent,
            EventType::InstallSoftware,
            None,
            |_event| async { true },
        );
        bus.subscribe(
            SubscriberType::Agent,
            EventType::InstallSoftware,
            None,
            |_event| async { true },
        );
        assert_eq!(bus.subscribers_for(&install_for(None)).len(), 1);
    }
}
