//! Event fan-out with bounded per-subscription buffers.
//!
//! Every subscription owns a bounded queue. A slow consumer only affects its
//! own queue; the publisher never blocks longer than the configured overflow
//! policy allows. Dropped events are counted per subscription and observable
//! through [`Subscription::dropped_events`].

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, SendTimeoutError, TrySendError};
use futures::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::config::{EventBusConfig, OverflowPolicy};
use crate::model::DeviceEvent;

/// Shared event bus. Cloning is cheap and clones publish to the same
/// subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    config: EventBusConfig,
    senders: Mutex<Vec<SubscriptionSender>>,
    shared: Mutex<Vec<SharedEntry>>,
    wake_tx: Sender<()>,
    next_id: AtomicU64,
}

/// Publisher-side view of one subscription queue. The receiver clone lets
/// the publisher discard the oldest element when the queue is full.
struct SubscriptionSender {
    id: u64,
    tx: Sender<DeviceEvent>,
    rx: Receiver<DeviceEvent>,
    dropped: Arc<AtomicU64>,
}

impl SubscriptionSender {
    /// Pushes one event; returns false when the subscriber is gone.
    fn push(&self, policy: OverflowPolicy, event: &DeviceEvent) -> bool {
        match policy {
            OverflowPolicy::DropOldest => loop {
                match self.tx.try_send(event.clone()) {
                    Ok(()) => return true,
                    Err(TrySendError::Full(_)) => {
                        // Pop the oldest and retry. A racing consumer may have
                        // emptied the queue already; the retry succeeds then.
                        if self.rx.try_recv().is_ok() {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            debug!(subscription = self.id, "Event buffer full, dropped oldest event");
                        }
                    }
                    Err(TrySendError::Disconnected(_)) => return false,
                }
            },
            OverflowPolicy::BlockWithTimeout(timeout) => {
                match self.tx.send_timeout(event.clone(), timeout) {
                    Ok(()) => true,
                    Err(SendTimeoutError::Timeout(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            subscription = self.id,
                            timeout_ms = timeout.as_millis() as u64,
                            "Subscriber did not drain in time, dropped event"
                        );
                        true
                    }
                    Err(SendTimeoutError::Disconnected(_)) => false,
                }
            }
        }
    }
}

/// Callback served by the shared dispatch thread.
struct SharedEntry {
    id: u64,
    rx: Receiver<DeviceEvent>,
    callback: Arc<dyn Fn(DeviceEvent) + Send + Sync>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        let inner = Arc::new(BusInner {
            config,
            senders: Mutex::new(Vec::new()),
            shared: Mutex::new(Vec::new()),
            wake_tx,
            next_id: AtomicU64::new(0),
        });
        spawn_dispatcher(Arc::downgrade(&inner), wake_rx);
        Self { inner }
    }

    /// Publishes one event to every live subscription.
    ///
    /// The senders lock is held for the whole fan-out, so concurrent
    /// publishers cannot interleave within one event and all subscribers
    /// observe the same event order.
    pub fn publish(&self, event: DeviceEvent) {
        {
            let mut senders = self.inner.senders.lock().unwrap();
            let policy = self.inner.config.overflow;
            senders.retain(|sub| sub.push(policy, &event));
        }
        let _ = self.inner.wake_tx.try_send(());
    }

    /// Registers a callback on the shared dispatch thread.
    ///
    /// Callbacks here share one thread; a callback that blocks delays the
    /// other shared callbacks (use [`subscribe_sync`] for blocking work).
    ///
    /// [`subscribe_sync`]: EventBus::subscribe_sync
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(DeviceEvent) + Send + Sync + 'static,
    {
        let (subscription, rx) = self.subscribe_queue();
        self.inner.shared.lock().unwrap().push(SharedEntry {
            id: subscription.id,
            rx,
            callback: Arc::new(callback),
        });
        let _ = self.inner.wake_tx.try_send(());
        subscription
    }

    /// Registers a callback with its own dedicated thread, so it may block
    /// without affecting other subscribers.
    pub fn subscribe_sync<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(DeviceEvent) + Send + 'static,
    {
        let (subscription, rx) = self.subscribe_queue();
        let mut callback = callback;
        thread::Builder::new()
            .name(format!("event-sub-{}", subscription.id))
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    callback(event);
                }
            })
            .expect("spawn event subscriber thread");
        subscription
    }

    /// Returns an async stream of events.
    pub fn events(&self) -> EventStream {
        let (subscription, rx) = self.subscribe_queue();
        // The overflow policy applies at the subscription queue; this stage
        // only bridges into async land.
        let (tx, out_rx) = tokio::sync::mpsc::channel(16);
        thread::Builder::new()
            .name("event-stream".to_string())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    if tx.blocking_send(event).is_err() {
                        break;
                    }
                }
            })
            .expect("spawn event stream thread");
        EventStream {
            subscription,
            inner: ReceiverStream::new(out_rx),
        }
    }

    /// Registers a bare queue subscription and hands back its receiver.
    pub(crate) fn subscribe_queue(&self) -> (Subscription, Receiver<DeviceEvent>) {
        let capacity = self.inner.config.buffer_capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicU64::new(0));
        self.inner.senders.lock().unwrap().push(SubscriptionSender {
            id,
            tx,
            rx: rx.clone(),
            dropped: dropped.clone(),
        });
        let subscription = Subscription {
            bus: Arc::downgrade(&self.inner),
            id,
            dropped,
        };
        (subscription, rx)
    }
}

fn spawn_dispatcher(bus: Weak<BusInner>, wake_rx: Receiver<()>) {
    thread::Builder::new()
        .name("event-dispatch".to_string())
        .spawn(move || loop {
            match wake_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            let Some(inner) = bus.upgrade() else { break };
            // Snapshot the callbacks so they run without the lock held;
            // a callback may subscribe or unsubscribe.
            let entries: Vec<_> = {
                let shared = inner.shared.lock().unwrap();
                shared
                    .iter()
                    .map(|e| (e.rx.clone(), e.callback.clone()))
                    .collect()
            };
            drop(inner);
            for (rx, callback) in entries {
                while let Ok(event) = rx.try_recv() {
                    callback(event);
                }
            }
        })
        .expect("spawn event dispatch thread");
}

/// Handle to an active subscription. Dropping it unsubscribes.
pub struct Subscription {
    bus: Weak<BusInner>,
    id: u64,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Number of events dropped on this subscription because its buffer
    /// was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.senders.lock().unwrap().retain(|s| s.id != self.id);
            inner.shared.lock().unwrap().retain(|s| s.id != self.id);
        }
    }
}

/// Async stream of device events, backed by a queue subscription.
pub struct EventStream {
    subscription: Subscription,
    inner: ReceiverStream<DeviceEvent>,
}

impl EventStream {
    pub fn dropped_events(&self) -> u64 {
        self.subscription.dropped_events()
    }
}

impl Stream for EventStream {
    type Item = DeviceEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Device, DeviceId};
    use chrono::Utc;
    use std::time::Instant;

    fn added(id: &str) -> DeviceEvent {
        DeviceEvent::Added {
            device: Device::new(id, format!("Device {id}"), "mock"),
            at: Utc::now(),
        }
    }

    fn removed(id: &str) -> DeviceEvent {
        DeviceEvent::Removed {
            id: DeviceId::new(id),
            reason: Some("lost".to_string()),
            at: Utc::now(),
        }
    }

    #[test]
    fn shared_callback_receives_events() {
        let bus = EventBus::new(EventBusConfig::default());
        let (tx, rx) = crossbeam_channel::unbounded();
        let _sub = bus.subscribe(move |event| {
            tx.send(event).unwrap();
        });

        bus.publish(added("a"));
        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event.device_id().as_str(), "a");
    }

    #[test]
    fn sync_subscriber_may_block_without_stalling_publish() {
        let bus = EventBus::new(EventBusConfig::default());
        let (tx, rx) = crossbeam_channel::unbounded();
        let _sub = bus.subscribe_sync(move |event: DeviceEvent| {
            thread::sleep(Duration::from_millis(100));
            tx.send(event).unwrap();
        });

        let start = Instant::now();
        bus.publish(added("a"));
        bus.publish(added("b"));
        assert!(start.elapsed() < Duration::from_millis(50));

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap().device_id().as_str(),
            "a"
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap().device_id().as_str(),
            "b"
        );
    }

    #[test]
    fn drop_oldest_discards_head_and_counts() {
        let bus = EventBus::new(EventBusConfig::default().with_buffer_capacity(2));
        let (sub, rx) = bus.subscribe_queue();

        for id in ["a", "b", "c", "d", "e"] {
            bus.publish(added(id));
        }

        assert_eq!(sub.dropped_events(), 3);
        assert_eq!(rx.try_recv().unwrap().device_id().as_str(), "d");
        assert_eq!(rx.try_recv().unwrap().device_id().as_str(), "e");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn block_with_timeout_waits_then_drops_newest() {
        let bus = EventBus::new(
            EventBusConfig::default()
                .with_buffer_capacity(1)
                .with_overflow(OverflowPolicy::BlockWithTimeout(Duration::from_millis(100))),
        );
        let (sub, rx) = bus.subscribe_queue();

        bus.publish(added("a"));
        let start = Instant::now();
        bus.publish(added("b"));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(sub.dropped_events(), 1);

        // The buffered event is the first one; the newest was dropped.
        assert_eq!(rx.try_recv().unwrap().device_id().as_str(), "a");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(EventBusConfig::default());
        let (tx, rx) = crossbeam_channel::unbounded();
        let sub = bus.subscribe(move |event| {
            let _ = tx.send(event);
        });

        bus.publish(added("a"));
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        sub.unsubscribe();
        bus.publish(added("b"));
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn subscribers_see_the_same_order() {
        let bus = EventBus::new(EventBusConfig::default());
        let (_sub_a, rx_a) = bus.subscribe_queue();
        let (_sub_b, rx_b) = bus.subscribe_queue();

        bus.publish(added("a"));
        bus.publish(removed("a"));
        bus.publish(added("b"));

        for rx in [rx_a, rx_b] {
            let ids: Vec<String> = (0..3)
                .map(|_| rx.try_recv().unwrap().device_id().as_str().to_string())
                .collect();
            assert_eq!(ids, ["a", "a", "b"]);
        }
    }

    #[tokio::test]
    async fn event_stream_yields_in_order() {
        use futures::StreamExt;

        let bus = EventBus::new(EventBusConfig::default());
        let mut stream = bus.events();

        bus.publish(added("a"));
        bus.publish(added("b"));

        let first = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.device_id().as_str(), "a");
        assert_eq!(second.device_id().as_str(), "b");
        assert_eq!(stream.dropped_events(), 0);
    }
}
