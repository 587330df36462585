//! Event fan-out. Committed events land in a bounded in-memory ring;
//! each subscriber gets its own forwarding task and bounded queue, so a
//! stalled consumer never blocks the pipeline or other subscribers.
//! Subscribers resuming from an old cursor catch up from the ring when
//! possible and fall back to the store otherwise.

use crate::config::SharedTunables;
use crate::store::{EventRecord, Store};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

const STORE_BATCH: u32 = 64;
/// How long a disconnect notice waits for queue room before being dropped.
const NOTICE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The subscriber fell further behind than the configured lag bound
    /// while its queue was full.
    Backpressure,
}

#[derive(Debug, Clone)]
pub enum Delivery {
    Event(EventRecord),
    /// Final message before the channel closes.
    Disconnected(DisconnectReason),
}

pub struct Subscription {
    pub id: Uuid,
    pub events: mpsc::Receiver<Delivery>,
}

#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

struct Inner {
    store: Store,
    ring: RwLock<VecDeque<EventRecord>>,
    ring_capacity: usize,
    latest: watch::Sender<i64>,
    subscribers: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
    tunables: SharedTunables,
}

impl Broadcaster {
    pub fn new(
        store: Store,
        ring_capacity: usize,
        last_event_id: i64,
        tunables: SharedTunables,
    ) -> Self {
        let (latest, _) = watch::channel(last_event_id);
        Self {
            inner: Arc::new(Inner {
                store,
                ring: RwLock::new(VecDeque::with_capacity(ring_capacity)),
                ring_capacity,
                latest,
                subscribers: Mutex::new(HashMap::new()),
                tunables,
            }),
        }
    }

    /// Make a committed event visible to subscribers. Events must arrive
    /// in id order; the writer is the only caller.
    pub fn publish(&self, event: EventRecord) {
        let id = event.id;
        {
            let mut ring = self.inner.ring.write().unwrap_or_else(|e| e.into_inner());
            ring.push_back(event);
            while ring.len() > self.inner.ring_capacity {
                ring.pop_front();
            }
        }
        self.inner.latest.send_replace(id);
    }

    /// Open a subscription. `from` is the last event id the subscriber has
    /// already seen; `None` starts live, past events skipped.
    pub fn subscribe(&self, from: Option<i64>, queue: usize) -> Subscription {
        let id = Uuid::new_v4();
        let cursor = from.unwrap_or(*self.inner.latest.borrow());
        let (tx, rx) = mpsc::channel(queue.max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, cancel_tx);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_subscriber(&inner, cursor, tx, cancel_rx).await;
            inner.subscribers.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
        });
        tracing::debug!(subscriber = %id, cursor, "subscriber attached");
        Subscription { id, events: rx }
    }

    pub fn unsubscribe(&self, id: Uuid) {
        if let Some(cancel) = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
        {
            let _ = cancel.send(true);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

async fn run_subscriber(
    inner: &Inner,
    mut cursor: i64,
    tx: mpsc::Sender<Delivery>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut latest_rx = inner.latest.subscribe();
    loop {
        let latest = *latest_rx.borrow_and_update();
        if cursor >= latest {
            tokio::select! {
                changed = latest_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = cancel.changed() => return,
            }
            continue;
        }

        let batch = match batch_after(inner, cursor).await {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(error = %e, "subscriber catch-up read failed");
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }
        };
        if batch.is_empty() {
            // Gap below the ring with nothing in the store (pruned data).
            cursor = latest.min(cursor + STORE_BATCH as i64);
            continue;
        }
        for event in batch {
            let next = event.id;
            match tx.try_send(Delivery::Event(event)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => return,
                Err(mpsc::error::TrySendError::Full(delivery)) => {
                    // A full queue means the consumer has stalled. While the
                    // lag stays within bound, wait for room and re-check on
                    // every publish; past the bound the subscriber is cut
                    // loose rather than buffered without bound. A draining
                    // queue is normal catch-up.
                    let sent = loop {
                        let max_lag = inner.tunables.get().max_subscriber_lag as i64;
                        if *latest_rx.borrow_and_update() - cursor > max_lag {
                            break false;
                        }
                        tokio::select! {
                            permit = tx.reserve() => match permit {
                                Ok(permit) => {
                                    permit.send(delivery);
                                    break true;
                                }
                                Err(_) => return,
                            },
                            changed = latest_rx.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                            }
                            _ = cancel.changed() => return,
                        }
                    };
                    if !sent {
                        let lag = *latest_rx.borrow() - cursor;
                        tracing::info!(lag, "disconnecting lagging subscriber");
                        // Best effort: a consumer that stopped reading
                        // entirely must not pin this task forever.
                        let notice = Delivery::Disconnected(DisconnectReason::Backpressure);
                        tokio::select! {
                            _ = tx.send(notice) => {}
                            _ = cancel.changed() => {}
                            _ = tokio::time::sleep(NOTICE_TIMEOUT) => {
                                tracing::debug!("disconnect notice dropped, consumer not reading");
                            }
                        }
                        return;
                    }
                }
            }
            cursor = next;
        }
    }
}

/// Events with id > cursor, from the ring when it still covers the cursor,
/// otherwise from the store.
async fn batch_after(inner: &Inner, cursor: i64) -> Result<Vec<EventRecord>, crate::store::StoreError> {
    {
        let ring = inner.ring.read().unwrap_or_else(|e| e.into_inner());
        if let Some(front) = ring.front() {
            if cursor + 1 >= front.id {
                return Ok(ring.iter().filter(|e| e.id > cursor).cloned().collect());
            }
        }
    }
    inner.store.range(cursor, STORE_BATCH).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tunables;
    use crate::store::NewEvent;
    use chrono::Utc;
    use mirador_core::types::EventKind;

    fn no_crop() -> Option<fn(i64) -> std::io::Result<String>> {
        None
    }

    async fn append_one(store: &Store) -> EventRecord {
        store
            .append(
                NewEvent {
                    kind: EventKind::Recognized,
                    camera_id: "cam1".into(),
                    identity_id: Some("alice".into()),
                    label: Some("Alice".into()),
                    track_id: None,
                    confidence: 0.9,
                    crop_missing: false,
                    ts: Utc::now(),
                },
                no_crop(),
            )
            .await
            .unwrap()
    }

    fn tunables(max_lag: u64) -> SharedTunables {
        SharedTunables::new(Tunables { max_subscriber_lag: max_lag, ..Tunables::default() })
    }

    #[tokio::test]
    async fn live_subscriber_receives_in_order() {
        let store = Store::open_in_memory().await.unwrap();
        let broadcaster = Broadcaster::new(store.clone(), 16, 0, tunables(500));
        let mut sub = broadcaster.subscribe(None, 8);

        let mut expected = Vec::new();
        for _ in 0..3 {
            let event = append_one(&store).await;
            expected.push(event.id);
            broadcaster.publish(event);
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            match sub.events.recv().await.unwrap() {
                Delivery::Event(e) => seen.push(e.id),
                Delivery::Disconnected(r) => panic!("unexpected disconnect: {r:?}"),
            }
        }
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn catch_up_spans_ring_and_store() {
        let store = Store::open_in_memory().await.unwrap();
        // Ring of 2: older events must come back from the store.
        let broadcaster = Broadcaster::new(store.clone(), 2, 0, tunables(500));

        let mut expected = Vec::new();
        for _ in 0..5 {
            let event = append_one(&store).await;
            expected.push(event.id);
            broadcaster.publish(event);
        }

        let mut sub = broadcaster.subscribe(Some(0), 8);
        let mut seen = Vec::new();
        for _ in 0..5 {
            match sub.events.recv().await.unwrap() {
                Delivery::Event(e) => seen.push(e.id),
                Delivery::Disconnected(r) => panic!("unexpected disconnect: {r:?}"),
            }
        }
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn stalled_subscriber_disconnects_without_hurting_others() {
        let store = Store::open_in_memory().await.unwrap();
        let broadcaster = Broadcaster::new(store.clone(), 64, 0, tunables(3));

        let mut slow = broadcaster.subscribe(None, 1);
        let mut fast = broadcaster.subscribe(None, 64);

        let total = 20;
        let mut expected = Vec::new();
        for _ in 0..total {
            let event = append_one(&store).await;
            expected.push(event.id);
            broadcaster.publish(event);
        }

        // The fast subscriber sees everything.
        let mut fast_seen = Vec::new();
        for _ in 0..total {
            match fast.events.recv().await.unwrap() {
                Delivery::Event(e) => fast_seen.push(e.id),
                Delivery::Disconnected(r) => panic!("fast subscriber disconnected: {r:?}"),
            }
        }
        assert_eq!(fast_seen, expected);

        // The slow one gets whatever was buffered, then a disconnect
        // notice, then end of stream.
        let mut disconnected = false;
        while let Some(delivery) = slow.events.recv().await {
            match delivery {
                Delivery::Event(_) => assert!(!disconnected),
                Delivery::Disconnected(DisconnectReason::Backpressure) => disconnected = true,
            }
        }
        assert!(disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn unread_subscriber_does_not_pin_its_task() {
        let store = Store::open_in_memory().await.unwrap();
        let broadcaster = Broadcaster::new(store.clone(), 64, 0, tunables(1));

        // Held open but never read: queue of 1 fills immediately.
        let _sub = broadcaster.subscribe(None, 1);
        for _ in 0..5 {
            let event = append_one(&store).await;
            broadcaster.publish(event);
        }

        // Once the notice timeout lapses the forwarding task gives up and
        // detaches, even though the consumer never drained the queue.
        for _ in 0..100 {
            if broadcaster.subscriber_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_channel() {
        let store = Store::open_in_memory().await.unwrap();
        let broadcaster = Broadcaster::new(store.clone(), 16, 0, tunables(500));
        let mut sub = broadcaster.subscribe(None, 8);
        assert_eq!(broadcaster.subscriber_count(), 1);

        broadcaster.unsubscribe(sub.id);
        assert!(sub.events.recv().await.is_none());
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}
