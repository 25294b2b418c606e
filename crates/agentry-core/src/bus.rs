//! Ordered, bounded, in-process publish/subscribe event bus.
//!
//! Every published event gets the next sequence number and is delivered to
//! each matching subscriber in publish order. Subscriber buffers are bounded;
//! a full buffer makes `publish` wait rather than drop the event.
//!
//! # Usage
//!
//! ```rust,ignore
//! use agentry_core::bus::{EventBus, EventFilter};
//!
//! let bus = Arc::new(EventBus::new(run_id));
//! let mut steps = bus.subscribe(EventFilter::by_type("build.step.completed")).await?;
//! bus.publish(event).await?;
//! let next = steps.recv().await;
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::domain::{EngineError, Event, Result};
use crate::metrics::METRICS;

/// Default per-subscriber buffer size.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Default number of events kept in the history ring.
pub const DEFAULT_HISTORY: usize = 10_000;

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Predicate deciding which events a subscriber receives.
#[derive(Clone)]
pub struct EventFilter(Arc<dyn Fn(&Event) -> bool + Send + Sync>);

impl EventFilter {
    pub fn new(predicate: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    /// Every event.
    pub fn all() -> Self {
        Self::new(|_| true)
    }

    /// Events with exactly this type.
    pub fn by_type(event_type: impl Into<String>) -> Self {
        let event_type = event_type.into();
        Self::new(move |e| e.event_type == event_type)
    }

    /// Events whose type starts with `prefix` (e.g. `resource.`).
    pub fn by_prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self::new(move |e| e.event_type.starts_with(&prefix))
    }

    /// Events emitted by or addressed to one agent.
    pub fn by_agent(agent_id: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self::new(move |e| e.agent_id.as_deref() == Some(agent_id.as_str()))
    }

    pub fn matches(&self, event: &Event) -> bool {
        (self.0)(event)
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventFilter(..)")
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Identifies one subscription on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving end of a subscription. Ends once the bus is closed and drained.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next matching event, or `None` after the bus closed and the buffer drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Event counts observed by the bus.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusSummary {
    pub total_events: u64,
    pub by_type: BTreeMap<String, u64>,
}

struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    tx: mpsc::Sender<Event>,
}

struct BusState {
    next_seq: u64,
    next_subscriber: u64,
    subscribers: Vec<Subscriber>,
    history: VecDeque<Event>,
    summary: BusSummary,
    closed: bool,
}

/// Publish/subscribe bus for one run.
pub struct EventBus {
    run_id: Uuid,
    capacity: usize,
    history_limit: usize,
    // Held across subscriber sends so that every subscriber observes the
    // same order as the sequence numbers.
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new(run_id: Uuid) -> Self {
        Self::with_capacity(run_id, DEFAULT_CAPACITY)
    }

    /// Bus whose subscriber buffers hold at most `capacity` events.
    pub fn with_capacity(run_id: Uuid, capacity: usize) -> Self {
        Self {
            run_id,
            capacity: capacity.max(1),
            history_limit: DEFAULT_HISTORY,
            state: Mutex::new(BusState {
                next_seq: 1,
                next_subscriber: 1,
                subscribers: Vec::new(),
                history: VecDeque::new(),
                summary: BusSummary::default(),
                closed: false,
            }),
        }
    }

    /// Override the history ring size.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register a subscriber. Only events published afterwards are delivered.
    pub async fn subscribe(&self, filter: EventFilter) -> Result<Subscription> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(EngineError::BusClosed);
        }
        let id = SubscriptionId(state.next_subscriber);
        state.next_subscriber += 1;
        let (tx, rx) = mpsc::channel(self.capacity);
        state.subscribers.push(Subscriber { id, filter, tx });
        debug!(subscription = id.0, "bus subscriber registered");
        Ok(Subscription { id, rx })
    }

    /// Publish to every matching subscriber. Returns the assigned sequence number.
    pub async fn publish(&self, event: Event) -> Result<u64> {
        self.deliver(event, None).await
    }

    /// Publish to every matching subscriber except `skip`.
    pub async fn publish_excluding(&self, skip: SubscriptionId, event: Event) -> Result<u64> {
        self.deliver(event, Some(skip)).await
    }

    async fn deliver(&self, mut event: Event, skip: Option<SubscriptionId>) -> Result<u64> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(EngineError::BusClosed);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        event.seq = seq;
        event.run_id = self.run_id;

        state.summary.total_events += 1;
        *state
            .summary
            .by_type
            .entry(event.event_type.clone())
            .or_insert(0) += 1;
        if self.history_limit > 0 {
            if state.history.len() == self.history_limit {
                state.history.pop_front();
            }
            state.history.push_back(event.clone());
        }

        let mut gone = Vec::new();
        for sub in &state.subscribers {
            if Some(sub.id) == skip || !sub.filter.matches(&event) {
                continue;
            }
            if sub.tx.send(event.clone()).await.is_err() {
                gone.push(sub.id);
            }
        }
        if !gone.is_empty() {
            state.subscribers.retain(|s| !gone.contains(&s.id));
            debug!(dropped = gone.len(), "removed closed bus subscribers");
        }

        METRICS.inc_events_published();
        trace!(seq, event_type = %event.event_type, "event published");
        Ok(seq)
    }

    /// Reject further publishes and let subscriptions drain and end.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if !state.closed {
            state.closed = true;
            state.subscribers.clear();
            debug!(run_id = %self.run_id, "event bus closed");
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.subscribers.len()
    }

    /// Most recent events, oldest first. `None` returns the whole ring.
    pub async fn history(&self, limit: Option<usize>) -> Vec<Event> {
        let state = self.state.lock().await;
        let len = state.history.len();
        let skip = limit.map_or(0, |l| len.saturating_sub(l));
        state.history.iter().skip(skip).cloned().collect()
    }

    pub async fn summary(&self) -> BusSummary {
        self.state.lock().await.summary.clone()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("run_id", &self.run_id)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::kinds;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    fn event(run_id: Uuid, event_type: &str) -> Event {
        Event::new(run_id, event_type, json!({}))
    }

    #[tokio::test]
    async fn test_publish_assigns_increasing_seq() {
        let run_id = Uuid::new_v4();
        let bus = EventBus::new(run_id);
        let mut sub = bus.subscribe(EventFilter::all()).await.unwrap();

        let a = bus.publish(event(run_id, kinds::RUN_STARTED)).await.unwrap();
        let b = bus.publish(event(run_id, kinds::BUILD_START)).await.unwrap();
        assert!(b > a);

        assert_eq!(sub.recv().await.unwrap().seq, a);
        assert_eq!(sub.recv().await.unwrap().seq, b);
    }

    #[tokio::test]
    async fn test_filter_by_type_skips_other_events() {
        let run_id = Uuid::new_v4();
        let bus = EventBus::new(run_id);
        let mut steps = bus
            .subscribe(EventFilter::by_type(kinds::BUILD_STEP_COMPLETED))
            .await
            .unwrap();

        bus.publish(event(run_id, kinds::BUILD_STEP_COMPLETED))
            .await
            .unwrap();
        bus.publish(event(run_id, kinds::RESOURCE_LIMIT_WARNING))
            .await
            .unwrap();
        bus.publish(event(run_id, kinds::BUILD_STEP_COMPLETED))
            .await
            .unwrap();
        bus.close().await;

        let received: Vec<Event> = steps.collect().await;
        assert_eq!(received.len(), 2);
        assert!(received.iter().all(|e| e.is(kinds::BUILD_STEP_COMPLETED)));
        assert!(received[0].seq < received[1].seq);
    }

    #[tokio::test]
    async fn test_publish_excluding_skips_subscriber() {
        let run_id = Uuid::new_v4();
        let bus = EventBus::new(run_id);
        let mut own = bus.subscribe(EventFilter::all()).await.unwrap();
        let mut other = bus.subscribe(EventFilter::all()).await.unwrap();

        bus.publish_excluding(own.id(), event(run_id, kinds::VERIFY_START))
            .await
            .unwrap();

        assert!(other.recv().await.is_some());
        assert!(own.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_publish_after_close_fails() {
        let run_id = Uuid::new_v4();
        let bus = EventBus::new(run_id);
        bus.close().await;
        let err = bus
            .publish(event(run_id, kinds::RUN_STARTED))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BusClosed));
        assert!(bus.subscribe(EventFilter::all()).await.is_err());
    }

    #[tokio::test]
    async fn test_full_buffer_blocks_publish() {
        let run_id = Uuid::new_v4();
        let bus = Arc::new(EventBus::with_capacity(run_id, 1));
        let mut sub = bus.subscribe(EventFilter::all()).await.unwrap();

        bus.publish(event(run_id, "x.one")).await.unwrap();

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.publish(event(run_id, "x.two")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!publisher.is_finished());

        assert_eq!(sub.recv().await.unwrap().event_type, "x.one");
        let seq = publisher.await.unwrap().unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(second.event_type, "x.two");
        assert_eq!(second.seq, seq);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_removed() {
        let run_id = Uuid::new_v4();
        let bus = EventBus::new(run_id);
        let sub = bus.subscribe(EventFilter::all()).await.unwrap();
        drop(sub);
        bus.publish(event(run_id, kinds::RUN_STARTED)).await.unwrap();
        assert_eq!(bus.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_history_ring_and_summary() {
        let run_id = Uuid::new_v4();
        let bus = EventBus::new(run_id).with_history_limit(2);
        for ty in ["a.one", "a.two", "a.two"] {
            bus.publish(event(run_id, ty)).await.unwrap();
        }
        let history = bus.history(None).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].seq, 2);
        assert_eq!(bus.history(Some(1)).await[0].seq, 3);

        let summary = bus.summary().await;
        assert_eq!(summary.total_events, 3);
        assert_eq!(summary.by_type["a.two"], 2);
    }

    #[test]
    fn test_filters() {
        let run_id = Uuid::new_v4();
        let e = event(run_id, kinds::RESOURCE_LIMIT_COST).with_agent("builder-1-1");
        assert!(EventFilter::by_prefix("resource.").matches(&e));
        assert!(EventFilter::by_agent("builder-1-1").matches(&e));
        assert!(!EventFilter::by_agent("builder-1-2").matches(&e));
        assert!(!EventFilter::by_type(kinds::RESOURCE_LIMIT_TIME).matches(&e));
    }
}
