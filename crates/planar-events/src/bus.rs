//! Event bus for pub/sub coordination.
//!
//! Delivery model: publication appends the event to a bounded history
//! ring, then fans out synchronously to every matching subscription in
//! registration order. Each subscription owns a bounded broadcast
//! channel, so a slow subscriber only ever loses its own oldest events
//! and never blocks the publisher or its peers.

use std::collections::{BTreeMap, VecDeque};

use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::pattern::Pattern;

/// Default number of events retained for late subscribers.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Default per-subscription channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Handle identifying a subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Receiving side of a subscription.
pub struct EventSubscription {
    receiver: broadcast::Receiver<Event>,
}

impl EventSubscription {
    /// Receive the next matching event.
    ///
    /// A lagged subscriber skips the overwritten events and keeps
    /// receiving; `Err(ChannelClosed)` means the bus is gone.
    pub async fn recv(&mut self) -> Result<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "event subscription lagged, skipping");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::ChannelClosed),
            }
        }
    }

    /// Receive without waiting; `None` when no event is pending.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    debug!(missed, "event subscription lagged, skipping");
                }
                Err(_) => return None,
            }
        }
    }
}

struct Subscriber {
    sender: broadcast::Sender<Event>,
    pattern: Pattern,
    source_filter: Option<String>,
}

struct BusState {
    /// Keyed by a monotonic id: iteration order is registration order,
    /// which the delivery-order guarantee depends on.
    subscribers: BTreeMap<u64, Subscriber>,
    next_id: u64,
    history: VecDeque<Event>,
}

/// Publish/subscribe event bus with glob-pattern subscriptions.
pub struct EventBus {
    state: RwLock<BusState>,
    history_capacity: usize,
    channel_capacity: usize,
}

impl EventBus {
    /// Bus with default capacities.
    pub fn new() -> Self {
        EventBusBuilder::new().build()
    }

    /// Publish an event to all matching subscribers.
    ///
    /// Best-effort: a subscriber whose channel is gone is skipped and
    /// the rest still receive the event.
    pub async fn publish(&self, event: Event) {
        let mut state = self.state.write().await;

        if state.history.len() == self.history_capacity {
            state.history.pop_front();
        }
        state.history.push_back(event.clone());

        for (id, sub) in &state.subscribers {
            if let Some(filter) = &sub.source_filter {
                if filter != &event.source {
                    continue;
                }
            }
            if !sub.pattern.matches(&event) {
                continue;
            }
            if sub.sender.send(event.clone()).is_err() {
                debug!(subscription = %SubscriptionId(*id), event_type = %event.event_type,
                    "subscriber dropped, skipping delivery");
            }
        }
    }

    /// Subscribe to events matching a glob pattern.
    pub async fn subscribe(&self, pattern: &str) -> Result<(SubscriptionId, EventSubscription)> {
        self.register(pattern, None).await
    }

    /// Subscribe to events matching a pattern from one source actor only.
    pub async fn subscribe_from(
        &self,
        pattern: &str,
        source: &str,
    ) -> Result<(SubscriptionId, EventSubscription)> {
        self.register(pattern, Some(source.to_string())).await
    }

    async fn register(
        &self,
        pattern: &str,
        source_filter: Option<String>,
    ) -> Result<(SubscriptionId, EventSubscription)> {
        let pattern = Pattern::compile(pattern)?;
        let (sender, receiver) = broadcast::channel(self.channel_capacity);

        let mut state = self.state.write().await;
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.insert(
            id,
            Subscriber {
                sender,
                pattern,
                source_filter,
            },
        );

        Ok((SubscriptionId(id), EventSubscription { receiver }))
    }

    /// Remove a subscription.
    pub async fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.state.write().await;
        state.subscribers.remove(&id.0);
    }

    /// Recent events, newest last, optionally filtered by pattern.
    pub async fn recent(&self, pattern: Option<&str>, limit: usize) -> Result<Vec<Event>> {
        let filter = pattern.map(Pattern::compile).transpose()?;
        let state = self.state.read().await;
        let events = state
            .history
            .iter()
            .filter(|e| filter.as_ref().is_none_or(|p| p.matches(e)))
            .cloned()
            .collect::<Vec<_>>();
        let skip = events.len().saturating_sub(limit);
        Ok(events.into_iter().skip(skip).collect())
    }

    /// Number of active subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.state.read().await.subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`EventBus`].
pub struct EventBusBuilder {
    history_capacity: usize,
    channel_capacity: usize,
}

impl EventBusBuilder {
    pub fn new() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Number of events kept for [`EventBus::recent`] queries.
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Per-subscription channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> EventBus {
        EventBus {
            state: RwLock::new(BusState {
                subscribers: BTreeMap::new(),
                next_id: 0,
                history: VecDeque::with_capacity(self.history_capacity),
            }),
            history_capacity: self.history_capacity.max(1),
            channel_capacity: self.channel_capacity,
        }
    }
}

impl Default for EventBusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, source: &str) -> Event {
        Event::new(event_type, source, json!({}))
    }

    async fn subscribe(bus: &EventBus, pattern: &str) -> (SubscriptionId, EventSubscription) {
        let result = bus.subscribe(pattern).await;
        assert!(result.is_ok(), "subscription to '{pattern}' failed");
        match result {
            Ok(pair) => pair,
            Err(_) => unreachable!(),
        }
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscribers() {
        let bus = EventBus::new();
        let (_plate_id, mut plates) = subscribe(&bus, "plate.*").await;
        let (_any_id, mut all) = subscribe(&bus, "**").await;

        bus.publish(event("plate.created", "plate-1")).await;
        bus.publish(event("mover.assigned", "pool")).await;

        assert_eq!(
            plates.try_recv().map(|e| e.event_type),
            Some("plate.created".to_string())
        );
        assert!(plates.try_recv().is_none());

        assert!(all.try_recv().is_some());
        assert!(all.try_recv().is_some());
    }

    #[tokio::test]
    async fn delivery_order_is_publication_order() {
        let bus = EventBus::new();
        let (_id, mut sub) = subscribe(&bus, "seq.*").await;

        for i in 0..10 {
            bus.publish(event(&format!("seq.e{i}"), "test")).await;
        }

        for i in 0..10 {
            let received = sub.try_recv().map(|e| e.event_type);
            assert_eq!(received, Some(format!("seq.e{i}")));
        }
    }

    #[tokio::test]
    async fn source_filter_limits_delivery() {
        let bus = EventBus::new();
        let result = bus.subscribe_from("plate.*", "plate-P2").await;
        assert!(result.is_ok());
        let Ok((_id, mut sub)) = result else {
            return;
        };

        bus.publish(event("plate.paused", "plate-P1")).await;
        bus.publish(event("plate.paused", "plate-P2")).await;

        assert_eq!(
            sub.try_recv().map(|e| e.source),
            Some("plate-P2".to_string())
        );
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (id, mut sub) = subscribe(&bus, "**").await;
        bus.unsubscribe(id).await;
        bus.publish(event("plate.created", "plate-1")).await;
        assert!(sub.try_recv().is_none());
        assert_eq!(bus.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn history_ring_is_bounded() {
        let bus = EventBusBuilder::new().with_history_capacity(3).build();
        for i in 0..5 {
            bus.publish(event(&format!("h.e{i}"), "test")).await;
        }

        let recent = bus.recent(None, 10).await.unwrap_or_default();
        let names: Vec<&str> = recent.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(names, vec!["h.e2", "h.e3", "h.e4"]);
    }

    #[tokio::test]
    async fn recent_filters_by_pattern() {
        let bus = EventBus::new();
        bus.publish(event("plate.created", "p")).await;
        bus.publish(event("mover.assigned", "m")).await;
        bus.publish(event("plate.error", "p")).await;

        let recent = bus.recent(Some("plate.*"), 10).await.unwrap_or_default();
        assert_eq!(recent.len(), 2);
        assert!(bus.recent(Some("bad..pattern"), 10).await.is_err());
    }
}
