// =============================================================================
// Event Bus - typed publish/subscribe hub
// =============================================================================
//
// Producers (upstream client, market-data cache, downstream server) publish
// `GatewayEvent`s; consumers register handlers by event name. The bus is an
// ordinary value constructed once in `main` and handed to every component as
// `Arc<EventBus>`; tests build their own.
//
// Delivery is synchronous: `publish` runs every handler registered for the
// event's name, in registration order, before returning. Handlers that need
// to do async work spawn their own task. The registry is snapshotted before
// dispatch so handlers may register or unregister other handlers freely.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::types::{Candle, Tick};

/// Event names as they appear on the bus and in downstream event envelopes.
pub mod names {
    pub const TICK: &str = "tick";
    pub const CANDLE_UPDATE: &str = "candle:update";
    pub const CANDLE_CLOSED: &str = "candle:closed";
    pub const UPSTREAM_CONNECTED: &str = "upstream:connected";
    pub const UPSTREAM_READY: &str = "upstream:ready";
    pub const UPSTREAM_DISCONNECTED: &str = "upstream:disconnected";
    pub const RECONNECT_SCHEDULED: &str = "upstream:reconnect_scheduled";
    pub const RECONNECTED: &str = "upstream:reconnected";
    pub const RECONNECT_FAILED: &str = "upstream:reconnect_failed";
    pub const CLIENT_CONNECTED: &str = "client:connected";
    pub const CLIENT_DISCONNECTED: &str = "client:disconnected";
}

/// Everything the gateway announces internally.
///
/// Serializes to the downstream event envelope `{"type": <name>, "data": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    #[serde(rename = "tick")]
    Tick(Tick),
    #[serde(rename = "candle:update")]
    CandleUpdate(Candle),
    #[serde(rename = "candle:closed")]
    CandleClosed(Candle),
    #[serde(rename = "upstream:connected")]
    UpstreamConnected,
    #[serde(rename = "upstream:ready")]
    UpstreamReady { authorized: bool },
    #[serde(rename = "upstream:disconnected")]
    UpstreamDisconnected { reason: String },
    #[serde(rename = "upstream:reconnect_scheduled")]
    ReconnectScheduled { attempt: u32, delay_ms: u64 },
    #[serde(rename = "upstream:reconnected")]
    Reconnected,
    /// Terminal: the client stopped trying and stays disconnected.
    #[serde(rename = "upstream:reconnect_failed")]
    ReconnectFailed { attempts: u32 },
    #[serde(rename = "client:connected")]
    ClientConnected { client_id: Uuid },
    #[serde(rename = "client:disconnected")]
    ClientDisconnected { client_id: Uuid },
}

impl GatewayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tick(_) => names::TICK,
            Self::CandleUpdate(_) => names::CANDLE_UPDATE,
            Self::CandleClosed(_) => names::CANDLE_CLOSED,
            Self::UpstreamConnected => names::UPSTREAM_CONNECTED,
            Self::UpstreamReady { .. } => names::UPSTREAM_READY,
            Self::UpstreamDisconnected { .. } => names::UPSTREAM_DISCONNECTED,
            Self::ReconnectScheduled { .. } => names::RECONNECT_SCHEDULED,
            Self::Reconnected => names::RECONNECTED,
            Self::ReconnectFailed { .. } => names::RECONNECT_FAILED,
            Self::ClientConnected { .. } => names::CLIENT_CONNECTED,
            Self::ClientDisconnected { .. } => names::CLIENT_DISCONNECTED,
        }
    }
}

/// Token returned by [`EventBus::on`]; pass it to [`EventBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub type Handler = Arc<dyn Fn(&GatewayEvent) + Send + Sync>;

/// Process-wide publish/subscribe hub.
pub struct EventBus {
    handlers: RwLock<HashMap<String, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `handler` for every event published under `name`.
    ///
    /// Handlers stay registered until [`off`](Self::off) is called.
    pub fn on<F>(&self, name: &str, handler: F) -> HandlerId
    where
        F: Fn(&GatewayEvent) + Send + Sync + 'static,
    {
        self.on_shared(name, Arc::new(handler))
    }

    /// Register one shared handler under several event names.
    pub fn on_each(&self, names: &[&str], handler: Handler) -> Vec<HandlerId> {
        names
            .iter()
            .map(|name| self.on_shared(name, handler.clone()))
            .collect()
    }

    fn on_shared(&self, name: &str, handler: Handler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(name.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut map = self.handlers.write();
        let mut removed = false;
        map.retain(|_, list| {
            let before = list.len();
            list.retain(|(hid, _)| *hid != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    /// Deliver `event` to its handlers and return how many ran.
    pub fn publish(&self, event: &GatewayEvent) -> usize {
        let snapshot: Vec<Handler> = {
            let map = self.handlers.read();
            match map.get(event.name()) {
                Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
                None => return 0,
            }
        };
        for handler in &snapshot {
            handler(event);
        }
        snapshot.len()
    }

    pub fn handler_count(&self, name: &str) -> usize {
        self.handlers.read().get(name).map_or(0, Vec::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let map = self.handlers.read();
        f.debug_struct("EventBus")
            .field("events", &map.len())
            .field("handlers", &map.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let seen = seen.clone();
            bus.on(names::RECONNECTED, move |_| seen.lock().push(label));
        }

        assert_eq!(bus.publish(&GatewayEvent::Reconnected), 3);
        assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn only_matching_name_is_invoked() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        bus.on(names::CANDLE_CLOSED, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&GatewayEvent::CandleUpdate(Candle::open_at("R_100", 60, 0, 1.0)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        bus.publish(&GatewayEvent::CandleClosed(Candle::open_at("R_100", 60, 0, 1.0)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_unregisters() {
        let bus = EventBus::new();
        let id = bus.on(names::RECONNECTED, |_| {});
        assert_eq!(bus.handler_count(names::RECONNECTED), 1);
        assert!(bus.off(id));
        assert!(!bus.off(id));
        assert_eq!(bus.publish(&GatewayEvent::Reconnected), 0);
    }

    #[test]
    fn handler_may_register_during_publish() {
        let bus = Arc::new(EventBus::new());
        let inner = bus.clone();
        bus.on(names::RECONNECTED, move |_| {
            inner.on(names::RECONNECTED, |_| {});
        });
        assert_eq!(bus.publish(&GatewayEvent::Reconnected), 1);
        assert_eq!(bus.handler_count(names::RECONNECTED), 2);
    }

    #[test]
    fn concurrent_publishers_are_all_delivered() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        bus.on(names::TICK, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::scope(|s| {
            for t in 0..4 {
                let bus = bus.clone();
                s.spawn(move || {
                    for i in 0..250 {
                        bus.publish(&GatewayEvent::Tick(Tick::new("R_100", 1.0 + t as f64, i)));
                    }
                });
            }
        });

        assert_eq!(hits.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn event_serializes_as_envelope() {
        let event = GatewayEvent::CandleClosed(Candle::open_at("R_100", 60, 120, 10.0));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "candle:closed");
        assert_eq!(json["data"]["timestamp"], 120);

        let event = GatewayEvent::ReconnectScheduled { attempt: 2, delay_ms: 20_000 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.name());
        assert_eq!(json["data"]["delay_ms"], 20_000);
    }
}
