//! Glue between the event bus and the downstream server.

use std::sync::Arc;

use tracing::warn;

use crate::downstream::DownstreamServer;
use crate::event_bus::{names, EventBus, GatewayEvent, Handler, HandlerId};

/// Events every downstream client sees. Client lifecycle events stay
/// internal.
pub const BROADCAST_EVENTS: &[&str] = &[
    names::TICK,
    names::CANDLE_UPDATE,
    names::CANDLE_CLOSED,
    names::UPSTREAM_CONNECTED,
    names::UPSTREAM_READY,
    names::UPSTREAM_DISCONNECTED,
    names::RECONNECT_SCHEDULED,
    names::RECONNECTED,
    names::RECONNECT_FAILED,
];

/// Forward market-data and upstream lifecycle events to every client as
/// event envelopes. Returns the handler ids so the bridge can be removed.
pub fn bridge_events(bus: &EventBus, server: DownstreamServer) -> Vec<HandlerId> {
    let handler: Handler = Arc::new(move |event: &GatewayEvent| {
        if let Err(e) = server.broadcast_event(event) {
            warn!(event = event.name(), error = %e, "failed to broadcast event");
        }
    });
    bus.on_each(BROADCAST_EVENTS, handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::MarketDataCache;
    use crate::runtime_config::{CacheConfig, DownstreamConfig};
    use crate::types::Tick;
    use futures_util::StreamExt;
    use serde_json::Value;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message;

    #[tokio::test]
    async fn cache_events_reach_downstream_clients() {
        let bus = Arc::new(EventBus::new());
        let (server, _commands) = DownstreamServer::new(
            DownstreamConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                ..DownstreamConfig::default()
            },
            bus.clone(),
        );
        let addr = server.start().await.unwrap();
        let ids = bridge_events(&bus, server.clone());
        assert_eq!(ids.len(), BROADCAST_EVENTS.len());

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap();
        for _ in 0..100 {
            if server.client_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let cache = MarketDataCache::new(
            &CacheConfig {
                timeframes: vec![60],
                ..CacheConfig::default()
            },
            bus.clone(),
        );
        cache.add_tick(Tick::new("R_100", 10.0, 1_700_000_040_000));
        bus.publish(&GatewayEvent::UpstreamReady { authorized: false });

        let mut kinds = Vec::new();
        while kinds.len() < 3 {
            let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(t) = frame {
                let v: Value = serde_json::from_str(&t).unwrap();
                assert!(v.get("data").is_some());
                kinds.push(v["type"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(kinds, vec!["tick", "candle:update", "upstream:ready"]);

        for id in ids {
            assert!(bus.off(id));
        }
        server.close().await;
    }
}
