// =============================================================================
// Deriv Gateway - Main Entry Point
// =============================================================================
//
// Holds a single upstream connection to the Deriv WebSocket API and serves
// ticks, candles and commands to any number of local WebSocket clients.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use deriv_gateway::downstream::DownstreamServer;
use deriv_gateway::event_bus::EventBus;
use deriv_gateway::gateway::bridge_events;
use deriv_gateway::handlers::{run_command_loop, GatewayCommands};
use deriv_gateway::market_data::{JsonlSink, MarketDataCache};
use deriv_gateway::runtime_config::GatewayConfig;
use deriv_gateway::upstream::{ReconnectPolicy, UpstreamClient};

const CONFIG_PATH: &str = "gateway_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Deriv Gateway — Starting Up                      ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path = std::env::var("GATEWAY_CONFIG").unwrap_or_else(|_| CONFIG_PATH.to_string());
    let mut config = GatewayConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        GatewayConfig::default()
    });
    config.apply_env_overrides();

    info!(
        endpoint = %config.upstream.endpoint,
        app_id = %config.upstream.app_id,
        authenticated = config.upstream.api_token.is_some(),
        listen = %config.downstream.bind_addr(),
        assets = ?config.assets,
        "Configuration resolved"
    );

    // ── 2. Event bus & market-data cache ─────────────────────────────────
    let bus = Arc::new(EventBus::new());

    let mut cache = MarketDataCache::new(&config.cache, bus.clone());
    if let Some(path) = &config.cache.persistence_path {
        match JsonlSink::open(path) {
            Ok(sink) => {
                info!(path = %path, "Persisting evicted market data");
                cache = cache.with_sink(Arc::new(sink));
            }
            Err(e) => warn!(error = %e, "Persistence disabled"),
        }
    }
    let cache = Arc::new(cache);

    // ── 3. Upstream client & downstream server ───────────────────────────
    let upstream = UpstreamClient::new(config.upstream.clone(), bus.clone());
    let (server, commands) = DownstreamServer::new(config.downstream.clone(), bus.clone());

    bridge_events(&bus, server.clone());

    let handlers = GatewayCommands::new(upstream.clone(), cache.clone(), server.clone());
    handlers.refollow_on_reconnect(&bus);
    let command_loop = run_command_loop(server.clone(), handlers.clone(), commands);

    let addr = server.start().await?;
    info!(addr = %addr, "Downstream WebSocket available at ws://{addr}/ws");

    // ── 4. Connect upstream ──────────────────────────────────────────────
    // Once a connection has been Ready the client reconnects by itself; the
    // first one is retried here with the same backoff.
    let startup = {
        let upstream = upstream.clone();
        let handlers = handlers.clone();
        let assets = config.assets.clone();
        let policy = ReconnectPolicy::from_config(&config.upstream);
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                match upstream.connect().await {
                    Ok(()) => break,
                    Err(e) if policy.allows(attempt) => {
                        let delay = policy.delay_for(attempt);
                        error!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "Upstream connect failed — retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        error!(error = %e, attempts = attempt, "Upstream unreachable — serving cached data only");
                        return;
                    }
                }
            }

            for asset in &assets {
                match handlers.follow(asset).await {
                    Ok(id) => info!(asset = %asset, subscription = %id, "Following startup asset"),
                    Err(e) => warn!(asset = %asset, error = %e, "Failed to follow startup asset"),
                }
            }
        })
    };

    // ── 5. Run until Ctrl+C ──────────────────────────────────────────────
    info!("Gateway running — press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    startup.abort();
    server.close().await;
    upstream.disconnect();
    command_loop.abort();

    // Give the upstream writer a moment to flush its close frame.
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!("Gateway stopped");
    Ok(())
}
