// =============================================================================
// Command Handlers - what downstream commands actually do
// =============================================================================
//
// The server only parses envelopes. This layer owns the command table:
//
//   ping      → { pong, timestamp }
//   status    → upstream state, client count, cached assets, follows
//   assets    → cached assets and their timeframes
//   follow    → subscribe upstream ticks for an asset into the cache
//   unfollow  → forget that subscription
//   candles   → closed candles from the cache, backfilled from history
//   ticks     → recent raw ticks from the cache
//   balance   → upstream `balance`
//   trade     → upstream `buy`
//
// Follows are tracked by asset. Upstream subscription ids die with the
// socket, so a follow only counts as live while the client still holds its
// id. After `upstream:reconnected` every followed asset is subscribed
// again; one that fails stays followed and is retried later.
// =============================================================================

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::downstream::{CommandEnvelope, DownstreamServer, InboundCommand};
use crate::error::{CommandError, UpstreamError};
use crate::event_bus::{names, EventBus};
use crate::market_data::MarketDataCache;
use crate::upstream::protocol;
use crate::upstream::UpstreamClient;

pub mod codes {
    pub const FOLLOW_ERROR: &str = "FOLLOW_ERROR";
    pub const UNFOLLOW_ERROR: &str = "UNFOLLOW_ERROR";
    pub const CANDLES_ERROR: &str = "CANDLES_ERROR";
    pub const BALANCE_ERROR: &str = "BALANCE_ERROR";
    pub const TRADE_ERROR: &str = "TRADE_ERROR";
    pub const UNKNOWN_COMMAND: &str = "UNKNOWN_COMMAND";
    pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
}

const DEFAULT_TIMEFRAME: u32 = 60;
const DEFAULT_COUNT: usize = 100;
const MAX_COUNT: usize = 5000;

/// Turns one command into its response payload.
///
/// `Ok(None)` is a success with no `data`.
pub trait CommandHandler: Send + Sync + 'static {
    fn handle(&self, command: CommandEnvelope) -> impl Future<Output = Result<Option<Value>, CommandError>> + Send;
}

/// Drain `commands`, running each on its own task and answering the sender.
pub fn run_command_loop<H: CommandHandler>(
    server: DownstreamServer,
    handler: Arc<H>,
    mut commands: mpsc::Receiver<InboundCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(InboundCommand { client_id, command }) = commands.recv().await {
            let server = server.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let request_id = command.request_id.clone();
                let name = command.command.clone();
                let started = Instant::now();

                let sent = match handler.handle(command).await {
                    Ok(data) => server.respond_to_command(client_id, &request_id, true, data, None),
                    Err(e) => {
                        debug!(command = %name, code = %e.code, message = %e.message, "command failed");
                        server.respond_to_command(client_id, &request_id, false, None, Some(e))
                    }
                };
                debug!(command = %name, elapsed_ms = started.elapsed().as_millis() as u64, "command handled");
                if let Err(e) = sent {
                    debug!(client = %client_id, error = %e, "command response not delivered");
                }
            });
        }
        debug!("command channel closed");
    })
}

// =============================================================================
// Default command table
// =============================================================================

pub struct GatewayCommands {
    upstream: UpstreamClient,
    cache: Arc<MarketDataCache>,
    server: DownstreamServer,
    /// asset → upstream subscription id, `None` until (re)subscribed
    follows: Mutex<BTreeMap<String, Option<String>>>,
    follow_lock: tokio::sync::Mutex<()>,
    started_at: Instant,
}

impl GatewayCommands {
    pub fn new(upstream: UpstreamClient, cache: Arc<MarketDataCache>, server: DownstreamServer) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            cache,
            server,
            follows: Mutex::new(BTreeMap::new()),
            follow_lock: tokio::sync::Mutex::new(()),
            started_at: Instant::now(),
        })
    }

    /// Re-follow every followed asset whenever upstream reconnects.
    pub fn refollow_on_reconnect(self: &Arc<Self>, bus: &EventBus) {
        let weak: Weak<Self> = Arc::downgrade(self);
        bus.on(names::RECONNECTED, move |_| {
            if let Some(this) = weak.upgrade() {
                tokio::spawn(async move { this.refollow_all().await });
            }
        });
    }

    pub fn followed_assets(&self) -> Vec<String> {
        self.follows.lock().keys().cloned().collect()
    }

    /// Subscribe upstream ticks for `asset` and feed them into the cache.
    /// Returns the live subscription id if there already is one.
    pub async fn follow(&self, asset: &str) -> Result<String, UpstreamError> {
        let _guard = self.follow_lock.lock().await;
        let (known, live) = match self.follows.lock().get(asset) {
            Some(Some(id)) => (true, self.upstream.subscription_kind(id).is_some().then(|| id.clone())),
            Some(None) => (true, None),
            None => (false, None),
        };
        if let Some(id) = live {
            return Ok(id);
        }

        match self.subscribe_ticks(asset).await {
            Ok(id) => {
                info!(asset = %asset, subscription = %id, "following asset");
                self.follows.lock().insert(asset.to_string(), Some(id.clone()));
                Ok(id)
            }
            Err(e) => {
                if known {
                    // Still followed; the next reconnect or follow retries.
                    self.follows.lock().insert(asset.to_string(), None);
                }
                Err(e)
            }
        }
    }

    async fn subscribe_ticks(&self, asset: &str) -> Result<String, UpstreamError> {
        let cache = self.cache.clone();
        let id = self
            .upstream
            .subscribe(protocol::ticks_subscribe(asset), move |msg| {
                match protocol::parse_tick(msg) {
                    Some(tick) => {
                        cache.add_tick(tick);
                    }
                    None => debug!("push without a usable tick ignored"),
                }
            })
            .await?;
        Ok(id)
    }

    /// Returns `Ok(false)` if `asset` was not followed.
    pub async fn unfollow(&self, asset: &str) -> Result<bool, UpstreamError> {
        let _guard = self.follow_lock.lock().await;
        let Some(id) = self.follows.lock().remove(asset) else {
            return Ok(false);
        };
        info!(asset = %asset, subscription = ?id, "unfollowing asset");
        match id {
            Some(id) if self.upstream.subscription_kind(&id).is_some() => self.upstream.unsubscribe(&id).await?,
            _ => {}
        }
        Ok(true)
    }

    async fn refollow_all(&self) {
        let assets: Vec<String> = {
            let mut follows = self.follows.lock();
            follows.values_mut().for_each(|id| *id = None);
            follows.keys().cloned().collect()
        };
        if assets.is_empty() {
            return;
        }

        info!(count = assets.len(), "re-following assets after reconnect");
        for asset in assets {
            if let Err(e) = self.follow(&asset).await {
                warn!(asset = %asset, error = %e, "re-follow failed, will retry on next reconnect or follow");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    fn ping(&self) -> Value {
        json!({ "pong": true, "timestamp": chrono::Utc::now().timestamp_millis() })
    }

    fn status(&self) -> Value {
        json!({
            "upstream": {
                "state": self.upstream.state(),
                "ready": self.upstream.is_ready(),
                "authorized": self.upstream.is_authorized(),
                "reconnect": self.upstream.reconnect_status(),
                "pendingRequests": self.upstream.pending_count(),
                "subscriptions": self.upstream.subscription_count(),
            },
            "clients": self.server.client_count(),
            "droppedFrames": self.server.dropped_frames(),
            "assets": self.cache.tracked_assets(),
            "following": self.followed_assets(),
            "uptimeSecs": self.started_at.elapsed().as_secs(),
        })
    }

    fn assets(&self) -> Value {
        let assets: Vec<Value> = self
            .cache
            .tracked_assets()
            .into_iter()
            .map(|asset| {
                let timeframes = self.cache.timeframes(&asset);
                json!({ "asset": asset, "timeframes": timeframes })
            })
            .collect();
        json!({ "assets": assets })
    }

    async fn candles(&self, command: &CommandEnvelope) -> Result<Value, CommandError> {
        let asset = required_str(command, "asset")?;
        let timeframe = optional_u64(command, "timeframe")?
            .map(|tf| u32::try_from(tf).unwrap_or(0))
            .unwrap_or(DEFAULT_TIMEFRAME);
        if timeframe == 0 {
            return Err(invalid_params("timeframe must be a positive number of seconds"));
        }
        let count = optional_count(command)?;

        if !self.cache.default_timeframes().contains(&timeframe) && !self.cache.timeframes(asset).contains(&timeframe) {
            return Err(invalid_params(format!(
                "timeframe {timeframe} is not aggregated; use one of {:?}",
                self.cache.default_timeframes()
            )));
        }

        // Reads never create cache state: history for an asset the cache
        // does not hold is served straight through.
        let mut candles = self.cache.get_candles(asset, timeframe, count);

        if candles.len() < count && self.upstream.is_ready() {
            let history = self
                .upstream
                .request(protocol::candle_history(asset, timeframe, count))
                .await
                .map_err(|e| e.to_string())
                .and_then(|msg| protocol::parse_history_candles(&msg, asset, timeframe).map_err(|e| e.to_string()));
            match history {
                Ok(mut history) => {
                    if self.cache.timeframes(asset).contains(&timeframe) {
                        self.cache.seed_candles(asset, timeframe, history);
                        candles = self.cache.get_candles(asset, timeframe, count);
                    } else if history.len() > candles.len() {
                        history.sort_by_key(|c| c.timestamp);
                        let skip = history.len().saturating_sub(count);
                        candles = history.split_off(skip);
                    }
                }
                Err(e) if candles.is_empty() => {
                    return Err(CommandError::new(codes::CANDLES_ERROR, e));
                }
                Err(e) => warn!(asset = %asset, error = %e, "history backfill failed, serving cached candles"),
            }
        }

        Ok(json!({
            "asset": asset,
            "timeframe": timeframe,
            "candles": candles,
            "open": self.cache.get_open_candle(asset, timeframe),
        }))
    }

    fn ticks(&self, command: &CommandEnvelope) -> Result<Value, CommandError> {
        let asset = required_str(command, "asset")?;
        let count = optional_count(command)?;
        Ok(json!({ "asset": asset, "ticks": self.cache.get_ticks(asset, count) }))
    }

    async fn balance(&self) -> Result<Value, CommandError> {
        let resp = self
            .upstream
            .request(protocol::balance())
            .await
            .map_err(|e| CommandError::new(codes::BALANCE_ERROR, e.to_string()))?;
        Ok(resp.get("balance").cloned().unwrap_or(resp))
    }

    async fn trade(&self, command: &CommandEnvelope) -> Result<Value, CommandError> {
        let price = command
            .param("price")
            .and_then(Value::as_f64)
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or_else(|| invalid_params("'price' must be a positive number"))?;
        let parameters = command
            .param("parameters")
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| invalid_params("'parameters' must be an object"))?;

        info!(price, "submitting buy");
        let resp = self
            .upstream
            .request(protocol::buy(price, parameters))
            .await
            .map_err(|e| CommandError::new(codes::TRADE_ERROR, e.to_string()))?;
        Ok(resp.get("buy").cloned().unwrap_or(resp))
    }
}

impl CommandHandler for GatewayCommands {
    async fn handle(&self, command: CommandEnvelope) -> Result<Option<Value>, CommandError> {
        let data = match command.command.as_str() {
            "ping" => self.ping(),
            "status" => self.status(),
            "assets" => self.assets(),
            "follow" => {
                let asset = required_str(&command, "asset")?;
                let id = self
                    .follow(asset)
                    .await
                    .map_err(|e| CommandError::new(codes::FOLLOW_ERROR, e.to_string()))?;
                json!({ "asset": asset, "subscriptionId": id })
            }
            "unfollow" => {
                let asset = required_str(&command, "asset")?;
                match self.unfollow(asset).await {
                    Ok(true) => json!({ "asset": asset, "unfollowed": true }),
                    Ok(false) => {
                        return Err(CommandError::new(codes::UNFOLLOW_ERROR, format!("not following {asset}")));
                    }
                    Err(e) => return Err(CommandError::new(codes::UNFOLLOW_ERROR, e.to_string())),
                }
            }
            "candles" => self.candles(&command).await?,
            "ticks" => self.ticks(&command)?,
            "balance" => self.balance().await?,
            "trade" => self.trade(&command).await?,
            other => {
                return Err(CommandError::new(codes::UNKNOWN_COMMAND, format!("unknown command '{other}'")));
            }
        };
        Ok(Some(data))
    }
}

// -----------------------------------------------------------------------------
// Param helpers
// -----------------------------------------------------------------------------

fn invalid_params(message: impl Into<String>) -> CommandError {
    CommandError::new(codes::INVALID_PARAMS, message)
}

fn required_str<'a>(command: &'a CommandEnvelope, key: &str) -> Result<&'a str, CommandError> {
    command
        .param(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid_params(format!("missing string parameter '{key}'")))
}

fn optional_u64(command: &CommandEnvelope, key: &str) -> Result<Option<u64>, CommandError> {
    match command.param(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| invalid_params(format!("'{key}' must be a non-negative integer"))),
    }
}

fn optional_count(command: &CommandEnvelope) -> Result<usize, CommandError> {
    let count = optional_u64(command, "count")?.map_or(DEFAULT_COUNT, |c| c as usize);
    if count == 0 {
        return Err(invalid_params("'count' must be at least 1"));
    }
    Ok(count.min(MAX_COUNT))
}

// =============================================================================
// Tests
// =============================================================================
