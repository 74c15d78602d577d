// =============================================================================
// Market Data Cache - bounded tick rings and candle series per asset
// =============================================================================
//
// Owns, per asset:
//   - a ring of the most recent raw ticks (`max_ticks_per_asset`), and
//   - one `CandleAggregator` per tracked timeframe.
//
// Ingestion is serialized by `ingest`: `add_tick` holds it across both the
// buffer mutation and the event publication, so candle events for one
// (asset, timeframe) are published in bucket order no matter how many
// producers call in. The data lock itself is released before any event
// handler runs, so handlers may read the cache.
//
// Entries pushed out of a ring are forwarded to the optional `CandleSink`.
// =============================================================================

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::event_bus::{EventBus, GatewayEvent};
use crate::market_data::candle_aggregator::{AggregateOutcome, CandleAggregator};
use crate::market_data::sink::CandleSink;
use crate::runtime_config::CacheConfig;
use crate::types::{Candle, Tick};

struct AssetEntry {
    ticks: VecDeque<Tick>,
    series: BTreeMap<u32, CandleAggregator>,
}

impl AssetEntry {
    fn new(asset: &str, timeframes: &[u32], max_candles: usize) -> Self {
        let series = timeframes
            .iter()
            .map(|&tf| (tf, CandleAggregator::new(asset, tf, max_candles)))
            .collect();
        Self {
            ticks: VecDeque::new(),
            series,
        }
    }
}

/// Thread-safe store of recent ticks and candles for every asset seen.
pub struct MarketDataCache {
    max_ticks: usize,
    max_candles: usize,
    timeframes: Vec<u32>,
    assets: RwLock<HashMap<String, AssetEntry>>,
    ingest: Mutex<()>,
    bus: Arc<EventBus>,
    sink: Option<Arc<dyn CandleSink>>,
}

impl MarketDataCache {
    pub fn new(config: &CacheConfig, bus: Arc<EventBus>) -> Self {
        let mut timeframes: Vec<u32> = config.timeframes.iter().copied().filter(|&tf| tf > 0).collect();
        timeframes.sort_unstable();
        timeframes.dedup();

        Self {
            max_ticks: config.max_ticks_per_asset,
            max_candles: config.max_candles_per_asset,
            timeframes,
            assets: RwLock::new(HashMap::new()),
            ingest: Mutex::new(()),
            bus,
            sink: None,
        }
    }

    /// Forward evicted ticks and candles to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn CandleSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Timeframes every newly seen asset starts with.
    pub fn default_timeframes(&self) -> &[u32] {
        &self.timeframes
    }

    // -------------------------------------------------------------------------
    // Ingestion
    // -------------------------------------------------------------------------

    /// Record a tick and advance every candle series for its asset.
    ///
    /// Returns `false` if the tick was malformed and dropped. Event handlers
    /// run while ingestion is held, so they must not call back into
    /// `add_tick`.
    pub fn add_tick(&self, tick: Tick) -> bool {
        if !tick.is_well_formed() {
            warn!(asset = %tick.asset, price = tick.price, ts = tick.timestamp_ms, "dropping malformed tick");
            return false;
        }

        let _ingest = self.ingest.lock();
        let mut events = Vec::new();
        let mut evicted_ticks = Vec::new();
        let mut evicted_candles = Vec::new();

        {
            let mut map = self.assets.write();
            let entry = map.entry(tick.asset.clone()).or_insert_with(|| {
                info!(asset = %tick.asset, timeframes = ?self.timeframes, "tracking new asset");
                AssetEntry::new(&tick.asset, &self.timeframes, self.max_candles)
            });

            entry.ticks.push_back(tick.clone());
            while entry.ticks.len() > self.max_ticks {
                if let Some(old) = entry.ticks.pop_front() {
                    evicted_ticks.push(old);
                }
            }

            for agg in entry.series.values_mut() {
                match agg.push(&tick) {
                    AggregateOutcome::Ignored => {
                        debug!(
                            asset = %tick.asset,
                            timeframe = agg.timeframe_secs(),
                            ts = tick.timestamp_ms,
                            "late tick ignored for candles"
                        );
                    }
                    AggregateOutcome::Updated(candle) => {
                        events.push(GatewayEvent::CandleUpdate(candle));
                    }
                    AggregateOutcome::Rolled { closed, opened, evicted } => {
                        debug!(
                            asset = %closed.asset,
                            timeframe = closed.timeframe_secs,
                            bucket = closed.timestamp,
                            close = closed.close,
                            "candle closed"
                        );
                        events.push(GatewayEvent::CandleClosed(closed));
                        events.push(GatewayEvent::CandleUpdate(opened));
                        evicted_candles.extend(evicted);
                    }
                }
            }
        }

        self.bus.publish(&GatewayEvent::Tick(tick));
        for event in &events {
            self.bus.publish(event);
        }

        self.flush_evicted(&evicted_ticks, &evicted_candles);
        true
    }

    fn flush_evicted(&self, ticks: &[Tick], candles: &[Candle]) {
        let Some(sink) = &self.sink else { return };
        if !ticks.is_empty() {
            if let Err(e) = sink.persist_ticks(ticks) {
                warn!(error = %e, count = ticks.len(), "failed to persist evicted ticks");
            }
        }
        if !candles.is_empty() {
            if let Err(e) = sink.persist_candles(candles) {
                warn!(error = %e, count = candles.len(), "failed to persist evicted candles");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// The most recent `count` closed candles, oldest first. Returns fewer
    /// when the cache holds fewer; callers backfill from upstream history.
    pub fn get_candles(&self, asset: &str, timeframe_secs: u32, count: usize) -> Vec<Candle> {
        self.assets
            .read()
            .get(asset)
            .and_then(|e| e.series.get(&timeframe_secs))
            .map(|agg| agg.closed(count))
            .unwrap_or_default()
    }

    pub fn get_open_candle(&self, asset: &str, timeframe_secs: u32) -> Option<Candle> {
        self.assets
            .read()
            .get(asset)
            .and_then(|e| e.series.get(&timeframe_secs))
            .and_then(|agg| agg.open_candle().cloned())
    }

    /// The most recent `count` raw ticks, oldest first.
    pub fn get_ticks(&self, asset: &str, count: usize) -> Vec<Tick> {
        self.assets
            .read()
            .get(asset)
            .map(|e| {
                let start = e.ticks.len().saturating_sub(count);
                e.ticks.iter().skip(start).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn tracked_assets(&self) -> Vec<String> {
        let mut assets: Vec<String> = self.assets.read().keys().cloned().collect();
        assets.sort();
        assets
    }

    pub fn timeframes(&self, asset: &str) -> Vec<u32> {
        self.assets
            .read()
            .get(asset)
            .map(|e| e.series.keys().copied().collect())
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Drop everything held for `asset`. Returns `false` if it was unknown.
    pub fn clear_asset(&self, asset: &str) -> bool {
        let _ingest = self.ingest.lock();
        let removed = self.assets.write().remove(asset).is_some();
        if removed {
            info!(asset = %asset, "asset cleared from cache");
        }
        removed
    }

    /// Start aggregating `asset` at an extra timeframe. Returns `false` if it
    /// was already tracked.
    pub fn track_timeframe(&self, asset: &str, timeframe_secs: u32) -> bool {
        if timeframe_secs == 0 {
            return false;
        }
        let _ingest = self.ingest.lock();
        let mut map = self.assets.write();
        let entry = map
            .entry(asset.to_string())
            .or_insert_with(|| AssetEntry::new(asset, &self.timeframes, self.max_candles));
        if entry.series.contains_key(&timeframe_secs) {
            return false;
        }
        entry
            .series
            .insert(timeframe_secs, CandleAggregator::new(asset, timeframe_secs, self.max_candles));
        true
    }

    /// Backfill closed candles from the upstream history endpoint. Only
    /// history older than the live series is taken, and only into a series
    /// that already exists.
    pub fn seed_candles(&self, asset: &str, timeframe_secs: u32, candles: Vec<Candle>) -> usize {
        let _ingest = self.ingest.lock();
        let mut map = self.assets.write();
        let Some(series) = map.get_mut(asset).and_then(|e| e.series.get_mut(&timeframe_secs)) else {
            debug!(asset = %asset, timeframe = timeframe_secs, "no series to seed");
            return 0;
        };
        let inserted = series.seed(candles);
        debug!(asset = %asset, timeframe = timeframe_secs, inserted, "candles seeded from history");
        inserted
    }
}

impl std::fmt::Debug for MarketDataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataCache")
            .field("assets", &self.assets.read().len())
            .field("max_ticks", &self.max_ticks)
            .field("max_candles", &self.max_candles)
            .field("timeframes", &self.timeframes)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::names;

    const T0: i64 = 1_700_000_040;

    fn config(max_ticks: usize, max_candles: usize, timeframes: Vec<u32>) -> CacheConfig {
        CacheConfig {
            max_ticks_per_asset: max_ticks,
            max_candles_per_asset: max_candles,
            timeframes,
            persistence_path: None,
        }
    }

    fn recorder(bus: &EventBus, name: &str) -> Arc<Mutex<Vec<GatewayEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.on(name, move |e| s.lock().push(e.clone()));
        seen
    }

    fn tick(secs: i64, price: f64) -> Tick {
        Tick::new("R_100", price, secs * 1000)
    }

    #[derive(Default)]
    struct MemorySink {
        candles: Mutex<Vec<Candle>>,
        ticks: Mutex<Vec<Tick>>,
    }

    impl CandleSink for MemorySink {
        fn persist_candles(&self, candles: &[Candle]) -> anyhow::Result<()> {
            self.candles.lock().extend_from_slice(candles);
            Ok(())
        }

        fn persist_ticks(&self, ticks: &[Tick]) -> anyhow::Result<()> {
            self.ticks.lock().extend_from_slice(ticks);
            Ok(())
        }
    }

    #[test]
    fn tick_ring_keeps_most_recent() {
        let bus = Arc::new(EventBus::new());
        let cache = MarketDataCache::new(&config(3, 10, vec![60]), bus);

        for (i, p) in [1.0, 2.0, 3.0, 4.0].into_iter().enumerate() {
            cache.add_tick(tick(T0 + i as i64, p));
        }

        let prices: Vec<f64> = cache.get_ticks("R_100", 10).iter().map(|t| t.price).collect();
        assert_eq!(prices, vec![2.0, 3.0, 4.0]);
        let last_two: Vec<f64> = cache.get_ticks("R_100", 2).iter().map(|t| t.price).collect();
        assert_eq!(last_two, vec![3.0, 4.0]);
    }

    #[test]
    fn candle_closes_only_when_bucket_is_crossed() {
        let bus = Arc::new(EventBus::new());
        let closed = recorder(&bus, names::CANDLE_CLOSED);
        let updates = recorder(&bus, names::CANDLE_UPDATE);
        let cache = MarketDataCache::new(&config(100, 10, vec![60]), bus);

        for (i, p) in [10.0, 11.0, 9.0, 12.0].into_iter().enumerate() {
            cache.add_tick(tick(T0 + i as i64 * 10, p));
        }

        let open = cache.get_open_candle("R_100", 60).unwrap();
        assert_eq!((open.open, open.high, open.low, open.close), (10.0, 12.0, 9.0, 12.0));
        assert!(cache.get_candles("R_100", 60, 10).is_empty());
        assert!(closed.lock().is_empty());
        assert_eq!(updates.lock().len(), 4);

        cache.add_tick(tick(T0 + 60, 15.0));

        let history = cache.get_candles("R_100", 60, 10);
        assert_eq!(history.len(), 1);
        assert_eq!((history[0].open, history[0].high, history[0].low, history[0].close), (10.0, 12.0, 9.0, 12.0));
        assert_eq!(closed.lock().len(), 1);

        let open = cache.get_open_candle("R_100", 60).unwrap();
        assert_eq!(open.timestamp, T0 + 60);
        assert_eq!(open.open, 15.0);
    }

    #[test]
    fn late_tick_is_buffered_but_not_aggregated() {
        let bus = Arc::new(EventBus::new());
        let cache = MarketDataCache::new(&config(100, 10, vec![60]), bus);

        cache.add_tick(tick(T0 + 70, 50.0));
        let before = cache.get_open_candle("R_100", 60);
        cache.add_tick(tick(T0 + 10, 1.0));

        assert_eq!(cache.get_open_candle("R_100", 60), before);
        assert_eq!(cache.get_ticks("R_100", 10).len(), 2);
    }

    #[test]
    fn each_timeframe_is_aggregated_independently() {
        let bus = Arc::new(EventBus::new());
        let closed = recorder(&bus, names::CANDLE_CLOSED);
        let cache = MarketDataCache::new(&config(100, 10, vec![300, 60, 60]), bus);

        let base = 1_700_000_100; // multiple of 300
        for i in 0..6 {
            cache.add_tick(tick(base + i * 60, 100.0 + i as f64));
        }

        assert_eq!(cache.timeframes("R_100"), vec![60, 300]);
        assert_eq!(cache.get_candles("R_100", 60, 100).len(), 5);
        let five_min = cache.get_candles("R_100", 300, 100);
        assert_eq!(five_min.len(), 1);
        assert_eq!((five_min[0].open, five_min[0].high, five_min[0].close), (100.0, 104.0, 104.0));
        assert_eq!(closed.lock().len(), 6);
    }

    #[test]
    fn malformed_ticks_are_dropped() {
        let bus = Arc::new(EventBus::new());
        let ticks = recorder(&bus, names::TICK);
        let cache = MarketDataCache::new(&config(10, 10, vec![60]), bus);

        assert!(!cache.add_tick(Tick::new("R_100", f64::INFINITY, 1_000)));
        assert!(!cache.add_tick(Tick::new("", 1.0, 1_000)));
        assert!(cache.tracked_assets().is_empty());
        assert!(ticks.lock().is_empty());
    }

    #[test]
    fn evictions_reach_the_sink() {
        let bus = Arc::new(EventBus::new());
        let sink = Arc::new(MemorySink::default());
        let cache = MarketDataCache::new(&config(2, 1, vec![60]), bus).with_sink(sink.clone());

        for i in 0..4 {
            cache.add_tick(tick(T0 + i * 60, 1.0 + i as f64));
        }

        // 4 ticks into a ring of 2; 3 closes into a ring of 1.
        assert_eq!(sink.ticks.lock().len(), 2);
        let candles = sink.candles.lock();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].timestamp, T0);
        assert_eq!(candles[1].timestamp, T0 + 60);
    }

    #[test]
    fn clear_and_track_assets() {
        let bus = Arc::new(EventBus::new());
        let cache = MarketDataCache::new(&config(10, 10, vec![60]), bus);

        cache.add_tick(Tick::new("R_50", 1.0, 0));
        cache.add_tick(Tick::new("R_10", 1.0, 0));
        assert_eq!(cache.tracked_assets(), vec!["R_10", "R_50"]);

        assert!(cache.track_timeframe("R_10", 900));
        assert!(!cache.track_timeframe("R_10", 900));
        assert_eq!(cache.timeframes("R_10"), vec![60, 900]);

        assert!(cache.clear_asset("R_50"));
        assert!(!cache.clear_asset("R_50"));
        assert_eq!(cache.tracked_assets(), vec!["R_10"]);
        assert!(cache.get_ticks("R_50", 10).is_empty());
    }

    #[test]
    fn handlers_can_read_cache_during_publish() {
        let bus = Arc::new(EventBus::new());
        let cache = Arc::new(MarketDataCache::new(&config(10, 10, vec![60]), bus.clone()));
        let seen = Arc::new(Mutex::new(0usize));

        let c = cache.clone();
        let s = seen.clone();
        bus.on(names::TICK, move |_| {
            *s.lock() = c.get_ticks("R_100", 10).len();
        });

        cache.add_tick(tick(T0, 1.0));
        cache.add_tick(tick(T0 + 1, 2.0));
        assert_eq!(*seen.lock(), 2);
    }

    #[test]
    fn seed_candles_backfills_history() {
        let bus = Arc::new(EventBus::new());
        let cache = MarketDataCache::new(&config(10, 10, vec![60]), bus);

        cache.add_tick(tick(T0 + 120, 5.0));
        let history = (0..2).map(|i| Candle::open_at("R_100", 60, T0 + i * 60, 1.0)).collect();
        assert_eq!(cache.seed_candles("R_100", 60, history), 2);
        assert_eq!(cache.get_candles("R_100", 60, 10).len(), 2);
    }

    #[test]
    fn seed_candles_never_creates_series() {
        let bus = Arc::new(EventBus::new());
        let cache = MarketDataCache::new(&config(10, 10, vec![60]), bus);
        let history: Vec<Candle> = (0..2).map(|i| Candle::open_at("R_50", 60, T0 + i * 60, 1.0)).collect();

        assert_eq!(cache.seed_candles("R_50", 60, history.clone()), 0);
        assert!(cache.tracked_assets().is_empty());

        cache.add_tick(tick(T0 + 300, 5.0));
        assert_eq!(cache.seed_candles("R_100", 900, history), 0);
        assert_eq!(cache.timeframes("R_100"), vec![60]);
    }
}
