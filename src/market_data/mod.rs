pub mod cache;
pub mod candle_aggregator;
pub mod sink;

pub use cache::MarketDataCache;
pub use candle_aggregator::{AggregateOutcome, CandleAggregator};
pub use sink::{CandleSink, JsonlSink};
