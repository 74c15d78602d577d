//! Deriv gateway: one authenticated upstream WebSocket connection fanned out
//! to many downstream clients, with a bounded tick and candle cache in
//! between.

pub mod downstream;
pub mod error;
pub mod event_bus;
pub mod gateway;
pub mod handlers;
pub mod market_data;
pub mod runtime_config;
pub mod types;
pub mod upstream;

pub use downstream::DownstreamServer;
pub use error::{CommandError, ServerError, UpstreamError};
pub use event_bus::{EventBus, GatewayEvent};
pub use market_data::MarketDataCache;
pub use runtime_config::GatewayConfig;
pub use upstream::UpstreamClient;
