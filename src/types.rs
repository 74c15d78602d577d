// =============================================================================
// Shared types used across the gateway data plane
// =============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One timestamped price observation for an asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub asset: String,
    pub price: f64,
    /// Upstream timestamp in milliseconds since the UNIX epoch.
    pub timestamp_ms: i64,
}

impl Tick {
    pub fn new(asset: impl Into<String>, price: f64, timestamp_ms: i64) -> Self {
        Self {
            asset: asset.into(),
            price,
            timestamp_ms,
        }
    }

    /// Whole seconds since the epoch, rounded towards negative infinity.
    pub fn timestamp_secs(&self) -> i64 {
        self.timestamp_ms.div_euclid(1000)
    }

    /// A tick is usable for aggregation only if it carries a real price.
    pub fn is_well_formed(&self) -> bool {
        !self.asset.is_empty()
            && self.price.is_finite()
            && self.price > 0.0
            && self.timestamp_ms >= 0
    }
}

/// An OHLC aggregate of ticks over a fixed time bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub asset: String,
    pub timeframe_secs: u32,
    /// Bucket start in seconds since the epoch.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candle {
    /// Open a fresh candle whose four prices all equal `price`.
    pub fn open_at(asset: impl Into<String>, timeframe_secs: u32, timestamp: i64, price: f64) -> Self {
        Self {
            asset: asset.into(),
            timeframe_secs,
            timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }

    /// Fold another price into this candle.
    pub fn absorb(&mut self, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
    }
}

/// `floor(timestamp / timeframe) * timeframe`, using euclidean division so
/// pre-epoch timestamps still land on a bucket boundary.
pub fn bucket_start(timestamp_secs: i64, timeframe_secs: u32) -> i64 {
    let tf = i64::from(timeframe_secs.max(1));
    timestamp_secs.div_euclid(tf) * tf
}

/// Lifecycle of the single upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authorizing,
    Ready,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Authorizing => write!(f, "Authorizing"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// The parallel `Reconnecting` sub-state: which attempt is next and how long
/// the client waits before making it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconnectStatus {
    pub attempt: u32,
    #[serde(with = "duration_ms")]
    pub next_delay: Duration,
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Kind of upstream push stream a subscription delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    Ticks,
    Contract,
}

impl SubscriptionKind {
    /// Tick streams are recognised by their request key; everything else is
    /// treated as a contract stream.
    pub fn infer(payload: &serde_json::Value) -> Self {
        if payload.get("ticks").is_some() || payload.get("ticks_history").is_some() {
            Self::Ticks
        } else {
            Self::Contract
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_start_floors_to_timeframe() {
        assert_eq!(bucket_start(1_700_000_059, 60), 1_700_000_040);
        assert_eq!(bucket_start(120, 60), 120);
        assert_eq!(bucket_start(-1, 60), -60);
    }

    #[test]
    fn candle_absorb_tracks_extremes() {
        let mut c = Candle::open_at("R_100", 60, 0, 10.0);
        c.absorb(11.0);
        c.absorb(9.0);
        c.absorb(12.0);
        assert_eq!((c.open, c.high, c.low, c.close), (10.0, 12.0, 9.0, 12.0));
    }

    #[test]
    fn malformed_ticks_are_detected() {
        assert!(Tick::new("R_100", 1.5, 0).is_well_formed());
        assert!(!Tick::new("", 1.5, 0).is_well_formed());
        assert!(!Tick::new("R_100", f64::NAN, 0).is_well_formed());
        assert!(!Tick::new("R_100", -2.0, 0).is_well_formed());
        assert!(!Tick::new("R_100", 2.0, -5).is_well_formed());
    }

    #[test]
    fn tick_seconds_round_down() {
        assert_eq!(Tick::new("R_100", 1.0, 1_999).timestamp_secs(), 1);
    }
}
