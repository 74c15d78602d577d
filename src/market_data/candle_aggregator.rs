use std::collections::VecDeque;

use crate::types::{bucket_start, Candle, Tick};

// ---------------------------------------------------------------------------
// CandleAggregator -- one (asset, timeframe) series
// ---------------------------------------------------------------------------

/// What a single tick did to the series.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateOutcome {
    /// The tick's bucket is older than the open candle; nothing changed.
    Ignored,
    /// The open candle absorbed the tick (or the very first candle opened).
    Updated(Candle),
    /// The tick crossed a bucket boundary: `closed` was finalized, `opened`
    /// is the new open candle. `evicted` is the oldest closed candle pushed
    /// out of the ring to make room, if any.
    Rolled {
        closed: Candle,
        opened: Candle,
        evicted: Option<Candle>,
    },
}

/// Turns ticks for one asset into fixed-width OHLC candles.
///
/// Retains at most `max_candles` closed candles (oldest evicted first) plus
/// the candle currently under construction.
#[derive(Debug, Clone)]
pub struct CandleAggregator {
    asset: String,
    timeframe_secs: u32,
    max_candles: usize,
    closed: VecDeque<Candle>,
    open: Option<Candle>,
}

impl CandleAggregator {
    pub fn new(asset: impl Into<String>, timeframe_secs: u32, max_candles: usize) -> Self {
        Self {
            asset: asset.into(),
            timeframe_secs: timeframe_secs.max(1),
            max_candles,
            closed: VecDeque::with_capacity(max_candles.min(1024) + 1),
            open: None,
        }
    }

    pub fn asset(&self) -> &str {
        &self.asset
    }

    pub fn timeframe_secs(&self) -> u32 {
        self.timeframe_secs
    }

    /// Feed one tick. Late ticks (older bucket than the open candle) are
    /// ignored so that out-of-order delivery never rewrites history.
    pub fn push(&mut self, tick: &Tick) -> AggregateOutcome {
        let bucket = bucket_start(tick.timestamp_secs(), self.timeframe_secs);

        match self.open.as_mut() {
            None => {
                let candle = Candle::open_at(&self.asset, self.timeframe_secs, bucket, tick.price);
                self.open = Some(candle.clone());
                AggregateOutcome::Updated(candle)
            }
            Some(open) if bucket == open.timestamp => {
                open.absorb(tick.price);
                AggregateOutcome::Updated(open.clone())
            }
            Some(open) if bucket < open.timestamp => AggregateOutcome::Ignored,
            Some(open) => {
                let opened = Candle::open_at(&self.asset, self.timeframe_secs, bucket, tick.price);
                let closed = std::mem::replace(open, opened.clone());
                let evicted = self.push_closed(closed.clone());
                AggregateOutcome::Rolled {
                    closed,
                    opened,
                    evicted,
                }
            }
        }
    }

    fn push_closed(&mut self, candle: Candle) -> Option<Candle> {
        if self.max_candles == 0 {
            return Some(candle);
        }
        self.closed.push_back(candle);
        if self.closed.len() > self.max_candles {
            self.closed.pop_front()
        } else {
            None
        }
    }

    /// Return the most recent `count` closed candles (oldest-first order).
    pub fn closed(&self, count: usize) -> Vec<Candle> {
        let start = self.closed.len().saturating_sub(count);
        self.closed.iter().skip(start).cloned().collect()
    }

    pub fn open_candle(&self) -> Option<&Candle> {
        self.open.as_ref()
    }

    pub fn closed_len(&self) -> usize {
        self.closed.len()
    }

    /// Merge historical candles in front of the live series.
    ///
    /// Only candles strictly older than everything already held are taken,
    /// so a backfill never reorders or duplicates live data. Returns the
    /// number of candles inserted.
    pub fn seed(&mut self, mut history: Vec<Candle>) -> usize {
        let cutoff = self
            .closed
            .front()
            .map(|c| c.timestamp)
            .or_else(|| self.open.as_ref().map(|c| c.timestamp))
            .unwrap_or(i64::MAX);

        history.retain(|c| {
            c.timestamp < cutoff && c.timestamp == bucket_start(c.timestamp, self.timeframe_secs)
        });
        history.sort_by_key(|c| c.timestamp);
        history.dedup_by_key(|c| c.timestamp);

        let room = self.max_candles.saturating_sub(self.closed.len());
        let skip = history.len().saturating_sub(room);
        let mut inserted = 0;
        for mut candle in history.into_iter().skip(skip).rev() {
            candle.asset = self.asset.clone();
            candle.timeframe_secs = self.timeframe_secs;
            self.closed.push_front(candle);
            inserted += 1;
        }
        inserted
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
