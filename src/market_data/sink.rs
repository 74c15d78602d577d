// =============================================================================
// Persistence sink - receives buffer overflow from the market-data cache
// =============================================================================
//
// The cache only keeps bounded in-memory history. Whatever falls off the end
// of a ring is handed to an optional `CandleSink`; long-term storage lives
// behind that trait. `JsonlSink` is the bundled implementation: one JSON
// object per line, appended to a single file.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;

use crate::types::{Candle, Tick};

/// Collaborator that stores entries evicted from the cache.
pub trait CandleSink: Send + Sync {
    fn persist_candles(&self, candles: &[Candle]) -> Result<()>;

    fn persist_ticks(&self, _ticks: &[Tick]) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record<'a> {
    Candle(&'a Candle),
    Tick(&'a Tick),
}

/// Appends evicted candles and ticks to a JSON-lines file.
pub struct JsonlSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open persistence file {}", path.display()))?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_records<'a>(&self, records: impl Iterator<Item = Record<'a>>) -> Result<()> {
        let mut writer = self.writer.lock();
        for record in records {
            serde_json::to_writer(&mut *writer, &record).context("failed to encode record")?;
            writer.write_all(b"\n").context("failed to write record")?;
        }
        writer
            .flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))
    }
}

impl CandleSink for JsonlSink {
    fn persist_candles(&self, candles: &[Candle]) -> Result<()> {
        self.write_records(candles.iter().map(Record::Candle))
    }

    fn persist_ticks(&self, ticks: &[Tick]) -> Result<()> {
        self.write_records(ticks.iter().map(Record::Tick))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_sink_appends_one_line_per_record() {
        let path = std::env::temp_dir().join(format!("gateway-sink-{}.jsonl", uuid::Uuid::new_v4()));
        let sink = JsonlSink::open(&path).unwrap();

        sink.persist_candles(&[Candle::open_at("R_100", 60, 0, 1.0), Candle::open_at("R_100", 60, 60, 2.0)])
            .unwrap();
        sink.persist_ticks(&[Tick::new("R_100", 3.0, 1_000)]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["kind"], "candle");
        assert_eq!(lines[1]["timestamp"], 60);
        assert_eq!(lines[2]["kind"], "tick");
        assert_eq!(lines[2]["price"], 3.0);

        std::fs::remove_file(&path).ok();
    }
}
