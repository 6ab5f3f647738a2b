//! Run counters and per-second statistics egress.

use crate::clock::{ClockOutcome, ClockReading};
use crate::error::AppResult;
use crate::filter::{CategoryTally, Verdict};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Rolling window widths in seconds, 1 to 65536.
pub const GRANULARITIES: [u64; 17] = [
    1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536,
];

/// A bucket is forgotten this many of its own intervals after it was last touched.
pub const RETAIN_INTERVALS: u64 = 2400;

/// Totals for the whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStatistics {
    /// Records read.
    pub records: u64,
    /// Hit-bearing records read.
    pub events: u64,
    /// Records written to the primary output.
    pub written: u64,
    /// Samples whose 50 MHz counter read zero, as counted by the clock model.
    pub orphans: u64,
    /// 50 MHz counter rollovers.
    pub rollovers: u64,
    /// Samples held back as suspect.
    pub suspect_samples: u64,
    /// Confirmed clock discontinuities.
    pub clock_resets: u64,
    /// Samples with excessive drift between the counters.
    pub drift_alarms: u64,
    /// Records with an unknown bank name.
    pub unknown_banks: u64,
    /// Burst episodes opened.
    pub bursts: u64,
    /// Banks lost because a chunk or burst stream refused them.
    pub write_errors: u64,
    /// Per-category L2 tallies.
    pub categories: CategoryTally,
}

impl RunStatistics {
    /// Account for one clock sample.
    pub fn record_clock(&mut self, reading: &ClockReading) {
        match reading.outcome {
            ClockOutcome::Rollover => self.rollovers += 1,
            ClockOutcome::Suspect(_) => self.suspect_samples += 1,
            ClockOutcome::Reset(_) => self.clock_resets += 1,
            ClockOutcome::Seeded | ClockOutcome::Accepted | ClockOutcome::Orphan => {}
        }
        if reading.drift_alarm.is_some() {
            self.drift_alarms += 1;
        }
    }

    /// Account for one L2 decision.
    pub fn record_verdict(&mut self, verdict: Verdict) {
        self.categories.record(verdict);
    }
}

/// Counters for one wall-clock second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SecondCounters {
    /// Records seen.
    pub l1: u64,
    /// Records written to the primary output.
    pub l2: u64,
    /// Set if a burst was in progress at any point during the second.
    pub burst: bool,
}

impl SecondCounters {
    /// Return the current counts and start over.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

/// Destination for per-second samples. Failures are reported to the caller, which
/// logs them and carries on.
pub trait StatsSink: Send {
    /// Store the counters for wall second `second`.
    fn record_second(&mut self, second: u64, counters: &SecondCounters) -> AppResult<()>;

    /// Flush buffered output.
    fn flush(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStats;

impl StatsSink for NullStats {
    fn record_second(&mut self, _second: u64, _counters: &SecondCounters) -> AppResult<()> {
        Ok(())
    }
}

/// Aggregate for one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Bucket {
    /// Records seen.
    pub l1: u64,
    /// Records written.
    pub l2: u64,
    /// Whether any second in the window saw a burst.
    pub burst: bool,
    #[serde(skip)]
    touched: u64,
}

#[derive(Serialize)]
struct Sample<'a> {
    second: u64,
    #[serde(flatten)]
    counters: &'a SecondCounters,
}

/// Rolling multi-granularity store, optionally mirrored to a JSON-lines file.
#[derive(Default)]
pub struct TimeSeriesStats {
    buckets: HashMap<(u64, u64), Bucket>,
    out: Option<BufWriter<File>>,
}

impl TimeSeriesStats {
    /// In-memory store only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that also appends each sample to `path`.
    pub fn with_file(path: &Path) -> AppResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            buckets: HashMap::new(),
            out: Some(BufWriter::new(file)),
        })
    }

    /// Bucket of width `granularity` containing `second`.
    pub fn bucket(&self, granularity: u64, second: u64) -> Option<Bucket> {
        self.buckets.get(&(granularity, second / granularity)).copied()
    }

    /// Buckets currently held.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether nothing is held.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn expire(&mut self, now: u64) {
        self.buckets
            .retain(|(granularity, _), bucket| now.saturating_sub(bucket.touched) < RETAIN_INTERVALS * granularity);
    }
}

impl StatsSink for TimeSeriesStats {
    fn record_second(&mut self, second: u64, counters: &SecondCounters) -> AppResult<()> {
        for granularity in GRANULARITIES {
            let bucket = self.buckets.entry((granularity, second / granularity)).or_default();
            bucket.l1 += counters.l1;
            bucket.l2 += counters.l2;
            bucket.burst |= counters.burst;
            bucket.touched = second;
        }
        self.expire(second);

        if let Some(out) = self.out.as_mut() {
            serde_json::to_writer(&mut *out, &Sample { second, counters })?;
            out.write_all(b"\n")?;
        }
        Ok(())
    }

    fn flush(&mut self) -> AppResult<()> {
        if let Some(out) = self.out.as_mut() {
            out.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(l1: u64, l2: u64, burst: bool) -> SecondCounters {
        SecondCounters { l1, l2, burst }
    }

    #[test]
    fn samples_accumulate_into_every_granularity() {
        let mut stats = TimeSeriesStats::new();
        stats.record_second(1_000, &counters(10, 4, false)).unwrap();
        stats.record_second(1_001, &counters(20, 5, true)).unwrap();

        assert_eq!(stats.bucket(1, 1_000).unwrap().l1, 10);
        assert_eq!(stats.bucket(1, 1_001).unwrap().l2, 5);
        let pair = stats.bucket(2, 1_000).unwrap();
        assert_eq!((pair.l1, pair.l2, pair.burst), (30, 9, true));
        assert_eq!(stats.bucket(65_536, 1_000).unwrap().l1, 30);
        assert_eq!(stats.len(), 2 + GRANULARITIES.len() - 1);
    }

    #[test]
    fn fine_buckets_expire_first() {
        let mut stats = TimeSeriesStats::new();
        stats.record_second(10, &counters(1, 1, false)).unwrap();
        stats.record_second(10 + RETAIN_INTERVALS, &counters(1, 1, false)).unwrap();
        assert!(stats.bucket(1, 10).is_none());
        assert!(stats.bucket(2, 10).is_some());
    }

    #[test]
    fn samples_are_mirrored_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.jsonl");
        let mut stats = TimeSeriesStats::with_file(&path).unwrap();
        stats.record_second(7, &counters(3, 2, true)).unwrap();
        stats.flush().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let line: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(line["second"], 7);
        assert_eq!(line["l1"], 3);
        assert_eq!(line["burst"], true);
    }

    #[test]
    fn second_counters_reset_on_take() {
        let mut c = counters(5, 1, true);
        assert_eq!(c.take(), counters(5, 1, true));
        assert_eq!(c, SecondCounters::default());
    }
}
