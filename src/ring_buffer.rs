//! Fixed-capacity circular buffer of recent burst candidates.
//!
//! Slots live in a preallocated arena with a parallel array of arrival times. The
//! buffer is either empty or described by a head (oldest occupied slot) and tail (next
//! slot to write); `head == tail` therefore means *full*, never empty, and emptiness is
//! tracked separately so the two cannot be confused.
//!
//! # Checkpoint Layout
//! ```text
//! <base>.events   for each slot: len: u32 LE, raw bytes   (empty slots have len 0)
//! <base>.times    one decimal longtime per slot, 0 for empty
//! <base>.state    "head tail active" with -1 -1 for an empty buffer
//! ```

use crate::error::{AppResult, L2Error};
use bytes::Bytes;
use std::ffi::OsString;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// A candidate taken out of the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedRecord {
    /// Arrival time.
    pub longtime: u64,
    /// Raw event bytes.
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    head: usize,
    tail: usize,
}

/// Circular buffer of raw records keyed by arrival time.
#[derive(Debug, Clone)]
pub struct BurstBuffer {
    slots: Vec<Bytes>,
    times: Vec<u64>,
    cursor: Option<Cursor>,
}

/// Buffer contents recovered from disk.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// Restored buffer.
    pub buffer: BurstBuffer,
    /// Whether a burst was being recorded when the checkpoint was taken.
    pub burst_active: bool,
}

impl BurstBuffer {
    /// Empty buffer with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![Bytes::new(); capacity],
            times: vec![0; capacity],
            cursor: None,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of buffered records.
    pub fn len(&self) -> usize {
        match self.cursor {
            None => 0,
            Some(Cursor { head, tail }) if tail > head => tail - head,
            Some(Cursor { head, tail }) => tail + self.capacity() - head,
        }
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.cursor.is_none()
    }

    /// Whether the next admission will evict.
    pub fn is_full(&self) -> bool {
        matches!(self.cursor, Some(c) if c.head == c.tail)
    }

    /// Head and tail indices, `(-1, -1)` when empty.
    pub fn head_tail(&self) -> (i64, i64) {
        match self.cursor {
            None => (-1, -1),
            Some(c) => (c.head as i64, c.tail as i64),
        }
    }

    /// Store a record. When full, the oldest record is evicted first and returned so the
    /// caller can decide whether to write or drop it.
    pub fn admit(&mut self, payload: Bytes, longtime: u64) -> Option<BufferedRecord> {
        let evicted = if self.is_full() { self.pop_oldest() } else { None };
        let cursor = self.cursor.get_or_insert(Cursor { head: 0, tail: 0 });
        let at = cursor.tail;
        cursor.tail = (at + 1) % self.slots.len();
        self.slots[at] = payload;
        self.times[at] = longtime;
        evicted
    }

    /// Remove and return the oldest record.
    pub fn pop_oldest(&mut self) -> Option<BufferedRecord> {
        let cursor = self.cursor.as_mut()?;
        let at = cursor.head;
        let record = BufferedRecord {
            longtime: std::mem::take(&mut self.times[at]),
            payload: std::mem::take(&mut self.slots[at]),
        };
        cursor.head = (at + 1) % self.slots.len();
        if cursor.head == cursor.tail {
            self.cursor = None;
        }
        Some(record)
    }

    /// Arrival time of the oldest record.
    pub fn oldest_time(&self) -> Option<u64> {
        self.cursor.map(|c| self.times[c.head])
    }

    /// Pop the oldest record if it arrived before `cutoff`.
    pub fn pop_older_than(&mut self, cutoff: u64) -> Option<BufferedRecord> {
        match self.oldest_time() {
            Some(t) if t < cutoff => self.pop_oldest(),
            _ => None,
        }
    }

    /// Drop every record older than `max_age` ticks before `now`. Returns how many were dropped.
    pub fn expire(&mut self, now: u64, max_age: u64) -> usize {
        let cutoff = now.saturating_sub(max_age);
        let mut dropped = 0;
        while self.pop_older_than(cutoff).is_some() {
            dropped += 1;
        }
        dropped
    }

    /// Drop everything. Returns how many records were discarded.
    pub fn clear(&mut self) -> usize {
        let mut dropped = 0;
        while self.pop_oldest().is_some() {
            dropped += 1;
        }
        dropped
    }

    /// Records oldest first.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &Bytes)> + '_ {
        let start = self.cursor.map_or(0, |c| c.head);
        let cap = self.capacity();
        (0..self.len()).map(move |i| {
            let at = (start + i) % cap;
            (self.times[at], &self.slots[at])
        })
    }

    /// Slots holding a non-zero arrival time.
    pub fn occupied_slots(&self) -> usize {
        self.times.iter().filter(|t| **t != 0).count()
    }

    /// Write the three checkpoint files next to `base`.
    pub fn persist(&self, base: &Path, burst_active: bool) -> AppResult<()> {
        let mut events = BufWriter::new(fs::File::create(suffixed(base, ".events"))?);
        for slot in &self.slots {
            let len = u32::try_from(slot.len())
                .map_err(|_| L2Error::Checkpoint("slot larger than 4 GiB".into()))?;
            events.write_all(&len.to_le_bytes())?;
            events.write_all(slot)?;
        }
        events.flush()?;

        let mut times = String::with_capacity(self.times.len() * 12);
        for t in &self.times {
            times.push_str(&t.to_string());
            times.push('\n');
        }
        fs::write(suffixed(base, ".times"), times)?;

        let (head, tail) = self.head_tail();
        fs::write(
            suffixed(base, ".state"),
            format!("{} {} {}\n", head, tail, u8::from(burst_active)),
        )?;
        Ok(())
    }

    /// Load a checkpoint written by [`persist`](Self::persist). Returns `None` if there is none.
    pub fn restore(base: &Path) -> AppResult<Option<Checkpoint>> {
        let state_path = suffixed(base, ".state");
        if !state_path.exists() {
            return Ok(None);
        }
        let bad = |msg: &str| L2Error::Checkpoint(format!("{}: {}", base.display(), msg));

        let state = fs::read_to_string(&state_path)?;
        let fields: Vec<i64> = state
            .split_whitespace()
            .map(|f| f.parse::<i64>().map_err(|_| bad("unreadable state record")))
            .collect::<AppResult<_>>()?;
        let [head, tail, active] = fields[..] else {
            return Err(bad("state record needs head, tail and active flag"));
        };

        let times: Vec<u64> = fs::read_to_string(suffixed(base, ".times"))?
            .lines()
            .map(|l| l.trim().parse::<u64>().map_err(|_| bad("unreadable time")))
            .collect::<AppResult<_>>()?;
        let capacity = times.len();
        if capacity == 0 {
            return Err(bad("no time slots"));
        }

        let raw = fs::read(suffixed(base, ".events"))?;
        let mut slots = Vec::with_capacity(capacity);
        let mut at = 0usize;
        for _ in 0..capacity {
            let len_bytes: [u8; 4] = raw
                .get(at..at + 4)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| bad("event file truncated"))?;
            let len = u32::from_le_bytes(len_bytes) as usize;
            at += 4;
            let body = raw.get(at..at + len).ok_or_else(|| bad("event file truncated"))?;
            slots.push(Bytes::copy_from_slice(body));
            at += len;
        }

        let cursor = match (head, tail) {
            (-1, -1) => None,
            (h, t) if (0..capacity as i64).contains(&h) && (0..capacity as i64).contains(&t) => Some(Cursor {
                head: h as usize,
                tail: t as usize,
            }),
            _ => return Err(bad("head/tail out of range")),
        };

        Ok(Some(Checkpoint {
            buffer: BurstBuffer { slots, times, cursor },
            burst_active: active != 0,
        }))
    }
}

fn suffixed(base: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
