//! Burst (supernova candidate) detection.
//!
//! High-hit-count events that are not externally triggered are admitted to a
//! [`BurstBuffer`] whatever the detector state, so that an episode always has lookback.
//! The detector is a two-state machine over buffer occupancy:
//!
//! ```text
//!            occupancy > burst_size
//!   IDLE ─────────────────────────────▶ ACTIVE ──┐ flush entries older than
//!    ▲                                    │     ◀┘ now - end_window
//!    └──────── occupancy < end_rate ──────┘
//!              (flush all, close file)
//! ```
//!
//! While IDLE the buffer is aged out by the burst window. While ACTIVE, entries are
//! written out once they fall behind the trailing end window instead.

use crate::config::{secs_to_ticks, BurstSettings, FilterConfig, TICKS_PER_SECOND};
use crate::error::{AppResult, L2Error};
use crate::header::HeaderCache;
use crate::notify::{Severity, SharedNotifier};
use crate::ring_buffer::{BufferedRecord, BurstBuffer};
use crate::zdab::{BankIndex, BankSink, Record, SinkFactory};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Thresholds driving the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstConfig {
    /// Hit count an event must exceed to be a candidate.
    pub nhit_threshold: u32,
    /// Trigger bits that exclude an event from the buffer.
    pub bitmask: u32,
    /// Age beyond which an idle buffer forgets candidates, in ticks.
    pub window: u64,
    /// Trailing margin retained while recording, in ticks.
    pub end_window: u64,
    /// Occupancy that opens an episode.
    pub start_threshold: usize,
    /// Occupancy below which an episode closes.
    pub end_threshold: usize,
    /// Buffer slots.
    pub capacity: usize,
}

impl BurstConfig {
    /// Combine the filter thresholds with the buffer settings.
    pub fn new(filter: &FilterConfig, settings: &BurstSettings) -> Self {
        Self {
            nhit_threshold: filter.nhit_burst,
            bitmask: filter.bitmask,
            window: filter.burst_window_ticks(),
            end_window: secs_to_ticks(settings.end_window_secs),
            start_threshold: filter.burst_size as usize,
            end_threshold: filter.end_rate as usize,
            capacity: settings.capacity,
        }
    }
}

/// Detector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstState {
    /// Watching the buffer.
    Idle,
    /// Recording an episode.
    Active,
}

struct Episode<S> {
    index: u64,
    start_tick: u64,
    last_tick: u64,
    event_count: u64,
    written: u64,
    stream: S,
}

/// Closing record of one episode.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeSummary {
    /// Burst file number.
    pub index: u64,
    /// Burst file.
    pub path: PathBuf,
    /// Time of the oldest buffered candidate when the episode opened.
    pub start_tick: u64,
    /// Time of the last candidate seen during the episode.
    pub end_tick: u64,
    /// Candidates attributed to the episode.
    pub event_count: u64,
    /// Candidates written to the burst file.
    pub written: u64,
}

impl EpisodeSummary {
    /// Episode length in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.end_tick.saturating_sub(self.start_tick) as f64 / TICKS_PER_SECOND as f64
    }
}

/// What a call to [`BurstDetector::offer`] changed.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// No state change.
    None,
    /// An episode opened.
    Started {
        /// Episode number.
        index: u64,
        /// Occupancy at the start.
        occupancy: usize,
    },
    /// An episode closed.
    Ended(EpisodeSummary),
}

/// Burst state machine writing episodes through `F`.
pub struct BurstDetector<F: SinkFactory> {
    factory: F,
    base: PathBuf,
    config: BurstConfig,
    buffer: BurstBuffer,
    episode: Option<Episode<F::Sink>>,
    episodes: u64,
    next_index: u64,
    dropped: u64,
    write_errors: u64,
    pending_restore: Option<bool>,
    notifier: SharedNotifier,
}

impl<F: SinkFactory> BurstDetector<F> {
    /// Idle detector with an empty buffer. Burst files are named after `base`.
    pub fn new(factory: F, base: impl Into<PathBuf>, config: BurstConfig, notifier: SharedNotifier) -> Self {
        Self {
            factory,
            base: base.into(),
            buffer: BurstBuffer::new(config.capacity),
            config,
            episode: None,
            episodes: 0,
            next_index: 0,
            dropped: 0,
            write_errors: 0,
            pending_restore: None,
            notifier,
        }
    }

    /// Load a buffer checkpoint. It is validated against the first time seen by
    /// [`validate_restore`](Self::validate_restore). Returns whether one was found.
    pub fn restore(&mut self, checkpoint: &Path) -> AppResult<bool> {
        let Some(saved) = BurstBuffer::restore(checkpoint)? else {
            return Ok(false);
        };
        if saved.buffer.capacity() != self.config.capacity {
            warn!(
                saved = saved.buffer.capacity(),
                configured = self.config.capacity,
                "checkpoint capacity differs from configuration, keeping saved geometry"
            );
        }
        info!(
            occupancy = saved.buffer.len(),
            active = saved.burst_active,
            "restored burst buffer checkpoint"
        );
        self.buffer = saved.buffer;
        self.pending_restore = Some(saved.burst_active);
        Ok(true)
    }

    /// Check a restored buffer against the first time of this run. A buffer newer than
    /// the run is discarded; a buffer saved mid-episode resumes the episode.
    pub fn validate_restore(&mut self, longtime: u64, headers: &HeaderCache) -> AppResult<()> {
        let Some(was_active) = self.pending_restore.take() else {
            return Ok(());
        };
        if matches!(self.buffer.oldest_time(), Some(oldest) if longtime < oldest) {
            let dropped = self.buffer.clear();
            self.notifier.notify(
                Severity::Warning,
                &format!("Clock went backward across restart; discarded {} buffered burst candidates", dropped),
            );
            return Ok(());
        }
        if was_active && self.episode.is_none() {
            let occupancy = self.buffer.len();
            self.open_episode(longtime, occupancy, headers)?;
            info!(occupancy, "resumed burst episode from checkpoint");
        }
        Ok(())
    }

    /// Whether an event qualifies for the buffer.
    pub fn is_candidate(&self, nhit: u32, trigger_word: u32) -> bool {
        nhit > self.config.nhit_threshold && trigger_word & self.config.bitmask == 0
    }

    /// Admit one candidate and advance the state machine.
    pub fn offer(&mut self, record: &Record, longtime: u64, headers: &HeaderCache) -> AppResult<Transition> {
        if let Some(episode) = self.episode.as_mut() {
            let cutoff = longtime.saturating_sub(self.config.end_window);
            while let Some(old) = self.buffer.pop_older_than(cutoff) {
                write_event(episode, &old, &self.notifier, &mut self.write_errors);
            }
        } else {
            let expired = self.buffer.expire(longtime, self.config.window);
            if expired > 0 {
                debug!(expired, "aged out burst candidates");
            }
        }

        if let Some(evicted) = self.buffer.admit(record.payload.clone(), longtime) {
            match self.episode.as_mut() {
                Some(episode) => write_event(episode, &evicted, &self.notifier, &mut self.write_errors),
                None => {
                    self.dropped += 1;
                    self.notifier
                        .notify(Severity::Warning, "Burst buffer has overflowed, dropping oldest candidate");
                }
            }
        }

        let occupancy = self.buffer.len();
        if let Some(episode) = self.episode.as_mut() {
            episode.event_count += 1;
            episode.last_tick = longtime;
            if occupancy < self.config.end_threshold {
                let summary = self.close_episode(true)?;
                return Ok(summary.map_or(Transition::None, Transition::Ended));
            }
            return Ok(Transition::None);
        }

        if occupancy > self.config.start_threshold {
            let index = self.open_episode(longtime, occupancy, headers)?;
            self.notifier.notify(
                Severity::Warning,
                &format!("Burst {} started with {} candidates buffered", index, occupancy),
            );
            return Ok(Transition::Started { index, occupancy });
        }
        Ok(Transition::None)
    }

    /// Burst files are numbered past any left by an earlier process on the same base.
    fn open_episode(&mut self, longtime: u64, occupancy: usize, headers: &HeaderCache) -> AppResult<u64> {
        let mut index = self.next_index;
        while burst_path(&self.base, index).exists() {
            index += 1;
        }
        let path = burst_path(&self.base, index);
        let mut stream = self.factory.create(&path)?;
        self.next_index = index + 1;
        self.episodes += 1;
        if let Err(e) = headers.replay(&mut stream) {
            self.write_failed("write headers to", index, &e);
        }
        let start_tick = self.buffer.oldest_time().unwrap_or(longtime);
        info!(burst = index, path = %path.display(), start_tick, "opened burst file");
        self.episode = Some(Episode {
            index,
            start_tick,
            last_tick: longtime,
            event_count: occupancy as u64,
            written: 0,
            stream,
        });
        Ok(index)
    }

    fn close_episode(&mut self, flush: bool) -> AppResult<Option<EpisodeSummary>> {
        let Some(mut episode) = self.episode.take() else {
            return Ok(None);
        };
        if flush {
            while let Some(old) = self.buffer.pop_oldest() {
                write_event(&mut episode, &old, &self.notifier, &mut self.write_errors);
            }
        }
        let path = self.close_stream(episode.index, episode.stream);
        let summary = EpisodeSummary {
            index: episode.index,
            path,
            start_tick: episode.start_tick,
            end_tick: episode.last_tick,
            event_count: episode.event_count,
            written: episode.written,
        };
        self.notifier.notify(
            Severity::Info,
            &format!(
                "Burst {} ended: {} events over {:.2} s",
                summary.index,
                summary.event_count,
                summary.duration_secs()
            ),
        );
        Ok(Some(summary))
    }

    /// Discard everything buffered after a clock discontinuity. An open episode is
    /// closed without writing the untrusted candidates.
    pub fn reset(&mut self) -> AppResult<Option<EpisodeSummary>> {
        let dropped = self.buffer.clear();
        if dropped > 0 {
            warn!(dropped, "cleared burst buffer after clock discontinuity");
        }
        self.pending_restore = None;
        self.close_episode(false)
    }

    /// End of input: close any open file without flushing and checkpoint the buffer.
    pub fn shutdown(&mut self, checkpoint: Option<&Path>) -> AppResult<()> {
        let active = self.episode.is_some();
        if let Some(episode) = self.episode.take() {
            let path = self.close_stream(episode.index, episode.stream);
            info!(
                burst = episode.index,
                path = %path.display(),
                buffered = self.buffer.len(),
                "closed burst file at end of input, episode continues in checkpoint"
            );
        }
        if let Some(base) = checkpoint {
            self.buffer.persist(base, active)?;
            debug!(path = %base.display(), occupancy = self.buffer.len(), active, "wrote burst buffer checkpoint");
        }
        Ok(())
    }

    fn close_stream(&mut self, index: u64, stream: F::Sink) -> PathBuf {
        let fallback = stream.path().to_path_buf();
        stream.close().unwrap_or_else(|e| {
            self.write_failed("flush", index, &e);
            fallback
        })
    }

    fn write_failed(&mut self, what: &str, index: u64, e: &L2Error) {
        self.write_errors += 1;
        self.notifier
            .notify(Severity::Error, &format!("Could not {} burst file {}: {}", what, index, e));
    }

    /// Current state.
    pub fn state(&self) -> BurstState {
        if self.episode.is_some() {
            BurstState::Active
        } else {
            BurstState::Idle
        }
    }

    /// Buffered candidates.
    pub fn occupancy(&self) -> usize {
        self.buffer.len()
    }

    /// Episodes opened so far.
    pub fn episodes(&self) -> u64 {
        self.episodes
    }

    /// Candidates lost to overflow while idle.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Banks that could not be written to burst files.
    pub fn write_errors(&self) -> u64 {
        self.write_errors
    }

    /// The underlying buffer.
    pub fn buffer(&self) -> &BurstBuffer {
        &self.buffer
    }
}

fn write_event<S: BankSink>(
    episode: &mut Episode<S>,
    record: &BufferedRecord,
    notifier: &SharedNotifier,
    write_errors: &mut u64,
) {
    match episode.stream.write_bank(&record.payload, BankIndex::EVENT) {
        Ok(()) => episode.written += 1,
        Err(e) => {
            *write_errors += 1;
            notifier.notify(
                Severity::Error,
                &format!("Could not write candidate to burst file {}: {}", episode.index, e),
            );
        }
    }
}

/// File name of burst episode `index`.
pub fn burst_path(base: &Path, index: u64) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!("_burst_{:03}.zdab", index));
    PathBuf::from(name)
}
