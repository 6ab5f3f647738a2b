//! The single-pass record loop.
//!
//! [`Processor`] owns every piece of per-run state and consumes records strictly in
//! order. For each hit-bearing record:
//!
//! 1. the clock model turns the trigger-card counters into a `longtime`;
//! 2. a confirmed discontinuity resets the burst buffer, the dynamic cut and chunking;
//! 3. the chunk router rotates files up to `longtime`;
//! 4. burst candidates go to the burst detector;
//! 5. the L2 filter decides whether the record is written to the open chunk(s).
//!
//! Records without hits (headers, run records) are written to the open chunk(s) and
//! remembered in the header cache.

use crate::burst::{BurstConfig, BurstDetector, BurstState, Transition};
use crate::chunk::{Archiver, ChunkConfig, ChunkRouter, PauseFlag, Route};
use crate::clock::{ClockConfig, ClockModel, ClockOutcome, ClockReading};
use crate::config::{FilterConfig, RunSettings};
use crate::error::AppResult;
use crate::filter::L2Filter;
use crate::header::HeaderCache;
use crate::notify::{unix_seconds, Severity, SharedNotifier, WallClock};
use crate::stats::{NullStats, RunStatistics, SecondCounters, StatsSink};
use crate::zdab::{Record, RecordSource, SinkFactory, EXTASY_BIT};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn};

/// Whether the loop should keep reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Read the next record.
    Continue,
    /// The chunk limit was reached.
    Stop,
}

/// End-of-run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Output base name.
    pub output: PathBuf,
    /// Counters.
    pub stats: RunStatistics,
    /// Chunks opened.
    pub chunks: u64,
    /// Whether the chunk limit ended the run before the input did.
    pub stopped_early: bool,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Subfile {} finished.  {} records,  {} events processed.",
            self.output.display(),
            self.stats.records,
            self.stats.events
        )?;
        for (label, count) in self.stats.categories.labelled() {
            writeln!(f, "{} events {}", count, label)?;
        }
        write!(
            f,
            "{} chunks, {} bursts, {} orphans, {} clock resets, {} write errors",
            self.chunks, self.stats.bursts, self.stats.orphans, self.stats.clock_resets, self.stats.write_errors
        )
    }
}

/// Per-run processing state.
pub struct Processor<F: SinkFactory + Clone> {
    output: PathBuf,
    clock: ClockModel,
    filter: L2Filter,
    headers: HeaderCache,
    router: ChunkRouter<F>,
    burst: BurstDetector<F>,
    notifier: SharedNotifier,
    stats_sink: Box<dyn StatsSink>,
    wall: WallClock,
    second: Option<u64>,
    counters: SecondCounters,
    run: RunStatistics,
    checkpoint: PathBuf,
    restore_checked: bool,
}

impl<F: SinkFactory + Clone> Processor<F> {
    /// Wire up a processor writing chunks and burst files named after `output`.
    pub fn new(
        factory: F,
        output: impl Into<PathBuf>,
        filter: FilterConfig,
        settings: &RunSettings,
        notifier: SharedNotifier,
    ) -> Self {
        let output = output.into();
        let archiver = Archiver::new(settings.archive.clone(), notifier.clone());
        let router = ChunkRouter::new(
            factory.clone(),
            output.clone(),
            ChunkConfig::from_settings(settings),
            archiver,
        );
        let burst = BurstDetector::new(
            factory,
            output.clone(),
            BurstConfig::new(&filter, &settings.burst),
            notifier.clone(),
        );
        let checkpoint = settings
            .burst
            .checkpoint
            .clone()
            .unwrap_or_else(|| default_checkpoint(&output));
        Self {
            clock: ClockModel::new(ClockConfig::from_settings(&settings.clock, filter.retrig_window)),
            filter: L2Filter::new(filter),
            headers: HeaderCache::new(),
            router,
            burst,
            notifier,
            stats_sink: Box::new(NullStats),
            wall: Arc::new(unix_seconds),
            second: None,
            counters: SecondCounters::default(),
            run: RunStatistics::default(),
            checkpoint,
            restore_checked: false,
            output,
        }
    }

    /// Send per-second samples to `sink`.
    pub fn with_stats(mut self, sink: Box<dyn StatsSink>) -> Self {
        self.stats_sink = sink;
        self
    }

    /// Use `clock` for wall-second boundaries.
    pub fn with_wall_clock(mut self, clock: WallClock) -> Self {
        self.wall = clock;
        self
    }

    /// Flag that holds archival while set.
    pub fn pause_flag(&self) -> PauseFlag {
        self.router.archiver().pause_flag()
    }

    /// Base path of the burst buffer checkpoint.
    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint
    }

    /// Consume `source` to the end (or the chunk limit) and close everything.
    pub fn run<S: RecordSource>(&mut self, source: &mut S) -> AppResult<RunSummary> {
        let span = info_span!("run", output = %self.output.display());
        let _enter = span.enter();

        match self.burst.restore(&self.checkpoint) {
            Ok(true) | Ok(false) => {}
            Err(e) => self.notifier.notify(
                Severity::Warning,
                &format!("Could not restore burst buffer, starting empty: {}", e),
            ),
        }

        loop {
            let record = match source.next_record() {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) if !e.is_fatal() => {
                    self.notifier
                        .notify(Severity::Error, &format!("Input ended early: {}", e));
                    break;
                }
                Err(e) => return Err(e),
            };
            if self.process(&record)? == Flow::Stop {
                break;
            }
        }
        self.finish()
    }

    /// Handle one record.
    pub fn process(&mut self, record: &Record) -> AppResult<Flow> {
        self.tick_wall();
        self.run.records += 1;
        self.counters.l1 += 1;

        let Some(event) = record.as_event() else {
            if record.bank_index().is_none() {
                self.run.unknown_banks += 1;
            }
            let route = self.router.route(record, None, &self.headers)?;
            self.headers.observe(record);
            return Ok(self.account_write(route));
        };

        self.run.events += 1;
        let trigger = event.trigger;
        let reading = self.clock.update(trigger.counter50(), trigger.counter10());
        self.run.record_clock(&reading);
        self.report_clock(&reading, trigger.counter50());
        let longtime = reading.longtime;

        if !self.restore_checked {
            self.restore_checked = true;
            self.burst.validate_restore(longtime, &self.headers)?;
        }

        let route = if let ClockOutcome::Reset(_) = reading.outcome {
            if let Some(summary) = self.burst.reset()? {
                info!(burst = summary.index, events = summary.event_count, "burst closed by clock reset");
            }
            self.filter.reset_threshold();
            self.router.resync(longtime, &self.headers)?
        } else {
            self.router.advance(longtime, &self.headers)?
        };
        if route == Route::Exhausted {
            return Ok(Flow::Stop);
        }

        self.filter.update_threshold(event.nhit, longtime);

        let word = trigger.trigger_word();
        if word & EXTASY_BIT != 0 {
            self.router.mark_extasy();
        }

        if self.burst.is_candidate(event.nhit, word) {
            match self.burst.offer(record, longtime, &self.headers)? {
                Transition::Started { index, occupancy } => {
                    self.run.bursts += 1;
                    debug!(burst = index, occupancy, longtime, "burst started");
                }
                Transition::Ended(summary) => {
                    info!(
                        burst = summary.index,
                        events = summary.event_count,
                        duration_secs = summary.duration_secs(),
                        path = %summary.path.display(),
                        "burst ended"
                    );
                }
                Transition::None => {}
            }
        }
        if self.burst.state() == BurstState::Active {
            self.counters.burst = true;
        }

        let verdict = self.filter.evaluate(event.nhit, word, reading.retrigger);
        self.run.record_verdict(verdict);
        if verdict.accept {
            let route = self.router.route(record, None, &self.headers)?;
            return Ok(self.account_write(route));
        }
        Ok(Flow::Continue)
    }

    /// Close chunks, checkpoint the burst buffer and report.
    pub fn finish(&mut self) -> AppResult<RunSummary> {
        self.router.finish()?;
        if let Err(e) = self.burst.shutdown(Some(&self.checkpoint)) {
            self.notifier
                .notify(Severity::Error, &format!("Could not checkpoint burst buffer: {}", e));
        }
        if let Some(second) = self.second {
            self.emit_second(second);
        }
        if let Err(e) = self.stats_sink.flush() {
            warn!(error = %e, "statistics flush failed");
        }

        self.run.orphans = self.clock.orphans();
        self.run.write_errors = self.router.write_errors() + self.burst.write_errors();
        let summary = RunSummary {
            output: self.output.clone(),
            stats: self.run.clone(),
            chunks: self.router.chunks_opened(),
            stopped_early: self.router.is_exhausted(),
        };
        self.notifier.notify(Severity::Success, &summary.to_string());
        Ok(summary)
    }

    /// Counters so far.
    pub fn statistics(&self) -> &RunStatistics {
        &self.run
    }

    /// The clock model.
    pub fn clock(&self) -> &ClockModel {
        &self.clock
    }

    /// Current burst state.
    pub fn burst_state(&self) -> BurstState {
        self.burst.state()
    }

    fn account_write(&mut self, route: Route) -> Flow {
        match route {
            Route::Primary | Route::Both => {
                self.run.written += 1;
                self.counters.l2 += 1;
                Flow::Continue
            }
            Route::Dropped => Flow::Continue,
            Route::Exhausted => Flow::Stop,
        }
    }

    fn report_clock(&self, reading: &ClockReading, counter50: u64) {
        if let Some(drift) = reading.drift_alarm {
            self.notifier.notify(
                Severity::Warning,
                &format!("50 and 10 MHz clocks disagree by {} ticks", drift),
            );
        }
        match reading.outcome {
            ClockOutcome::Rollover => self
                .notifier
                .notify(Severity::Info, &format!("New epoch {}", reading.epoch)),
            ClockOutcome::Suspect(anomaly) => self.notifier.notify(
                Severity::Warning,
                &format!(
                    "50 MHz clock anomaly ({:?}) at counter {}, holding time at {}",
                    anomaly, counter50, reading.longtime
                ),
            ),
            ClockOutcome::Reset(anomaly) => self.notifier.notify(
                Severity::Error,
                &format!(
                    "50 MHz clock discontinuity confirmed ({:?}), time restarted at {}",
                    anomaly, reading.longtime
                ),
            ),
            ClockOutcome::Orphan => debug!(longtime = reading.longtime, "50 MHz counter read zero"),
            ClockOutcome::Seeded | ClockOutcome::Accepted => {}
        }
    }

    fn tick_wall(&mut self) {
        let now = (self.wall)();
        match self.second {
            Some(second) if second == now => return,
            Some(second) => self.emit_second(second),
            None => {}
        }
        self.second = Some(now);
        self.notifier.tick();
    }

    fn emit_second(&mut self, second: u64) {
        let counters = self.counters.take();
        if let Err(e) = self.stats_sink.record_second(second, &counters) {
            warn!(error = %e, second, "statistics write failed");
        }
    }
}

/// Default checkpoint base: `<output>_buffer`.
pub fn default_checkpoint(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push("_buffer");
    PathBuf::from(name)
}
