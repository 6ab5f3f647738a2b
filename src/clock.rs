//! Reconstruction of a monotonic event clock from two wrapping hardware counters.
//!
//! The 50 MHz counter is tracked for accuracy and the 10 MHz counter for uniqueness.
//! The 50 MHz counter is 43 bits wide and wraps; `longtime` extends it to 64 bits by
//! counting wraps (the epoch): `longtime = counter50 + epoch * 2^43`.
//!
//! Each timing sample is checked against the last *accepted* sample (the standard):
//!
//! ```text
//!              consistent                    inconsistent
//! problem=no   accept, new standard          keep standard, problem=yes
//! problem=yes  accept, new standard          reset: epoch=0, longtime=counter50
//! ```
//!
//! A single bad sample is treated as noise; two in a row are a real discontinuity.

use crate::config::ClockSettings;

/// Width of the 50 MHz counter.
pub const COUNTER50_BITS: u32 = 43;

/// Value at which the 50 MHz counter wraps.
pub const MAX_TIME: u64 = 1 << COUNTER50_BITS;

/// Ratio of the two counter frequencies.
const CLOCK_RATIO: i128 = 5;

/// Tolerances used by [`ClockModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockConfig {
    /// Largest forward step accepted between samples, in ticks.
    pub max_jump: u64,
    /// Largest disagreement between the two counters before warning, in ticks.
    pub max_drift: u64,
    /// Largest spacing that still counts as a retrigger, in ticks.
    pub retrig_window: u64,
}

impl ClockConfig {
    /// Combine run settings with the filter's retrigger window.
    pub fn from_settings(settings: &ClockSettings, retrig_window: u64) -> Self {
        Self {
            max_jump: settings.max_jump_ticks,
            max_drift: settings.max_drift_ticks,
            retrig_window,
        }
    }
}

/// One reading of both hardware counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    /// 50 MHz counter.
    pub counter50: u64,
    /// 10 MHz counter.
    pub counter10: u64,
    /// Rollovers of the 50 MHz counter.
    pub epoch: u64,
    /// Extended 64-bit time.
    pub longtime: u64,
}

/// Kind of inconsistency found in a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anomaly {
    /// The 50 MHz counter went backwards without a plausible rollover.
    Backward,
    /// The 50 MHz counter jumped further ahead than allowed.
    ForwardGap,
}

/// How a sample was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOutcome {
    /// First sample of the run.
    Seeded,
    /// Consistent with the standard.
    Accepted,
    /// Consistent, and the 50 MHz counter wrapped.
    Rollover,
    /// The 50 MHz counter read zero; previous value reused.
    Orphan,
    /// Inconsistent; held back pending the next sample.
    Suspect(Anomaly),
    /// Second inconsistent sample in a row; the clock restarted.
    Reset(Anomaly),
}

/// Result of [`ClockModel::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockReading {
    /// Time to use for this record.
    pub longtime: u64,
    /// Current epoch.
    pub epoch: u64,
    /// Classification of the sample.
    pub outcome: ClockOutcome,
    /// Drift between the counters, when above the tolerance.
    pub drift_alarm: Option<u64>,
    /// Whether this event closely follows the previous one.
    pub retrigger: bool,
}

/// Clock state for the life of the process.
#[derive(Debug, Clone)]
pub struct ClockModel {
    config: ClockConfig,
    /// Last value handed out.
    last: Option<Timestamp>,
    /// Last accepted value.
    standard: Timestamp,
    problem: bool,
    orphans: u64,
}

impl ClockModel {
    /// Clock with no samples yet.
    pub fn new(config: ClockConfig) -> Self {
        Self {
            config,
            last: None,
            standard: Timestamp::default(),
            problem: false,
            orphans: 0,
        }
    }

    /// Feed one pair of raw counter readings.
    pub fn update(&mut self, counter50: u64, counter10: u64) -> ClockReading {
        let Some(prev) = self.last else {
            if counter50 == 0 {
                self.orphans += 1;
            }
            let seed = Timestamp {
                counter50,
                counter10,
                epoch: 0,
                longtime: counter50,
            };
            self.last = Some(seed);
            self.standard = seed;
            self.problem = false;
            return self.reading(seed, ClockOutcome::Seeded, None, false);
        };

        let drift = counter_drift(&prev, counter50, counter10);
        let drift_alarm = (drift > self.config.max_drift).then_some(drift);

        let retrigger = counter50 > prev.counter50 && counter50 - prev.counter50 <= self.config.retrig_window;

        if counter50 == 0 {
            self.orphans += 1;
            let held = Timestamp { counter10, ..prev };
            self.last = Some(held);
            return self.reading(held, ClockOutcome::Orphan, drift_alarm, false);
        }

        let candidate = Timestamp {
            counter50,
            counter10,
            epoch: self.standard.epoch,
            longtime: 0,
        };

        match self.check(candidate, drift) {
            Ok(rolled) => {
                let epoch = if rolled { candidate.epoch + 1 } else { candidate.epoch };
                let accepted = Timestamp {
                    epoch,
                    longtime: counter50 + epoch * MAX_TIME,
                    ..candidate
                };
                self.standard = accepted;
                self.last = Some(accepted);
                self.problem = false;
                let outcome = if rolled { ClockOutcome::Rollover } else { ClockOutcome::Accepted };
                self.reading(accepted, outcome, drift_alarm, retrigger)
            }
            Err(anomaly) if self.problem => {
                let restarted = Timestamp {
                    counter50,
                    counter10,
                    epoch: 0,
                    longtime: counter50,
                };
                self.standard = restarted;
                self.last = Some(restarted);
                self.problem = false;
                self.reading(restarted, ClockOutcome::Reset(anomaly), drift_alarm, retrigger)
            }
            Err(anomaly) => {
                self.problem = true;
                let held = self.standard;
                self.last = Some(held);
                self.reading(held, ClockOutcome::Suspect(anomaly), drift_alarm, retrigger)
            }
        }
    }

    /// Consistency test against the standard. `Ok(true)` means a plausible rollover.
    fn check(&self, candidate: Timestamp, drift: u64) -> Result<bool, Anomaly> {
        let standard = self.standard.counter50;
        let max_jump = self.config.max_jump;
        if candidate.counter50 < standard {
            let plausible_wrap = standard + candidate.counter50 < MAX_TIME + max_jump
                && drift < self.config.max_drift
                && standard > MAX_TIME.saturating_sub(max_jump);
            return if plausible_wrap { Ok(true) } else { Err(Anomaly::Backward) };
        }
        if candidate.counter50 - standard > max_jump {
            return Err(Anomaly::ForwardGap);
        }
        Ok(false)
    }

    fn reading(
        &self,
        ts: Timestamp,
        outcome: ClockOutcome,
        drift_alarm: Option<u64>,
        retrigger: bool,
    ) -> ClockReading {
        ClockReading {
            longtime: ts.longtime,
            epoch: ts.epoch,
            outcome,
            drift_alarm,
            retrigger,
        }
    }

    /// Whether the previous sample was held back as suspect.
    pub fn has_problem(&self) -> bool {
        self.problem
    }

    /// Last accepted timestamp.
    pub fn standard(&self) -> Timestamp {
        self.standard
    }

    /// Number of samples whose 50 MHz counter read zero.
    pub fn orphans(&self) -> u64 {
        self.orphans
    }
}

/// `|5 * d10 - d50|`, with the 50 MHz step taken modulo the counter width so that a
/// genuine rollover does not register as drift.
fn counter_drift(prev: &Timestamp, counter50: u64, counter10: u64) -> u64 {
    let d10 = i128::from(counter10) - i128::from(prev.counter10);
    let raw50 = counter50.wrapping_sub(prev.counter50) & (MAX_TIME - 1);
    let d50 = if raw50 >= MAX_TIME / 2 {
        i128::from(raw50) - i128::from(MAX_TIME)
    } else {
        i128::from(raw50)
    };
    let drift = (CLOCK_RATIO * d10 - d50).unsigned_abs();
    u64::try_from(drift).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ClockModel {
        ClockModel::new(ClockConfig {
            max_jump: 500_000_000,
            max_drift: 5000,
            retrig_window: 23,
        })
    }

    /// Feed a 50 MHz value with a perfectly consistent 10 MHz partner.
    fn feed(clock: &mut ClockModel, counter50: u64) -> ClockReading {
        clock.update(counter50, counter50 / 5)
    }

    #[test]
    fn first_sample_seeds() {
        let mut clock = model();
        let r = feed(&mut clock, 1_000);
        assert_eq!(r.outcome, ClockOutcome::Seeded);
        assert_eq!(r.longtime, 1_000);
        assert_eq!(r.epoch, 0);
    }

    #[test]
    fn rollover_increments_epoch_once() {
        let mut clock = model();
        clock.update(MAX_TIME - 5, 1_000);
        let r = clock.update(2, 1_001);
        assert_eq!(r.outcome, ClockOutcome::Rollover);
        assert_eq!(r.epoch, 1);
        assert_eq!(r.longtime, MAX_TIME + 2);
        assert_eq!(r.drift_alarm, None);

        let r = clock.update(500, 1_100);
        assert_eq!(r.outcome, ClockOutcome::Accepted);
        assert_eq!(r.epoch, 1);
        assert_eq!(r.longtime, MAX_TIME + 500);
    }

    #[test]
    fn single_glitch_does_not_move_standard() {
        let mut clock = model();
        feed(&mut clock, 10_000);
        let r = feed(&mut clock, 5_000);
        assert_eq!(r.outcome, ClockOutcome::Suspect(Anomaly::Backward));
        assert_eq!(r.longtime, 10_000);
        assert!(clock.has_problem());

        let r = feed(&mut clock, 20_000);
        assert_eq!(r.outcome, ClockOutcome::Accepted);
        assert_eq!(r.longtime, 20_000);
        assert!(!clock.has_problem());
    }

    #[test]
    fn two_strikes_reset_the_clock() {
        let mut clock = model();
        clock.update(MAX_TIME - 5, 1_000);
        clock.update(2, 1_001);
        let r = feed(&mut clock, 3_000_000_000);
        assert_eq!(r.outcome, ClockOutcome::Suspect(Anomaly::ForwardGap));
        assert_eq!(r.longtime, MAX_TIME + 2);

        let r = feed(&mut clock, 6_000_000_000);
        assert_eq!(r.outcome, ClockOutcome::Reset(Anomaly::ForwardGap));
        assert_eq!(r.epoch, 0);
        assert_eq!(r.longtime, 6_000_000_000);
        assert!(!clock.has_problem());
    }

    #[test]
    fn zero_counter_is_an_orphan() {
        let mut clock = model();
        feed(&mut clock, 7_000);
        let r = clock.update(0, 1_500);
        assert_eq!(r.outcome, ClockOutcome::Orphan);
        assert_eq!(r.longtime, 7_000);
        assert!(!r.retrigger);
        assert_eq!(clock.orphans(), 1);
    }

    #[test]
    fn retrigger_window_is_inclusive() {
        let mut clock = model();
        feed(&mut clock, 1_000);
        assert!(clock.update(1_023, 204).retrigger);
        assert!(!clock.update(1_047, 209).retrigger);
        assert!(!clock.update(1_047, 209).retrigger);
    }

    #[test]
    fn drift_is_informational() {
        let mut clock = model();
        clock.update(1_000_000, 200_000);
        let r = clock.update(1_100_000, 200_000);
        assert_eq!(r.outcome, ClockOutcome::Accepted);
        assert_eq!(r.drift_alarm, Some(100_000));
    }

    #[test]
    fn wrap_with_counter_drift_is_rejected() {
        let mut clock = model();
        clock.update(MAX_TIME - 5, 1_000);
        // 10 MHz counter moved 10,000 ticks while the 50 MHz one moved 7.
        let r = clock.update(2, 11_000);
        assert_eq!(r.outcome, ClockOutcome::Suspect(Anomaly::Backward));
        assert_eq!(r.drift_alarm, Some(49_993));
        assert_eq!(r.epoch, 0);
        assert_eq!(r.longtime, MAX_TIME - 5);
    }

    #[test]
    fn backward_far_from_wrap_is_not_a_rollover() {
        let mut clock = model();
        feed(&mut clock, MAX_TIME / 2);
        let r = feed(&mut clock, 100);
        assert_eq!(r.outcome, ClockOutcome::Suspect(Anomaly::Backward));
    }
}
