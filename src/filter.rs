//! L2 event selection.
//!
//! An event passes if any of three independent tests pass. Each test owns one bit of
//! the category code, so the eight categories are exactly the eight combinations and
//! category 0 is the only rejecting one.

use crate::config::FilterConfig;
use serde::Serialize;

/// Hit-count test bit.
pub const NHIT_BIT: u8 = 0b001;
/// External-trigger test bit.
pub const EXTERNAL_BIT: u8 = 0b010;
/// Retrigger test bit.
pub const RETRIGGER_BIT: u8 = 0b100;

/// Number of distinct categories.
pub const CATEGORY_COUNT: usize = 8;

/// Human-readable label for each category, indexed by category code.
pub const CATEGORY_LABELS: [&str; CATEGORY_COUNT] = [
    "pass no cut",
    "pass only nhit cut",
    "pass only external trigger cut",
    "pass both external trigger and nhit cuts",
    "pass only retrigger cut",
    "pass both retrigger and nhit cuts",
    "pass both retrigger and external trigger cuts",
    "pass all three cuts",
];

/// Outcome of classifying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the event is written to the primary output.
    pub accept: bool,
    /// Bitwise OR of the passing tests.
    pub category: u8,
}

impl Verdict {
    fn from_category(category: u8) -> Self {
        Self {
            accept: category != 0,
            category,
        }
    }
}

/// Thresholds used by [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cuts {
    /// Hit-count cut in force for this event.
    pub nhit: u32,
    /// External trigger bits.
    pub bitmask: u32,
    /// Hit-count cut for retriggers.
    pub retrig: u32,
}

/// Pure classification against fixed cuts.
pub fn classify(cuts: Cuts, nhit: u32, trigger_word: u32, pass_latch: bool, retrigger: bool) -> Verdict {
    let mut category = 0;
    if nhit > cuts.nhit {
        category |= NHIT_BIT;
    }
    if trigger_word & cuts.bitmask != 0 {
        category |= EXTERNAL_BIT;
    }
    if pass_latch && retrigger && nhit > cuts.retrig {
        category |= RETRIGGER_BIT;
    }
    Verdict::from_category(category)
}

/// Per-category tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryTally(pub [u64; CATEGORY_COUNT]);

impl CategoryTally {
    /// Count one event.
    pub fn record(&mut self, verdict: Verdict) {
        self.0[usize::from(verdict.category & 0b111)] += 1;
    }

    /// Total events counted.
    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    /// Events accepted.
    pub fn accepted(&self) -> u64 {
        self.total() - self.0[0]
    }

    /// `(label, count)` pairs in category order.
    pub fn labelled(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        CATEGORY_LABELS.iter().copied().zip(self.0.iter().copied())
    }
}

/// Stateful L2 filter: dynamic hit-count cut and retrigger latch.
#[derive(Debug, Clone)]
pub struct L2Filter {
    config: FilterConfig,
    current_cut: u32,
    low_until: u64,
    pass_latch: bool,
}

impl L2Filter {
    /// Filter starting at the high cut with the latch cleared.
    pub fn new(config: FilterConfig) -> Self {
        Self {
            current_cut: config.nhit_hi,
            config,
            low_until: 0,
            pass_latch: false,
        }
    }

    /// Lower the cut after a large event and restore it once the window has elapsed.
    pub fn update_threshold(&mut self, nhit: u32, longtime: u64) {
        if nhit > self.config.large_event_threshold {
            self.low_until = longtime.saturating_add(self.config.low_window);
            self.current_cut = self.config.nhit_lo;
        }
        if longtime > self.low_until {
            self.current_cut = self.config.nhit_hi;
        }
    }

    /// Classify one event and update the latch.
    pub fn evaluate(&mut self, nhit: u32, trigger_word: u32, retrigger: bool) -> Verdict {
        if !retrigger {
            self.pass_latch = false;
        }
        let verdict = classify(self.cuts(), nhit, trigger_word, self.pass_latch, retrigger);
        if verdict.accept {
            self.pass_latch = true;
        }
        verdict
    }

    /// Forget the lowered cut, as after a clock discontinuity.
    pub fn reset_threshold(&mut self) {
        self.low_until = 0;
        self.current_cut = self.config.nhit_hi;
    }

    /// Cuts currently in force.
    pub fn cuts(&self) -> Cuts {
        Cuts {
            nhit: self.current_cut,
            bitmask: self.config.bitmask,
            retrig: self.config.retrig_cut,
        }
    }

    /// Whether the previous event was accepted and no retrigger gap has intervened.
    pub fn pass_latch(&self) -> bool {
        self.pass_latch
    }
}
