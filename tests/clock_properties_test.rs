//! Property tests for the extended clock.
//!
//! # Testing Strategy
//!
//! Counter sequences are generated the way the hardware produces them: the 50 MHz
//! counter advances by five times the 10 MHz step and wraps at 2^43. Any such sequence
//! must yield a strictly increasing `longtime`, whatever the starting value and however
//! many wraps happen along the way.

use proptest::prelude::*;
use zdab_l2::clock::{ClockConfig, ClockModel, ClockOutcome, MAX_TIME};

fn model() -> ClockModel {
    ClockModel::new(ClockConfig {
        max_jump: 500_000_000,
        max_drift: 5_000,
        retrig_window: 23,
    })
}

proptest! {
    #[test]
    fn consistent_counters_give_increasing_time(
        start in 1u64..MAX_TIME,
        start10 in 0u64..(1u64 << 40),
        steps in prop::collection::vec(1u64..40_000_000, 1..200),
    ) {
        let mut clock = model();
        let first = clock.update(start, start10);
        prop_assert_eq!(first.outcome, ClockOutcome::Seeded);

        let mut last = first.longtime;
        let mut c50 = start;
        let mut c10 = start10;
        let mut wraps = 0u64;
        for step in steps {
            let next = c50 + 5 * step;
            if next >= MAX_TIME {
                wraps += 1;
            }
            c50 = next % MAX_TIME;
            c10 += step;
            if c50 == 0 {
                // An orphan read would hold the time; skip the sample entirely.
                continue;
            }
            let reading = clock.update(c50, c10);
            prop_assert!(
                matches!(reading.outcome, ClockOutcome::Accepted | ClockOutcome::Rollover),
                "unexpected {:?}", reading.outcome
            );
            prop_assert!(reading.longtime > last);
            prop_assert_eq!(reading.drift_alarm, None);
            prop_assert_eq!(reading.epoch, wraps);
            last = reading.longtime;
        }
    }

    #[test]
    fn single_forward_glitch_is_absorbed(
        start in 1u64..MAX_TIME / 2,
        gap in 1u64..1_000_000_000,
        step in 1u64..1_000_000,
    ) {
        let mut clock = model();
        let seeded = clock.update(start, start / 5);

        let glitch = clock.update(start + 500_000_000 + gap, start / 5 + step);
        prop_assert!(matches!(glitch.outcome, ClockOutcome::Suspect(_)));
        prop_assert_eq!(glitch.longtime, seeded.longtime);

        let next = clock.update(start + 5 * step, start / 5 + step);
        prop_assert_eq!(next.outcome, ClockOutcome::Accepted);
        prop_assert_eq!(next.longtime, start + 5 * step);
        prop_assert!(!clock.has_problem());
    }
}
