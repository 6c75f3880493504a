//! Property-based tests for the clawsort core engine.
//!
//! Uses proptest to generate random facility configurations, then runs
//! them to completion and verifies the structural properties every run
//! must have.

use clawsort_core::config::SimConfig;
use clawsort_core::engine::{Engine, StepOutcome};
use clawsort_core::event::JournalEntry;
use clawsort_core::policy::AssignmentPolicy;
use clawsort_core::sim::RunStatus;
use clawsort_core::validation::{diff_journals, validate_determinism};
use proptest::prelude::*;

/// Generous ceiling on dispatches for any generated config.
const MAX_EVENTS: u64 = 20_000;

// ===========================================================================
// Generators
// ===========================================================================

fn arb_policy() -> impl Strategy<Value = AssignmentPolicy> {
    prop_oneof![Just(AssignmentPolicy::First), Just(AssignmentPolicy::Last)]
}

/// A valid configuration on the default rail layout.
fn arb_config() -> impl Strategy<Value = SimConfig> {
    (
        1..=4u8,
        0..=14u32,
        (100.0..800.0f64, 500..40_000u64, 1..3_000u64, 0..600u64),
        arb_policy(),
        (any::<bool>(), any::<bool>(), any::<bool>()),
        1..=8u8,
        any::<u64>(),
    )
        .prop_map(
            |(scanners, diamonds, (speed, scan, hoist, grip), policy, flags, boxes, seed)| {
                let (side_view, pre_emptive, shuffle) = flags;
                SimConfig {
                    scanner_count: scanners,
                    diamond_count: diamonds,
                    crane_speed: speed,
                    scan_duration: scan,
                    hoist_duration: hoist,
                    grip_duration: grip,
                    policy,
                    side_view,
                    pre_emptive,
                    shuffle,
                    box_count: boxes,
                    seed,
                    ..SimConfig::default()
                }
            },
        )
}

// ===========================================================================
// Properties
// ===========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Every run terminates within a bounded number of events with every
    /// diamond delivered.
    #[test]
    fn every_run_finishes(cfg in arb_config()) {
        let mut engine = Engine::new(cfg.clone()).unwrap();
        let status = engine.run_bounded(MAX_EVENTS).unwrap();
        prop_assert_eq!(status, RunStatus::Finished);
        prop_assert_eq!(engine.delivered(), cfg.diamond_count as usize);
        prop_assert_eq!(engine.live_diamonds(), 0);
        prop_assert_eq!(engine.start_remaining(), 0);
    }

    /// Timestamps never decrease and every scan lasts exactly the scan
    /// duration.
    #[test]
    fn time_is_monotone_and_scans_are_exact(cfg in arb_config()) {
        let mut engine = Engine::new(cfg.clone()).unwrap();
        engine.run_bounded(MAX_EVENTS).unwrap();
        let mut last = 0;
        for r in engine.journal().iter() {
            prop_assert!(r.time >= last);
            last = r.time;
        }
        let mut started = std::collections::BTreeMap::new();
        for r in engine.journal().iter() {
            match r.entry {
                JournalEntry::ScanStarted { serial, .. } => {
                    started.insert(serial, r.time);
                }
                JournalEntry::ScanFinished { serial, .. } => {
                    prop_assert_eq!(Some(r.time - cfg.scan_duration), started.get(&serial).copied());
                }
                _ => {}
            }
        }
        prop_assert_eq!(started.len(), cfg.diamond_count as usize);
    }

    /// A scanner never starts a new scan before its previous diamond was
    /// retrieved.
    #[test]
    fn scanners_hold_one_diamond_at_a_time(cfg in arb_config()) {
        let mut engine = Engine::new(cfg.clone()).unwrap();
        engine.run_bounded(MAX_EVENTS).unwrap();
        let mut busy = vec![false; cfg.scanner_count as usize];
        for r in engine.journal().iter() {
            match r.entry {
                JournalEntry::ScanStarted { scanner, .. } => {
                    prop_assert!(!busy[scanner.index()]);
                    busy[scanner.index()] = true;
                }
                JournalEntry::Retrieved { scanner, .. } => {
                    prop_assert!(busy[scanner.index()]);
                    busy[scanner.index()] = false;
                }
                _ => {}
            }
        }
        prop_assert!(busy.iter().all(|b| !b));
    }

    /// Identical configuration and seed give an identical journal.
    #[test]
    fn runs_are_deterministic(cfg in arb_config()) {
        let mut a = Engine::new(cfg.clone()).unwrap();
        let mut b = Engine::new(cfg).unwrap();
        a.run_bounded(MAX_EVENTS).unwrap();
        b.run_bounded(MAX_EVENTS).unwrap();
        prop_assert_eq!(diff_journals(a.journal(), b.journal()), None);
        prop_assert_eq!(a.state_hash(), b.state_hash());
    }

    /// The invariant checker never fires while stepping a valid config.
    #[test]
    fn stepping_never_halts(cfg in arb_config()) {
        let mut engine = Engine::new(cfg).unwrap();
        engine.start().unwrap();
        let mut n = 0;
        loop {
            let outcome = engine.skip();
            prop_assert!(outcome.is_ok(), "halted: {:?}", outcome);
            if outcome.unwrap() == StepOutcome::Finished {
                break;
            }
            n += 1;
            prop_assert!(n < MAX_EVENTS);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn side_by_side_hashes_agree(cfg in arb_config()) {
        let result = validate_determinism(&cfg, MAX_EVENTS).unwrap();
        prop_assert!(result.is_deterministic);
    }
}
