//! Scanner assignment for a diamond the loader has just lifted.
//!
//! The policy sees only scanner state and never randomness, so the same
//! scanner set always yields the same choice.

use serde::{Deserialize, Serialize};

use crate::id::ScannerId;
use crate::scanner::Scanner;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssignmentPolicy {
    /// Earliest-available scanner. Idle scanners win over busy ones; among
    /// idle scanners the one idle longest, among busy ones the soonest to
    /// finish.
    #[default]
    First,
    /// Most recently idled scanner, or if none is idle, the one finishing
    /// last. A deliberately weak baseline for comparison.
    Last,
}

impl AssignmentPolicy {
    pub fn name(self) -> &'static str {
        match self {
            AssignmentPolicy::First => "first",
            AssignmentPolicy::Last => "last",
        }
    }

    /// Pick a scanner. Ties go to the lowest index. `None` only if there
    /// are no scanners at all.
    pub fn select(self, scanners: &[Scanner]) -> Option<ScannerId> {
        match self {
            AssignmentPolicy::First => scanners
                .iter()
                .min_by_key(|s| (!s.is_idle(), s.availability(), s.id))
                .map(|s| s.id),
            AssignmentPolicy::Last => {
                let idle = scanners
                    .iter()
                    .filter(|s| s.is_idle())
                    .max_by_key(|s| (s.idle_since(), std::cmp::Reverse(s.id)));
                idle.or_else(|| {
                    scanners
                        .iter()
                        .max_by_key(|s| (s.availability(), std::cmp::Reverse(s.id)))
                })
                .map(|s| s.id)
            }
        }
    }
}

impl std::fmt::Display for AssignmentPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for AssignmentPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "first" => Ok(AssignmentPolicy::First),
            "last" => Ok(AssignmentPolicy::Last),
            other => Err(format!("unknown policy `{other}` (expected first or last)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diamond::Diamond;
    use crate::fixed::f64_to_fixed64;
    use crate::id::{BoxId, DiamondId};
    use slotmap::SlotMap;

    fn scanners(n: u8) -> Vec<Scanner> {
        (0..n)
            .map(|i| Scanner::new(ScannerId(i), f64_to_fixed64(550.0 + 120.0 * i as f64), 18_000))
            .collect()
    }

    fn diamond() -> DiamondId {
        let mut diamonds: SlotMap<DiamondId, Diamond> = SlotMap::with_key();
        diamonds.insert(Diamond::new(1, BoxId(0)))
    }

    /// Cycle a scanner through a scan so that it is idle since `idle_at`.
    fn idle_since(s: &mut Scanner, started: u64, idle_at: u64) {
        s.begin_scan(diamond(), started).unwrap();
        s.complete(started + s.scan_duration).unwrap();
        s.remove(idle_at).unwrap();
    }

    #[test]
    fn all_idle_ties_go_to_lowest_index() {
        let s = scanners(4);
        assert_eq!(AssignmentPolicy::First.select(&s), Some(ScannerId(0)));
        assert_eq!(AssignmentPolicy::Last.select(&s), Some(ScannerId(0)));
    }

    #[test]
    fn first_prefers_idle_over_busy() {
        let mut s = scanners(2);
        s[0].begin_scan(diamond(), 0).unwrap();
        assert_eq!(AssignmentPolicy::First.select(&s), Some(ScannerId(1)));
    }

    #[test]
    fn first_picks_earliest_completion_when_all_busy() {
        let mut s = scanners(3);
        s[0].begin_scan(diamond(), 5_000).unwrap();
        s[1].begin_scan(diamond(), 1_000).unwrap();
        s[2].begin_scan(diamond(), 3_000).unwrap();
        assert_eq!(AssignmentPolicy::First.select(&s), Some(ScannerId(1)));
    }

    #[test]
    fn first_treats_done_as_available_at_completion() {
        let mut s = scanners(2);
        s[0].begin_scan(diamond(), 0).unwrap();
        s[1].begin_scan(diamond(), 2_000).unwrap();
        s[1].complete(20_000).unwrap();
        // Scanner 0 is still scanning until 18 s, scanner 1 finished at 20 s.
        assert_eq!(AssignmentPolicy::First.select(&s), Some(ScannerId(0)));
    }

    #[test]
    fn first_picks_longest_idle() {
        let mut s = scanners(3);
        idle_since(&mut s[0], 0, 30_000);
        idle_since(&mut s[1], 0, 20_000);
        idle_since(&mut s[2], 0, 25_000);
        assert_eq!(AssignmentPolicy::First.select(&s), Some(ScannerId(1)));
    }

    #[test]
    fn last_picks_most_recently_idled() {
        let mut s = scanners(3);
        idle_since(&mut s[0], 0, 30_000);
        idle_since(&mut s[1], 0, 20_000);
        s[2].begin_scan(diamond(), 31_000).unwrap();
        assert_eq!(AssignmentPolicy::Last.select(&s), Some(ScannerId(0)));
    }

    #[test]
    fn last_picks_latest_completion_when_none_idle() {
        let mut s = scanners(3);
        s[0].begin_scan(diamond(), 5_000).unwrap();
        s[1].begin_scan(diamond(), 1_000).unwrap();
        s[2].begin_scan(diamond(), 5_000).unwrap();
        // Scanners 0 and 2 tie on completion; lowest index wins.
        assert_eq!(AssignmentPolicy::Last.select(&s), Some(ScannerId(0)));
    }

    #[test]
    fn no_scanners_no_choice() {
        assert_eq!(AssignmentPolicy::First.select(&[]), None);
        assert_eq!(AssignmentPolicy::Last.select(&[]), None);
    }

    #[test]
    fn parses_names() {
        assert_eq!("First".parse::<AssignmentPolicy>(), Ok(AssignmentPolicy::First));
        assert_eq!("last".parse::<AssignmentPolicy>(), Ok(AssignmentPolicy::Last));
        assert!("middle".parse::<AssignmentPolicy>().is_err());
    }
}
