//! Run statistics for the clawsort engine.
//!
//! Turns a run's [`Journal`] into timing metrics: total run time,
//! throughput, per-crane idle/busy/blocked time, per-scanner utilization
//! and ready-wait (time a finished scan sits waiting for the unloader).
//! Also runs the policy comparisons and scan-duration sweeps used to
//! judge assignment strategies.
//!
//! # Usage
//!
//! ```ignore
//! let mut stats = RunStats::new(StatsConfig::default(), scanner_count);
//! for record in engine.journal().iter() {
//!     stats.process_record(record);
//! }
//! let metrics = stats.finish(engine.now());
//! println!("{:.2} diamonds/min", metrics.throughput_per_min);
//! ```

use serde::Serialize;
use tracing::debug;

use clawsort_core::config::SimConfig;
use clawsort_core::crane::CranePhase;
use clawsort_core::engine::{Engine, SimError};
use clawsort_core::event::{Journal, JournalEntry, Record};
use clawsort_core::fixed::{MILLIS_PER_SEC, SimTime, millis_to_secs};
use clawsort_core::id::CraneId;
use clawsort_core::policy::AssignmentPolicy;
use clawsort_core::scanner::ScannerState;

const MILLIS_PER_MIN: SimTime = 60 * MILLIS_PER_SEC;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for the statistics module.
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Window size for the delivery history, in milliseconds.
    pub window: SimTime,
    /// Maximum number of windows retained.
    pub history_capacity: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            window: MILLIS_PER_MIN,
            history_capacity: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// RingBuffer
// ---------------------------------------------------------------------------

/// A fixed-capacity ring buffer of per-window delivery counts.
///
/// When full, the oldest entry is overwritten. Iterates oldest-to-newest.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    data: Vec<u32>,
    head: usize,
    len: usize,
}

impl RingBuffer {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "RingBuffer capacity must be > 0");
        Self {
            data: vec![0; capacity],
            head: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, value: u32) {
        let cap = self.capacity();
        self.data[self.head] = value;
        self.head = (self.head + 1) % cap;
        self.len = (self.len + 1).min(cap);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn latest(&self) -> Option<u32> {
        if self.len == 0 {
            return None;
        }
        let idx = (self.head + self.capacity() - 1) % self.capacity();
        Some(self.data[idx])
    }

    /// Values from oldest to newest.
    pub fn to_vec(&self) -> Vec<u32> {
        let start = if self.len < self.capacity() { 0 } else { self.head };
        (0..self.len)
            .map(|i| self.data[(start + i) % self.capacity()])
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Where one crane's time went, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CraneTimes {
    /// Idle, or waiting beside a scanner for it to empty.
    pub idle: SimTime,
    /// Moving, lowering, gripping or raising.
    pub busy: SimTime,
    /// Holding a denied rail request.
    pub blocked: SimTime,
}

impl CraneTimes {
    pub fn total(&self) -> SimTime {
        self.idle + self.busy + self.blocked
    }
}

/// Where one scanner's time went, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScannerTimes {
    pub idle: SimTime,
    pub scanning: SimTime,
    /// Done but not yet emptied.
    pub ready_wait: SimTime,
    pub scans: u32,
    /// Fraction of the run spent scanning.
    pub utilization: f64,
}

/// Summary of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetrics {
    pub total_time: SimTime,
    pub delivered: u32,
    pub throughput_per_min: f64,
    /// Mean time between consecutive deliveries, in seconds.
    pub mean_delivery_interval: Option<f64>,
    /// Blue first.
    pub cranes: [CraneTimes; 2],
    pub scanners: Vec<ScannerTimes>,
    pub total_ready_wait: SimTime,
    /// Deliveries per window, oldest first.
    pub history: Vec<u32>,
}

impl RunMetrics {
    pub fn crane(&self, id: CraneId) -> &CraneTimes {
        &self.cranes[id.index()]
    }

    /// Collect metrics for an engine's run so far. A finished run is
    /// measured up to its completion, anything else up to `now`.
    pub fn from_engine(engine: &Engine) -> Self {
        let end = engine.sim_state.finished_at.unwrap_or(engine.now());
        Self::from_journal(engine.journal(), engine.scanners().len(), end)
    }

    pub fn from_journal(journal: &Journal, scanner_count: usize, end: SimTime) -> Self {
        let mut stats = RunStats::new(StatsConfig::default(), scanner_count);
        for record in journal.iter() {
            if record.time > end {
                break;
            }
            stats.process_record(record);
        }
        stats.finish(end)
    }
}

// ---------------------------------------------------------------------------
// Per-entity trackers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CraneTracker {
    phase: CranePhase,
    since: SimTime,
    /// Time spent in non-idle phases, blocked time included.
    active: SimTime,
    idle: SimTime,
    blocked_since: Option<SimTime>,
    blocked: SimTime,
}

impl CraneTracker {
    fn new() -> Self {
        Self {
            phase: CranePhase::Idle,
            since: 0,
            active: 0,
            idle: 0,
            blocked_since: None,
            blocked: 0,
        }
    }

    fn close(&mut self, now: SimTime) {
        let span = now.saturating_sub(self.since);
        match self.phase {
            CranePhase::Idle | CranePhase::AwaitingScan => self.idle += span,
            _ => self.active += span,
        }
        self.since = now;
    }

    fn enter(&mut self, phase: CranePhase, now: SimTime) {
        self.close(now);
        self.phase = phase;
    }

    fn unblock(&mut self, now: SimTime) {
        if let Some(start) = self.blocked_since.take() {
            self.blocked += now.saturating_sub(start);
        }
    }

    fn times(&self) -> CraneTimes {
        CraneTimes {
            idle: self.idle,
            busy: self.active.saturating_sub(self.blocked),
            blocked: self.blocked,
        }
    }
}

#[derive(Debug, Clone)]
struct ScannerTracker {
    state: ScannerState,
    since: SimTime,
    times: ScannerTimes,
}

impl ScannerTracker {
    fn new() -> Self {
        Self {
            state: ScannerState::Idle,
            since: 0,
            times: ScannerTimes::default(),
        }
    }

    fn enter(&mut self, state: ScannerState, now: SimTime) {
        let span = now.saturating_sub(self.since);
        match self.state {
            ScannerState::Idle => self.times.idle += span,
            ScannerState::Scanning => self.times.scanning += span,
            ScannerState::Done => self.times.ready_wait += span,
        }
        if self.state == ScannerState::Scanning && state == ScannerState::Done {
            self.times.scans += 1;
        }
        self.state = state;
        self.since = now;
    }
}

// ---------------------------------------------------------------------------
// RunStats
// ---------------------------------------------------------------------------

/// Incremental metrics collector fed one journal record at a time.
#[derive(Debug, Clone)]
pub struct RunStats {
    config: StatsConfig,
    cranes: [CraneTracker; 2],
    scanners: Vec<ScannerTracker>,
    deliveries: Vec<SimTime>,
    history: RingBuffer,
    window_end: SimTime,
    window_count: u32,
    last_time: SimTime,
}

impl RunStats {
    pub fn new(config: StatsConfig, scanner_count: usize) -> Self {
        let window = config.window.max(1);
        Self {
            history: RingBuffer::new(config.history_capacity.max(1)),
            config: StatsConfig { window, ..config },
            cranes: [CraneTracker::new(), CraneTracker::new()],
            scanners: vec![ScannerTracker::new(); scanner_count],
            deliveries: Vec::new(),
            window_end: window,
            window_count: 0,
            last_time: 0,
        }
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    pub fn delivered(&self) -> u32 {
        self.deliveries.len() as u32
    }

    /// Close every window that ends at or before `now`.
    fn roll_windows(&mut self, now: SimTime) {
        while now >= self.window_end {
            self.history.push(self.window_count);
            self.window_count = 0;
            self.window_end += self.config.window;
        }
    }

    pub fn process_record(&mut self, record: &Record) {
        let now = record.time;
        self.roll_windows(now);
        self.last_time = self.last_time.max(now);
        match record.entry {
            JournalEntry::CranePhase { crane, to, .. } => {
                let c = &mut self.cranes[crane.index()];
                // A dropped request ends the wait without a grant.
                if matches!(to, CranePhase::Idle | CranePhase::AwaitingScan) {
                    c.unblock(now);
                }
                c.enter(to, now);
            }
            JournalEntry::RailDenied { crane, .. } => {
                let c = &mut self.cranes[crane.index()];
                c.blocked_since.get_or_insert(now);
            }
            JournalEntry::RailGranted { crane, .. } => {
                self.cranes[crane.index()].unblock(now);
            }
            JournalEntry::ScannerState { scanner, to, .. } => {
                if let Some(s) = self.scanners.get_mut(scanner.index()) {
                    s.enter(to, now);
                }
            }
            JournalEntry::Delivered { .. } => {
                self.deliveries.push(now);
                self.window_count += 1;
            }
            _ => {}
        }
    }

    /// Close all open intervals at `end` and produce the summary.
    pub fn finish(mut self, end: SimTime) -> RunMetrics {
        let end = end.max(self.last_time);
        for crane in &mut self.cranes {
            crane.unblock(end);
            crane.close(end);
        }
        for scanner in &mut self.scanners {
            let state = scanner.state;
            scanner.enter(state, end);
        }
        if self.window_count > 0 {
            self.history.push(self.window_count);
        }

        let delivered = self.delivered();
        let throughput_per_min = if end == 0 {
            0.0
        } else {
            delivered as f64 * MILLIS_PER_MIN as f64 / end as f64
        };
        let mean_delivery_interval = (self.deliveries.len() > 1).then(|| {
            let first = self.deliveries[0];
            let last = self.deliveries[self.deliveries.len() - 1];
            millis_to_secs(last - first) / (self.deliveries.len() - 1) as f64
        });
        let scanners: Vec<ScannerTimes> = self
            .scanners
            .iter()
            .map(|s| ScannerTimes {
                utilization: if end == 0 {
                    0.0
                } else {
                    s.times.scanning as f64 / end as f64
                },
                ..s.times
            })
            .collect();

        RunMetrics {
            total_time: end,
            delivered,
            throughput_per_min,
            mean_delivery_interval,
            cranes: [self.cranes[0].times(), self.cranes[1].times()],
            total_ready_wait: scanners.iter().map(|s| s.ready_wait).sum(),
            scanners,
            history: self.history.to_vec(),
        }
    }
}

// ---------------------------------------------------------------------------
// Measuring runs
// ---------------------------------------------------------------------------

/// Run `config` and measure it. With a `horizon`, the run is cut off at
/// that simulated time (the diamond count should then be large enough to
/// keep the line busy); otherwise it runs to completion.
pub fn measure(config: &SimConfig, horizon: Option<SimTime>) -> Result<RunMetrics, SimError> {
    let mut engine = Engine::new(config.clone())?;
    match horizon {
        Some(t) => {
            engine.start()?;
            engine.advance_until(t)?;
        }
        None => {
            engine.run_to_completion()?;
        }
    }
    let metrics = RunMetrics::from_engine(&engine);
    debug!(
        policy = %config.policy,
        pre_emptive = config.pre_emptive,
        scan_duration = config.scan_duration,
        total_time = metrics.total_time,
        delivered = metrics.delivered,
        "measured run"
    );
    Ok(metrics)
}

// ---------------------------------------------------------------------------
// Policy comparison
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonRow {
    pub policy: AssignmentPolicy,
    pub pre_emptive: bool,
    pub metrics: RunMetrics,
}

/// Run `base` under both policies with pre-emptive positioning on and off.
pub fn compare_policies(
    base: &SimConfig,
    horizon: Option<SimTime>,
) -> Result<Vec<ComparisonRow>, SimError> {
    let mut rows = Vec::with_capacity(4);
    for policy in [AssignmentPolicy::First, AssignmentPolicy::Last] {
        for pre_emptive in [true, false] {
            let config = SimConfig {
                policy,
                pre_emptive,
                ..base.clone()
            };
            rows.push(ComparisonRow {
                policy,
                pre_emptive,
                metrics: measure(&config, horizon)?,
            });
        }
    }
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Sweep
// ---------------------------------------------------------------------------

/// A grid of scan durations crossed with assignment policies.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepSpec {
    pub scan_durations: Vec<SimTime>,
    pub policies: Vec<AssignmentPolicy>,
    pub horizon: Option<SimTime>,
}

impl Default for SweepSpec {
    fn default() -> Self {
        Self {
            scan_durations: vec![10_000, 15_000, 20_000, 30_000],
            policies: vec![AssignmentPolicy::First, AssignmentPolicy::Last],
            horizon: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepPoint {
    pub scan_duration: SimTime,
    pub policy: AssignmentPolicy,
    pub metrics: RunMetrics,
}

/// Measure every (scan duration, policy) pair of `spec` on top of `base`.
/// Points come back in grid order: scan duration major, policy minor.
pub fn sweep(base: &SimConfig, spec: &SweepSpec) -> Result<Vec<SweepPoint>, SimError> {
    let grid: Vec<(SimTime, AssignmentPolicy)> = spec
        .scan_durations
        .iter()
        .flat_map(|&d| spec.policies.iter().map(move |&p| (d, p)))
        .collect();

    let run = |&(scan_duration, policy): &(SimTime, AssignmentPolicy)| {
        let config = SimConfig {
            scan_duration,
            policy,
            ..base.clone()
        };
        measure(&config, spec.horizon).map(|metrics| SweepPoint {
            scan_duration,
            policy,
            metrics,
        })
    };

    #[cfg(feature = "parallel")]
    let points = {
        use rayon::prelude::*;
        grid.par_iter().map(run).collect()
    };
    #[cfg(not(feature = "parallel"))]
    let points = grid.iter().map(run).collect();
    points
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use clawsort_core::id::ScannerId;
    use clawsort_core::test_utils::*;

    fn record(time: SimTime, entry: JournalEntry) -> Record {
        Record { time, entry }
    }

    // -----------------------------------------------------------------------
    // RingBuffer
    // -----------------------------------------------------------------------

    #[test]
    fn ring_buffer_overwrites_oldest() {
        let mut rb = RingBuffer::new(3);
        assert!(rb.is_empty());
        for v in 1..=5 {
            rb.push(v);
        }
        assert_eq!(rb.len(), 3);
        assert_eq!(rb.latest(), Some(5));
        assert_eq!(rb.to_vec(), vec![3, 4, 5]);
    }

    #[test]
    fn ring_buffer_partial() {
        let mut rb = RingBuffer::new(4);
        rb.push(7);
        rb.push(8);
        assert_eq!(rb.to_vec(), vec![7, 8]);
    }

    // -----------------------------------------------------------------------
    // Collector
    // -----------------------------------------------------------------------

    #[test]
    fn crane_time_split() {
        let mut stats = RunStats::new(StatsConfig::default(), 1);
        let blue = CraneId::Blue;
        let phase = |from, to| JournalEntry::CranePhase {
            crane: blue,
            from,
            to,
        };
        stats.process_record(&record(100, phase(CranePhase::Idle, CranePhase::MovingToPickup)));
        stats.process_record(&record(
            100,
            JournalEntry::RailDenied {
                crane: blue,
                to: fixed(120.0),
                retry_at: Some(400),
            },
        ));
        stats.process_record(&record(
            400,
            JournalEntry::RailGranted {
                crane: blue,
                from: fixed(300.0),
                to: fixed(120.0),
                arrive: 900,
            },
        ));
        stats.process_record(&record(900, phase(CranePhase::MovingToPickup, CranePhase::Lowering)));
        let m = stats.finish(1_000);
        let t = m.crane(blue);
        assert_eq!(t.idle, 100);
        assert_eq!(t.blocked, 300);
        assert_eq!(t.busy, 600);
        assert_eq!(t.total(), 1_000);
    }

    #[test]
    fn scanner_ready_wait_and_utilization() {
        let mut stats = RunStats::new(StatsConfig::default(), 1);
        let s = ScannerId(0);
        let change = |from, to| JournalEntry::ScannerState {
            scanner: s,
            from,
            to,
        };
        stats.process_record(&record(1_000, change(ScannerState::Idle, ScannerState::Scanning)));
        stats.process_record(&record(3_000, change(ScannerState::Scanning, ScannerState::Done)));
        stats.process_record(&record(3_500, change(ScannerState::Done, ScannerState::Idle)));
        let m = stats.finish(4_000);
        let t = m.scanners[0];
        assert_eq!(t.idle, 1_500);
        assert_eq!(t.scanning, 2_000);
        assert_eq!(t.ready_wait, 500);
        assert_eq!(t.scans, 1);
        assert!((t.utilization - 0.5).abs() < 1e-9);
        assert_eq!(m.total_ready_wait, 500);
    }

    #[test]
    fn deliveries_fill_windows() {
        let cfg = StatsConfig {
            window: 1_000,
            history_capacity: 8,
        };
        let mut stats = RunStats::new(cfg, 0);
        let delivered = |serial| JournalEntry::Delivered {
            crane: CraneId::Red,
            serial,
            target: clawsort_core::id::BoxId(0),
        };
        stats.process_record(&record(200, delivered(1)));
        stats.process_record(&record(700, delivered(2)));
        stats.process_record(&record(2_500, delivered(3)));
        let m = stats.finish(3_000);
        assert_eq!(m.delivered, 3);
        assert_eq!(m.history, vec![2, 0, 1]);
        assert!((m.mean_delivery_interval.unwrap() - 1.15).abs() < 1e-9);
        assert!((m.throughput_per_min - 60.0).abs() < 1e-9);
    }

    // -----------------------------------------------------------------------
    // Whole runs
    // -----------------------------------------------------------------------

    #[test]
    fn metrics_cover_whole_run() {
        let engine = run(config(2, 6));
        let m = RunMetrics::from_engine(&engine);
        assert_eq!(m.delivered, 6);
        assert_eq!(Some(m.total_time), engine.sim_state.finished_at);
        for id in CraneId::ALL {
            assert_eq!(m.crane(id).total(), m.total_time);
        }
        let scans: u32 = m.scanners.iter().map(|s| s.scans).sum();
        assert_eq!(scans, 6);
        for s in &m.scanners {
            assert_eq!(s.idle + s.scanning + s.ready_wait, m.total_time);
        }
    }

    #[test]
    fn pre_lowering_keeps_ready_wait_low() {
        let on = measure(&config(1, 4), None).unwrap();
        let off = measure(&reactive(1, 4), None).unwrap();
        assert!(on.total_ready_wait < off.total_ready_wait);
    }

    #[test]
    fn horizon_cuts_the_run() {
        let m = measure(&config(2, 1_000), Some(120_000)).unwrap();
        assert_eq!(m.total_time, 120_000);
        assert!(m.delivered > 0);
        assert!(m.delivered < 1_000);
    }

    #[test]
    fn comparison_has_four_rows() {
        let rows = compare_policies(&config(2, 4), None).unwrap();
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.metrics.delivered == 4));
        assert_eq!(rows[0].policy, AssignmentPolicy::First);
        assert!(rows[0].pre_emptive);
    }

    #[test]
    fn sweep_grid_order() {
        let spec = SweepSpec {
            scan_durations: vec![5_000, 20_000],
            policies: vec![AssignmentPolicy::First, AssignmentPolicy::Last],
            horizon: None,
        };
        let points = sweep(&config(2, 3), &spec).unwrap();
        let keys: Vec<_> = points.iter().map(|p| (p.scan_duration, p.policy)).collect();
        assert_eq!(
            keys,
            vec![
                (5_000, AssignmentPolicy::First),
                (5_000, AssignmentPolicy::Last),
                (20_000, AssignmentPolicy::First),
                (20_000, AssignmentPolicy::Last),
            ]
        );
    }

    #[test]
    fn sweep_propagates_config_errors() {
        let spec = SweepSpec {
            scan_durations: vec![0],
            ..SweepSpec::default()
        };
        assert!(matches!(sweep(&config(2, 3), &spec), Err(SimError::Config(_))));
    }

    #[test]
    fn metrics_serialize_to_json() {
        let m = measure(&config(1, 1), None).unwrap();
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"throughput_per_min\""));
    }
}
