//! The simulation controller: owns every entity and drives the
//! pick -> scan -> place cycle from the event queue.
//!
//! # Architecture
//!
//! The `Engine` owns:
//! - An [`EventQueue`] (the clock)
//! - The [`Rail`] with both crane positions and reservations
//! - Two [`Crane`]s: Blue loads scanners, Red unloads them
//! - 1..=4 [`Scanner`]s
//! - All live [`Diamond`]s, the [`StartPoint`] and the [`EndBox`]es
//! - The seeded [`SimRng`] and the run [`Journal`]
//!
//! # Dispatch
//!
//! Each dispatch pops one event, applies its transition, then runs the
//! drive pass: every crane with something to do (a denied rail request to
//! retry, a waiting loader whose scanner emptied, an idle unloader with
//! work) gets a chance to act. Invariants are checked after every
//! dispatch; a violation halts the engine for good.

use slotmap::SlotMap;
use tracing::{debug, info, trace, warn};

use crate::config::{ConfigError, SimConfig};
use crate::crane::{Crane, CraneFault, CranePhase, CraneRole, RailRequest, Task, Wakeup};
use crate::diamond::{Diamond, DiamondLocation, EndBox, StartPoint};
use crate::event::{Event, EventKind, EventQueue, Journal, JournalEntry};
use crate::fixed::{Fixed64, SimTime, f64_to_fixed64, travel_time};
use crate::id::{BoxId, CraneId, DiamondId, ScannerId};
use crate::query::{CraneSnapshot, RailSnapshot, ScannerSnapshot, Snapshot};
use crate::rail::{Interval, Rail, RailDecision, RailError};
use crate::rng::SimRng;
use crate::scanner::{Scanner, ScannerFault, ScannerState};
use crate::sim::{Pacing, RunStatus, SimState, StateHash};

/// The crane that carries diamonds into scanners.
pub const LOADER: CraneId = CraneId::Blue;
/// The crane that carries diamonds out of scanners.
pub const UNLOADER: CraneId = CraneId::Red;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A state the controller must never reach. Always fatal.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvariantViolation {
    #[error(transparent)]
    Rail(#[from] RailError),
    #[error(transparent)]
    Crane(#[from] CraneFault),
    #[error(transparent)]
    Scanner(#[from] ScannerFault),
    #[error("{event:?} references unknown {entity}")]
    UnknownEntity { event: Event, entity: &'static str },
    #[error("{crane} crane received {event:?} while {phase:?}")]
    UnexpectedEvent {
        crane: CraneId,
        phase: CranePhase,
        event: EventKind,
    },
    #[error("diamond {serial} is recorded at {recorded:?} but held by {holder:?}")]
    OwnerMismatch {
        serial: u32,
        recorded: DiamondLocation,
        holder: Option<DiamondLocation>,
    },
    #[error("diamond {serial} has more than one owner")]
    MultipleOwners { serial: u32 },
    #[error("a container holds a diamond that no longer exists")]
    UnknownDiamond,
    #[error("expected {expected} diamonds in the facility, found {found}")]
    DiamondCount { expected: u32, found: usize },
    #[error("diamond {serial} reached the unloader without a scan result")]
    Unscanned { serial: u32 },
    #[error("{scanner} is {state:?} but holding = {holding}")]
    ScanExclusivity {
        scanner: ScannerId,
        state: ScannerState,
        holding: bool,
    },
    #[error("event queue ran dry at {at} ms with work remaining")]
    Stalled { at: SimTime },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("configuration is frozen once the run has started")]
    AlreadyStarted,
    #[error("the run has not been started")]
    NotStarted,
    #[error("invariant violated: {violation}")]
    Invariant {
        violation: InvariantViolation,
        /// State at the moment of failure.
        snapshot: Box<Snapshot>,
    },
    #[error("engine halted after an earlier invariant violation")]
    Halted,
}

/// Result of a single `step()` / `skip()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Paused; nothing was dispatched.
    Paused,
    Dispatched { time: SimTime, event: Event },
    /// The run is complete. Returned by the final dispatch and every call
    /// after it.
    Finished,
}

/// A scanner the unloader could serve next. Orders by when work on it can
/// start, then by scan completion, then by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Candidate {
    /// Scan completion or the loader clearing the way, whichever is later.
    ready: SimTime,
    completion: SimTime,
    scanner: ScannerId,
    reachable_at: SimTime,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Engine {
    pub(crate) config: SimConfig,
    speed: Fixed64,
    hoist: SimTime,
    pub(crate) queue: EventQueue,
    pub(crate) rail: Rail,
    pub(crate) cranes: [Crane; 2],
    pub(crate) scanners: Vec<Scanner>,
    pub(crate) diamonds: SlotMap<DiamondId, Diamond>,
    pub(crate) start: StartPoint,
    pub(crate) boxes: Vec<EndBox>,
    rng: SimRng,
    journal: Journal,
    pub sim_state: SimState,
    violation: Option<InvariantViolation>,
}

impl Engine {
    /// Validate `config` and lay out the facility. The Start Point is
    /// filled here, so the diamond grades and draw order are fixed by the
    /// seed before the run starts.
    pub fn new(config: SimConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let l = &config.layout;
        let rail = Rail::new(
            Interval::new(f64_to_fixed64(l.rail_start), f64_to_fixed64(l.rail_end)),
            f64_to_fixed64(l.clearance),
            f64_to_fixed64(l.start_position),
            f64_to_fixed64(l.box_origin),
        )?;

        let scanners = (0..config.scanner_count)
            .map(|i| {
                let id = ScannerId(i);
                Scanner::new(id, config.scanner_position(id), config.scan_duration)
            })
            .collect();
        let boxes = (0..config.box_count).map(|i| EndBox::new(BoxId(i))).collect();

        let mut rng = SimRng::new(config.seed);
        let mut diamonds = SlotMap::with_key();
        let mut order: Vec<DiamondId> = (1..=config.diamond_count)
            .map(|serial| {
                let grade = BoxId(rng.below(config.box_count as u32) as u8);
                diamonds.insert(Diamond::new(serial, grade))
            })
            .collect();
        if config.shuffle {
            rng.shuffle(&mut order);
        }
        let mut start = StartPoint::new();
        for id in order {
            start.push(id);
        }

        Ok(Self {
            speed: config.speed_fixed(),
            hoist: config.effective_hoist(),
            config,
            queue: EventQueue::new(),
            rail,
            cranes: [
                Crane::new(LOADER, CraneRole::Loader),
                Crane::new(UNLOADER, CraneRole::Unloader),
            ],
            scanners,
            diamonds,
            start,
            boxes,
            rng,
            journal: Journal::new(),
            sim_state: SimState::new(),
            violation: None,
        })
    }

    /// Replace the configuration. Only allowed before `start()`.
    pub fn configure(&mut self, config: SimConfig) -> Result<(), SimError> {
        if self.sim_state.status != RunStatus::NotStarted {
            return Err(SimError::AlreadyStarted);
        }
        let paused = self.sim_state.paused;
        *self = Engine::new(config)?;
        self.sim_state.paused = paused;
        Ok(())
    }

    /// Begin the run: the loader heads for the Start Point.
    pub fn start(&mut self) -> Result<(), SimError> {
        match self.sim_state.status {
            RunStatus::NotStarted => {}
            RunStatus::Halted => return Err(SimError::Halted),
            RunStatus::Running | RunStatus::Finished => return Err(SimError::AlreadyStarted),
        }
        self.sim_state.status = RunStatus::Running;
        info!(
            scanners = self.config.scanner_count,
            diamonds = self.config.diamond_count,
            policy = %self.config.policy,
            pre_emptive = self.config.pre_emptive,
            side_view = self.config.side_view,
            seed = self.config.seed,
            "run started"
        );
        let result = self.drive().and_then(|()| self.check());
        self.settle(result).map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    /// Dispatch one event unless paused.
    pub fn step(&mut self) -> Result<StepOutcome, SimError> {
        self.ensure_running()?;
        if self.sim_state.status == RunStatus::Finished {
            return Ok(StepOutcome::Finished);
        }
        if self.sim_state.paused {
            return Ok(StepOutcome::Paused);
        }
        self.dispatch_next()
    }

    /// Dispatch one event regardless of pause.
    pub fn skip(&mut self) -> Result<StepOutcome, SimError> {
        self.ensure_running()?;
        if self.sim_state.status == RunStatus::Finished {
            return Ok(StepOutcome::Finished);
        }
        self.dispatch_next()
    }

    /// Dispatch every event due at or before `t`, then move the clock to
    /// `t`. Ignores pause. Returns the number of events dispatched.
    pub fn advance_until(&mut self, t: SimTime) -> Result<u64, SimError> {
        self.ensure_running()?;
        let mut count = 0;
        while self.sim_state.is_running() {
            match self.queue.peek_time() {
                Some(at) if at <= t => {
                    self.dispatch_next()?;
                    count += 1;
                }
                _ => break,
            }
        }
        if self.sim_state.is_running() {
            self.queue.advance_to(t);
        }
        Ok(count)
    }

    /// Start if needed and dispatch until the run finishes. Returns the
    /// completion time.
    pub fn run_to_completion(&mut self) -> Result<SimTime, SimError> {
        if self.sim_state.status == RunStatus::NotStarted {
            self.start()?;
        }
        self.ensure_running()?;
        while self.sim_state.is_running() {
            self.dispatch_next()?;
        }
        Ok(self.sim_state.finished_at.unwrap_or(self.queue.now()))
    }

    /// Like [`Engine::run_to_completion`] but gives up after `max_events`
    /// dispatches. Returns the status reached.
    pub fn run_bounded(&mut self, max_events: u64) -> Result<RunStatus, SimError> {
        if self.sim_state.status == RunStatus::NotStarted {
            self.start()?;
        }
        self.ensure_running()?;
        let mut n = 0;
        while self.sim_state.is_running() && n < max_events {
            self.dispatch_next()?;
            n += 1;
        }
        Ok(self.sim_state.status)
    }

    pub fn pause(&mut self) {
        self.sim_state.paused = true;
    }

    pub fn resume(&mut self) {
        self.sim_state.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.sim_state.paused
    }

    fn ensure_running(&self) -> Result<(), SimError> {
        match self.sim_state.status {
            RunStatus::NotStarted => Err(SimError::NotStarted),
            RunStatus::Halted => Err(SimError::Halted),
            RunStatus::Running | RunStatus::Finished => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn now(&self) -> SimTime {
        self.queue.now()
    }

    pub fn status(&self) -> RunStatus {
        self.sim_state.status
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn rail(&self) -> &Rail {
        &self.rail
    }

    pub fn crane(&self, id: CraneId) -> &Crane {
        &self.cranes[id.index()]
    }

    pub fn scanners(&self) -> &[Scanner] {
        &self.scanners
    }

    pub fn end_boxes(&self) -> &[EndBox] {
        &self.boxes
    }

    pub fn start_remaining(&self) -> usize {
        self.start.len()
    }

    pub fn delivered(&self) -> usize {
        self.boxes.iter().map(EndBox::count).sum()
    }

    /// Diamonds still in the facility.
    pub fn live_diamonds(&self) -> usize {
        self.diamonds.len()
    }

    /// Inert events discarded by the queue.
    pub fn skipped_events(&self) -> u64 {
        self.queue.skipped()
    }

    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// The violation that halted the engine, if any.
    pub fn violation(&self) -> Option<&InvariantViolation> {
        self.violation.as_ref()
    }

    /// Display pacing for the configured speed setting.
    pub fn pacing(&self) -> Pacing {
        Pacing::new(self.config.speed)
    }

    /// Queue an arbitrary event. Used to drive the engine into states the
    /// controller never produces on its own.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn inject(&mut self, delay: SimTime, event: Event) {
        self.queue.schedule(delay, event);
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn dispatch_next(&mut self) -> Result<StepOutcome, SimError> {
        let Some(next) = self.queue.pop() else {
            let at = self.queue.now();
            return Err(self.halt(InvariantViolation::Stalled { at }));
        };
        let now = next.at;
        self.sim_state.dispatched += 1;
        self.journal.push(
            now,
            JournalEntry::Dispatched {
                handle: next.handle(),
                event: next.event,
            },
        );
        debug!(
            now,
            seq = next.seq,
            event = ?next.event,
            queued = self.queue.len(),
            "dispatch"
        );

        let result = self
            .handle(next.event)
            .and_then(|()| self.drive())
            .and_then(|()| self.check());
        match self.settle(result)? {
            RunStatus::Finished => Ok(StepOutcome::Finished),
            _ => Ok(StepOutcome::Dispatched {
                time: now,
                event: next.event,
            }),
        }
    }

    /// Turn the outcome of a dispatch into the engine's next status.
    fn settle(&mut self, result: Result<(), InvariantViolation>) -> Result<RunStatus, SimError> {
        if let Err(violation) = result {
            return Err(self.halt(violation));
        }
        if self.is_complete() {
            self.finish();
        } else if self.queue.is_empty() {
            let at = self.queue.now();
            return Err(self.halt(InvariantViolation::Stalled { at }));
        }
        Ok(self.sim_state.status)
    }

    fn halt(&mut self, violation: InvariantViolation) -> SimError {
        warn!(now = self.queue.now(), %violation, "invariant violated, halting");
        self.sim_state.status = RunStatus::Halted;
        self.violation = Some(violation.clone());
        SimError::Invariant {
            violation,
            snapshot: Box::new(self.snapshot()),
        }
    }

    fn is_complete(&self) -> bool {
        self.start.is_empty()
            && self
                .cranes
                .iter()
                .all(|c| c.is_idle() && c.request.is_none() && !self.rail.is_moving(c.id))
            && self.scanners.iter().all(Scanner::is_idle)
    }

    fn finish(&mut self) {
        let now = self.queue.now();
        let delivered = self.delivered() as u32;
        self.sim_state.status = RunStatus::Finished;
        self.sim_state.finished_at = Some(now);
        self.journal.push(now, JournalEntry::Finished { delivered });
        info!(
            finished_at = now,
            delivered,
            events = self.sim_state.dispatched,
            skipped = self.queue.skipped(),
            "run finished"
        );
    }

    fn check(&self) -> Result<(), InvariantViolation> {
        crate::validation::check_invariants(self)
    }

    fn handle(&mut self, event: Event) -> Result<(), InvariantViolation> {
        match event {
            Event::MotionComplete { crane } => self.on_motion_complete(crane),
            Event::RailRetry { crane } => {
                // The drive pass re-attempts whatever was waiting.
                self.cranes[crane.index()].retry = None;
                Ok(())
            }
            Event::ScanComplete { scanner } => {
                if scanner.index() >= self.scanners.len() {
                    return Err(InvariantViolation::UnknownEntity {
                        event,
                        entity: "scanner",
                    });
                }
                self.on_scan_complete(scanner)
            }
            Event::LowerComplete { crane } => self.on_lower_complete(crane),
            Event::GripComplete { crane } => self.on_grip_complete(crane),
            Event::RaiseComplete { crane } => self.on_raise_complete(crane),
            Event::Departure { crane } => self.on_departure(crane),
        }
    }

    // -----------------------------------------------------------------------
    // Transition helpers
    // -----------------------------------------------------------------------

    fn set_phase(&mut self, id: CraneId, to: CranePhase) -> Result<(), InvariantViolation> {
        let now = self.queue.now();
        let from = self.cranes[id.index()].transition(to, now)?;
        self.journal
            .push(now, JournalEntry::CranePhase { crane: id, from, to });
        trace!(now, crane = %id, ?from, ?to, "phase");
        Ok(())
    }

    fn begin_lowering(&mut self, id: CraneId) -> Result<(), InvariantViolation> {
        self.set_phase(id, CranePhase::Lowering)?;
        self.queue.schedule(self.hoist, Event::LowerComplete { crane: id });
        Ok(())
    }

    fn begin_raising(&mut self, id: CraneId) -> Result<(), InvariantViolation> {
        self.set_phase(id, CranePhase::Raising)?;
        self.queue.schedule(self.hoist, Event::RaiseComplete { crane: id });
        Ok(())
    }

    fn begin_grip(&mut self, id: CraneId, phase: CranePhase) -> Result<(), InvariantViolation> {
        self.set_phase(id, phase)?;
        self.queue
            .schedule(self.config.grip_duration, Event::GripComplete { crane: id });
        Ok(())
    }

    fn unexpected(&self, id: CraneId, event: EventKind) -> InvariantViolation {
        InvariantViolation::UnexpectedEvent {
            crane: id,
            phase: self.cranes[id.index()].phase(),
            event,
        }
    }

    fn scanner_state_change(&mut self, scanner: ScannerId, from: ScannerState, to: ScannerState) {
        let now = self.queue.now();
        self.journal
            .push(now, JournalEntry::ScannerState { scanner, from, to });
        trace!(now, %scanner, ?from, ?to, "scanner");
    }

    fn serial(&self, diamond: DiamondId) -> Result<u32, InvariantViolation> {
        self.diamonds
            .get(diamond)
            .map(|d| d.serial)
            .ok_or(InvariantViolation::UnknownDiamond)
    }

    fn relocate(&mut self, diamond: DiamondId, to: DiamondLocation) -> Result<(), InvariantViolation> {
        let d = self
            .diamonds
            .get_mut(diamond)
            .ok_or(InvariantViolation::UnknownDiamond)?;
        d.location = to;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Rail requests
    // -----------------------------------------------------------------------

    /// Enter a horizontal phase and ask the rail for the move. The phase is
    /// entered even if the rail denies the request; the crane then waits in
    /// it with the request pending.
    fn request_move(
        &mut self,
        id: CraneId,
        to: Fixed64,
        phase: CranePhase,
    ) -> Result<(), InvariantViolation> {
        self.cranes[id.index()].ensure_raised()?;
        self.set_phase(id, phase)?;
        self.cranes[id.index()].request = Some(RailRequest {
            to,
            denied_since: None,
        });
        self.try_move(id)?;
        Ok(())
    }

    /// Attempt the crane's pending rail request. Returns whether it was
    /// granted.
    fn try_move(&mut self, id: CraneId) -> Result<bool, InvariantViolation> {
        let Some(request) = self.cranes[id.index()].request else {
            return Ok(false);
        };
        self.cranes[id.index()].ensure_raised()?;
        let now = self.queue.now();
        match self.rail.request(id, request.to, now, self.speed)? {
            RailDecision::Granted(motion) => {
                self.cranes[id.index()].request = None;
                self.cancel_retry(id);
                self.journal.push(
                    now,
                    JournalEntry::RailGranted {
                        crane: id,
                        from: motion.from,
                        to: motion.to,
                        arrive: motion.arrive,
                    },
                );
                trace!(now, crane = %id, from = %motion.from, to = %motion.to, arrive = motion.arrive, "rail granted");
                self.queue
                    .schedule_at(motion.arrive, Event::MotionComplete { crane: id });
                Ok(true)
            }
            RailDecision::Denied { blocker, retry_at } => {
                if request.denied_since.is_none() {
                    self.cranes[id.index()].request = Some(RailRequest {
                        denied_since: Some(now),
                        ..request
                    });
                    self.journal.push(
                        now,
                        JournalEntry::RailDenied {
                            crane: id,
                            to: request.to,
                            retry_at,
                        },
                    );
                    trace!(now, crane = %id, %blocker, to = %request.to, ?retry_at, "rail denied");
                }
                if let Some(at) = retry_at {
                    self.schedule_retry(id, at);
                }
                Ok(false)
            }
        }
    }

    fn schedule_retry(&mut self, id: CraneId, at: SimTime) {
        if let Some(w) = self.cranes[id.index()].retry {
            if w.at == at && self.queue.is_pending(w.handle) {
                return;
            }
        }
        self.cancel_retry(id);
        let handle = self.queue.schedule_at(at, Event::RailRetry { crane: id });
        self.cranes[id.index()].retry = Some(Wakeup { handle, at });
    }

    fn cancel_retry(&mut self, id: CraneId) {
        if let Some(w) = self.cranes[id.index()].retry.take() {
            self.cancel(w.handle);
        }
    }

    fn cancel(&mut self, handle: crate::id::EventHandle) {
        if self.queue.cancel(handle) {
            self.journal
                .push(self.queue.now(), JournalEntry::Cancelled { handle });
        }
    }

    // -----------------------------------------------------------------------
    // Event handlers
    // -----------------------------------------------------------------------

    fn on_motion_complete(&mut self, id: CraneId) -> Result<(), InvariantViolation> {
        let now = self.queue.now();
        let crane = &self.cranes[id.index()];
        let (phase, task) = (crane.phase(), crane.task);
        if !phase.is_horizontal() {
            return Err(self.unexpected(id, EventKind::MotionComplete));
        }
        self.rail.complete(id, now)?;
        match (phase, task) {
            (CranePhase::MovingToPickup, Some(Task::Pickup))
            | (CranePhase::MovingToScanner, Some(Task::Load { staged: false, .. }))
            | (CranePhase::MovingToScanner, Some(Task::Unload { .. }))
            | (CranePhase::MovingToDropoff, Some(Task::Deliver { .. })) => self.begin_lowering(id),
            (CranePhase::MovingToScanner, Some(Task::Load { staged: true, .. })) => {
                self.set_phase(id, CranePhase::AwaitingScan)
            }
            (CranePhase::MovingToPickup, None) => self.set_phase(id, CranePhase::Idle),
            _ => Err(self.unexpected(id, EventKind::MotionComplete)),
        }
    }

    fn on_lower_complete(&mut self, id: CraneId) -> Result<(), InvariantViolation> {
        let crane = &self.cranes[id.index()];
        let task = crane.task;
        if crane.phase() != CranePhase::Lowering {
            return Err(self.unexpected(id, EventKind::LowerComplete));
        }
        match task {
            Some(Task::Pickup) => self.begin_grip(id, CranePhase::PickingUp),
            Some(Task::Load { .. }) | Some(Task::Deliver { .. }) => {
                self.begin_grip(id, CranePhase::PlacingDown)
            }
            Some(Task::Unload { scanner }) => {
                if self.scanners[scanner.index()].state() == ScannerState::Done {
                    self.begin_grip(id, CranePhase::PickingUp)
                } else {
                    // Pre-lowered ahead of the scan finishing.
                    self.set_phase(id, CranePhase::AwaitingScan)
                }
            }
            None => Err(self.unexpected(id, EventKind::LowerComplete)),
        }
    }

    fn on_grip_complete(&mut self, id: CraneId) -> Result<(), InvariantViolation> {
        let now = self.queue.now();
        let crane = &self.cranes[id.index()];
        match (crane.phase(), crane.task) {
            (CranePhase::PickingUp, Some(Task::Pickup)) => {
                let diamond = self
                    .start
                    .draw()
                    .ok_or_else(|| self.unexpected(id, EventKind::GripComplete))?;
                self.cranes[id.index()].load_payload(diamond)?;
                self.relocate(diamond, DiamondLocation::Crane(id))?;
                let serial = self.serial(diamond)?;
                self.journal
                    .push(now, JournalEntry::Drawn { crane: id, serial });
                self.begin_raising(id)
            }
            (CranePhase::PlacingDown, Some(Task::Load { scanner, .. })) => {
                let diamond = self.cranes[id.index()].take_payload()?;
                let delay = self.scanners[scanner.index()].begin_scan(diamond, now)?;
                self.relocate(diamond, DiamondLocation::Scanner(scanner))?;
                self.scanner_state_change(scanner, ScannerState::Idle, ScannerState::Scanning);
                let serial = self.serial(diamond)?;
                self.journal
                    .push(now, JournalEntry::ScanStarted { scanner, serial });
                self.queue.schedule(delay, Event::ScanComplete { scanner });
                self.cranes[id.index()].task = None;
                self.begin_raising(id)
            }
            (CranePhase::PickingUp, Some(Task::Unload { scanner })) => {
                let diamond = self.scanners[scanner.index()].remove(now)?;
                self.scanner_state_change(scanner, ScannerState::Done, ScannerState::Idle);
                self.cranes[id.index()].load_payload(diamond)?;
                self.relocate(diamond, DiamondLocation::Crane(id))?;
                let d = self
                    .diamonds
                    .get(diamond)
                    .ok_or(InvariantViolation::UnknownDiamond)?;
                let (serial, result) = (d.serial, d.scan_result());
                self.journal.push(
                    now,
                    JournalEntry::Retrieved {
                        crane: id,
                        scanner,
                        serial,
                    },
                );
                let target = result.ok_or(InvariantViolation::Unscanned { serial })?;
                self.cranes[id.index()].task = Some(Task::Deliver { target });
                self.begin_raising(id)
            }
            (CranePhase::PlacingDown, Some(Task::Deliver { target })) => {
                let diamond = self.cranes[id.index()].take_payload()?;
                let removed = self
                    .diamonds
                    .remove(diamond)
                    .ok_or(InvariantViolation::UnknownDiamond)?;
                let end_box = self.boxes.get_mut(target.index()).ok_or(
                    InvariantViolation::UnknownEntity {
                        event: Event::GripComplete { crane: id },
                        entity: "end box",
                    },
                )?;
                end_box.deposit(removed.serial);
                self.journal.push(
                    now,
                    JournalEntry::Delivered {
                        crane: id,
                        serial: removed.serial,
                        target,
                    },
                );
                debug!(now, serial = removed.serial, box_id = target.0, "delivered");
                self.cranes[id.index()].task = None;
                self.begin_raising(id)
            }
            _ => Err(self.unexpected(id, EventKind::GripComplete)),
        }
    }

    fn on_raise_complete(&mut self, id: CraneId) -> Result<(), InvariantViolation> {
        if self.cranes[id.index()].phase() != CranePhase::Raising {
            return Err(self.unexpected(id, EventKind::RaiseComplete));
        }
        self.cranes[id.index()].raise();
        let crane = &self.cranes[id.index()];
        match (crane.task, crane.payload()) {
            (Some(Task::Pickup), Some(diamond)) => self.assign_scanner(id, diamond),
            (Some(Task::Deliver { target }), Some(_)) => {
                let to = self.config.box_position(target);
                self.request_move(id, to, CranePhase::MovingToDropoff)
            }
            (None, None) => self.set_phase(id, CranePhase::Idle),
            _ => Err(self.unexpected(id, EventKind::RaiseComplete)),
        }
    }

    /// The loader has just lifted `diamond`: ask the policy for a scanner
    /// and head for it, or for its staging point if it is busy.
    fn assign_scanner(&mut self, id: CraneId, diamond: DiamondId) -> Result<(), InvariantViolation> {
        let now = self.queue.now();
        let scanner = self
            .config
            .policy
            .select(&self.scanners)
            .ok_or_else(|| self.unexpected(id, EventKind::RaiseComplete))?;
        let serial = self.serial(diamond)?;
        self.journal
            .push(now, JournalEntry::Assigned { serial, scanner });
        debug!(now, serial, %scanner, policy = %self.config.policy, "assigned");

        if self.scanners[scanner.index()].is_idle() {
            self.cranes[id.index()].task = Some(Task::Load {
                scanner,
                staged: false,
            });
            let to = self.config.scanner_position(scanner);
            self.request_move(id, to, CranePhase::MovingToScanner)
        } else if self.config.pre_emptive && self.staging_is_clear(scanner) {
            self.cranes[id.index()].task = Some(Task::Load {
                scanner,
                staged: true,
            });
            let to = self.config.staging_position(scanner);
            self.request_move(id, to, CranePhase::MovingToScanner)
        } else {
            if self.config.pre_emptive {
                debug!(now, %scanner, "staging would block the unloader, waiting at pickup");
            }
            self.cranes[id.index()].task = Some(Task::Load {
                scanner,
                staged: false,
            });
            self.set_phase(id, CranePhase::AwaitingScan)
        }
    }

    /// Whether the loader can wait at `scanner`'s staging point without
    /// cutting the unloader off from a scanner it should empty first. A
    /// staged loader blocks every scanner to its left.
    fn staging_is_clear(&self, scanner: ScannerId) -> bool {
        let target = &self.scanners[scanner.index()];
        self.scanners
            .iter()
            .filter(|s| s.position < target.position)
            .all(|s| match s.state() {
                ScannerState::Idle => true,
                ScannerState::Done => false,
                ScannerState::Scanning => s.completion_time() > target.completion_time(),
            })
    }

    fn on_scan_complete(&mut self, scanner: ScannerId) -> Result<(), InvariantViolation> {
        let now = self.queue.now();
        let diamond = self.scanners[scanner.index()].complete(now)?;
        self.scanner_state_change(scanner, ScannerState::Scanning, ScannerState::Done);
        let d = self
            .diamonds
            .get_mut(diamond)
            .ok_or(InvariantViolation::UnknownDiamond)?;
        d.reveal();
        let (serial, result) = (d.serial, d.scan_result());
        let result = result.ok_or(InvariantViolation::Unscanned { serial })?;
        self.journal.push(
            now,
            JournalEntry::ScanFinished {
                scanner,
                serial,
                result,
            },
        );

        let red = &self.cranes[UNLOADER.index()];
        if red.phase() == CranePhase::AwaitingScan && red.task == Some(Task::Unload { scanner }) {
            self.begin_grip(UNLOADER, CranePhase::PickingUp)?;
        }
        Ok(())
    }

    fn on_departure(&mut self, id: CraneId) -> Result<(), InvariantViolation> {
        let crane = &mut self.cranes[id.index()];
        crane.departure = None;
        let (Some(Task::Unload { scanner }), CranePhase::Idle) = (crane.task, crane.phase()) else {
            return Err(self.unexpected(id, EventKind::Departure));
        };
        let now = self.queue.now();
        let to = self.config.scanner_position(scanner);
        if self.rail.can_move(id, to, now) {
            self.request_move(id, to, CranePhase::MovingToScanner)
        } else {
            self.drop_plan(id, scanner);
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Drive pass
    // -----------------------------------------------------------------------

    /// Give every crane a chance to act until nobody can.
    fn drive(&mut self) -> Result<(), InvariantViolation> {
        loop {
            let loader = self.drive_loader()?;
            let unloader = self.drive_unloader()?;
            if !loader && !unloader {
                return Ok(());
            }
        }
    }

    fn drive_loader(&mut self) -> Result<bool, InvariantViolation> {
        let blue = &self.cranes[LOADER.index()];
        if blue.request.is_some() {
            return self.try_move(LOADER);
        }
        if self.rail.is_moving(LOADER) {
            return Ok(false);
        }
        match (blue.phase(), blue.task) {
            (CranePhase::Idle, None) if blue.payload().is_none() && !self.start.is_empty() => {
                self.cranes[LOADER.index()].task = Some(Task::Pickup);
                let to = f64_to_fixed64(self.config.layout.start_position);
                self.request_move(LOADER, to, CranePhase::MovingToPickup)?;
                Ok(true)
            }
            (CranePhase::Idle, None) if blue.payload().is_none() => {
                // Nothing left to load: clear the scanners for the unloader.
                let home = f64_to_fixed64(self.config.layout.start_position);
                if self.rail.position(LOADER, self.queue.now()) == home {
                    return Ok(false);
                }
                self.request_move(LOADER, home, CranePhase::MovingToPickup)?;
                Ok(true)
            }
            (CranePhase::AwaitingScan, Some(Task::Load { scanner, .. }))
                if self.scanners[scanner.index()].is_idle() =>
            {
                self.cranes[LOADER.index()].task = Some(Task::Load {
                    scanner,
                    staged: false,
                });
                let to = self.config.scanner_position(scanner);
                self.request_move(LOADER, to, CranePhase::MovingToScanner)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn drive_unloader(&mut self) -> Result<bool, InvariantViolation> {
        let red = &self.cranes[UNLOADER.index()];
        if red.request.is_some() {
            return self.try_move(UNLOADER);
        }
        if red.phase() != CranePhase::Idle || red.payload().is_some() {
            return Ok(false);
        }
        if let Some(Task::Unload { scanner }) = red.task {
            // Waiting for a planned departure. The plan stands while its
            // target is reachable and nothing else can be served sooner.
            let now = self.queue.now();
            if self
                .rail
                .can_move(UNLOADER, self.config.scanner_position(scanner), now)
            {
                let completion = self.scanners[scanner.index()].completion_time();
                let planned = Candidate {
                    ready: completion.max(now),
                    completion,
                    scanner,
                    reachable_at: now,
                };
                if self.best_candidate().is_none_or(|best| planned <= best) {
                    return Ok(false);
                }
            }
            self.drop_plan(UNLOADER, scanner);
            return Ok(true);
        }
        self.plan_unloader()
    }

    /// Abandon a planned departure and release its scanner for re-planning.
    fn drop_plan(&mut self, id: CraneId, scanner: ScannerId) {
        let now = self.queue.now();
        if let Some(w) = self.cranes[id.index()].departure.take() {
            self.cancel(w.handle);
        }
        self.cranes[id.index()].task = None;
        self.scanners[scanner.index()].release_claim();
        self.journal
            .push(now, JournalEntry::Replanned { crane: id, scanner });
        debug!(now, crane = %id, %scanner, "unloader plan dropped");
    }

    /// Whether the loader is about to carry a diamond past `scanner`. An
    /// unloader pre-lowered there would hold it up for the rest of the scan.
    fn loader_passes(&self, scanner: ScannerId) -> bool {
        let blue = &self.cranes[LOADER.index()];
        let heading = match blue.task {
            Some(Task::Load { scanner, .. }) => Some(scanner),
            Some(Task::Pickup) => self.config.policy.select(&self.scanners),
            None if blue.is_idle() && !self.start.is_empty() => {
                self.config.policy.select(&self.scanners)
            }
            _ => None,
        };
        heading.is_some_and(|to| {
            self.scanners[to.index()].position > self.scanners[scanner.index()].position
        })
    }

    /// The unclaimed scanner the unloader could start on soonest. Candidates
    /// are done scanners, plus scanning ones when pre-emptive and the loader
    /// is not about to pass them. A candidate behind the loader counts from
    /// the moment the loader clears the way; one it never clears is skipped.
    fn best_candidate(&self) -> Option<Candidate> {
        let now = self.queue.now();
        let pre_emptive = self.config.pre_emptive;
        self.scanners
            .iter()
            .filter(|s| s.claimed_by().is_none())
            .filter(|s| match s.state() {
                ScannerState::Done => true,
                ScannerState::Scanning => pre_emptive && !self.loader_passes(s.id),
                ScannerState::Idle => false,
            })
            .filter_map(|s| {
                let to = self.config.scanner_position(s.id);
                let reachable_at = if self.rail.can_move(UNLOADER, to, now) {
                    now
                } else {
                    let sweep = self.rail.sweep(UNLOADER, to, now);
                    self.rail.clear_time(LOADER, sweep, now)?
                };
                let completion = s.completion_time();
                Some(Candidate {
                    ready: completion.max(reachable_at),
                    completion,
                    scanner: s.id,
                    reachable_at,
                })
            })
            .min()
    }

    /// Commit the idle unloader to the best candidate. If the loader is
    /// still in the way, wake up once it clears instead.
    fn plan_unloader(&mut self) -> Result<bool, InvariantViolation> {
        let now = self.queue.now();
        let Some(best) = self.best_candidate() else {
            return Ok(false);
        };
        if best.reachable_at > now {
            self.schedule_retry(UNLOADER, best.reachable_at);
            return Ok(false);
        }
        let Candidate {
            completion,
            scanner,
            ..
        } = best;

        let to = self.config.scanner_position(scanner);
        let lead = travel_time(to - self.rail.position(UNLOADER, now), self.speed) + self.hoist;
        let depart_at = if self.config.pre_emptive {
            completion.saturating_sub(lead).max(now)
        } else {
            now
        };
        self.scanners[scanner.index()].claim(UNLOADER);
        self.cranes[UNLOADER.index()].task = Some(Task::Unload { scanner });
        self.journal.push(
            now,
            JournalEntry::Planned {
                crane: UNLOADER,
                scanner,
                depart_at,
            },
        );
        debug!(now, %scanner, depart_at, completion, "unloader planned");

        if depart_at > now {
            let handle = self
                .queue
                .schedule_at(depart_at, Event::Departure { crane: UNLOADER });
            self.cranes[UNLOADER.index()].departure = Some(Wakeup {
                handle,
                at: depart_at,
            });
        } else {
            self.request_move(UNLOADER, to, CranePhase::MovingToScanner)?;
        }
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Owned view of the whole facility. Pure read.
    pub fn snapshot(&self) -> Snapshot {
        let now = self.queue.now();
        let serial = |d: Option<DiamondId>| d.and_then(|d| self.diamonds.get(d)).map(|d| d.serial);
        let crane = |id: CraneId| {
            let c = &self.cranes[id.index()];
            CraneSnapshot {
                id,
                role: c.role,
                position: self.rail.position(id, now),
                target: self.rail.motion(id).map(|m| m.to),
                phase: c.phase(),
                hoist: c.hoist(),
                payload: serial(c.payload()),
                occupied: self.rail.footprint(id, now),
                blocked: c.request.is_some_and(|r| r.denied_since.is_some()),
            }
        };
        Snapshot {
            time: now,
            status: self.sim_state.status,
            paused: self.sim_state.paused,
            cranes: [crane(LOADER), crane(UNLOADER)],
            scanners: self
                .scanners
                .iter()
                .map(|s| ScannerSnapshot {
                    id: s.id,
                    position: s.position,
                    state: s.state(),
                    held: serial(s.held()),
                    remaining: s.remaining(now),
                    scans_completed: s.scans_completed(),
                })
                .collect(),
            rail: RailSnapshot {
                bounds: self.rail.bounds(),
                occupied: [
                    self.rail.footprint(LOADER, now),
                    self.rail.footprint(UNLOADER, now),
                ],
            },
            start_count: self.start.len(),
            box_counts: self.boxes.iter().map(EndBox::count).collect(),
        }
    }

    /// FNV-1a over every piece of entity state.
    pub fn state_hash(&self) -> u64 {
        let now = self.queue.now();
        let mut h = StateHash::new();
        h.write_u64(now);
        h.write_u8(self.sim_state.status as u8);
        h.write_u64(self.rng.state());
        for c in &self.cranes {
            h.write_u8(c.phase() as u8);
            h.write_u8(c.hoist() as u8);
            h.write_fixed64(self.rail.position(c.id, now));
            let payload = c.payload().and_then(|d| self.diamonds.get(d));
            h.write_u32(payload.map_or(0, |d| d.serial));
        }
        for s in &self.scanners {
            h.write_u8(s.state() as u8);
            let held = s.held().and_then(|d| self.diamonds.get(d));
            h.write_u32(held.map_or(0, |d| d.serial));
            h.write_u32(s.scans_completed());
        }
        for d in self.start.iter().filter_map(|d| self.diamonds.get(d)) {
            h.write_u32(d.serial);
        }
        for b in &self.boxes {
            h.write_u32(b.count() as u32);
            for &serial in b.delivered() {
                h.write_u32(serial);
            }
        }
        h.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn new_rejects_invalid_config() {
        let cfg = SimConfig {
            scanner_count: 0,
            ..SimConfig::default()
        };
        assert_eq!(Engine::new(cfg).unwrap_err(), ConfigError::ScannerCount(0));
    }

    #[test]
    fn step_before_start_is_an_error() {
        let mut engine = Engine::new(SimConfig::default()).unwrap();
        assert_eq!(engine.step(), Err(SimError::NotStarted));
    }

    #[test]
    fn configure_only_before_start() {
        let mut engine = Engine::new(SimConfig::default()).unwrap();
        engine.configure(config(3, 4)).unwrap();
        assert_eq!(engine.scanners().len(), 3);
        engine.start().unwrap();
        assert_eq!(engine.configure(config(1, 1)), Err(SimError::AlreadyStarted));
        assert_eq!(engine.start(), Err(SimError::AlreadyStarted));
    }

    #[test]
    fn start_point_filled_from_seed() {
        let engine = Engine::new(config(2, 12)).unwrap();
        assert_eq!(engine.start_remaining(), 12);
        assert_eq!(engine.live_diamonds(), 12);
    }

    #[test]
    fn empty_start_finishes_immediately() {
        let mut engine = Engine::new(config(2, 0)).unwrap();
        engine.start().unwrap();
        assert_eq!(engine.status(), RunStatus::Finished);
        assert_eq!(engine.step(), Ok(StepOutcome::Finished));
    }

    #[test]
    fn single_diamond_completes() {
        let mut engine = Engine::new(config(1, 1)).unwrap();
        let t = engine.run_to_completion().unwrap();
        assert!(t > 0);
        assert_eq!(engine.delivered(), 1);
        assert_eq!(engine.live_diamonds(), 0);
        assert_eq!(engine.status(), RunStatus::Finished);
        assert_eq!(engine.step(), Ok(StepOutcome::Finished));
    }

    #[test]
    fn paused_step_dispatches_nothing_but_skip_does() {
        let mut engine = started(config(1, 2));
        engine.pause();
        let before = engine.journal().len();
        assert_eq!(engine.step(), Ok(StepOutcome::Paused));
        assert_eq!(engine.journal().len(), before);
        assert!(matches!(engine.skip(), Ok(StepOutcome::Dispatched { .. })));
        engine.resume();
        assert!(matches!(engine.step(), Ok(StepOutcome::Dispatched { .. })));
    }

    #[test]
    fn time_never_goes_backwards() {
        let mut engine = started(config(2, 6));
        let mut last = 0;
        loop {
            match engine.step().unwrap() {
                StepOutcome::Dispatched { time, .. } => {
                    assert!(time >= last);
                    last = time;
                }
                StepOutcome::Finished => break,
                StepOutcome::Paused => unreachable!(),
            }
        }
    }

    #[test]
    fn advance_until_drains_due_events() {
        let mut engine = started(config(2, 4));
        let n = engine.advance_until(10_000).unwrap();
        assert!(n > 0);
        assert_eq!(engine.now(), 10_000);
        for (t, _) in engine.journal().dispatched() {
            assert!(t <= 10_000);
        }
    }

    #[test]
    fn unknown_scanner_halts() {
        let mut engine = started(config(1, 2));
        engine.inject(0, Event::ScanComplete { scanner: ScannerId(3) });
        let err = engine.run_to_completion().unwrap_err();
        let SimError::Invariant { violation, snapshot } = err else {
            panic!("expected invariant violation, got {err:?}");
        };
        assert!(matches!(
            violation,
            InvariantViolation::UnknownEntity {
                entity: "scanner",
                ..
            }
        ));
        assert_eq!(snapshot.status, RunStatus::Halted);
        assert_eq!(engine.step(), Err(SimError::Halted));
        assert!(engine.violation().is_some());
    }

    #[test]
    fn out_of_order_event_halts() {
        let mut engine = started(config(1, 1));
        // The loader is heading to the Start Point; a raise makes no sense.
        engine.inject(0, Event::RaiseComplete { crane: LOADER });
        let err = engine.run_to_completion().unwrap_err();
        assert!(matches!(
            err,
            SimError::Invariant {
                violation: InvariantViolation::UnexpectedEvent {
                    crane: LOADER,
                    event: EventKind::RaiseComplete,
                    ..
                },
                ..
            }
        ));
    }

    #[test]
    fn snapshot_is_a_pure_read() {
        let mut engine = started(config(2, 3));
        engine.advance_until(5_000).unwrap();
        let hash = engine.state_hash();
        let a = engine.snapshot();
        let b = engine.snapshot();
        assert_eq!(a, b);
        assert_eq!(engine.state_hash(), hash);
        assert_eq!(a.start_count + a.delivered() + a.cranes.iter().filter(|c| c.payload.is_some()).count()
            + a.scanners.iter().filter(|s| s.held.is_some()).count(), 3);
    }

    #[test]
    fn state_hash_tracks_progress() {
        let mut engine = started(config(1, 2));
        let h0 = engine.state_hash();
        engine.advance_until(3_000).unwrap();
        assert_ne!(engine.state_hash(), h0);
    }
}
