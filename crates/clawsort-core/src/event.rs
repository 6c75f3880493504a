//! Simulated clock, timestamp-ordered event queue and the run journal.
//!
//! Events are kept in a binary min-heap keyed by `(time, class, seq)`.
//! Equal timestamps are broken first by [`PriorityClass`] (rail before
//! scanner before crane) and then by insertion sequence, so a given
//! configuration always dispatches in exactly the same order.
//!
//! # Cancellation
//!
//! [`EventQueue::cancel`] never removes anything from the heap. The event
//! is marked inert and discarded (and counted) when it reaches the top.

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap};

use serde::{Deserialize, Serialize};

use crate::crane::CranePhase;
use crate::fixed::{Fixed64, SimTime};
use crate::id::{BoxId, CraneId, EventHandle, ScannerId};
use crate::scanner::ScannerState;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A timed occurrence addressed to one crane or scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    // -- Rail --
    /// A granted horizontal move has arrived.
    MotionComplete { crane: CraneId },
    /// A previously denied rail request may now succeed.
    RailRetry { crane: CraneId },

    // -- Scanner --
    ScanComplete { scanner: ScannerId },

    // -- Crane --
    LowerComplete { crane: CraneId },
    GripComplete { crane: CraneId },
    RaiseComplete { crane: CraneId },
    /// A pre-planned departure toward a scanner.
    Departure { crane: CraneId },
}

/// Discriminant tag for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    MotionComplete,
    RailRetry,
    ScanComplete,
    LowerComplete,
    GripComplete,
    RaiseComplete,
    Departure,
}

/// Tie-break class for events sharing a timestamp. Lower dispatches first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PriorityClass {
    Rail = 0,
    Scanner = 1,
    Crane = 2,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::MotionComplete { .. } => EventKind::MotionComplete,
            Event::RailRetry { .. } => EventKind::RailRetry,
            Event::ScanComplete { .. } => EventKind::ScanComplete,
            Event::LowerComplete { .. } => EventKind::LowerComplete,
            Event::GripComplete { .. } => EventKind::GripComplete,
            Event::RaiseComplete { .. } => EventKind::RaiseComplete,
            Event::Departure { .. } => EventKind::Departure,
        }
    }

    pub fn class(&self) -> PriorityClass {
        self.kind().class()
    }

    /// The crane this event is addressed to, if any.
    pub fn crane(&self) -> Option<CraneId> {
        match *self {
            Event::MotionComplete { crane }
            | Event::RailRetry { crane }
            | Event::LowerComplete { crane }
            | Event::GripComplete { crane }
            | Event::RaiseComplete { crane }
            | Event::Departure { crane } => Some(crane),
            Event::ScanComplete { .. } => None,
        }
    }
}

impl EventKind {
    pub fn class(self) -> PriorityClass {
        match self {
            EventKind::MotionComplete | EventKind::RailRetry => PriorityClass::Rail,
            EventKind::ScanComplete => PriorityClass::Scanner,
            EventKind::LowerComplete
            | EventKind::GripComplete
            | EventKind::RaiseComplete
            | EventKind::Departure => PriorityClass::Crane,
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduled event
// ---------------------------------------------------------------------------

/// An event together with its dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledEvent {
    pub at: SimTime,
    pub class: PriorityClass,
    pub seq: u64,
    pub event: Event,
}

impl ScheduledEvent {
    pub fn handle(&self) -> EventHandle {
        EventHandle(self.seq)
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, the earliest key must be on top.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.class.cmp(&self.class))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// EventQueue
// ---------------------------------------------------------------------------

/// The simulation clock. `now` only ever moves forward.
#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    now: SimTime,
    next_seq: u64,
    heap: BinaryHeap<ScheduledEvent>,
    /// Sequence numbers of queued events that have not been cancelled.
    live: BTreeSet<u64>,
    /// Sequence numbers of cancelled events still sitting in the heap.
    inert: BTreeSet<u64>,
    skipped: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Schedule `event` at `now + delay`.
    pub fn schedule(&mut self, delay: SimTime, event: Event) -> EventHandle {
        let at = self.now.saturating_add(delay);
        self.schedule_at(at, event)
    }

    /// Schedule `event` at an absolute time. Times in the past are clamped
    /// to `now`.
    pub fn schedule_at(&mut self, at: SimTime, event: Event) -> EventHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        let scheduled = ScheduledEvent {
            at: at.max(self.now),
            class: event.class(),
            seq,
            event,
        };
        self.heap.push(scheduled);
        self.live.insert(seq);
        scheduled.handle()
    }

    /// Mark a queued event inert. Returns `false` if the handle was already
    /// dispatched or cancelled.
    pub fn cancel(&mut self, handle: EventHandle) -> bool {
        if self.live.remove(&handle.0) {
            self.inert.insert(handle.0);
            true
        } else {
            false
        }
    }

    /// Whether `handle` is still waiting to be dispatched.
    pub fn is_pending(&self, handle: EventHandle) -> bool {
        self.live.contains(&handle.0)
    }

    /// Remove the earliest live event and advance `now` to its timestamp.
    pub fn pop(&mut self) -> Option<ScheduledEvent> {
        while let Some(next) = self.heap.pop() {
            if self.inert.remove(&next.seq) {
                self.skipped += 1;
                continue;
            }
            self.live.remove(&next.seq);
            self.now = next.at;
            return Some(next);
        }
        None
    }

    /// Timestamp of the earliest live event. Drops inert events sitting on
    /// top of the heap.
    pub fn peek_time(&mut self) -> Option<SimTime> {
        while let Some(top) = self.heap.peek() {
            if self.inert.contains(&top.seq) {
                let seq = top.seq;
                self.heap.pop();
                self.inert.remove(&seq);
                self.skipped += 1;
                continue;
            }
            return Some(top.at);
        }
        None
    }

    /// Move the clock forward without dispatching. Never moves backwards
    /// and never jumps over a live event.
    pub fn advance_to(&mut self, t: SimTime) {
        let limit = self.peek_time().unwrap_or(SimTime::MAX);
        self.now = self.now.max(t.min(limit));
    }

    /// Number of live (not cancelled) queued events.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Total inert events discarded so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// One observable step of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalEntry {
    Dispatched {
        handle: EventHandle,
        event: Event,
    },
    Cancelled {
        handle: EventHandle,
    },
    CranePhase {
        crane: CraneId,
        from: CranePhase,
        to: CranePhase,
    },
    ScannerState {
        scanner: ScannerId,
        from: ScannerState,
        to: ScannerState,
    },
    /// The loader lifted a diamond off the Start Point.
    Drawn {
        crane: CraneId,
        serial: u32,
    },
    /// The assignment policy chose a scanner for a diamond.
    Assigned {
        serial: u32,
        scanner: ScannerId,
    },
    /// The unloader committed to serve a scanner.
    Planned {
        crane: CraneId,
        scanner: ScannerId,
        depart_at: SimTime,
    },
    /// A planned departure was dropped, either because its target became
    /// unreachable or because another scanner can be served sooner.
    Replanned {
        crane: CraneId,
        scanner: ScannerId,
    },
    ScanStarted {
        scanner: ScannerId,
        serial: u32,
    },
    ScanFinished {
        scanner: ScannerId,
        serial: u32,
        result: BoxId,
    },
    Retrieved {
        crane: CraneId,
        scanner: ScannerId,
        serial: u32,
    },
    Delivered {
        crane: CraneId,
        serial: u32,
        target: BoxId,
    },
    RailGranted {
        crane: CraneId,
        from: Fixed64,
        to: Fixed64,
        arrive: SimTime,
    },
    RailDenied {
        crane: CraneId,
        to: Fixed64,
        retry_at: Option<SimTime>,
    },
    Finished {
        delivered: u32,
    },
}

/// A journal entry stamped with the simulated time it happened at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub time: SimTime,
    pub entry: JournalEntry,
}

/// Ordered, append-only log of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Journal {
    records: Vec<Record>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, time: SimTime, entry: JournalEntry) {
        self.records.push(Record { time, entry });
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    /// Only the dispatched events, in dispatch order.
    pub fn dispatched(&self) -> impl Iterator<Item = (SimTime, Event)> + '_ {
        self.records.iter().filter_map(|r| match r.entry {
            JournalEntry::Dispatched { event, .. } => Some((r.time, event)),
            _ => None,
        })
    }

    /// Phase sequence of one crane, in order.
    pub fn crane_phases(&self, crane: CraneId) -> Vec<CranePhase> {
        self.records
            .iter()
            .filter_map(|r| match r.entry {
                JournalEntry::CranePhase { crane: c, to, .. } if c == crane => Some(to),
                _ => None,
            })
            .collect()
    }
}
