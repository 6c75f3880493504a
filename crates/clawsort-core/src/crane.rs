//! Crane state machine.
//!
//! Both cranes share one phase enum and one transition function. Which
//! edges are legal depends on the crane's [`CraneRole`]: the loader carries
//! diamonds from the Start Point into scanners, the unloader carries them
//! from scanners to the End Boxes. The rail does not let the cranes pass,
//! so this split is the only one that never needs them to swap sides.
//!
//! The hoist attribute gates horizontal motion. A crane is `Lowered` from
//! the moment it starts lowering until its raise completes, and every
//! `MovingTo*` phase requires `Raised`.

use serde::{Deserialize, Serialize};

use crate::fixed::{Fixed64, SimTime};
use crate::id::{BoxId, CraneId, DiamondId, EventHandle, ScannerId};

// ---------------------------------------------------------------------------
// Phase, hoist and role
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CranePhase {
    Idle,
    MovingToPickup,
    Lowering,
    PickingUp,
    Raising,
    MovingToScanner,
    AwaitingScan,
    MovingToDropoff,
    PlacingDown,
}

impl CranePhase {
    /// Phases that move the crane along the rail.
    pub fn is_horizontal(self) -> bool {
        matches!(
            self,
            CranePhase::MovingToPickup | CranePhase::MovingToScanner | CranePhase::MovingToDropoff
        )
    }

    /// Phases in which the gripper is down at a station.
    pub fn is_gripping(self) -> bool {
        matches!(self, CranePhase::PickingUp | CranePhase::PlacingDown)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Hoist {
    #[default]
    Raised,
    Lowered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CraneRole {
    /// Start Point to scanner.
    Loader,
    /// Scanner to End Box.
    Unloader,
}

impl CraneRole {
    /// Whether `from -> to` is an edge of this role's cycle.
    pub fn allows(self, from: CranePhase, to: CranePhase) -> bool {
        use CranePhase::*;
        match self {
            CraneRole::Loader => matches!(
                (from, to),
                (Idle, MovingToPickup)
                    | (MovingToPickup, Lowering)
                    // Returning home once the Start Point is empty.
                    | (MovingToPickup, Idle)
                    | (Lowering, PickingUp)
                    | (PickingUp, Raising)
                    | (Raising, MovingToScanner)
                    | (Raising, AwaitingScan)
                    | (AwaitingScan, MovingToScanner)
                    | (MovingToScanner, AwaitingScan)
                    | (MovingToScanner, Lowering)
                    | (Lowering, PlacingDown)
                    | (PlacingDown, Raising)
                    | (Raising, Idle)
            ),
            CraneRole::Unloader => matches!(
                (from, to),
                (Idle, MovingToScanner)
                    | (MovingToScanner, Lowering)
                    | (Lowering, AwaitingScan)
                    | (Lowering, PickingUp)
                    | (AwaitingScan, PickingUp)
                    | (PickingUp, Raising)
                    | (Raising, MovingToDropoff)
                    | (MovingToDropoff, Lowering)
                    | (Lowering, PlacingDown)
                    | (PlacingDown, Raising)
                    | (Raising, Idle)
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Task and rail request
// ---------------------------------------------------------------------------

/// What the crane is currently working towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    /// Loader fetching the next diamond from the Start Point.
    Pickup,
    /// Loader carrying a diamond to its assigned scanner. `staged` is set
    /// while it waits beside the scanner for it to empty.
    Load { scanner: ScannerId, staged: bool },
    /// Unloader committed to empty a scanner.
    Unload { scanner: ScannerId },
    /// Unloader carrying a scanned diamond to its box.
    Deliver { target: BoxId },
}

impl Task {
    pub fn scanner(self) -> Option<ScannerId> {
        match self {
            Task::Load { scanner, .. } | Task::Unload { scanner } => Some(scanner),
            Task::Pickup | Task::Deliver { .. } => None,
        }
    }
}

/// A scheduled wake-up the crane may need to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wakeup {
    pub handle: EventHandle,
    pub at: SimTime,
}

/// A rail move the crane is waiting to have granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RailRequest {
    pub to: Fixed64,
    /// Set on the first denial; cleared requests are never journalled twice.
    pub denied_since: Option<SimTime>,
}

// ---------------------------------------------------------------------------
// Faults
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CraneFault {
    #[error("{crane} crane cannot go from {from:?} to {to:?}")]
    IllegalTransition {
        crane: CraneId,
        from: CranePhase,
        to: CranePhase,
    },
    #[error("{crane} crane tried to move horizontally while lowered")]
    MovedWhileLowered { crane: CraneId },
    #[error("{crane} crane entered {phase:?} without lowering")]
    NotLowered { crane: CraneId, phase: CranePhase },
    #[error("{crane} crane already carries a diamond")]
    PayloadOccupied { crane: CraneId },
    #[error("{crane} crane has no diamond to release")]
    PayloadEmpty { crane: CraneId },
}

// ---------------------------------------------------------------------------
// Crane
// ---------------------------------------------------------------------------

/// One crane. Its rail position lives in [`crate::rail::Rail`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Crane {
    pub id: CraneId,
    pub role: CraneRole,
    phase: CranePhase,
    hoist: Hoist,
    payload: Option<DiamondId>,
    pub task: Option<Task>,
    pub request: Option<RailRequest>,
    /// Pending `RailRetry` wake-up.
    pub retry: Option<Wakeup>,
    /// Pending planned `Departure`.
    pub departure: Option<Wakeup>,
    phase_since: SimTime,
}

impl Crane {
    pub fn new(id: CraneId, role: CraneRole) -> Self {
        Self {
            id,
            role,
            phase: CranePhase::Idle,
            hoist: Hoist::Raised,
            payload: None,
            task: None,
            request: None,
            retry: None,
            departure: None,
            phase_since: 0,
        }
    }

    pub fn phase(&self) -> CranePhase {
        self.phase
    }

    pub fn hoist(&self) -> Hoist {
        self.hoist
    }

    pub fn payload(&self) -> Option<DiamondId> {
        self.payload
    }

    pub fn phase_since(&self) -> SimTime {
        self.phase_since
    }

    pub fn is_idle(&self) -> bool {
        self.phase == CranePhase::Idle && self.payload.is_none()
    }

    /// The single transition function. Checks the role's edge table and
    /// hoist gating, then moves to `to`. Entering `Lowering` lowers the
    /// hoist. Returns the previous phase.
    pub fn transition(&mut self, to: CranePhase, now: SimTime) -> Result<CranePhase, CraneFault> {
        let from = self.phase;
        if !self.role.allows(from, to) {
            return Err(CraneFault::IllegalTransition {
                crane: self.id,
                from,
                to,
            });
        }
        if to.is_horizontal() && self.hoist != Hoist::Raised {
            return Err(CraneFault::MovedWhileLowered { crane: self.id });
        }
        if to.is_gripping() && self.hoist != Hoist::Lowered {
            return Err(CraneFault::NotLowered {
                crane: self.id,
                phase: to,
            });
        }
        if to == CranePhase::Lowering {
            self.hoist = Hoist::Lowered;
        }
        self.phase = to;
        self.phase_since = now;
        Ok(from)
    }

    /// Called when a raise completes.
    pub fn raise(&mut self) {
        self.hoist = Hoist::Raised;
    }

    /// Horizontal motion guard used before any rail request.
    pub fn ensure_raised(&self) -> Result<(), CraneFault> {
        match self.hoist {
            Hoist::Raised => Ok(()),
            Hoist::Lowered => Err(CraneFault::MovedWhileLowered { crane: self.id }),
        }
    }

    pub fn take_payload(&mut self) -> Result<DiamondId, CraneFault> {
        self.payload
            .take()
            .ok_or(CraneFault::PayloadEmpty { crane: self.id })
    }

    pub fn load_payload(&mut self, diamond: DiamondId) -> Result<(), CraneFault> {
        if self.payload.is_some() {
            return Err(CraneFault::PayloadOccupied { crane: self.id });
        }
        self.payload = Some(diamond);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CranePhase::*;

    fn walk(crane: &mut Crane, phases: &[CranePhase]) {
        for (t, &p) in phases.iter().enumerate() {
            crane
                .transition(p, t as SimTime)
                .unwrap_or_else(|e| panic!("step {t} to {p:?}: {e}"));
            if p == Raising {
                crane.raise();
            }
        }
    }

    #[test]
    fn loader_cycle_is_legal() {
        let mut blue = Crane::new(CraneId::Blue, CraneRole::Loader);
        walk(
            &mut blue,
            &[
                MovingToPickup,
                Lowering,
                PickingUp,
                Raising,
                MovingToScanner,
                AwaitingScan,
                MovingToScanner,
                Lowering,
                PlacingDown,
                Raising,
                Idle,
            ],
        );
        assert_eq!(blue.phase(), Idle);
        assert_eq!(blue.hoist(), Hoist::Raised);
    }

    #[test]
    fn unloader_cycle_is_legal() {
        let mut red = Crane::new(CraneId::Red, CraneRole::Unloader);
        walk(
            &mut red,
            &[
                MovingToScanner,
                Lowering,
                AwaitingScan,
                PickingUp,
                Raising,
                MovingToDropoff,
                Lowering,
                PlacingDown,
                Raising,
                Idle,
            ],
        );
        assert_eq!(red.phase_since(), 9);
    }

    #[test]
    fn skipping_lowering_is_illegal() {
        let mut blue = Crane::new(CraneId::Blue, CraneRole::Loader);
        blue.transition(MovingToPickup, 0).unwrap();
        assert_eq!(
            blue.transition(PickingUp, 1),
            Err(CraneFault::IllegalTransition {
                crane: CraneId::Blue,
                from: MovingToPickup,
                to: PickingUp
            })
        );
        assert_eq!(blue.phase(), MovingToPickup);
    }

    #[test]
    fn moving_before_raise_completes_is_rejected() {
        let mut blue = Crane::new(CraneId::Blue, CraneRole::Loader);
        blue.transition(MovingToPickup, 0).unwrap();
        blue.transition(Lowering, 1).unwrap();
        blue.transition(PickingUp, 2).unwrap();
        blue.transition(Raising, 3).unwrap();
        // Raise not yet complete: hoist still lowered.
        assert_eq!(
            blue.transition(MovingToScanner, 4),
            Err(CraneFault::MovedWhileLowered {
                crane: CraneId::Blue
            })
        );
        assert!(blue.ensure_raised().is_err());
        blue.raise();
        assert!(blue.transition(MovingToScanner, 5).is_ok());
    }

    #[test]
    fn roles_do_not_share_edges() {
        assert!(!CraneRole::Unloader.allows(Idle, MovingToPickup));
        assert!(!CraneRole::Loader.allows(Idle, MovingToScanner));
        assert!(!CraneRole::Loader.allows(Raising, MovingToDropoff));
    }

    #[test]
    fn only_loader_returns_home() {
        assert!(CraneRole::Loader.allows(MovingToPickup, Idle));
        assert!(!CraneRole::Unloader.allows(MovingToDropoff, Idle));
    }

    #[test]
    fn payload_is_exclusive() {
        let mut diamonds: slotmap::SlotMap<DiamondId, ()> = slotmap::SlotMap::with_key();
        let a = diamonds.insert(());
        let b = diamonds.insert(());
        let mut red = Crane::new(CraneId::Red, CraneRole::Unloader);
        red.load_payload(a).unwrap();
        assert!(red.load_payload(b).is_err());
        assert_eq!(red.take_payload(), Ok(a));
        assert!(red.take_payload().is_err());
        assert!(red.is_idle());
    }
}
