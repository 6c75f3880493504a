//! Clawsort Core -- a discrete-event simulation of a two-crane diamond
//! sorting line.
//!
//! Two cranes share one linear rail. Blue (the loader) lifts diamonds from
//! the Start Point and places them in one of up to four scanners; Red (the
//! unloader) takes scanned diamonds out and drops each into the End Box
//! chosen by its scan. The cranes can never pass or touch each other.
//!
//! # Dispatch Loop
//!
//! Each call to [`engine::Engine::step`] dispatches exactly one event:
//!
//! 1. **Pop** -- Take the earliest live event from the [`event::EventQueue`]
//!    and advance the clock to it. Ties break by priority class (rail, then
//!    scanner, then crane) and then by insertion order.
//! 2. **Handle** -- Apply the event's transition to its crane or scanner.
//! 3. **Drive** -- Let every crane with pending work act: retry a denied rail
//!    request, leave a staging point, or plan the next unload.
//! 4. **Check** -- Verify rail separation, hoist gating, scanner exclusivity
//!    and diamond ownership. A violation halts the engine.
//!
//! # Key Types
//!
//! - [`engine::Engine`] -- Controller, entity owner and public API.
//! - [`rail::Rail`] -- Crane positions, motions and the reservation check.
//! - [`crane::Crane`] -- Per-crane phase machine with hoist gating.
//! - [`scanner::Scanner`] -- Idle / Scanning / Done state machine.
//! - [`policy::AssignmentPolicy`] -- First or Last scanner selection.
//! - [`event::Journal`] -- Ordered record of everything a run did.
//! - [`query::Snapshot`] -- Owned read-only view for renderers.
//! - [`fixed::Fixed64`] -- Q32.32 fixed-point positions and speeds.

pub mod config;
pub mod crane;
pub mod diamond;
pub mod engine;
pub mod event;
pub mod fixed;
pub mod id;
pub mod policy;
pub mod query;
pub mod rail;
pub mod rng;
pub mod scanner;
pub mod sim;
pub mod validation;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
