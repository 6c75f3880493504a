//! Run configuration and its validation.
//!
//! Every field is checked by [`SimConfig::validate`] before an engine is
//! built. Out-of-range values are rejected, never clamped.
//!
//! Lengths are millimetres and durations milliseconds. The defaults
//! reproduce the reference facility: two scanners 120 mm apart centred at
//! 550 mm, cranes at 333 mm/s, 18 s scans, 1.8 s hoist moves, eight boxes.

use serde::{Deserialize, Serialize};

use crate::fixed::{Fixed64, SimTime, f64_to_fixed64};
use crate::id::{BoxId, ScannerId};
use crate::policy::AssignmentPolicy;
use crate::rail::RailError;

/// Maximum number of scanners on the rail.
pub const MAX_SCANNERS: u8 = 4;

/// Maximum number of End Boxes.
pub const MAX_BOXES: u8 = 32;

// ---------------------------------------------------------------------------
// Speed setting
// ---------------------------------------------------------------------------

/// Wall-clock pacing for an attached display. Never affects simulated time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub enum SpeedSetting {
    RealTime,
    /// Twice real time.
    #[default]
    Recommended,
    /// Eight times real time.
    Fast,
    Custom(f64),
}

impl SpeedSetting {
    /// Simulated seconds per wall-clock second.
    pub fn multiplier(self) -> f64 {
        match self {
            SpeedSetting::RealTime => 1.0,
            SpeedSetting::Recommended => 2.0,
            SpeedSetting::Fast => 8.0,
            SpeedSetting::Custom(m) => m,
        }
    }
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Positions along the rail, in millimetres.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RailLayout {
    pub rail_start: f64,
    pub rail_end: f64,
    /// Start Point pickup position. The loader also parks here.
    pub start_position: f64,
    /// Scanners are spread symmetrically around this point.
    pub scanner_centre: f64,
    pub scanner_spacing: f64,
    /// Position of box 0. The unloader parks here.
    pub box_origin: f64,
    pub box_pitch: f64,
    /// Crane footprint width; the closest two crane centres may come.
    pub clearance: f64,
}

impl Default for RailLayout {
    fn default() -> Self {
        Self {
            rail_start: 0.0,
            rail_end: 1_250.0,
            start_position: 120.0,
            scanner_centre: 550.0,
            scanner_spacing: 120.0,
            box_origin: 1_000.0,
            box_pitch: 25.0,
            clearance: 80.0,
        }
    }
}

impl RailLayout {
    /// Centre of scanner `index` out of `count`.
    pub fn scanner_position(&self, index: u8, count: u8) -> f64 {
        let offset = index as f64 - (count as f64 - 1.0) / 2.0;
        self.scanner_centre + offset * self.scanner_spacing
    }

    pub fn box_position(&self, index: u8) -> f64 {
        self.box_origin + index as f64 * self.box_pitch
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("scanner count must be between 1 and {MAX_SCANNERS}, got {0}")]
    ScannerCount(u8),
    #[error("crane speed must be positive, got {0} mm/s")]
    NonPositiveSpeed(f64),
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
    #[error("speed multiplier must be finite and positive, got {0}")]
    InvalidMultiplier(f64),
    #[error("box count must be between 1 and {MAX_BOXES}, got {0}")]
    BoxCount(u8),
    #[error("crane clearance must be positive, got {0} mm")]
    NonPositiveClearance(f64),
    #[error("scanner spacing {spacing} mm is below the crane clearance {clearance} mm")]
    ScannerSpacing { spacing: f64, clearance: f64 },
    #[error("{site} at {position} mm does not fit on the rail")]
    OffRail { site: &'static str, position: f64 },
    #[error("boxes start at {box_origin} mm but must start at or right of {required} mm")]
    BoxesOverlapScanners { box_origin: f64, required: f64 },
    #[error("start point at {start} mm must be left of the first staging point {required} mm")]
    StartRightOfScanners { start: f64, required: f64 },
    #[error("initial crane placement: {0}")]
    Placement(#[from] RailError),
}

// ---------------------------------------------------------------------------
// SimConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub scanner_count: u8,
    /// Millimetres per second.
    pub crane_speed: f64,
    pub scan_duration: SimTime,
    /// Time to lower or to raise the hoist once. Only applies with
    /// `side_view` enabled.
    pub hoist_duration: SimTime,
    /// Time to close or open the gripper. May be zero.
    pub grip_duration: SimTime,
    pub policy: AssignmentPolicy,
    pub side_view: bool,
    pub pre_emptive: bool,
    pub speed: SpeedSetting,
    pub diamond_count: u32,
    pub box_count: u8,
    pub seed: u64,
    /// Shuffle the Start Point draw order with the seeded RNG.
    pub shuffle: bool,
    pub layout: RailLayout,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            scanner_count: 2,
            crane_speed: 333.0,
            scan_duration: 18_000,
            hoist_duration: 1_800,
            grip_duration: 200,
            policy: AssignmentPolicy::First,
            side_view: true,
            pre_emptive: true,
            speed: SpeedSetting::Recommended,
            diamond_count: 10,
            box_count: 8,
            seed: 42,
            shuffle: false,
            layout: RailLayout::default(),
        }
    }
}

impl SimConfig {
    /// Check every field. The first problem found is returned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scanner_count == 0 || self.scanner_count > MAX_SCANNERS {
            return Err(ConfigError::ScannerCount(self.scanner_count));
        }
        if !(self.crane_speed.is_finite() && self.crane_speed > 0.0) {
            return Err(ConfigError::NonPositiveSpeed(self.crane_speed));
        }
        if self.scan_duration == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "scan duration",
            });
        }
        if self.hoist_duration == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "hoist duration",
            });
        }
        let m = self.speed.multiplier();
        if !(m.is_finite() && m > 0.0) {
            return Err(ConfigError::InvalidMultiplier(m));
        }
        if self.box_count == 0 || self.box_count > MAX_BOXES {
            return Err(ConfigError::BoxCount(self.box_count));
        }
        self.validate_layout()
    }

    fn validate_layout(&self) -> Result<(), ConfigError> {
        let l = &self.layout;
        if !(l.clearance.is_finite() && l.clearance > 0.0) {
            return Err(ConfigError::NonPositiveClearance(l.clearance));
        }
        let half = l.clearance / 2.0;
        let fits = |site: &'static str, position: f64| {
            if position.is_finite()
                && position - half >= l.rail_start
                && position + half <= l.rail_end
            {
                Ok(())
            } else {
                Err(ConfigError::OffRail { site, position })
            }
        };

        if self.scanner_count > 1 && l.scanner_spacing < l.clearance {
            return Err(ConfigError::ScannerSpacing {
                spacing: l.scanner_spacing,
                clearance: l.clearance,
            });
        }

        fits("start point", l.start_position)?;
        let first = l.scanner_position(0, self.scanner_count);
        let last = l.scanner_position(self.scanner_count - 1, self.scanner_count);
        fits("first scanner", first)?;
        fits("staging point", first - l.clearance)?;
        fits("last scanner", last)?;
        if l.start_position > first - l.clearance {
            return Err(ConfigError::StartRightOfScanners {
                start: l.start_position,
                required: first - l.clearance,
            });
        }

        let required = last + l.clearance;
        if l.box_origin < required || l.box_pitch < 0.0 {
            return Err(ConfigError::BoxesOverlapScanners {
                box_origin: l.box_origin,
                required,
            });
        }
        fits("first box", l.box_origin)?;
        fits("last box", l.box_position(self.box_count - 1))?;
        Ok(())
    }

    /// Hoist time actually spent per lower or raise.
    pub fn effective_hoist(&self) -> SimTime {
        if self.side_view { self.hoist_duration } else { 0 }
    }

    pub fn speed_fixed(&self) -> Fixed64 {
        f64_to_fixed64(self.crane_speed)
    }

    pub fn scanner_position(&self, scanner: ScannerId) -> Fixed64 {
        f64_to_fixed64(self.layout.scanner_position(scanner.0, self.scanner_count))
    }

    /// Where the loader waits beside a busy scanner.
    pub fn staging_position(&self, scanner: ScannerId) -> Fixed64 {
        self.scanner_position(scanner) - f64_to_fixed64(self.layout.clearance)
    }

    pub fn box_position(&self, target: BoxId) -> Fixed64 {
        f64_to_fixed64(self.layout.box_position(target.0))
    }
}
