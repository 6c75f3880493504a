use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies a diamond for as long as it lives in the simulation.
    pub struct DiamondId;
}

/// A crane on the shared rail. The colour doubles as identity.
///
/// Blue always stays left of Red: the rail does not let them pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CraneId {
    Blue,
    Red,
}

impl CraneId {
    /// Both cranes, in their fixed left-to-right rail order.
    pub const ALL: [CraneId; 2] = [CraneId::Blue, CraneId::Red];

    /// Index into per-crane arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The other crane on the rail.
    pub fn other(self) -> CraneId {
        match self {
            CraneId::Blue => CraneId::Red,
            CraneId::Red => CraneId::Blue,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CraneId::Blue => "blue",
            CraneId::Red => "red",
        }
    }
}

impl std::fmt::Display for CraneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifies a scanner. Zero-based; scanner 0 is the leftmost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScannerId(pub u8);

impl ScannerId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ScannerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scanner {}", self.0 + 1)
    }
}

/// Identifies an end box. A scan result is the box the diamond belongs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BoxId(pub u8);

impl BoxId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to a scheduled event, used to mark it inert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventHandle(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crane_other_is_involution() {
        for crane in CraneId::ALL {
            assert_eq!(crane.other().other(), crane);
            assert_ne!(crane.other(), crane);
        }
    }

    #[test]
    fn crane_rail_order() {
        assert!(CraneId::Blue < CraneId::Red);
        assert_eq!(CraneId::Blue.index(), 0);
        assert_eq!(CraneId::Red.index(), 1);
    }

    #[test]
    fn scanner_display_is_one_based() {
        assert_eq!(ScannerId(0).to_string(), "scanner 1");
        assert_eq!(ScannerId(3).to_string(), "scanner 4");
    }

    #[test]
    fn ids_are_hashable() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(BoxId(0), "reject");
        map.insert(BoxId(1), "grade a");
        assert_eq!(map[&BoxId(1)], "grade a");
    }
}
