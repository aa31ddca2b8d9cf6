use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Relay identity used by the host application.
pub const HOST_ID: &str = "host";

/// One of the two controller positions a handheld device can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Slot {
    P1,
    P2,
}

impl Slot {
    pub const ALL: [Slot; 2] = [Slot::P1, Slot::P2];

    /// The relay identity a device in this slot registers under.
    pub fn id(self) -> &'static str {
        match self {
            Slot::P1 => "P1",
            Slot::P2 => "P2",
        }
    }

    /// The `playerId` carried in telegrams from this slot.
    pub fn player_id(self) -> i32 {
        match self {
            Slot::P1 => 0,
            Slot::P2 => 1,
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "P1" => Some(Slot::P1),
            "P2" => Some(Slot::P2),
            _ => None,
        }
    }

    pub fn from_player_id(player_id: i32) -> Option<Self> {
        match player_id {
            0 => Some(Slot::P1),
            1 => Some(Slot::P2),
            _ => None,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSlot(pub String);

impl fmt::Display for UnknownSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown slot {:?} (expected P1 or P2)", self.0)
    }
}

impl std::error::Error for UnknownSlot {}

impl FromStr for Slot {
    type Err = UnknownSlot;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Slot::from_id(&s.to_ascii_uppercase()).ok_or_else(|| UnknownSlot(s.to_string()))
    }
}
