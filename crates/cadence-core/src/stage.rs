//! The seven-touch stage enum.
//!
//! A sequence walks `touch1 → touch7` in order. `step` is the 1-based
//! ordinal mirror of the stage; a step past `Stage::LAST` means the
//! sequence completed.

use serde::{Deserialize, Serialize};

/// One of the seven ordered outreach touchpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Touch1,
    Touch2,
    Touch3,
    Touch4,
    Touch5,
    Touch6,
    Touch7,
}

impl Stage {
    /// All stages in sequence order.
    pub const ALL: [Stage; 7] = [
        Stage::Touch1,
        Stage::Touch2,
        Stage::Touch3,
        Stage::Touch4,
        Stage::Touch5,
        Stage::Touch6,
        Stage::Touch7,
    ];

    /// Ordinal of the last stage.
    pub const LAST: u32 = 7;

    /// 1-based ordinal of this stage.
    pub fn step(&self) -> u32 {
        match self {
            Stage::Touch1 => 1,
            Stage::Touch2 => 2,
            Stage::Touch3 => 3,
            Stage::Touch4 => 4,
            Stage::Touch5 => 5,
            Stage::Touch6 => 6,
            Stage::Touch7 => 7,
        }
    }

    /// Stage for a 1-based step, or None past the end.
    pub fn from_step(step: u32) -> Option<Stage> {
        match step {
            1 => Some(Stage::Touch1),
            2 => Some(Stage::Touch2),
            3 => Some(Stage::Touch3),
            4 => Some(Stage::Touch4),
            5 => Some(Stage::Touch5),
            6 => Some(Stage::Touch6),
            7 => Some(Stage::Touch7),
            _ => None,
        }
    }

    /// The stage after this one, or None after touch7.
    pub fn next(&self) -> Option<Stage> {
        Stage::from_step(self.step() + 1)
    }

    /// Canonical wire/DB name ("touch1" .. "touch7").
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Touch1 => "touch1",
            Stage::Touch2 => "touch2",
            Stage::Touch3 => "touch3",
            Stage::Touch4 => "touch4",
            Stage::Touch5 => "touch5",
            Stage::Touch6 => "touch6",
            Stage::Touch7 => "touch7",
        }
    }

    /// Parse a stage name. Accepts "touch1".."touch7" and bare "1".."7".
    pub fn parse(s: &str) -> Option<Stage> {
        let s = s.trim().to_ascii_lowercase();
        if let Some(n) = s.strip_prefix("touch") {
            return n.parse().ok().and_then(Stage::from_step);
        }
        s.parse().ok().and_then(Stage::from_step)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = crate::error::CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::parse(s)
            .ok_or_else(|| crate::error::CadenceError::Validation(format!("unknown stage '{s}'")))
    }
}
