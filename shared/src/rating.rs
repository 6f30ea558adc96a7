use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Rating change is capped at this value regardless of multipliers.
pub const RATING_CEILING: f64 = 150.0;

pub const WEAPON_MULTIPLIERS: &[(&str, f64)] = &[
    ("AIM-9+", 4.0),
    ("AIM-120C", 1.0),
    ("AIM-120D", 1.0),
    ("AIM-54", 6.0),
    ("AIRS-T", 4.0),
    ("AIM-9", 4.0),
    ("GAU-8", 20.0),
    ("Vulcan", 20.0),
    ("AIM-7", 8.0),
    ("AIM-9E", 30.0),
    ("GAU-22", 20.0),
    ("M230", 20.0),
];

pub const AIRCRAFT_MULTIPLIERS: &[(&str, f64)] = &[
    ("F/A-26B", 4.0),
    ("EF-24G", 8.0),
    ("F-45A", 8.0),
    ("T-55", 2.0),
    ("AV-42C", 1.0),
];

/// Class of match; selects which stored rating a delta applies to.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum RatingCategory {
    /// Long-range engagements.
    Bvr,
    /// Close-range dogfights.
    Bfm,
    /// Cooperative play against AI.
    Pve,
}

impl RatingCategory {
    pub const ALL: [RatingCategory; 3] =
        [RatingCategory::Bvr, RatingCategory::Bfm, RatingCategory::Pve];

    pub fn default_rating(self) -> f64 {
        match self {
            RatingCategory::Bvr => 2000.0,
            RatingCategory::Bfm => 50.0,
            RatingCategory::Pve => 2000.0,
        }
    }

    /// Event type recorded for kills in this category.
    pub fn kill_event_type(self) -> &'static str {
        match self {
            RatingCategory::Bvr => "BVR_KILL",
            RatingCategory::Bfm => "BFM_KILL",
            RatingCategory::Pve => "PVE_KILL",
        }
    }
}

/// Weapon and aircraft multiplier lookup. Missing entries count as 1.0.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RatingTable {
    pub ceiling: f64,
    pub weapons: HashMap<String, f64>,
    pub aircraft: HashMap<String, f64>,
}

impl Default for RatingTable {
    fn default() -> Self {
        let to_map = |entries: &[(&str, f64)]| {
            entries
                .iter()
                .map(|(name, mult)| (name.to_string(), *mult))
                .collect()
        };

        Self {
            ceiling: RATING_CEILING,
            weapons: to_map(WEAPON_MULTIPLIERS),
            aircraft: to_map(AIRCRAFT_MULTIPLIERS),
        }
    }
}

impl RatingTable {
    pub fn weapon_multiplier(&self, weapon: &str) -> f64 {
        self.weapons.get(weapon).copied().unwrap_or(1.0)
    }

    pub fn aircraft_multiplier(&self, aircraft: &str) -> f64 {
        self.aircraft.get(aircraft).copied().unwrap_or(1.0)
    }

    /// Rating gained by the killer; the victim loses the same amount.
    pub fn delta(&self, weapon: &str, aircraft: &str) -> f64 {
        let product = self.weapon_multiplier(weapon) * self.aircraft_multiplier(aircraft);
        product.min(self.ceiling)
    }
}
