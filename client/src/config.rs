//! Rotation configuration.
//!
//! Loaded from a TOML file when one is given; every section falls back to the
//! built-in deployment defaults so a partial file is enough.

use crate::error::{DirectorError, Result};
use log::info;
use serde::{Deserialize, Serialize};
use shared::{
    RatingCategory, RatingTable, TAG_CHAT, TAG_FLIGHT_LOG, TAG_HOST_CONFIG, TAG_LOBBY_READY,
    TAG_SAVE_COMPLETE,
};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CAMPAIGN: &str = "2860956181";
const MERGE_CAMPAIGN: &str = "3355613749";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorConfig {
    pub host: HostSettings,
    pub timing: TimingSettings,
    pub tags: TagSettings,
    pub paths: PathSettings,
    pub rating: RatingTable,
    pub maps: Vec<MapState>,
}

/// Lobby settings pushed to the server on first entry into a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    pub name: String,
    pub password: String,
    /// Public lobbies are hosted without a password.
    pub public: bool,
    pub unit_icon: bool,
}

/// Durations in seconds. Fractions are allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    pub lobby_secs: f64,
    pub match_secs: f64,
    /// Pause after a state ends so players can review before the next map.
    pub review_secs: f64,
    /// Wait between `config` and `host` while the server loads the mission.
    pub settle_secs: f64,
    /// Gap between consecutive fire-and-forget commands.
    pub command_gap_secs: f64,
    pub request_timeout_secs: f64,
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagSettings {
    pub host_config: String,
    pub lobby_ready: String,
    pub save_complete: String,
    pub flight_log: String,
    pub chat: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Directory the game writes the running replay into.
    pub autosave_dir: PathBuf,
    /// Where bundles and `Flightlog_Latest.json` are written.
    pub replay_dir: PathBuf,
    pub store_file: PathBuf,
}

/// One entry of the rotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapState {
    pub id: String,
    pub campaign_id: String,
    pub mission: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub category: RatingCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lobby_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_secs: Option<f64>,
}

impl MapState {
    pub fn new(id: &str, campaign_id: &str, mission: &str, category: RatingCategory) -> Self {
        Self {
            id: id.to_string(),
            campaign_id: campaign_id.to_string(),
            mission: mission.to_string(),
            display_name: None,
            category,
            lobby_secs: None,
            match_secs: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.mission)
    }

    pub fn lobby_duration(&self, timing: &TimingSettings) -> Duration {
        secs(self.lobby_secs.unwrap_or(timing.lobby_secs))
    }

    pub fn match_duration(&self, timing: &TimingSettings) -> Duration {
        secs(self.match_secs.unwrap_or(timing.match_secs))
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl TimingSettings {
    pub fn review(&self) -> Duration {
        secs(self.review_secs)
    }

    pub fn settle(&self) -> Duration {
        secs(self.settle_secs)
    }

    pub fn command_gap(&self) -> Duration {
        secs(self.command_gap_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        secs(self.request_timeout_secs)
    }

    fn check(&self) -> Result<()> {
        let fields = [
            ("lobby_secs", self.lobby_secs),
            ("match_secs", self.match_secs),
            ("review_secs", self.review_secs),
            ("settle_secs", self.settle_secs),
            ("command_gap_secs", self.command_gap_secs),
            ("request_timeout_secs", self.request_timeout_secs),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(DirectorError::Config(format!(
                    "timing.{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        if self.request_timeout_secs == 0.0 {
            return Err(DirectorError::Config(
                "timing.request_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            name: "PvP Server-60min mapcycle".to_string(),
            password: "2025".to_string(),
            public: true,
            unit_icon: false,
        }
    }
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            lobby_secs: 60.0,
            match_secs: 3600.0,
            review_secs: 60.0,
            settle_secs: 50.0,
            command_gap_secs: 0.3,
            request_timeout_secs: 180.0,
            retries: 1,
        }
    }
}

impl Default for TagSettings {
    fn default() -> Self {
        Self {
            host_config: TAG_HOST_CONFIG.to_string(),
            lobby_ready: TAG_LOBBY_READY.to_string(),
            save_complete: TAG_SAVE_COMPLETE.to_string(),
            flight_log: TAG_FLIGHT_LOG.to_string(),
            chat: TAG_CHAT.to_string(),
        }
    }
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            autosave_dir: PathBuf::from("Replays/Autosave1"),
            replay_dir: PathBuf::from("Replays"),
            store_file: PathBuf::from("players.json"),
        }
    }
}

pub fn default_maps() -> Vec<MapState> {
    vec![
        MapState::new("ethi5", DEFAULT_CAMPAIGN, "BVR Ethi5", RatingCategory::Bvr),
        MapState::new("merge_large", MERGE_CAMPAIGN, "MergeLarge", RatingCategory::Bfm),
        MapState::new("archipel", DEFAULT_CAMPAIGN, "BVR Archipel", RatingCategory::Bvr),
        MapState::new("ocixem", DEFAULT_CAMPAIGN, "BVR Ocixem", RatingCategory::Bvr),
        MapState::new("crack", DEFAULT_CAMPAIGN, "BVR Crack", RatingCategory::Bvr),
        MapState::new("mtns_hills", DEFAULT_CAMPAIGN, "BVR afMtnsHills", RatingCategory::Bvr),
    ]
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            host: HostSettings::default(),
            timing: TimingSettings::default(),
            tags: TagSettings::default(),
            paths: PathSettings::default(),
            rating: RatingTable::default(),
            maps: default_maps(),
        }
    }
}

impl DirectorConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: DirectorConfig =
            toml::from_str(content).map_err(|e| DirectorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| DirectorError::Config(e.to_string()))
    }

    /// Reads `path`, or writes the defaults there first if it does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .map_err(|e| DirectorError::Config(format!("{}: {}", path.display(), e)))?;
            Self::from_toml(&content)
        } else {
            let config = DirectorConfig::default();
            fs::write(path, config.to_toml()?)
                .map_err(|e| DirectorError::Config(format!("{}: {}", path.display(), e)))?;
            info!("Created default configuration file: {}", path.display());
            Ok(config)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.maps.is_empty() {
            return Err(DirectorError::Config("the rotation has no maps".into()));
        }

        let mut ids = HashSet::new();
        for map in &self.maps {
            if map.id.is_empty() || map.mission.is_empty() || map.campaign_id.is_empty() {
                return Err(DirectorError::Config(format!(
                    "map '{}' needs an id, a campaign id and a mission",
                    map.id
                )));
            }
            if !ids.insert(map.id.as_str()) {
                return Err(DirectorError::Config(format!("duplicate map id '{}'", map.id)));
            }
            for value in [map.lobby_secs, map.match_secs].into_iter().flatten() {
                if !value.is_finite() || value < 0.0 {
                    return Err(DirectorError::Config(format!(
                        "map '{}' has an invalid duration {}",
                        map.id, value
                    )));
                }
            }
        }

        self.timing.check()?;

        let tags = [
            &self.tags.host_config,
            &self.tags.lobby_ready,
            &self.tags.save_complete,
            &self.tags.flight_log,
            &self.tags.chat,
        ];
        if tags.iter().any(|tag| tag.is_empty()) {
            return Err(DirectorError::Config("protocol tags must not be empty".into()));
        }
        Ok(())
    }

    pub fn check_start_index(&self, index: usize) -> Result<()> {
        if index >= self.maps.len() {
            return Err(DirectorError::Config(format!(
                "start index {} is out of range (0..{})",
                index,
                self.maps.len()
            )));
        }
        Ok(())
    }
}
