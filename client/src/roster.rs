//! Online-player roster for the active map state
//!
//! This module tracks who is in the current session and what their rating
//! has done since it started:
//! - Player connection lifecycle (connect, disconnect, reconnect)
//! - Provisional rating deltas accumulated from kills
//! - Snapshots handed to persistence when the state ends
//!
//! Entries are never removed on disconnect. A player who leaves mid-match
//! keeps their deltas so the end-of-state flush can still attribute them.

use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One player seen during the current session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlinePlayer {
    /// Display name as last announced by the host
    pub name: String,
    /// Stable identifier from the host (platform account id)
    pub player_id: String,
    pub connected: bool,
    /// Stored rating for the active category when the player joined
    pub rating_at_start: f64,
    /// Rating deltas in the order they were earned
    pub deltas: Vec<f64>,
}

impl OnlinePlayer {
    /// Creates a connected player with no session history
    pub fn new(name: &str, player_id: &str, rating_at_start: f64) -> Self {
        Self {
            name: name.to_string(),
            player_id: player_id.to_string(),
            connected: true,
            rating_at_start,
            deltas: Vec::new(),
        }
    }

    pub fn total_delta(&self) -> f64 {
        self.deltas.iter().sum()
    }

    /// Start rating plus everything earned this session
    pub fn provisional_rating(&self) -> f64 {
        self.rating_at_start + self.total_delta()
    }
}

/// Result of applying a kill to the roster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillAttribution {
    pub killer_found: bool,
    pub target_found: bool,
}

/// Players of the current session keyed by player id
///
/// Lookups by display name prefer connected entries, since a name can be
/// reused by a different account after its previous owner disconnected.
#[derive(Debug, Default)]
pub struct Roster {
    players: HashMap<String, OnlinePlayer>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the id has an entry that is currently disconnected
    pub fn is_disconnected(&self, player_id: &str) -> bool {
        self.players
            .get(player_id)
            .map_or(false, |player| !player.connected)
    }

    pub fn contains(&self, player_id: &str) -> bool {
        self.players.contains_key(player_id)
    }

    /// Adds a freshly connected player
    ///
    /// If the id already has an entry only the display name is refreshed and
    /// the entry is marked connected. Session history is never reset.
    pub fn connect(&mut self, player: OnlinePlayer) {
        if let Some(existing) = self.players.get_mut(&player.player_id) {
            existing.name = player.name;
            existing.connected = true;
            return;
        }
        info!("{} ({}) joined the session", player.name, player.player_id);
        self.players.insert(player.player_id.clone(), player);
    }

    /// Marks a disconnected entry connected again under `name`
    ///
    /// Returns false if the id is unknown.
    pub fn reconnect(&mut self, player_id: &str, name: &str) -> bool {
        match self.players.get_mut(player_id) {
            Some(player) => {
                info!("{} ({}) reconnected", name, player_id);
                player.name = name.to_string();
                player.connected = true;
                true
            }
            None => false,
        }
    }

    /// Marks the entry with this display name disconnected
    pub fn disconnect_by_name(&mut self, name: &str) -> bool {
        let id = match self.id_for_name(name) {
            Some(id) => id,
            None => return false,
        };
        if let Some(player) = self.players.get_mut(&id) {
            player.connected = false;
            info!("{} ({}) left the session", player.name, player.player_id);
        }
        true
    }

    fn id_for_name(&self, name: &str) -> Option<String> {
        let mut fallback = None;
        for player in self.players.values().filter(|p| p.name == name) {
            if player.connected {
                return Some(player.player_id.clone());
            }
            fallback = Some(player.player_id.clone());
        }
        fallback
    }

    pub fn find_by_name(&self, name: &str) -> Option<&OnlinePlayer> {
        self.id_for_name(name)
            .and_then(|id| self.players.get(&id))
    }

    pub fn get(&self, player_id: &str) -> Option<&OnlinePlayer> {
        self.players.get(player_id)
    }

    /// Replaces the start rating once the stored value is known
    ///
    /// Returns `false` if the player left the roster in the meantime, e.g.
    /// because a new state started.
    pub fn set_start_rating(&mut self, player_id: &str, rating: f64) -> bool {
        match self.players.get_mut(player_id) {
            Some(player) => {
                player.rating_at_start = rating;
                true
            }
            None => false,
        }
    }

    /// Credits `delta` to the killer and debits it from the target
    ///
    /// Either side may be missing from the roster (bots, players who joined
    /// before the director did). Missing sides are reported, not created.
    pub fn apply_kill(&mut self, killer: &str, target: &str, delta: f64) -> KillAttribution {
        let killer_id = self.id_for_name(killer);
        let target_id = self.id_for_name(target);

        if let Some(player) = killer_id.as_ref().and_then(|id| self.players.get_mut(id)) {
            player.deltas.push(delta);
        }
        if let Some(player) = target_id.as_ref().and_then(|id| self.players.get_mut(id)) {
            player.deltas.push(-delta);
        }

        KillAttribution {
            killer_found: killer_id.is_some(),
            target_found: target_id.is_some(),
        }
    }

    /// Copies every entry, sorted by player id for stable output
    pub fn snapshot(&self) -> Vec<OnlinePlayer> {
        let mut players: Vec<OnlinePlayer> = self.players.values().cloned().collect();
        players.sort_by(|a, b| a.player_id.cmp(&b.player_id));
        players
    }

    pub fn connected_count(&self) -> usize {
        self.players.values().filter(|p| p.connected).count()
    }

    pub fn clear(&mut self) {
        self.players.clear();
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}
