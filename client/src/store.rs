//! Player and session persistence.
//!
//! All calls are blocking and callers on the runtime move them onto the
//! blocking pool. Failures come back as `DirectorError::Store` and are logged
//! by the caller; nothing here is allowed to stop the rotation.

use crate::error::{DirectorError, Result};
use crate::roster::OnlinePlayer;
use crate::telemetry::SessionEvent;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use shared::RatingCategory;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub player_id: String,
    pub name: String,
    /// Every display name this id has been seen under, oldest first.
    pub name_history: Vec<String>,
    pub ratings: HashMap<RatingCategory, f64>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl PlayerRecord {
    pub fn new(player_id: &str, name: &str) -> Self {
        let now = Utc::now();
        Self {
            player_id: player_id.to_string(),
            name: name.to_string(),
            name_history: vec![name.to_string()],
            ratings: RatingCategory::ALL
                .iter()
                .map(|category| (*category, category.default_rating()))
                .collect(),
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn rating(&self, category: RatingCategory) -> f64 {
        self.ratings
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.default_rating())
    }
}

/// Identifies the replay a session belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayMeta {
    pub map_id: String,
    pub mission: String,
    pub category: RatingCategory,
    /// Archive written for this session, if archival got that far.
    pub bundle: Option<PathBuf>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub replay: ReplayMeta,
    pub events: Vec<SessionEvent>,
    pub flight_log: String,
}

pub trait PlayerStore: Send + Sync {
    /// Returns the stored record, creating it with default ratings if the id
    /// is new. A known id seen under a new name gets that name appended to its
    /// history.
    fn lookup_or_create_player(&self, player_id: &str, name: &str) -> Result<PlayerRecord>;

    fn record_session(
        &self,
        events: &[SessionEvent],
        replay: &ReplayMeta,
        flight_log: &str,
    ) -> Result<()>;

    /// Adds each player's accumulated session delta to their stored rating in
    /// `category`. Returns nothing about individual players; a missing record
    /// is created first.
    fn apply_rating_deltas(&self, roster: &[OnlinePlayer], category: RatingCategory) -> Result<()>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StoreData {
    pub players: HashMap<String, PlayerRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sessions: Vec<SessionRecord>,
}

impl StoreData {
    fn lookup_or_create(&mut self, player_id: &str, name: &str) -> PlayerRecord {
        let record = self
            .players
            .entry(player_id.to_string())
            .or_insert_with(|| {
                info!("New player {} ({})", name, player_id);
                PlayerRecord::new(player_id, name)
            });

        if record.name != name {
            debug!("{} is now known as {}", record.name, name);
            record.name = name.to_string();
        }
        if !record.name_history.iter().any(|known| known == name) {
            record.name_history.push(name.to_string());
        }
        record.last_seen = Utc::now();
        record.clone()
    }

    fn apply_deltas(&mut self, roster: &[OnlinePlayer], category: RatingCategory) {
        for player in roster.iter().filter(|p| !p.deltas.is_empty()) {
            let record = self
                .players
                .entry(player.player_id.clone())
                .or_insert_with(|| PlayerRecord::new(&player.player_id, &player.name));

            // builds on the stored value, which may have moved since the
            // session started
            let current = record.rating(category);
            let updated = current + player.total_delta();
            record.ratings.insert(category, updated);
            info!(
                "{} {:?} rating {:.1} -> {:.1}",
                record.name, category, current, updated
            );
        }
    }
}

/// In-process store. Also the working set behind `JsonFileStore`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: StoreData) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreData> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> StoreData {
        self.lock().clone()
    }

    pub fn player(&self, player_id: &str) -> Option<PlayerRecord> {
        self.lock().players.get(player_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }
}

impl PlayerStore for MemoryStore {
    fn lookup_or_create_player(&self, player_id: &str, name: &str) -> Result<PlayerRecord> {
        Ok(self.lock().lookup_or_create(player_id, name))
    }

    fn record_session(
        &self,
        events: &[SessionEvent],
        replay: &ReplayMeta,
        flight_log: &str,
    ) -> Result<()> {
        self.lock().sessions.push(SessionRecord {
            replay: replay.clone(),
            events: events.to_vec(),
            flight_log: flight_log.to_string(),
        });
        Ok(())
    }

    fn apply_rating_deltas(&self, roster: &[OnlinePlayer], category: RatingCategory) -> Result<()> {
        self.lock().apply_deltas(roster, category);
        Ok(())
    }
}

/// File-backed store.
///
/// Player records live in a JSON file that is rewritten whenever one changes.
/// Sessions carry whole flight logs, so they are appended one per line to a
/// `.sessions.jsonl` file next to it and never rewritten.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    sessions_path: PathBuf,
    memory: MemoryStore,
    sessions: AtomicUsize,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Loads `path` if it exists, otherwise starts empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let sessions_path = path.with_extension("sessions.jsonl");
        let mut data: StoreData = if path.exists() {
            let contents = fs::read_to_string(&path).map_err(store_error(&path))?;
            serde_json::from_str(&contents)
                .map_err(|e| DirectorError::Store(format!("{}: {}", path.display(), e)))?
        } else {
            StoreData::default()
        };

        // files written before sessions moved out still embed them
        let legacy = std::mem::take(&mut data.sessions);

        let store = Self {
            path,
            sessions_path,
            memory: MemoryStore::from_data(data),
            sessions: AtomicUsize::new(0),
            write_lock: Mutex::new(()),
        };
        store.sessions.store(store.count_sessions()?, Ordering::SeqCst);

        if !legacy.is_empty() {
            info!("Moving {} session(s) to {}", legacy.len(), store.sessions_path.display());
            for session in &legacy {
                store.append_session(session)?;
            }
            store.persist()?;
        }

        info!(
            "Player store {} ({} player(s), {} session(s))",
            store.path.display(),
            store.memory.lock().players.len(),
            store.session_count()
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sessions_path(&self) -> &Path {
        &self.sessions_path
    }

    /// Player records. Sessions are not kept in memory; see `load_sessions`.
    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Reads every recorded session back from disk, oldest first.
    pub fn load_sessions(&self) -> Result<Vec<SessionRecord>> {
        if !self.sessions_path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.sessions_path).map_err(store_error(&self.sessions_path))?;
        let mut sessions = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(store_error(&self.sessions_path))?;
            if line.trim().is_empty() {
                continue;
            }
            let session = serde_json::from_str(&line)
                .map_err(|e| DirectorError::Store(format!("{}: {}", self.sessions_path.display(), e)))?;
            sessions.push(session);
        }
        Ok(sessions)
    }

    fn count_sessions(&self) -> Result<usize> {
        if !self.sessions_path.exists() {
            return Ok(0);
        }
        let file = fs::File::open(&self.sessions_path).map_err(store_error(&self.sessions_path))?;
        let mut count = 0;
        for line in BufReader::new(file).lines() {
            if !line.map_err(store_error(&self.sessions_path))?.trim().is_empty() {
                count += 1;
            }
        }
        Ok(count)
    }

    fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(store_error(parent))?;
        }
        Ok(())
    }

    fn append_session(&self, session: &SessionRecord) -> Result<()> {
        let mut line =
            serde_json::to_string(session).map_err(|e| DirectorError::Store(e.to_string()))?;
        line.push('\n');

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.ensure_parent()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.sessions_path)
            .map_err(store_error(&self.sessions_path))?;
        file.write_all(line.as_bytes())
            .map_err(store_error(&self.sessions_path))?;
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let players = StoreData {
            players: self.memory.lock().players.clone(),
            sessions: Vec::new(),
        };
        let json = serde_json::to_string_pretty(&players)
            .map_err(|e| DirectorError::Store(e.to_string()))?;

        self.ensure_parent()?;
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, json).map_err(store_error(&temp_path))?;
        fs::rename(&temp_path, &self.path).map_err(store_error(&self.path))?;
        Ok(())
    }
}

fn store_error(path: &Path) -> impl FnOnce(std::io::Error) -> DirectorError + '_ {
    move |e| DirectorError::Store(format!("{}: {}", path.display(), e))
}

impl PlayerStore for JsonFileStore {
    fn lookup_or_create_player(&self, player_id: &str, name: &str) -> Result<PlayerRecord> {
        let record = self.memory.lookup_or_create_player(player_id, name)?;
        self.persist()?;
        Ok(record)
    }

    fn record_session(
        &self,
        events: &[SessionEvent],
        replay: &ReplayMeta,
        flight_log: &str,
    ) -> Result<()> {
        self.append_session(&SessionRecord {
            replay: replay.clone(),
            events: events.to_vec(),
            flight_log: flight_log.to_string(),
        })
    }

    fn apply_rating_deltas(&self, roster: &[OnlinePlayer], category: RatingCategory) -> Result<()> {
        self.memory.apply_rating_deltas(roster, category)?;
        self.persist()
    }
}
