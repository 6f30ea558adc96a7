//! Live chat telemetry: roster upkeep and kill rating.
//!
//! The engine runs on the reader task as the router's auto-processor. The
//! rotation driver reads it only at state boundaries through `begin_state` and
//! `take_snapshot`; the session mutex is the hand-off between the two.

use crate::error::{DirectorError, Result};
use crate::roster::{OnlinePlayer, Roster};
use crate::router::AutoProcessor;
use crate::store::PlayerStore;
use crate::transport::Outbound;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use shared::{parse_chat_line, ChatPayload, Command, InboundMessage, RatingCategory, RatingTable, TelemetryEvent};
use std::sync::{Arc, Mutex, MutexGuard};

/// One recorded kill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub killer_id: Option<String>,
    pub killer_name: String,
    pub target_id: Option<String>,
    pub target_name: String,
    pub aircraft: String,
    pub weapon: String,
    pub delta: f64,
}

/// Everything accumulated during one map state.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub category: RatingCategory,
    pub roster: Vec<OnlinePlayer>,
    pub events: Vec<SessionEvent>,
}

#[derive(Debug)]
struct Session {
    category: RatingCategory,
    roster: Roster,
    events: Vec<SessionEvent>,
}

pub struct TelemetryEngine {
    store: Arc<dyn PlayerStore>,
    ratings: RatingTable,
    session: Arc<Mutex<Session>>,
}

impl TelemetryEngine {
    pub fn new(store: Arc<dyn PlayerStore>, ratings: RatingTable, category: RatingCategory) -> Self {
        Self {
            store,
            ratings,
            session: Arc::new(Mutex::new(Session {
                category,
                roster: Roster::new(),
                events: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        lock_session(&self.session)
    }

    pub fn ratings(&self) -> &RatingTable {
        &self.ratings
    }

    pub fn category(&self) -> RatingCategory {
        self.lock().category
    }

    /// Starts a fresh session for a new map state.
    pub fn begin_state(&self, category: RatingCategory) {
        let mut session = self.lock();
        if !session.events.is_empty() || !session.roster.is_empty() {
            warn!(
                "Discarding {} unflushed event(s) from the previous state",
                session.events.len()
            );
        }
        session.category = category;
        session.roster.clear();
        session.events.clear();
    }

    /// Drains the session. The roster and event log are empty afterwards.
    pub fn take_snapshot(&self) -> SessionSnapshot {
        let mut session = self.lock();
        let snapshot = SessionSnapshot {
            category: session.category,
            roster: session.roster.snapshot(),
            events: std::mem::take(&mut session.events),
        };
        session.roster.clear();
        snapshot
    }

    pub fn roster(&self) -> Vec<OnlinePlayer> {
        self.lock().roster.snapshot()
    }

    pub fn event_count(&self) -> usize {
        self.lock().events.len()
    }

    pub fn handle(&self, event: TelemetryEvent, player_id: &str, outbound: &Outbound) -> Result<()> {
        match event {
            TelemetryEvent::Connect { name } => {
                self.on_connect(&name, player_id);
                Ok(())
            }
            TelemetryEvent::Disconnect { name } => {
                if !self.lock().roster.disconnect_by_name(&name) {
                    debug!("Disconnect for {} who was never on the roster", name);
                }
                Ok(())
            }
            TelemetryEvent::Kill {
                killer,
                aircraft,
                target,
                weapon,
            } => self
                .on_kill(&killer, &aircraft, &target, &weapon, outbound)
                .map(|_| ()),
        }
    }

    /// New players join the roster straight away at the category default so
    /// a kill right after the connect line is still credited. The stored
    /// rating is looked up off the reader task and patched in when it lands.
    fn on_connect(&self, name: &str, player_id: &str) {
        let category = {
            let mut session = self.lock();
            if session.roster.is_disconnected(player_id) {
                session.roster.reconnect(player_id, name);
                return;
            }
            if session.roster.contains(player_id) {
                session.roster.connect(OnlinePlayer::new(name, player_id, 0.0));
                return;
            }
            let category = session.category;
            session
                .roster
                .connect(OnlinePlayer::new(name, player_id, category.default_rating()));
            category
        };

        let store = Arc::clone(&self.store);
        let session = Arc::clone(&self.session);
        let name = name.to_string();
        let player_id = player_id.to_string();
        let lookup = move || seed_start_rating(store.as_ref(), &session, &name, &player_id, category);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(lookup);
            }
            Err(_) => lookup(),
        }
    }

    fn on_kill(
        &self,
        killer: &str,
        aircraft: &str,
        target: &str,
        weapon: &str,
        outbound: &Outbound,
    ) -> Result<SessionEvent> {
        let delta = self.ratings.delta(weapon, aircraft);

        let (event, attribution) = {
            let mut session = self.lock();
            let attribution = session.roster.apply_kill(killer, target, delta);
            let event = SessionEvent {
                timestamp: Utc::now(),
                event_type: session.category.kill_event_type().to_string(),
                killer_id: session.roster.find_by_name(killer).map(|p| p.player_id.clone()),
                killer_name: killer.to_string(),
                target_id: session.roster.find_by_name(target).map(|p| p.player_id.clone()),
                target_name: target.to_string(),
                aircraft: aircraft.to_string(),
                weapon: weapon.to_string(),
                delta,
            };
            session.events.push(event.clone());
            (event, attribution)
        };

        info!(
            "{} killed {} ({}) with {}: {:+.1}",
            killer, target, aircraft, weapon, delta
        );
        outbound.send_line(
            &Command::SendLog(format!(
                "{} {:+.1} | {} {:+.1}",
                killer, delta, target, -delta
            ))
            .to_string(),
        );

        if !attribution.killer_found {
            return Err(DirectorError::Rating(format!(
                "no roster entry for killer '{}'",
                killer
            )));
        }
        Ok(event)
    }
}

fn lock_session(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(|e| e.into_inner())
}

fn seed_start_rating(
    store: &dyn PlayerStore,
    session: &Mutex<Session>,
    name: &str,
    player_id: &str,
    category: RatingCategory,
) {
    let rating = match store.lookup_or_create_player(player_id, name) {
        Ok(record) => record.rating(category),
        Err(e) => {
            error!("Player lookup for {} failed: {}", name, e);
            return;
        }
    };

    let mut session = lock_session(session);
    if session.category != category {
        debug!("{} joined before a state change, keeping default rating", name);
        return;
    }
    if !session.roster.set_start_rating(player_id, rating) {
        debug!("{} left before the stored rating arrived", name);
    }
}

impl AutoProcessor for TelemetryEngine {
    fn process(&self, message: &InboundMessage, outbound: &Outbound) -> bool {
        let Some(payload) = ChatPayload::from_value(&message.msg) else {
            debug!("Chat message without player id or text: {}", message.msg);
            return false;
        };
        let Some(event) = parse_chat_line(&payload.text) else {
            return false;
        };

        if let Err(e) = self.handle(event, &payload.player_id, outbound) {
            warn!("Telemetry: {}", e);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, PlayerRecord, ReplayMeta};
    use assert_approx_eq::assert_approx_eq;
    use serde_json::json;
    use shared::TAG_CHAT;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn engine() -> (TelemetryEngine, Arc<MemoryStore>, Outbound, UnboundedReceiver<String>) {
        let store = Arc::new(MemoryStore::new());
        let engine = TelemetryEngine::new(store.clone(), RatingTable::default(), RatingCategory::Bvr);
        let (outbound, rx) = Outbound::channel();
        (engine, store, outbound, rx)
    }

    fn chat(player_id: &str, text: &str) -> InboundMessage {
        InboundMessage::tagged(TAG_CHAT, json!({ "steamid": player_id, "msg": text }))
    }

    #[test]
    fn test_connect_then_kill() {
        let (engine, _store, outbound, mut rx) = engine();

        assert!(engine.process(&chat("76500000000000001", "Ace has connected."), &outbound));
        assert!(engine.process(&chat("76500000000000002", "Rival has connected."), &outbound));
        let roster = engine.roster();
        assert_eq!(roster.len(), 2);
        assert!(roster.iter().all(|p| p.connected));

        assert!(engine.process(
            &chat("76500000000000001", "Ace killed F-16 (Rival) with AIM-9."),
            &outbound
        ));

        let roster = engine.roster();
        let ace = roster.iter().find(|p| p.name == "Ace").unwrap();
        let rival = roster.iter().find(|p| p.name == "Rival").unwrap();
        assert_eq!(ace.deltas.len(), 1);
        assert_approx_eq!(ace.deltas[0], 4.0);
        assert_approx_eq!(rival.deltas[0], -4.0);

        assert_eq!(engine.event_count(), 1);
        assert_eq!(rx.try_recv().unwrap(), "sendlog Ace +4.0 | Rival -4.0");
    }

    #[test]
    fn test_connect_seeds_rating_from_store() {
        let (engine, store, outbound, _rx) = engine();
        let mut veteran = OnlinePlayer::new("Vet", "9", 0.0);
        veteran.deltas.push(150.0);
        store
            .apply_rating_deltas(&[veteran], RatingCategory::Bvr)
            .unwrap();

        engine.process(&chat("9", "Vet has connected."), &outbound);
        assert_approx_eq!(engine.roster()[0].rating_at_start, 2150.0);
        assert!(store.player("9").is_some());
    }

    #[test]
    fn test_reconnect_keeps_history() {
        let (engine, _store, outbound, _rx) = engine();
        engine.process(&chat("1", "Ace has connected."), &outbound);
        engine.process(&chat("1", "Ace killed F-45A (Bot) with AIM-120C."), &outbound);
        engine.process(&chat("1", "Ace has disconnected."), &outbound);
        assert!(!engine.roster()[0].connected);

        engine.process(&chat("1", "AceAgain has connected."), &outbound);
        let roster = engine.roster();
        assert_eq!(roster.len(), 1);
        assert!(roster[0].connected);
        assert_eq!(roster[0].name, "AceAgain");
        assert_eq!(roster[0].deltas, vec![8.0]);
    }

    #[test]
    fn test_kill_without_roster_entry_is_still_recorded() {
        let (engine, _store, outbound, mut rx) = engine();
        assert!(engine.process(
            &chat("1", "Ghost killed AV-42C (Nobody) with GAU-8."),
            &outbound
        ));

        let snapshot = engine.take_snapshot();
        assert_eq!(snapshot.events.len(), 1);
        assert_eq!(snapshot.events[0].killer_id, None);
        assert_approx_eq!(snapshot.events[0].delta, 20.0);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_delta_is_capped() {
        let (engine, _store, outbound, _rx) = engine();
        engine.process(&chat("1", "Ace has connected."), &outbound);
        engine.process(&chat("1", "Ace killed EF-24G (X) with AIM-9E."), &outbound);
        assert_approx_eq!(engine.roster()[0].deltas[0], 150.0);
    }

    #[test]
    fn test_event_type_follows_category() {
        let (engine, _store, outbound, _rx) = engine();
        engine.begin_state(RatingCategory::Bfm);
        engine.process(&chat("1", "A killed T-55 (B) with Vulcan."), &outbound);
        let snapshot = engine.take_snapshot();
        assert_eq!(snapshot.category, RatingCategory::Bfm);
        assert_eq!(snapshot.events[0].event_type, RatingCategory::Bfm.kill_event_type());
    }

    #[test]
    fn test_unrecognised_chat_is_not_processed() {
        let (engine, _store, outbound, _rx) = engine();
        assert!(!engine.process(&chat("1", "gg wp"), &outbound));
        assert!(!engine.process(
            &InboundMessage::tagged(TAG_CHAT, json!("Ace has connected.")),
            &outbound
        ));
        assert_eq!(engine.event_count(), 0);
        assert!(engine.roster().is_empty());
    }

    #[test]
    fn test_take_snapshot_clears_session() {
        let (engine, _store, outbound, _rx) = engine();
        engine.process(&chat("1", "Ace has connected."), &outbound);
        engine.process(&chat("1", "Ace killed F-45A (Bot) with AIM-9."), &outbound);

        let snapshot = engine.take_snapshot();
        assert_eq!(snapshot.roster.len(), 1);
        assert_eq!(snapshot.events.len(), 1);
        assert!(engine.roster().is_empty());
        assert_eq!(engine.event_count(), 0);
    }

    /// Store that takes a while to answer player lookups.
    struct SlowStore {
        inner: MemoryStore,
        delay: std::time::Duration,
    }

    impl PlayerStore for SlowStore {
        fn lookup_or_create_player(&self, player_id: &str, name: &str) -> Result<PlayerRecord> {
            std::thread::sleep(self.delay);
            self.inner.lookup_or_create_player(player_id, name)
        }

        fn record_session(&self, events: &[SessionEvent], replay: &ReplayMeta, log: &str) -> Result<()> {
            self.inner.record_session(events, replay, log)
        }

        fn apply_rating_deltas(&self, roster: &[OnlinePlayer], category: RatingCategory) -> Result<()> {
            self.inner.apply_rating_deltas(roster, category)
        }
    }

    #[tokio::test]
    async fn test_connect_does_not_wait_for_store() {
        let inner = MemoryStore::new();
        let mut veteran = OnlinePlayer::new("Vet", "9", 0.0);
        veteran.deltas.push(150.0);
        inner.apply_rating_deltas(&[veteran], RatingCategory::Bvr).unwrap();
        let store = Arc::new(SlowStore {
            inner,
            delay: std::time::Duration::from_millis(300),
        });
        let engine = TelemetryEngine::new(store, RatingTable::default(), RatingCategory::Bvr);
        let (outbound, mut rx) = Outbound::channel();

        let started = std::time::Instant::now();
        assert!(engine.process(&chat("9", "Vet has connected."), &outbound));
        engine.process(&chat("9", "Vet killed F-16 (Bot) with AIM-9."), &outbound);
        assert!(started.elapsed() < std::time::Duration::from_millis(200));

        // on the roster at once, with the default until the lookup lands
        assert_approx_eq!(engine.roster()[0].rating_at_start, 2000.0);
        assert_approx_eq!(engine.roster()[0].deltas[0], 4.0);
        assert_eq!(rx.try_recv().unwrap(), "sendlog Vet +4.0 | Bot -4.0");

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(3);
        while engine.roster()[0].rating_at_start < 2100.0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_approx_eq!(engine.roster()[0].rating_at_start, 2150.0);
        assert_approx_eq!(engine.roster()[0].deltas[0], 4.0);
    }
}
