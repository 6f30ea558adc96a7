//! Match rotation.
//!
//! The driver walks the configured map states. Entering a state is a short
//! exchange of commands and acknowledgements; the lobby and match that follow
//! are timer-driven. Timers never do the work themselves. They push a `Phase`
//! onto the driver's channel and the driver reacts, so every transition can be
//! exercised by sending phases directly.

use crate::archive::ReplayArchiver;
use crate::config::{DirectorConfig, MapState};
use crate::error::{DirectorError, Result};
use crate::flightlog;
use crate::network::Client;
use crate::store::{PlayerStore, ReplayMeta};
use crate::telemetry::TelemetryEngine;
use crate::timer::TimerManager;
use chrono::{Local, Utc};
use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::Command;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

pub const LOBBY_TIMER: &str = "lobby";
pub const MATCH_TIMER: &str = "match";
pub const MATCH_STOPWATCH: &str = "match";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Full host configuration.
    First,
    /// Mission swap on an already configured host.
    Revisit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationMode {
    #[default]
    Sequential,
    Random,
}

/// Position in the rotation plus how many states have been entered so far.
/// Only the very first entry of the process configures the host; every later
/// one, whichever map it lands on, swaps the mission on the running lobby.
#[derive(Debug, Clone)]
pub struct RotationCursor {
    index: usize,
    len: usize,
    entries: u64,
    mode: RotationMode,
}

impl RotationCursor {
    pub fn new(len: usize, start: usize, mode: RotationMode) -> Result<Self> {
        if start >= len {
            return Err(DirectorError::Config(format!(
                "start index {} is out of range (0..{})",
                start, len
            )));
        }
        Ok(Self {
            index: start,
            len,
            entries: 0,
            mode,
        })
    }

    pub fn current(&self) -> usize {
        self.index
    }

    pub fn mode(&self) -> RotationMode {
        self.mode
    }

    /// States entered since the director started, across all maps.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Counts an entry into the current state.
    pub fn enter(&mut self) -> Visit {
        self.entries += 1;
        if self.entries == 1 {
            Visit::First
        } else {
            Visit::Revisit
        }
    }

    pub fn advance<R: Rng>(&mut self, rng: &mut R) -> usize {
        self.index = match self.mode {
            RotationMode::Sequential => (self.index + 1) % self.len,
            RotationMode::Random => rng.gen_range(0..self.len),
        };
        self.index
    }
}

/// Timer-fired continuation. `step` ties it to one run of one state so a late
/// phase from an earlier step is recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    LobbyElapsed { step: u64, state: usize },
    MatchElapsed { step: u64, state: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateReport {
    pub step: u64,
    pub index: usize,
    pub map_id: String,
    pub mission: String,
    pub visit: Visit,
    pub players: usize,
    pub events: usize,
    pub flight_log_lines: usize,
    pub bundle: Option<PathBuf>,
    pub match_time: Option<Duration>,
}

/// External collaborators the driver hands finished states to.
#[derive(Clone)]
pub struct Collaborators {
    pub telemetry: Arc<TelemetryEngine>,
    pub store: Arc<dyn PlayerStore>,
    pub archiver: Arc<dyn ReplayArchiver>,
}

pub struct RotationDriver {
    client: Arc<Client>,
    config: DirectorConfig,
    collaborators: Collaborators,
    timers: TimerManager,
    cursor: RotationCursor,
    rng: StdRng,
    step: u64,
    active: Option<(usize, Visit)>,
    phase_tx: mpsc::UnboundedSender<Phase>,
    phase_rx: mpsc::UnboundedReceiver<Phase>,
}

impl RotationDriver {
    pub fn new(
        client: Arc<Client>,
        config: DirectorConfig,
        collaborators: Collaborators,
        start_index: usize,
        mode: RotationMode,
    ) -> Result<Self> {
        config.validate()?;
        let cursor = RotationCursor::new(config.maps.len(), start_index, mode)?;
        let (phase_tx, phase_rx) = mpsc::unbounded_channel();

        Ok(Self {
            client,
            config,
            collaborators,
            timers: TimerManager::new(),
            cursor,
            rng: StdRng::from_entropy(),
            step: 0,
            active: None,
            phase_tx,
            phase_rx,
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn cursor(&self) -> &RotationCursor {
        &self.cursor
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// Sender for injecting phases, mostly useful in tests.
    pub fn phases(&self) -> mpsc::UnboundedSender<Phase> {
        self.phase_tx.clone()
    }

    /// Runs states until an error aborts the rotation. Never returns `Ok`.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            self.run_step().await?;
        }
    }

    pub async fn run_steps(&mut self, steps: usize) -> Result<Vec<StateReport>> {
        let mut reports = Vec::with_capacity(steps);
        for _ in 0..steps {
            reports.push(self.run_step().await?);
        }
        Ok(reports)
    }

    /// Enters the current state, lets the lobby and match play out, closes the
    /// state and moves the cursor on.
    pub async fn run_step(&mut self) -> Result<StateReport> {
        let index = self.cursor.current();
        let map = self.config.maps[index].clone();
        self.step += 1;
        let visit = self.cursor.enter();
        info!(
            "State {} => {} ({:?}, entry {})",
            index,
            map.display_name(),
            visit,
            self.cursor.entries()
        );

        self.collaborators.telemetry.begin_state(map.category);
        self.active = Some((index, visit));

        let result = self.play_state(index, &map, visit).await;
        self.active = None;
        self.timers.stop_timer(LOBBY_TIMER);
        self.timers.stop_timer(MATCH_TIMER);
        self.timers.stop_stopwatch(MATCH_STOPWATCH);
        let report = result?;

        let review = self.config.timing.review();
        if !review.is_zero() {
            info!("Review time: {:?}", review);
            sleep(review).await;
        }

        let next = self.cursor.advance(&mut self.rng);
        info!("Next state: {}", next);
        Ok(report)
    }

    async fn play_state(&mut self, index: usize, map: &MapState, visit: Visit) -> Result<StateReport> {
        self.enter_state(map, visit).await?;
        self.schedule_lobby(index, map);

        loop {
            let phase = tokio::select! {
                phase = self.phase_rx.recv() => phase.ok_or(DirectorError::Disconnected)?,
                _ = self.client.closed() => {
                    error!("Connection lost while {} was running", map.display_name());
                    return Err(DirectorError::Disconnected);
                }
            };
            if let Some(report) = self.handle_phase(phase).await? {
                return Ok(report);
            }
        }
    }

    /// Pushes host settings on a first visit, or swaps the mission on a
    /// revisit, and waits until the server reports the lobby is up.
    pub async fn enter_state(&self, map: &MapState, visit: Visit) -> Result<()> {
        let timing = &self.config.timing;
        let tags = &self.config.tags;

        match visit {
            Visit::First => {
                let host = &self.config.host;
                self.send_paced(Command::SetHostName(host.name.clone())).await;
                let password = if host.public {
                    None
                } else {
                    Some(host.password.clone())
                };
                self.send_paced(Command::SetHostPassword(password)).await;
                self.send_paced(Command::SetHostUnitIcon(host.unit_icon)).await;
                self.send_paced(Command::SetHostCampaign(map.campaign_id.clone())).await;
                self.send_paced(Command::SetHostMission(map.mission.clone())).await;

                let reply = self
                    .client
                    .send_and_wait(
                        &Command::CheckHost,
                        &[tags.host_config.as_str()],
                        timing.request_timeout(),
                        timing.retries,
                    )
                    .await?;
                info!("Host configuration: {}", reply.msg);

                self.client.send(&Command::Config);
                sleep(timing.settle()).await;
                self.client
                    .send_and_wait(
                        &Command::Host,
                        &[tags.lobby_ready.as_str()],
                        timing.request_timeout(),
                        timing.retries,
                    )
                    .await?;
            }
            Visit::Revisit => {
                self.send_paced(Command::SetHostCampaign(map.campaign_id.clone())).await;
                self.send_paced(Command::SetHostMission(map.mission.clone())).await;
                sleep(timing.settle()).await;
                self.client
                    .send_and_wait(
                        &Command::Restart,
                        &[tags.lobby_ready.as_str()],
                        timing.request_timeout(),
                        timing.retries,
                    )
                    .await?;
            }
        }

        info!("Lobby ready for {}", map.display_name());
        Ok(())
    }

    async fn send_paced(&self, command: Command) {
        self.client.send(&command);
        sleep(self.config.timing.command_gap()).await;
    }

    fn schedule_lobby(&self, index: usize, map: &MapState) {
        let lobby = map.lobby_duration(&self.config.timing);
        let tx = self.phase_tx.clone();
        let step = self.step;
        info!("Lobby open for {:?}", lobby);
        self.timers.start_timer(
            LOBBY_TIMER,
            lobby,
            move || {
                let _ = tx.send(Phase::LobbyElapsed { step, state: index });
            },
            true,
        );
    }

    fn schedule_match(&self, index: usize, map: &MapState) {
        let duration = map.match_duration(&self.config.timing);
        let tx = self.phase_tx.clone();
        let step = self.step;
        self.timers.start_timer(
            MATCH_TIMER,
            duration,
            move || {
                let _ = tx.send(Phase::MatchElapsed { step, state: index });
            },
            true,
        );
    }

    /// Reacts to one phase. Returns the report once the state has ended.
    pub async fn handle_phase(&mut self, phase: Phase) -> Result<Option<StateReport>> {
        let (step, state) = match phase {
            Phase::LobbyElapsed { step, state } | Phase::MatchElapsed { step, state } => {
                (step, state)
            }
        };
        let visit = match self.active {
            Some((index, visit)) if index == state && step == self.step => visit,
            _ => {
                warn!("Ignoring stale {:?}", phase);
                return Ok(None);
            }
        };
        let map = self.config.maps[state].clone();

        match phase {
            Phase::LobbyElapsed { .. } => {
                info!("Starting match on {}", map.display_name());
                self.client.send(&Command::Start);
                self.timers.start_stopwatch(MATCH_STOPWATCH);
                self.schedule_match(state, &map);
                Ok(None)
            }
            Phase::MatchElapsed { .. } => {
                let match_time = self.timers.stop_stopwatch(MATCH_STOPWATCH);
                if let Some(elapsed) = match_time {
                    info!("Match on {} ran for {:?}", map.display_name(), elapsed);
                }
                let mut report = self.end_state(state, &map, visit).await?;
                report.match_time = match_time;
                Ok(Some(report))
            }
        }
    }

    /// Closes the running state: skip, collect the flight log, archive,
    /// flush the session to the store.
    pub async fn end_state(&self, index: usize, map: &MapState, visit: Visit) -> Result<StateReport> {
        let timing = &self.config.timing;
        let tags = &self.config.tags;

        match self
            .client
            .send_and_wait(&Command::Skip, &[tags.save_complete.as_str()], timing.request_timeout(), 0)
            .await
        {
            Ok(_) => info!("Server saved the replay"),
            Err(DirectorError::Disconnected) => return Err(DirectorError::Disconnected),
            Err(e) => warn!("No save confirmation, continuing: {}", e),
        }

        let log = flightlog::fetch(&self.client, &tags.flight_log, timing.request_timeout()).await?;
        let rendered = log.render();

        let bundle = {
            let archiver = Arc::clone(&self.collaborators.archiver);
            let mission = map.mission.clone();
            let contents = rendered.clone();
            let at = Local::now();
            match tokio::task::spawn_blocking(move || archiver.archive(&mission, &contents, at)).await {
                Ok(Ok(path)) => Some(path),
                Ok(Err(e)) => {
                    error!("Archival failed: {}", e);
                    None
                }
                Err(e) => {
                    error!("Archival task failed: {}", e);
                    None
                }
            }
        };

        let snapshot = self.collaborators.telemetry.take_snapshot();
        let replay = ReplayMeta {
            map_id: map.id.clone(),
            mission: map.mission.clone(),
            category: snapshot.category,
            bundle: bundle.clone(),
            recorded_at: Utc::now(),
        };

        let snapshot = {
            let store = Arc::clone(&self.collaborators.store);
            let mission = map.mission.clone();
            let flush = tokio::task::spawn_blocking(move || {
                if let Err(e) = store.record_session(&snapshot.events, &replay, &rendered) {
                    error!("Failed to record session for {}: {}", mission, e);
                }
                if let Err(e) = store.apply_rating_deltas(&snapshot.roster, snapshot.category) {
                    error!("Failed to apply rating changes for {}: {}", mission, e);
                }
                snapshot
            });
            flush
                .await
                .map_err(|e| DirectorError::Store(format!("store task failed: {}", e)))?
        };

        info!(
            "State {} closed: {} player(s), {} event(s)",
            map.display_name(),
            snapshot.roster.len(),
            snapshot.events.len()
        );

        Ok(StateReport {
            step: self.step,
            index,
            map_id: map.id.clone(),
            mission: map.mission.clone(),
            visit,
            players: snapshot.roster.len(),
            events: snapshot.events.len(),
            flight_log_lines: log.lines.len(),
            bundle,
            match_time: None,
        })
    }

    /// Cancels every timer. The connection is left to its owner.
    pub fn shutdown(&self) {
        self.timers.stop_all();
    }
}

/// `index => mission` lines for the startup listing.
pub fn describe(config: &DirectorConfig) -> Vec<String> {
    config
        .maps
        .iter()
        .enumerate()
        .map(|(index, map)| format!("{} => {}", index, map.display_name()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::FsArchiver;
    use crate::network::ClientOptions;
    use crate::store::MemoryStore;
    use server::{Behaviour, MockHost};
    use shared::{RatingCategory, RatingTable};

    #[test]
    fn test_only_first_entry_configures_host() {
        let mut cursor = RotationCursor::new(3, 1, RotationMode::Sequential).unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        assert_eq!(cursor.enter(), Visit::First);
        assert_eq!(cursor.advance(&mut rng), 2);
        // a map never seen before still reuses the running lobby
        assert_eq!(cursor.enter(), Visit::Revisit);
        assert_eq!(cursor.advance(&mut rng), 0);
        assert_eq!(cursor.enter(), Visit::Revisit);
        assert_eq!(cursor.advance(&mut rng), 1);
        assert_eq!(cursor.enter(), Visit::Revisit);
        assert_eq!(cursor.entries(), 4);
    }

    #[test]
    fn test_cursor_rejects_bad_start() {
        assert!(RotationCursor::new(6, 6, RotationMode::Sequential).is_err());
        assert!(RotationCursor::new(0, 0, RotationMode::Random).is_err());
    }

    #[test]
    fn test_random_mode_stays_in_range() {
        let mut cursor = RotationCursor::new(4, 0, RotationMode::Random).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            assert!(cursor.advance(&mut rng) < 4);
        }
    }

    #[test]
    fn test_describe() {
        let lines = describe(&DirectorConfig::default());
        assert_eq!(lines[0], "0 => BVR Ethi5");
        assert_eq!(lines[5], "5 => BVR afMtnsHills");
    }

    fn quick_config(dir: &std::path::Path) -> DirectorConfig {
        let mut config = DirectorConfig::default();
        config.timing.lobby_secs = 0.05;
        config.timing.match_secs = 0.1;
        config.timing.review_secs = 0.0;
        config.timing.settle_secs = 0.0;
        config.timing.command_gap_secs = 0.0;
        config.timing.request_timeout_secs = 2.0;
        config.maps.truncate(2);
        config.paths.autosave_dir = dir.join("autosave");
        config.paths.replay_dir = dir.join("replays");
        config
    }

    async fn driver(host: &MockHost, config: DirectorConfig) -> (RotationDriver, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let telemetry = Arc::new(TelemetryEngine::new(
            store.clone(),
            RatingTable::default(),
            RatingCategory::Bvr,
        ));
        let client = Client::connect(&host.local_addr().to_string(), ClientOptions::default())
            .await
            .unwrap();
        let archiver = FsArchiver::new(&config.paths.autosave_dir, &config.paths.replay_dir);
        let collaborators = Collaborators {
            telemetry,
            store: store.clone(),
            archiver: Arc::new(archiver),
        };
        let driver =
            RotationDriver::new(Arc::new(client), config, collaborators, 0, RotationMode::Sequential)
                .unwrap();
        (driver, store)
    }

    #[tokio::test]
    async fn test_step_runs_full_state() {
        let dir = tempfile::tempdir().unwrap();
        let host = MockHost::bind("127.0.0.1:0", Behaviour::default()).await.unwrap();
        let (mut driver, store) = driver(&host, quick_config(dir.path())).await;

        let report = driver.run_step().await.unwrap();
        assert_eq!(report.index, 0);
        assert_eq!(report.visit, Visit::First);
        assert!(report.match_time.is_some());
        assert!(report.bundle.is_some());
        assert_eq!(driver.cursor().current(), 1);
        assert!(driver.timers().list().is_empty());

        for command in ["checkhost", "config", "host", "start", "skip", "flightlog"] {
            assert_eq!(host.count_received(command), 1, "{}", command);
        }
        assert_eq!(store.session_count(), 1);
    }

    #[tokio::test]
    async fn test_later_maps_restart_the_running_lobby() {
        let dir = tempfile::tempdir().unwrap();
        let host = MockHost::bind("127.0.0.1:0", Behaviour::default()).await.unwrap();
        let (mut driver, _store) = driver(&host, quick_config(dir.path())).await;

        let reports = driver.run_steps(2).await.unwrap();
        assert_eq!(reports[0].visit, Visit::First);
        assert_eq!((reports[1].index, reports[1].visit), (1, Visit::Revisit));

        assert_eq!(host.count_received("checkhost"), 1);
        assert_eq!(host.count_received("config"), 1);
        assert_eq!(host.count_received("host"), 1);
        assert_eq!(host.count_received("restart"), 1);
    }

    #[tokio::test]
    async fn test_disconnect_during_lobby_ends_step() {
        let dir = tempfile::tempdir().unwrap();
        let host = MockHost::bind("127.0.0.1:0", Behaviour::default()).await.unwrap();
        let mut config = quick_config(dir.path());
        config.timing.lobby_secs = 0.5;
        config.timing.match_secs = 60.0;
        let (mut driver, _store) = driver(&host, config).await;

        let step = tokio::spawn(async move {
            let result = driver.run_step().await;
            (result, driver)
        });
        assert!(host.wait_for_command("host", Duration::from_secs(2)).await);
        host.disconnect_all();

        let (result, driver) = tokio::time::timeout(Duration::from_secs(5), step)
            .await
            .expect("step should end long before the match timer")
            .unwrap();
        assert!(matches!(result, Err(DirectorError::Disconnected)));
        assert_eq!(host.count_received("start"), 0);
        assert!(driver.timers().list().is_empty());
        assert_eq!(driver.cursor().current(), 0);
    }

    #[tokio::test]
    async fn test_stale_phase_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let host = MockHost::bind("127.0.0.1:0", Behaviour::default()).await.unwrap();
        let (mut driver, _store) = driver(&host, quick_config(dir.path())).await;

        let outcome = driver
            .handle_phase(Phase::MatchElapsed { step: 99, state: 0 })
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(host.count_received("skip"), 0);
    }

    #[tokio::test]
    async fn test_lobby_timeout_aborts_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut behaviour = Behaviour::default();
        behaviour.silent.insert("host".to_string());
        let host = MockHost::bind("127.0.0.1:0", behaviour).await.unwrap();
        let mut config = quick_config(dir.path());
        config.timing.request_timeout_secs = 0.1;
        config.timing.retries = 1;
        let (mut driver, _store) = driver(&host, config).await;

        let result = driver.run_step().await;
        match result {
            Err(DirectorError::Timeout { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(host.count_received("start"), 0);
        assert_eq!(driver.cursor().current(), 0);
    }
}
