//! Scripted host: a TCP listener that speaks the dedicated server's
//! line-delimited JSON control protocol.

use log::{debug, info, warn};
use serde_json::{json, Value};
use shared::{
    Command, InboundMessage, BOM, TAG_CHAT, TAG_FLIGHT_LOG, TAG_HOST_CONFIG, TAG_LOBBY_READY,
    TAG_SAVE_COMPLETE,
};
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};

/// How the host reacts to commands. Keys are command keywords such as
/// `checkhost` or `flightlog`.
#[derive(Debug, Clone)]
pub struct Behaviour {
    /// Swallow the first N occurrences of a command without replying.
    pub ignore_first: HashMap<String, u32>,
    /// Never reply to these commands.
    pub silent: HashSet<String>,
    /// Hold the reply to a command back by this long.
    pub delays: HashMap<String, Duration>,
    /// Payload of the `GetFlightLog` reply.
    pub flight_log: Value,
    /// Prefix the first line written to each connection with a byte-order mark.
    pub bom: bool,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            ignore_first: HashMap::new(),
            silent: HashSet::new(),
            delays: HashMap::new(),
            flight_log: json!([
                "00:00:05 Ace spawned",
                "00:00:05 Ace spawned",
                "00:12:40 Ace killed F-16 (Rival) with AIM-9",
            ]),
            bom: false,
        }
    }
}

/// `sethost` values as last set by the director.
#[derive(Debug, Default, Clone)]
struct HostSettings {
    name: String,
    password: Option<String>,
    unit_icon: bool,
    campaign: String,
    mission: String,
}

#[derive(Default)]
struct HostState {
    received: Vec<String>,
    ignored: HashMap<String, u32>,
    settings: HostSettings,
}

struct Connection {
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<String>,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    behaviour: Behaviour,
    state: Mutex<HostState>,
    connections: Mutex<Vec<Connection>>,
    activity: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn connections(&self) -> MutexGuard<'_, Vec<Connection>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records a command and builds the reply, if one is due.
    fn handle(&self, line: &str) -> Option<(String, Duration)> {
        let command = Command::parse(line);
        let keyword = keyword(line).to_string();

        let reply = {
            let mut state = self.state();
            state.received.push(line.to_string());
            apply_setting(&mut state.settings, &command);

            if self.behaviour.silent.contains(&keyword) {
                debug!("Staying silent on '{}'", keyword);
                return None;
            }
            let limit = self.behaviour.ignore_first.get(&keyword).copied().unwrap_or(0);
            let ignored = state.ignored.entry(keyword.clone()).or_insert(0);
            if *ignored < limit {
                *ignored += 1;
                debug!("Ignoring '{}' ({}/{})", keyword, ignored, limit);
                return None;
            }

            reply_to(&command, &state.settings, &self.behaviour)?
        };

        let delay = self
            .behaviour
            .delays
            .get(&keyword)
            .copied()
            .unwrap_or(Duration::ZERO);
        Some((reply.to_line(), delay))
    }
}

fn keyword(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or("")
}

fn apply_setting(settings: &mut HostSettings, command: &Command) {
    match command {
        Command::SetHostName(name) => settings.name = name.clone(),
        Command::SetHostPassword(password) => settings.password = password.clone(),
        Command::SetHostUnitIcon(on) => settings.unit_icon = *on,
        Command::SetHostCampaign(id) => settings.campaign = id.clone(),
        Command::SetHostMission(mission) => settings.mission = mission.clone(),
        _ => {}
    }
}

fn reply_to(command: &Command, settings: &HostSettings, behaviour: &Behaviour) -> Option<InboundMessage> {
    let (tag, msg) = match command {
        Command::CheckHost => (
            TAG_HOST_CONFIG,
            json!({
                "name": settings.name,
                "password": settings.password,
                "unitIcon": settings.unit_icon,
                "campaign": settings.campaign,
                "mission": settings.mission,
            }),
        ),
        Command::Host | Command::Restart => (TAG_LOBBY_READY, json!({ "mission": settings.mission })),
        Command::Skip => (TAG_SAVE_COMPLETE, json!("saved")),
        Command::FlightLog => (TAG_FLIGHT_LOG, behaviour.flight_log.clone()),
        _ => return None,
    };
    Some(InboundMessage::tagged(tag, msg))
}

/// Builds the chat broadcast line the real host emits for player activity.
pub fn chat_line(player_id: &str, text: &str) -> String {
    InboundMessage::tagged(TAG_CHAT, json!({ "steamid": player_id, "msg": text })).to_line()
}

pub struct MockHost {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

impl MockHost {
    pub async fn bind(addr: &str, behaviour: Behaviour) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!("Mock host listening on {}", addr);

        let shared = Arc::new(Shared {
            behaviour,
            state: Mutex::new(HostState::default()),
            connections: Mutex::new(Vec::new()),
            activity: Notify::new(),
        });

        let accept_task = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => accept(&shared, stream, peer),
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
            })
        };

        Ok(Self {
            addr,
            shared,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn client_count(&self) -> usize {
        self.shared.connections().len()
    }

    pub fn received(&self) -> Vec<String> {
        self.shared.state().received.clone()
    }

    /// Number of received lines whose command keyword is `command`.
    pub fn count_received(&self, command: &str) -> usize {
        self.shared
            .state()
            .received
            .iter()
            .filter(|line| keyword(line) == command)
            .count()
    }

    pub async fn wait_for_client(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.client_count() > 0).await
    }

    pub async fn wait_for_command(&self, command: &str, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.count_received(command) > 0).await
    }

    async fn wait_until<F: Fn() -> bool>(&self, timeout: Duration, condition: F) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.activity.notified();
            if condition() {
                return true;
            }
            if timeout_at(deadline, notified).await.is_err() {
                return condition();
            }
        }
    }

    /// Writes `line` to every connected director.
    pub fn inject(&self, line: &str) {
        for connection in self.shared.connections().iter() {
            if connection.tx.send(line.to_string()).is_err() {
                debug!("Connection {} is gone", connection.addr);
            }
        }
    }

    pub fn inject_chat(&self, player_id: &str, text: &str) {
        self.inject(&chat_line(player_id, text));
    }

    /// Drops every connection. Directors see end-of-stream.
    pub fn disconnect_all(&self) {
        let connections: Vec<Connection> = self.shared.connections().drain(..).collect();
        for connection in connections {
            info!("Dropping {}", connection.addr);
            for task in connection.tasks {
                task.abort();
            }
        }
    }
}

impl Drop for MockHost {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.disconnect_all();
    }
}

fn accept(shared: &Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    info!("Director connected from {}", peer);
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    // held until the entry is pushed so the reader cannot remove it first
    let mut connections = shared.connections();

    let writer = tokio::spawn(run_writer(write_half, rx, shared.behaviour.bom));
    let reader = {
        let shared = Arc::clone(shared);
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        debug!("<- {}", line);
                        let reply = shared.handle(&line);
                        shared.activity.notify_waiters();
                        if let Some((reply, delay)) = reply {
                            send_reply(&tx, reply, delay);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Read error from {}: {}", peer, e);
                        break;
                    }
                }
            }
            info!("Director {} disconnected", peer);
            shared.connections().retain(|c| c.addr != peer);
            shared.activity.notify_waiters();
        })
    };

    connections.push(Connection {
        addr: peer,
        tx,
        tasks: vec![reader, writer],
    });
    drop(connections);
    shared.activity.notify_waiters();
}

fn send_reply(tx: &mpsc::UnboundedSender<String>, reply: String, delay: Duration) {
    if delay.is_zero() {
        let _ = tx.send(reply);
        return;
    }
    let tx = tx.clone();
    tokio::spawn(async move {
        sleep(delay).await;
        let _ = tx.send(reply);
    });
}

async fn run_writer(mut socket: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<String>, bom: bool) {
    let mut first = true;
    while let Some(line) = rx.recv().await {
        let mut data = String::with_capacity(line.len() + 4);
        if first && bom {
            data.push(BOM);
        }
        first = false;
        data.push_str(&line);
        data.push('\n');
        if let Err(e) = socket.write_all(data.as_bytes()).await {
            warn!("Write failed: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio_test::assert_ok;

    async fn connect(host: &MockHost) -> (BufReader<tokio::net::tcp::OwnedReadHalf>, OwnedWriteHalf) {
        let stream = TcpStream::connect(host.local_addr()).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        (BufReader::new(read_half), write_half)
    }

    async fn read_line(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn test_checkhost_reports_settings() {
        let host = assert_ok!(MockHost::bind("127.0.0.1:0", Behaviour::default()).await);
        let (mut reader, mut writer) = connect(&host).await;

        writer
            .write_all(b"sethost mission BVR Crack\nsethost password\ncheckhost\n")
            .await
            .unwrap();
        let reply = InboundMessage::parse(read_line(&mut reader).await.trim()).unwrap();

        assert!(reply.has_tag(TAG_HOST_CONFIG));
        assert_eq!(reply.msg["mission"], "BVR Crack");
        assert_eq!(reply.msg["password"], Value::Null);
        assert_eq!(host.count_received("sethost"), 2);
    }

    #[tokio::test]
    async fn test_ignore_first() {
        let mut behaviour = Behaviour::default();
        behaviour.ignore_first.insert("restart".into(), 1);
        let host = MockHost::bind("127.0.0.1:0", behaviour).await.unwrap();
        let (mut reader, mut writer) = connect(&host).await;

        writer.write_all(b"restart\nrestart\n").await.unwrap();
        let reply = InboundMessage::parse(read_line(&mut reader).await.trim()).unwrap();
        assert!(reply.has_tag(TAG_LOBBY_READY));
        assert!(host.wait_for_command("restart", Duration::from_secs(1)).await);
        assert_eq!(host.count_received("restart"), 2);
    }

    #[tokio::test]
    async fn test_bom_on_first_line_only() {
        let behaviour = Behaviour {
            bom: true,
            ..Behaviour::default()
        };
        let host = MockHost::bind("127.0.0.1:0", behaviour).await.unwrap();
        let (mut reader, _writer) = connect(&host).await;
        assert!(host.wait_for_client(Duration::from_secs(1)).await);

        host.inject("one");
        host.inject("two");
        assert_eq!(read_line(&mut reader).await, "\u{feff}one\n");
        assert_eq!(read_line(&mut reader).await, "two\n");
    }

    #[tokio::test]
    async fn test_disconnect_all_closes_socket() {
        let host = MockHost::bind("127.0.0.1:0", Behaviour::default()).await.unwrap();
        let (mut reader, _writer) = connect(&host).await;
        assert!(host.wait_for_client(Duration::from_secs(1)).await);

        host.disconnect_all();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), reader.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(read, 0);
        assert_eq!(host.client_count(), 0);
    }

    #[test]
    fn test_chat_line() {
        let line = chat_line("7650", "Ace has connected.");
        let message = InboundMessage::parse(&line).unwrap();
        assert!(message.has_tag(TAG_CHAT));
        assert_eq!(message.msg["steamid"], "7650");
    }
}
