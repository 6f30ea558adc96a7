use crate::error::{DirectorError, Result};
use crate::router::{AutoProcessor, Inbox, Router, SweepPolicy};
use crate::transport::{run_writer, LineReader, Outbound};
use crate::waiter::{WaiterHandle, WaiterRegistry};
use log::{info, warn};
use shared::{Command, InboundMessage};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};

/// Pause between `send_and_wait` attempts.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(500);

const INBOX_CAPACITY: usize = 256;

/// Router wiring supplied at connect time.
#[derive(Default)]
pub struct ClientOptions {
    pub auto_tags: Vec<String>,
    pub processor: Option<Arc<dyn AutoProcessor>>,
    pub sweep: SweepPolicy,
}

/// One live connection to the dedicated server's control socket.
pub struct Client {
    addr: String,
    outbound: Outbound,
    registry: WaiterRegistry,
    inbox: Arc<Inbox>,
    closed: Arc<watch::Sender<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    pub async fn connect(addr: &str, options: ClientOptions) -> Result<Self> {
        info!("Connecting to {}...", addr);
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let registry = WaiterRegistry::new();
        registry.set_online();
        let inbox = Arc::new(Inbox::new(INBOX_CAPACITY));
        let (outbound, outbound_rx) = Outbound::channel();
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        let mut router = Router::new(registry.clone(), Arc::clone(&inbox), outbound.clone())
            .with_sweep_policy(options.sweep);
        if let Some(processor) = options.processor {
            router = router.with_processor(options.auto_tags, processor);
        }

        let writer = tokio::spawn(run_writer(write_half, outbound_rx));
        let reader = {
            let registry = registry.clone();
            let closed = Arc::clone(&closed);
            let mut lines = LineReader::new(read_half);
            tokio::spawn(async move {
                let mut ticker = interval(router.sweep_interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        batch = lines.next_lines() => match batch {
                            Some(batch) => {
                                for line in batch {
                                    router.route_line(&line);
                                }
                            }
                            None => break,
                        },
                        _ = ticker.tick() => router.tick(),
                    }
                }

                let released = registry.release_all();
                closed.send_replace(true);
                warn!("Connection lost, released {} waiter(s)", released);
            })
        };

        info!("Connected to {}", addr);
        Ok(Client {
            addr: addr.to_string(),
            outbound,
            registry,
            inbox,
            closed,
            tasks: Mutex::new(vec![reader, writer]),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.registry.is_online()
    }

    pub fn registry(&self) -> &WaiterRegistry {
        &self.registry
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    /// Resolves once the connection is gone, either because the host closed
    /// it or because `shutdown` ran. Returns at once if that already happened.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Fire-and-forget.
    pub fn send(&self, command: &Command) {
        if !self.is_connected() {
            warn!("Not connected, dropping command: {}", command);
            return;
        }
        self.outbound.send_line(&command.to_string());
    }

    /// Registers a waiter for `tags` and transmits `command` inside the same
    /// registration, returning the handle to wait on.
    pub fn send_expecting(&self, command: &Command, tags: &[&str], timeout: Duration) -> WaiterHandle {
        let line = command.to_string();
        self.registry
            .register_then(tags, timeout, true, || self.outbound.send_line(&line))
    }

    /// Waits for messages tagged with any of `tags`.
    pub async fn wait(
        &self,
        tags: &[&str],
        timeout: Duration,
        consume: bool,
    ) -> Result<Vec<InboundMessage>> {
        self.registry.register(tags, timeout, consume).wait().await
    }

    /// Sends `command` and waits for the first reply tagged with any of `tags`,
    /// resending up to `retries` more times on timeout. Disconnection ends the
    /// call immediately.
    pub async fn send_and_wait(
        &self,
        command: &Command,
        tags: &[&str],
        timeout: Duration,
        retries: u32,
    ) -> Result<InboundMessage> {
        let attempts = retries + 1;

        for attempt in 1..=attempts {
            let handle = self.send_expecting(command, tags, timeout);
            match handle.wait().await {
                Ok(mut messages) => return Ok(messages.remove(0)),
                Err(DirectorError::Timeout { .. }) if attempt < attempts => {
                    warn!(
                        "No reply to '{}' within {:?} (attempt {}/{}), retrying",
                        command, timeout, attempt, attempts
                    );
                    sleep(RETRY_BACKOFF).await;
                }
                Err(DirectorError::Timeout { tags, .. }) => {
                    return Err(DirectorError::Timeout { tags, attempts });
                }
                Err(e) => return Err(e),
            }
        }

        Err(DirectorError::Timeout {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            attempts,
        })
    }

    /// Stops the socket tasks and wakes every outstanding waiter.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }

        self.registry.release_all();
        self.closed.send_replace(true);
        info!("Disconnected from {}", self.addr);
    }
}
