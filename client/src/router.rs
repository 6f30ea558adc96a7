//! Message routing: waiter registry first, then the auto-processor, then the
//! general inbox.

use crate::transport::Outbound;
use crate::waiter::WaiterRegistry;
use log::{debug, warn};
use shared::InboundMessage;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Handles tagged messages nobody is waiting for. Returns `false` when the
/// content was not recognised so the router can fall back to the inbox.
pub trait AutoProcessor: Send + Sync {
    fn process(&self, message: &InboundMessage, outbound: &Outbound) -> bool;
}

/// Anything that reached neither a waiter nor the auto-processor.
#[derive(Debug, Clone, PartialEq)]
pub enum InboxItem {
    Raw(String),
    Message(InboundMessage),
}

/// Bounded general inbox. Oldest items are dropped once full.
#[derive(Debug)]
pub struct Inbox {
    items: Mutex<VecDeque<InboxItem>>,
    capacity: usize,
}

impl Inbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, item: InboxItem) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        if items.len() == self.capacity {
            items.pop_front();
        }
        items.push_back(item);
    }

    pub fn pop(&self) -> Option<InboxItem> {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    pub fn drain(&self) -> Vec<InboxItem> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Expired waiters are swept every `every_messages` routed lines or every
/// `interval`, whichever comes first.
#[derive(Debug, Clone, Copy)]
pub struct SweepPolicy {
    pub every_messages: u64,
    pub interval: Duration,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            every_messages: 100,
            interval: Duration::from_secs(30),
        }
    }
}

/// Where a line ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Waiters(usize),
    Processed,
    Inbox,
}

pub struct Router {
    registry: WaiterRegistry,
    inbox: Arc<Inbox>,
    outbound: Outbound,
    auto_tags: HashSet<String>,
    processor: Option<Arc<dyn AutoProcessor>>,
    policy: SweepPolicy,
    since_sweep: u64,
    last_sweep: Instant,
}

impl Router {
    pub fn new(registry: WaiterRegistry, inbox: Arc<Inbox>, outbound: Outbound) -> Self {
        Self {
            registry,
            inbox,
            outbound,
            auto_tags: HashSet::new(),
            processor: None,
            policy: SweepPolicy::default(),
            since_sweep: 0,
            last_sweep: Instant::now(),
        }
    }

    pub fn with_processor(
        mut self,
        tags: impl IntoIterator<Item = String>,
        processor: Arc<dyn AutoProcessor>,
    ) -> Self {
        self.auto_tags = tags.into_iter().collect();
        self.processor = Some(processor);
        self
    }

    pub fn with_sweep_policy(mut self, policy: SweepPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn sweep_interval(&self) -> Duration {
        self.policy.interval
    }

    pub fn route_line(&mut self, line: &str) -> Route {
        let route = self.dispatch(line);

        self.since_sweep += 1;
        if self.since_sweep >= self.policy.every_messages {
            self.sweep();
        }
        route
    }

    fn dispatch(&mut self, line: &str) -> Route {
        let message = match InboundMessage::parse(line) {
            Ok(message) => message,
            Err(e) => {
                debug!("Unstructured line ({}): {}", e, line);
                self.inbox.push(InboxItem::Raw(line.to_string()));
                return Route::Inbox;
            }
        };

        let Some(tag) = message.tag() else {
            self.inbox.push(InboxItem::Message(message));
            return Route::Inbox;
        };

        let delivered = self.registry.deliver(&message);
        if delivered > 0 {
            return Route::Waiters(delivered);
        }

        if self.auto_tags.contains(tag) {
            if let Some(processor) = &self.processor {
                if processor.process(&message, &self.outbound) {
                    return Route::Processed;
                }
            }
        }

        self.inbox.push(InboxItem::Message(message));
        Route::Inbox
    }

    /// Time-based half of the sweep policy, driven by the reader's ticker.
    pub fn tick(&mut self) {
        if self.last_sweep.elapsed() >= self.policy.interval {
            self.sweep();
        }
    }

    pub fn sweep(&mut self) -> usize {
        self.since_sweep = 0;
        self.last_sweep = Instant::now();
        let swept = self.registry.sweep_expired(Instant::now());
        if !swept.is_empty() {
            warn!("Removed {} abandoned waiter(s)", swept.len());
        }
        swept.len()
    }
}
