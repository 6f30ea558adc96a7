//! Registry of outstanding reply expectations.
//!
//! Every request that expects tagged replies registers a [`Waiter`] before the
//! command leaves the process. The router delivers matching messages into the
//! waiter's FIFO buffer and wakes it; the caller drains the buffer through its
//! [`WaiterHandle`]. A waiter stays visible to the router from registration until
//! it is consumed, cancelled (handle dropped), swept after its deadline, or
//! released because the connection went away.

use crate::error::{DirectorError, Result};
use log::{debug, info};
use shared::InboundMessage;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub type WaiterId = u64;

#[derive(Debug, Default)]
struct Mailbox {
    messages: VecDeque<InboundMessage>,
    released: bool,
}

/// One pending expectation of one or more tagged replies.
#[derive(Debug)]
pub struct Waiter {
    id: WaiterId,
    tags: HashSet<String>,
    deadline: Instant,
    consume: bool,
    mailbox: Mutex<Mailbox>,
    signal: Notify,
}

impl Waiter {
    fn new(id: WaiterId, tags: &[&str], deadline: Instant, consume: bool) -> Self {
        Self {
            id,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            deadline,
            consume,
            mailbox: Mutex::new(Mailbox::default()),
            signal: Notify::new(),
        }
    }

    pub fn id(&self) -> WaiterId {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn accepts(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    fn sorted_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.tags.iter().cloned().collect();
        tags.sort();
        tags
    }

    fn mailbox(&self) -> MutexGuard<'_, Mailbox> {
        self.mailbox.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, message: InboundMessage) {
        self.mailbox().messages.push_back(message);
    }

    fn release(&self) {
        self.mailbox().released = true;
        self.signal.notify_one();
    }

    fn take(&self) -> (Vec<InboundMessage>, bool) {
        let mut mailbox = self.mailbox();
        let messages = mailbox.messages.drain(..).collect();
        (messages, mailbox.released)
    }
}

#[derive(Debug)]
struct RegistryInner {
    waiters: HashMap<WaiterId, Arc<Waiter>>,
    next_id: WaiterId,
    online: bool,
}

/// Shared, clonable registry. All sections under its lock are short; waking a
/// waiter always happens after the lock is released.
#[derive(Debug, Clone)]
pub struct WaiterRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl Default for WaiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WaiterRegistry {
    /// Registries start offline; the network client flips them online once
    /// the socket is up.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                waiters: HashMap::new(),
                next_id: 1,
                online: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_online(&self) {
        self.lock().online = true;
    }

    pub fn is_online(&self) -> bool {
        self.lock().online
    }

    pub fn register(&self, tags: &[&str], timeout: Duration, consume: bool) -> WaiterHandle {
        self.register_then(tags, timeout, consume, || {})
    }

    /// Registers a waiter and runs `then` inside the same critical section, so
    /// anything `then` transmits cannot be answered before the waiter exists.
    pub fn register_then<F: FnOnce()>(
        &self,
        tags: &[&str],
        timeout: Duration,
        consume: bool,
        then: F,
    ) -> WaiterHandle {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let waiter = Arc::new(Waiter::new(id, tags, Instant::now() + timeout, consume));
        if inner.online {
            inner.waiters.insert(id, Arc::clone(&waiter));
        } else {
            waiter.release();
        }
        then();
        drop(inner);

        WaiterHandle {
            waiter,
            registry: self.clone(),
        }
    }

    /// Delivers a tagged message to every waiter accepting its tag. Returns the
    /// number of waiters that received it.
    pub fn deliver(&self, message: &InboundMessage) -> usize {
        let Some(tag) = message.tag() else {
            return 0;
        };

        let mut matched = Vec::new();
        let mut consumed = Vec::new();
        {
            let inner = self.lock();
            for waiter in inner.waiters.values() {
                if waiter.accepts(tag) {
                    waiter.push(message.clone());
                    if waiter.consume {
                        consumed.push(waiter.id);
                    }
                    matched.push(Arc::clone(waiter));
                }
            }
        }

        if !consumed.is_empty() {
            let mut inner = self.lock();
            for id in &consumed {
                inner.waiters.remove(id);
            }
        }

        for waiter in &matched {
            waiter.signal.notify_one();
        }
        matched.len()
    }

    pub fn remove(&self, id: WaiterId) -> bool {
        self.lock().waiters.remove(&id).is_some()
    }

    pub fn contains(&self, id: WaiterId) -> bool {
        self.lock().waiters.contains_key(&id)
    }

    /// Drops every waiter whose deadline has passed.
    pub fn sweep_expired(&self, now: Instant) -> Vec<WaiterId> {
        let mut inner = self.lock();
        let expired: Vec<WaiterId> = inner
            .waiters
            .values()
            .filter(|w| w.is_expired(now))
            .map(|w| w.id)
            .collect();

        for id in &expired {
            if let Some(waiter) = inner.waiters.remove(id) {
                info!("Swept expired waiter {} for {:?}", id, waiter.sorted_tags());
            }
        }
        expired
    }

    /// Marks the registry offline and wakes every registered waiter with an
    /// empty result, which they report as a disconnection.
    pub fn release_all(&self) -> usize {
        let drained: Vec<Arc<Waiter>> = {
            let mut inner = self.lock();
            inner.online = false;
            inner.waiters.drain().map(|(_, w)| w).collect()
        };

        for waiter in &drained {
            waiter.release();
        }
        if !drained.is_empty() {
            debug!("Released {} outstanding waiters", drained.len());
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().waiters.is_empty()
    }
}

/// Caller-side handle of a registered waiter. Dropping it cancels the waiter.
#[derive(Debug)]
pub struct WaiterHandle {
    waiter: Arc<Waiter>,
    registry: WaiterRegistry,
}

impl WaiterHandle {
    pub fn id(&self) -> WaiterId {
        self.waiter.id
    }

    pub fn tags(&self) -> Vec<String> {
        self.waiter.sorted_tags()
    }

    pub fn deadline(&self) -> Instant {
        self.waiter.deadline
    }

    /// Suspends until messages are delivered, the deadline passes, or the
    /// connection is released. Buffered messages come back in arrival order.
    pub async fn wait(self) -> Result<Vec<InboundMessage>> {
        loop {
            let (messages, released) = self.waiter.take();
            if !messages.is_empty() {
                return Ok(messages);
            }
            if released {
                return Err(DirectorError::Disconnected);
            }

            tokio::select! {
                _ = self.waiter.signal.notified() => {}
                _ = tokio::time::sleep_until(self.waiter.deadline) => {
                    self.registry.remove(self.waiter.id);
                    let (messages, released) = self.waiter.take();
                    if !messages.is_empty() {
                        return Ok(messages);
                    }
                    if released {
                        return Err(DirectorError::Disconnected);
                    }
                    return Err(DirectorError::Timeout {
                        tags: self.tags(),
                        attempts: 1,
                    });
                }
            }
        }
    }
}

impl Drop for WaiterHandle {
    fn drop(&mut self) {
        self.registry.remove(self.waiter.id);
    }
}
