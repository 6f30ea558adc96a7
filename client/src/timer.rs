//! Named, cancellable timers and stopwatches.
//!
//! Each timer runs on its own spawned task, so callbacks of different timers
//! may run concurrently with each other and with the receive loop. Callbacks are
//! invoked without the registry lock held and a panicking callback is logged,
//! never propagated.

use log::{debug, error};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

struct TimerEntry {
    generation: u64,
    interval: Duration,
    single_shot: bool,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct TimerState {
    timers: HashMap<String, TimerEntry>,
    stopwatches: HashMap<String, Instant>,
    next_generation: u64,
}

#[derive(Clone, Default)]
pub struct TimerManager {
    state: Arc<Mutex<TimerState>>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Schedules `callback` after `interval`, replacing any timer already
    /// registered under `name`. Repeating timers rearm after each callback
    /// unless stopped in the meantime. Must be called inside a tokio runtime.
    pub fn start_timer<F>(&self, name: &str, interval: Duration, callback: F, single_shot: bool)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let callback: TimerCallback = Arc::new(callback);
        let mut state = self.lock();

        if let Some(previous) = state.timers.remove(name) {
            debug!("Replacing timer '{}'", name);
            previous.task.abort();
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let task = tokio::spawn(run_timer(
            self.clone(),
            name.to_string(),
            generation,
            interval,
            callback,
            single_shot,
        ));

        state.timers.insert(
            name.to_string(),
            TimerEntry {
                generation,
                interval,
                single_shot,
                task,
            },
        );
    }

    pub fn stop_timer(&self, name: &str) -> bool {
        match self.lock().timers.remove(name) {
            Some(entry) => {
                entry.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.lock().timers.contains_key(name)
    }

    pub fn interval(&self, name: &str) -> Option<Duration> {
        self.lock().timers.get(name).map(|t| t.interval)
    }

    pub fn is_single_shot(&self, name: &str) -> Option<bool> {
        self.lock().timers.get(name).map(|t| t.single_shot)
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().timers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Cancels every timer and clears every stopwatch.
    pub fn stop_all(&self) {
        let mut state = self.lock();
        for (_, entry) in state.timers.drain() {
            entry.task.abort();
        }
        state.stopwatches.clear();
    }

    fn is_current(&self, name: &str, generation: u64) -> bool {
        self.lock()
            .timers
            .get(name)
            .map_or(false, |t| t.generation == generation)
    }

    fn finish(&self, name: &str, generation: u64) {
        let mut state = self.lock();
        if state.timers.get(name).map_or(false, |t| t.generation == generation) {
            state.timers.remove(name);
        }
    }

    /// Returns false if a stopwatch with this name is already running.
    pub fn start_stopwatch(&self, name: &str) -> bool {
        let mut state = self.lock();
        if state.stopwatches.contains_key(name) {
            return false;
        }
        state.stopwatches.insert(name.to_string(), Instant::now());
        true
    }

    pub fn elapsed(&self, name: &str) -> Option<Duration> {
        self.lock().stopwatches.get(name).map(|start| start.elapsed())
    }

    pub fn stop_stopwatch(&self, name: &str) -> Option<Duration> {
        let start = self.lock().stopwatches.remove(name)?;
        Some(start.elapsed())
    }

    pub fn is_stopwatch_running(&self, name: &str) -> bool {
        self.lock().stopwatches.contains_key(name)
    }
}

async fn run_timer(
    manager: TimerManager,
    name: String,
    generation: u64,
    interval: Duration,
    callback: TimerCallback,
    single_shot: bool,
) {
    loop {
        sleep(interval).await;

        if !manager.is_current(&name, generation) {
            return;
        }

        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback())) {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("Error in timer '{}': {}", name, reason);
        }

        if single_shot {
            manager.finish(&name, generation);
            return;
        }
        // stopped or replaced from inside the callback
        if !manager.is_current(&name, generation) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_shot_fires_once_and_clears() {
        let timers = TimerManager::new();
        let (count, callback) = counter();

        timers.start_timer("lobby", Duration::from_secs(60), callback, true);
        assert!(timers.is_active("lobby"));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(61)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timers.is_active("lobby"));

        sleep(Duration::from_secs(120)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_does_not_run_inline() {
        let timers = TimerManager::new();
        let (count, callback) = counter();
        timers.start_timer("now", Duration::ZERO, callback, true);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_name_replaces_previous() {
        let timers = TimerManager::new();
        let (first, first_cb) = counter();
        let (second, second_cb) = counter();

        timers.start_timer("match", Duration::from_secs(10), first_cb, true);
        sleep(Duration::from_secs(5)).await;
        timers.start_timer("match", Duration::from_secs(10), second_cb, true);
        assert_eq!(timers.list(), vec!["match".to_string()]);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_timer_rearms_until_stopped() {
        let timers = TimerManager::new();
        let (count, callback) = counter();

        timers.start_timer("tick", Duration::from_secs(1), callback, false);
        sleep(Duration::from_millis(3500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(timers.is_active("tick"));

        assert!(timers.stop_timer("tick"));
        sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!timers.stop_timer("tick"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_can_stop_its_own_timer() {
        let timers = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let (inner_count, inner_timers) = (Arc::clone(&count), timers.clone());

        timers.start_timer(
            "self-stop",
            Duration::from_secs(1),
            move || {
                if inner_count.fetch_add(1, Ordering::SeqCst) == 1 {
                    inner_timers.stop_timer("self-stop");
                }
            },
            false,
        );

        sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!timers.is_active("self-stop"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_callback_does_not_stop_others() {
        let timers = TimerManager::new();
        let (count, callback) = counter();

        timers.start_timer("bad", Duration::from_secs(1), || panic!("boom"), false);
        timers.start_timer("good", Duration::from_secs(2), callback, true);

        sleep(Duration::from_millis(3500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // the failing repeating timer keeps its schedule
        assert!(timers.is_active("bad"));
        timers.stop_all();
        assert!(timers.list().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopwatch() {
        let timers = TimerManager::new();
        assert!(timers.start_stopwatch("match"));
        assert!(!timers.start_stopwatch("match"));

        sleep(Duration::from_secs(90)).await;
        assert_eq!(timers.elapsed("match"), Some(Duration::from_secs(90)));
        assert!(timers.is_stopwatch_running("match"));

        assert_eq!(timers.stop_stopwatch("match"), Some(Duration::from_secs(90)));
        assert_eq!(timers.stop_stopwatch("match"), None);
        assert_eq!(timers.elapsed("match"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_introspection() {
        let timers = TimerManager::new();
        timers.start_timer("b", Duration::from_secs(5), || {}, true);
        timers.start_timer("a", Duration::from_secs(7), || {}, false);

        assert_eq!(timers.list(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(timers.interval("a"), Some(Duration::from_secs(7)));
        assert_eq!(timers.is_single_shot("b"), Some(true));
        assert_eq!(timers.interval("missing"), None);
        timers.stop_all();
    }
}
