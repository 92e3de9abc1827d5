//! Local timer tracking.
//!
//! A [`TimerBoard`] holds every timer running on this client (any number
//! may run at once, one per task). [`spawn_ticker`] publishes the elapsed
//! seconds of every run once a second for display; both the display and
//! the time flushed to the store are computed from the clock, so a stalled
//! ticker never loses or invents time.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use contrimeter_proto::model::TaskId;
use parking_lot::Mutex;
use tokio::sync::watch;

/// Source of the current time in milliseconds since the UNIX epoch.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds.
    fn now_ms(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis(),
        )
        .unwrap_or(u64::MAX)
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock reading `start_ms`.
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let ms = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// One timer running on this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningTimer {
    /// When the run started (ms since epoch).
    pub started_at: u64,
}

/// Elapsed seconds of every running timer, as published by the ticker.
pub type TickSnapshot = BTreeMap<TaskId, u64>;

/// Timers running on this client, keyed by task.
pub struct TimerBoard {
    timers: Mutex<HashMap<TaskId, RunningTimer>>,
    clock: Arc<dyn Clock>,
}

impl TimerBoard {
    /// Creates an empty board reading time from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            timers: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// The board's clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Starts a timer at `started_at`. Returns `false` if one was already
    /// running for the task (the existing run is kept).
    pub fn start_at(&self, task: TaskId, started_at: u64) -> bool {
        let mut timers = self.timers.lock();
        if timers.contains_key(&task) {
            return false;
        }
        timers.insert(task, RunningTimer { started_at });
        true
    }

    /// Drops a timer without reporting its time.
    pub fn discard(&self, task: TaskId) -> bool {
        self.timers.lock().remove(&task).is_some()
    }

    /// Whether a timer runs for `task`.
    #[must_use]
    pub fn is_running(&self, task: TaskId) -> bool {
        self.timers.lock().contains_key(&task)
    }

    /// The running timer for `task`.
    #[must_use]
    pub fn get(&self, task: TaskId) -> Option<RunningTimer> {
        self.timers.lock().get(&task).copied()
    }

    /// Elapsed whole seconds of the timer for `task`, from the wall clock.
    #[must_use]
    pub fn elapsed(&self, task: TaskId) -> Option<u64> {
        let started_at = self.timers.lock().get(&task)?.started_at;
        Some(self.elapsed_since(started_at))
    }

    /// Tasks with a running timer.
    #[must_use]
    pub fn running(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.timers.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Whether no timer runs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timers.lock().is_empty()
    }

    /// Elapsed seconds of every running timer.
    #[must_use]
    pub fn snapshot(&self) -> TickSnapshot {
        let now = self.clock.now_ms();
        self.timers
            .lock()
            .iter()
            .map(|(id, t)| (*id, now.saturating_sub(t.started_at) / 1000))
            .collect()
    }

    fn elapsed_since(&self, started_at: u64) -> u64 {
        self.clock.now_ms().saturating_sub(started_at) / 1000
    }
}

/// Spawns the display ticker.
///
/// Every `period`, while any timer runs (or on the tick right after the
/// last one stopped), a [`TickSnapshot`] is published.
/// The task ends when every receiver is dropped.
pub fn spawn_ticker(
    board: Arc<TimerBoard>,
    period: Duration,
) -> (watch::Receiver<TickSnapshot>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = watch::channel(board.snapshot());
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut was_running = false;
        loop {
            interval.tick().await;
            if tx.is_closed() {
                break;
            }
            let snapshot = board.snapshot();
            let running = !snapshot.is_empty();
            if running || was_running {
                let _ = tx.send(snapshot);
            }
            was_running = running;
        }
    });
    (rx, handle)
}

/// Formats seconds as `HH:MM:SS`.
#[must_use]
pub fn format_hms(seconds: u64) -> String {
    let hrs = seconds / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;
    format!("{hrs:02}:{mins:02}:{secs:02}")
}
