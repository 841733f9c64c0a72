//! Timer-driven scheduler for repeating per-channel acquisitions.
//!
//! Each engine owns one scheduler; timers are keyed by
//! `(channel, TimerKind)` so there is at most one active entry per key.
//! A 1-second tick fires due entries through spawned tasks, with two guards:
//! a per-entry `processing` flag (a still-running callback is skipped, never
//! double-fired) and a global pause flag (nothing fires while the instrument
//! is paused). Cancellation is soft: removing an entry stops future firings
//! but does not interrupt a callback already in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;

/// Channel identifier on an instrument.
pub type ChannelId = u8;

/// The repeating jobs an instrument schedules per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    IvSweep,
    Voc,
    Jsc,
    Track,
}

impl TimerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerKind::IvSweep => "iv_sweep",
            TimerKind::Voc => "voc",
            TimerKind::Jsc => "jsc",
            TimerKind::Track => "track",
        }
    }
}

/// Timer identity: one entry per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub channel: Option<ChannelId>,
    pub kind: TimerKind,
}

impl TimerKey {
    pub fn channel(channel: ChannelId, kind: TimerKind) -> Self {
        Self {
            channel: Some(channel),
            kind,
        }
    }
}

/// Repeating task body. Fallible work wraps itself; the scheduler only cares
/// that the future finishes.
pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Optional fire-time gate; a false return skips this tick without touching
/// the timer.
pub type PreconditionFn = Arc<dyn Fn() -> bool + Send + Sync>;

struct TimerEntry {
    interval: Duration,
    last_fired: tokio::time::Instant,
    active: bool,
    processing: Arc<AtomicBool>,
    task: TaskFn,
    precondition: Option<PreconditionFn>,
}

/// Per-instrument timer table plus the tick dispatcher.
pub struct Scheduler {
    timers: parking_lot::Mutex<HashMap<TimerKey, TimerEntry>>,
    paused: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    /// Tick period of the dispatcher loop.
    pub const TICK: Duration = Duration::from_secs(1);

    pub fn new() -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            timers: parking_lot::Mutex::new(HashMap::new()),
            paused: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    /// Install (or replace) the timer for `key`. Replacement is idempotent
    /// and immediately authoritative: the new interval counts from now, and
    /// an in-flight invocation of the old entry completes undisturbed.
    pub fn schedule(
        &self,
        key: TimerKey,
        interval: Duration,
        precondition: Option<PreconditionFn>,
        task: TaskFn,
    ) {
        let entry = TimerEntry {
            interval,
            last_fired: tokio::time::Instant::now(),
            active: true,
            processing: Arc::new(AtomicBool::new(false)),
            task,
            precondition,
        };
        tracing::debug!(?key, interval_ms = interval.as_millis() as u64, "timer scheduled");
        self.timers.lock().insert(key, entry);
    }

    /// Soft-cancel the timer for `key`.
    pub fn cancel(&self, key: &TimerKey) {
        if self.timers.lock().remove(key).is_some() {
            tracing::debug!(?key, "timer cancelled");
        }
    }

    /// Remove every timer for the given channel.
    pub fn cancel_channel(&self, channel: ChannelId) {
        self.timers
            .lock()
            .retain(|key, _| key.channel != Some(channel));
    }

    pub fn contains(&self, key: &TimerKey) -> bool {
        self.timers.lock().contains_key(key)
    }

    /// Interval of the installed timer, for re-arm change detection.
    pub fn interval_of(&self, key: &TimerKey) -> Option<Duration> {
        self.timers.lock().get(key).map(|e| e.interval)
    }

    /// Adjust an installed timer's interval in place, keeping its task.
    /// The new interval counts from the last firing. Returns false when no
    /// timer is installed under `key`.
    pub fn set_interval(&self, key: &TimerKey, interval: Duration) -> bool {
        match self.timers.lock().get_mut(key) {
            Some(entry) => {
                tracing::debug!(?key, interval_ms = interval.as_millis() as u64, "timer retuned");
                entry.interval = interval;
                true
            }
            None => false,
        }
    }

    /// Globally pause/resume firing. Due timers simply skip paused ticks.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Fire every due timer. Normally driven by [`run`](Self::run); exposed
    /// for deterministic tests.
    pub fn tick(&self) {
        if self.is_paused() {
            return;
        }

        let now = tokio::time::Instant::now();
        let mut due: Vec<(TimerKey, Arc<AtomicBool>, TaskFn)> = Vec::new();
        {
            let mut timers = self.timers.lock();
            for (key, entry) in timers.iter_mut() {
                if !entry.active
                    || entry.processing.load(Ordering::SeqCst)
                    || now.duration_since(entry.last_fired) < entry.interval
                {
                    continue;
                }
                if let Some(check) = &entry.precondition {
                    if !check() {
                        continue;
                    }
                }
                entry.last_fired = now;
                entry.processing.store(true, Ordering::SeqCst);
                due.push((*key, Arc::clone(&entry.processing), Arc::clone(&entry.task)));
            }
        }

        for (key, processing, task) in due {
            tokio::spawn(async move {
                // Clears even if the task future panics, so the key is never
                // permanently wedged.
                let _guard = ClearOnDrop(processing);
                tracing::trace!(?key, "timer firing");
                task().await;
            });
        }
    }

    /// Run the 1-second dispatcher loop until [`shutdown`](Self::shutdown).
    pub fn run(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Self::TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => scheduler.tick(),
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Stop the dispatcher loop. In-flight callbacks complete undisturbed.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct ClearOnDrop(Arc<AtomicBool>);

impl Drop for ClearOnDrop {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
