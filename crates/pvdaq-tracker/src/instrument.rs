//! The tracker strategy: command vocabulary, synchronization table, and
//! timer policy.
//!
//! Everything the engine core does not know about the tracker firmware lives
//! here. The synchronization table maps channel-record fields to their
//! hardware registers; `on_status_applied` translates a freshly applied
//! record into the set of timers that should be running for that channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;

use pvdaq_core::command::Command;
use pvdaq_core::engine::Engine;
use pvdaq_core::instrument::Instrument;
use pvdaq_core::scheduler::{ChannelId, PreconditionFn, TaskFn, TimerKey, TimerKind};
use pvdaq_core::status::{flag, ChannelStatus, SyncEntry};

use crate::acquisition::{self, AcqShared, SweepTiming};

/// Ordered register map of the tracker firmware. Row order is the order the
/// commands hit the wire during synchronization.
static SYNC_TABLE: &[SyncEntry] = &[
    SyncEntry {
        command: "TRACK:EN",
        select: |s| flag(s.enable),
    },
    SyncEntry {
        command: "TRACK:MODE",
        select: |s| u8::from(s.tracking_mode).to_string(),
    },
    SyncEntry {
        command: "TRACK:INT",
        select: |s| s.tracking_interval_ms.to_string(),
    },
    SyncEntry {
        command: "TRACK:STEP",
        select: |s| format!("{:.1}", s.step_size_mv),
    },
    SyncEntry {
        command: "TRACK:DELAY",
        select: |s| s.switch_delay_ms.to_string(),
    },
    SyncEntry {
        command: "TRACK:VLIM",
        select: |s| format!("{:.3}", s.voltage_limit_v),
    },
    SyncEntry {
        command: "TRACK:ITHR",
        select: |s| format!("{:.3}", s.current_threshold_ma),
    },
    SyncEntry {
        command: "SWEEP:START",
        select: |s| format!("{:.3}", s.iv_start_v),
    },
    SyncEntry {
        command: "SWEEP:STOP",
        select: |s| format!("{:.3}", s.iv_stop_v),
    },
    SyncEntry {
        command: "SWEEP:RATE",
        select: |s| format!("{:.1}", s.iv_rate_mv_s),
    },
    SyncEntry {
        command: "SWEEP:HYST",
        select: |s| flag(s.iv_hysteresis),
    },
];

/// Tracker-controller strategy.
pub struct TrackerInstrument {
    shared: Arc<AcqShared>,
}

impl TrackerInstrument {
    pub fn new() -> Self {
        Self::with_timing(SweepTiming::default())
    }

    /// Override the sweep poll period and safety ceiling. Production uses
    /// [`SweepTiming::default`]; tests shrink both.
    pub fn with_timing(timing: SweepTiming) -> Self {
        Self {
            shared: Arc::new(AcqShared::new(timing)),
        }
    }

    /// Install, retune, or cancel one timer according to its enabling
    /// condition. A timer already running at the desired interval is left
    /// alone so its phase is not reset.
    fn rearm(
        &self,
        engine: &Arc<Engine>,
        key: TimerKey,
        desired: Option<Duration>,
        task: TaskFn,
    ) {
        let scheduler = engine.scheduler();
        match desired {
            None => scheduler.cancel(&key),
            Some(interval) => {
                if scheduler.interval_of(&key) != Some(interval) {
                    scheduler.schedule(key, interval, Some(enabled_gate(engine, key)), task);
                }
            }
        }
    }

    fn rearm_timers(&self, engine: &Arc<Engine>, channel: ChannelId, current: &ChannelStatus) {
        // IV sweep: a fixed interval is authoritative; in auto mode the
        // adaptive interval survives re-synchronization, seeded from the
        // configured minimum.
        let iv_key = TimerKey::channel(channel, TimerKind::IvSweep);
        let iv_desired = if current.enable && !current.iv_interval.is_off() {
            match current.iv_interval.fixed_ms() {
                Some(ms) => Some(Duration::from_millis(ms)),
                None => Some(
                    engine
                        .scheduler()
                        .interval_of(&iv_key)
                        .unwrap_or(Duration::from_millis(current.iv_auto_min_ms)),
                ),
            }
        } else {
            None
        };
        let shared = Arc::clone(&self.shared);
        self.rearm(
            engine,
            iv_key,
            iv_desired,
            acquisition::sweep_task(engine, shared, channel),
        );

        let voc_desired = (current.enable && current.voc_enabled && current.voc_interval_ms > 0)
            .then(|| Duration::from_millis(current.voc_interval_ms));
        self.rearm(
            engine,
            TimerKey::channel(channel, TimerKind::Voc),
            voc_desired,
            acquisition::voc_task(engine, channel),
        );

        let jsc_desired = (current.enable && current.jsc_enabled && current.jsc_interval_ms > 0)
            .then(|| Duration::from_millis(current.jsc_interval_ms));
        self.rearm(
            engine,
            TimerKey::channel(channel, TimerKind::Jsc),
            jsc_desired,
            acquisition::jsc_task(engine, channel),
        );

        let track_desired = current
            .wants_track_timer()
            .then(|| Duration::from_millis(current.tracking_record_interval_ms));
        self.rearm(
            engine,
            TimerKey::channel(channel, TimerKind::Track),
            track_desired,
            acquisition::track_task(engine, channel),
        );
    }
}

impl Default for TrackerInstrument {
    fn default() -> Self {
        Self::new()
    }
}

/// Fire-time gate shared by every tracker timer: the channel record must
/// still exist and be enabled.
fn enabled_gate(engine: &Arc<Engine>, key: TimerKey) -> PreconditionFn {
    let weak = Arc::downgrade(engine);
    Arc::new(move || {
        let Some(channel) = key.channel else {
            return false;
        };
        weak.upgrade()
            .and_then(|engine| engine.status().get(channel))
            .is_some_and(|record| record.enable)
    })
}

#[async_trait]
impl Instrument for TrackerInstrument {
    fn kind(&self) -> &'static str {
        "tracker"
    }

    fn sync_table(&self) -> &'static [SyncEntry] {
        SYNC_TABLE
    }

    fn pause_command(&self) -> Command {
        Command::ack("TRACK:PAUSE")
    }

    fn resume_command(&self) -> Command {
        Command::ack("TRACK:RUN")
    }

    /// Probe the firmware once so a dead tracker is caught at attach (and
    /// after every reset) instead of on the first scheduled acquisition.
    async fn configure(&self, engine: &Arc<Engine>) -> anyhow::Result<()> {
        let channel = *engine
            .config()
            .channels
            .first()
            .context("tracker config declares no channels")?;
        let frame = engine
            .execute(acquisition::stat_probe(engine, channel), false)
            .await
            .context("tracker did not answer the status probe")?;
        tracing::info!(
            instrument = %engine.config().id,
            status = frame.status,
            "tracker firmware responding"
        );
        Ok(())
    }

    async fn on_status_applied(
        &self,
        engine: &Arc<Engine>,
        channel: ChannelId,
        current: &ChannelStatus,
        prev: Option<&ChannelStatus>,
        suppress_autostart: bool,
    ) -> anyhow::Result<()> {
        self.rearm_timers(engine, channel, current);

        // A channel that just went disabled -> enabled gets one immediate
        // sweep so its record has a fresh curve (and MPP seed) right away.
        let was_enabled = prev.is_some_and(|p| p.enable);
        if current.enable && !was_enabled && current.iv_autostart && !suppress_autostart {
            tracing::info!(
                instrument = %engine.config().id,
                channel,
                "channel enabled, starting initial IV sweep"
            );
            let shared = Arc::clone(&self.shared);
            let weak = Arc::downgrade(engine);
            tokio::spawn(async move {
                if let Some(engine) = weak.upgrade() {
                    acquisition::run_sweep_boundary(&engine, &shared, channel).await;
                }
            });
        }
        Ok(())
    }
}
