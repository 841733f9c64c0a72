//! Per-instrument engine: the composition of connection, queue, scheduler,
//! status store, and collaborator seams.
//!
//! One engine per physical instrument; engines are created at instrument
//! attach and torn down at detach, with no process-wide state. All hardware
//! access funnels through the engine's connection (lease + queue), so a
//! single cooperative execution context per instrument is sufficient.

use std::sync::{Arc, OnceLock};

use crate::command::Command;
use crate::config::InstrumentConfig;
use crate::connection::{Connection, ConnectionState, PortOpener, ResetLine};
use crate::error::{EngineError, EngineResult};
use crate::frame::Frame;
use crate::instrument::Instrument;
use crate::notify::{Event, Notifier};
use crate::scheduler::{ChannelId, Scheduler};
use crate::status::{sync_plan, ChannelStatus, StatusPatch, StatusStore};
use crate::storage::{Measurement, MeasurementSink, StatusPersistence};

pub struct Engine {
    config: InstrumentConfig,
    connection: Arc<Connection>,
    scheduler: Arc<Scheduler>,
    status: Arc<StatusStore>,
    notifier: Notifier,
    sink: Arc<dyn MeasurementSink>,
    instrument: OnceLock<Arc<dyn Instrument>>,
    ticker: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    pause_guard: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        config: InstrumentConfig,
        opener: PortOpener,
        reset_line: Option<Arc<dyn ResetLine>>,
        persistence: Arc<dyn StatusPersistence>,
        sink: Arc<dyn MeasurementSink>,
        notifier: Notifier,
    ) -> Arc<Self> {
        let connection = Connection::new(
            config.id.clone(),
            opener,
            config.connection_settings(),
            reset_line,
            notifier.clone(),
        );
        Arc::new(Self {
            config,
            connection,
            scheduler: Scheduler::new(),
            status: Arc::new(StatusStore::new(persistence)),
            notifier,
            sink,
            instrument: OnceLock::new(),
            ticker: parking_lot::Mutex::new(None),
            pause_guard: parking_lot::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn status(&self) -> &Arc<StatusStore> {
        &self.status
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    fn instrument(&self) -> EngineResult<Arc<dyn Instrument>> {
        self.instrument
            .get()
            .cloned()
            .ok_or_else(|| EngineError::Config("no instrument attached".into()))
    }

    /// An ack command carrying this instrument's configured timeout/settle.
    pub fn ack(&self, text: impl Into<String>) -> Command {
        Command::ack(text)
            .with_timeout(self.config.command_timeout())
            .with_settle(self.config.settle())
    }

    /// Attach the instrument strategy, open the connection, run its
    /// configure sequence, normalize channel records, and start the
    /// scheduler tick.
    pub async fn attach(self: &Arc<Self>, instrument: Arc<dyn Instrument>) -> EngineResult<()> {
        self.instrument
            .set(instrument)
            .map_err(|_| EngineError::Config("instrument already attached".into()))?;

        // Re-run the full configure + normalization pass after every reset.
        let weak = Arc::downgrade(self);
        self.connection.set_configure(Arc::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(engine) => engine.run_configure().await,
                    None => Err(EngineError::QueueCleared),
                }
            })
        }));

        self.status.load().await?;
        self.connection.open().await?;
        self.run_configure().await?;

        *self.ticker.lock() = Some(self.scheduler.run());
        *self.pause_guard.lock() = Some(self.spawn_pause_guard());
        tracing::info!(instrument = %self.config.id, "engine attached");
        Ok(())
    }

    /// Hold the scheduler while the connection is anything but open, so
    /// timers never race a torn-down transport during reset/reconnect.
    fn spawn_pause_guard(&self) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(&self.scheduler);
        let mut state = self.connection.watch_state();
        tokio::spawn(async move {
            loop {
                let open = *state.borrow_and_update() == ConnectionState::Open;
                scheduler.set_paused(!open);
                if state.changed().await.is_err() {
                    return;
                }
            }
        })
    }

    /// Stop the scheduler and close the connection. In-flight work settles
    /// on its own.
    pub async fn detach(&self) {
        self.scheduler.shutdown();
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.pause_guard.lock().take() {
            handle.abort();
        }
        self.connection.close().await;
        tracing::info!(instrument = %self.config.id, "engine detached");
    }

    async fn run_configure(self: &Arc<Self>) -> EngineResult<()> {
        let instrument = self.instrument()?;
        instrument
            .configure(self)
            .await
            .map_err(|e| EngineError::Instrument(e.to_string()))?;
        self.normalize().await
    }

    /// Create missing channel records from the configured template and
    /// force-synchronize every declared channel to hardware.
    pub async fn normalize(self: &Arc<Self>) -> EngineResult<()> {
        let mut created_any = false;
        for &channel in &self.config.channels {
            if self.status.ensure(channel, &self.config.channel_defaults) {
                tracing::debug!(instrument = %self.config.id, channel, "created default status record");
                created_any = true;
            }
        }
        if created_any {
            self.status.persist().await?;
        }
        for &channel in &self.config.channels {
            self.synchronize(channel, None, true, true).await?;
        }
        Ok(())
    }

    /// Validate and merge a partial update into a channel's record, persist
    /// it, and synchronize the changed fields to hardware.
    pub async fn save_status(self: &Arc<Self>, channel: ChannelId, patch: StatusPatch) -> EngineResult<()> {
        if !self.config.channels.contains(&channel) {
            return Err(EngineError::Config(format!(
                "instrument '{}' has no channel {}",
                self.config.id, channel
            )));
        }
        self.status.ensure(channel, &self.config.channel_defaults);
        let (_, prev) = self.status.save(channel, &patch).await?;
        self.synchronize(channel, Some(&prev), false, false).await
    }

    /// Bring a channel's hardware registers in line with its record.
    ///
    /// Sends only commands whose selected value differs from `prev` (all of
    /// them under `force`), bracketed by the instrument's global pause and
    /// resume commands, as one lease-held sequence. An unchanged record
    /// sends nothing. Afterwards the instrument's status hook re-arms its
    /// timers.
    pub async fn synchronize(
        self: &Arc<Self>,
        channel: ChannelId,
        prev: Option<&ChannelStatus>,
        force: bool,
        suppress_autostart: bool,
    ) -> EngineResult<()> {
        let instrument = self.instrument()?;
        let current = self.status.get(channel).ok_or_else(|| {
            EngineError::Config(format!("no status record for channel {}", channel))
        })?;

        let plan = sync_plan(instrument.sync_table(), &current, prev, force);
        if !plan.is_empty() {
            tracing::debug!(
                instrument = %self.config.id,
                channel,
                commands = plan.len(),
                "synchronizing channel registers"
            );
            let timeout = self.config.command_timeout();
            let settle = self.config.settle();
            let pause = instrument.pause_command().with_timeout(timeout).with_settle(settle);
            let resume = instrument.resume_command().with_timeout(timeout).with_settle(settle);
            self.connection
                .grouped(move |leased| {
                    Box::pin(async move {
                        leased.request(pause).await?;
                        for (command, value) in plan {
                            let text = format!("{}:CH{} {}", command, channel, value);
                            leased
                                .request(
                                    Command::ack(text)
                                        .with_timeout(timeout)
                                        .with_settle(settle),
                                )
                                .await?;
                        }
                        leased.request(resume).await?;
                        Ok::<(), EngineError>(())
                    })
                })
                .await?;
        }

        instrument
            .on_status_applied(self, channel, &current, prev, suppress_autostart)
            .await
            .map_err(|e| EngineError::Instrument(e.to_string()))
    }

    /// Enqueue a command on the connection's FIFO queue.
    pub async fn execute(&self, command: Command, prepend: bool) -> EngineResult<Frame> {
        self.connection.execute(command, prepend).await
    }

    /// Fire-and-forget measurement write: sink failures are alerted, never
    /// propagated.
    pub async fn record(&self, measurement: Measurement) {
        if let Err(e) = self.sink.write(measurement).await {
            tracing::warn!(instrument = %self.config.id, error = %e, "measurement write failed");
            self.notifier.emit(Event::alert(
                &self.config.id,
                format!("failed to store measurement: {}", e),
            ));
        }
    }
}
