//! Connection manager: one physical serial link, its lifecycle state
//! machine, and the `write + wait-for-frame` request primitive.
//!
//! The manager owns the port exclusively. Every request path (queue drain or
//! grouped sequence) funnels through the connection [`Lease`], so at most one
//! command is on the wire at any time.
//!
//! Lifecycle: `Closed → Opening → Open → (Errored|Closed) → Reconnecting →
//! Opening → …`. Transport-level errors trigger [`Connection::reset`]
//! (optionally pulsing a hardware reset line) followed by a timed reconnect;
//! per-command timeouts only reject that command.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

use crate::command::{Command, CommandQueue, ExecFn, Lease};
use crate::error::{EngineError, EngineResult};
use crate::frame::{Frame, FrameDecoder, TERMINATOR};
use crate::notify::{Event, Notifier};
use crate::serial::{drain_port_buffer, DynPort};

/// Lifecycle states of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    Errored,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Opening => "opening",
            ConnectionState::Open => "open",
            ConnectionState::Errored => "error",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

/// Async factory producing a fresh transport. Injectable so tests run
/// against `tokio::io::duplex` pairs.
pub type PortOpener = Arc<dyn Fn() -> BoxFuture<'static, EngineResult<DynPort>> + Send + Sync>;

/// Instrument configure sequence re-run after every reset.
pub type ConfigureFn = Arc<dyn Fn() -> BoxFuture<'static, EngineResult<()>> + Send + Sync>;

/// Optional hardware reset line (digital output pin).
///
/// The reset sequence is: HIGH, settle, LOW, settle. No portable host GPIO
/// binding is assumed; platforms inject their own implementation.
#[async_trait]
pub trait ResetLine: Send + Sync {
    async fn set_high(&self) -> EngineResult<()>;
    async fn set_low(&self) -> EngineResult<()>;
}

/// Timing knobs for the lifecycle machine.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// How long the transport may take to signal open.
    pub connect_timeout: Duration,
    /// Back-off slept before and after a reconnect attempt, giving the
    /// firmware time to boot.
    pub reconnect_timeout: Duration,
    /// Bounded retry count for CRC-failed binary reads.
    pub crc_retries: u32,
    /// Settle time at each edge of the reset-line pulse.
    pub reset_pulse: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(1000),
            reconnect_timeout: Duration::from_millis(2000),
            crc_retries: 10,
            reset_pulse: Duration::from_secs(1),
        }
    }
}

/// One physical serial connection with its queue, lease, and lifecycle.
pub struct Connection {
    instrument: String,
    opener: PortOpener,
    settings: ConnectionSettings,
    notifier: Notifier,
    reset_line: Option<Arc<dyn ResetLine>>,
    lease: Lease,
    port: tokio::sync::Mutex<Option<DynPort>>,
    state_tx: watch::Sender<ConnectionState>,
    resetting: AtomicBool,
    configure: parking_lot::RwLock<Option<ConfigureFn>>,
    queue: Arc<CommandQueue>,
    weak: Weak<Connection>,
}

/// Handle passed to grouped sequences: requests issued through it run under
/// the already-held lease.
pub struct Leased<'a> {
    conn: &'a Connection,
}

impl Leased<'_> {
    pub async fn request(&self, command: Command) -> EngineResult<Frame> {
        self.conn.request_with_retry(command).await
    }
}

impl Connection {
    pub fn new(
        instrument: impl Into<String>,
        opener: PortOpener,
        settings: ConnectionSettings,
        reset_line: Option<Arc<dyn ResetLine>>,
        notifier: Notifier,
    ) -> Arc<Self> {
        let instrument = instrument.into();
        Arc::new_cyclic(|weak: &Weak<Connection>| {
            let exec_weak = weak.clone();
            let exec: ExecFn = Arc::new(move |command| {
                let exec_weak = exec_weak.clone();
                Box::pin(async move {
                    match exec_weak.upgrade() {
                        Some(conn) => conn.leased_request(command).await,
                        None => Err(EngineError::QueueCleared),
                    }
                })
            });
            let (state_tx, _) = watch::channel(ConnectionState::Closed);
            Self {
                instrument,
                opener,
                settings,
                notifier,
                reset_line,
                lease: Lease::new(),
                port: tokio::sync::Mutex::new(None),
                state_tx,
                resetting: AtomicBool::new(false),
                configure: parking_lot::RwLock::new(None),
                queue: CommandQueue::new(exec),
                weak: weak.clone(),
            }
        })
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    /// Install the configure sequence re-run after each reset.
    pub fn set_configure(&self, configure: ConfigureFn) {
        *self.configure.write() = Some(configure);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state_tx.send_replace(next) != next;
        if changed {
            tracing::info!(instrument = %self.instrument, state = next.as_str(), "connection state");
            self.notifier
                .emit(Event::state(&self.instrument, next.as_str()));
        }
    }

    /// Open the transport. Idempotent when already open.
    ///
    /// A transport that does not signal open within the connect timeout
    /// triggers [`reset`](Self::reset) in the background.
    pub async fn open(&self) -> EngineResult<()> {
        if self.is_open() {
            return Ok(());
        }
        self.set_state(ConnectionState::Opening);

        let opened = tokio::time::timeout(self.settings.connect_timeout, (self.opener)()).await;
        match opened {
            Err(_) => {
                let ms = self.settings.connect_timeout.as_millis() as u64;
                self.notifier.emit(Event::alert(
                    &self.instrument,
                    format!("connection did not open within {} ms", ms),
                ));
                self.set_state(ConnectionState::Errored);
                self.spawn_reset();
                Err(EngineError::ConnectTimeout(ms))
            }
            Ok(Err(e)) => {
                self.notifier.emit(Event::alert(
                    &self.instrument,
                    format!("failed to open connection: {}", e),
                ));
                self.set_state(ConnectionState::Errored);
                self.spawn_reset();
                Err(e)
            }
            Ok(Ok(mut port)) => {
                // Flush whatever the firmware emitted while we were away.
                let stale = drain_port_buffer(&mut port, 50).await;
                if stale > 0 {
                    tracing::debug!(instrument = %self.instrument, stale, "discarded stale bytes on open");
                }
                *self.port.lock().await = Some(port);
                self.set_state(ConnectionState::Open);
                Ok(())
            }
        }
    }

    /// Close the transport and mark the connection closed.
    pub async fn close(&self) {
        self.close_port().await;
        self.set_state(ConnectionState::Closed);
    }

    async fn close_port(&self) {
        if let Some(mut port) = self.port.lock().await.take() {
            // Best-effort shutdown; the port may already be gone.
            let _ = port.shutdown().await;
        }
    }

    /// Enqueue a command on the FIFO queue. `prepend` gives priority to
    /// side-channel probes without preempting the in-flight command.
    pub async fn execute(&self, command: Command, prepend: bool) -> EngineResult<Frame> {
        self.queue.enqueue(command, prepend).await
    }

    /// Run a multi-step sequence as the exclusive lease owner, serialized
    /// with all queued work.
    pub async fn grouped<'a, T, F>(&'a self, f: F) -> T
    where
        F: FnOnce(Leased<'a>) -> BoxFuture<'a, T>,
        T: 'a,
    {
        self.lease.with(f(Leased { conn: self })).await
    }

    async fn leased_request(&self, command: Command) -> EngineResult<Frame> {
        self.lease.with(self.request_with_retry(command)).await
    }

    /// Write the command and wait for its declared frame, re-issuing on CRC
    /// failure up to the bounded retry count.
    async fn request_with_retry(&self, command: Command) -> EngineResult<Frame> {
        let attempts = self.settings.crc_retries.max(1);
        let mut last_crc: Option<EngineError> = None;
        for attempt in 1..=attempts {
            match self.request_once(&command).await {
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        instrument = %self.instrument,
                        command = %command.text,
                        attempt,
                        "CRC mismatch, retrying read"
                    );
                    last_crc = Some(e);
                }
                other => return other,
            }
        }
        let detail = last_crc
            .map(|e| e.to_string())
            .unwrap_or_else(|| "CRC mismatch".to_string());
        self.notifier.emit(Event::alert(
            &self.instrument,
            format!(
                "giving up on '{}' after {} corrupted frames",
                command.text, attempts
            ),
        ));
        Err(EngineError::Decode(format!(
            "CRC retries exhausted for '{}': {}",
            command.text, detail
        )))
    }

    async fn request_once(&self, command: &Command) -> EngineResult<Frame> {
        if let Some(check) = &command.precondition {
            check().map_err(EngineError::Precondition)?;
        }

        let mut guard = self.port.lock().await;
        let port = guard.as_mut().ok_or(EngineError::NotOpen)?;

        if let Err(e) = write_command(port, &command.text).await {
            self.on_transport_error("write", &e);
            return Err(EngineError::Transport(e));
        }

        if !command.settle.is_zero() {
            tokio::time::sleep(command.settle).await;
        }

        let mut decoder = FrameDecoder::new(command.format, command.leading_status);
        let deadline = tokio::time::Instant::now() + command.timeout;
        let mut buf = [0u8; 256];

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, port.read(&mut buf)).await {
                Err(_) => break,
                Ok(Ok(0)) => {
                    let e = std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "transport closed mid-read",
                    );
                    self.on_transport_error("read", &e);
                    return Err(EngineError::Transport(e));
                }
                Ok(Ok(n)) => {
                    decoder.extend(&buf[..n]);
                    if let Some(frame) = decoder.try_complete()? {
                        return Ok(frame);
                    }
                }
                Ok(Err(e)) => {
                    self.on_transport_error("read", &e);
                    return Err(EngineError::Transport(e));
                }
            }
        }

        // A reply arriving after the deadline must not be decoded as the
        // next command's frame.
        let stale = drain_port_buffer(port, 50).await;
        if stale > 0 {
            tracing::debug!(instrument = %self.instrument, stale, "discarded late reply after timeout");
        }
        Err(self.command_timeout(command))
    }

    fn command_timeout(&self, command: &Command) -> EngineError {
        let timeout_ms = command.timeout.as_millis() as u64;
        self.notifier.emit(Event::alert(
            &self.instrument,
            format!(
                "hardware communication timeout on '{}' ({} ms)",
                command.text, timeout_ms
            ),
        ));
        // Timeouts reject this command only; reset is reserved for
        // transport-level errors.
        EngineError::CommandTimeout {
            command: command.text.clone(),
            timeout_ms,
        }
    }

    fn on_transport_error(&self, during: &str, e: &std::io::Error) {
        tracing::error!(instrument = %self.instrument, during, error = %e, "transport error");
        self.notifier.emit(Event::alert(
            &self.instrument,
            format!("hardware connection error during {}: {}", during, e),
        ));
        self.set_state(ConnectionState::Errored);
        self.spawn_reset();
    }

    fn spawn_reset(&self) {
        if let Some(conn) = self.weak.upgrade() {
            tokio::spawn(async move {
                if let Err(e) = conn.reset().await {
                    tracing::error!(instrument = %conn.instrument, error = %e, "reset failed");
                }
            });
        }
    }

    /// Hard reset: tear the transport down, optionally pulse the reset line,
    /// reconnect, and re-run the instrument configure sequence.
    ///
    /// Reentrancy-guarded; an overlapping call returns immediately.
    pub async fn reset(&self) -> EngineResult<()> {
        if self.resetting.swap(true, Ordering::SeqCst) {
            tracing::debug!(instrument = %self.instrument, "reset already in progress");
            return Ok(());
        }
        self.notifier
            .emit(Event::action(&self.instrument, "reset"));
        let result = self.reset_inner().await;
        self.resetting.store(false, Ordering::SeqCst);
        result
    }

    async fn reset_inner(&self) -> EngineResult<()> {
        self.close_port().await;

        if let Some(line) = &self.reset_line {
            tracing::info!(instrument = %self.instrument, "pulsing hardware reset line");
            if let Err(e) = self.pulse_reset_line(line).await {
                // A dead reset line should not stop the reconnect attempt.
                tracing::warn!(instrument = %self.instrument, error = %e, "reset line pulse failed");
            }
        }

        self.wait_and_reconnect().await?;

        // Drop stale commands from before the reset, run the instrument
        // configure sequence on the fresh connection, then clear whatever
        // raced in behind it.
        self.queue.empty();
        let configure = self.configure.read().clone();
        if let Some(configure) = configure {
            if let Err(e) = configure().await {
                self.notifier.emit(Event::alert(
                    &self.instrument,
                    format!("configure after reset failed: {}", e),
                ));
                return Err(e);
            }
        }
        self.queue.empty();
        Ok(())
    }

    async fn pulse_reset_line(&self, line: &Arc<dyn ResetLine>) -> EngineResult<()> {
        line.set_high().await?;
        tokio::time::sleep(self.settings.reset_pulse).await;
        line.set_low().await?;
        tokio::time::sleep(self.settings.reset_pulse).await;
        Ok(())
    }

    /// Cap on the sleep between failed reconnect attempts.
    const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

    /// Defensive close, then reopen with doubling back-off until the
    /// transport comes back or the connection is closed.
    pub async fn wait_and_reconnect(&self) -> EngineResult<()> {
        self.close_port().await;
        self.set_state(ConnectionState::Reconnecting);
        let mut backoff = self.settings.reconnect_timeout;
        loop {
            tokio::time::sleep(backoff).await;
            if self.state() == ConnectionState::Closed {
                return Err(EngineError::NotOpen);
            }
            match self.open().await {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!(
                        instrument = %self.instrument,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "reconnect attempt failed"
                    );
                    self.set_state(ConnectionState::Reconnecting);
                    backoff = (backoff * 2).min(Self::MAX_RECONNECT_BACKOFF);
                }
            }
        }
        tokio::time::sleep(self.settings.reconnect_timeout).await;
        Ok(())
    }
}

async fn write_command(port: &mut DynPort, text: &str) -> std::io::Result<()> {
    port.write_all(text.as_bytes()).await?;
    port.write_all(TERMINATOR).await?;
    port.flush().await
}
