//! Commands, the per-connection FIFO queue, and the lease.
//!
//! Every hardware interaction is a [`Command`]: an outgoing ASCII string plus
//! the declared shape of its reply. Commands reach the wire through exactly
//! one of two paths, both serialized by the connection's [`Lease`]:
//!
//! - the [`CommandQueue`], a strictly single-flight FIFO with a
//!   priority-prepend slot for status probes, or
//! - an ad hoc grouped sequence (`Connection::grouped`) for multi-step
//!   operations that must not be interleaved with queued work.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::error::{EngineError, EngineResult};
use crate::frame::{Frame, FrameFormat};

/// Precondition checked immediately before a command is written. Returning
/// `Err` rejects the command without touching hardware.
pub type Precondition = Arc<dyn Fn() -> Result<(), String> + Send + Sync>;

/// A unit of work for one connection: outgoing bytes plus expected reply
/// shape, timing, and checks. Consumed exactly once.
#[derive(Clone)]
pub struct Command {
    /// Outgoing ASCII command, without the trailing CR LF.
    pub text: String,
    /// Declared reply shape.
    pub format: FrameFormat,
    /// Whether the first delimited chunk is a status/health byte.
    pub leading_status: bool,
    /// Per-command reply deadline.
    pub timeout: Duration,
    /// Post-write settle delay before reading.
    pub settle: Duration,
    /// Optional precondition evaluated just before the write.
    pub precondition: Option<Precondition>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("text", &self.text)
            .field("format", &self.format)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Command {
    /// Default reply deadline when the caller does not override it.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

    /// A command expecting `lines` CR LF terminated reply lines. A zero
    /// line count could never complete, so it is read as a plain ack.
    pub fn lines(text: impl Into<String>, lines: usize) -> Self {
        Self {
            text: text.into(),
            format: FrameFormat::Lines(lines.max(1)),
            leading_status: false,
            timeout: Self::DEFAULT_TIMEOUT,
            settle: Duration::ZERO,
            precondition: None,
        }
    }

    /// A command expecting a single acknowledgement line.
    pub fn ack(text: impl Into<String>) -> Self {
        Self::lines(text, 1)
    }

    /// A command expecting a fixed-length binary reply, optionally CRC-8
    /// trailed.
    pub fn binary(text: impl Into<String>, len: usize, crc: bool) -> Self {
        Self {
            text: text.into(),
            format: FrameFormat::Binary { len, crc },
            leading_status: false,
            timeout: Self::DEFAULT_TIMEOUT,
            settle: Duration::ZERO,
            precondition: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Declare that the reply carries a leading status byte.
    pub fn with_status_byte(mut self) -> Self {
        self.leading_status = true;
        self
    }

    pub fn with_precondition(mut self, check: Precondition) -> Self {
        self.precondition = Some(check);
        self
    }
}

// =============================================================================
// Lease
// =============================================================================

/// Connection-wide mutual exclusion token.
///
/// Wraps a fair async mutex: `with(op)` waits for the current holder to
/// settle (success or failure alike), then runs `op` as the sole owner.
/// Queue draining and grouped sequences both go through the same lease, so
/// it is the single point of exclusion across structured and ad hoc paths.
#[derive(Clone, Default)]
pub struct Lease {
    inner: Arc<tokio::sync::Mutex<()>>,
}

impl Lease {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op` as the exclusive owner of the connection.
    pub async fn with<T, F>(&self, op: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let _guard = self.inner.lock().await;
        op.await
    }
}

// =============================================================================
// Command queue
// =============================================================================

/// Executor closure the queue drains entries through. Supplied by the
/// connection; acquires the lease internally.
pub type ExecFn = Arc<dyn Fn(Command) -> BoxFuture<'static, EngineResult<Frame>> + Send + Sync>;

struct QueueEntry {
    command: Command,
    done: oneshot::Sender<EngineResult<Frame>>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueueEntry>,
    processing: bool,
}

/// Per-connection FIFO that serializes command executions.
///
/// Exactly one command is in flight at a time; a failing command rejects only
/// its own future and the drain continues with the next entry. Prepended
/// entries jump ahead of queued work but never preempt an in-flight command.
pub struct CommandQueue {
    state: parking_lot::Mutex<QueueState>,
    exec: ExecFn,
}

impl CommandQueue {
    pub fn new(exec: ExecFn) -> Arc<Self> {
        Arc::new(Self {
            state: parking_lot::Mutex::new(QueueState::default()),
            exec,
        })
    }

    /// Number of pending (not yet started) entries.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Append (or prepend) a command and drive the drain. The returned
    /// future settles with this command's own outcome.
    pub async fn enqueue(self: &Arc<Self>, command: Command, prepend: bool) -> EngineResult<Frame> {
        let (tx, rx) = oneshot::channel();
        let start_drain = {
            let mut state = self.state.lock();
            let entry = QueueEntry { command, done: tx };
            if prepend {
                state.pending.push_front(entry);
            } else {
                state.pending.push_back(entry);
            }
            if state.processing {
                false
            } else {
                state.processing = true;
                true
            }
        };

        if start_drain {
            let queue = Arc::clone(self);
            tokio::spawn(async move { queue.drain().await });
        }

        // A dropped sender means the queue was cleared underneath us.
        rx.await.unwrap_or(Err(EngineError::QueueCleared))
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let entry = {
                let mut state = self.state.lock();
                match state.pending.pop_front() {
                    Some(entry) => entry,
                    None => {
                        state.processing = false;
                        return;
                    }
                }
            };

            let result = (self.exec)(entry.command).await;
            // The caller may have given up waiting; that is fine.
            let _ = entry.done.send(result);
        }
    }

    /// Clear all pending entries and reset the processing flag.
    ///
    /// Used during a hard reset so stale commands cannot fire against a
    /// torn-down connection. Each cleared entry's future rejects with
    /// [`EngineError::QueueCleared`]. An in-flight command is not interrupted;
    /// if a new drain starts before it settles, the lease still guarantees
    /// at most one command on the wire.
    pub fn empty(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.processing = false;
    }
}
