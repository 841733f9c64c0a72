//! Error types for the engine.
//!
//! `EngineError` consolidates every failure the communication and scheduling
//! core can produce, using `thiserror`. The taxonomy matters for recovery:
//!
//! - **Transport / ConnectTimeout**: the physical link failed. Handled by the
//!   connection manager's reset + reconnect loop.
//! - **CommandTimeout**: one command's reply never arrived. Rejects that
//!   command only; the queue keeps draining.
//! - **Crc / Decode**: a corrupted frame. `Crc` is retryable (the connection
//!   re-issues the read up to a bounded attempt count); `Decode` is the
//!   escalation once retries are exhausted or the payload is malformed.
//! - **Precondition / ChannelDisabled / QueueCleared**: the command was
//!   rejected before (or instead of) touching hardware.
//! - **SafetyTimeout**: a long-running acquisition hit its wall-clock
//!   ceiling and was aborted.
//!
//! No variant is ever allowed to terminate the process; callers recover,
//! alert, or log.

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Primary error type for the communication and scheduling engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The serial transport failed (open failure, write/read I/O error,
    /// connection drop). Triggers the reset + reconnect path.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The transport did not signal open within the connect timeout.
    #[error("connection did not open within {0} ms")]
    ConnectTimeout(u64),

    /// The connection is not open; the command was never written.
    #[error("connection is not open")]
    NotOpen,

    /// A command's expected frame did not arrive within its timeout.
    /// Rejects that command's future only; does not force a reset.
    #[error("command '{command}' timed out after {timeout_ms} ms")]
    CommandTimeout { command: String, timeout_ms: u64 },

    /// A binary frame's CRC-8 trailer did not match its payload.
    /// Retryable: signals "re-issue the read", not "abort the connection".
    #[error("CRC mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Crc { expected: u8, actual: u8 },

    /// A frame could not be decoded (bad length, non-UTF-8 text where text
    /// was required, or CRC retries exhausted).
    #[error("decode error: {0}")]
    Decode(String),

    /// A command's precondition callback returned false; nothing was written
    /// to hardware.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The queue was cleared (hard reset) while this command was pending.
    #[error("command queue was cleared before execution")]
    QueueCleared,

    /// A long-running acquisition exceeded its wall-clock safety ceiling.
    #[error("acquisition exceeded safety ceiling after {elapsed_s} s")]
    SafetyTimeout { elapsed_s: u64 },

    /// The channel was disabled while an acquisition that requires it was
    /// in progress.
    #[error("channel {0} is not enabled")]
    ChannelDisabled(u8),

    /// Durable status persistence failed. Non-fatal: logged and alerted.
    #[error("persistence error: {0}")]
    Storage(String),

    /// An instrument strategy (configure sequence, status hook) failed.
    #[error("instrument error: {0}")]
    Instrument(String),

    /// Instrument configuration failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file parsing failed.
    #[error("configuration file error: {0}")]
    ConfigParse(#[from] config::ConfigError),
}

impl EngineError {
    /// True for decode-level failures that warrant re-issuing the same read.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Crc { .. })
    }
}
