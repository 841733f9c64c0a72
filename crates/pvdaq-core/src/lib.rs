//! `pvdaq-core`
//!
//! Serial communication and scheduling engine for solar-cell measurement
//! instruments.
//!
//! This crate provides the transport-agnostic core shared by all pvdaq
//! instrument strategies: a framed serial protocol with CRC-checked binary
//! payloads, a strictly single-flight command queue, a self-healing
//! connection lifecycle, a per-channel status store with diff-based
//! synchronization, and a one-second tick scheduler for periodic
//! acquisition tasks.
//!
//! ## Layering
//!
//! - [`serial`] / [`frame`]: byte-level I/O and frame decoding
//! - [`command`] / [`connection`]: ordered command execution and lifecycle
//! - [`status`] / [`scheduler`] / [`storage`]: channel state, timers, persistence
//! - [`engine`] / [`instrument`]: composition root and the strategy seam
//!
//! ## Key Types
//!
//! - [`Engine`]: owns the connection, scheduler, status store and sink
//! - [`Instrument`]: per-device strategy (command vocabulary, timer policy)
//! - [`Connection`]: open/close/reset state machine over a [`serial::DynPort`]
//! - [`EngineError`]: error taxonomy with retryability information
//!
//! ## Example
//!
//! ```rust,no_run
//! use pvdaq_core::{Engine, EngineError};
//! # async fn example() -> Result<(), EngineError> {
//! // Engines follow a standard lifecycle:
//! // Closed -> Opening -> Open -> (Errored -> Reconnecting -> Open)*
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod frame;
pub mod instrument;
pub mod notify;
pub mod scheduler;
pub mod serial;
pub mod status;
pub mod storage;

pub use command::{Command, CommandQueue, Lease};
pub use config::{AppConfig, InstrumentConfig, StatusBits};
pub use connection::{Connection, ConnectionSettings, ConnectionState, ResetLine};
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use frame::{Frame, FrameDecoder, FrameFormat};
pub use instrument::Instrument;
pub use notify::{Event, EventLevel, Notifier};
pub use scheduler::{ChannelId, Scheduler, TimerKey, TimerKind};
pub use status::{ChannelStatus, StatusPatch, StatusStore, TrackingMode};
pub use storage::{
    IvPoint, JsonFileStore, JsonlSink, Measurement, MeasurementKind, MeasurementSink, MemorySink,
    MemoryStore, MinMeanMax, StatusPersistence,
};
