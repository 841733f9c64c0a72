//! Tracker-controller strategy for the pvdaq engine.
//!
//! This crate provides the firmware dialect and acquisition state machines
//! for the solar-cell tracker controller:
//! - per-channel configuration synchronization (`TRACK:*` / `SWEEP:*`)
//! - IV sweeps with status polling, CRC-checked bulk reads, and a
//!   wall-clock safety ceiling
//! - periodic open-circuit voltage and short-circuit current measurements
//! - tracking samples (min/mean/max aggregates with derived efficiency)
//!
//! # Usage
//!
//! Attach the strategy to an engine built by `pvdaq-core`:
//!
//! ```rust,ignore
//! use pvdaq_tracker::TrackerInstrument;
//!
//! engine.attach(Arc::new(TrackerInstrument::new())).await?;
//! ```

pub mod acquisition;
pub mod instrument;

pub use acquisition::SweepTiming;
pub use instrument::TrackerInstrument;
