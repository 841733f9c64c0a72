//! Collaborator seams for durable state and measurement data.
//!
//! Two external collaborators are modeled as async traits:
//!
//! - [`StatusPersistence`] — the durable channel-status store, read at
//!   startup and rewritten after every mutation. [`JsonFileStore`] is the
//!   JSON-file implementation; [`MemoryStore`] backs tests.
//! - [`MeasurementSink`] — the time-series storage backend. The engine calls
//!   it fire-and-forget; failures are surfaced as alerts, never as fatal
//!   errors.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::scheduler::ChannelId;
use crate::status::{ChannelStatus, MeasurementSession};

/// Everything the durable store holds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub channels: HashMap<ChannelId, ChannelStatus>,
    pub sessions: Vec<MeasurementSession>,
}

/// Durable channel-status storage.
#[async_trait]
pub trait StatusPersistence: Send + Sync {
    async fn load(&self) -> EngineResult<PersistedState>;
    async fn store(&self, state: &PersistedState) -> EngineResult<()>;
}

/// JSON-file persistence with atomic tmp-then-rename writes.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StatusPersistence for JsonFileStore {
    async fn load(&self) -> EngineResult<PersistedState> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| EngineError::Storage(format!("corrupt status file: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedState::default()),
            Err(e) => Err(EngineError::Storage(format!(
                "failed to read status file: {}",
                e
            ))),
        }
    }

    async fn store(&self, state: &PersistedState) -> EngineResult<()> {
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| EngineError::Storage(format!("failed to encode status file: {}", e)))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| EngineError::Storage(format!("failed to write status file: {}", e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| EngineError::Storage(format!("failed to replace status file: {}", e)))
    }
}

/// In-memory persistence for tests.
#[derive(Default)]
pub struct MemoryStore {
    state: parking_lot::Mutex<PersistedState>,
}

#[async_trait]
impl StatusPersistence for MemoryStore {
    async fn load(&self) -> EngineResult<PersistedState> {
        Ok(self.state.lock().clone())
    }

    async fn store(&self, state: &PersistedState) -> EngineResult<()> {
        *self.state.lock() = state.clone();
        Ok(())
    }
}

// =============================================================================
// Measurement data
// =============================================================================

/// Min/mean/max aggregate over one recording interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinMeanMax {
    pub min: f64,
    pub mean: f64,
    pub max: f64,
}

/// One point of an IV curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IvPoint {
    pub voltage_v: f64,
    pub current_ma: f64,
}

/// Payload of a named measurement write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeasurementKind {
    IvCurve {
        points: Vec<IvPoint>,
        light_intensity: Option<f64>,
    },
    Voc {
        volts: f64,
    },
    Jsc {
        milliamps: f64,
    },
    TrackSample {
        voltage_v: MinMeanMax,
        current_ma: MinMeanMax,
        power_mw: MinMeanMax,
        efficiency_pct: Option<f64>,
        temperature_c: Option<f64>,
        light_intensity: Option<f64>,
    },
}

/// One named measurement write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Measurement (series) name from the channel record.
    pub name: String,
    pub channel: ChannelId,
    pub at: DateTime<Utc>,
    pub kind: MeasurementKind,
}

/// Time-series storage collaborator.
#[async_trait]
pub trait MeasurementSink: Send + Sync {
    async fn write(&self, measurement: Measurement) -> EngineResult<()>;
}

/// Sink that only logs; used when no storage backend is wired up.
pub struct NullSink;

#[async_trait]
impl MeasurementSink for NullSink {
    async fn write(&self, measurement: Measurement) -> EngineResult<()> {
        tracing::debug!(
            name = %measurement.name,
            channel = measurement.channel,
            "dropping measurement (no sink configured)"
        );
        Ok(())
    }
}

/// Capturing sink for tests.
#[derive(Default)]
pub struct MemorySink {
    records: parking_lot::Mutex<Vec<Measurement>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<Measurement> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl MeasurementSink for MemorySink {
    async fn write(&self, measurement: Measurement) -> EngineResult<()> {
        self.records.lock().push(measurement);
        Ok(())
    }
}

/// Append-only JSON-lines sink, one measurement record per line.
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl MeasurementSink for JsonlSink {
    async fn write(&self, measurement: Measurement) -> EngineResult<()> {
        use tokio::io::AsyncWriteExt;

        let mut line = serde_json::to_vec(&measurement)
            .map_err(|e| EngineError::Storage(format!("failed to encode measurement: {}", e)))?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| EngineError::Storage(format!("failed to open measurement file: {}", e)))?;
        file.write_all(&line)
            .await
            .map_err(|e| EngineError::Storage(format!("failed to append measurement: {}", e)))
    }
}
