//! Per-channel configuration records and their hardware synchronization
//! support.
//!
//! A [`ChannelStatus`] is the authoritative configuration for one channel.
//! It is mutated only through [`StatusStore::save`] (validated patch merge,
//! persisted after every mutation) or the normalization pass; the actual
//! hardware writes are computed by [`sync_plan`] as a diff against the
//! previous snapshot, so an unchanged record produces zero commands.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::scheduler::ChannelId;
use crate::storage::{PersistedState, StatusPersistence};

/// Operating mode of a channel between sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum TrackingMode {
    #[default]
    Idle,
    Mpp,
    Voc,
    Jsc,
    ConstantVoltage,
}

impl From<TrackingMode> for u8 {
    fn from(mode: TrackingMode) -> u8 {
        match mode {
            TrackingMode::Idle => 0,
            TrackingMode::Mpp => 1,
            TrackingMode::Voc => 2,
            TrackingMode::Jsc => 3,
            TrackingMode::ConstantVoltage => 4,
        }
    }
}

impl TryFrom<u8> for TrackingMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TrackingMode::Idle),
            1 => Ok(TrackingMode::Mpp),
            2 => Ok(TrackingMode::Voc),
            3 => Ok(TrackingMode::Jsc),
            4 => Ok(TrackingMode::ConstantVoltage),
            other => Err(format!("invalid tracking mode {}", other)),
        }
    }
}

/// IV sweep scheduling: disabled, adaptive, or a fixed period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IvInterval {
    /// Fixed period in milliseconds.
    Fixed(u64),
    Named(IvIntervalName),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IvIntervalName {
    Off,
    Auto,
}

impl Default for IvInterval {
    fn default() -> Self {
        IvInterval::Named(IvIntervalName::Off)
    }
}

impl IvInterval {
    pub fn is_off(&self) -> bool {
        matches!(self, IvInterval::Named(IvIntervalName::Off))
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, IvInterval::Named(IvIntervalName::Auto))
    }

    pub fn fixed_ms(&self) -> Option<u64> {
        match self {
            IvInterval::Fixed(ms) => Some(*ms),
            IvInterval::Named(_) => None,
        }
    }
}

/// Reference-diode configuration for light-intensity normalization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LightReference {
    /// Channel carrying the reference diode.
    pub channel: ChannelId,
    /// Calibrated intensity at 1 sun, in the diode's raw units.
    pub one_sun_value: f64,
}

/// The authoritative per-channel configuration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelStatus {
    pub enable: bool,
    pub tracking_mode: TrackingMode,
    /// Perturb-and-observe step period.
    pub tracking_interval_ms: u64,
    /// How often a tracking sample is read back and recorded. Zero disables
    /// recording.
    pub tracking_record_interval_ms: u64,
    pub step_size_mv: f64,
    pub switch_delay_ms: u64,
    pub voltage_limit_v: f64,
    pub current_threshold_ma: f64,
    pub iv_start_v: f64,
    pub iv_stop_v: f64,
    pub iv_rate_mv_s: f64,
    pub iv_hysteresis: bool,
    pub iv_autostart: bool,
    pub iv_autostop: bool,
    pub iv_interval: IvInterval,
    pub iv_auto_min_ms: u64,
    pub iv_auto_max_ms: u64,
    pub iv_auto_factor: f64,
    pub voc_interval_ms: u64,
    pub voc_enabled: bool,
    pub jsc_interval_ms: u64,
    pub jsc_enabled: bool,
    pub measurement_name: String,
    pub cell_name: String,
    pub cell_area_cm2: f64,
    pub light_reference: Option<LightReference>,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self {
            enable: false,
            tracking_mode: TrackingMode::Idle,
            tracking_interval_ms: 1000,
            tracking_record_interval_ms: 0,
            step_size_mv: 2.0,
            switch_delay_ms: 0,
            voltage_limit_v: 2.0,
            current_threshold_ma: 0.0,
            iv_start_v: 0.0,
            iv_stop_v: 1.2,
            iv_rate_mv_s: 50.0,
            iv_hysteresis: false,
            iv_autostart: true,
            iv_autostop: true,
            iv_interval: IvInterval::default(),
            iv_auto_min_ms: 60_000,
            iv_auto_max_ms: 3_600_000,
            iv_auto_factor: 2.0,
            voc_interval_ms: 0,
            voc_enabled: false,
            jsc_interval_ms: 0,
            jsc_enabled: false,
            measurement_name: String::new(),
            cell_name: String::new(),
            cell_area_cm2: 1.0,
            light_reference: None,
        }
    }
}

/// Partial status update; recognized fields are validated and clamped before
/// the merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusPatch {
    pub enable: Option<bool>,
    pub tracking_mode: Option<TrackingMode>,
    pub tracking_interval_ms: Option<u64>,
    pub tracking_record_interval_ms: Option<u64>,
    pub step_size_mv: Option<f64>,
    pub switch_delay_ms: Option<u64>,
    pub voltage_limit_v: Option<f64>,
    pub current_threshold_ma: Option<f64>,
    pub iv_start_v: Option<f64>,
    pub iv_stop_v: Option<f64>,
    pub iv_rate_mv_s: Option<f64>,
    pub iv_hysteresis: Option<bool>,
    pub iv_autostart: Option<bool>,
    pub iv_autostop: Option<bool>,
    pub iv_interval: Option<IvInterval>,
    pub iv_auto_min_ms: Option<u64>,
    pub iv_auto_max_ms: Option<u64>,
    pub iv_auto_factor: Option<f64>,
    pub voc_interval_ms: Option<u64>,
    pub voc_enabled: Option<bool>,
    pub jsc_interval_ms: Option<u64>,
    pub jsc_enabled: Option<bool>,
    pub measurement_name: Option<String>,
    pub cell_name: Option<String>,
    pub cell_area_cm2: Option<f64>,
    pub light_reference: Option<Option<LightReference>>,
}

const MAX_INTERVAL_MS: u64 = 86_400_000; // one day

fn clamp_f64(value: f64, lo: f64, hi: f64) -> f64 {
    value.clamp(lo, hi)
}

fn clamp_interval(ms: u64) -> u64 {
    ms.min(MAX_INTERVAL_MS)
}

impl ChannelStatus {
    /// Merge a validated, clamped patch into this record.
    pub fn apply(&mut self, patch: &StatusPatch) -> EngineResult<()> {
        if let Some(area) = patch.cell_area_cm2 {
            if !(area.is_finite() && area > 0.0) {
                return Err(EngineError::Config(format!(
                    "cell area must be positive, got {}",
                    area
                )));
            }
            self.cell_area_cm2 = area;
        }
        if let Some(v) = patch.enable {
            self.enable = v;
        }
        if let Some(v) = patch.tracking_mode {
            self.tracking_mode = v;
        }
        if let Some(v) = patch.tracking_interval_ms {
            self.tracking_interval_ms = clamp_interval(v);
        }
        if let Some(v) = patch.tracking_record_interval_ms {
            self.tracking_record_interval_ms = clamp_interval(v);
        }
        if let Some(v) = patch.step_size_mv {
            self.step_size_mv = clamp_f64(v, 0.1, 100.0);
        }
        if let Some(v) = patch.switch_delay_ms {
            self.switch_delay_ms = clamp_interval(v);
        }
        if let Some(v) = patch.voltage_limit_v {
            self.voltage_limit_v = clamp_f64(v, -10.0, 10.0);
        }
        if let Some(v) = patch.current_threshold_ma {
            self.current_threshold_ma = clamp_f64(v, 0.0, 1_000.0);
        }
        if let Some(v) = patch.iv_start_v {
            self.iv_start_v = clamp_f64(v, -10.0, 10.0);
        }
        if let Some(v) = patch.iv_stop_v {
            self.iv_stop_v = clamp_f64(v, -10.0, 10.0);
        }
        if let Some(v) = patch.iv_rate_mv_s {
            self.iv_rate_mv_s = clamp_f64(v, 1.0, 10_000.0);
        }
        if let Some(v) = patch.iv_hysteresis {
            self.iv_hysteresis = v;
        }
        if let Some(v) = patch.iv_autostart {
            self.iv_autostart = v;
        }
        if let Some(v) = patch.iv_autostop {
            self.iv_autostop = v;
        }
        if let Some(v) = patch.iv_interval {
            self.iv_interval = match v {
                IvInterval::Fixed(ms) => IvInterval::Fixed(clamp_interval(ms).max(1_000)),
                named => named,
            };
        }
        if let Some(v) = patch.iv_auto_min_ms {
            self.iv_auto_min_ms = clamp_interval(v).max(1_000);
        }
        if let Some(v) = patch.iv_auto_max_ms {
            self.iv_auto_max_ms = clamp_interval(v).max(self.iv_auto_min_ms);
        }
        if let Some(v) = patch.iv_auto_factor {
            self.iv_auto_factor = clamp_f64(v, 1.0, 100.0);
        }
        if let Some(v) = patch.voc_interval_ms {
            self.voc_interval_ms = clamp_interval(v);
        }
        if let Some(v) = patch.voc_enabled {
            self.voc_enabled = v;
        }
        if let Some(v) = patch.jsc_interval_ms {
            self.jsc_interval_ms = clamp_interval(v);
        }
        if let Some(v) = patch.jsc_enabled {
            self.jsc_enabled = v;
        }
        if let Some(v) = &patch.measurement_name {
            self.measurement_name = v.trim().to_string();
        }
        if let Some(v) = &patch.cell_name {
            self.cell_name = v.trim().to_string();
        }
        if let Some(v) = patch.light_reference {
            self.light_reference = v;
        }
        Ok(())
    }

    /// Whether the tracking-sample timer should be armed for this record.
    pub fn wants_track_timer(&self) -> bool {
        self.enable
            && self.tracking_mode != TrackingMode::Idle
            && self.tracking_record_interval_ms > 0
    }
}

/// Format a boolean the way the firmware expects it.
pub fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

// =============================================================================
// Synchronization plan
// =============================================================================

/// One row of an instrument's ordered synchronization table: the hardware
/// command name and the selector producing its wire value from a record.
pub struct SyncEntry {
    pub command: &'static str,
    pub select: fn(&ChannelStatus) -> String,
}

/// Compute the hardware commands needed to bring a channel in line with
/// `current`. A command is included when its selected value differs from the
/// previous snapshot (or always, under `force` or with no snapshot).
pub fn sync_plan(
    table: &[SyncEntry],
    current: &ChannelStatus,
    prev: Option<&ChannelStatus>,
    force: bool,
) -> Vec<(&'static str, String)> {
    table
        .iter()
        .filter_map(|entry| {
            let value = (entry.select)(current);
            let unchanged =
                !force && prev.is_some_and(|snapshot| (entry.select)(snapshot) == value);
            if unchanged {
                None
            } else {
                Some((entry.command, value))
            }
        })
        .collect()
}

// =============================================================================
// Measurement sessions
// =============================================================================

/// Metadata for one named measurement run on one channel. Created lazily the
/// first time the channel's measurement name changes to a new value;
/// append-only except for the end timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSession {
    pub channel: ChannelId,
    pub name: String,
    pub cell_name: String,
    pub cell_area_cm2: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Status store
// =============================================================================

/// Authoritative store of channel records plus session bookkeeping, persisted
/// after every mutation.
pub struct StatusStore {
    records: parking_lot::RwLock<HashMap<ChannelId, ChannelStatus>>,
    sessions: parking_lot::Mutex<Vec<MeasurementSession>>,
    persistence: Arc<dyn StatusPersistence>,
}

impl StatusStore {
    pub fn new(persistence: Arc<dyn StatusPersistence>) -> Self {
        Self {
            records: parking_lot::RwLock::new(HashMap::new()),
            sessions: parking_lot::Mutex::new(Vec::new()),
            persistence,
        }
    }

    /// Hydrate records and sessions from durable storage.
    pub async fn load(&self) -> EngineResult<()> {
        let state = self.persistence.load().await?;
        *self.records.write() = state.channels;
        *self.sessions.lock() = state.sessions;
        Ok(())
    }

    pub fn get(&self, channel: ChannelId) -> Option<ChannelStatus> {
        self.records.read().get(&channel).cloned()
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.records.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Create the record for `channel` from the default template if missing.
    /// Returns true when a record was created.
    pub fn ensure(&self, channel: ChannelId, template: &ChannelStatus) -> bool {
        let mut records = self.records.write();
        if records.contains_key(&channel) {
            return false;
        }
        records.insert(channel, template.clone());
        true
    }

    /// Validate, merge, and persist a patch. Returns the updated record and
    /// the previous snapshot for diffing.
    pub async fn save(
        &self,
        channel: ChannelId,
        patch: &StatusPatch,
    ) -> EngineResult<(ChannelStatus, ChannelStatus)> {
        let (current, prev) = {
            let mut records = self.records.write();
            let record = records.entry(channel).or_default();
            let prev = record.clone();
            record.apply(patch)?;
            (record.clone(), prev)
        };

        if current.measurement_name != prev.measurement_name
            && !current.measurement_name.is_empty()
        {
            self.open_session(channel, &current);
        }

        self.persist().await?;
        Ok((current, prev))
    }

    fn open_session(&self, channel: ChannelId, status: &ChannelStatus) {
        let now = Utc::now();
        let mut sessions = self.sessions.lock();
        // End the channel's running session before starting a new one.
        for session in sessions.iter_mut() {
            if session.channel == channel && session.ended_at.is_none() {
                session.ended_at = Some(now);
            }
        }
        sessions.push(MeasurementSession {
            channel,
            name: status.measurement_name.clone(),
            cell_name: status.cell_name.clone(),
            cell_area_cm2: status.cell_area_cm2,
            started_at: now,
            ended_at: None,
        });
    }

    pub fn sessions(&self) -> Vec<MeasurementSession> {
        self.sessions.lock().clone()
    }

    /// Write the full state through the persistence collaborator.
    pub async fn persist(&self) -> EngineResult<()> {
        let state = PersistedState {
            channels: self.records.read().clone(),
            sessions: self.sessions.lock().clone(),
        };
        self.persistence.store(&state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn table() -> Vec<SyncEntry> {
        vec![
            SyncEntry {
                command: "TRACK:EN",
                select: |s| flag(s.enable),
            },
            SyncEntry {
                command: "TRACK:MODE",
                select: |s| u8::from(s.tracking_mode).to_string(),
            },
            SyncEntry {
                command: "SWEEP:START",
                select: |s| format!("{:.3}", s.iv_start_v),
            },
        ]
    }

    #[test]
    fn sync_plan_sends_everything_without_snapshot() {
        let status = ChannelStatus::default();
        let plan = sync_plan(&table(), &status, None, false);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0], ("TRACK:EN", "0".to_string()));
    }

    #[test]
    fn sync_plan_is_empty_for_unchanged_record() {
        let status = ChannelStatus::default();
        let plan = sync_plan(&table(), &status, Some(&status), false);
        assert!(plan.is_empty());
    }

    #[test]
    fn sync_plan_force_overrides_change_detection() {
        let status = ChannelStatus::default();
        let plan = sync_plan(&table(), &status, Some(&status), true);
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn sync_plan_includes_only_changed_fields() {
        let prev = ChannelStatus::default();
        let mut current = prev.clone();
        current.enable = true;
        current.tracking_mode = TrackingMode::Mpp;

        let plan = sync_plan(&table(), &current, Some(&prev), false);
        assert_eq!(
            plan,
            vec![
                ("TRACK:EN", "1".to_string()),
                ("TRACK:MODE", "1".to_string()),
            ]
        );
    }

    #[test]
    fn apply_clamps_out_of_range_values() {
        let mut status = ChannelStatus::default();
        let patch = StatusPatch {
            step_size_mv: Some(0.0001),
            iv_rate_mv_s: Some(99_999.0),
            tracking_interval_ms: Some(u64::MAX),
            ..StatusPatch::default()
        };
        status.apply(&patch).unwrap();
        assert_eq!(status.step_size_mv, 0.1);
        assert_eq!(status.iv_rate_mv_s, 10_000.0);
        assert_eq!(status.tracking_interval_ms, MAX_INTERVAL_MS);
    }

    #[test]
    fn apply_rejects_nonpositive_cell_area() {
        let mut status = ChannelStatus::default();
        let patch = StatusPatch {
            cell_area_cm2: Some(0.0),
            ..StatusPatch::default()
        };
        assert!(matches!(
            status.apply(&patch),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn tracking_mode_round_trips_through_numeric_serde() {
        let mode: TrackingMode = serde_json::from_str("3").unwrap();
        assert_eq!(mode, TrackingMode::Jsc);
        assert_eq!(serde_json::to_string(&TrackingMode::Mpp).unwrap(), "1");
        assert!(serde_json::from_str::<TrackingMode>("9").is_err());
    }

    #[test]
    fn iv_interval_parses_numbers_and_keywords() {
        let fixed: IvInterval = serde_json::from_str("30000").unwrap();
        assert_eq!(fixed.fixed_ms(), Some(30_000));
        let auto: IvInterval = serde_json::from_str("\"auto\"").unwrap();
        assert!(auto.is_auto());
        let off: IvInterval = serde_json::from_str("\"off\"").unwrap();
        assert!(off.is_off());
    }

    #[tokio::test]
    async fn save_persists_after_every_mutation() {
        let persistence = Arc::new(MemoryStore::default());
        let store = StatusStore::new(persistence.clone());
        store.ensure(1, &ChannelStatus::default());

        let patch = StatusPatch {
            enable: Some(true),
            ..StatusPatch::default()
        };
        let (current, prev) = store.save(1, &patch).await.unwrap();
        assert!(current.enable);
        assert!(!prev.enable);

        let persisted = persistence.load().await.unwrap();
        assert!(persisted.channels.get(&1).unwrap().enable);
    }

    #[tokio::test]
    async fn measurement_name_change_opens_and_ends_sessions() {
        let store = StatusStore::new(Arc::new(MemoryStore::default()));
        store.ensure(1, &ChannelStatus::default());

        let patch = StatusPatch {
            measurement_name: Some("run-a".into()),
            ..StatusPatch::default()
        };
        store.save(1, &patch).await.unwrap();

        // Unrelated mutation: no new session.
        let patch = StatusPatch {
            enable: Some(true),
            ..StatusPatch::default()
        };
        store.save(1, &patch).await.unwrap();
        assert_eq!(store.sessions().len(), 1);

        let patch = StatusPatch {
            measurement_name: Some("run-b".into()),
            ..StatusPatch::default()
        };
        store.save(1, &patch).await.unwrap();

        let sessions = store.sessions();
        assert_eq!(sessions.len(), 2);
        assert!(sessions[0].ended_at.is_some());
        assert_eq!(sessions[1].name, "run-b");
        assert!(sessions[1].ended_at.is_none());
    }
}
