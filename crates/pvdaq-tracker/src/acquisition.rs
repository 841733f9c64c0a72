//! Acquisition state machines: IV sweep, Voc, Jsc, and tracking samples.
//!
//! Every routine here is invoked from a scheduler timer (or the
//! enable-autostart path) and is terminal for its own errors: failures are
//! logged and alerted at the `*_task` boundary, busy state is cleared by
//! guard drop, and scheduling continues. Nothing in this module can take the
//! engine down.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use pvdaq_core::command::Command;
use pvdaq_core::engine::Engine;
use pvdaq_core::error::{EngineError, EngineResult};
use pvdaq_core::frame::Frame;
use pvdaq_core::notify::Event;
use pvdaq_core::scheduler::{ChannelId, TaskFn, TimerKey, TimerKind};
use pvdaq_core::status::{ChannelStatus, TrackingMode};
use pvdaq_core::storage::{IvPoint, Measurement, MeasurementKind, MinMeanMax};

/// Bytes per IV point on the wire: LE i16 millivolts + LE i16 hundredths of
/// a milliamp.
pub(crate) const IV_POINT_BYTES: usize = 4;

/// `TRACK:DATA` reply length: 7 LE i16 words (min/mean/max voltage,
/// min/mean/max current, temperature) plus the CRC-8 trailer.
pub(crate) const TRACK_PAYLOAD_LEN: usize = 15;

/// Relative MPP power drift above which the adaptive IV interval shortens.
const POWER_DRIFT_THRESHOLD: f64 = 0.05;

/// AM1.5G standard irradiance.
const ONE_SUN_MW_PER_CM2: f64 = 100.0;

/// Bulk data reads outlast the per-command default.
const BULK_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Sweep loop timing. Production values; tests shrink both.
#[derive(Debug, Clone, Copy)]
pub struct SweepTiming {
    /// Status poll period while a sweep is running on the hardware.
    pub poll: Duration,
    /// Wall-clock ceiling after which a sweep is abandoned.
    pub ceiling: Duration,
}

impl Default for SweepTiming {
    fn default() -> Self {
        Self {
            poll: Duration::from_secs(1),
            ceiling: Duration::from_secs(300),
        }
    }
}

/// State shared between the strategy and its spawned acquisition tasks.
pub(crate) struct AcqShared {
    pub(crate) timing: SweepTiming,
    sweeping: Mutex<HashSet<ChannelId>>,
    last_mpp_mw: Mutex<HashMap<ChannelId, f64>>,
}

impl AcqShared {
    pub(crate) fn new(timing: SweepTiming) -> Self {
        Self {
            timing,
            sweeping: Mutex::new(HashSet::new()),
            last_mpp_mw: Mutex::new(HashMap::new()),
        }
    }
}

/// Removes the channel from the busy set when the sweep settles, error or
/// not.
struct BusyGuard<'a> {
    set: &'a Mutex<HashSet<ChannelId>>,
    channel: ChannelId,
}

impl<'a> BusyGuard<'a> {
    fn try_acquire(set: &'a Mutex<HashSet<ChannelId>>, channel: ChannelId) -> Option<Self> {
        if set.lock().insert(channel) {
            Some(Self { set, channel })
        } else {
            None
        }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.channel);
    }
}

/// Prepend-priority status probe: one status byte, no payload.
pub(crate) fn stat_probe(engine: &Engine, channel: ChannelId) -> Command {
    Command::lines(format!("STAT:CH{}", channel), 2)
        .with_status_byte()
        .with_timeout(engine.config().command_timeout())
}

fn channel_record(engine: &Engine, channel: ChannelId) -> EngineResult<ChannelStatus> {
    engine.status().get(channel).ok_or_else(|| {
        EngineError::Config(format!("no status record for channel {}", channel))
    })
}

fn parse_scalar(frame: &Frame) -> EngineResult<f64> {
    let text = frame.first_text()?;
    text.parse()
        .map_err(|_| EngineError::Decode(format!("expected a numeric reply, got '{}'", text)))
}

// =============================================================================
// Timer task builders
// =============================================================================

pub(crate) fn sweep_task(engine: &Arc<Engine>, shared: Arc<AcqShared>, channel: ChannelId) -> TaskFn {
    let weak = Arc::downgrade(engine);
    Arc::new(move || {
        let weak = weak.clone();
        let shared = Arc::clone(&shared);
        Box::pin(async move {
            if let Some(engine) = weak.upgrade() {
                run_sweep_boundary(&engine, &shared, channel).await;
            }
        })
    })
}

pub(crate) fn voc_task(engine: &Arc<Engine>, channel: ChannelId) -> TaskFn {
    let weak = Arc::downgrade(engine);
    Arc::new(move || {
        let weak = weak.clone();
        Box::pin(async move {
            if let Some(engine) = weak.upgrade() {
                if let Err(e) = run_voc(&engine, channel).await {
                    alert_failure(&engine, channel, "Voc measurement", &e);
                }
            }
        })
    })
}

pub(crate) fn jsc_task(engine: &Arc<Engine>, channel: ChannelId) -> TaskFn {
    let weak = Arc::downgrade(engine);
    Arc::new(move || {
        let weak = weak.clone();
        Box::pin(async move {
            if let Some(engine) = weak.upgrade() {
                if let Err(e) = run_jsc(&engine, channel).await {
                    alert_failure(&engine, channel, "Jsc measurement", &e);
                }
            }
        })
    })
}

pub(crate) fn track_task(engine: &Arc<Engine>, channel: ChannelId) -> TaskFn {
    let weak = Arc::downgrade(engine);
    Arc::new(move || {
        let weak = weak.clone();
        Box::pin(async move {
            if let Some(engine) = weak.upgrade() {
                if let Err(e) = run_track_sample(&engine, channel).await {
                    alert_failure(&engine, channel, "tracking sample", &e);
                }
            }
        })
    })
}

pub(crate) async fn run_sweep_boundary(engine: &Arc<Engine>, shared: &AcqShared, channel: ChannelId) {
    if let Err(e) = run_iv_sweep(engine, shared, channel).await {
        alert_failure(engine, channel, "IV sweep", &e);
    }
}

fn alert_failure(engine: &Engine, channel: ChannelId, what: &str, error: &EngineError) {
    tracing::warn!(
        instrument = %engine.config().id,
        channel,
        error = %error,
        "{} failed", what
    );
    engine.notifier().emit(
        Event::alert(&engine.config().id, format!("{} failed: {}", what, error))
            .with_channel(channel),
    );
}

// =============================================================================
// IV sweep
// =============================================================================

/// Run one full IV sweep on `channel`.
///
/// Starts the hardware sweep, polls its status byte until the running bit
/// clears (re-checking that the channel is still enabled each poll), then
/// reads back the curve as a CRC-checked binary block. The sweep is abandoned
/// with [`EngineError::SafetyTimeout`] when the ceiling elapses. A channel
/// already mid-sweep is skipped silently.
async fn run_iv_sweep(engine: &Arc<Engine>, shared: &AcqShared, channel: ChannelId) -> EngineResult<()> {
    let Some(_busy) = BusyGuard::try_acquire(&shared.sweeping, channel) else {
        tracing::debug!(instrument = %engine.config().id, channel, "sweep already in progress, skipping");
        return Ok(());
    };

    let status = channel_record(engine, channel)?;
    if !status.enable {
        return Err(EngineError::ChannelDisabled(channel));
    }

    engine
        .notifier()
        .emit(Event::action(&engine.config().id, "iv_sweep").with_channel(channel));
    engine
        .execute(engine.ack(format!("SWEEP:RUN:CH{}", channel)), false)
        .await?;

    let started = tokio::time::Instant::now();
    loop {
        tokio::time::sleep(shared.timing.poll).await;
        if started.elapsed() >= shared.timing.ceiling {
            return Err(EngineError::SafetyTimeout {
                elapsed_s: started.elapsed().as_secs(),
            });
        }
        if !channel_record(engine, channel)?.enable {
            return Err(EngineError::ChannelDisabled(channel));
        }
        // Prepended so the probe cuts ahead of queued configuration writes.
        let frame = engine.execute(stat_probe(engine, channel), true).await?;
        let byte = frame.status.ok_or_else(|| {
            EngineError::Decode("status probe reply carried no status byte".into())
        })?;
        if byte & engine.config().status_bits.running_mask == 0 {
            break;
        }
    }

    let count_frame = engine
        .execute(
            Command::lines(format!("SWEEP:CNT:CH{}", channel), 2)
                .with_timeout(engine.config().command_timeout()),
            false,
        )
        .await?;
    let count: usize = count_frame
        .first_text()?
        .parse()
        .map_err(|_| EngineError::Decode("sweep point count is not a number".into()))?;
    if count == 0 {
        tracing::warn!(instrument = %engine.config().id, channel, "sweep produced no points");
        return Ok(());
    }

    let frame = engine
        .execute(
            Command::binary(
                format!("SWEEP:DATA:CH{}", channel),
                count * IV_POINT_BYTES + 1,
                true,
            )
            .with_timeout(BULK_READ_TIMEOUT),
            false,
        )
        .await?;
    let payload = frame
        .binary
        .ok_or_else(|| EngineError::Decode("sweep data reply was not binary".into()))?;
    let points = parse_iv_points(&payload)?;

    let light_intensity = read_light_intensity(engine, &status).await;
    engine
        .record(Measurement {
            name: status.measurement_name.clone(),
            channel,
            at: Utc::now(),
            kind: MeasurementKind::IvCurve {
                points: points.clone(),
                light_intensity,
            },
        })
        .await;
    tracing::info!(
        instrument = %engine.config().id,
        channel,
        points = points.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "IV sweep recorded"
    );

    if let Some((mpp, power_mw)) = max_power_point(&points) {
        // Only an MPP-tracked channel gets its setpoint moved; other modes
        // keep their operating point across scheduled sweeps.
        if status.tracking_mode == TrackingMode::Mpp && mpp.voltage_v.is_finite() {
            engine
                .execute(
                    engine.ack(format!("TRACK:VSET:CH{} {:.3}", channel, mpp.voltage_v)),
                    false,
                )
                .await?;
        }
        if status.iv_interval.is_auto() {
            adapt_auto_interval(engine, shared, channel, &status, power_mw);
        }
    }
    Ok(())
}

/// Retune the adaptive IV interval from MPP power drift: shrink toward the
/// configured minimum while the power is moving, stretch toward the maximum
/// once it settles.
fn adapt_auto_interval(
    engine: &Engine,
    shared: &AcqShared,
    channel: ChannelId,
    status: &ChannelStatus,
    power_mw: f64,
) {
    let key = TimerKey::channel(channel, TimerKind::IvSweep);
    let Some(current) = engine.scheduler().interval_of(&key) else {
        return;
    };
    let Some(previous) = shared.last_mpp_mw.lock().insert(channel, power_mw) else {
        return;
    };
    if previous.abs() < f64::EPSILON {
        return;
    }

    let drift = ((power_mw - previous) / previous).abs();
    let factor = status.iv_auto_factor.max(1.0);
    let scaled = if drift > POWER_DRIFT_THRESHOLD {
        current.as_millis() as f64 / factor
    } else {
        current.as_millis() as f64 * factor
    };
    let next = Duration::from_millis(
        (scaled as u64).clamp(status.iv_auto_min_ms, status.iv_auto_max_ms),
    );
    if next != current && engine.scheduler().set_interval(&key, next) {
        tracing::debug!(
            instrument = %engine.config().id,
            channel,
            drift,
            next_ms = next.as_millis() as u64,
            "adaptive IV interval retuned"
        );
    }
}

// =============================================================================
// Voc / Jsc
// =============================================================================

/// Switch the channel into `mode`, equilibrate, read one scalar, and restore
/// the previous mode. The whole sequence holds the connection lease so no
/// queued write can land between mode switch and readback; the restore is
/// attempted even when the read fails.
async fn run_mode_measurement(
    engine: &Arc<Engine>,
    channel: ChannelId,
    mode: TrackingMode,
    command: &str,
) -> EngineResult<f64> {
    let status = channel_record(engine, channel)?;
    if !status.enable {
        return Err(EngineError::ChannelDisabled(channel));
    }

    let delay = Duration::from_millis(status.switch_delay_ms);
    let set = engine.ack(format!("TRACK:MODE:CH{} {}", channel, u8::from(mode)));
    let restore = engine.ack(format!(
        "TRACK:MODE:CH{} {}",
        channel,
        u8::from(status.tracking_mode)
    ));
    let read = Command::lines(format!("{}:CH{}", command, channel), 2)
        .with_timeout(engine.config().command_timeout());

    engine
        .connection()
        .grouped(move |leased| {
            Box::pin(async move {
                leased.request(set).await?;
                tokio::time::sleep(delay).await;
                let reply = leased.request(read).await;
                let restored = leased.request(restore).await;
                let frame = reply?;
                restored?;
                parse_scalar(&frame)
            })
        })
        .await
}

async fn run_voc(engine: &Arc<Engine>, channel: ChannelId) -> EngineResult<()> {
    let status = channel_record(engine, channel)?;
    let volts = run_mode_measurement(engine, channel, TrackingMode::Voc, "MEAS:VOC").await?;
    tracing::debug!(instrument = %engine.config().id, channel, volts, "Voc measured");
    engine
        .record(Measurement {
            name: status.measurement_name.clone(),
            channel,
            at: Utc::now(),
            kind: MeasurementKind::Voc { volts },
        })
        .await;
    engine.notifier().emit(
        Event::timer(&engine.config().id, TimerKind::Voc.as_str()).with_channel(channel),
    );
    Ok(())
}

async fn run_jsc(engine: &Arc<Engine>, channel: ChannelId) -> EngineResult<()> {
    let status = channel_record(engine, channel)?;
    let milliamps = run_mode_measurement(engine, channel, TrackingMode::Jsc, "MEAS:JSC").await?;
    tracing::debug!(instrument = %engine.config().id, channel, milliamps, "Jsc measured");
    engine
        .record(Measurement {
            name: status.measurement_name.clone(),
            channel,
            at: Utc::now(),
            kind: MeasurementKind::Jsc { milliamps },
        })
        .await;
    engine.notifier().emit(
        Event::timer(&engine.config().id, TimerKind::Jsc.as_str()).with_channel(channel),
    );
    Ok(())
}

// =============================================================================
// Tracking sample
// =============================================================================

async fn run_track_sample(engine: &Arc<Engine>, channel: ChannelId) -> EngineResult<()> {
    let status = channel_record(engine, channel)?;
    if !status.enable {
        return Err(EngineError::ChannelDisabled(channel));
    }

    let frame = engine
        .execute(
            Command::binary(format!("TRACK:DATA:CH{}", channel), TRACK_PAYLOAD_LEN, true)
                .with_timeout(engine.config().command_timeout()),
            false,
        )
        .await?;
    let payload = frame
        .binary
        .ok_or_else(|| EngineError::Decode("track data reply was not binary".into()))?;
    let (voltage_v, current_ma, temperature_c) = parse_track_payload(&payload)?;

    let power_mw = MinMeanMax {
        min: voltage_v.min * current_ma.min,
        mean: voltage_v.mean * current_ma.mean,
        max: voltage_v.max * current_ma.max,
    };
    let light_intensity = read_light_intensity(engine, &status).await;
    let efficiency_pct = efficiency_pct(power_mw.mean, status.cell_area_cm2, light_intensity);

    engine
        .record(Measurement {
            name: status.measurement_name.clone(),
            channel,
            at: Utc::now(),
            kind: MeasurementKind::TrackSample {
                voltage_v,
                current_ma,
                power_mw,
                efficiency_pct,
                temperature_c,
                light_intensity,
            },
        })
        .await;
    engine.notifier().emit(
        Event::timer(&engine.config().id, TimerKind::Track.as_str()).with_channel(channel),
    );
    Ok(())
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Light intensity in suns from the configured reference diode, or `None`
/// when no reference is configured or the read fails (the measurement is
/// still recorded, just unnormalized).
async fn read_light_intensity(engine: &Arc<Engine>, status: &ChannelStatus) -> Option<f64> {
    let reference = status.light_reference?;
    if reference.one_sun_value <= 0.0 {
        return None;
    }
    let read = Command::lines(format!("MEAS:JSC:CH{}", reference.channel), 2)
        .with_timeout(engine.config().command_timeout());
    match engine.execute(read, false).await.and_then(|f| parse_scalar(&f)) {
        Ok(raw) => Some(raw / reference.one_sun_value),
        Err(e) => {
            tracing::warn!(
                instrument = %engine.config().id,
                reference_channel = reference.channel,
                error = %e,
                "light reference read failed"
            );
            None
        }
    }
}

fn efficiency_pct(power_mw: f64, cell_area_cm2: f64, light_intensity: Option<f64>) -> Option<f64> {
    let suns = light_intensity?;
    let incident_mw = cell_area_cm2 * ONE_SUN_MW_PER_CM2 * suns;
    (incident_mw > 0.0).then(|| power_mw / incident_mw * 100.0)
}

/// Scale LE i16 pairs (millivolts, hundredths of a milliamp) to volts/mA.
pub(crate) fn parse_iv_points(payload: &[u8]) -> EngineResult<Vec<IvPoint>> {
    if payload.is_empty() || payload.len() % IV_POINT_BYTES != 0 {
        return Err(EngineError::Decode(format!(
            "IV payload of {} bytes is not a whole number of points",
            payload.len()
        )));
    }
    Ok(payload
        .chunks_exact(IV_POINT_BYTES)
        .map(|c| IvPoint {
            voltage_v: f64::from(i16::from_le_bytes([c[0], c[1]])) / 1000.0,
            current_ma: f64::from(i16::from_le_bytes([c[2], c[3]])) * 0.01,
        })
        .collect())
}

/// Decode a `TRACK:DATA` payload (CRC already stripped): min/mean/max
/// voltage, min/mean/max current, temperature. `i16::MIN` in the temperature
/// word means no sensor fitted.
pub(crate) fn parse_track_payload(
    payload: &[u8],
) -> EngineResult<(MinMeanMax, MinMeanMax, Option<f64>)> {
    if payload.len() != TRACK_PAYLOAD_LEN - 1 {
        return Err(EngineError::Decode(format!(
            "track payload is {} bytes, expected {}",
            payload.len(),
            TRACK_PAYLOAD_LEN - 1
        )));
    }
    let words: Vec<i16> = payload
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect();

    let voltage_v = MinMeanMax {
        min: f64::from(words[0]) / 1000.0,
        mean: f64::from(words[1]) / 1000.0,
        max: f64::from(words[2]) / 1000.0,
    };
    let current_ma = MinMeanMax {
        min: f64::from(words[3]) * 0.01,
        mean: f64::from(words[4]) * 0.01,
        max: f64::from(words[5]) * 0.01,
    };
    let temperature_c = (words[6] != i16::MIN).then(|| f64::from(words[6]) * 0.1);
    Ok((voltage_v, current_ma, temperature_c))
}

pub(crate) fn max_power_point(points: &[IvPoint]) -> Option<(IvPoint, f64)> {
    points
        .iter()
        .map(|p| (*p, p.voltage_v * p.current_ma))
        .filter(|(_, mw)| mw.is_finite())
        .max_by(|a, b| a.1.total_cmp(&b.1))
}
