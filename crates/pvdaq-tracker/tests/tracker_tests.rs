//! End-to-end tracker tests against a scripted firmware simulator on a
//! duplex pipe.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use pvdaq_core::config::InstrumentConfig;
use pvdaq_core::connection::PortOpener;
use pvdaq_core::engine::Engine;
use pvdaq_core::frame::crc8;
use pvdaq_core::notify::{EventLevel, Notifier};
use pvdaq_core::scheduler::{TimerKey, TimerKind};
use pvdaq_core::serial::DynPort;
use pvdaq_core::status::{IvInterval, LightReference, StatusPatch, TrackingMode};
use pvdaq_core::storage::{
    MeasurementKind, MeasurementSink, MemorySink, MemoryStore, StatusPersistence,
};
use pvdaq_tracker::{SweepTiming, TrackerInstrument};

/// Scripted behavior of the simulated tracker firmware.
#[derive(Clone)]
struct TrackerSim {
    /// Status polls reporting "sweep running" after each SWEEP:RUN.
    sweep_polls: usize,
    /// Never report the sweep done.
    hang_sweeps: bool,
    /// IV points as raw (millivolt, hundredth-of-a-milliamp) words.
    points: Vec<(i16, i16)>,
    voc_reply: &'static str,
    jsc_reply: &'static str,
    track_words: [i16; 7],
}

impl Default for TrackerSim {
    fn default() -> Self {
        Self {
            sweep_polls: 2,
            hang_sweeps: false,
            points: vec![(200, 3000), (450, 2800), (620, 0)],
            voc_reply: "0.712",
            jsc_reply: "35.0",
            track_words: [100, 200, 300, 1000, 2000, 3000, 253],
        }
    }
}

/// Plays the instrument side of the wire: logs every command line and
/// answers in the firmware dialect.
fn spawn_sim(
    mut host: DuplexStream,
    log: Arc<Mutex<Vec<String>>>,
    sim: TrackerSim,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut pending: Vec<u8> = Vec::new();
        let mut buf = [0u8; 512];
        let mut running_polls: usize = 0;
        loop {
            let n = match host.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            pending.extend_from_slice(&buf[..n]);
            while let Some(pos) = pending.windows(2).position(|w| w == b"\r\n") {
                let line: Vec<u8> = pending.drain(..pos + 2).collect();
                let text = String::from_utf8_lossy(&line[..line.len() - 2]).to_string();
                log.lock().push(text.clone());

                let reply: Vec<u8> = if text.starts_with("SWEEP:RUN") {
                    running_polls = if sim.hang_sweeps {
                        usize::MAX
                    } else {
                        sim.sweep_polls
                    };
                    b"OK\r\n".to_vec()
                } else if text.starts_with("STAT:") {
                    let byte = if running_polls > 0 {
                        running_polls = running_polls.saturating_sub(1);
                        0x01 // running
                    } else {
                        0x02 // done
                    };
                    let mut r = vec![byte, b'\r', b'\n'];
                    r.extend_from_slice(b"OK\r\n");
                    r
                } else if text.starts_with("SWEEP:CNT") {
                    format!("{}\r\nOK\r\n", sim.points.len()).into_bytes()
                } else if text.starts_with("SWEEP:DATA") {
                    let mut payload = Vec::new();
                    for (mv, counts) in &sim.points {
                        payload.extend_from_slice(&mv.to_le_bytes());
                        payload.extend_from_slice(&counts.to_le_bytes());
                    }
                    payload.push(crc8(&payload));
                    payload
                } else if text.starts_with("TRACK:DATA") {
                    let mut payload: Vec<u8> =
                        sim.track_words.iter().flat_map(|w| w.to_le_bytes()).collect();
                    payload.push(crc8(&payload));
                    payload
                } else if text.starts_with("MEAS:VOC") {
                    format!("{}\r\nOK\r\n", sim.voc_reply).into_bytes()
                } else if text.starts_with("MEAS:JSC") {
                    format!("{}\r\nOK\r\n", sim.jsc_reply).into_bytes()
                } else {
                    b"OK\r\n".to_vec()
                };
                if host.write_all(&reply).await.is_err() {
                    return;
                }
            }
        }
    })
}

struct Fixture {
    engine: Arc<Engine>,
    log: Arc<Mutex<Vec<String>>>,
    store: Arc<MemoryStore>,
    sink: Arc<MemorySink>,
}

fn build_fixture(sim: TrackerSim) -> Fixture {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log_clone = Arc::clone(&log);
    let opener: PortOpener = Arc::new(move || {
        let log = Arc::clone(&log_clone);
        let sim = sim.clone();
        Box::pin(async move {
            let (host, device) = tokio::io::duplex(8192);
            spawn_sim(host, log, sim);
            Ok(Box::new(device) as DynPort)
        })
    });

    let config: InstrumentConfig = toml::from_str(
        r#"
            id = "trk1"
            kind = "tracker"
            port = "sim"
            channels = [1]
            command_timeout_ms = 500
        "#,
    )
    .unwrap();

    let store = Arc::new(MemoryStore::default());
    let sink = Arc::new(MemorySink::default());
    let engine = Engine::new(
        config,
        opener,
        None,
        Arc::clone(&store) as Arc<dyn StatusPersistence>,
        Arc::clone(&sink) as Arc<dyn MeasurementSink>,
        Notifier::default(),
    );
    Fixture { engine, log, store, sink }
}

fn fast_timing() -> SweepTiming {
    SweepTiming {
        poll: Duration::from_millis(5),
        ceiling: Duration::from_secs(2),
    }
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn index_of(log: &[String], needle: &str) -> usize {
    log.iter()
        .position(|l| l == needle)
        .unwrap_or_else(|| panic!("'{}' not found in {:?}", needle, log))
}

#[tokio::test]
async fn attach_probes_firmware_then_force_synchronizes() {
    let fx = build_fixture(TrackerSim::default());
    let instrument = Arc::new(TrackerInstrument::with_timing(fast_timing()));
    fx.engine.attach(instrument).await.unwrap();

    let sent = fx.log.lock().clone();
    assert_eq!(sent[0], "STAT:CH1", "configure must probe before syncing");
    assert_eq!(sent[1], "TRACK:PAUSE");
    assert_eq!(sent[2], "TRACK:EN:CH1 0");
    assert_eq!(sent.last().unwrap(), "TRACK:RUN");
    // Probe + pause + 11 register writes + resume.
    assert_eq!(sent.len(), 14);

    fx.engine.detach().await;
}

#[tokio::test]
async fn enabling_a_channel_syncs_changes_sweeps_and_arms_the_track_timer() {
    let fx = build_fixture(TrackerSim::default());
    let instrument = Arc::new(TrackerInstrument::with_timing(fast_timing()));
    fx.engine.attach(instrument).await.unwrap();
    fx.log.lock().clear();

    let patch = StatusPatch {
        enable: Some(true),
        tracking_mode: Some(TrackingMode::Mpp),
        tracking_record_interval_ms: Some(5000),
        ..StatusPatch::default()
    };
    fx.engine.save_status(1, patch).await.unwrap();

    // Only the changed registers are written; the record interval is
    // host-side and never hits the wire.
    let sent = fx.log.lock().clone();
    assert_eq!(
        &sent[..4],
        &[
            "TRACK:PAUSE".to_string(),
            "TRACK:EN:CH1 1".to_string(),
            "TRACK:MODE:CH1 1".to_string(),
            "TRACK:RUN".to_string(),
        ]
    );

    // The track timer is armed at the requested record interval; no IV timer
    // because iv_interval is still off.
    let scheduler = fx.engine.scheduler();
    assert_eq!(
        scheduler.interval_of(&TimerKey::channel(1, TimerKind::Track)),
        Some(Duration::from_millis(5000))
    );
    assert!(!scheduler.contains(&TimerKey::channel(1, TimerKind::IvSweep)));

    // The disabled->enabled edge starts one immediate sweep.
    let sink = Arc::clone(&fx.sink);
    wait_for("initial IV sweep", || {
        sink.records()
            .iter()
            .any(|m| matches!(m.kind, MeasurementKind::IvCurve { .. }))
    })
    .await;

    let sent = fx.log.lock().clone();
    let run_at = index_of(&sent, "SWEEP:RUN:CH1");
    let cnt_at = index_of(&sent, "SWEEP:CNT:CH1");
    let data_at = index_of(&sent, "SWEEP:DATA:CH1");
    assert!(run_at < cnt_at && cnt_at < data_at);
    // MPP of the simulated curve is 0.450 V * 28.0 mA.
    assert!(sent.contains(&"TRACK:VSET:CH1 0.450".to_string()));

    let records = fx.sink.records();
    let curve = records
        .iter()
        .find_map(|m| match &m.kind {
            MeasurementKind::IvCurve { points, .. } => Some(points.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(curve.len(), 3);
    assert!((curve[1].voltage_v - 0.450).abs() < 1e-9);
    assert!((curve[1].current_ma - 28.0).abs() < 1e-9);

    // The mutation was persisted before synchronization.
    let persisted = fx.store.load().await.unwrap();
    assert!(persisted.channels.get(&1).unwrap().enable);

    fx.engine.detach().await;
}

#[tokio::test]
async fn sweep_on_a_constant_voltage_channel_keeps_its_setpoint() {
    let fx = build_fixture(TrackerSim::default());
    let instrument = Arc::new(TrackerInstrument::with_timing(fast_timing()));
    fx.engine.attach(instrument).await.unwrap();
    fx.log.lock().clear();

    let patch = StatusPatch {
        enable: Some(true),
        tracking_mode: Some(TrackingMode::ConstantVoltage),
        ..StatusPatch::default()
    };
    fx.engine.save_status(1, patch).await.unwrap();

    let sink = Arc::clone(&fx.sink);
    wait_for("constant-voltage IV sweep", || {
        sink.records()
            .iter()
            .any(|m| matches!(m.kind, MeasurementKind::IvCurve { .. }))
    })
    .await;

    // The curve is recorded, but the operating point stays put.
    let sent = fx.log.lock().clone();
    assert!(sent.iter().any(|l| l.starts_with("SWEEP:DATA")));
    assert!(
        !sent.iter().any(|l| l.starts_with("TRACK:VSET")),
        "constant-voltage channel had its setpoint moved: {:?}",
        sent
    );

    fx.engine.detach().await;
}

#[tokio::test]
async fn sweep_is_abandoned_at_the_safety_ceiling() {
    let sim = TrackerSim {
        hang_sweeps: true,
        ..TrackerSim::default()
    };
    let fx = build_fixture(sim);
    let instrument = Arc::new(TrackerInstrument::with_timing(SweepTiming {
        poll: Duration::from_millis(5),
        ceiling: Duration::from_millis(50),
    }));
    fx.engine.attach(instrument).await.unwrap();
    let mut events = fx.engine.notifier().subscribe();

    let patch = StatusPatch {
        enable: Some(true),
        ..StatusPatch::default()
    };
    fx.engine.save_status(1, patch).await.unwrap();

    // The abort surfaces as a user-visible alert.
    let alert = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.level == EventLevel::Alert {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert!(
        alert.log.as_deref().unwrap_or("").contains("safety ceiling"),
        "unexpected alert: {:?}",
        alert
    );

    // Nothing was read back and nothing was recorded.
    let sent = fx.log.lock().clone();
    assert!(!sent.iter().any(|l| l.starts_with("SWEEP:DATA")));
    assert!(fx.sink.records().is_empty());

    fx.engine.detach().await;
}

#[tokio::test]
async fn disabling_mid_sweep_stops_the_poll_loop() {
    let sim = TrackerSim {
        sweep_polls: 1000,
        ..TrackerSim::default()
    };
    let fx = build_fixture(sim);
    let instrument = Arc::new(TrackerInstrument::with_timing(fast_timing()));
    fx.engine.attach(instrument).await.unwrap();

    let patch = StatusPatch {
        enable: Some(true),
        ..StatusPatch::default()
    };
    fx.engine.save_status(1, patch).await.unwrap();

    let log = Arc::clone(&fx.log);
    wait_for("sweep start", || {
        log.lock().iter().any(|l| l == "SWEEP:RUN:CH1")
    })
    .await;

    let patch = StatusPatch {
        enable: Some(false),
        ..StatusPatch::default()
    };
    fx.engine.save_status(1, patch).await.unwrap();

    // The poll loop notices the disable and gives up without a bulk read.
    let log = Arc::clone(&fx.log);
    wait_for("poll loop exit", || {
        let sent = log.lock();
        // TRACK:EN:CH1 0 acknowledged and no further STAT probes racing in.
        sent.iter().any(|l| l == "TRACK:EN:CH1 0")
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let sent = fx.log.lock().clone();
    assert!(!sent.iter().any(|l| l.starts_with("SWEEP:DATA")));
    assert!(fx.sink.records().is_empty());

    fx.engine.detach().await;
}

#[tokio::test]
async fn voc_measurement_switches_mode_and_restores_it() {
    let fx = build_fixture(TrackerSim::default());
    let instrument = Arc::new(TrackerInstrument::with_timing(fast_timing()));
    fx.engine.attach(instrument).await.unwrap();

    let patch = StatusPatch {
        enable: Some(true),
        iv_autostart: Some(false),
        tracking_mode: Some(TrackingMode::Mpp),
        voc_enabled: Some(true),
        voc_interval_ms: Some(20),
        ..StatusPatch::default()
    };
    fx.engine.save_status(1, patch).await.unwrap();
    fx.log.lock().clear();

    tokio::time::sleep(Duration::from_millis(50)).await;
    fx.engine.scheduler().tick();

    let sink = Arc::clone(&fx.sink);
    wait_for("Voc record", || {
        sink.records()
            .iter()
            .any(|m| matches!(m.kind, MeasurementKind::Voc { .. }))
    })
    .await;

    let sent = fx.log.lock().clone();
    let set_at = index_of(&sent, "TRACK:MODE:CH1 2");
    let read_at = index_of(&sent, "MEAS:VOC:CH1");
    let restore_at = index_of(&sent, "TRACK:MODE:CH1 1");
    assert!(set_at < read_at && read_at < restore_at);

    let volts = fx
        .sink
        .records()
        .iter()
        .find_map(|m| match m.kind {
            MeasurementKind::Voc { volts } => Some(volts),
            _ => None,
        })
        .unwrap();
    assert!((volts - 0.712).abs() < 1e-9);

    fx.engine.detach().await;
}

#[tokio::test]
async fn track_sample_derives_power_and_efficiency() {
    let fx = build_fixture(TrackerSim::default());
    let instrument = Arc::new(TrackerInstrument::with_timing(fast_timing()));
    fx.engine.attach(instrument).await.unwrap();

    let patch = StatusPatch {
        enable: Some(true),
        iv_autostart: Some(false),
        tracking_mode: Some(TrackingMode::Mpp),
        tracking_record_interval_ms: Some(20),
        light_reference: Some(Some(LightReference {
            channel: 2,
            one_sun_value: 35.0,
        })),
        ..StatusPatch::default()
    };
    fx.engine.save_status(1, patch).await.unwrap();
    fx.log.lock().clear();

    tokio::time::sleep(Duration::from_millis(50)).await;
    fx.engine.scheduler().tick();

    let sink = Arc::clone(&fx.sink);
    wait_for("track sample", || {
        sink.records()
            .iter()
            .any(|m| matches!(m.kind, MeasurementKind::TrackSample { .. }))
    })
    .await;

    let sent = fx.log.lock().clone();
    assert!(sent.iter().any(|l| l == "TRACK:DATA:CH1"));
    assert!(sent.iter().any(|l| l == "MEAS:JSC:CH2"));

    let records = fx.sink.records();
    let sample = records
        .iter()
        .find(|m| matches!(m.kind, MeasurementKind::TrackSample { .. }))
        .unwrap();
    match &sample.kind {
        MeasurementKind::TrackSample {
            voltage_v,
            current_ma,
            power_mw,
            efficiency_pct,
            temperature_c,
            light_intensity,
        } => {
            assert!((voltage_v.mean - 0.200).abs() < 1e-9);
            assert!((current_ma.mean - 20.0).abs() < 1e-9);
            assert!((power_mw.mean - 4.0).abs() < 1e-9);
            // 35.0 raw at one_sun_value 35.0 -> exactly one sun.
            assert!((light_intensity.unwrap() - 1.0).abs() < 1e-9);
            // 4 mW out of 100 mW/cm^2 over 1 cm^2.
            assert!((efficiency_pct.unwrap() - 4.0).abs() < 1e-9);
            assert!((temperature_c.unwrap() - 25.3).abs() < 1e-9);
        }
        other => panic!("unexpected kind {:?}", other),
    }

    fx.engine.detach().await;
}

#[tokio::test]
async fn iv_timer_follows_the_interval_setting() {
    let fx = build_fixture(TrackerSim::default());
    let instrument = Arc::new(TrackerInstrument::with_timing(fast_timing()));
    fx.engine.attach(instrument).await.unwrap();

    let key = TimerKey::channel(1, TimerKind::IvSweep);
    let scheduler = Arc::clone(fx.engine.scheduler());

    let patch = StatusPatch {
        enable: Some(true),
        iv_autostart: Some(false),
        iv_interval: Some(IvInterval::Fixed(60_000)),
        ..StatusPatch::default()
    };
    fx.engine.save_status(1, patch).await.unwrap();
    assert_eq!(scheduler.interval_of(&key), Some(Duration::from_secs(60)));

    // Re-applying the same record must not disturb the timer.
    fx.engine
        .save_status(1, StatusPatch::default())
        .await
        .unwrap();
    assert_eq!(scheduler.interval_of(&key), Some(Duration::from_secs(60)));

    let patch = StatusPatch {
        iv_interval: Some(IvInterval::default()), // off
        ..StatusPatch::default()
    };
    fx.engine.save_status(1, patch).await.unwrap();
    assert!(!scheduler.contains(&key));

    fx.engine.detach().await;
}
