use std::{
    fs,
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use sleep_monitor::{
    DetectionSnapshot, MonitorConfig, MonitorSession, Providers, encode_jpeg, enter_runtime,
    init_metrics_recorder, render_metrics,
};
use tracing::{info, warn};
use video_ingest::CameraBackend;

use crate::{cli::RunArgs, synthetic};

const TICK: Duration = Duration::from_millis(100);
const SYNTHETIC_FRAMES_PER_SCENE: u64 = 150;
const SNAPSHOT_JPEG_QUALITY: u8 = 85;

pub fn run(args: RunArgs) -> Result<()> {
    let config = MonitorConfig::try_from(args.monitor)?;
    let _telemetry = enter_runtime(&config.telemetry);
    init_metrics_recorder();

    let shutdown = install_ctrlc_handler();
    let (backend, providers) = if args.synthetic {
        synthetic_inputs(&config)
    } else {
        camera_inputs(&config)?
    };

    let mut session = MonitorSession::new(config, backend, providers)?;
    for name in &args.disabled_features {
        session
            .set_feature_enabled(name, false)
            .with_context(|| format!("invalid --disable value {name:?}"))?;
    }
    session
        .start_session()
        .context("failed to start monitoring session")?;
    info!("monitoring; press Ctrl+C to stop");

    let records = session.records();
    let report_every = Duration::from_secs(args.report_interval_secs.max(1));
    let deadline = args
        .duration_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut next_report = Instant::now() + report_every;
    let mut processed: u64 = 0;

    while !shutdown.load(Ordering::SeqCst) {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
        thread::sleep(TICK);
        processed += records.try_iter().count() as u64;
        if Instant::now() >= next_report {
            next_report += report_every;
            report(&session.current_state(), args.json, processed)?;
        }
    }

    session.stop_session();
    processed += records.try_iter().count() as u64;
    let summary = session.current_state();
    report(&summary, args.json, processed)?;

    if let Some(path) = &args.snapshot_jpeg {
        match session.latest_annotated_frame() {
            Some(frame) => {
                let jpeg = encode_jpeg(&frame, SNAPSHOT_JPEG_QUALITY)?;
                fs::write(path, jpeg)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                info!(path = %path.display(), "annotated frame written");
            }
            None => warn!("no annotated frame available; snapshot skipped"),
        }
    }
    if args.dump_metrics {
        if let Some(metrics) = render_metrics() {
            println!("{metrics}");
        }
    }
    Ok(())
}

fn install_ctrlc_handler() -> Arc<AtomicBool> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("failed to install Ctrl+C handler: {err}");
        }
    });
    shutdown
}

fn synthetic_inputs(config: &MonitorConfig) -> (Arc<dyn CameraBackend>, Providers) {
    let backend = synthetic::backend(
        config.source.width,
        config.source.height,
        SYNTHETIC_FRAMES_PER_SCENE,
    );
    (Arc::new(backend), synthetic::providers())
}

#[cfg(feature = "opencv")]
fn camera_inputs(config: &MonitorConfig) -> Result<(Arc<dyn CameraBackend>, Providers)> {
    use video_ingest::OpenCvBackend;

    let fps = 1.0 / config.source.frame_interval.as_secs_f64();
    let backend = OpenCvBackend::new((config.source.width, config.source.height), fps);
    warn!("no pose or emotion model is linked; every frame will report no subject");
    let providers = Providers {
        landmarks: Some(Box::new(
            |_: &video_ingest::Frame| -> Result<Option<pose_core::LandmarkSet>> { Ok(None) },
        )),
        emotion: None,
    };
    Ok((Arc::new(backend), providers))
}

#[cfg(not(feature = "opencv"))]
fn camera_inputs(_config: &MonitorConfig) -> Result<(Arc<dyn CameraBackend>, Providers)> {
    anyhow::bail!("camera capture needs the `opencv` feature; pass --synthetic for the demo")
}

fn report(snapshot: &DetectionSnapshot, json: bool, processed: u64) -> Result<()> {
    if json {
        println!("{}", snapshot.to_json_pretty()?);
        return Ok(());
    }
    let breakdown = snapshot
        .statistics
        .iter()
        .filter(|(_, secs)| **secs > 0.0)
        .map(|(label, secs)| format!("{label}={secs:.1}s"))
        .collect::<Vec<_>>()
        .join(" ");
    println!(
        "[{:?}] posture={} emotion={} presence={:?} wakes={} frames={} elapsed={:.1}s {}",
        snapshot.camera_status,
        snapshot.posture,
        snapshot.emotion,
        snapshot.presence,
        snapshot.wake_count,
        processed,
        snapshot.elapsed_secs,
        breakdown
    );
    Ok(())
}
