pub mod control;
pub mod db;
pub mod devices;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod series;
pub mod settings;
mod utils;
pub mod vision;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{error, info, warn};

use db::Database;
use devices::{
    BenchState, DropletModel, FunctionGenerator, SimulatedCamera, SimulatedDisplay,
    SimulatedInstrument,
};
use orchestrator::{ControlEvent, ControlOrchestrator, ControlState, SweepMode};
use settings::SettingsStore;

pub use error::{TensiometerError, TensiometerResult};

const DEFAULT_DATA_DIR: &str = "tensiometer-data";
const TRACKING_PERIOD: Duration = Duration::from_secs(5);
const BENCH_COMMAND_DELAY: Duration = Duration::from_micros(200);
const BENCH_SENSOR_NOISE: u8 = 2;

fn data_dir() -> PathBuf {
    std::env::var_os("TENSIOMETER_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

fn debug_mode() -> bool {
    std::env::var("TENSIOMETER_DEBUG")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn sweep_mode_from_args() -> SweepMode {
    match std::env::args().nth(1).as_deref() {
        Some("elasticity") => SweepMode::Elasticity,
        _ => SweepMode::Standard,
    }
}

/// Closes run sessions left open by a previous process.
async fn recover_open_sessions(database: &Database) -> Result<()> {
    for session in database.list_run_sessions().await? {
        if session.finalized_at.is_none() {
            warn!(
                "Recovered unfinished run session {} ({}/{} runs); finalizing",
                session.id, session.runs_completed, session.max_runs
            );
            database.finalize_run_session(&session.id, Utc::now()).await?;
        }
    }
    Ok(())
}

async fn run_bench_session(mode: SweepMode) -> Result<()> {
    let data_dir = data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let settings = Arc::new(SettingsStore::new(data_dir.join("settings.json"))?);
    let database = Database::open(data_dir.join("tensiometer.sqlite3"))?;
    recover_open_sessions(&database).await?;

    let camera_settings = settings.camera();
    info!(
        "Simulated bench: camera {} at {}x{}, generator at GPIB address {}",
        camera_settings.index,
        camera_settings.width,
        camera_settings.height,
        settings.instrument().gpib_address
    );

    let model = DropletModel::default();
    let bench = BenchState::new(&model).shared();
    let generator = FunctionGenerator::new(Box::new(
        SimulatedInstrument::new(Arc::clone(&bench)).with_command_delay(BENCH_COMMAND_DELAY),
    ));
    let camera = SimulatedCamera::new(
        Arc::clone(&bench),
        model,
        camera_settings.width,
        camera_settings.height,
    )
    .with_noise(BENCH_SENSOR_NOISE);
    let display = SimulatedDisplay::new(camera_settings.width, camera_settings.height);

    let orchestrator = ControlOrchestrator::new(generator, settings, database)?;

    let mut events = orchestrator.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ControlEvent::RunExported { summary } => info!(
                    "Run {} exported: {} / {} rows",
                    summary.run_number, summary.compression_rows, summary.relaxation_rows
                ),
                ControlEvent::LoopSuspended { loop_name, reason } => {
                    error!("{loop_name} suspended: {reason}")
                }
                ControlEvent::ExportFailed { reason } => error!("Export failed: {reason}"),
                other => log::debug!("{}", serde_json::to_string(&other).unwrap_or_default()),
            }
        }
    });

    if debug_mode() {
        let mut telemetry = orchestrator.telemetry();
        tokio::spawn(async move {
            while telemetry.changed().await.is_ok() {
                let snapshot = telemetry.borrow_and_update().clone();
                info!("{}", serde_json::to_string(&snapshot).unwrap_or_default());
            }
        });
    }

    orchestrator.start(Box::new(camera), Some(Box::new(display))).await?;

    orchestrator.start_sweep(mode).await?;
    tokio::select! {
        result = orchestrator.wait_for_sweep() => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; stopping sweep");
            orchestrator.stop_sweep().await?;
        }
    }

    orchestrator.engage_pid()?;
    tokio::select! {
        _ = tokio::time::sleep(TRACKING_PERIOD) => {}
        _ = tokio::signal::ctrl_c() => warn!("Interrupted; leaving closed-loop tracking"),
    }
    if orchestrator.state() == ControlState::ClosedLoopTracking {
        orchestrator.disengage_pid()?;
    }

    let metrics = orchestrator.metrics().await;
    info!(
        "Frames captured {}, analysed {}, dropped {}, missed {}",
        metrics.frames_captured,
        metrics.analysis_count,
        metrics.frames_dropped,
        metrics.target_missed_count
    );

    orchestrator.shutdown().await
}

pub fn run() {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("Tensiometer starting up...");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("tensiometer")
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("Failed to start async runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run_bench_session(sweep_mode_from_args())) {
        error!("Bench session failed: {err:#}");
        std::process::exit(1);
    }
}
