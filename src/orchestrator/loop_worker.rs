use anyhow::{anyhow, Result};
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinError;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::events::{ControlEvent, DropletTelemetry};
use super::frame_slot::FrameSlot;
use super::state::{ControlAuthority, ControlState};
use crate::control::{PidController, RampOutcome, SweepDriver};
use crate::devices::{Camera, Display};
use crate::error::{TensiometerError, TensiometerResult};
use crate::metrics::{AnalysisMetrics, MetricsCollector};
use crate::series::{export_measurements, RunRecorder};
use crate::settings::{ElasticitySettings, SettingsStore};
use crate::vision::{annotate, lock_analyzer, Frame, FrameAnalysis, Recording, SharedAnalyzer};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

const GRAB_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(5);
const STANDARD_SWEEP_RUNS: u32 = 1;
const AMPLITUDE_EPSILON: f64 = 1e-9;

/// Everything the loops share. Cheap to clone.
#[derive(Clone)]
pub struct LoopContext {
    pub authority: Arc<ControlAuthority>,
    pub frames: FrameSlot,
    pub overlay: FrameSlot,
    pub analyzer: SharedAnalyzer,
    pub pid: Arc<Mutex<PidController>>,
    pub settings: Arc<SettingsStore>,
    pub recorder: Arc<RunRecorder>,
    pub telemetry: Arc<watch::Sender<DropletTelemetry>>,
    pub events: broadcast::Sender<ControlEvent>,
    pub metrics: MetricsCollector,
}

impl LoopContext {
    pub fn emit(&self, event: ControlEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn update_telemetry<F>(&self, update: F)
    where
        F: FnOnce(&mut DropletTelemetry),
    {
        self.telemetry.send_modify(update);
    }

    pub fn lock_pid(&self) -> MutexGuard<'_, PidController> {
        self.pid.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn suspend(&self, loop_name: &str, reason: String) {
        log_error!("{loop_name} loop suspended: {reason}");
        self.emit(ControlEvent::LoopSuspended {
            loop_name: loop_name.to_string(),
            reason,
        });
    }

    fn release(&self, from: ControlState) {
        if let Err(err) = self.authority.transition(from, ControlState::Idle) {
            log_warn!("could not release actuator: {err}");
        }
    }
}

/// Follows the frame slot and hands out each published frame at most once.
pub struct FrameCursor {
    rx: watch::Receiver<Option<Arc<Frame>>>,
    last_seq: Option<u64>,
}

impl FrameCursor {
    pub fn new(slot: &FrameSlot) -> Self {
        Self {
            rx: slot.subscribe(),
            last_seq: None,
        }
    }

    /// Newest unseen frame and the number of frames skipped to reach it.
    fn take_new(&mut self) -> Option<(Arc<Frame>, u64)> {
        let frame = self.rx.borrow_and_update().clone()?;
        if self.last_seq.is_some_and(|last| frame.seq <= last) {
            return None;
        }
        let skipped = self
            .last_seq
            .map(|last| frame.seq.saturating_sub(last + 1))
            .unwrap_or(0);
        self.last_seq = Some(frame.seq);
        Some((frame, skipped))
    }

    pub async fn next(&mut self, cancel: &CancellationToken) -> Option<(Arc<Frame>, u64)> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(next) = self.take_new() {
                return Some(next);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Like [`FrameCursor::next`], but gives up once the control state is no
    /// longer `required`.
    pub async fn next_while(
        &mut self,
        cancel: &CancellationToken,
        state: &mut watch::Receiver<ControlState>,
        required: ControlState,
    ) -> Option<(Arc<Frame>, u64)> {
        loop {
            if cancel.is_cancelled() || *state.borrow_and_update() != required {
                return None;
            }
            if let Some(next) = self.take_new() {
                return Some(next);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

/// Camera loop. Blocking; run it on `spawn_blocking`.
pub fn acquisition_loop(
    ctx: LoopContext,
    mut camera: Box<dyn Camera>,
    mut display: Option<Box<dyn Display>>,
    cancel: CancellationToken,
) -> Result<()> {
    if !camera.is_opened() && !camera.open() {
        let err = TensiometerError::DeviceUnavailable("camera failed to open".into());
        ctx.suspend("acquisition", err.to_string());
        return Err(err.into());
    }
    log_info!("acquisition loop started");

    let mut seq = 0u64;
    while !cancel.is_cancelled() {
        if !camera.grab() {
            if !camera.is_opened() {
                let err = TensiometerError::DeviceUnavailable("camera disconnected".into());
                ctx.suspend("acquisition", err.to_string());
                return Err(err.into());
            }
            std::thread::sleep(GRAB_RETRY_DELAY);
            continue;
        }
        let Some(image) = camera.read() else {
            continue;
        };

        seq += 1;
        let frame = ctx.frames.publish(Frame::new(seq, image));
        ctx.metrics.record_frame_captured();

        if let Some(display) = display.as_mut() {
            let (width, height) = display.viewport();
            if width > 0 && height > 0 {
                let shown = if ctx.authority.is_sweeping() {
                    ctx.overlay.latest().unwrap_or(frame)
                } else {
                    frame
                };
                display.render(&shown);
            }
        }
    }

    log_info!("acquisition loop shutting down after {seq} frames");
    Ok(())
}

/// Analyzes one frame off the async runtime and publishes the result to
/// telemetry, the overlay slot, events and metrics. Per-frame failures are
/// reported and yield `None`. The phase is read once the analyzer is held,
/// so a row lands in the series of the phase current when it is measured.
async fn run_analysis(
    ctx: &LoopContext,
    frame: Arc<Frame>,
    frames_skipped: u64,
    recording: Recording,
    consumer: &'static str,
) -> Option<FrameAnalysis> {
    let frame_seq = frame.seq;
    let analyzer = Arc::clone(&ctx.analyzer);
    let authority = Arc::clone(&ctx.authority);

    let joined = tokio::task::spawn_blocking(move || {
        let mut analyzer = lock_analyzer(&analyzer);
        let phase = authority.phase();
        let analysis = analyzer.analyze_frame(&frame, phase, recording)?;
        let height_above_node = analysis
            .measurement
            .as_ref()
            .map(|measurement| analyzer.height_above_node(measurement));
        drop(analyzer);
        let overlay = analysis
            .bounding_box
            .as_ref()
            .map(|bbox| annotate(&frame, bbox));
        Ok::<_, TensiometerError>((analysis, height_above_node, overlay))
    })
    .await;

    let (analysis, height_above_node, overlay) = match joined {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            log_warn!("{consumer}: frame {frame_seq} rejected: {err}");
            ctx.emit(ControlEvent::FrameRejected {
                frame_seq,
                reason: err.to_string(),
            });
            return None;
        }
        Err(err) => {
            log_error!("{consumer}: analysis worker failed: {err}");
            return None;
        }
    };

    if let Some(overlay) = overlay {
        ctx.overlay.publish(overlay);
    }

    match &analysis.measurement {
        Some(measurement) => {
            log_debug!(
                "{consumer}: frame {frame_seq} ratio={:?} centroid={:?} ({:.1} ms)",
                measurement.aspect_ratio,
                analysis.centroid,
                analysis.timings.total_ms()
            );
        }
        None => ctx.emit(ControlEvent::TargetNotFound { frame_seq }),
    }

    ctx.update_telemetry(|telemetry| {
        telemetry.frame_seq = Some(frame_seq);
        telemetry.phase = analysis.phase;
        if let Some(measurement) = &analysis.measurement {
            telemetry.centroid = analysis.centroid;
            telemetry.aspect_ratio = measurement.aspect_ratio;
            telemetry.height_above_node_um = height_above_node;
        }
        telemetry.updated_at = Some(Utc::now());
    });

    let (cpu_percent, memory_mb) = ctx.metrics.sample_system_metrics().await;
    ctx.metrics
        .record_analysis(AnalysisMetrics {
            timestamp: Utc::now(),
            consumer: consumer.to_string(),
            frame_seq,
            frames_skipped,
            preprocess_ms: analysis.timings.preprocess_ms,
            locate_ms: analysis.timings.locate_ms,
            measure_ms: analysis.timings.measure_ms,
            total_ms: analysis.timings.total_ms(),
            target_found: analysis.measurement.is_some(),
            cpu_percent,
            memory_mb,
        })
        .await;

    Some(analysis)
}

async fn export_run(ctx: &LoopContext, max_runs: u32) {
    match export_measurements(&ctx.analyzer, &ctx.recorder, max_runs).await {
        Ok(summary) => ctx.emit(ControlEvent::RunExported { summary }),
        Err(err) => ctx.emit(ControlEvent::ExportFailed {
            reason: err.to_string(),
        }),
    }
}

/// Measures every new frame while a standard sweep holds the actuator, then
/// exports the collected series. Also exports when stopped early.
pub async fn analysis_loop(ctx: LoopContext, cancel: CancellationToken) -> Result<()> {
    let mut frames = FrameCursor::new(&ctx.frames);
    let mut state = ctx.authority.subscribe();
    let mut analyzed = 0u64;

    while let Some((frame, skipped)) = frames
        .next_while(&cancel, &mut state, ControlState::Sweeping)
        .await
    {
        if run_analysis(&ctx, frame, skipped, Recording::Append, "analysis")
            .await
            .is_some()
        {
            analyzed += 1;
        }
    }

    log_info!("analysis loop stopping after {analyzed} frames");
    let collected = !lock_analyzer(&ctx.analyzer).store().is_empty();
    if collected {
        export_run(&ctx, STANDARD_SWEEP_RUNS).await;
    }
    Ok(())
}

async fn forward_instrument_readings(ctx: &LoopContext) {
    let authority = Arc::clone(&ctx.authority);
    let readings = tokio::task::spawn_blocking(move || {
        authority.query(|fg| Ok((fg.frequency()?, fg.amplitude()?)))
    })
    .await;

    match readings {
        Ok(Ok((frequency, amplitude))) => ctx.update_telemetry(|telemetry| {
            telemetry.frequency_hz = Some(frequency);
            telemetry.amplitude_vpp = Some(amplitude);
        }),
        Ok(Err(err)) => log_warn!("instrument readback failed: {err}"),
        Err(err) => log_error!("instrument readback worker failed: {err}"),
    }
}

fn ramp_result(
    ctx: &LoopContext,
    loop_name: &str,
    joined: std::result::Result<(SweepDriver, TensiometerResult<RampOutcome>), JoinError>,
) -> Result<(SweepDriver, RampOutcome)> {
    match joined {
        Ok((driver, Ok(outcome))) => Ok((driver, outcome)),
        Ok((_, Err(err))) => {
            ctx.suspend(loop_name, err.to_string());
            Err(err.into())
        }
        Err(err) => {
            ctx.suspend(loop_name, err.to_string());
            Err(anyhow!("{loop_name} ramp worker failed: {err}"))
        }
    }
}

/// Runs one amplitude ramp on a blocking worker while forwarding instrument
/// readings every telemetry interval.
async fn ramp_with_readback(
    ctx: &LoopContext,
    mut driver: SweepDriver,
    bounds: (f64, f64),
    reverse: bool,
    cancel: &CancellationToken,
) -> Result<(SweepDriver, RampOutcome)> {
    let interval_ms = ctx.settings.sweep().telemetry_interval_ms.max(1);
    let authority = Arc::clone(&ctx.authority);
    let ramp_cancel = cancel.clone();
    let mut ramp = tokio::task::spawn_blocking(move || {
        let result = driver.ramp(bounds.0, bounds.1, reverse, &ramp_cancel, |vpp| {
            authority.command(ControlState::Sweeping, |fg| fg.set_amplitude(vpp))
        });
        (driver, result)
    });

    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let joined = loop {
        tokio::select! {
            joined = &mut ramp => break joined,
            _ = ticker.tick() => forward_instrument_readings(ctx).await,
        }
    };
    ramp_result(ctx, "sweep", joined)
}

/// Standard open-loop sweep: one compress ramp and one relax ramp between
/// the configured bounds. Releases the actuator when done or cancelled.
pub async fn sweep_loop(ctx: LoopContext, cancel: CancellationToken) -> Result<()> {
    let settings = ctx.settings.sweep();
    let bounds = (settings.min_amplitude_vpp, settings.max_amplitude_vpp);
    let driver = SweepDriver::new(&settings, ctx.authority.phase_cell());
    log_info!(
        "sweep started: {:.5} -> {:.5} VPP in {} VPP steps",
        bounds.0,
        bounds.1,
        settings.step_vpp
    );

    let result = async {
        let (driver, up) = ramp_with_readback(&ctx, driver, bounds, false, &cancel).await?;
        if up.cancelled {
            return Ok(true);
        }
        let (_, down) = ramp_with_readback(&ctx, driver, bounds, true, &cancel).await?;
        Ok::<_, anyhow::Error>(down.cancelled)
    }
    .await;

    ctx.release(ControlState::Sweeping);
    let cancelled = *result.as_ref().unwrap_or(&true);
    log_info!("sweep finished (cancelled: {cancelled})");
    ctx.emit(ControlEvent::SweepFinished { cancelled });
    result.map(|_| ())
}

/// Ramps while measuring every new frame, for the elasticity study where
/// there is no separate analysis loop.
async fn ramp_while_measuring(
    ctx: &LoopContext,
    mut driver: SweepDriver,
    bounds: (f64, f64),
    reverse: bool,
    frames: &mut FrameCursor,
    cancel: &CancellationToken,
) -> Result<(SweepDriver, RampOutcome)> {
    let authority = Arc::clone(&ctx.authority);
    let ramp_cancel = cancel.clone();
    let mut ramp = tokio::task::spawn_blocking(move || {
        let result = driver.ramp(bounds.0, bounds.1, reverse, &ramp_cancel, |vpp| {
            authority.command(ControlState::Sweeping, |fg| fg.set_amplitude(vpp))
        });
        (driver, result)
    });

    let joined = loop {
        tokio::select! {
            joined = &mut ramp => break joined,
            next = frames.next(cancel) => match next {
                Some((frame, skipped)) => {
                    run_analysis(ctx, frame, skipped, Recording::Append, "elasticity").await;
                }
                None => break (&mut ramp).await,
            },
        }
    };
    ramp_result(ctx, "elasticity", joined)
}

async fn query_amplitude(ctx: &LoopContext) -> Result<f64> {
    let authority = Arc::clone(&ctx.authority);
    let amplitude = tokio::task::spawn_blocking(move || authority.query(|fg| fg.amplitude()))
        .await
        .map_err(|err| anyhow!("amplitude query worker failed: {err}"))??;
    ctx.update_telemetry(|telemetry| telemetry.amplitude_vpp = Some(amplitude));
    Ok(amplitude)
}

/// Waits out the settle period. False when cancelled first.
async fn settle(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Multi-run elasticity study. The first run compresses in fixed amplitude
/// increments until the droplet reaches the aspect-ratio limit, which fixes
/// the end amplitude; every later run repeats the same excursion. Each run is
/// exported under one run session.
pub async fn elasticity_loop(ctx: LoopContext, cancel: CancellationToken) -> Result<()> {
    let study = ctx.settings.elasticity();
    let max_runs = study.runs + 1;
    let driver = SweepDriver::new(&ctx.settings.sweep(), ctx.authority.phase_cell());
    let mut frames = FrameCursor::new(&ctx.frames);

    let result = run_elasticity_study(&ctx, &study, max_runs, driver, &mut frames, &cancel).await;

    let interrupted = cancel.is_cancelled() || result.is_err();
    if interrupted {
        let collected = !lock_analyzer(&ctx.analyzer).store().is_empty();
        if collected {
            export_run(&ctx, max_runs).await;
        }
        if let Err(err) = ctx.recorder.finish_session().await {
            log_error!("failed to close elasticity session: {err}");
        }
    }

    ctx.release(ControlState::Sweeping);
    ctx.emit(ControlEvent::SweepFinished {
        cancelled: interrupted,
    });
    result
}

async fn run_elasticity_study(
    ctx: &LoopContext,
    study: &ElasticitySettings,
    max_runs: u32,
    mut driver: SweepDriver,
    frames: &mut FrameCursor,
    cancel: &CancellationToken,
) -> Result<()> {
    let start_amplitude = query_amplitude(ctx).await?;
    let mut end_amplitude: Option<f64> = None;
    log_info!(
        "elasticity study: {max_runs} runs from {start_amplitude:.4} VPP, aspect limit {}",
        study.aspect_ratio_limit
    );

    for run in 1..=max_runs {
        let run_started = Instant::now();
        let mut stepped = false;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let amplitude = query_amplitude(ctx).await?;
            let latest_ratio = lock_analyzer(&ctx.analyzer).aspect_ratio();
            let done = match end_amplitude {
                None => {
                    stepped && latest_ratio.is_some_and(|ratio| ratio >= study.aspect_ratio_limit)
                }
                Some(end) => amplitude >= end - AMPLITUDE_EPSILON,
            };
            if done {
                break;
            }

            let ceiling = end_amplitude.unwrap_or(study.max_amplitude_vpp);
            let next = (amplitude + study.amplitude_step_vpp).min(ceiling);
            if next <= amplitude + AMPLITUDE_EPSILON {
                log_warn!("run {run}: amplitude ceiling {ceiling:.4} VPP reached before the aspect limit");
                break;
            }

            let (returned, outcome) =
                ramp_while_measuring(ctx, driver, (amplitude, next), false, frames, cancel).await?;
            driver = returned;
            stepped = true;
            if outcome.cancelled {
                return Ok(());
            }
        }

        let peak = query_amplitude(ctx).await?;
        let end = *end_amplitude.get_or_insert(peak);

        let (returned, outcome) =
            ramp_while_measuring(ctx, driver, (start_amplitude, end), true, frames, cancel).await?;
        driver = returned;
        if outcome.cancelled {
            return Ok(());
        }

        export_run(ctx, max_runs).await;
        log_info!(
            "elasticity run {run}/{max_runs} took {:.1}s",
            run_started.elapsed().as_secs_f64()
        );

        if run < max_runs && !settle(Duration::from_secs(study.settle_secs), cancel).await {
            return Ok(());
        }
    }

    let authority = Arc::clone(&ctx.authority);
    if let Ok(Err(err)) = tokio::task::spawn_blocking(move || authority.query(|fg| fg.beep())).await {
        log_warn!("completion beep failed: {err}");
    }
    Ok(())
}

/// Closed-loop tracking. Started once; idles while another state owns the
/// actuator and resumes when tracking is engaged.
pub async fn pid_loop(ctx: LoopContext, cancel: CancellationToken) -> Result<()> {
    let mut state = ctx.authority.subscribe();
    let mut frames = FrameCursor::new(&ctx.frames);

    loop {
        if *state.borrow_and_update() != ControlState::ClosedLoopTracking {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        }

        let Some((frame, skipped)) = frames
            .next_while(&cancel, &mut state, ControlState::ClosedLoopTracking)
            .await
        else {
            if cancel.is_cancelled() {
                break;
            }
            continue;
        };

        ctx.lock_pid().start_sample(Instant::now());
        let Some(analysis) =
            run_analysis(&ctx, frame, skipped, Recording::FeedbackOnly, "pid").await
        else {
            continue;
        };
        let ratio = match analysis.feedback_ratio() {
            Ok(ratio) => ratio,
            Err(err) => {
                log_debug!("pid: no feedback for frame {}: {err}", analysis.frame_seq);
                continue;
            }
        };

        let (output, reached) = {
            let mut pid = ctx.lock_pid();
            let output = pid.evaluate(ratio);
            (output, pid.setpoint_reached())
        };

        let authority = Arc::clone(&ctx.authority);
        let commanded = tokio::task::spawn_blocking(move || {
            authority.command(ControlState::ClosedLoopTracking, |fg| {
                let frequency = fg.frequency()? + output;
                fg.set_frequency(frequency)?;
                Ok(frequency)
            })
        })
        .await;

        match commanded {
            Ok(Ok(frequency)) => {
                log_debug!("pid: ratio {ratio:.4} -> output {output:+.4}, {frequency:.3} Hz");
                ctx.update_telemetry(|telemetry| {
                    telemetry.pid_output = Some(output);
                    telemetry.frequency_hz = Some(frequency);
                    telemetry.setpoint_reached = reached;
                });
            }
            Ok(Err(TensiometerError::ActuatorNotOwned { owner, .. })) => {
                log_info!("pid: tracking released ({owner:?} now owns the actuator)");
            }
            Ok(Err(err)) => {
                ctx.suspend("pid", err.to_string());
                ctx.release(ControlState::ClosedLoopTracking);
            }
            Err(err) => {
                ctx.suspend("pid", err.to_string());
                ctx.release(ControlState::ClosedLoopTracking);
            }
        }
    }

    log_info!("pid loop shutting down");
    Ok(())
}

/// Mirrors control-state changes into telemetry and the event stream.
pub async fn state_relay(ctx: LoopContext, cancel: CancellationToken) -> Result<()> {
    let mut state = ctx.authority.subscribe();
    loop {
        let current = *state.borrow_and_update();
        ctx.update_telemetry(|telemetry| telemetry.state = current);
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = *state.borrow();
                ctx.emit(ControlEvent::StateChanged { state: next });
            }
        }
    }
    Ok(())
}
