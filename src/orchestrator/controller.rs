use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::events::{ControlEvent, DropletTelemetry};
use super::frame_slot::FrameSlot;
use super::loop_worker::{
    acquisition_loop, analysis_loop, elasticity_loop, pid_loop, state_relay, sweep_loop,
    LoopContext,
};
use super::state::{ControlAuthority, ControlState};
use crate::control::{Phase, PidController, PidGains};
use crate::db::Database;
use crate::devices::{Camera, Display, FunctionGenerator};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::series::{RunRecorder, RunSession};
use crate::settings::SettingsStore;
use crate::vision::{lock_analyzer, Centroid, DropletAnalyzer, Frame};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SweepMode {
    /// One compress/relax cycle between the configured amplitude bounds.
    Standard,
    /// Repeated compress/relax runs sized by the aspect-ratio limit.
    Elasticity,
}

struct LoopHandle {
    name: &'static str,
    handle: JoinHandle<Result<()>>,
    cancel: CancellationToken,
}

impl LoopHandle {
    fn spawn<F>(name: &'static str, cancel: CancellationToken, future: F) -> Self
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name,
            handle: tokio::spawn(future),
            cancel,
        }
    }

    async fn join(self) -> Result<()> {
        self.handle
            .await
            .with_context(|| format!("{} loop task failed to join", self.name))?
    }

    async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.join().await
    }
}

#[derive(Default)]
struct Workers {
    acquisition: Option<LoopHandle>,
    relay: Option<LoopHandle>,
    pid: Option<LoopHandle>,
    sweep: Option<LoopHandle>,
    analysis: Option<LoopHandle>,
}

/// Owns the loops and the shared state they coordinate through.
///
/// The acquisition, PID and state-relay loops run from [`start`] until
/// [`shutdown`]. Sweep loops come and go with each sweep. All actuator
/// access is arbitrated by the [`ControlAuthority`].
///
/// [`start`]: ControlOrchestrator::start
/// [`shutdown`]: ControlOrchestrator::shutdown
pub struct ControlOrchestrator {
    ctx: LoopContext,
    workers: AsyncMutex<Workers>,
    shutdown: CancellationToken,
}

impl ControlOrchestrator {
    pub fn new(
        generator: FunctionGenerator,
        settings: Arc<SettingsStore>,
        db: Database,
    ) -> Result<Self> {
        let analyzer = DropletAnalyzer::new(&settings.vision())
            .context("invalid vision settings")?
            .shared();
        let pid = PidController::from_settings(&settings.pid());
        let (telemetry, _) = watch::channel(DropletTelemetry::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            ctx: LoopContext {
                authority: Arc::new(ControlAuthority::new(generator)),
                frames: FrameSlot::new(),
                overlay: FrameSlot::new(),
                analyzer,
                pid: Arc::new(Mutex::new(pid)),
                settings,
                recorder: Arc::new(RunRecorder::new(db)),
                telemetry: Arc::new(telemetry),
                events,
                metrics: MetricsCollector::new(),
            },
            workers: AsyncMutex::new(Workers::default()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Starts acquisition plus the long-lived PID and state-relay loops.
    pub async fn start(
        &self,
        camera: Box<dyn Camera>,
        display: Option<Box<dyn Display>>,
    ) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if workers.acquisition.is_some() {
            bail!("acquisition already running");
        }

        let cancel = self.shutdown.child_token();
        let ctx = self.ctx.clone();
        let token = cancel.clone();
        workers.acquisition = Some(LoopHandle {
            name: "acquisition",
            handle: tokio::task::spawn_blocking(move || {
                acquisition_loop(ctx, camera, display, token)
            }),
            cancel,
        });

        let cancel = self.shutdown.child_token();
        workers.relay = Some(LoopHandle::spawn(
            "state relay",
            cancel.clone(),
            state_relay(self.ctx.clone(), cancel),
        ));

        let cancel = self.shutdown.child_token();
        workers.pid = Some(LoopHandle::spawn(
            "pid",
            cancel.clone(),
            pid_loop(self.ctx.clone(), cancel),
        ));

        log_info!("orchestrator started");
        Ok(())
    }

    /// Takes the actuator for a sweep. Fails with an illegal transition if
    /// tracking is engaged or a sweep is already running.
    pub async fn start_sweep(&self, mode: SweepMode) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if self.ctx.authority.state() == ControlState::Idle {
            // A previous sweep may have released the actuator but still be exporting
            let leftovers = [workers.sweep.take(), workers.analysis.take()];
            for handle in leftovers.into_iter().flatten() {
                let name = handle.name;
                if let Err(err) = handle.join().await {
                    log_warn!("previous {name} loop ended with error: {err:#}");
                }
            }
        }

        self.ctx
            .authority
            .transition(ControlState::Idle, ControlState::Sweeping)?;

        let cancel = self.shutdown.child_token();
        match mode {
            SweepMode::Standard => {
                let analysis_cancel = self.shutdown.child_token();
                workers.analysis = Some(LoopHandle::spawn(
                    "analysis",
                    analysis_cancel.clone(),
                    analysis_loop(self.ctx.clone(), analysis_cancel),
                ));
                workers.sweep = Some(LoopHandle::spawn(
                    "sweep",
                    cancel.clone(),
                    sweep_loop(self.ctx.clone(), cancel),
                ));
            }
            SweepMode::Elasticity => {
                workers.sweep = Some(LoopHandle::spawn(
                    "elasticity",
                    cancel.clone(),
                    elasticity_loop(self.ctx.clone(), cancel),
                ));
            }
        }

        log_info!("{mode:?} sweep started");
        Ok(())
    }

    /// Cancels the running sweep and waits for its data to be exported.
    pub async fn stop_sweep(&self) -> Result<()> {
        let (sweep, analysis) = {
            let mut workers = self.workers.lock().await;
            (workers.sweep.take(), workers.analysis.take())
        };
        let swept = match sweep {
            Some(sweep) => sweep.stop().await,
            None => Ok(()),
        };
        let analyzed = match analysis {
            Some(analysis) => analysis.join().await,
            None => Ok(()),
        };
        swept.and(analyzed)
    }

    /// Stops measuring (and exports) while any ramp keeps running.
    pub async fn stop_analysis(&self) -> Result<()> {
        let analysis = self.workers.lock().await.analysis.take();
        match analysis {
            Some(analysis) => analysis.stop().await,
            None => Ok(()),
        }
    }

    /// Waits for the current sweep to finish on its own.
    pub async fn wait_for_sweep(&self) -> Result<()> {
        let (sweep, analysis) = {
            let mut workers = self.workers.lock().await;
            (workers.sweep.take(), workers.analysis.take())
        };
        let swept = match sweep {
            Some(sweep) => sweep.join().await,
            None => Ok(()),
        };
        let analyzed = match analysis {
            Some(analysis) => analysis.join().await,
            None => Ok(()),
        };
        swept.and(analyzed)
    }

    pub fn engage_pid(&self) -> Result<()> {
        self.ctx
            .authority
            .transition(ControlState::Idle, ControlState::ClosedLoopTracking)?;
        log_info!("closed-loop tracking engaged");
        Ok(())
    }

    pub fn disengage_pid(&self) -> Result<()> {
        self.ctx
            .authority
            .transition(ControlState::ClosedLoopTracking, ControlState::Idle)?;
        log_info!("closed-loop tracking disengaged");
        Ok(())
    }

    /// Applies new gains to the live controller and persists them. Takes
    /// effect on the next evaluation.
    pub fn set_pid_gains(&self, gains: PidGains) -> Result<()> {
        self.ctx
            .settings
            .update_pid_gains(gains.kp, gains.ki, gains.kd)?;
        self.ctx.lock_pid().set_gains(gains);
        Ok(())
    }

    pub fn set_setpoint(&self, setpoint: f64) -> Result<()> {
        if !setpoint.is_finite() {
            bail!("setpoint must be finite");
        }
        self.ctx.settings.update_setpoint(setpoint)?;
        self.ctx.lock_pid().set_setpoint(setpoint);
        Ok(())
    }

    pub fn pid_gains(&self) -> PidGains {
        self.ctx.lock_pid().gains()
    }

    pub fn state(&self) -> ControlState {
        self.ctx.authority.state()
    }

    pub fn is_sweeping(&self) -> bool {
        self.ctx.authority.is_sweeping()
    }

    pub fn phase(&self) -> Phase {
        self.ctx.authority.phase()
    }

    pub fn centroid(&self) -> Option<Centroid> {
        lock_analyzer(&self.ctx.analyzer).centroid()
    }

    pub fn aspect_ratio(&self) -> Option<f64> {
        lock_analyzer(&self.ctx.analyzer).aspect_ratio()
    }

    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.ctx.frames.latest()
    }

    pub fn telemetry(&self) -> watch::Receiver<DropletTelemetry> {
        self.ctx.telemetry.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ControlEvent> {
        self.ctx.events.subscribe()
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.get_snapshot().await
    }

    pub async fn active_session(&self) -> Option<RunSession> {
        self.ctx.recorder.active_session().await
    }

    pub fn database(&self) -> &Database {
        self.ctx.recorder.database()
    }

    pub async fn beep(&self) -> Result<()> {
        let authority = Arc::clone(&self.ctx.authority);
        tokio::task::spawn_blocking(move || authority.query(|fg| fg.beep()))
            .await
            .context("beep worker failed")??;
        Ok(())
    }

    /// Stops every loop. Sweep data collected so far is exported first.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop_sweep().await?;
        if self.state() == ControlState::ClosedLoopTracking {
            self.disengage_pid()?;
        }
        self.shutdown.cancel();

        let mut workers = self.workers.lock().await;
        for handle in [
            workers.pid.take(),
            workers.relay.take(),
            workers.acquisition.take(),
        ]
        .into_iter()
        .flatten()
        {
            let name = handle.name;
            if let Err(err) = handle.join().await {
                log_warn!("{name} loop ended with error: {err:#}");
            }
        }
        log_info!("orchestrator stopped");
        Ok(())
    }
}
