use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use instrument::{
    dut::{parse_mib_report, to_whole_mhz},
    DutConnector, DutLink, PlayCommand, SettleTimer, SignalGenerator,
};
use shared::{
    domain::{
        ConnectionState, MibCounters, PlaybackParams, PlaybackState, SessionSnapshot, SweepId,
        SweepState, WaveformHandle,
    },
    error::{ErrorKind, ErrorReport, SessionError},
    protocol::{SessionEvent, SweepOutcome},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{error, info, warn};

mod session;
pub mod sweep;
pub mod translator;
pub mod waveform_source;

pub use session::{Capabilities, Enablement};
pub use sweep::{SweepPlan, SweepRequest, SweepSettings};
pub use translator::PlaybackRequest;
pub use waveform_source::SourceParams;

use session::Session;
use sweep::{run_sweep, CancelFlag, StepExecutor, SweepRun, SweepStep};

pub type Result<T> = std::result::Result<T, SessionError>;

pub const DEFAULT_SWEEP_BURST_COUNT: u32 = 1000;
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    pub capabilities: Capabilities,
    /// Bursts played at each sweep power level.
    pub sweep_burst_count: u32,
    pub event_capacity: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            capabilities: Capabilities::default(),
            sweep_burst_count: DEFAULT_SWEEP_BURST_COUNT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

struct ActiveSweep {
    id: SweepId,
    cancel: CancelFlag,
}

/// Handle to a sweep started by [`SessionController::start_sweep`].
#[derive(Debug)]
pub struct SweepTicket {
    pub id: SweepId,
    pub total_steps: u32,
    handle: JoinHandle<SweepOutcome>,
}

impl SweepTicket {
    /// Waits for the sweep task to return its outcome.
    pub async fn finished(self) -> SweepOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(err) => SweepOutcome::Failed {
                step_index: 0,
                error: ErrorReport::new(
                    ErrorKind::SweepStepFailed,
                    format!("sweep task ended abnormally: {err}"),
                ),
            },
        }
    }
}

/// The one gate for everything that touches the instrument.
pub struct SessionController {
    generator: Arc<dyn SignalGenerator>,
    dut_connector: Arc<dyn DutConnector>,
    settle: Arc<dyn SettleTimer>,
    options: ControllerOptions,
    session: Mutex<Session>,
    // Kept outside `session` so cancelling never waits on an instrument call.
    active_sweep: Mutex<Option<ActiveSweep>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    pub fn new(
        generator: Arc<dyn SignalGenerator>,
        dut_connector: Arc<dyn DutConnector>,
        settle: Arc<dyn SettleTimer>,
        options: ControllerOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        Arc::new(Self {
            generator,
            dut_connector,
            settle,
            options,
            session: Mutex::new(Session::default()),
            active_sweep: Mutex::new(None),
            events,
        })
    }

    pub fn capabilities(&self) -> Capabilities {
        self.options.capabilities
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn report(&self, err: &SessionError) {
        match err.kind() {
            ErrorKind::InvalidInput | ErrorKind::IllegalTransition => {
                warn!(error = %err, "session: request rejected")
            }
            _ => error!(error = %err, "session: instrument call failed"),
        }
        self.emit(SessionEvent::Error(ErrorReport::from(err)));
    }

    fn reported<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.report(err);
        }
        result
    }

    pub async fn connect(&self, ip: &str) -> Result<String> {
        let result = self.connect_inner(ip.trim()).await;
        self.reported(result)
    }

    async fn connect_inner(&self, ip: &str) -> Result<String> {
        if ip.is_empty() {
            return Err(SessionError::invalid_input("ip", "address must not be empty"));
        }

        {
            let mut session = self.session.lock().await;
            if matches!(session.connection, ConnectionState::Connecting) {
                return Err(SessionError::illegal("connect", "a connection is in progress"));
            }
            session.require_sweep_idle("connect")?;

            if session.connection.is_connected() {
                info!("session: dropping previous instrument link");
                if let Err(err) = self.generator.stop().await {
                    warn!(error = %err, "session: stop before reconnect failed");
                }
                if let Err(err) = self.generator.disconnect().await {
                    warn!(error = %err, "session: disconnect before reconnect failed");
                }
                let had_waveform = session.waveform.is_some();
                session.reset_link();
                if had_waveform {
                    self.emit(SessionEvent::WaveformCleared {
                        reason: "instrument reconnected".into(),
                    });
                }
            }

            session.connection = ConnectionState::Connecting;
            self.emit(SessionEvent::ConnectionChanged(ConnectionState::Connecting));
        }

        info!(ip, "session: connecting");
        let outcome = self.generator.connect(ip).await;

        let mut session = self.session.lock().await;
        match outcome {
            Ok(identity) => {
                info!(ip, identity = %identity, "session: connected");
                session.connection = ConnectionState::Connected {
                    identity: identity.clone(),
                };
                self.emit(SessionEvent::ConnectionChanged(session.connection.clone()));
                Ok(identity)
            }
            Err(err) => {
                session.connection = ConnectionState::ConnectFailed {
                    reason: err.to_string(),
                };
                self.emit(SessionEvent::ConnectionChanged(session.connection.clone()));
                Err(SessionError::ConnectFailed {
                    ip: ip.to_string(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Always ends `Disconnected`; a failing disconnect call is reported
    /// after the session has been reset.
    pub async fn disconnect(&self) -> Result<()> {
        let result = self.disconnect_inner().await;
        self.reported(result)
    }

    async fn disconnect_inner(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        session.require_connected("disconnect")?;
        session.require_sweep_idle("disconnect")?;

        let outcome = self.generator.disconnect().await;
        let had_waveform = session.waveform.is_some();
        session.reset_link();
        if had_waveform {
            self.emit(SessionEvent::WaveformCleared {
                reason: "instrument disconnected".into(),
            });
        }
        self.emit(SessionEvent::ConnectionChanged(ConnectionState::Disconnected));
        info!("session: disconnected");

        outcome.map_err(|err| SessionError::DisconnectFailed(err.to_string()))
    }

    /// Loads `path`, replacing the current waveform. Any failure leaves no
    /// waveform loaded and stops playback that was running against it.
    pub async fn load_waveform(
        &self,
        path: impl AsRef<Path>,
        params: Option<SourceParams>,
    ) -> Result<WaveformHandle> {
        let result = self.load_waveform_inner(path.as_ref(), params).await;
        self.reported(result)
    }

    async fn load_waveform_inner(
        &self,
        path: &Path,
        params: Option<SourceParams>,
    ) -> Result<WaveformHandle> {
        let mut session = self.session.lock().await;
        session.require_connected("load_waveform")?;
        session.require_sweep_idle("load_waveform")?;
        self.replace_waveform(&mut session, path, params).await
    }

    /// Rebuilds a MATLAB-derived waveform after its bandwidth or frame
    /// interval changed. Returns `Ok(None)` when nothing needed rebuilding.
    pub async fn on_dependent_param_changed(
        &self,
        params: SourceParams,
    ) -> Result<Option<WaveformHandle>> {
        let result = self.reload_waveform(params).await;
        self.reported(result)
    }

    async fn reload_waveform(&self, params: SourceParams) -> Result<Option<WaveformHandle>> {
        let mut session = self.session.lock().await;
        let Some(path) = waveform_source::reload_target(session.waveform.as_ref()) else {
            return Ok(None);
        };
        session.require_connected("reload_waveform")?;
        session.require_sweep_idle("reload_waveform")?;

        info!(path = %path.display(), "session: source parameters changed, rebuilding");
        let handle = self
            .replace_waveform(&mut session, &path, Some(params))
            .await?;
        Ok(Some(handle))
    }

    async fn replace_waveform(
        &self,
        session: &mut Session,
        path: &Path,
        params: Option<SourceParams>,
    ) -> Result<WaveformHandle> {
        let kind = waveform_source::classify(path);
        match waveform_source::load(self.generator.as_ref(), path, kind, params).await {
            Ok(handle) => {
                session.waveform = Some(handle.clone());
                self.emit(SessionEvent::WaveformLoaded(handle.clone()));
                Ok(handle)
            }
            Err(err) => {
                if session.waveform.take().is_some() {
                    self.emit(SessionEvent::WaveformCleared {
                        reason: err.to_string(),
                    });
                }
                // Playback never outlives the waveform it was started with.
                if session.playback.is_playing() {
                    if let Err(stop_err) = self.generator.stop().await {
                        warn!(error = %stop_err, "session: stop after failed load failed");
                    }
                    session.playback = PlaybackState::Idle;
                    self.emit(SessionEvent::PlaybackStopped);
                    info!("session: playback stopped, waveform invalidated");
                }
                Err(err)
            }
        }
    }

    /// Writes the reconstructed form of a MATLAB-derived waveform to `dest`.
    pub async fn export_waveform(&self, dest: impl AsRef<Path>) -> Result<PathBuf> {
        let result = self.export_waveform_inner(dest.as_ref()).await;
        self.reported(result)
    }

    async fn export_waveform_inner(&self, dest: &Path) -> Result<PathBuf> {
        if !self.options.capabilities.export {
            return Err(SessionError::illegal(
                "export_waveform",
                "export is not enabled",
            ));
        }
        let session = self.session.lock().await;
        session.require_connected("export_waveform")?;
        let handle = waveform_source::ensure_exportable(session.waveform.as_ref())?;

        self.generator
            .export_waveform(dest)
            .await
            .map_err(|err| SessionError::ExportFailed {
                path: dest.display().to_string(),
                reason: err.to_string(),
            })?;
        info!(source = %handle.file_name, dest = %dest.display(), "session: waveform exported");
        self.emit(SessionEvent::WaveformExported {
            dest_path: dest.to_path_buf(),
        });
        Ok(dest.to_path_buf())
    }

    pub async fn play(&self, request: &PlaybackRequest) -> Result<PlaybackParams> {
        let result = self.play_inner(request).await;
        self.reported(result)
    }

    async fn play_inner(&self, request: &PlaybackRequest) -> Result<PlaybackParams> {
        let mut session = self.session.lock().await;
        session.require_connected("play")?;
        session.require_waveform("play")?;
        session.require_sweep_idle("play")?;

        let params = request.resolve(self.options.capabilities.cable_loss)?;
        self.generator
            .play(PlayCommand {
                center_freq_hz: params.center_freq_hz,
                bandwidth_hz: params.bandwidth_hz,
                tx_power_dbm: params.tx_power_dbm(),
                repeat_count: params.repeat_count,
            })
            .await
            .map_err(|err| SessionError::PlayFailed(err.to_string()))?;

        info!(
            center_freq_hz = params.center_freq_hz,
            tx_power_dbm = params.tx_power_dbm(),
            repeat_count = params.repeat_count,
            "session: playing"
        );
        session.playback = PlaybackState::Playing(params);
        self.emit(SessionEvent::PlaybackStarted(params));
        Ok(params)
    }

    /// Idempotent. Playback is `Idle` afterwards even if the stop call fails.
    pub async fn stop(&self) -> Result<()> {
        let result = self.stop_inner().await;
        self.reported(result)
    }

    async fn stop_inner(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        session.require_connected("stop")?;

        session.playback = PlaybackState::Stopping;
        let outcome = self.generator.stop().await;
        session.playback = PlaybackState::Idle;
        self.emit(SessionEvent::PlaybackStopped);
        info!("session: playback stopped");

        outcome.map_err(|err| SessionError::StopFailed(err.to_string()))
    }

    /// Validates the request and spawns the sweep task. Active playback is
    /// taken over by the sweep.
    pub async fn start_sweep(self: &Arc<Self>, request: &SweepRequest) -> Result<SweepTicket> {
        let result = self.start_sweep_inner(request).await;
        self.reported(result)
    }

    async fn start_sweep_inner(self: &Arc<Self>, request: &SweepRequest) -> Result<SweepTicket> {
        if !self.options.capabilities.sweep {
            return Err(SessionError::illegal("start_sweep", "sweep is not enabled"));
        }

        let mut session = self.session.lock().await;
        session.require_connected("start_sweep")?;
        session.require_waveform("start_sweep")?;
        session.require_sweep_idle("start_sweep")?;

        let settings = request.resolve(self.options.capabilities.cable_loss)?;
        let run = SweepRun::new(settings, self.options.sweep_burst_count);
        let status = run.status();

        session.playback = PlaybackState::Idle;
        session.sweep = SweepState::Running(status);
        *self.active_sweep.lock().await = Some(ActiveSweep {
            id: run.id,
            cancel: run.cancel_flag(),
        });
        let dut = session.dut.clone();
        drop(session);

        info!(
            sweep = %status.id,
            start_dbm = status.start_dbm,
            end_dbm = status.end_dbm,
            step_db = status.step_db,
            total_steps = status.total_steps,
            "session: sweep starting"
        );
        self.emit(SessionEvent::SweepStarted(status));

        let controller = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let id = run.id;
            let executor = ControllerStepExecutor {
                controller: Arc::clone(&controller),
                dut,
            };
            let outcome = run_sweep(
                run,
                &executor,
                controller.settle.as_ref(),
                &controller.events,
            )
            .await;
            controller.finish_sweep(id, &outcome).await;
            outcome
        });

        Ok(SweepTicket {
            id: status.id,
            total_steps: status.total_steps,
            handle,
        })
    }

    /// Leaves RF off and the session idle whatever the outcome was.
    async fn finish_sweep(&self, id: SweepId, outcome: &SweepOutcome) {
        {
            let mut session = self.session.lock().await;
            if session.connection.is_connected() {
                if let Err(err) = self.generator.stop().await {
                    warn!(sweep = %id, error = %err, "session: stop after sweep failed");
                }
            }
            if session.sweep.status().is_some_and(|status| status.id == id) {
                session.sweep = SweepState::Idle;
            }
            session.playback = PlaybackState::Idle;

            let mut active = self.active_sweep.lock().await;
            if active.as_ref().is_some_and(|sweep| sweep.id == id) {
                *active = None;
            }
        }

        match outcome {
            SweepOutcome::Completed { steps } => {
                info!(sweep = %id, steps, "session: sweep finished")
            }
            SweepOutcome::Cancelled { completed_steps } => {
                info!(sweep = %id, completed_steps, "session: sweep cancelled")
            }
            SweepOutcome::Failed { step_index, error } => {
                error!(sweep = %id, step_index, error = %error.message, "session: sweep failed");
                self.emit(SessionEvent::Error(error.clone()));
            }
        }
        self.emit(SessionEvent::SweepFinished {
            sweep_id: id,
            outcome: outcome.clone(),
        });
    }

    /// Requests cancellation; the sweep stops at its next step boundary.
    pub async fn cancel_sweep(&self) -> Result<SweepId> {
        let result = self.cancel_sweep_inner().await;
        self.reported(result)
    }

    async fn cancel_sweep_inner(&self) -> Result<SweepId> {
        let active = self.active_sweep.lock().await;
        match active.as_ref() {
            Some(sweep) if !sweep.cancel.is_cancelled() => {
                sweep.cancel.cancel();
                info!(sweep = %sweep.id, "session: sweep cancel requested");
                Ok(sweep.id)
            }
            Some(_) => Err(SessionError::illegal(
                "cancel_sweep",
                "cancellation already requested",
            )),
            None => Err(SessionError::illegal("cancel_sweep", "no sweep is running")),
        }
    }

    /// Attaches the receiver whose statistics are read back during sweeps.
    pub async fn connect_dut(&self, ip: &str) -> Result<()> {
        let result = self.connect_dut_inner(ip.trim()).await;
        self.reported(result)
    }

    async fn connect_dut_inner(&self, ip: &str) -> Result<()> {
        if !self.options.capabilities.sweep {
            return Err(SessionError::illegal("connect_dut", "sweep is not enabled"));
        }
        if ip.is_empty() {
            return Err(SessionError::invalid_input(
                "dut ip",
                "address must not be empty",
            ));
        }
        let mut session = self.session.lock().await;
        session.require_sweep_idle("connect_dut")?;

        let link = self
            .dut_connector
            .connect(ip)
            .await
            .map_err(|err| SessionError::DutFailed(err.to_string()))?;
        session.dut = Some(link);
        info!(ip, "session: DUT attached");
        self.emit(SessionEvent::DutChanged {
            ip: Some(ip.to_string()),
        });
        Ok(())
    }

    pub async fn disconnect_dut(&self) -> Result<()> {
        let result = self.disconnect_dut_inner().await;
        self.reported(result)
    }

    async fn disconnect_dut_inner(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        session.require_sweep_idle("disconnect_dut")?;
        if session.dut.take().is_none() {
            return Err(SessionError::illegal("disconnect_dut", "no DUT attached"));
        }
        info!("session: DUT detached");
        self.emit(SessionEvent::DutChanged { ip: None });
        Ok(())
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let mut snapshot = self.session.lock().await.snapshot();
        if let SweepState::Running(status) = snapshot.sweep {
            let cancelling = self
                .active_sweep
                .lock()
                .await
                .as_ref()
                .is_some_and(|sweep| sweep.id == status.id && sweep.cancel.is_cancelled());
            if cancelling {
                snapshot.sweep = SweepState::Cancelling(status);
            }
        }
        snapshot
    }

    pub async fn enablement(&self) -> Enablement {
        Enablement::project(&self.snapshot().await, &self.options.capabilities)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Events as a stream. Gaps from a slow consumer are skipped.
    pub fn event_stream(&self) -> BoxStream<'static, SessionEvent> {
        BroadcastStream::new(self.events.subscribe())
            .filter_map(|item| async move {
                match item {
                    Ok(event) => Some(event),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "session: event consumer lagged");
                        None
                    }
                }
            })
            .boxed()
    }
}

/// Drives one sweep step through the session so it serializes with every
/// other instrument call.
struct ControllerStepExecutor {
    controller: Arc<SessionController>,
    dut: Option<Arc<dyn DutLink>>,
}

#[async_trait]
impl StepExecutor for ControllerStepExecutor {
    async fn apply(&self, step: &SweepStep) -> Result<()> {
        let mut session = self.controller.session.lock().await;
        session.require_connected("sweep step")?;

        if let Some(dut) = &self.dut {
            dut.open_rx(
                to_whole_mhz(step.command.center_freq_hz),
                to_whole_mhz(step.command.bandwidth_hz),
            )
            .await
            .map_err(|err| SessionError::DutFailed(format!("open rx: {err}")))?;
        }

        self.controller
            .generator
            .play(step.command)
            .await
            .map_err(|err| SessionError::PlayFailed(err.to_string()))?;

        if let SweepState::Running(status) = &mut session.sweep {
            if status.id == step.sweep_id {
                status.current_step_index = step.index;
            }
        }
        info!(
            sweep = %step.sweep_id,
            step = step.index,
            power_dbm = step.power_dbm,
            tx_power_dbm = step.tx_power_dbm,
            "session: sweep step applied"
        );
        Ok(())
    }

    async fn collect(&self, step: &SweepStep) -> Result<Option<MibCounters>> {
        let Some(dut) = &self.dut else {
            return Ok(None);
        };
        let _session = self.controller.session.lock().await;
        let cf_mhz = to_whole_mhz(step.command.center_freq_hz);
        let report = dut
            .read_mib(cf_mhz)
            .await
            .map_err(|err| SessionError::DutFailed(format!("read mib: {err}")))?;
        dut.close_rx(cf_mhz)
            .await
            .map_err(|err| SessionError::DutFailed(format!("close rx: {err}")))?;
        Ok(Some(parse_mib_report(
            &report,
            to_whole_mhz(step.command.bandwidth_hz),
        )))
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
