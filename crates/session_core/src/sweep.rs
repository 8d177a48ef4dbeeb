//! Output-power sweep: the step plan and the cancellable loop that walks it.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use instrument::{PlayCommand, SettleTimer};
use shared::{
    domain::{MibCounters, SweepId, SweepStatus},
    error::{ErrorReport, SessionError},
    protocol::{SessionEvent, SweepOutcome, SweepProgress},
};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::translator::{compute_tx_power, parse_cable_loss, parse_power, resolve_tuning};

/// Absorbs floating-point noise in `(end - start) / step`.
const STEP_COUNT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepPlan {
    start_dbm: f64,
    end_dbm: f64,
    step_db: f64,
    total_steps: u32,
}

impl SweepPlan {
    pub fn new(start_dbm: f64, end_dbm: f64, step_db: f64) -> Result<Self, SessionError> {
        if !(start_dbm.is_finite() && end_dbm.is_finite() && step_db.is_finite()) {
            return Err(SessionError::invalid_input(
                "sweep range",
                "powers and step must be numbers",
            ));
        }
        if start_dbm >= end_dbm {
            return Err(SessionError::invalid_input(
                "sweep range",
                format!("start power {start_dbm} dBm must be below end power {end_dbm} dBm"),
            ));
        }
        if step_db <= 0.0 {
            return Err(SessionError::invalid_input(
                "sweep step",
                "step must be greater than zero",
            ));
        }

        let intervals = ((end_dbm - start_dbm) / step_db - STEP_COUNT_TOLERANCE)
            .ceil()
            .max(1.0);
        if intervals >= f64::from(u32::MAX) {
            return Err(SessionError::invalid_input(
                "sweep step",
                format!("step {step_db} dB is too small for the range"),
            ));
        }

        Ok(Self {
            start_dbm,
            end_dbm,
            step_db,
            total_steps: intervals as u32 + 1,
        })
    }

    pub fn start_dbm(&self) -> f64 {
        self.start_dbm
    }

    pub fn end_dbm(&self) -> f64 {
        self.end_dbm
    }

    pub fn step_db(&self) -> f64 {
        self.step_db
    }

    pub fn total_steps(&self) -> u32 {
        self.total_steps
    }

    /// Output power of step `index`; the last step is pinned to the end power.
    pub fn power_at(&self, index: u32) -> f64 {
        if index + 1 >= self.total_steps {
            self.end_dbm
        } else {
            self.start_dbm + f64::from(index) * self.step_db
        }
    }

    pub fn powers(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.total_steps).map(|index| self.power_at(index))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tuning {
    pub center_freq_hz: f64,
    pub bandwidth_hz: f64,
}

/// Sweep form contents as typed by the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepRequest {
    pub center_freq_mhz: String,
    pub bandwidth_mhz: String,
    pub cable_loss_db: String,
    pub start_dbm: String,
    pub end_dbm: String,
    pub step_db: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepSettings {
    pub tuning: Tuning,
    pub cable_loss_db: f64,
    pub plan: SweepPlan,
}

impl SweepRequest {
    pub fn resolve(&self, cable_loss_enabled: bool) -> Result<SweepSettings, SessionError> {
        let (center_freq_hz, bandwidth_hz) =
            resolve_tuning(&self.center_freq_mhz, &self.bandwidth_mhz)?;
        let cable_loss_db = if cable_loss_enabled {
            parse_cable_loss(&self.cable_loss_db)?.max(0.0)
        } else {
            0.0
        };
        let plan = SweepPlan::new(
            parse_power("start power", &self.start_dbm)?,
            parse_power("end power", &self.end_dbm)?,
            parse_power("sweep step", &self.step_db)?,
        )?;

        Ok(SweepSettings {
            tuning: Tuning {
                center_freq_hz,
                bandwidth_hz,
            },
            cable_loss_db,
            plan,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One sweep, owned by the engine loop until it returns.
#[derive(Debug)]
pub struct SweepRun {
    pub id: SweepId,
    pub settings: SweepSettings,
    /// Bursts played per step.
    pub burst_count: u32,
    pub current_step_index: u32,
    cancel: CancelFlag,
}

impl SweepRun {
    pub fn new(settings: SweepSettings, burst_count: u32) -> Self {
        Self {
            id: SweepId::new(),
            settings,
            burst_count,
            current_step_index: 0,
            cancel: CancelFlag::new(),
        }
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn status(&self) -> SweepStatus {
        let plan = &self.settings.plan;
        SweepStatus {
            id: self.id,
            start_dbm: plan.start_dbm(),
            end_dbm: plan.end_dbm(),
            step_db: plan.step_db(),
            total_steps: plan.total_steps(),
            current_step_index: self.current_step_index,
        }
    }

    fn step(&self, index: u32) -> SweepStep {
        let power_dbm = self.settings.plan.power_at(index);
        let tx_power_dbm = compute_tx_power(power_dbm, self.settings.cable_loss_db);
        SweepStep {
            sweep_id: self.id,
            index,
            total_steps: self.settings.plan.total_steps(),
            power_dbm,
            tx_power_dbm,
            command: PlayCommand {
                center_freq_hz: self.settings.tuning.center_freq_hz,
                bandwidth_hz: self.settings.tuning.bandwidth_hz,
                tx_power_dbm,
                repeat_count: self.burst_count,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepStep {
    pub sweep_id: SweepId,
    pub index: u32,
    pub total_steps: u32,
    pub power_dbm: f64,
    pub tx_power_dbm: f64,
    pub command: PlayCommand,
}

/// Hardware side of a sweep step.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Arms the receiver (if any) and plays the burst at the step's power.
    async fn apply(&self, step: &SweepStep) -> Result<(), SessionError>;
    /// Reads back receiver statistics once the burst has settled.
    async fn collect(&self, step: &SweepStep) -> Result<Option<MibCounters>, SessionError>;
}

fn progress_event(step: &SweepStep, mib: Option<MibCounters>) -> SessionEvent {
    SessionEvent::SweepProgress(SweepProgress {
        sweep_id: step.sweep_id,
        current_power: step.power_dbm,
        tx_power_dbm: step.tx_power_dbm,
        step_index: step.index,
        total_steps: step.total_steps,
        mib,
        at: Utc::now(),
    })
}

fn step_failure(index: u32, err: SessionError) -> SweepOutcome {
    let err = match err {
        err @ SessionError::SweepStepFailed { .. } => err,
        other => SessionError::SweepStepFailed {
            step_index: index,
            reason: other.to_string(),
        },
    };
    SweepOutcome::Failed {
        step_index: index,
        error: ErrorReport::from(&err),
    }
}

/// Walks every step of `run`. Cancellation is only observed between steps;
/// a step whose call is in flight always completes first.
pub async fn run_sweep(
    mut run: SweepRun,
    executor: &dyn StepExecutor,
    settle: &dyn SettleTimer,
    events: &broadcast::Sender<SessionEvent>,
) -> SweepOutcome {
    let total_steps = run.settings.plan.total_steps();
    info!(sweep = %run.id, total_steps, "sweep: started");

    for index in 0..total_steps {
        if run.cancel_requested() {
            info!(sweep = %run.id, completed_steps = index, "sweep: cancelled");
            return SweepOutcome::Cancelled {
                completed_steps: index,
            };
        }

        run.current_step_index = index;
        let step = run.step(index);

        if let Err(err) = executor.apply(&step).await {
            warn!(sweep = %run.id, step = index, error = %err, "sweep: step failed");
            return step_failure(index, err);
        }
        let _ = events.send(progress_event(&step, None));

        settle.settle(index).await;

        match executor.collect(&step).await {
            Ok(Some(mib)) => {
                let _ = events.send(progress_event(&step, Some(mib)));
            }
            Ok(None) => {}
            Err(err) => {
                warn!(sweep = %run.id, step = index, error = %err, "sweep: readback failed");
                return step_failure(index, err);
            }
        }
    }

    info!(sweep = %run.id, total_steps, "sweep: completed");
    SweepOutcome::Completed { steps: total_steps }
}
