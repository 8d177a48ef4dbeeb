use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ConnectionState, MibCounters, PlaybackParams, SweepId, SweepStatus, WaveformHandle,
    },
    error::ErrorReport,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepProgress {
    pub sweep_id: SweepId,
    pub current_power: f64,
    pub tx_power_dbm: f64,
    /// Zero-based; observers re-sequence on this when delivery order matters.
    pub step_index: u32,
    pub total_steps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mib: Option<MibCounters>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SweepOutcome {
    Completed { steps: u32 },
    Cancelled { completed_steps: u32 },
    Failed { step_index: u32, error: ErrorReport },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SessionEvent {
    ConnectionChanged(ConnectionState),
    WaveformLoaded(WaveformHandle),
    WaveformCleared {
        reason: String,
    },
    WaveformExported {
        dest_path: PathBuf,
    },
    PlaybackStarted(PlaybackParams),
    PlaybackStopped,
    SweepStarted(SweepStatus),
    SweepProgress(SweepProgress),
    SweepFinished {
        sweep_id: SweepId,
        outcome: SweepOutcome,
    },
    DutChanged {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip: Option<String>,
    },
    Error(ErrorReport),
}
