use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SweepId(pub Uuid);

impl SweepId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SweepId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SweepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How the instrument-ready waveform is obtained from the selected file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Pre-formatted big-endian interleaved int16 IQ, downloaded as-is.
    Native,
    /// MATLAB source rebuilt on load from bandwidth and frame interval.
    MatlabDerived,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivedParams {
    pub bandwidth_hz: f64,
    pub frame_interval_us: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveformHandle {
    pub source_path: PathBuf,
    pub source_kind: SourceKind,
    pub file_name: String,
    pub sample_count: u64,
    pub byte_size: u64,
    /// Present exactly when `source_kind` is `MatlabDerived`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_params: Option<DerivedParams>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected {
        identity: String,
    },
    ConnectFailed {
        reason: String,
    },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn identity(&self) -> Option<&str> {
        match self {
            Self::Connected { identity } => Some(identity),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlaybackParams {
    pub center_freq_hz: f64,
    pub bandwidth_hz: f64,
    pub output_power_dbm: f64,
    pub cable_loss_db: f64,
    /// 0 plays continuously.
    pub repeat_count: u32,
}

impl PlaybackParams {
    pub fn tx_power_dbm(&self) -> f64 {
        self.output_power_dbm + self.cable_loss_db
    }

    pub fn is_continuous(&self) -> bool {
        self.repeat_count == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "params", rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing(PlaybackParams),
    Stopping,
}

impl PlaybackState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_playing(&self) -> bool {
        matches!(self, Self::Playing(_))
    }
}

/// Observer-facing view of the run owned by the sweep engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepStatus {
    pub id: SweepId,
    pub start_dbm: f64,
    pub end_dbm: f64,
    pub step_db: f64,
    pub total_steps: u32,
    pub current_step_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "run", rename_all = "snake_case")]
pub enum SweepState {
    #[default]
    Idle,
    Running(SweepStatus),
    Cancelling(SweepStatus),
}

impl SweepState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running(_))
    }

    pub fn status(&self) -> Option<&SweepStatus> {
        match self {
            Self::Idle => None,
            Self::Running(status) | Self::Cancelling(status) => Some(status),
        }
    }
}

/// Receiver statistics read back from the device under test after a burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MibCounters {
    pub rec_rx_count: Option<u32>,
    pub rx_ok_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waveform: Option<WaveformHandle>,
    pub playback: PlaybackState,
    pub sweep: SweepState,
    pub dut_attached: bool,
}
