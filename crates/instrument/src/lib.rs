//! Collaborator seams consumed by the session controller: the signal
//! generator driver, the optional device-under-test link and the settle timer.

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

pub mod dut;
pub mod sim;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstrumentError {
    #[error("instrument unreachable: {0}")]
    Unreachable(String),
    #[error("instrument timed out: {0}")]
    Timeout(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("waveform file not found: {0}")]
    NotFound(String),
    #[error("waveform parse error: {0}")]
    Parse(String),
    #[error("unsupported waveform: {0}")]
    Unsupported(String),
    #[error("instrument rejected command: {0}")]
    Rejected(String),
}

pub type InstrumentResult<T> = Result<T, InstrumentError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveformInfo {
    pub file_name: String,
    pub file_size_bytes: u64,
    /// IQ sample pairs, 4 bytes each.
    pub sample_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayCommand {
    pub center_freq_hz: f64,
    pub bandwidth_hz: f64,
    pub tx_power_dbm: f64,
    /// 0 plays continuously.
    pub repeat_count: u32,
}

#[async_trait]
pub trait SignalGenerator: Send + Sync {
    /// Returns the instrument identity string.
    async fn connect(&self, ip: &str) -> InstrumentResult<String>;
    async fn disconnect(&self) -> InstrumentResult<()>;
    async fn load_waveform(
        &self,
        path: &Path,
        bandwidth_hz: Option<f64>,
        frame_interval_us: Option<f64>,
    ) -> InstrumentResult<WaveformInfo>;
    async fn export_waveform(&self, dest: &Path) -> InstrumentResult<()>;
    async fn play(&self, command: PlayCommand) -> InstrumentResult<()>;
    async fn stop(&self) -> InstrumentResult<()>;
}

#[async_trait]
pub trait DutLink: Send + Sync {
    async fn open_rx(&self, cf_mhz: u32, bw_mhz: u32) -> InstrumentResult<()>;
    /// Raw statistics dump, see [`dut::parse_mib_report`].
    async fn read_mib(&self, cf_mhz: u32) -> InstrumentResult<String>;
    async fn close_rx(&self, cf_mhz: u32) -> InstrumentResult<()>;
}

#[async_trait]
pub trait DutConnector: Send + Sync {
    async fn connect(&self, ip: &str) -> InstrumentResult<Arc<dyn DutLink>>;
}

pub struct MissingDutConnector;

#[async_trait]
impl DutConnector for MissingDutConnector {
    async fn connect(&self, ip: &str) -> InstrumentResult<Arc<dyn DutLink>> {
        Err(InstrumentError::Unreachable(format!(
            "no DUT connector available for {ip}"
        )))
    }
}

/// Waits between sweep steps so the instrument finishes the burst.
#[async_trait]
pub trait SettleTimer: Send + Sync {
    async fn settle(&self, step_index: u32);
}

pub struct FixedSettle {
    interval: Duration,
}

impl FixedSettle {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[async_trait]
impl SettleTimer for FixedSettle {
    async fn settle(&self, _step_index: u32) {
        tokio::time::sleep(self.interval).await;
    }
}

pub struct NoSettle;

#[async_trait]
impl SettleTimer for NoSettle {
    async fn settle(&self, _step_index: u32) {}
}
