//! In-process stand-ins for the generator and DUT, used by the console and
//! by tests. They keep a call log and can be scripted to fail.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    DutConnector, DutLink, InstrumentError, InstrumentResult, PlayCommand, SignalGenerator,
    WaveformInfo,
};

const BYTES_PER_SAMPLE: u64 = 4;
const MAX_SAMPLE_RATE_HZ: f64 = 240e6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeneratorOp {
    Connect,
    Disconnect,
    Load,
    Export,
    Play,
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorCall {
    Connect(String),
    Disconnect,
    Load {
        path: PathBuf,
        bandwidth_hz: Option<f64>,
        frame_interval_us: Option<f64>,
    },
    Export(PathBuf),
    Play(PlayCommand),
    Stop,
}

struct ScriptedFailure {
    op: GeneratorOp,
    remaining_successes: usize,
    error: InstrumentError,
}

#[derive(Default)]
struct SimState {
    identity: Option<String>,
    loaded: Option<LoadedWaveform>,
    playing: Option<PlayCommand>,
    calls: Vec<GeneratorCall>,
    failures: Vec<ScriptedFailure>,
}

struct LoadedWaveform {
    info: WaveformInfo,
    reconstructed: bool,
}

/// Signal generator that accepts `.WAVEFORM` files (sized from an in-memory
/// catalog or the filesystem) and rebuilds `.mat` sources as
/// `2 × bandwidth × frame interval` samples.
pub struct SimulatedGenerator {
    catalog: HashMap<PathBuf, u64>,
    play_latency: Duration,
    state: Mutex<SimState>,
}

impl Default for SimulatedGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedGenerator {
    pub fn new() -> Self {
        Self {
            catalog: HashMap::new(),
            play_latency: Duration::ZERO,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Registers a file of `size_bytes` that exists only in memory.
    pub fn with_file(mut self, path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        self.catalog.insert(path.into(), size_bytes);
        self
    }

    pub fn with_play_latency(mut self, latency: Duration) -> Self {
        self.play_latency = latency;
        self
    }

    /// Lets `op` succeed `successes` more times, then fails it once with `error`.
    pub async fn fail_after(&self, op: GeneratorOp, successes: usize, error: InstrumentError) {
        self.state.lock().await.failures.push(ScriptedFailure {
            op,
            remaining_successes: successes,
            error,
        });
    }

    pub async fn calls(&self) -> Vec<GeneratorCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn play_calls(&self) -> Vec<PlayCommand> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter_map(|call| match call {
                GeneratorCall::Play(command) => Some(*command),
                _ => None,
            })
            .collect()
    }

    pub async fn is_playing(&self) -> bool {
        self.state.lock().await.playing.is_some()
    }

    async fn record(&self, op: GeneratorOp, call: GeneratorCall) -> InstrumentResult<()> {
        let mut state = self.state.lock().await;
        state.calls.push(call);
        let Some(idx) = state.failures.iter().position(|f| f.op == op) else {
            return Ok(());
        };
        if state.failures[idx].remaining_successes == 0 {
            let failure = state.failures.remove(idx);
            return Err(failure.error);
        }
        state.failures[idx].remaining_successes -= 1;
        Ok(())
    }

    async fn native_size(&self, path: &Path) -> InstrumentResult<u64> {
        if let Some(size) = self.catalog.get(path) {
            return Ok(*size);
        }
        tokio::fs::metadata(path)
            .await
            .map(|meta| meta.len())
            .map_err(|_| InstrumentError::NotFound(path.display().to_string()))
    }
}

fn extension_upper(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_uppercase()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("unknown")
        .to_string()
}

#[async_trait]
impl SignalGenerator for SimulatedGenerator {
    async fn connect(&self, ip: &str) -> InstrumentResult<String> {
        self.record(GeneratorOp::Connect, GeneratorCall::Connect(ip.to_string()))
            .await?;
        let identity = format!("Simulated,VSG-SIM,{ip},1.0");
        let mut state = self.state.lock().await;
        state.identity = Some(identity.clone());
        state.playing = None;
        Ok(identity)
    }

    async fn disconnect(&self) -> InstrumentResult<()> {
        self.record(GeneratorOp::Disconnect, GeneratorCall::Disconnect)
            .await?;
        let mut state = self.state.lock().await;
        state.identity = None;
        state.playing = None;
        state.loaded = None;
        Ok(())
    }

    async fn load_waveform(
        &self,
        path: &Path,
        bandwidth_hz: Option<f64>,
        frame_interval_us: Option<f64>,
    ) -> InstrumentResult<WaveformInfo> {
        self.record(
            GeneratorOp::Load,
            GeneratorCall::Load {
                path: path.to_path_buf(),
                bandwidth_hz,
                frame_interval_us,
            },
        )
        .await?;

        let (info, reconstructed) = match extension_upper(path).as_str() {
            "WAVEFORM" => {
                let size = self.native_size(path).await?;
                if size < BYTES_PER_SAMPLE {
                    return Err(InstrumentError::Parse(
                        "waveform must contain at least one IQ sample pair".into(),
                    ));
                }
                if size % BYTES_PER_SAMPLE != 0 {
                    return Err(InstrumentError::Parse(format!(
                        "size {size} is not a multiple of {BYTES_PER_SAMPLE} bytes"
                    )));
                }
                let info = WaveformInfo {
                    file_name: file_name(path),
                    file_size_bytes: size,
                    sample_count: size / BYTES_PER_SAMPLE,
                };
                (info, false)
            }
            "MAT" => {
                let (Some(bandwidth_hz), Some(frame_interval_us)) =
                    (bandwidth_hz, frame_interval_us)
                else {
                    return Err(InstrumentError::Parse(
                        "MATLAB source needs bandwidth and frame interval".into(),
                    ));
                };
                if !self.catalog.contains_key(path) && tokio::fs::metadata(path).await.is_err() {
                    return Err(InstrumentError::NotFound(path.display().to_string()));
                }
                let sample_rate = 2.0 * bandwidth_hz;
                let samples = (sample_rate * frame_interval_us * 1e-6).round().max(1.0) as u64;
                let info = WaveformInfo {
                    file_name: file_name(path),
                    file_size_bytes: samples * BYTES_PER_SAMPLE,
                    sample_count: samples,
                };
                (info, true)
            }
            other => {
                return Err(InstrumentError::Unsupported(format!(
                    "unsupported file format: .{other}"
                )))
            }
        };

        debug!(file = %info.file_name, samples = info.sample_count, "sim: waveform loaded");
        self.state.lock().await.loaded = Some(LoadedWaveform {
            info: info.clone(),
            reconstructed,
        });
        Ok(info)
    }

    async fn export_waveform(&self, dest: &Path) -> InstrumentResult<()> {
        self.record(GeneratorOp::Export, GeneratorCall::Export(dest.to_path_buf()))
            .await?;
        let byte_size = {
            let state = self.state.lock().await;
            match &state.loaded {
                Some(loaded) if loaded.reconstructed => loaded.info.file_size_bytes,
                _ => {
                    return Err(InstrumentError::Rejected(
                        "no reconstructed waveform to export".into(),
                    ))
                }
            }
        };
        let zeros = vec![0u8; byte_size as usize];
        tokio::fs::write(dest, zeros)
            .await
            .map_err(|err| InstrumentError::Rejected(format!("failed to write file: {err}")))
    }

    async fn play(&self, command: PlayCommand) -> InstrumentResult<()> {
        if !self.play_latency.is_zero() {
            tokio::time::sleep(self.play_latency).await;
        }
        self.record(GeneratorOp::Play, GeneratorCall::Play(command))
            .await?;
        if 2.0 * command.bandwidth_hz > MAX_SAMPLE_RATE_HZ {
            return Err(InstrumentError::Rejected(
                "sample rate can not be set above 240 MHz".into(),
            ));
        }
        let mut state = self.state.lock().await;
        if state.identity.is_none() {
            return Err(InstrumentError::Unreachable("not connected".into()));
        }
        if state.loaded.is_none() {
            return Err(InstrumentError::Rejected("no waveform downloaded".into()));
        }
        state.playing = Some(command);
        Ok(())
    }

    async fn stop(&self) -> InstrumentResult<()> {
        self.record(GeneratorOp::Stop, GeneratorCall::Stop).await?;
        self.state.lock().await.playing = None;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DutCall {
    OpenRx { cf_mhz: u32, bw_mhz: u32 },
    ReadMib { cf_mhz: u32 },
    CloseRx { cf_mhz: u32 },
}

/// DUT receiver that answers every `read_mib` with a fixed report.
pub struct SimulatedDut {
    report: String,
    calls: Mutex<Vec<DutCall>>,
}

impl SimulatedDut {
    pub fn new(report: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            report: report.into(),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub async fn calls(&self) -> Vec<DutCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl DutLink for SimulatedDut {
    async fn open_rx(&self, cf_mhz: u32, bw_mhz: u32) -> InstrumentResult<()> {
        self.calls
            .lock()
            .await
            .push(DutCall::OpenRx { cf_mhz, bw_mhz });
        Ok(())
    }

    async fn read_mib(&self, cf_mhz: u32) -> InstrumentResult<String> {
        self.calls.lock().await.push(DutCall::ReadMib { cf_mhz });
        Ok(self.report.clone())
    }

    async fn close_rx(&self, cf_mhz: u32) -> InstrumentResult<()> {
        self.calls.lock().await.push(DutCall::CloseRx { cf_mhz });
        Ok(())
    }
}

pub struct SimulatedDutConnector {
    dut: Arc<SimulatedDut>,
}

impl SimulatedDutConnector {
    pub fn new(dut: Arc<SimulatedDut>) -> Self {
        Self { dut }
    }
}

#[async_trait]
impl DutConnector for SimulatedDutConnector {
    async fn connect(&self, _ip: &str) -> InstrumentResult<Arc<dyn DutLink>> {
        Ok(self.dut.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(bandwidth_hz: f64) -> PlayCommand {
        PlayCommand {
            center_freq_hz: 2.4e9,
            bandwidth_hz,
            tx_power_dbm: -10.0,
            repeat_count: 0,
        }
    }

    #[tokio::test]
    async fn native_catalog_file_reports_sample_count() {
        let sim = SimulatedGenerator::new().with_file("wave.WAVEFORM", 16_384);
        let info = sim
            .load_waveform(Path::new("wave.WAVEFORM"), None, None)
            .await
            .expect("load");
        assert_eq!(info.sample_count, 4096);
        assert_eq!(info.file_name, "wave.WAVEFORM");
    }

    #[tokio::test]
    async fn rejects_truncated_native_waveform() {
        let sim = SimulatedGenerator::new().with_file("bad.waveform", 10);
        let err = sim
            .load_waveform(Path::new("bad.waveform"), None, None)
            .await
            .expect_err("odd size");
        assert!(matches!(err, InstrumentError::Parse(_)));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let sim = SimulatedGenerator::new();
        let err = sim
            .load_waveform(Path::new("/nonexistent/x.WAVEFORM"), None, None)
            .await
            .expect_err("missing");
        assert!(matches!(err, InstrumentError::NotFound(_)));
    }

    #[tokio::test]
    async fn matlab_source_is_rebuilt_from_parameters() {
        let sim = SimulatedGenerator::new().with_file("frame.mat", 1);
        let info = sim
            .load_waveform(Path::new("frame.mat"), Some(20e6), Some(100.0))
            .await
            .expect("load");
        assert_eq!(info.sample_count, 4000);
        assert_eq!(info.file_size_bytes, 16_000);
    }

    #[tokio::test]
    async fn scripted_failure_fires_after_successes() {
        let sim = SimulatedGenerator::new().with_file("wave.WAVEFORM", 64);
        sim.connect("192.0.2.5").await.expect("connect");
        sim.load_waveform(Path::new("wave.WAVEFORM"), None, None)
            .await
            .expect("load");
        sim.fail_after(GeneratorOp::Play, 1, InstrumentError::Timeout("burst".into()))
            .await;

        sim.play(command(20e6)).await.expect("first play");
        let err = sim.play(command(20e6)).await.expect_err("second play");
        assert_eq!(err, InstrumentError::Timeout("burst".into()));
        sim.play(command(20e6)).await.expect("failure consumed");
        assert_eq!(sim.play_calls().await.len(), 3);
    }

    #[tokio::test]
    async fn play_rejects_sample_rate_above_limit() {
        let sim = SimulatedGenerator::new().with_file("wave.WAVEFORM", 64);
        sim.connect("192.0.2.5").await.expect("connect");
        sim.load_waveform(Path::new("wave.WAVEFORM"), None, None)
            .await
            .expect("load");
        let err = sim.play(command(160e6)).await.expect_err("too fast");
        assert!(matches!(err, InstrumentError::Rejected(_)));
        assert!(!sim.is_playing().await);
    }

    #[tokio::test]
    async fn export_requires_reconstructed_source() {
        let sim = SimulatedGenerator::new().with_file("wave.WAVEFORM", 64);
        sim.load_waveform(Path::new("wave.WAVEFORM"), None, None)
            .await
            .expect("load");
        let dest = std::env::temp_dir().join("vsg_sim_export_rejected.WAVEFORM");
        let err = sim.export_waveform(&dest).await.expect_err("native");
        assert!(matches!(err, InstrumentError::Rejected(_)));
    }
}
