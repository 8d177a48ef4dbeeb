//! Selected waveform file: what kind it is, how it is loaded, and when a
//! change of bandwidth or frame interval forces it to be rebuilt.

use std::path::{Path, PathBuf};

use instrument::SignalGenerator;
use shared::{
    domain::{DerivedParams, SourceKind, WaveformHandle},
    error::SessionError,
};
use tracing::{debug, info};

const MATLAB_EXTENSION: &str = "mat";

/// Reconstruction inputs for MATLAB sources. `None` means the field was left
/// empty; non-numeric text is kept as NaN so it can be reported as such.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SourceParams {
    pub bandwidth_hz: Option<f64>,
    pub frame_interval_us: Option<f64>,
}

impl SourceParams {
    pub fn new(bandwidth_hz: f64, frame_interval_us: f64) -> Self {
        Self {
            bandwidth_hz: Some(bandwidth_hz),
            frame_interval_us: Some(frame_interval_us),
        }
    }

    pub fn from_text(bandwidth_mhz: &str, frame_interval_us: &str) -> Self {
        fn parse(text: &str, scale: f64) -> Option<f64> {
            let text = text.trim();
            if text.is_empty() {
                return None;
            }
            Some(text.parse::<f64>().map(|v| v * scale).unwrap_or(f64::NAN))
        }
        Self {
            bandwidth_hz: parse(bandwidth_mhz, 1e6),
            frame_interval_us: parse(frame_interval_us, 1.0),
        }
    }
}

pub fn classify(path: &Path) -> SourceKind {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case(MATLAB_EXTENSION) => SourceKind::MatlabDerived,
        _ => SourceKind::Native,
    }
}

pub fn resolve_matlab_params(params: Option<SourceParams>) -> Result<DerivedParams, SessionError> {
    let params = params.unwrap_or_default();
    let bandwidth_hz = params
        .bandwidth_hz
        .ok_or_else(|| SessionError::MissingParameters("bandwidth is required".into()))?;
    let frame_interval_us = params
        .frame_interval_us
        .ok_or_else(|| SessionError::MissingParameters("frame interval is required".into()))?;

    if !bandwidth_hz.is_finite() {
        return Err(SessionError::MissingParameters(
            "bandwidth is not a number".into(),
        ));
    }
    if !frame_interval_us.is_finite() {
        return Err(SessionError::MissingParameters(
            "frame interval is not a number".into(),
        ));
    }
    if bandwidth_hz <= 0.0 {
        return Err(SessionError::MissingParameters(
            "bandwidth must be greater than zero".into(),
        ));
    }
    if frame_interval_us < 0.0 {
        return Err(SessionError::MissingParameters(
            "frame interval must not be negative".into(),
        ));
    }

    Ok(DerivedParams {
        bandwidth_hz,
        frame_interval_us,
    })
}

/// Loads `path` through the generator. MATLAB parameters are checked before
/// the generator is touched.
pub async fn load(
    generator: &dyn SignalGenerator,
    path: &Path,
    kind: SourceKind,
    params: Option<SourceParams>,
) -> Result<WaveformHandle, SessionError> {
    let derived_params = match kind {
        SourceKind::Native => None,
        SourceKind::MatlabDerived => Some(resolve_matlab_params(params)?),
    };

    debug!(path = %path.display(), ?kind, "waveform: loading");
    let info = generator
        .load_waveform(
            path,
            derived_params.map(|p| p.bandwidth_hz),
            derived_params.map(|p| p.frame_interval_us),
        )
        .await
        .map_err(|err| SessionError::LoadFailed {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;

    info!(
        file = %info.file_name,
        samples = info.sample_count,
        bytes = info.file_size_bytes,
        "waveform: loaded"
    );

    Ok(WaveformHandle {
        source_path: path.to_path_buf(),
        source_kind: kind,
        file_name: info.file_name,
        sample_count: info.sample_count,
        byte_size: info.file_size_bytes,
        derived_params,
    })
}

/// Path to rebuild when dependent parameters change; `None` for native files.
pub fn reload_target(current: Option<&WaveformHandle>) -> Option<PathBuf> {
    current
        .filter(|handle| handle.source_kind == SourceKind::MatlabDerived)
        .map(|handle| handle.source_path.clone())
}

pub fn ensure_exportable(current: Option<&WaveformHandle>) -> Result<&WaveformHandle, SessionError> {
    match current {
        Some(handle) if handle.source_kind == SourceKind::MatlabDerived => Ok(handle),
        Some(_) => Err(SessionError::illegal(
            "export_waveform",
            "only MATLAB-derived waveforms can be exported",
        )),
        None => Err(SessionError::illegal("export_waveform", "no waveform loaded")),
    }
}
