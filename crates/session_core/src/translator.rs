//! Conversion of raw operator text into instrument-native units.

use shared::{domain::PlaybackParams, error::SessionError};

const HZ_PER_MHZ: f64 = 1e6;
/// The ARB sample clock runs at twice the signal bandwidth.
const SAMPLE_RATE_PER_BANDWIDTH: f64 = 2.0;
pub const MAX_ARB_SAMPLE_RATE_HZ: f64 = 240e6;

fn parse_finite(field: &'static str, text: &str) -> Result<f64, SessionError> {
    let trimmed = text.trim();
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(SessionError::invalid_input(
            field,
            format!("'{trimmed}' is not a number"),
        )),
    }
}

pub fn to_instrument_freq(mhz_text: &str) -> Result<f64, SessionError> {
    Ok(parse_finite("center frequency", mhz_text)? * HZ_PER_MHZ)
}

pub fn validate_bandwidth(mhz_text: &str) -> Result<f64, SessionError> {
    let hz = parse_finite("bandwidth", mhz_text)? * HZ_PER_MHZ;
    if hz <= 0.0 {
        return Err(SessionError::invalid_input(
            "bandwidth",
            "bandwidth must be greater than zero",
        ));
    }
    Ok(hz)
}

/// Cable loss only ever raises the transmitted power.
pub fn compute_tx_power(output_dbm: f64, cable_loss_db: f64) -> f64 {
    output_dbm + cable_loss_db.max(0.0)
}

/// 0 means continuous playback. When enabled, anything that is not a
/// positive integer falls back to a single repetition rather than an error.
pub fn resolve_repeat_count(enabled: bool, count_text: &str) -> u32 {
    if !enabled {
        return 0;
    }
    match count_text.trim().parse::<u32>() {
        Ok(count) if count >= 1 => count,
        _ => 1,
    }
}

pub fn parse_power(field: &'static str, dbm_text: &str) -> Result<f64, SessionError> {
    parse_finite(field, dbm_text)
}

pub fn parse_cable_loss(db_text: &str) -> Result<f64, SessionError> {
    if db_text.trim().is_empty() {
        return Ok(0.0);
    }
    parse_finite("cable loss", db_text)
}

pub fn arb_sample_rate(bandwidth_hz: f64) -> Result<f64, SessionError> {
    let rate = bandwidth_hz * SAMPLE_RATE_PER_BANDWIDTH;
    if rate > MAX_ARB_SAMPLE_RATE_HZ {
        return Err(SessionError::invalid_input(
            "bandwidth",
            format!(
                "sample rate {:.1} MHz exceeds the {:.0} MHz ARB limit",
                rate / HZ_PER_MHZ,
                MAX_ARB_SAMPLE_RATE_HZ / HZ_PER_MHZ
            ),
        ));
    }
    Ok(rate)
}

pub(crate) fn resolve_tuning(
    center_freq_mhz: &str,
    bandwidth_mhz: &str,
) -> Result<(f64, f64), SessionError> {
    let center_freq_hz = to_instrument_freq(center_freq_mhz)?;
    if center_freq_hz <= 0.0 {
        return Err(SessionError::invalid_input(
            "center frequency",
            "center frequency must be greater than zero",
        ));
    }
    let bandwidth_hz = validate_bandwidth(bandwidth_mhz)?;
    arb_sample_rate(bandwidth_hz)?;
    Ok((center_freq_hz, bandwidth_hz))
}

/// Playback form contents as typed by the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackRequest {
    pub center_freq_mhz: String,
    pub bandwidth_mhz: String,
    pub output_power_dbm: String,
    /// Empty means no loss.
    pub cable_loss_db: String,
    pub repeat_enabled: bool,
    pub repeat_count: String,
}

impl PlaybackRequest {
    pub fn resolve(&self, cable_loss_enabled: bool) -> Result<PlaybackParams, SessionError> {
        let (center_freq_hz, bandwidth_hz) =
            resolve_tuning(&self.center_freq_mhz, &self.bandwidth_mhz)?;
        let output_power_dbm = parse_power("output power", &self.output_power_dbm)?;
        let cable_loss_db = if cable_loss_enabled {
            parse_cable_loss(&self.cable_loss_db)?.max(0.0)
        } else {
            0.0
        };

        Ok(PlaybackParams {
            center_freq_hz,
            bandwidth_hz,
            output_power_dbm,
            cable_loss_db,
            repeat_count: resolve_repeat_count(self.repeat_enabled, &self.repeat_count),
        })
    }
}
