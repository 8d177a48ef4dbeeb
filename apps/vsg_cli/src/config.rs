use std::{
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use session_core::{Capabilities, ControllerOptions};

pub const DEFAULT_CONFIG_FILE: &str = "vsg.toml";
const ENV_PREFIX: &str = "VSG__";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub instrument_ip: Option<String>,
    pub dut_ip: Option<String>,
    pub settle_interval_ms: u64,
    pub sweep_burst_count: u32,
    pub default_cable_loss_db: f64,
    pub event_capacity: usize,
    pub log_filter: String,
    pub enable_export: bool,
    pub enable_sweep: bool,
    pub enable_cable_loss: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            instrument_ip: None,
            dut_ip: None,
            settle_interval_ms: 100,
            sweep_burst_count: session_core::DEFAULT_SWEEP_BURST_COUNT,
            default_cable_loss_db: 0.0,
            event_capacity: session_core::DEFAULT_EVENT_CAPACITY,
            log_filter: "info".into(),
            enable_export: true,
            enable_sweep: true,
            enable_cable_loss: true,
        }
    }
}

impl Settings {
    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            capabilities: Capabilities {
                export: self.enable_export,
                sweep: self.enable_sweep,
                cable_loss: self.enable_cable_loss,
            },
            sweep_burst_count: self.sweep_burst_count.max(1),
            event_capacity: self.event_capacity,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    instrument_ip: Option<String>,
    dut_ip: Option<String>,
    settle_interval_ms: Option<u64>,
    sweep_burst_count: Option<u32>,
    default_cable_loss_db: Option<f64>,
    event_capacity: Option<usize>,
    log_filter: Option<String>,
    enable_export: Option<bool>,
    enable_sweep: Option<bool>,
    enable_cable_loss: Option<bool>,
}

/// Defaults, then the TOML file, then `VSG__*` variables. A missing file is
/// only an error when `path` was given explicitly.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    let (file, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    match fs::read_to_string(&file) {
        Ok(raw) => apply_file(&mut settings, &raw)
            .with_context(|| format!("invalid config file '{}'", file.display()))?,
        Err(err) if err.kind() == io::ErrorKind::NotFound && !explicit => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read '{}'", file.display()))
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_file(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file: FileSettings = toml::from_str(raw)?;

    if let Some(v) = file.instrument_ip {
        settings.instrument_ip = Some(v);
    }
    if let Some(v) = file.dut_ip {
        settings.dut_ip = Some(v);
    }
    if let Some(v) = file.settle_interval_ms {
        settings.settle_interval_ms = v;
    }
    if let Some(v) = file.sweep_burst_count {
        settings.sweep_burst_count = v;
    }
    if let Some(v) = file.default_cable_loss_db {
        settings.default_cable_loss_db = v;
    }
    if let Some(v) = file.event_capacity {
        settings.event_capacity = v;
    }
    if let Some(v) = file.log_filter {
        settings.log_filter = v;
    }
    if let Some(v) = file.enable_export {
        settings.enable_export = v;
    }
    if let Some(v) = file.enable_sweep {
        settings.enable_sweep = v;
    }
    if let Some(v) = file.enable_cable_loss {
        settings.enable_cable_loss = v;
    }
    Ok(())
}

fn var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(&format!("{ENV_PREFIX}{key}"))
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    var(lookup, key).and_then(|v| v.trim().parse().ok())
}

/// Unparseable values are ignored and the previous layer wins.
fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var(&lookup, "INSTRUMENT_IP") {
        settings.instrument_ip = Some(v);
    }
    if let Some(v) = var(&lookup, "DUT_IP") {
        settings.dut_ip = Some(v);
    }
    if let Some(v) = parsed(&lookup, "SETTLE_INTERVAL_MS") {
        settings.settle_interval_ms = v;
    }
    if let Some(v) = parsed(&lookup, "SWEEP_BURST_COUNT") {
        settings.sweep_burst_count = v;
    }
    if let Some(v) = parsed(&lookup, "DEFAULT_CABLE_LOSS_DB") {
        settings.default_cable_loss_db = v;
    }
    if let Some(v) = parsed(&lookup, "EVENT_CAPACITY") {
        settings.event_capacity = v;
    }
    if let Some(v) = var(&lookup, "LOG_FILTER") {
        settings.log_filter = v;
    }
    if let Some(v) = parsed(&lookup, "ENABLE_EXPORT") {
        settings.enable_export = v;
    }
    if let Some(v) = parsed(&lookup, "ENABLE_SWEEP") {
        settings.enable_sweep = v;
    }
    if let Some(v) = parsed(&lookup, "ENABLE_CABLE_LOSS") {
        settings.enable_cable_loss = v;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
