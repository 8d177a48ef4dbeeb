use super::{apply_env, apply_file, load_settings, Settings};

use std::{
    collections::HashMap,
    env, fs,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn defaults_match_controller_defaults() {
    let settings = Settings::default();
    assert_eq!(settings.sweep_burst_count, 1000);
    assert_eq!(settings.settle_interval(), Duration::from_millis(100));
    assert_eq!(settings.log_filter, "info");

    let options = settings.controller_options();
    assert!(options.capabilities.export && options.capabilities.sweep);
    assert!(options.capabilities.cable_loss);
    assert_eq!(options.event_capacity, 1024);
}

#[test]
fn file_overrides_selected_keys() {
    let mut settings = Settings::default();
    apply_file(
        &mut settings,
        r#"
instrument_ip = "192.0.2.5"
settle_interval_ms = 250
default_cable_loss_db = 1.5
enable_export = false
"#,
    )
    .expect("valid toml");

    assert_eq!(settings.instrument_ip.as_deref(), Some("192.0.2.5"));
    assert_eq!(settings.settle_interval_ms, 250);
    assert_eq!(settings.default_cable_loss_db, 1.5);
    assert!(!settings.controller_options().capabilities.export);
    assert!(settings.enable_sweep);
    assert_eq!(settings.dut_ip, None);
}

#[test]
fn unknown_or_mistyped_file_keys_are_rejected() {
    let mut settings = Settings::default();
    assert!(apply_file(&mut settings, "instrument_address = \"x\"").is_err());
    assert!(apply_file(&mut settings, "settle_interval_ms = \"slow\"").is_err());
}

#[test]
fn environment_wins_over_file_and_skips_bad_values() {
    let mut settings = Settings::default();
    apply_file(&mut settings, "instrument_ip = \"192.0.2.5\"\nsweep_burst_count = 10")
        .expect("valid toml");

    apply_env(
        &mut settings,
        lookup(&[
            ("VSG__INSTRUMENT_IP", "198.51.100.7"),
            ("VSG__SWEEP_BURST_COUNT", "lots"),
            ("VSG__ENABLE_SWEEP", "false"),
            ("VSG__EVENT_CAPACITY", " 64 "),
        ]),
    );

    assert_eq!(settings.instrument_ip.as_deref(), Some("198.51.100.7"));
    assert_eq!(settings.sweep_burst_count, 10);
    assert!(!settings.enable_sweep);
    assert_eq!(settings.event_capacity, 64);
}

#[test]
fn zero_burst_count_is_raised_to_one() {
    let settings = Settings {
        sweep_burst_count: 0,
        ..Settings::default()
    };
    assert_eq!(settings.controller_options().sweep_burst_count, 1);
}

#[test]
fn explicit_config_path_must_exist() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let missing = env::temp_dir().join(format!("vsg_missing_{suffix}.toml"));
    assert!(load_settings(Some(&missing)).is_err());
}

#[test]
fn explicit_config_file_is_loaded() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = env::temp_dir().join(format!("vsg_config_{suffix}.toml"));
    fs::write(&path, "dut_ip = \"192.0.2.77\"\n").expect("write config");

    let settings = load_settings(Some(&path)).expect("load");
    assert_eq!(settings.dut_ip.as_deref(), Some("192.0.2.77"));

    fs::remove_file(path).expect("cleanup");
}
