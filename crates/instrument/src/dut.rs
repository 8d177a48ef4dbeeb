//! Device-under-test receiver statistics.

use shared::domain::MibCounters;

const REC_RX_COUNT_KEY: &str = "user->rec_rx_count";

/// Extracts receive counters from a `fastconfig -R` style statistics dump.
///
/// `rx_ok_count` is read from the `receive <bw>M OK = <n>` entry matching
/// `bw_mhz`; either counter is `None` when its line is absent or malformed.
pub fn parse_mib_report(output: &str, bw_mhz: u32) -> MibCounters {
    let rec_rx_count = output.lines().find_map(|line| {
        let idx = line.find(REC_RX_COUNT_KEY)?;
        let value = line[idx..].split('=').nth(1)?;
        value.trim().parse::<u32>().ok()
    });

    let bw_key = format!("receive {bw_mhz}M OK");
    let rx_ok_count = output.lines().find_map(|line| {
        let idx = line.find(&bw_key)?;
        let value = line[idx + bw_key.len()..].split('=').nth(1)?;
        value.split(',').next()?.trim().parse::<u32>().ok()
    });

    MibCounters {
        rec_rx_count,
        rx_ok_count,
    }
}

/// Whole-MHz value the DUT command set expects.
pub fn to_whole_mhz(hz: f64) -> u32 {
    (hz / 1e6).round().max(0.0) as u32
}
