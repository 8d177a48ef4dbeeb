//! The single owned session value and the enablement projection derived from it.

use std::sync::Arc;

use instrument::DutLink;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{
        ConnectionState, PlaybackState, SessionSnapshot, SourceKind, SweepState, WaveformHandle,
    },
    error::SessionError,
};

/// Optional features; front ends differ only in which of these they expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub export: bool,
    pub sweep: bool,
    pub cable_loss: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            export: true,
            sweep: true,
            cable_loss: true,
        }
    }
}

#[derive(Default)]
pub(crate) struct Session {
    pub connection: ConnectionState,
    pub waveform: Option<WaveformHandle>,
    pub playback: PlaybackState,
    pub sweep: SweepState,
    pub dut: Option<Arc<dyn DutLink>>,
}

impl Session {
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection: self.connection.clone(),
            waveform: self.waveform.clone(),
            playback: self.playback,
            sweep: self.sweep,
            dut_attached: self.dut.is_some(),
        }
    }

    pub fn require_connected(&self, operation: &'static str) -> Result<(), SessionError> {
        if self.connection.is_connected() {
            Ok(())
        } else {
            Err(SessionError::illegal(operation, "instrument not connected"))
        }
    }

    pub fn require_waveform(&self, operation: &'static str) -> Result<&WaveformHandle, SessionError> {
        self.waveform
            .as_ref()
            .ok_or_else(|| SessionError::illegal(operation, "no waveform loaded"))
    }

    pub fn require_sweep_idle(&self, operation: &'static str) -> Result<(), SessionError> {
        if self.sweep.is_idle() {
            Ok(())
        } else {
            Err(SessionError::illegal(operation, "a power sweep is active"))
        }
    }

    /// Back to the post-disconnect state. The DUT link is independent and kept.
    pub fn reset_link(&mut self) {
        self.connection = ConnectionState::Disconnected;
        self.waveform = None;
        self.playback = PlaybackState::Idle;
        self.sweep = SweepState::Idle;
    }
}

/// Which operations a front end should offer, derived from state alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Enablement {
    pub connect: bool,
    pub disconnect: bool,
    pub load_waveform: bool,
    pub export_waveform: bool,
    pub play: bool,
    pub stop: bool,
    pub start_sweep: bool,
    pub cancel_sweep: bool,
    pub connect_dut: bool,
    pub disconnect_dut: bool,
}

impl Enablement {
    pub fn project(snapshot: &SessionSnapshot, capabilities: &Capabilities) -> Self {
        let connected = snapshot.connection.is_connected();
        let connecting = matches!(snapshot.connection, ConnectionState::Connecting);
        let sweep_idle = snapshot.sweep.is_idle();
        let has_waveform = snapshot.waveform.is_some();
        let exportable = snapshot
            .waveform
            .as_ref()
            .is_some_and(|w| w.source_kind == SourceKind::MatlabDerived);

        Self {
            connect: !connecting && sweep_idle,
            disconnect: connected && sweep_idle,
            load_waveform: connected && sweep_idle,
            export_waveform: capabilities.export && connected && exportable,
            play: connected && has_waveform && sweep_idle,
            stop: connected,
            start_sweep: capabilities.sweep && connected && has_waveform && sweep_idle,
            cancel_sweep: snapshot.sweep.is_running(),
            connect_dut: capabilities.sweep && sweep_idle,
            disconnect_dut: snapshot.dut_attached && sweep_idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::{PlaybackParams, SweepId, SweepStatus};
    use std::path::PathBuf;

    fn waveform(kind: SourceKind) -> WaveformHandle {
        WaveformHandle {
            source_path: PathBuf::from("wave"),
            source_kind: kind,
            file_name: "wave".into(),
            sample_count: 1,
            byte_size: 4,
            derived_params: None,
        }
    }

    fn connected() -> SessionSnapshot {
        SessionSnapshot {
            connection: ConnectionState::Connected {
                identity: "VSG".into(),
            },
            ..SessionSnapshot::default()
        }
    }

    fn running() -> SweepState {
        SweepState::Running(SweepStatus {
            id: SweepId::new(),
            start_dbm: -20.0,
            end_dbm: -10.0,
            step_db: 5.0,
            total_steps: 3,
            current_step_index: 0,
        })
    }

    #[test]
    fn disconnected_only_offers_connect() {
        let enablement = Enablement::project(&SessionSnapshot::default(), &Capabilities::default());
        assert_eq!(
            enablement,
            Enablement {
                connect: true,
                connect_dut: true,
                ..Enablement::default()
            }
        );
    }

    #[test]
    fn play_requires_waveform_and_idle_sweep() {
        let caps = Capabilities::default();
        let mut snapshot = connected();
        assert!(!Enablement::project(&snapshot, &caps).play);

        snapshot.waveform = Some(waveform(SourceKind::Native));
        let enablement = Enablement::project(&snapshot, &caps);
        assert!(enablement.play);
        assert!(enablement.start_sweep);
        assert!(!enablement.export_waveform);

        snapshot.sweep = running();
        let enablement = Enablement::project(&snapshot, &caps);
        assert!(!enablement.play);
        assert!(!enablement.disconnect);
        assert!(enablement.cancel_sweep);
        assert!(enablement.stop);
    }

    #[test]
    fn loading_stays_enabled_while_playing() {
        let mut snapshot = connected();
        snapshot.waveform = Some(waveform(SourceKind::MatlabDerived));
        snapshot.playback = PlaybackState::Playing(PlaybackParams {
            center_freq_hz: 2.4e9,
            bandwidth_hz: 20e6,
            output_power_dbm: -10.0,
            cable_loss_db: 0.0,
            repeat_count: 0,
        });
        let enablement = Enablement::project(&snapshot, &Capabilities::default());
        assert!(enablement.load_waveform);
        assert!(enablement.export_waveform);
    }

    #[test]
    fn disabled_capabilities_hide_operations() {
        let mut snapshot = connected();
        snapshot.waveform = Some(waveform(SourceKind::MatlabDerived));
        let caps = Capabilities {
            export: false,
            sweep: false,
            cable_loss: false,
        };
        let enablement = Enablement::project(&snapshot, &caps);
        assert!(!enablement.export_waveform);
        assert!(!enablement.start_sweep);
        assert!(enablement.play);
    }

    #[test]
    fn reset_link_clears_instrument_state() {
        let mut session = Session {
            connection: ConnectionState::Connected {
                identity: "VSG".into(),
            },
            waveform: Some(waveform(SourceKind::Native)),
            sweep: running(),
            ..Session::default()
        };
        session.reset_link();
        assert_eq!(session.snapshot(), SessionSnapshot::default());
    }
}
