use super::await_sweep;

use std::sync::Arc;

use instrument::{sim::SimulatedGenerator, MissingDutConnector, NoSettle};
use session_core::{ControllerOptions, SessionController, SweepRequest};
use shared::protocol::{SessionEvent, SweepOutcome};

fn request() -> SweepRequest {
    SweepRequest {
        center_freq_mhz: "2400".into(),
        bandwidth_mhz: "20".into(),
        cable_loss_db: "".into(),
        start_dbm: "-20".into(),
        end_dbm: "-10".into(),
        step_db: "5".into(),
    }
}

async fn ready_controller() -> Arc<SessionController> {
    let sim = Arc::new(SimulatedGenerator::new().with_file("wave.WAVEFORM", 16_384));
    let controller = SessionController::new(
        sim,
        Arc::new(MissingDutConnector),
        Arc::new(NoSettle),
        ControllerOptions::default(),
    );
    controller.connect("192.0.2.5").await.expect("connect");
    controller
        .load_waveform("wave.WAVEFORM", None)
        .await
        .expect("load");
    controller
}

#[tokio::test]
async fn interrupt_after_sweep_finished_keeps_outcome() {
    let controller = ready_controller().await;
    let mut events = controller.subscribe_events();
    let ticket = controller.start_sweep(&request()).await.expect("start");

    // Fires only once the sweep is already over.
    let interrupt = async move {
        while let Ok(event) = events.recv().await {
            if matches!(event, SessionEvent::SweepFinished { .. }) {
                break;
            }
        }
    };

    let outcome = await_sweep(&controller, ticket, interrupt).await;
    assert_eq!(outcome, SweepOutcome::Completed { steps: 3 });
    assert!(controller.snapshot().await.sweep.is_idle());
}

#[tokio::test]
async fn interrupt_during_sweep_cancels_it() {
    let controller = ready_controller().await;
    let ticket = controller.start_sweep(&request()).await.expect("start");

    let outcome = await_sweep(&controller, ticket, async {}).await;
    assert!(matches!(
        outcome,
        SweepOutcome::Cancelled { .. } | SweepOutcome::Completed { .. }
    ));
    assert!(controller.snapshot().await.sweep.is_idle());
}
