use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::{stream::BoxStream, StreamExt};
use instrument::{
    sim::{SimulatedDut, SimulatedDutConnector, SimulatedGenerator},
    FixedSettle,
};
use session_core::{PlaybackRequest, SessionController, SourceParams, SweepRequest, SweepTicket};
use shared::protocol::{SessionEvent, SweepOutcome};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, Settings};

/// Console front end for the signal generator session.
#[derive(Parser, Debug)]
#[command(name = "vsg")]
struct Cli {
    /// Instrument address; overrides `instrument_ip` from the config.
    #[arg(long, global = true)]
    ip: Option<String>,
    /// Config file, `vsg.toml` when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Receiver to read statistics from during sweeps.
    #[arg(long, global = true)]
    dut_ip: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a waveform and play it until the duration elapses or Ctrl-C.
    Play(PlayArgs),
    /// Step the output power across a range.
    Sweep(SweepArgs),
    /// Rebuild a MATLAB source and write it as a native waveform.
    Export(ExportArgs),
    /// Print the session snapshot and the operations it allows.
    Status,
}

#[derive(Args, Debug)]
struct SourceArgs {
    #[arg(long)]
    waveform: PathBuf,
    /// Only used for MATLAB sources.
    #[arg(long)]
    frame_interval_us: Option<String>,
}

#[derive(Args, Debug)]
struct TuningArgs {
    #[arg(long)]
    center_freq_mhz: String,
    #[arg(long)]
    bandwidth_mhz: String,
    #[arg(long, allow_hyphen_values = true)]
    cable_loss_db: Option<String>,
}

#[derive(Args, Debug)]
struct PlayArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[command(flatten)]
    tuning: TuningArgs,
    #[arg(long, allow_hyphen_values = true)]
    power_dbm: String,
    /// Finite repetitions; continuous when omitted.
    #[arg(long)]
    repeat: Option<String>,
    #[arg(long)]
    duration_secs: Option<u64>,
}

#[derive(Args, Debug)]
struct SweepArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[command(flatten)]
    tuning: TuningArgs,
    #[arg(long, allow_hyphen_values = true)]
    start_dbm: String,
    #[arg(long, allow_hyphen_values = true)]
    end_dbm: String,
    #[arg(long)]
    step_db: String,
}

#[derive(Args, Debug)]
struct ExportArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long)]
    bandwidth_mhz: String,
    #[arg(long)]
    dest: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load_settings(cli.config.as_deref())?;
    if let Some(ip) = cli.ip {
        settings.instrument_ip = Some(ip);
    }
    if let Some(ip) = cli.dut_ip {
        settings.dut_ip = Some(ip);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let ip = settings
        .instrument_ip
        .clone()
        .context("no instrument address: pass --ip or set instrument_ip")?;

    let controller = SessionController::new(
        Arc::new(SimulatedGenerator::new()),
        Arc::new(SimulatedDutConnector::new(SimulatedDut::new(String::new()))),
        Arc::new(FixedSettle::new(settings.settle_interval())),
        settings.controller_options(),
    );
    let printer = tokio::spawn(print_events(controller.event_stream()));

    let result = run(&controller, &ip, cli.command, &settings).await;

    if controller.snapshot().await.connection.is_connected() {
        if let Err(err) = controller.disconnect().await {
            warn!(error = %err, "disconnect on exit failed");
        }
    }
    // Dropping the last controller handle closes the event stream.
    drop(controller);
    let _ = printer.await;

    result
}

async fn print_events(mut events: BoxStream<'static, SessionEvent>) {
    while let Some(event) = events.next().await {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(err) => warn!(error = %err, "failed to encode event"),
        }
    }
}

async fn run(
    controller: &Arc<SessionController>,
    ip: &str,
    command: Command,
    settings: &Settings,
) -> Result<()> {
    controller.connect(ip).await?;
    if let Some(dut_ip) = &settings.dut_ip {
        controller.connect_dut(dut_ip).await?;
    }

    match command {
        Command::Play(args) => play(controller, args, settings).await,
        Command::Sweep(args) => sweep(controller, args, settings).await,
        Command::Export(args) => export(controller, args).await,
        Command::Status => {
            let status = serde_json::json!({
                "snapshot": controller.snapshot().await,
                "enablement": controller.enablement().await,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

fn source_params(source: &SourceArgs, bandwidth_mhz: &str) -> SourceParams {
    SourceParams::from_text(
        bandwidth_mhz,
        source.frame_interval_us.as_deref().unwrap_or_default(),
    )
}

fn cable_loss_text(tuning: &TuningArgs, settings: &Settings) -> String {
    tuning
        .cable_loss_db
        .clone()
        .unwrap_or_else(|| settings.default_cable_loss_db.to_string())
}

async fn play(controller: &SessionController, args: PlayArgs, settings: &Settings) -> Result<()> {
    controller
        .load_waveform(
            &args.source.waveform,
            Some(source_params(&args.source, &args.tuning.bandwidth_mhz)),
        )
        .await?;

    let request = PlaybackRequest {
        cable_loss_db: cable_loss_text(&args.tuning, settings),
        center_freq_mhz: args.tuning.center_freq_mhz,
        bandwidth_mhz: args.tuning.bandwidth_mhz,
        output_power_dbm: args.power_dbm,
        repeat_enabled: args.repeat.is_some(),
        repeat_count: args.repeat.unwrap_or_default(),
    };
    let params = controller.play(&request).await?;
    info!(tx_power_dbm = params.tx_power_dbm(), "playing, Ctrl-C stops");

    match args.duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?,
    }

    controller.stop().await?;
    Ok(())
}

async fn sweep(
    controller: &Arc<SessionController>,
    args: SweepArgs,
    settings: &Settings,
) -> Result<()> {
    controller
        .load_waveform(
            &args.source.waveform,
            Some(source_params(&args.source, &args.tuning.bandwidth_mhz)),
        )
        .await?;

    let request = SweepRequest {
        cable_loss_db: cable_loss_text(&args.tuning, settings),
        center_freq_mhz: args.tuning.center_freq_mhz,
        bandwidth_mhz: args.tuning.bandwidth_mhz,
        start_dbm: args.start_dbm,
        end_dbm: args.end_dbm,
        step_db: args.step_db,
    };
    let ticket = controller.start_sweep(&request).await?;
    info!(sweep = %ticket.id, total_steps = ticket.total_steps, "sweep running, Ctrl-C cancels");

    let interrupt = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    match await_sweep(controller, ticket, interrupt).await {
        SweepOutcome::Completed { .. } | SweepOutcome::Cancelled { .. } => Ok(()),
        SweepOutcome::Failed { step_index, error } => {
            bail!("sweep failed at step {step_index}: {}", error.message)
        }
    }
}

/// Waits for the sweep, cancelling it once `interrupt` resolves. The sweep may
/// already be over by then, so a refused cancel is only logged.
async fn await_sweep(
    controller: &SessionController,
    ticket: SweepTicket,
    interrupt: impl Future<Output = ()>,
) -> SweepOutcome {
    let finished = ticket.finished();
    tokio::pin!(finished);
    tokio::select! {
        biased;
        _ = interrupt => {
            if let Err(err) = controller.cancel_sweep().await {
                warn!(error = %err, "cancel ignored");
            }
            finished.await
        }
        outcome = &mut finished => outcome,
    }
}

async fn export(controller: &SessionController, args: ExportArgs) -> Result<()> {
    controller
        .load_waveform(
            &args.source.waveform,
            Some(source_params(&args.source, &args.bandwidth_mhz)),
        )
        .await?;
    let dest = controller.export_waveform(&args.dest).await?;
    info!(dest = %dest.display(), "export complete");
    Ok(())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
