use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal::unix::{self, SignalKind};
use tokio_util::sync::CancellationToken;

use taxi_fanout::board::FanoutBoard;
use taxi_fanout::bootloader::stm32::SerialConnector;
use taxi_fanout::config::Config;
use taxi_fanout::hw_trait::SharedI2c;
use taxi_fanout::sequencer::Sequencer;
use taxi_fanout::smc::{BuildInfo, SmcI2c, SmcRegisters};
use taxi_fanout::tracing::{self, prelude::*};
use taxi_fanout::types::{ChannelSet, Firmware};

/// Power and programming control for the TAXI fanout board.
#[derive(Parser)]
#[command(name = "taxi-fanout", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (default: $TAXI_FANOUT_CONFIG, then /etc/taxi/fanout.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print the result as JSON.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Switch channel power, or report it.
    Power {
        #[arg(value_enum)]
        action: PowerAction,

        /// Channels, e.g. "0-3,7". Required for on and off.
        #[arg(long, short)]
        channels: Option<ChannelSet>,
    },
    /// Power-cycle channels into their bootloader and flash an image.
    Program {
        /// Channels, e.g. "0-3,7".
        #[arg(long, short)]
        channels: ChannelSet,

        /// Raw firmware image.
        #[arg(long, short)]
        firmware: PathBuf,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PowerAction {
    On,
    Off,
    Read,
    Check,
}

enum Request {
    PowerOn(ChannelSet),
    PowerOff(ChannelSet),
    Read(Option<ChannelSet>),
    Check(Option<ChannelSet>),
    Program(ChannelSet, Firmware),
}

// Everything that can be rejected without hardware is checked here.
async fn validate(command: Command) -> Result<Request> {
    let request = match command {
        Command::Power { action, channels } => match (action, channels) {
            (PowerAction::On, Some(channels)) => Request::PowerOn(channels),
            (PowerAction::Off, Some(channels)) => Request::PowerOff(channels),
            (PowerAction::On | PowerAction::Off, None) => {
                bail!("--channels is required for power on and power off")
            }
            (PowerAction::Read, filter) => Request::Read(filter),
            (PowerAction::Check, filter) => Request::Check(filter),
        },
        Command::Program { channels, firmware } => {
            let image = Firmware::load(&firmware)
                .await
                .with_context(|| format!("failed to load {}", firmware.display()))?;
            info!(path = %firmware.display(), len = image.len(), "Loaded firmware");
            Request::Program(channels, image)
        }
    };
    Ok(request)
}

fn print<T: Serialize + std::fmt::Display>(value: &T, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{value}");
    }
    Ok(())
}

async fn cancel_on_signal(cancel: CancellationToken) -> std::io::Result<()> {
    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
    warn!("Signal received, stopping after the current channel");
    cancel.cancel();
    Ok(())
}

async fn run(cli: Cli) -> Result<bool> {
    let config = Config::load(cli.config.as_deref())?;
    let request = validate(cli.command).await?;

    let mut registers = SmcRegisters::open(&config.smc.device, config.smc.map_len)?;
    let build = BuildInfo::read(&mut registers).await?;
    info!(%build, "SMC gateware");
    let bus = SharedI2c::new(SmcI2c::from_config(registers, &config.smc));
    let mut board = FanoutBoard::new(bus, &config.board);
    board.setup().await.context("failed to configure fanout board")?;

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = cancel_on_signal(watcher).await {
            warn!(error = %e, "Signal handling unavailable");
        }
    });

    let connector = SerialConnector::new(config.bootloader.clone());
    let mut sequencer = Sequencer::new(
        board,
        connector,
        config.timing.clone(),
        config.bootloader.flash_address,
    )
    .with_cancellation(cancel);

    let success = match request {
        Request::Read(filter) => {
            let mut powered = sequencer.read_power().await?;
            if let Some(filter) = filter {
                powered = powered.intersection(filter);
            }
            if cli.json {
                println!("{}", serde_json::json!({ "powered": powered }));
            } else {
                println!("powered: {powered}");
            }
            true
        }
        Request::Check(filter) => {
            let mut status = sequencer.check_power().await?;
            if let Some(filter) = filter {
                status.powered = status.powered.intersection(filter);
                status.overcurrent = status.overcurrent.intersection(filter);
            }
            print(&status, cli.json)?;
            status.healthy()
        }
        Request::PowerOn(channels) => {
            let report = sequencer.power_on(channels).await?;
            print(&report, cli.json)?;
            report.success()
        }
        Request::PowerOff(channels) => {
            let report = sequencer.power_off(channels).await?;
            print(&report, cli.json)?;
            report.success()
        }
        Request::Program(channels, firmware) => {
            let report = sequencer.program(channels, &firmware).await?;
            print(&report, cli.json)?;
            report.success()
        }
    };
    Ok(success)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing::init_journald_or_stderr();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
