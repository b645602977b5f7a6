//! Channel power and programming sequencer.
//!
//! A run takes a set of channels through power-up and then, one channel at
//! a time, through the programming link:
//!
//! ```text
//! Idle -> PowerOff -> PowerOn -> ProgrammingEnabled -> ProgrammingDisabled(ok)
//! ```
//!
//! Channels that were already powered are switched off first and left to
//! discharge before power is re-applied. Each channel's bootloader exchange
//! is isolated: a failure powers that channel off, is recorded in the
//! [`RunReport`] and the run moves on to the next channel. Only errors that
//! leave the board in an unknown state (register transactions, opening the
//! link) end the run early.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::board::{FanoutBoard, SupplyMonitor};
use crate::bootloader::{Bootloader, Connector, Link};
use crate::config::TimingConfig;
use crate::error::{Error, Result};
use crate::hw_trait::I2c;
use crate::tracing::prelude::*;
use crate::types::{Channel, ChannelSet, Firmware};

/// Step of a channel's bootloader exchange.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Reset,
    Identify,
    Erase,
    Write,
    Verify,
    Jump,
}

/// Where a channel is in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Idle,
    PowerOff,
    PowerOn,
    ProgrammingEnabled,
    /// Deselected; `true` if the exchange succeeded
    ProgrammingDisabled(bool),
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Idle => write!(f, "idle"),
            ChannelState::PowerOff => write!(f, "power-off"),
            ChannelState::PowerOn => write!(f, "power-on"),
            ChannelState::ProgrammingEnabled => write!(f, "programming-enabled"),
            ChannelState::ProgrammingDisabled(true) => write!(f, "programming-disabled (ok)"),
            ChannelState::ProgrammingDisabled(false) => {
                write!(f, "programming-disabled (failed)")
            }
        }
    }
}

/// Result for one requested channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ChannelOutcome {
    Succeeded,
    Failed { stage: Stage, error: String },
    /// Not started because the run was cancelled
    Cancelled,
}

impl ChannelOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ChannelOutcome::Succeeded)
    }
}

impl fmt::Display for ChannelOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelOutcome::Succeeded => write!(f, "ok"),
            ChannelOutcome::Failed { stage, error } => write!(f, "failed at {stage}: {error}"),
            ChannelOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Requested operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    PowerOn,
    PowerOff,
    Program,
}

/// Per-channel account of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub operation: Operation,

    /// Outcome of every requested channel
    pub outcomes: BTreeMap<Channel, ChannelOutcome>,

    /// Final state of every requested channel
    pub states: BTreeMap<Channel, ChannelState>,

    /// Power mask read back after the run
    pub power: ChannelSet,
}

impl RunReport {
    /// True only if every requested channel succeeded.
    pub fn success(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.values().all(ChannelOutcome::is_success)
    }

    /// Channels that did not succeed.
    pub fn failed(&self) -> ChannelSet {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_success())
            .map(|(channel, _)| *channel)
            .collect()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (channel, outcome) in &self.outcomes {
            writeln!(f, "channel {channel}: {outcome}")?;
        }
        write!(f, "powered: {}", self.power)
    }
}

/// Result of a power check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PowerStatus {
    pub powered: ChannelSet,

    /// Powered channels whose fault line is asserted
    pub overcurrent: ChannelSet,

    pub supply: SupplyMonitor,
}

impl PowerStatus {
    pub fn healthy(&self) -> bool {
        self.overcurrent.is_empty()
    }
}

impl fmt::Display for PowerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "powered: {}", self.powered)?;
        writeln!(f, "overcurrent: {}", self.overcurrent)?;
        write!(f, "supply monitor: {}", self.supply)
    }
}

#[derive(Clone, Copy)]
enum Task<'a> {
    /// Reset into the bootloader and start the application already in flash
    PowerCycle,
    /// Replace the application first
    Flash(&'a Firmware),
}

impl Task<'_> {
    fn operation(self) -> Operation {
        match self {
            Task::PowerCycle => Operation::PowerOn,
            Task::Flash(_) => Operation::Program,
        }
    }
}

/// Sequences power and programming access for the fanout board.
pub struct Sequencer<I2C, C> {
    board: FanoutBoard<I2C>,
    connector: C,
    timing: TimingConfig,
    flash_address: u32,
    cancel: CancellationToken,
}

impl<I2C, C> Sequencer<I2C, C>
where
    I2C: I2c,
    C: Connector,
{
    pub fn new(
        board: FanoutBoard<I2C>,
        connector: C,
        timing: TimingConfig,
        flash_address: u32,
    ) -> Self {
        Self {
            board,
            connector,
            timing,
            flash_address,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop starting new channels once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn board_mut(&mut self) -> &mut FanoutBoard<I2C> {
        &mut self.board
    }

    /// Channels currently powered.
    pub async fn read_power(&mut self) -> Result<ChannelSet> {
        self.board.get_channel_power().await
    }

    /// Power, overcurrent and supply status.
    pub async fn check_power(&mut self) -> Result<PowerStatus> {
        let powered = self.board.get_channel_power().await?;
        // Fault lines are active-low
        let faulted = ChannelSet::from_bits(!self.board.get_channel_fault().await?);
        let supply = self.board.get_power_monitor().await?;
        let status = PowerStatus {
            powered,
            overcurrent: powered.intersection(faulted),
            supply,
        };
        if !status.healthy() {
            warn!(channels = %status.overcurrent, "Overcurrent on powered channels");
        }
        Ok(status)
    }

    /// Switch `channels` off. No delay, no bootloader contact.
    pub async fn power_off(&mut self, channels: ChannelSet) -> Result<RunReport> {
        if channels.is_empty() {
            return Err(Error::EmptySelection);
        }
        let current = self.board.get_channel_power().await?;
        self.board
            .set_channel_power(current.difference(channels))
            .await?;
        info!(%channels, "Channels powered off");

        let power = self.board.get_channel_power().await?;
        Ok(RunReport {
            operation: Operation::PowerOff,
            outcomes: channels.iter().map(|ch| (ch, ChannelOutcome::Succeeded)).collect(),
            states: channels.iter().map(|ch| (ch, ChannelState::PowerOff)).collect(),
            power,
        })
    }

    /// Cold-boot `channels` into their application.
    pub async fn power_on(&mut self, channels: ChannelSet) -> Result<RunReport> {
        self.run(channels, Task::PowerCycle).await
    }

    /// Cold-boot `channels` and flash `firmware` into each.
    pub async fn program(
        &mut self,
        channels: ChannelSet,
        firmware: &Firmware,
    ) -> Result<RunReport> {
        self.run(channels, Task::Flash(firmware)).await
    }

    async fn run(&mut self, channels: ChannelSet, task: Task<'_>) -> Result<RunReport> {
        if channels.is_empty() {
            return Err(Error::EmptySelection);
        }
        info!(%channels, operation = %task.operation(), "Starting run");

        // Nothing may be routed to the link while power changes or it opens
        self.board.deselect_programming().await?;

        let mut states: BTreeMap<Channel, ChannelState> =
            channels.iter().map(|ch| (ch, ChannelState::Idle)).collect();

        let mut current = self.board.get_channel_power().await?;
        if current.intersects(channels) {
            let reduced = current.difference(channels);
            self.board.set_channel_power(reduced).await?;
            let delay = self.timing.discharge_delay();
            info!(
                channels = %current.intersection(channels),
                delay_ms = delay.as_millis() as u64,
                "Waiting for powered channels to discharge"
            );
            sleep(delay).await;
            current = reduced;
        }
        for channel in channels.iter() {
            transition(&mut states, channel, ChannelState::PowerOff);
        }

        self.board.set_channel_power(current.union(channels)).await?;
        for channel in channels.iter() {
            transition(&mut states, channel, ChannelState::PowerOn);
        }

        let mut link = self.connector.connect().await?;
        let mut outcomes = BTreeMap::new();
        let result = self
            .run_channels(&mut link, channels, task, &mut outcomes, &mut states)
            .await;

        if let Err(e) = &result {
            error!(error = %e, "Run aborted");
            if let Err(e) = self.board.deselect_programming().await {
                warn!(error = %e, "Failed to deselect programming after abort");
            }
        }
        if let Err(e) = link.close().await {
            warn!(error = %e, "Failed to close programming link");
        }
        result?;

        let power = self.board.get_channel_power().await?;
        let report = RunReport {
            operation: task.operation(),
            outcomes,
            states,
            power,
        };
        if report.success() {
            info!(%channels, "Run complete");
        } else {
            error!(failed = %report.failed(), "Run complete with failures");
        }
        Ok(report)
    }

    async fn run_channels<L: Bootloader>(
        &mut self,
        link: &mut L,
        channels: ChannelSet,
        task: Task<'_>,
        outcomes: &mut BTreeMap<Channel, ChannelOutcome>,
        states: &mut BTreeMap<Channel, ChannelState>,
    ) -> Result<()> {
        let settle = match task {
            Task::PowerCycle => self.timing.power_settle(),
            Task::Flash(_) => self.timing.program_settle(),
        };
        let flash_address = self.flash_address;

        for channel in channels.iter() {
            if self.cancel.is_cancelled() {
                warn!(%channel, "Cancelled before channel was started");
                outcomes.insert(channel, ChannelOutcome::Cancelled);
                continue;
            }

            let mut session = self.board.begin_programming(channel).await?;
            transition(states, channel, ChannelState::ProgrammingEnabled);
            sleep(settle).await;

            let outcome = match exchange(link, task, flash_address).await {
                Ok(()) => ChannelOutcome::Succeeded,
                Err((stage, e)) => {
                    error!(%channel, %stage, error = %e, "Channel failed");
                    session.isolate().await?;
                    ChannelOutcome::Failed {
                        stage,
                        error: e.to_string(),
                    }
                }
            };
            session.end().await?;
            transition(
                states,
                channel,
                ChannelState::ProgrammingDisabled(outcome.is_success()),
            );
            outcomes.insert(channel, outcome);
        }
        Ok(())
    }
}

fn transition(states: &mut BTreeMap<Channel, ChannelState>, channel: Channel, to: ChannelState) {
    if let Some(state) = states.get_mut(&channel) {
        debug!(%channel, from = %state, %to, "Channel state");
        *state = to;
    }
}

fn at(stage: Stage) -> impl FnOnce(Error) -> (Stage, Error) {
    move |e| (stage, e)
}

// Bootloader exchange for the channel currently routed to `link`.
async fn exchange<L: Bootloader>(
    link: &mut L,
    task: Task<'_>,
    flash_address: u32,
) -> std::result::Result<(), (Stage, Error)> {
    link.discard_input().await.map_err(at(Stage::Reset))?;
    link.reset_into_bootloader()
        .await
        .map_err(at(Stage::Reset))?;

    if let Task::Flash(firmware) = task {
        let info = link.identify().await.map_err(at(Stage::Identify))?;
        debug!(
            version = %format!("{:#04x}", info.version),
            product_id = %format!("{:#06x}", info.product_id),
            "Bootloader identified"
        );
        link.erase().await.map_err(at(Stage::Erase))?;
        link.write(flash_address, firmware.as_bytes())
            .await
            .map_err(at(Stage::Write))?;
        let readback = link
            .read(flash_address, firmware.len())
            .await
            .map_err(at(Stage::Verify))?;
        verify(firmware.as_bytes(), &readback).map_err(at(Stage::Verify))?;
        debug!(len = firmware.len(), "Flash verified");
    }

    link.jump(flash_address).await.map_err(at(Stage::Jump))?;
    Ok(())
}

fn verify(expected: &[u8], actual: &[u8]) -> Result<()> {
    if let Some((offset, (e, a))) = expected
        .iter()
        .zip(actual)
        .enumerate()
        .find(|(_, (e, a))| e != a)
    {
        return Err(Error::VerifyMismatch {
            offset,
            expected: *e,
            actual: *a,
        });
    }
    if actual.len() != expected.len() {
        return Err(crate::bootloader::BootloaderError::LengthOutOfRange(actual.len()).into());
    }
    Ok(())
}
