//! TAXI fanout board controller.
//!
//! The board carries two PCA9555 expanders on the SMC I2C bus:
//!
//! | expander | port 0 | port 1 |
//! |---|---|---|
//! | power (ic6, `0x40`) | channel power enable (out) | channel power fault (in, active-low) |
//! | program (ic9, `0x42`) | programming select (low nibble out) | 24 V supply monitor (in, bits 7-6) |
//!
//! The programming-select lines drive a shared address/enable bus that
//! routes the one programming link to one channel. Selecting a channel is
//! only possible through [`FanoutBoard::begin_programming`], which hands out
//! a [`ProgrammingSession`] borrowing the board mutably; two channels can
//! therefore never be selected at once.

use serde::Serialize;
use std::fmt;

use crate::config::BoardConfig;
use crate::error::Result;
use crate::hw_trait::I2c;
use crate::peripheral::pca9555::{Pca9555, Port};
use crate::tracing::prelude::*;
use crate::types::{Channel, ChannelSet};

/// Pin directions written by [`FanoutBoard::setup`] (1 = input).
mod direction {
    pub const POWER_ENABLE: u16 = 0x00;
    pub const POWER_FAULT: u16 = 0xff;
    pub const PROGRAM_SELECT: u16 = 0xf0;
    pub const SUPPLY_MONITOR: u16 = 0xff;
}

/// Value driven onto the programming-select lines.
///
/// Bits 2-0 carry the channel address and bit 3 is the active-low enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgrammingSelector(u8);

impl ProgrammingSelector {
    const ADDRESS_MASK: u8 = 0b0111;
    const DISABLE: u8 = 0b1000;

    /// Build a selector; a disabled selector ignores `channel`.
    pub fn new(enable: bool, channel: Channel) -> Self {
        if enable {
            Self(channel.index() & Self::ADDRESS_MASK)
        } else {
            Self::none()
        }
    }

    /// Select `channel`.
    pub fn channel(channel: Channel) -> Self {
        Self::new(true, channel)
    }

    /// Select nothing.
    pub const fn none() -> Self {
        Self(Self::DISABLE)
    }

    /// The selected channel, if any.
    pub fn selected(self) -> Option<Channel> {
        if self.0 & Self::DISABLE != 0 {
            None
        } else {
            Channel::new(self.0 & Self::ADDRESS_MASK).ok()
        }
    }

    pub fn port_value(self) -> u8 {
        self.0
    }

    /// Decode the low nibble of a programming-select port value.
    pub fn from_port_value(value: u8) -> Self {
        Self(value & 0x0f)
    }
}

impl fmt::Display for ProgrammingSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.selected() {
            Some(channel) => write!(f, "channel {channel}"),
            None => write!(f, "none"),
        }
    }
}

/// The two redundant 24 V supply-monitor inputs (bit 0 and bit 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SupplyMonitor(u8);

impl SupplyMonitor {
    /// Unused low bits of the monitor port.
    const SHIFT: u32 = 6;

    fn from_port(value: u8) -> Self {
        Self(value >> Self::SHIFT)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    /// State of monitor input `index` (0 or 1).
    pub fn is_set(self, index: u8) -> bool {
        index < 2 && self.0 & (1 << index) != 0
    }
}

impl fmt::Display for SupplyMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04b}", self.0)
    }
}

/// Domain operations on the fanout board.
pub struct FanoutBoard<I2C> {
    power: Pca9555<I2C>,
    program: Pca9555<I2C>,
}

impl<I2C: I2c + Clone> FanoutBoard<I2C> {
    /// Bind both expanders to the addresses in `config`, sharing `i2c`.
    pub fn new(i2c: I2C, config: &BoardConfig) -> Self {
        Self {
            power: Pca9555::new(i2c.clone(), config.power_expander),
            program: Pca9555::new(i2c, config.program_expander),
        }
    }
}

impl<I2C: I2c> FanoutBoard<I2C> {
    /// Program the expander pin directions to match the board wiring.
    pub async fn setup(&mut self) -> Result<()> {
        self.power
            .set_direction(Port::Port0, direction::POWER_ENABLE)
            .await?;
        self.power
            .set_direction(Port::Port1, direction::POWER_FAULT)
            .await?;
        self.program
            .set_direction(Port::Port0, direction::PROGRAM_SELECT)
            .await?;
        self.program
            .set_direction(Port::Port1, direction::SUPPLY_MONITOR)
            .await?;
        self.deselect_programming().await?;
        debug!(
            power = %format!("{:#04x}", self.power.address()),
            program = %format!("{:#04x}", self.program.address()),
            "Fanout board expanders configured"
        );
        Ok(())
    }

    /// Drive the power-enable lines: exactly the channels in `channels` on.
    pub async fn set_channel_power(&mut self, channels: ChannelSet) -> Result<()> {
        debug!(mask = %format!("{:#010b}", channels.bits()), "Set channel power");
        self.power
            .set_output(Port::Port0, u16::from(channels.bits()))
            .await
    }

    /// Channels whose power enable is currently driven on.
    pub async fn get_channel_power(&mut self) -> Result<ChannelSet> {
        let value = self.power.get_output(Port::Port0).await?;
        Ok(ChannelSet::from_bits(low_byte(value)))
    }

    /// Drive the programming-select lines.
    ///
    /// Selecting a channel implicitly deselects whichever channel was
    /// selected before, so this stays private to the crate; see
    /// [`Self::begin_programming`].
    pub(crate) async fn set_channel_programming(
        &mut self,
        selector: ProgrammingSelector,
    ) -> Result<()> {
        trace!(%selector, "Set programming select");
        self.program
            .set_output(Port::Port0, u16::from(selector.port_value()))
            .await
    }

    /// Route the programming link to `channel` until the session ends.
    pub async fn begin_programming(
        &mut self,
        channel: Channel,
    ) -> Result<ProgrammingSession<'_, I2C>> {
        self.set_channel_programming(ProgrammingSelector::channel(channel))
            .await?;
        debug!(%channel, "Programming select enabled");
        Ok(ProgrammingSession {
            board: self,
            channel,
            ended: false,
        })
    }

    /// Deselect every channel.
    pub async fn deselect_programming(&mut self) -> Result<()> {
        self.set_channel_programming(ProgrammingSelector::none())
            .await
    }

    /// Read back the programming-select lines.
    pub async fn get_channel_programming(&mut self) -> Result<ProgrammingSelector> {
        let value = self.program.get_output(Port::Port0).await?;
        Ok(ProgrammingSelector::from_port_value(low_byte(value)))
    }

    /// State of the two 24 V supply-monitor inputs.
    pub async fn get_power_monitor(&mut self) -> Result<SupplyMonitor> {
        let value = self.program.get_input(Port::Port1).await?;
        Ok(SupplyMonitor::from_port(low_byte(value)))
    }

    /// Raw power-fault port: bit i low means channel i is overcurrent.
    pub async fn get_channel_fault(&mut self) -> Result<u8> {
        let value = self.power.get_input(Port::Port1).await?;
        Ok(low_byte(value))
    }
}

fn low_byte(value: u16) -> u8 {
    (value & 0xff) as u8
}

/// Exclusive programming access to one channel.
///
/// Holds the board mutably, so nothing else can touch the select lines
/// while it is alive. Finish with [`Self::end`].
pub struct ProgrammingSession<'a, I2C: I2c> {
    board: &'a mut FanoutBoard<I2C>,
    channel: Channel,
    ended: bool,
}

impl<I2C: I2c> ProgrammingSession<'_, I2C> {
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Remove power from this channel, leaving every other channel as is.
    pub async fn isolate(&mut self) -> Result<()> {
        let mut powered = self.board.get_channel_power().await?;
        powered.remove(self.channel);
        self.board.set_channel_power(powered).await?;
        error!(channel = %self.channel, "Channel isolated (powered off)");
        Ok(())
    }

    /// Deselect the channel and release the board.
    pub async fn end(mut self) -> Result<()> {
        self.ended = true;
        self.board.deselect_programming().await?;
        debug!(channel = %self.channel, "Programming select disabled");
        Ok(())
    }
}

impl<I2C: I2c> Drop for ProgrammingSession<'_, I2C> {
    fn drop(&mut self) {
        if !self.ended {
            warn!(
                channel = %self.channel,
                "Programming session dropped without deselecting"
            );
        }
    }
}
