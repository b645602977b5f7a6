//! I2C master behind the SMC register block.
//!
//! A transaction is described by three 16-bit words and started by writing
//! the start register:
//!
//! ```text
//! I2C_WORD_0  [command byte      ][device address | R/W]
//! I2C_WORD_1  [sub-address       ][data 0             ]
//! I2C_WORD_2  [data 1            ][data 2             ]
//! ```
//!
//! The command byte packs the transfer shape:
//!
//! ```text
//!   7   6   5   4   3   2   1   0
//! [ 1   0   0 ][ rd-1 ][ wr-1 ][R/W]
//! ```
//!
//! `rd-1` is the number of bytes to read minus one, `wr-1` the number of
//! data bytes to write minus one (neither counts the device address or the
//! sub-address). For reads the result lands in `I2C_READ` once `I2C_IDLE`
//! goes non-zero.

use async_trait::async_trait;
use bitvec::prelude::*;
use std::fmt;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};

use super::regs;
use crate::config::SmcConfig;
use crate::error::{Error, Result};
use crate::hw_trait::{I2c, RegisterFile};
use crate::tracing::prelude::*;

/// Transfer direction, as carried in bit 0 of the command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Write = 0,
    Read = 1,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Write => write!(f, "write"),
            Direction::Read => write!(f, "read"),
        }
    }
}

/// Encoded transaction command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandByte(u8);

impl CommandByte {
    const MARKER: u8 = 0b100;
    pub const MAX_WRITE: usize = 3;
    pub const MAX_READ: usize = 2;

    /// Command for writing `len` data bytes.
    pub fn write(len: usize) -> Result<Self> {
        if !(1..=Self::MAX_WRITE).contains(&len) {
            return Err(Error::InvalidPayload {
                direction: Direction::Write,
                len,
            });
        }
        Ok(CommandFieldBuilder::new()
            .with_direction(Direction::Write)
            .with_write_count(len)
            .build())
    }

    /// Command for reading `len` bytes.
    pub fn read(len: usize) -> Result<Self> {
        if !(1..=Self::MAX_READ).contains(&len) {
            return Err(Error::InvalidPayload {
                direction: Direction::Read,
                len,
            });
        }
        Ok(CommandFieldBuilder::new()
            .with_direction(Direction::Read)
            .with_read_count(len)
            .build())
    }

    /// Interpret a raw command byte. Returns None if the marker bits are wrong.
    pub fn decode(byte: u8) -> Option<Self> {
        let view = byte.view_bits::<Lsb0>();
        (view[5..8].load::<u8>() == Self::MARKER).then_some(Self(byte))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn direction(self) -> Direction {
        if self.0.view_bits::<Lsb0>()[0] {
            Direction::Read
        } else {
            Direction::Write
        }
    }

    /// Number of data bytes moved in this command's direction.
    pub fn byte_count(self) -> usize {
        let view = self.0.view_bits::<Lsb0>();
        let field = match self.direction() {
            Direction::Write => &view[1..3],
            Direction::Read => &view[3..5],
        };
        usize::from(field.load::<u8>()) + 1
    }
}

struct CommandFieldBuilder {
    field: u8,
}

impl CommandFieldBuilder {
    fn new() -> Self {
        let mut field = 0u8;
        field.view_bits_mut::<Lsb0>()[5..8].store(CommandByte::MARKER);
        Self { field }
    }

    fn with_direction(mut self, direction: Direction) -> Self {
        let view = self.field.view_bits_mut::<Lsb0>();
        view.set(0, direction == Direction::Read);
        self
    }

    fn with_write_count(mut self, len: usize) -> Self {
        let view = self.field.view_bits_mut::<Lsb0>();
        view[1..3].store((len - 1) as u8);
        self
    }

    fn with_read_count(mut self, len: usize) -> Self {
        let view = self.field.view_bits_mut::<Lsb0>();
        view[3..5].store((len - 1) as u8);
        self
    }

    fn build(self) -> CommandByte {
        CommandByte(self.field)
    }
}

const MIN_POLL_INTERVAL: Duration = Duration::from_micros(1);

/// Register-encoded I2C master.
///
/// Owns the register file it drives. Every transaction waits for the idle
/// flag, polling at `poll_interval` for at most `poll_timeout`.
pub struct SmcI2c<R> {
    regs: R,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl<R: RegisterFile> SmcI2c<R> {
    pub fn new(regs: R, poll_interval: Duration, poll_timeout: Duration) -> Self {
        Self {
            regs,
            poll_interval,
            poll_timeout,
        }
    }

    pub fn from_config(regs: R, config: &SmcConfig) -> Self {
        Self::new(regs, config.poll_interval(), config.poll_timeout())
    }

    /// Borrow the underlying register file.
    pub fn registers(&self) -> &R {
        &self.regs
    }

    async fn write_reg(&mut self, offset: u16, value: u16) -> Result<()> {
        trace!("SMC {:#06x} <- {:#06x}", offset, value);
        self.regs.write16(offset, value).await
    }

    async fn start_and_wait(&mut self) -> Result<()> {
        self.write_reg(regs::I2C_START, 0x1).await?;

        // The timer wheel has millisecond resolution; bursting catches up on
        // the ticks a coarse wakeup skipped.
        let mut ticker = time::interval(self.poll_interval.max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
        let file = &mut self.regs;
        time::timeout(self.poll_timeout, async move {
            loop {
                ticker.tick().await;
                if file.read16(regs::I2C_IDLE).await? != 0 {
                    return Ok::<(), Error>(());
                }
            }
        })
        .await
        .map_err(|_| {
            error!("I2C transaction did not complete");
            Error::Timeout
        })?
    }
}

#[async_trait]
impl<R: RegisterFile> I2c for SmcI2c<R> {
    async fn write(&mut self, addr: u8, sub_addr: u8, data: &[u8]) -> Result<()> {
        let command = CommandByte::write(data.len())?;
        trace!(addr = %format!("{addr:#04x}"), sub_addr, data = %hex::encode(data), "I2C write");

        // mask away R/W bit
        self.write_reg(
            regs::I2C_WORD_0,
            u16::from(command.bits()) << 8 | u16::from(addr & 0xfe),
        )
        .await?;
        self.write_reg(
            regs::I2C_WORD_1,
            u16::from(sub_addr) << 8 | u16::from(data[0]),
        )
        .await?;
        if let [_, second, rest @ ..] = data {
            let third = rest.first().copied().unwrap_or(0);
            self.write_reg(
                regs::I2C_WORD_2,
                u16::from(*second) << 8 | u16::from(third),
            )
            .await?;
        }
        self.start_and_wait().await
    }

    async fn read(&mut self, addr: u8, sub_addr: u8, buffer: &mut [u8]) -> Result<()> {
        let command = CommandByte::read(buffer.len())?;

        // set R/W bit
        self.write_reg(
            regs::I2C_WORD_0,
            u16::from(command.bits()) << 8 | u16::from(addr & 0xfe) | 0x1,
        )
        .await?;
        self.write_reg(regs::I2C_WORD_1, u16::from(sub_addr) << 8).await?;
        self.start_and_wait().await?;

        let data = self.regs.read16(regs::I2C_READ).await?;
        trace!(addr = %format!("{addr:#04x}"), sub_addr, "I2C read {:#06x}", data);
        let len = buffer.len();
        match buffer {
            [only] => *only = (data & 0xff) as u8,
            [high, low] => {
                *high = (data >> 8) as u8;
                *low = (data & 0xff) as u8;
            }
            _ => {
                return Err(Error::InvalidPayload {
                    direction: Direction::Read,
                    len,
                })
            }
        }
        Ok(())
    }
}
