//! Bootloader collaborator interface.
//!
//! The sequencer never speaks a bootloader wire protocol itself. It powers a
//! channel, routes the shared programming link to it and then hands control
//! to a [`Bootloader`] obtained from a [`Connector`]. The link is opened once
//! per run and reused for every channel, so stale input must be discarded
//! between channels.
//!
//! [`stm32`] provides the implementation used on the TAXI hardware.

pub mod stm32;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::Result;

/// Errors reported by a bootloader exchange.
#[derive(Error, Debug)]
pub enum BootloaderError {
    /// No reply within the response timeout
    #[error("no response from bootloader")]
    Timeout,

    /// The bootloader refused a command or its arguments
    #[error("bootloader replied NACK")]
    Nack,

    /// A reply byte that is neither ACK nor NACK
    #[error("unexpected response byte {0:#04x}")]
    UnexpectedResponse(u8),

    /// The bootloader does not list a command we need
    #[error("bootloader does not support command {0:#04x}")]
    Unsupported(u8),

    /// A transfer length the protocol cannot express
    #[error("transfer length {0} out of range")]
    LengthOutOfRange(usize),
}

/// What a bootloader reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootloaderInfo {
    /// Protocol version, BCD (0x31 = 3.1)
    pub version: u8,

    /// Supported command codes
    pub commands: Vec<u8>,

    /// Product identifier
    pub product_id: u16,
}

impl BootloaderInfo {
    pub fn supports(&self, command: u8) -> bool {
        self.commands.contains(&command)
    }
}

/// Transport-level operations on the shared programming link.
#[async_trait]
pub trait Link: Send {
    /// Drop any bytes already received but not yet read.
    async fn discard_input(&mut self) -> Result<()>;

    /// Release the link. Further use is an error.
    async fn close(&mut self) -> Result<()>;
}

/// Operations of a microcontroller ROM bootloader.
///
/// Each call acts on whichever channel is currently routed to the link.
#[async_trait]
pub trait Bootloader: Link {
    /// Reset the target with the boot pins selecting the bootloader, and
    /// synchronise with it.
    async fn reset_into_bootloader(&mut self) -> Result<()>;

    /// Query version, supported commands and product id.
    async fn identify(&mut self) -> Result<BootloaderInfo>;

    /// Erase the whole user flash.
    async fn erase(&mut self) -> Result<()>;

    /// Write `data` starting at `address`.
    async fn write(&mut self, address: u32, data: &[u8]) -> Result<()>;

    /// Read `len` bytes starting at `address`.
    async fn read(&mut self, address: u32, len: usize) -> Result<Vec<u8>>;

    /// Start executing at `address`.
    async fn jump(&mut self, address: u32) -> Result<()>;
}

/// Opens the programming link.
#[async_trait]
pub trait Connector: Send {
    type Link: Bootloader;

    async fn connect(&mut self) -> Result<Self::Link>;
}
