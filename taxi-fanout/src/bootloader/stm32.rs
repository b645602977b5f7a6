//! STM32 system-memory bootloader over USART (ST AN3155).
//!
//! The uDAQ microcontrollers are started in their ROM bootloader by holding
//! BOOT0 high across a reset pulse. Both are modem-control lines, by default
//! RTS for BOOT0 and DTR for reset; see [`LineWiring`]. After the `0x7F` sync byte
//! every command is sent as the command code followed by its complement and
//! answered with ACK (`0x79`) or NACK (`0x1F`). Addresses and data blocks
//! carry an XOR checksum.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, timeout};
use tokio_serial::{
    ClearBuffer, DataBits, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits,
};

use super::{Bootloader, BootloaderError, BootloaderInfo, Connector, Link};
use crate::config::BootloaderConfig;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Bootloader command codes.
pub mod command {
    pub const GET: u8 = 0x00;
    pub const GET_VERSION: u8 = 0x01;
    pub const GET_ID: u8 = 0x02;
    pub const READ_MEMORY: u8 = 0x11;
    pub const GO: u8 = 0x21;
    pub const WRITE_MEMORY: u8 = 0x31;
    pub const ERASE: u8 = 0x43;
    pub const EXTENDED_ERASE: u8 = 0x44;
}

const ACK: u8 = 0x79;
const NACK: u8 = 0x1f;
const SYNC: u8 = 0x7f;

/// Largest block moved by one read or write command.
pub const MAX_TRANSFER: usize = 256;

const RESET_PULSE: Duration = Duration::from_millis(100);
const BOOT_DELAY: Duration = Duration::from_millis(500);
const ERASE_TIMEOUT: Duration = Duration::from_secs(30);

/// Serial modem-control line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    Dtr,
    Rts,
}

/// How reset and BOOT0 are wired to the modem-control lines.
///
/// The default drives reset on DTR, asserted when DTR is set, and BOOT0 on
/// RTS, high when RTS is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineWiring {
    pub swap_rts_dtr: bool,
    pub reset_active_high: bool,
    pub boot0_active_low: bool,
}

impl LineWiring {
    pub fn from_config(config: &BootloaderConfig) -> Self {
        Self {
            swap_rts_dtr: config.swap_rts_dtr,
            reset_active_high: config.reset_active_high,
            boot0_active_low: config.boot0_active_low,
        }
    }

    /// Line and level that put reset in the `asserted` state.
    pub fn reset(self, asserted: bool) -> (Line, bool) {
        let line = if self.swap_rts_dtr { Line::Rts } else { Line::Dtr };
        (line, asserted != self.reset_active_high)
    }

    /// Line and level that drive BOOT0 `high` or low.
    pub fn boot0(self, high: bool) -> (Line, bool) {
        let line = if self.swap_rts_dtr { Line::Dtr } else { Line::Rts };
        (line, high != self.boot0_active_low)
    }
}

/// Modem-control lines of the port the bootloader is reached through.
pub trait ControlLines: Send {
    fn set_line(&mut self, line: Line, level: bool) -> Result<()>;
    fn clear_input(&mut self) -> Result<()>;
}

impl ControlLines for SerialStream {
    fn set_line(&mut self, line: Line, level: bool) -> Result<()> {
        match line {
            Line::Dtr => self.write_data_terminal_ready(level)?,
            Line::Rts => self.write_request_to_send(level)?,
        }
        Ok(())
    }

    fn clear_input(&mut self) -> Result<()> {
        Ok(self.clear(ClearBuffer::Input)?)
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Big-endian address followed by its checksum.
fn address_frame(address: u32) -> BytesMut {
    let mut frame = BytesMut::with_capacity(5);
    frame.put_u32(address);
    let sum = checksum(&frame);
    frame.put_u8(sum);
    frame
}

/// Length byte, data padded to a multiple of four with 0xFF, checksum.
fn write_frame(data: &[u8]) -> Result<BytesMut> {
    if data.is_empty() || data.len() > MAX_TRANSFER {
        return Err(BootloaderError::LengthOutOfRange(data.len()).into());
    }
    let padded = data.len().div_ceil(4) * 4;
    let mut frame = BytesMut::with_capacity(padded + 2);
    frame.put_u8((padded - 1) as u8);
    frame.put_slice(data);
    frame.put_bytes(0xff, padded - data.len());
    let sum = checksum(&frame);
    frame.put_u8(sum);
    Ok(frame)
}

/// Bootloader client on a serial stream.
pub struct SerialBootloader<S> {
    port: S,
    response_timeout: Duration,
    wiring: LineWiring,
    info: Option<BootloaderInfo>,
    closed: bool,
}

impl<S> SerialBootloader<S>
where
    S: AsyncRead + AsyncWrite + ControlLines + Unpin + Send,
{
    pub fn new(port: S, response_timeout: Duration) -> Self {
        Self {
            port,
            response_timeout,
            wiring: LineWiring::default(),
            info: None,
            closed: false,
        }
    }

    pub fn with_wiring(mut self, wiring: LineWiring) -> Self {
        self.wiring = wiring;
        self
    }

    fn set_reset(&mut self, asserted: bool) -> Result<()> {
        let (line, level) = self.wiring.reset(asserted);
        self.port.set_line(line, level)
    }

    fn set_boot0(&mut self, high: bool) -> Result<()> {
        let (line, level) = self.wiring.boot0(high);
        self.port.set_line(line, level)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "bootloader link closed",
            )));
        }
        Ok(())
    }

    // Refuse commands the last identify did not list.
    fn ensure_supported(&self, code: u8) -> Result<()> {
        match &self.info {
            Some(info) if !info.supports(code) => Err(BootloaderError::Unsupported(code).into()),
            _ => Ok(()),
        }
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        trace!(tx = %hex::encode(bytes), "Bootloader");
        self.port.write_all(bytes).await?;
        self.port.flush().await?;
        Ok(())
    }

    async fn receive(&mut self, buffer: &mut [u8], wait: Duration) -> Result<()> {
        timeout(wait, self.port.read_exact(buffer))
            .await
            .map_err(|_| Error::from(BootloaderError::Timeout))??;
        trace!(rx = %hex::encode(&buffer[..]), "Bootloader");
        Ok(())
    }

    async fn receive_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.receive(&mut byte, self.response_timeout).await?;
        Ok(byte[0])
    }

    async fn expect_ack_within(&mut self, wait: Duration) -> Result<()> {
        let mut byte = [0u8; 1];
        self.receive(&mut byte, wait).await?;
        match byte[0] {
            ACK => Ok(()),
            NACK => Err(BootloaderError::Nack.into()),
            other => Err(BootloaderError::UnexpectedResponse(other).into()),
        }
    }

    async fn expect_ack(&mut self) -> Result<()> {
        self.expect_ack_within(self.response_timeout).await
    }

    async fn command(&mut self, code: u8) -> Result<()> {
        self.ensure_open()?;
        self.send(&[code, !code]).await?;
        self.expect_ack().await
    }

    async fn get(&mut self) -> Result<(u8, Vec<u8>)> {
        self.command(command::GET).await?;
        let count = usize::from(self.receive_byte().await?);
        let version = self.receive_byte().await?;
        let mut commands = vec![0u8; count];
        self.receive(&mut commands, self.response_timeout).await?;
        self.expect_ack().await?;
        Ok((version, commands))
    }

    async fn get_id(&mut self) -> Result<u16> {
        self.command(command::GET_ID).await?;
        let count = usize::from(self.receive_byte().await?) + 1;
        let mut id = vec![0u8; count];
        self.receive(&mut id, self.response_timeout).await?;
        self.expect_ack().await?;
        Ok(id.iter().fold(0u16, |acc, b| (acc << 8) | u16::from(*b)))
    }

    async fn write_block(&mut self, address: u32, block: &[u8]) -> Result<()> {
        let frame = write_frame(block)?;
        self.command(command::WRITE_MEMORY).await?;
        self.send(&address_frame(address)).await?;
        self.expect_ack().await?;
        self.send(&frame).await?;
        self.expect_ack().await
    }

    async fn read_block(&mut self, address: u32, block: &mut [u8]) -> Result<()> {
        if block.is_empty() || block.len() > MAX_TRANSFER {
            return Err(BootloaderError::LengthOutOfRange(block.len()).into());
        }
        let count = (block.len() - 1) as u8;
        self.command(command::READ_MEMORY).await?;
        self.send(&address_frame(address)).await?;
        self.expect_ack().await?;
        self.send(&[count, !count]).await?;
        self.expect_ack().await?;
        self.receive(block, self.response_timeout).await
    }
}

#[async_trait]
impl<S> Link for SerialBootloader<S>
where
    S: AsyncRead + AsyncWrite + ControlLines + Unpin + Send,
{
    async fn discard_input(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.port.clear_input()
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.port.shutdown().await?;
        debug!("Bootloader link closed");
        Ok(())
    }
}

#[async_trait]
impl<S> Bootloader for SerialBootloader<S>
where
    S: AsyncRead + AsyncWrite + ControlLines + Unpin + Send,
{
    async fn reset_into_bootloader(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.info = None;
        self.set_boot0(true)?;
        self.set_reset(true)?;
        sleep(RESET_PULSE).await;
        self.set_reset(false)?;
        sleep(BOOT_DELAY).await;

        self.port.clear_input()?;
        self.send(&[SYNC]).await?;
        // NACK means the bootloader had already seen a sync byte
        match self.receive_byte().await? {
            ACK | NACK => Ok(()),
            other => Err(BootloaderError::UnexpectedResponse(other).into()),
        }
    }

    async fn identify(&mut self) -> Result<BootloaderInfo> {
        let (version, commands) = self.get().await?;
        let product_id = self.get_id().await?;
        let info = BootloaderInfo {
            version,
            commands,
            product_id,
        };
        self.info = Some(info.clone());
        Ok(info)
    }

    async fn erase(&mut self) -> Result<()> {
        let extended = self
            .info
            .as_ref()
            .is_some_and(|info| info.supports(command::EXTENDED_ERASE));
        if extended {
            self.command(command::EXTENDED_ERASE).await?;
            self.send(&[0xff, 0xff, 0x00]).await?;
        } else {
            self.ensure_supported(command::ERASE)?;
            self.command(command::ERASE).await?;
            self.send(&[0xff, 0x00]).await?;
        }
        self.expect_ack_within(ERASE_TIMEOUT).await
    }

    async fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(BootloaderError::LengthOutOfRange(0).into());
        }
        self.ensure_supported(command::WRITE_MEMORY)?;
        let mut block_address = address;
        for block in data.chunks(MAX_TRANSFER) {
            self.write_block(block_address, block).await?;
            block_address = block_address.wrapping_add(block.len() as u32);
        }
        Ok(())
    }

    async fn read(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Err(BootloaderError::LengthOutOfRange(0).into());
        }
        self.ensure_supported(command::READ_MEMORY)?;
        let mut data = vec![0u8; len];
        let mut block_address = address;
        for block in data.chunks_mut(MAX_TRANSFER) {
            self.read_block(block_address, block).await?;
            block_address = block_address.wrapping_add(block.len() as u32);
        }
        Ok(data)
    }

    async fn jump(&mut self, address: u32) -> Result<()> {
        self.ensure_supported(command::GO)?;
        self.command(command::GO).await?;
        self.send(&address_frame(address)).await?;
        self.expect_ack().await?;
        // Boot the application on the next hardware reset
        self.set_boot0(false)
    }
}

/// Opens the programming serial port.
pub struct SerialConnector {
    config: BootloaderConfig,
}

impl SerialConnector {
    pub fn new(config: BootloaderConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    type Link = SerialBootloader<SerialStream>;

    async fn connect(&mut self) -> Result<Self::Link> {
        let port = tokio_serial::new(&self.config.port, self.config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::Even)
            .stop_bits(StopBits::One)
            .open_native_async()?;
        info!(
            port = %self.config.port,
            baud_rate = self.config.baud_rate,
            "Opened bootloader port"
        );
        Ok(SerialBootloader::new(port, self.config.response_timeout())
            .with_wiring(LineWiring::from_config(&self.config)))
    }
}
