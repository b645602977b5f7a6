//! TAXI system management controller (SMC) register block.
//!
//! The SMC exposes a small window of 16-bit registers. Besides the gateware
//! build stamp ([`BuildInfo`]) it carries an I2C master that is driven by writing a
//! packed command into three words and latching it with a start register;
//! see [`i2c`] for the transaction encoding.

pub mod i2c;

use async_trait::async_trait;
use rustix::mm::{self, MapFlags, ProtFlags};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::hw_trait::RegisterFile;
use crate::tracing::prelude::*;

pub use i2c::SmcI2c;

/// Register offsets within the SMC window.
pub mod regs {
    pub const BUILD_YEAR: u16 = 0x0008;
    pub const BUILD_MONTH: u16 = 0x000A;
    pub const BUILD_DAY: u16 = 0x000C;
    pub const BUILD_VERSION: u16 = 0x000E;

    /// Command byte (high) and device address with R/W bit (low)
    pub const I2C_WORD_0: u16 = 0x1500;
    /// Sub-address (high) and first data byte (low)
    pub const I2C_WORD_1: u16 = 0x1502;
    /// Second (high) and third (low) data byte
    pub const I2C_WORD_2: u16 = 0x1504;
    /// Write 1 to start the transaction
    pub const I2C_START: u16 = 0x1506;
    /// Read result: first byte (high) and second byte (low) for two-byte reads
    pub const I2C_READ: u16 = 0x1508;
    /// Non-zero when the I2C master is idle
    pub const I2C_IDLE: u16 = 0x150A;
}

/// Gateware build stamp. Each field is BCD-style: the hex digits read as
/// the decimal date, so 0x2024 is the year 2024.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildInfo {
    pub year: u16,
    pub month: u16,
    pub day: u16,
    pub version: u16,
}

impl BuildInfo {
    pub async fn read<R: RegisterFile + ?Sized>(file: &mut R) -> Result<Self> {
        Ok(Self {
            year: file.read16(regs::BUILD_YEAR).await?,
            month: file.read16(regs::BUILD_MONTH).await?,
            day: file.read16(regs::BUILD_DAY).await?,
            version: file.read16(regs::BUILD_VERSION).await?,
        })
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04X}-{:02X}-{:02X} v{:04X}",
            self.year, self.month, self.day, self.version
        )
    }
}

/// SMC register window mapped from a device node.
pub struct SmcRegisters {
    base: NonNull<u8>,
    len: usize,
    _file: File,
}

impl fmt::Debug for SmcRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmcRegisters")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

// SAFETY: the mapping is owned exclusively by this value and only accessed
// through `&mut self`, so moving it to another thread is sound.
unsafe impl Send for SmcRegisters {}

impl SmcRegisters {
    /// Map `len` bytes of the register window behind `path`.
    pub fn open(path: &Path, len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::Hardware(format!("failed to open {}: {e}", path.display())))?;

        // SAFETY: a fresh shared mapping that no other Rust object aliases;
        // it is unmapped in Drop.
        let ptr = unsafe {
            mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &file,
                0,
            )
        }
        .map_err(|e| Error::Hardware(format!("failed to map {}: {e}", path.display())))?;

        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::Hardware("register window mapped at null".to_string()))?;
        debug!(device = %path.display(), len, "Mapped SMC register window");

        Ok(Self {
            base,
            len,
            _file: file,
        })
    }

    fn register(&self, offset: u16) -> Result<*mut u16> {
        let offset = usize::from(offset);
        if offset % 2 != 0 || offset + 2 > self.len {
            return Err(Error::Hardware(format!(
                "register offset {offset:#06x} outside the {:#x}-byte window",
                self.len
            )));
        }
        // SAFETY: offset is aligned and in bounds of the mapping.
        Ok(unsafe { self.base.as_ptr().add(offset) }.cast::<u16>())
    }
}

#[async_trait]
impl RegisterFile for SmcRegisters {
    async fn read16(&mut self, offset: u16) -> Result<u16> {
        let reg = self.register(offset)?;
        // SAFETY: `register` validated the pointer; device memory needs volatile access.
        Ok(unsafe { reg.read_volatile() })
    }

    async fn write16(&mut self, offset: u16, value: u16) -> Result<()> {
        let reg = self.register(offset)?;
        // SAFETY: as above.
        unsafe { reg.write_volatile(value) };
        Ok(())
    }
}

impl Drop for SmcRegisters {
    fn drop(&mut self) {
        // SAFETY: base/len describe the mapping created in `open`.
        if let Err(e) = unsafe { mm::munmap(self.base.as_ptr().cast(), self.len) } {
            warn!(error = %e, "Failed to unmap SMC register window");
        }
    }
}
