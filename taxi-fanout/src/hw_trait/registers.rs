//! Memory-mapped register file abstraction.

use async_trait::async_trait;

use crate::error::Result;

/// 16-bit register file addressed by byte offset.
///
/// This is the seam to the native register driver. Implementations own
/// their handle; nothing in the crate reaches for a process-wide one.
#[async_trait]
pub trait RegisterFile: Send {
    /// Read the 16-bit register at `offset`.
    async fn read16(&mut self, offset: u16) -> Result<u16>;

    /// Write the 16-bit register at `offset`.
    async fn write16(&mut self, offset: u16, value: u16) -> Result<()>;
}
