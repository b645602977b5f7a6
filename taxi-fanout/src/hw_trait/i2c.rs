//! I2C hardware abstraction trait.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time;

use crate::error::{Error, Result};

/// Register-oriented I2C bus.
///
/// Device addresses are 8-bit bus addresses; the implementation owns the
/// R/W bit. Every transaction names the device register (`sub_addr`) it
/// starts at.
#[async_trait]
pub trait I2c: Send {
    /// Write `data` to consecutive registers starting at `sub_addr`.
    async fn write(&mut self, addr: u8, sub_addr: u8, data: &[u8]) -> Result<()>;

    /// Fill `buffer` from consecutive registers starting at `sub_addr`.
    async fn read(&mut self, addr: u8, sub_addr: u8, buffer: &mut [u8]) -> Result<()>;
}

/// Clonable handle that lets several device drivers share one bus.
///
/// Each transaction holds the lock for its whole duration, so transactions
/// from different drivers never interleave.
pub struct SharedI2c<I> {
    inner: Arc<Mutex<I>>,
}

impl<I> Clone for SharedI2c<I> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I: I2c> SharedI2c<I> {
    /// Upper bound on waiting for another driver's transaction.
    const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

    pub fn new(bus: I) -> Self {
        Self {
            inner: Arc::new(Mutex::new(bus)),
        }
    }
}

#[async_trait]
impl<I: I2c> I2c for SharedI2c<I> {
    async fn write(&mut self, addr: u8, sub_addr: u8, data: &[u8]) -> Result<()> {
        let mut bus = time::timeout(Self::LOCK_TIMEOUT, self.inner.lock())
            .await
            .map_err(|_| Error::BusLocked)?;
        bus.write(addr, sub_addr, data).await
    }

    async fn read(&mut self, addr: u8, sub_addr: u8, buffer: &mut [u8]) -> Result<()> {
        let mut bus = time::timeout(Self::LOCK_TIMEOUT, self.inner.lock())
            .await
            .map_err(|_| Error::BusLocked)?;
        bus.read(addr, sub_addr, buffer).await
    }
}
