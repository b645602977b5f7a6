//! Hardware abstraction layer traits.
//!
//! This module defines the hardware interface traits that let the drivers
//! work against either the real register block or test doubles: the
//! memory-mapped register file exposed by the native driver, and the
//! register-encoded I2C bus built on top of it.

pub mod i2c;
pub mod registers;

pub use i2c::{I2c, SharedI2c};
pub use registers::RegisterFile;
