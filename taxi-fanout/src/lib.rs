//! Power and programming sequencer for the TAXI uDAQ fanout board.
//!
//! Layers, from the register window up:
//!
//! - [`smc`]: the memory-mapped SMC register block and the I2C transaction
//!   codec built on it
//! - [`peripheral::pca9555`]: the GPIO expander driver
//! - [`board`]: channel power, programming select, fault and supply monitor
//! - [`sequencer`]: power sequencing and per-channel bootloader runs

pub mod board;
pub mod bootloader;
pub mod config;
pub mod error;
pub mod hw_trait;
pub mod peripheral;
pub mod sequencer;
pub mod smc;
pub mod tracing;
pub mod types;

#[cfg(test)]
mod testing;

pub use error::{Error, ErrorKind, Result};
