//! Domain value types shared across the crate.

pub mod channel;
pub mod firmware;

pub use channel::{Channel, ChannelSet};
pub use firmware::Firmware;
