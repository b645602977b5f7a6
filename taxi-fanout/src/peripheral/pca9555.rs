//! PCA9555A 16-bit I2C GPIO expander driver.
//!
//! The expander has two 8-bit ports, each with an input, output, polarity
//! inversion and configuration (direction) register. Registers come in
//! pairs (port 0, port 1); a two-byte access starting at the port 0 register
//! covers both ports.
//!
//! 16-bit access convention: `(port_0 << 8) | port_1`.
//!
//! Datasheet: <https://www.nxp.com/part/PCA9555APW>

use crate::error::Result;
use crate::hw_trait::I2c;
use crate::tracing::prelude::*;

/// PCA9555 register addresses (port 0 of each pair).
pub mod registers {
    pub const INPUT: u8 = 0x00;
    pub const OUTPUT: u8 = 0x02;
    pub const POLARITY: u8 = 0x04;
    pub const CONFIGURATION: u8 = 0x06;
}

/// Port selection for register accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    Port0,
    Port1,
    /// Both ports as one 16-bit value
    Both,
}

/// PCA9555A driver.
///
/// Nothing is cached: every getter reads the device, so latched inputs and
/// outputs changed behind our back are always reported as they are.
pub struct Pca9555<I2C> {
    i2c: I2C,
    address: u8,
}

impl<I2C: I2c> Pca9555<I2C> {
    /// Create a driver for the expander at 8-bit bus address `address`.
    pub fn new(i2c: I2C, address: u8) -> Self {
        Self { i2c, address }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    async fn write_register(&mut self, register: u8, port: Port, value: u16) -> Result<()> {
        match port {
            Port::Both => {
                trace!(
                    "PCA9555 {:#04x} reg {:#04x} <- {:#06x}",
                    self.address,
                    register,
                    value
                );
                self.i2c
                    .write(self.address, register, &value.to_be_bytes())
                    .await
            }
            Port::Port0 | Port::Port1 => {
                let register = register | port_bit(port);
                trace!(
                    "PCA9555 {:#04x} reg {:#04x} <- {:#04x}",
                    self.address,
                    register,
                    value & 0xff
                );
                self.i2c
                    .write(self.address, register, &[(value & 0xff) as u8])
                    .await
            }
        }
    }

    async fn read_register(&mut self, register: u8, port: Port) -> Result<u16> {
        match port {
            Port::Both => {
                let mut data = [0u8; 2];
                self.i2c.read(self.address, register, &mut data).await?;
                Ok(u16::from_be_bytes(data))
            }
            Port::Port0 | Port::Port1 => {
                let mut data = [0u8; 1];
                self.i2c
                    .read(self.address, register | port_bit(port), &mut data)
                    .await?;
                Ok(u16::from(data[0]))
            }
        }
    }

    /// Configure pins as inputs or outputs.
    ///
    /// `mask` has one bit per pin: 1 = input, 0 = output.
    pub async fn set_direction(&mut self, port: Port, mask: u16) -> Result<()> {
        self.write_register(registers::CONFIGURATION, port, mask).await
    }

    /// Read back the pin directions (1 = input, 0 = output).
    pub async fn get_direction(&mut self, port: Port) -> Result<u16> {
        self.read_register(registers::CONFIGURATION, port).await
    }

    /// Set the output latch (1 = high, 0 = low).
    pub async fn set_output(&mut self, port: Port, value: u16) -> Result<()> {
        self.write_register(registers::OUTPUT, port, value).await
    }

    /// Read the output latch.
    pub async fn get_output(&mut self, port: Port) -> Result<u16> {
        self.read_register(registers::OUTPUT, port).await
    }

    /// Read the pin levels.
    pub async fn get_input(&mut self, port: Port) -> Result<u16> {
        self.read_register(registers::INPUT, port).await
    }
}

fn port_bit(port: Port) -> u8 {
    match port {
        Port::Port1 => 0x01,
        Port::Port0 | Port::Both => 0x00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeExpanders;

    const ADDR: u8 = 0x40;

    #[tokio::test]
    async fn test_single_port_register_selection() {
        let bus = FakeExpanders::new();
        let mut expander = Pca9555::new(bus.clone(), ADDR);

        expander.set_direction(Port::Port0, 0x00).await.unwrap();
        expander.set_direction(Port::Port1, 0xff).await.unwrap();
        expander.set_output(Port::Port0, 0x1a5).await.unwrap();

        let writes: Vec<_> = bus.writes().into_iter().map(|w| (w.sub_addr, w.data)).collect();
        assert_eq!(
            writes,
            vec![(0x06, vec![0x00]), (0x07, vec![0xff]), (0x02, vec![0xa5])]
        );
        assert_eq!(expander.get_output(Port::Port0).await.unwrap(), 0xa5);
        assert_eq!(expander.get_direction(Port::Port1).await.unwrap(), 0xff);
    }

    #[tokio::test]
    async fn test_both_ports_are_big_endian() {
        let bus = FakeExpanders::new();
        let mut expander = Pca9555::new(bus.clone(), ADDR);

        expander.set_output(Port::Both, 0x12f0).await.unwrap();
        assert_eq!(bus.writes()[0].data, vec![0x12, 0xf0]);
        assert_eq!(bus.register(ADDR, registers::OUTPUT), 0x12);
        assert_eq!(bus.register(ADDR, registers::OUTPUT + 1), 0xf0);
        assert_eq!(expander.get_output(Port::Both).await.unwrap(), 0x12f0);
        assert_eq!(expander.get_output(Port::Port1).await.unwrap(), 0xf0);
    }

    #[tokio::test]
    async fn test_inputs_always_read_fresh() {
        let bus = FakeExpanders::new();
        let mut expander = Pca9555::new(bus.clone(), ADDR);

        bus.set_input(ADDR, 1, 0xff);
        assert_eq!(expander.get_input(Port::Port1).await.unwrap(), 0xff);
        bus.set_input(ADDR, 1, 0xfd);
        assert_eq!(expander.get_input(Port::Port1).await.unwrap(), 0xfd);
        assert_eq!(expander.get_input(Port::Both).await.unwrap() & 0xff, 0xfd);
    }
}
