//! Test doubles shared by the unit tests.
//!
//! All fakes are cheap to clone; clones share state, so a test keeps one
//! handle for assertions and gives the other to the code under test.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::Arc;
use tokio::time::Instant;

use crate::board::ProgrammingSelector;
use crate::bootloader::{Bootloader, BootloaderError, BootloaderInfo, Connector, Link};
use crate::error::{Error, Result};
use crate::hw_trait::{I2c, RegisterFile};
use crate::peripheral::pca9555::registers;
use crate::sequencer::Stage;
use crate::smc::regs;
use crate::types::{Channel, ChannelSet};

/// Default power/fault expander address.
pub const POWER: u8 = 0x40;
/// Default programming/monitor expander address.
pub const PROGRAM: u8 = 0x42;

// Register file

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegOp {
    Read(u16),
    Write(u16, u16),
}

#[derive(Default)]
struct RegState {
    ops: Vec<RegOp>,
    read_value: u16,
    busy_polls: usize,
    values: HashMap<u16, u16>,
}

/// Register file that records every access.
///
/// The idle flag reads busy for the configured number of polls and idle
/// after that; the read-result register returns a fixed value. Other
/// registers read as set by `with_register`, or zero.
#[derive(Clone, Default)]
pub struct ScriptedRegisters {
    state: Arc<Mutex<RegState>>,
}

impl ScriptedRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_read_value(self, value: u16) -> Self {
        self.state.lock().read_value = value;
        self
    }

    pub fn with_register(self, offset: u16, value: u16) -> Self {
        self.state.lock().values.insert(offset, value);
        self
    }

    pub fn with_busy_polls(self, polls: usize) -> Self {
        self.state.lock().busy_polls = polls;
        self
    }

    pub fn ops(&self) -> Vec<RegOp> {
        self.state.lock().ops.clone()
    }

    pub fn writes(&self) -> Vec<(u16, u16)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                RegOp::Write(offset, value) => Some((offset, value)),
                RegOp::Read(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl RegisterFile for ScriptedRegisters {
    async fn read16(&mut self, offset: u16) -> Result<u16> {
        let mut state = self.state.lock();
        state.ops.push(RegOp::Read(offset));
        let value = match offset {
            regs::I2C_IDLE if state.busy_polls > 0 => {
                state.busy_polls -= 1;
                0
            }
            regs::I2C_IDLE => 1,
            regs::I2C_READ => state.read_value,
            other => state.values.get(&other).copied().unwrap_or(0),
        };
        Ok(value)
    }

    async fn write16(&mut self, offset: u16, value: u16) -> Result<()> {
        self.state.lock().ops.push(RegOp::Write(offset, value));
        Ok(())
    }
}

// Expanders

/// One recorded I2C write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I2cWrite {
    pub at: Instant,
    pub addr: u8,
    pub sub_addr: u8,
    pub data: Vec<u8>,
}

struct BusState {
    registers: HashMap<u8, [u8; 8]>,
    writes: Vec<I2cWrite>,
    remaining: Option<usize>,
}

/// Behavioural model of the board's two PCA9555 expanders.
///
/// Outputs start low, inputs high (no faults). Writes to input registers
/// are accepted and ignored, as on the real part.
#[derive(Clone)]
pub struct FakeExpanders {
    state: Arc<Mutex<BusState>>,
}

impl FakeExpanders {
    pub fn new() -> Self {
        let reset = [0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0xff, 0xff];
        let registers = HashMap::from([(POWER, reset), (PROGRAM, reset)]);
        Self {
            state: Arc::new(Mutex::new(BusState {
                registers,
                writes: Vec::new(),
                remaining: None,
            })),
        }
    }

    /// Let `transactions` more transactions through, then fail every one.
    pub fn fail_after(&self, transactions: usize) {
        self.state.lock().remaining = Some(transactions);
    }

    pub fn writes(&self) -> Vec<I2cWrite> {
        self.state.lock().writes.clone()
    }

    pub fn register(&self, addr: u8, register: u8) -> u8 {
        self.state.lock().registers[&addr][usize::from(register)]
    }

    pub fn set_input(&self, addr: u8, port: u8, value: u8) {
        let mut state = self.state.lock();
        if let Some(bank) = state.registers.get_mut(&addr) {
            bank[usize::from(registers::INPUT | (port & 1))] = value;
        }
    }

    /// Current power-enable output.
    pub fn power(&self) -> ChannelSet {
        ChannelSet::from_bits(self.register(POWER, registers::OUTPUT))
    }

    /// Channel currently routed to the programming link.
    pub fn selected(&self) -> Option<Channel> {
        ProgrammingSelector::from_port_value(self.register(PROGRAM, registers::OUTPUT)).selected()
    }

    /// Every value written to the power-enable port, in order.
    pub fn power_writes(&self) -> Vec<(Instant, u8)> {
        self.port0_output_writes(POWER)
    }

    /// Every value written to the programming-select port, in order.
    pub fn select_writes(&self) -> Vec<(Instant, u8)> {
        self.port0_output_writes(PROGRAM)
    }

    fn port0_output_writes(&self, addr: u8) -> Vec<(Instant, u8)> {
        self.writes()
            .into_iter()
            .filter(|w| w.addr == addr && w.sub_addr == registers::OUTPUT)
            .filter_map(|w| w.data.first().map(|value| (w.at, *value)))
            .collect()
    }
}

// Consecutive bytes toggle between the two registers of a pair.
fn pair_index(sub_addr: u8, offset: usize) -> usize {
    let low = (usize::from(sub_addr) + offset) & 1;
    (usize::from(sub_addr) & !1) | low
}

impl BusState {
    fn begin(&mut self, addr: u8, sub_addr: u8) -> Result<()> {
        match self.remaining {
            Some(0) => return Err(Error::Timeout),
            Some(ref mut n) => *n -= 1,
            None => {}
        }
        if !self.registers.contains_key(&addr) {
            return Err(Error::Hardware(format!("no device at {addr:#04x}")));
        }
        if sub_addr >= 8 {
            return Err(Error::Hardware(format!("no register {sub_addr:#04x}")));
        }
        Ok(())
    }
}

#[async_trait]
impl I2c for FakeExpanders {
    async fn write(&mut self, addr: u8, sub_addr: u8, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.begin(addr, sub_addr)?;
        state.writes.push(I2cWrite {
            at: Instant::now(),
            addr,
            sub_addr,
            data: data.to_vec(),
        });
        if let Some(bank) = state.registers.get_mut(&addr) {
            for (offset, byte) in data.iter().enumerate() {
                let index = pair_index(sub_addr, offset);
                if index >= 2 {
                    bank[index] = *byte;
                }
            }
        }
        Ok(())
    }

    async fn read(&mut self, addr: u8, sub_addr: u8, buffer: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.begin(addr, sub_addr)?;
        let bank = state.registers[&addr];
        for (offset, byte) in buffer.iter_mut().enumerate() {
            *byte = bank[pair_index(sub_addr, offset)];
        }
        Ok(())
    }
}

// Bootloader

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOp {
    Connect,
    Discard,
    Reset,
    Identify,
    Erase,
    Write { address: u32, len: usize },
    Read { address: u32, len: usize },
    Jump(u32),
    Close,
}

/// One recorded link operation and the channel selected when it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub at: Instant,
    pub channel: Option<Channel>,
    pub op: LinkOp,
}

#[derive(Default)]
struct LinkState {
    events: Vec<LinkEvent>,
    failures: HashSet<(Channel, Stage)>,
    corrupt: HashSet<Channel>,
    flash: HashMap<Channel, BTreeMap<u32, u8>>,
    refuse_connect: bool,
}

/// Scripted bootloader on every channel.
///
/// The target of each operation is whichever channel the fake expanders
/// currently route the link to; with nothing selected, target operations
/// time out.
#[derive(Clone)]
pub struct FakeConnector {
    bus: FakeExpanders,
    state: Arc<Mutex<LinkState>>,
}

impl FakeConnector {
    pub fn new(bus: &FakeExpanders) -> Self {
        Self {
            bus: bus.clone(),
            state: Arc::default(),
        }
    }

    /// Make `stage` fail on `channel`.
    pub fn fail(self, channel: u8, stage: Stage) -> Self {
        if let Ok(channel) = Channel::new(channel) {
            self.state.lock().failures.insert((channel, stage));
        }
        self
    }

    /// Flip the first byte read back from `channel`.
    pub fn corrupt_readback(self, channel: u8) -> Self {
        if let Ok(channel) = Channel::new(channel) {
            self.state.lock().corrupt.insert(channel);
        }
        self
    }

    pub fn refuse_connect(self) -> Self {
        self.state.lock().refuse_connect = true;
        self
    }

    pub fn events(&self) -> Vec<LinkEvent> {
        self.state.lock().events.clone()
    }

    /// Operations performed while `channel` was selected.
    pub fn ops(&self, channel: Channel) -> Vec<LinkOp> {
        self.events()
            .into_iter()
            .filter(|e| e.channel == Some(channel))
            .map(|e| e.op)
            .collect()
    }

    pub fn count(&self, op: &LinkOp) -> usize {
        self.events().iter().filter(|e| e.op == *op).count()
    }

    /// Flash contents of `channel`, in address order.
    pub fn flash(&self, channel: Channel) -> Vec<u8> {
        self.state
            .lock()
            .flash
            .get(&channel)
            .map(|mem| mem.values().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Link = FakeLink;

    async fn connect(&mut self) -> Result<FakeLink> {
        let mut state = self.state.lock();
        if state.refuse_connect {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no such port",
            )));
        }
        state.events.push(LinkEvent {
            at: Instant::now(),
            channel: self.bus.selected(),
            op: LinkOp::Connect,
        });
        Ok(FakeLink {
            bus: self.bus.clone(),
            state: Arc::clone(&self.state),
            closed: false,
        })
    }
}

pub struct FakeLink {
    bus: FakeExpanders,
    state: Arc<Mutex<LinkState>>,
    closed: bool,
}

impl FakeLink {
    fn record(&self, op: LinkOp) -> Result<Option<Channel>> {
        if self.closed {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "link closed",
            )));
        }
        let channel = self.bus.selected();
        self.state.lock().events.push(LinkEvent {
            at: Instant::now(),
            channel,
            op,
        });
        Ok(channel)
    }

    // Record a target operation and decide whether it succeeds.
    fn exchange(&self, op: LinkOp, stage: Stage) -> Result<Channel> {
        let channel = self
            .record(op)?
            .ok_or(Error::Bootloader(BootloaderError::Timeout))?;
        if self.state.lock().failures.contains(&(channel, stage)) {
            let error = match stage {
                Stage::Reset => BootloaderError::Timeout,
                _ => BootloaderError::Nack,
            };
            return Err(error.into());
        }
        Ok(channel)
    }
}

#[async_trait]
impl Link for FakeLink {
    async fn discard_input(&mut self) -> Result<()> {
        self.record(LinkOp::Discard).map(|_| ())
    }

    async fn close(&mut self) -> Result<()> {
        self.record(LinkOp::Close)?;
        self.closed = true;
        Ok(())
    }
}

#[async_trait]
impl Bootloader for FakeLink {
    async fn reset_into_bootloader(&mut self) -> Result<()> {
        self.exchange(LinkOp::Reset, Stage::Reset).map(|_| ())
    }

    async fn identify(&mut self) -> Result<BootloaderInfo> {
        self.exchange(LinkOp::Identify, Stage::Identify)?;
        Ok(BootloaderInfo {
            version: 0x31,
            commands: vec![0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x44],
            product_id: 0x0413,
        })
    }

    async fn erase(&mut self) -> Result<()> {
        let channel = self.exchange(LinkOp::Erase, Stage::Erase)?;
        self.state.lock().flash.remove(&channel);
        Ok(())
    }

    async fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let op = LinkOp::Write {
            address,
            len: data.len(),
        };
        let channel = self.exchange(op, Stage::Write)?;
        let mut state = self.state.lock();
        let mem = state.flash.entry(channel).or_default();
        for (addr, byte) in (address..).zip(data) {
            mem.insert(addr, *byte);
        }
        Ok(())
    }

    async fn read(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        let channel = self.exchange(LinkOp::Read { address, len }, Stage::Verify)?;
        let state = self.state.lock();
        let mem = state.flash.get(&channel);
        let mut data: Vec<u8> = (address..)
            .take(len)
            .map(|addr| mem.and_then(|m| m.get(&addr)).copied().unwrap_or(0xff))
            .collect();
        if state.corrupt.contains(&channel) {
            if let Some(first) = data.first_mut() {
                *first ^= 0xff;
            }
        }
        Ok(data)
    }

    async fn jump(&mut self, address: u32) -> Result<()> {
        self.exchange(LinkOp::Jump(address), Stage::Jump).map(|_| ())
    }
}
