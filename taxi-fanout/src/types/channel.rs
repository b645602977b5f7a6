//! Channel identity and channel selections.

use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// One of the eight uDAQ slots on the fanout board.
///
/// A `Channel` always holds a valid index; out-of-range values are rejected
/// when the value is constructed, long before any register is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Channel(u8);

impl Channel {
    /// Number of channels on the board.
    pub const COUNT: u8 = 8;

    /// Create a channel from its index.
    pub fn new(index: u8) -> Result<Self> {
        if index < Self::COUNT {
            Ok(Self(index))
        } else {
            Err(Error::InvalidChannel(index.into()))
        }
    }

    /// Zero-based index.
    pub fn index(self) -> u8 {
        self.0
    }

    /// This channel's bit in a board bitmask.
    pub fn bit(self) -> u8 {
        1 << self.0
    }

    /// All channels in ascending order.
    pub fn all() -> impl Iterator<Item = Channel> {
        (0..Self::COUNT).map(Channel)
    }
}

impl TryFrom<u32> for Channel {
    type Error = Error;

    fn try_from(index: u32) -> Result<Self> {
        u8::try_from(index)
            .map_err(|_| Error::InvalidChannel(index))
            .and_then(Channel::new)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A set of channels, stored as the board's 8-bit mask (bit i = channel i).
///
/// Iteration is always in ascending channel order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChannelSet(u8);

impl ChannelSet {
    pub const EMPTY: Self = Self(0);
    pub const ALL: Self = Self(0xff);

    /// Interpret a board bitmask. Every bit names a valid channel.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn contains(self, channel: Channel) -> bool {
        self.0 & channel.bit() != 0
    }

    pub fn insert(&mut self, channel: Channel) {
        self.0 |= channel.bit();
    }

    pub fn remove(&mut self, channel: Channel) {
        self.0 &= !channel.bit();
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[must_use]
    pub fn complement(self) -> Self {
        Self(!self.0)
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Channels in ascending order.
    pub fn iter(self) -> impl Iterator<Item = Channel> {
        Channel::all().filter(move |ch| self.contains(*ch))
    }

    /// Parse the textual selection form, e.g. `"0-3,7"`.
    ///
    /// Parts are separated by commas and are either a single index or an
    /// inclusive range. Reversed ranges are accepted and duplicates merge.
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = || Error::InvalidChannelSpec(text.to_string());
        let parse_index = |part: &str| -> Result<Channel> {
            let value: u32 = part.trim().parse().map_err(|_| invalid())?;
            Channel::try_from(value)
        };

        if text.trim().is_empty() {
            return Err(invalid());
        }

        let mut set = Self::EMPTY;
        for part in text.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(invalid());
            }
            match part.split_once('-') {
                Some((start, stop)) => {
                    let start = parse_index(start)?;
                    let stop = parse_index(stop)?;
                    let (low, high) = if start <= stop { (start, stop) } else { (stop, start) };
                    for index in low.index()..=high.index() {
                        set.insert(Channel(index));
                    }
                }
                None => set.insert(parse_index(part)?),
            }
        }
        Ok(set)
    }
}

impl FromStr for ChannelSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl FromIterator<Channel> for ChannelSet {
    fn from_iter<T: IntoIterator<Item = Channel>>(iter: T) -> Self {
        let mut set = Self::EMPTY;
        for channel in iter {
            set.insert(channel);
        }
        set
    }
}

// Canonical form: ascending, runs of three or more compressed to ranges.
impl fmt::Display for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let channels: Vec<u8> = self.iter().map(Channel::index).collect();
        let mut parts = Vec::new();
        let mut i = 0;
        while i < channels.len() {
            let mut j = i;
            while j + 1 < channels.len() && channels[j + 1] == channels[j] + 1 {
                j += 1;
            }
            match j - i {
                0 => parts.push(channels[i].to_string()),
                1 => {
                    parts.push(channels[i].to_string());
                    parts.push(channels[j].to_string());
                }
                _ => parts.push(format!("{}-{}", channels[i], channels[j])),
            }
            i = j + 1;
        }
        write!(f, "{}", parts.join(","))
    }
}

impl fmt::Binary for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Binary::fmt(&self.0, f)
    }
}

impl Serialize for ChannelSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}
