//! MIDI byte framing and message types
//!
//! Provides the raw driver packet, the decoded messages handed to consumers
//! and hex conversions. No musical interpretation happens here.

use std::fmt;

use serde::ser::{Serialize, SerializeSeq, Serializer};

use crate::clock::Timestamp;
use crate::error::{MidiError, Result};

pub const SYSEX_START: u8 = 0xF0;
pub const SYSEX_END: u8 = 0xF7;

/// Largest number of bytes a driver packs into one packet
pub const PACKET_SIZE: usize = 4;

/// Real-time status bytes (0xF8-0xFF) may appear anywhere, even inside a sysex.
pub fn is_realtime(byte: u8) -> bool {
    (byte & 0xF8) == 0xF8
}

/// Status bytes have the top bit set, data bytes don't
pub fn is_status(byte: u8) -> bool {
    byte & 0x80 != 0
}

/// One packet as delivered by the driver in a single read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub timestamp: Timestamp,
    data: [u8; PACKET_SIZE],
    len: u8,
}

impl RawEvent {
    /// Build a packet from up to four bytes. Extra bytes are ignored.
    pub fn new(timestamp: Timestamp, bytes: &[u8]) -> Self {
        let len = bytes.len().min(PACKET_SIZE);
        let mut data = [0u8; PACKET_SIZE];
        data[..len].copy_from_slice(&bytes[..len]);
        Self {
            timestamp,
            data,
            len: len as u8,
        }
    }

    /// Split a complete message into driver-sized packets sharing one timestamp
    pub fn packetize(timestamp: Timestamp, bytes: &[u8]) -> Vec<RawEvent> {
        bytes
            .chunks(PACKET_SIZE)
            .map(|chunk| RawEvent::new(timestamp, chunk))
            .collect()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// First byte of the packet, which is the status byte for anything but sysex continuation
    pub fn status(&self) -> u8 {
        self.data[0]
    }
}

/// A complete non-sysex message: status plus up to two data bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortMessage {
    pub timestamp: Timestamp,
    pub status: u8,
    pub data1: u8,
    pub data2: u8,
}

impl ShortMessage {
    pub fn new(timestamp: Timestamp, status: u8, data1: u8, data2: u8) -> Self {
        Self {
            timestamp,
            status,
            data1,
            data2,
        }
    }

    /// Single-byte message such as a real-time clock tick
    pub fn single(timestamp: Timestamp, status: u8) -> Self {
        Self::new(timestamp, status, 0, 0)
    }

    pub(crate) fn from_event(event: &RawEvent) -> Self {
        Self::new(event.timestamp, event.data[0], event.data[1], event.data[2])
    }

    pub fn is_realtime(&self) -> bool {
        is_realtime(self.status)
    }
}

/// A completed system exclusive block, `F0 ... F7` inclusive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysexMessage {
    /// Time the first byte of the block arrived
    pub timestamp: Timestamp,
    pub data: Vec<u8>,
}

/// Message handed to a consumer by `receive`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedMessage {
    Short(ShortMessage),
    Sysex(SysexMessage),
}

impl DecodedMessage {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            DecodedMessage::Short(msg) => msg.timestamp,
            DecodedMessage::Sysex(msg) => msg.timestamp,
        }
    }

    /// Raw bytes of the message, without the timestamp
    pub fn bytes(&self) -> Vec<u8> {
        match self {
            DecodedMessage::Short(msg) => vec![msg.status, msg.data1, msg.data2],
            DecodedMessage::Sysex(msg) => msg.data.clone(),
        }
    }

    pub fn is_sysex(&self) -> bool {
        matches!(self, DecodedMessage::Sysex(_))
    }
}

/// Serializes as `[timestamp, status, data1, data2]` for short messages and
/// `[timestamp, byte...]` for sysex blocks.
impl Serialize for DecodedMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            DecodedMessage::Short(msg) => {
                let mut seq = serializer.serialize_seq(Some(4))?;
                seq.serialize_element(&msg.timestamp)?;
                seq.serialize_element(&msg.status)?;
                seq.serialize_element(&msg.data1)?;
                seq.serialize_element(&msg.data2)?;
                seq.end()
            }
            DecodedMessage::Sysex(msg) => {
                let mut seq = serializer.serialize_seq(Some(msg.data.len() + 1))?;
                seq.serialize_element(&msg.timestamp)?;
                for byte in &msg.data {
                    seq.serialize_element(byte)?;
                }
                seq.end()
            }
        }
    }
}

impl fmt::Display for DecodedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedMessage::Short(msg) => write!(
                f,
                "[{:08}ms] {:02X} {:02X} {:02X}",
                msg.timestamp, msg.status, msg.data1, msg.data2
            ),
            DecodedMessage::Sysex(msg) => write!(
                f,
                "[{:08}ms] {} ({} bytes)",
                msg.timestamp,
                format_hex(&msg.data),
                msg.data.len()
            ),
        }
    }
}

/// Format MIDI bytes as hex string for debugging
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse whitespace separated hex bytes, e.g. `"F0 7E 7F 06 01 F7"`
pub fn parse_hex_message(text: &str) -> Result<Vec<u8>> {
    text.split_whitespace()
        .map(|token| {
            let digits = token
                .strip_prefix("0x")
                .or_else(|| token.strip_prefix("0X"))
                .unwrap_or(token);
            u8::from_str_radix(digits, 16).map_err(|_| MidiError::HexDecode(token.to_string()))
        })
        .collect()
}
