//! System exclusive reassembly
//!
//! Turns driver packets into complete messages. A sysex block may span many
//! packets and many reads, so the partial block lives in the assembler
//! between calls. Real-time bytes inside a block are pulled out as their own
//! short messages.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::clock::Timestamp;
use crate::message::{
    format_hex, is_realtime, is_status, DecodedMessage, RawEvent, ShortMessage, SysexMessage,
    SYSEX_END, SYSEX_START,
};

/// How `drain` orders completed sysex blocks relative to short messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOrder {
    /// All completed sysex blocks, then all short messages
    #[default]
    SysexFirst,
    /// Stable merge of both queues by timestamp
    Interleaved,
}

/// Sysex block being accumulated
#[derive(Debug, Default, Clone)]
struct SysexBuffer {
    data: Vec<u8>,
    timestamp: Timestamp,
}

impl SysexBuffer {
    fn start(&mut self, timestamp: Timestamp) {
        self.data.clear();
        self.data.push(SYSEX_START);
        self.timestamp = timestamp;
    }

    fn is_open(&self) -> bool {
        !self.data.is_empty()
    }
}

/// Per-stream reassembly state and completed-message queues
#[derive(Debug, Default)]
pub struct SysexAssembler {
    current: SysexBuffer,
    short: VecDeque<ShortMessage>,
    sysex: VecDeque<SysexMessage>,
}

impl SysexAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a sysex block has started but not terminated
    pub fn in_sysex(&self) -> bool {
        self.current.is_open()
    }

    /// Either queue holds a completed message
    pub fn has_messages(&self) -> bool {
        !self.short.is_empty() || !self.sysex.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.short.len() + self.sysex.len()
    }

    /// Feed one driver packet
    pub fn ingest(&mut self, event: RawEvent) {
        // Inside a block every packet is walked byte by byte, so a real-time
        // packet comes out as its own message either way
        if self.in_sysex() || event.status() == SYSEX_START {
            self.unpack(&event);
        } else {
            self.short.push_back(ShortMessage::from_event(&event));
        }
    }

    pub fn ingest_all(&mut self, events: impl IntoIterator<Item = RawEvent>) {
        for event in events {
            self.ingest(event);
        }
    }

    /// Walk the bytes of a packet that belongs to a sysex block
    fn unpack(&mut self, event: &RawEvent) {
        for &byte in event.bytes() {
            if byte == SYSEX_END {
                self.current.data.push(byte);
                let completed = std::mem::take(&mut self.current);
                trace!(
                    "sysex complete at {}: {}",
                    completed.timestamp,
                    format_hex(&completed.data)
                );
                self.sysex.push_back(SysexMessage {
                    timestamp: completed.timestamp,
                    data: completed.data,
                });
                break;
            } else if is_realtime(byte) {
                self.short
                    .push_back(ShortMessage::single(event.timestamp, byte));
            } else if is_status(byte) && (self.current.data.len() > 1 || byte != SYSEX_START) {
                // Unexpected status inside a block: the transfer was cut off.
                // Only a new sysex start can be resynchronised to.
                warn!(
                    "Discarding interrupted sysex ({} bytes) on status {:02X}",
                    self.current.data.len(),
                    byte
                );
                self.current = SysexBuffer::default();
                if byte == SYSEX_START {
                    self.current.start(event.timestamp);
                } else {
                    break;
                }
            } else if byte == SYSEX_START && !self.current.is_open() {
                self.current.start(event.timestamp);
            } else {
                self.current.data.push(byte);
            }
        }
    }

    /// Remove every completed message
    pub fn drain(&mut self, order: DeliveryOrder) -> Vec<DecodedMessage> {
        let sysex = self.sysex.drain(..).map(DecodedMessage::Sysex);
        let short = self.short.drain(..).map(DecodedMessage::Short);
        match order {
            DeliveryOrder::SysexFirst => sysex.chain(short).collect(),
            DeliveryOrder::Interleaved => {
                let mut merged: Vec<DecodedMessage> = sysex.chain(short).collect();
                // Stable sort keeps arrival order for equal timestamps
                merged.sort_by_key(DecodedMessage::timestamp);
                merged
            }
        }
    }

    /// Drop completed messages after a read error. The partial block is kept
    /// so a transfer spanning the failure can still complete.
    pub fn clear_queues(&mut self) {
        self.short.clear();
        self.sysex.clear();
    }
}
