//! Input filtering by channel and message class
//!
//! Bit layout follows portmidi: system messages use `1 << (status - 0xF0)`,
//! channel messages use `1 << (0x10 + (status >> 4))`. A set bit means the
//! message class is dropped before it reaches the stream.

use serde::{Deserialize, Serialize};

use crate::message::{is_status, SYSEX_END, SYSEX_START};

pub const FILTER_SYSEX: u32 = 1 << 0x00;
pub const FILTER_MTC: u32 = 1 << 0x01;
pub const FILTER_SONG_POSITION: u32 = 1 << 0x02;
pub const FILTER_SONG_SELECT: u32 = 1 << 0x03;
pub const FILTER_TUNE: u32 = 1 << 0x06;
pub const FILTER_CLOCK: u32 = 1 << 0x08;
pub const FILTER_TICK: u32 = 1 << 0x09;
pub const FILTER_PLAY: u32 = (1 << 0x0A) | (1 << 0x0B) | (1 << 0x0C);
pub const FILTER_UNDEFINED: u32 = 1 << 0x0D;
pub const FILTER_ACTIVE: u32 = 1 << 0x0E;
pub const FILTER_RESET: u32 = 1 << 0x0F;
pub const FILTER_NOTE: u32 = (1 << 0x18) | (1 << 0x19);
pub const FILTER_POLY_AFTERTOUCH: u32 = 1 << 0x1A;
pub const FILTER_CONTROL: u32 = 1 << 0x1B;
pub const FILTER_PROGRAM: u32 = 1 << 0x1C;
pub const FILTER_CHANNEL_AFTERTOUCH: u32 = 1 << 0x1D;
pub const FILTER_PITCHBEND: u32 = 1 << 0x1E;

/// Channel mask and message-class filter applied by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFilter {
    /// Bit n enables channel n (0-15)
    pub channels: u16,
    /// Message classes to drop
    pub filters: u32,
}

impl Default for InputFilter {
    /// All channels; drops active sensing, clock, transport, undefined, reset and tick.
    fn default() -> Self {
        Self {
            channels: 0xFFFF,
            filters: FILTER_ACTIVE
                | FILTER_CLOCK
                | FILTER_PLAY
                | FILTER_UNDEFINED
                | FILTER_RESET
                | FILTER_TICK,
        }
    }
}

impl InputFilter {
    /// Let every message through
    pub fn none() -> Self {
        Self {
            channels: 0xFFFF,
            filters: 0,
        }
    }

    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_filters(mut self, filters: u32) -> Self {
        self.filters = filters;
        self
    }

    /// Whether a message starting with `status` passes the filter.
    ///
    /// Sysex continuation packets (data bytes or a lone terminator) are judged
    /// by the sysex bit.
    pub fn accepts(&self, status: u8) -> bool {
        if !is_status(status) || status == SYSEX_END {
            return self.filters & FILTER_SYSEX == 0;
        }
        if status >= SYSEX_START {
            return self.filters & (1 << (status - SYSEX_START)) == 0;
        }
        let class_bit = 1u32 << (0x10 + (status >> 4));
        let channel_bit = 1u16 << (status & 0x0F);
        self.filters & class_bit == 0 && self.channels & channel_bit != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_drops_realtime() {
        let filter = InputFilter::default();
        assert!(!filter.accepts(0xF8)); // clock
        assert!(!filter.accepts(0xFA)); // start
        assert!(!filter.accepts(0xFC)); // stop
        assert!(!filter.accepts(0xFE)); // active sensing
        assert!(!filter.accepts(0xFF)); // reset
        assert!(filter.accepts(0xF0));
        assert!(filter.accepts(0x90));
        assert!(filter.accepts(0x12));
    }

    #[test]
    fn test_undefined_covers_fd_only() {
        let filter = InputFilter::none().with_filters(FILTER_UNDEFINED);
        assert!(!filter.accepts(0xFD));
        assert!(filter.accepts(0xF4));
        assert!(filter.accepts(0xF5));
        assert!(!InputFilter::default().accepts(0xFD));
    }

    #[test]
    fn test_channel_mask() {
        let filter = InputFilter::none().with_channels(0b10);
        assert!(!filter.accepts(0x90));
        assert!(filter.accepts(0x91));
        // System messages ignore the channel mask
        assert!(filter.accepts(0xF8));
    }

    #[test]
    fn test_class_filter() {
        let filter = InputFilter::none().with_filters(FILTER_CONTROL | FILTER_SYSEX);
        assert!(!filter.accepts(0xB3));
        assert!(filter.accepts(0x93));
        assert!(!filter.accepts(0xF0));
        assert!(!filter.accepts(0x01));
    }
}
