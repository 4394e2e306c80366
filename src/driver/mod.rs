//! Device drivers
//!
//! The engine talks to devices only through [`MidiDriver`]. `VirtualDriver`
//! keeps everything in memory (tests, loopback), `MidirDriver` talks to the
//! host MIDI system through midir.

mod midir_driver;
mod virtual_driver;

pub use midir_driver::MidirDriver;
pub use virtual_driver::{VirtualDriver, WrittenMessage};

use crate::clock::Timestamp;
use crate::error::DriverError;
use crate::filter::InputFilter;
use crate::message::RawEvent;
use crate::port::Port;

/// Failure inside the host MIDI API
pub const ERR_HOST: i32 = -10000;
/// No device with the requested id or name
pub const ERR_INVALID_DEVICE: i32 = -9999;
/// Incoming data was lost because the receive buffer was full
pub const ERR_BUFFER_OVERFLOW: i32 = -9996;
/// Handle does not refer to an open stream of the right direction
pub const ERR_BAD_HANDLE: i32 = -9995;
/// Message bytes the driver cannot transmit
pub const ERR_BAD_DATA: i32 = -9994;

/// Capacity of a driver receive buffer, in packets
pub const RECEIVE_BUFFER_SIZE: usize = 16384;

/// Opaque handle to an open driver stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

/// Device driver primitives consumed by the engine.
///
/// None of these calls may block: `poll` and `read` report what is already
/// buffered, writes queue the message with the driver.
pub trait MidiDriver: Send + Sync {
    /// List every port the driver knows about, both directions
    fn enumerate(&self) -> Result<Vec<Port>, DriverError>;

    fn open_input(&self, port: &Port) -> Result<StreamHandle, DriverError>;

    /// Open an output. Messages sent with a timestamp are delivered at
    /// `when + latency`; zero latency means immediate delivery only.
    fn open_output(&self, port: &Port, latency: Timestamp) -> Result<StreamHandle, DriverError>;

    fn set_filter(&self, handle: StreamHandle, filter: InputFilter) -> Result<(), DriverError>;

    /// Whether data is waiting to be read
    fn poll(&self, handle: StreamHandle) -> Result<bool, DriverError>;

    /// Take at most `max_events` buffered packets
    fn read(&self, handle: StreamHandle, max_events: usize) -> Result<Vec<RawEvent>, DriverError>;

    /// Write a status byte plus up to two data bytes. `when == 0` means now.
    fn write_short(&self, handle: StreamHandle, message: &[u8], when: Timestamp)
        -> Result<(), DriverError>;

    /// Write a complete `F0 ... F7` block. `when == 0` means now.
    fn write_sysex(&self, handle: StreamHandle, message: &[u8], when: Timestamp)
        -> Result<(), DriverError>;

    fn close(&self, handle: StreamHandle) -> Result<(), DriverError>;
}
