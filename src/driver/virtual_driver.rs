//! In-memory driver
//!
//! Ports exist only inside the process. Data is injected by hand or looped
//! back from an output port to an input port. Every write is recorded so it
//! can be inspected afterwards.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::trace;

use super::{
    MidiDriver, StreamHandle, ERR_BAD_DATA, ERR_BAD_HANDLE, ERR_BUFFER_OVERFLOW,
    ERR_INVALID_DEVICE, RECEIVE_BUFFER_SIZE,
};
use crate::clock::Timestamp;
use crate::error::DriverError;
use crate::filter::InputFilter;
use crate::message::{format_hex, RawEvent};
use crate::port::{Direction, Port, PortId};

/// A message written to a virtual output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenMessage {
    /// Requested send time, 0 for immediate
    pub when: Timestamp,
    pub bytes: Vec<u8>,
}

enum VirtualStream {
    Input {
        port: PortId,
        pending: VecDeque<RawEvent>,
        filter: InputFilter,
        overflowed: bool,
    },
    Output {
        port: PortId,
    },
}

#[derive(Default)]
struct VirtualState {
    ports: Vec<Port>,
    streams: HashMap<StreamHandle, VirtualStream>,
    next_handle: u64,
    /// output port -> input ports receiving everything written to it
    links: HashMap<PortId, Vec<PortId>>,
    written: HashMap<PortId, Vec<WrittenMessage>>,
    read_failures: HashMap<PortId, DriverError>,
}

impl VirtualState {
    fn deliver(&mut self, port: PortId, events: &[RawEvent]) {
        let Some(first) = events.first() else {
            return;
        };
        for stream in self.streams.values_mut() {
            if let VirtualStream::Input {
                port: input_port,
                pending,
                filter,
                overflowed,
            } = stream
            {
                if *input_port != port || !filter.accepts(first.status()) {
                    continue;
                }
                if pending.len() + events.len() > RECEIVE_BUFFER_SIZE {
                    *overflowed = true;
                    continue;
                }
                pending.extend(events.iter().copied());
            }
        }
    }

    fn record_write(&mut self, handle: StreamHandle, bytes: &[u8], when: Timestamp) -> Result<(), DriverError> {
        let port = match self.streams.get(&handle) {
            Some(VirtualStream::Output { port }) => *port,
            _ => return Err(bad_handle(handle)),
        };
        if bytes.is_empty() {
            return Err(DriverError::new(ERR_BAD_DATA, "empty message"));
        }
        trace!("virtual write to {:?} at {}: {}", port, when, format_hex(bytes));
        self.written.entry(port).or_default().push(WrittenMessage {
            when,
            bytes: bytes.to_vec(),
        });
        if let Some(targets) = self.links.get(&port).cloned() {
            let events = RawEvent::packetize(when, bytes);
            for target in targets {
                self.deliver(target, &events);
            }
        }
        Ok(())
    }
}

fn bad_handle(handle: StreamHandle) -> DriverError {
    DriverError::new(ERR_BAD_HANDLE, format!("invalid stream handle {}", handle.0))
}

/// Driver whose ports live in memory
#[derive(Default)]
pub struct VirtualDriver {
    state: Mutex<VirtualState>,
}

impl VirtualDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_port(&self, name: impl Into<String>, direction: Direction) -> Port {
        let mut state = self.state.lock();
        let port = Port::new(state.ports.len(), name, direction);
        state.ports.push(port.clone());
        port
    }

    pub fn add_input(&self, name: impl Into<String>) -> Port {
        self.add_port(name, Direction::Input)
    }

    pub fn add_output(&self, name: impl Into<String>) -> Port {
        self.add_port(name, Direction::Output)
    }

    /// Deliver a complete message to every open input on `port`
    pub fn inject(&self, port: PortId, timestamp: Timestamp, bytes: &[u8]) {
        let events = RawEvent::packetize(timestamp, bytes);
        self.state.lock().deliver(port, &events);
    }

    /// Deliver packets exactly as given, one per read slot
    pub fn inject_packets(&self, port: PortId, packets: &[RawEvent]) {
        let mut state = self.state.lock();
        for packet in packets {
            state.deliver(port, std::slice::from_ref(packet));
        }
    }

    /// Make the next read on `port` fail with `error`
    pub fn fail_next_read(&self, port: PortId, error: DriverError) {
        self.state.lock().read_failures.insert(port, error);
    }

    /// Route everything written to `output` into `input`
    pub fn connect(&self, output: PortId, input: PortId) {
        self.state.lock().links.entry(output).or_default().push(input);
    }

    /// Messages written to `port` so far
    pub fn written(&self, port: PortId) -> Vec<WrittenMessage> {
        self.state
            .lock()
            .written
            .get(&port)
            .cloned()
            .unwrap_or_default()
    }

    pub fn open_stream_count(&self) -> usize {
        self.state.lock().streams.len()
    }
}

impl MidiDriver for VirtualDriver {
    fn enumerate(&self) -> Result<Vec<Port>, DriverError> {
        Ok(self.state.lock().ports.clone())
    }

    fn open_input(&self, port: &Port) -> Result<StreamHandle, DriverError> {
        self.open(port, Direction::Input)
    }

    fn open_output(&self, port: &Port, _latency: Timestamp) -> Result<StreamHandle, DriverError> {
        self.open(port, Direction::Output)
    }

    fn set_filter(&self, handle: StreamHandle, new_filter: InputFilter) -> Result<(), DriverError> {
        match self.state.lock().streams.get_mut(&handle) {
            Some(VirtualStream::Input { filter, .. }) => {
                *filter = new_filter;
                Ok(())
            }
            _ => Err(bad_handle(handle)),
        }
    }

    fn poll(&self, handle: StreamHandle) -> Result<bool, DriverError> {
        match self.state.lock().streams.get(&handle) {
            Some(VirtualStream::Input {
                pending,
                overflowed,
                ..
            }) => Ok(!pending.is_empty() || *overflowed),
            _ => Err(bad_handle(handle)),
        }
    }

    fn read(&self, handle: StreamHandle, max_events: usize) -> Result<Vec<RawEvent>, DriverError> {
        let mut state = self.state.lock();
        let port = match state.streams.get(&handle) {
            Some(VirtualStream::Input { port, .. }) => *port,
            _ => return Err(bad_handle(handle)),
        };
        if let Some(error) = state.read_failures.remove(&port) {
            return Err(error);
        }
        let Some(VirtualStream::Input {
            pending,
            overflowed,
            ..
        }) = state.streams.get_mut(&handle)
        else {
            return Err(bad_handle(handle));
        };
        if std::mem::take(overflowed) {
            return Err(DriverError::new(ERR_BUFFER_OVERFLOW, "buffer overflow"));
        }
        let count = pending.len().min(max_events);
        Ok(pending.drain(..count).collect())
    }

    fn write_short(&self, handle: StreamHandle, message: &[u8], when: Timestamp) -> Result<(), DriverError> {
        self.state.lock().record_write(handle, message, when)
    }

    fn write_sysex(&self, handle: StreamHandle, message: &[u8], when: Timestamp) -> Result<(), DriverError> {
        self.state.lock().record_write(handle, message, when)
    }

    fn close(&self, handle: StreamHandle) -> Result<(), DriverError> {
        self.state
            .lock()
            .streams
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| bad_handle(handle))
    }
}

impl VirtualDriver {
    fn open(&self, port: &Port, direction: Direction) -> Result<StreamHandle, DriverError> {
        let mut state = self.state.lock();
        let known = state
            .ports
            .iter()
            .any(|p| p.id == port.id && p.direction == direction);
        if !known {
            return Err(DriverError::new(
                ERR_INVALID_DEVICE,
                format!("no {} device with id {}", direction, port.id.0),
            ));
        }
        state.next_handle += 1;
        let handle = StreamHandle(state.next_handle);
        let stream = match direction {
            Direction::Input => VirtualStream::Input {
                port: port.id,
                pending: VecDeque::new(),
                filter: InputFilter::none(),
                overflowed: false,
            },
            Direction::Output => VirtualStream::Output { port: port.id },
        };
        state.streams.insert(handle, stream);
        Ok(handle)
    }
}
