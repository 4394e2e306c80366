//! Hardware driver backed by midir
//!
//! midir hands over complete messages from its own callback thread. They are
//! stamped with the engine clock, re-packed into 4-byte packets the way a
//! packet driver would deliver them, and buffered until the engine reads.
//! Delayed output is held by a writer thread per stream and sent at
//! `when + latency`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use super::{
    MidiDriver, StreamHandle, ERR_BAD_DATA, ERR_BAD_HANDLE, ERR_BUFFER_OVERFLOW, ERR_HOST,
    ERR_INVALID_DEVICE, RECEIVE_BUFFER_SIZE,
};
use crate::clock::{Clock, Timestamp};
use crate::error::DriverError;
use crate::filter::InputFilter;
use crate::message::{format_hex, RawEvent};
use crate::port::{Direction, Port};

fn host_error(err: impl std::fmt::Display) -> DriverError {
    DriverError::host(ERR_HOST, err.to_string())
}

/// Packets received by the midir callback, waiting for the engine
#[derive(Default)]
struct ReceiveBuffer {
    events: Mutex<VecDeque<RawEvent>>,
    filter: Mutex<InputFilter>,
    overflowed: AtomicBool,
}

impl ReceiveBuffer {
    fn push(&self, timestamp: Timestamp, message: &[u8]) {
        let Some(&status) = message.first() else {
            return;
        };
        if !self.filter.lock().accepts(status) {
            return;
        }
        let packets = RawEvent::packetize(timestamp, message);
        let mut events = self.events.lock();
        if events.len() + packets.len() > RECEIVE_BUFFER_SIZE {
            self.overflowed.store(true, Ordering::Release);
            return;
        }
        events.extend(packets);
    }
}

/// Message waiting for its delivery time
struct Pending {
    due: Timestamp,
    seq: u64,
    bytes: Vec<u8>,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due).then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct DelayedState {
    heap: BinaryHeap<Reverse<Pending>>,
    next_seq: u64,
    closed: bool,
}

struct DelayedQueue {
    state: Mutex<DelayedState>,
    wake: Condvar,
}

/// Output connection plus the thread that sends delayed messages
struct OutputWriter {
    conn: Arc<Mutex<MidiOutputConnection>>,
    latency: Timestamp,
    delayed: Arc<DelayedQueue>,
    thread: Option<JoinHandle<()>>,
}

impl OutputWriter {
    fn spawn(
        conn: MidiOutputConnection,
        latency: Timestamp,
        clock: Arc<dyn Clock>,
        name: &str,
    ) -> Result<Self, DriverError> {
        let conn = Arc::new(Mutex::new(conn));
        let delayed = Arc::new(DelayedQueue {
            state: Mutex::new(DelayedState::default()),
            wake: Condvar::new(),
        });

        let thread = if latency > 0 {
            let conn = Arc::clone(&conn);
            let delayed = Arc::clone(&delayed);
            let handle = std::thread::Builder::new()
                .name(format!("midi-out {}", name))
                .spawn(move || Self::deliver_loop(conn, delayed, clock))
                .map_err(host_error)?;
            Some(handle)
        } else {
            None
        };

        Ok(Self {
            conn,
            latency,
            delayed,
            thread,
        })
    }

    /// Runs on the writer thread until the stream closes
    fn deliver_loop(
        conn: Arc<Mutex<MidiOutputConnection>>,
        delayed: Arc<DelayedQueue>,
        clock: Arc<dyn Clock>,
    ) {
        let mut state = delayed.state.lock();
        loop {
            if state.closed {
                if !state.heap.is_empty() {
                    debug!("Dropping {} undelivered MIDI messages", state.heap.len());
                }
                return;
            }
            let Some(due) = state.heap.peek().map(|Reverse(pending)| pending.due) else {
                delayed.wake.wait(&mut state);
                continue;
            };
            let now = clock.now();
            if due > now {
                delayed.wake.wait_for(&mut state, Duration::from_millis(due - now));
                continue;
            }
            if let Some(Reverse(pending)) = state.heap.pop() {
                parking_lot::MutexGuard::unlocked(&mut state, || {
                    if let Err(e) = conn.lock().send(&pending.bytes) {
                        warn!("Failed to send delayed MIDI message: {}", e);
                    }
                });
            }
        }
    }

    fn write(&self, bytes: &[u8], when: Timestamp) -> Result<(), DriverError> {
        if when == 0 || self.latency == 0 {
            return self.conn.lock().send(bytes).map_err(host_error);
        }
        let due = when
            .checked_add(self.latency)
            .ok_or_else(|| DriverError::new(ERR_BAD_DATA, "send time out of range"))?;
        let mut state = self.delayed.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Reverse(Pending {
            due,
            seq,
            bytes: bytes.to_vec(),
        }));
        self.delayed.wake.notify_one();
        Ok(())
    }
}

impl Drop for OutputWriter {
    fn drop(&mut self) {
        self.delayed.state.lock().closed = true;
        self.delayed.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

enum MidirStream {
    Input {
        _conn: MidiInputConnection<()>,
        buffer: Arc<ReceiveBuffer>,
    },
    Output(OutputWriter),
}

/// Driver for the host MIDI system
pub struct MidirDriver {
    client_name: String,
    clock: Arc<dyn Clock>,
    streams: Mutex<HashMap<StreamHandle, MidirStream>>,
    next_handle: AtomicU64,
}

impl MidirDriver {
    pub fn new(client_name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            client_name: client_name.into(),
            clock,
            streams: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn insert(&self, stream: MidirStream) -> StreamHandle {
        let handle = StreamHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.streams.lock().insert(handle, stream);
        handle
    }

    fn with_input<T>(
        &self,
        handle: StreamHandle,
        f: impl FnOnce(&ReceiveBuffer) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let buffer = match self.streams.lock().get(&handle) {
            Some(MidirStream::Input { buffer, .. }) => Arc::clone(buffer),
            _ => return Err(bad_handle(handle)),
        };
        f(&buffer)
    }

    fn write(&self, handle: StreamHandle, bytes: &[u8], when: Timestamp) -> Result<(), DriverError> {
        let streams = self.streams.lock();
        match streams.get(&handle) {
            Some(MidirStream::Output(writer)) => {
                trace!("midir write at {}: {}", when, format_hex(bytes));
                writer.write(bytes, when)
            }
            _ => Err(bad_handle(handle)),
        }
    }
}

fn bad_handle(handle: StreamHandle) -> DriverError {
    DriverError::new(ERR_BAD_HANDLE, format!("invalid stream handle {}", handle.0))
}

fn not_found(port: &Port) -> DriverError {
    DriverError::new(
        ERR_INVALID_DEVICE,
        format!("MIDI {} port '{}' not found", port.direction, port.name),
    )
}

impl MidiDriver for MidirDriver {
    fn enumerate(&self) -> Result<Vec<Port>, DriverError> {
        let midi_in = MidiInput::new(&self.client_name).map_err(host_error)?;
        let midi_out = MidiOutput::new(&self.client_name).map_err(host_error)?;

        let mut ports = Vec::new();
        for port in midi_in.ports() {
            if let Ok(name) = midi_in.port_name(&port) {
                ports.push(Port::new(ports.len(), name, Direction::Input));
            }
        }
        for port in midi_out.ports() {
            if let Ok(name) = midi_out.port_name(&port) {
                ports.push(Port::new(ports.len(), name, Direction::Output));
            }
        }
        Ok(ports)
    }

    fn open_input(&self, port: &Port) -> Result<StreamHandle, DriverError> {
        let mut midi_in = MidiInput::new(&self.client_name).map_err(host_error)?;
        // Filtering happens in the receive buffer
        midi_in.ignore(Ignore::None);

        let midi_port = midi_in
            .ports()
            .into_iter()
            .find(|p| midi_in.port_name(p).ok().as_deref() == Some(port.name.as_str()))
            .ok_or_else(|| not_found(port))?;

        let buffer = Arc::new(ReceiveBuffer {
            filter: Mutex::new(InputFilter::none()),
            ..Default::default()
        });
        let callback_buffer = Arc::clone(&buffer);
        let clock = Arc::clone(&self.clock);
        let conn = midi_in
            .connect(
                &midi_port,
                &self.client_name,
                move |_stamp, message, _| callback_buffer.push(clock.now(), message),
                (),
            )
            .map_err(host_error)?;

        debug!("Opened MIDI input '{}'", port.name);
        Ok(self.insert(MidirStream::Input {
            _conn: conn,
            buffer,
        }))
    }

    fn open_output(&self, port: &Port, latency: Timestamp) -> Result<StreamHandle, DriverError> {
        let midi_out = MidiOutput::new(&self.client_name).map_err(host_error)?;
        let midi_port = midi_out
            .ports()
            .into_iter()
            .find(|p| midi_out.port_name(p).ok().as_deref() == Some(port.name.as_str()))
            .ok_or_else(|| not_found(port))?;
        let conn = midi_out
            .connect(&midi_port, &self.client_name)
            .map_err(host_error)?;

        let writer = OutputWriter::spawn(conn, latency, Arc::clone(&self.clock), &port.name)?;
        debug!("Opened MIDI output '{}' (latency {}ms)", port.name, latency);
        Ok(self.insert(MidirStream::Output(writer)))
    }

    fn set_filter(&self, handle: StreamHandle, filter: InputFilter) -> Result<(), DriverError> {
        self.with_input(handle, |buffer| {
            *buffer.filter.lock() = filter;
            Ok(())
        })
    }

    fn poll(&self, handle: StreamHandle) -> Result<bool, DriverError> {
        self.with_input(handle, |buffer| {
            Ok(!buffer.events.lock().is_empty() || buffer.overflowed.load(Ordering::Acquire))
        })
    }

    fn read(&self, handle: StreamHandle, max_events: usize) -> Result<Vec<RawEvent>, DriverError> {
        self.with_input(handle, |buffer| {
            if buffer.overflowed.swap(false, Ordering::AcqRel) {
                return Err(DriverError::new(ERR_BUFFER_OVERFLOW, "buffer overflow"));
            }
            let mut events = buffer.events.lock();
            let count = events.len().min(max_events);
            Ok(events.drain(..count).collect())
        })
    }

    fn write_short(&self, handle: StreamHandle, message: &[u8], when: Timestamp) -> Result<(), DriverError> {
        self.write(handle, message, when)
    }

    fn write_sysex(&self, handle: StreamHandle, message: &[u8], when: Timestamp) -> Result<(), DriverError> {
        self.write(handle, message, when)
    }

    fn close(&self, handle: StreamHandle) -> Result<(), DriverError> {
        let stream = self.streams.lock().remove(&handle);
        match stream {
            Some(stream) => {
                // Dropping joins the writer thread, so do it outside the lock
                drop(stream);
                Ok(())
            }
            None => Err(bad_handle(handle)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_buffer_packs_and_filters() {
        let buffer = ReceiveBuffer::default();
        buffer.push(3, &[0xF0, 1, 2, 3, 4, 0xF7]);
        buffer.push(4, &[]);
        *buffer.filter.lock() = InputFilter::default();
        buffer.push(5, &[0xF8]);
        buffer.push(6, &[0x90, 60, 1]);

        let events: Vec<_> = buffer.events.lock().drain(..).collect();
        let bytes: Vec<_> = events.iter().map(|e| (e.timestamp, e.bytes().to_vec())).collect();
        assert_eq!(
            bytes,
            vec![
                (3, vec![0xF0, 1, 2, 3]),
                (3, vec![4, 0xF7]),
                (6, vec![0x90, 60, 1]),
            ]
        );
    }

    #[test]
    fn test_receive_buffer_overflow_flag() {
        let buffer = ReceiveBuffer::default();
        for ts in 0..RECEIVE_BUFFER_SIZE as Timestamp {
            buffer.push(ts, &[0x90, 60, 1]);
        }
        assert!(!buffer.overflowed.load(Ordering::Acquire));
        buffer.push(0, &[0x90, 60, 1]);
        assert!(buffer.overflowed.load(Ordering::Acquire));
        assert_eq!(buffer.events.lock().len(), RECEIVE_BUFFER_SIZE);
    }

    #[test]
    fn test_pending_orders_by_due_then_sequence() {
        let mut heap = BinaryHeap::new();
        for (due, seq) in [(30, 0), (10, 1), (10, 2), (20, 3)] {
            heap.push(Reverse(Pending {
                due,
                seq,
                bytes: vec![],
            }));
        }
        let order: Vec<_> = std::iter::from_fn(|| heap.pop().map(|Reverse(p)| p.seq)).collect();
        assert_eq!(order, vec![1, 2, 3, 0]);
    }
}
