//! Output streams and the delayed-send watermark
//!
//! Timestamped sends must be monotonic per stream. The engine-wide watermark
//! tracks the latest `when + latency` still in flight and holds a keep-alive
//! reference until the tick passes it.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::clock::{Clock, Timestamp};
use crate::driver::{MidiDriver, StreamHandle};
use crate::error::{MidiError, Result};
use crate::keepalive::KeepAlive;
use crate::message::{format_hex, SYSEX_END, SYSEX_START};
use crate::port::Port;

/// Latest effective delivery time of any pending delayed send
#[derive(Debug)]
pub struct Watermark {
    mark: Mutex<Timestamp>,
    keep_alive: KeepAlive,
}

impl Watermark {
    pub fn new(keep_alive: KeepAlive) -> Self {
        Self {
            mark: Mutex::new(0),
            keep_alive,
        }
    }

    /// Raise the mark to `until`; the first raise from zero takes a reference
    pub fn extend(&self, until: Timestamp) {
        let mut mark = self.mark.lock();
        if until > *mark {
            if *mark == 0 {
                self.keep_alive.acquire();
            }
            *mark = until;
        }
    }

    /// Tick check: once `now` is past the mark, reset it and let go of the reference
    pub fn check(&self, now: Timestamp) {
        let mut mark = self.mark.lock();
        if *mark != 0 && now > *mark {
            trace!("delayed output flushed at {} (mark {})", now, *mark);
            *mark = 0;
            self.keep_alive.release();
        }
    }

    pub fn current(&self) -> Timestamp {
        *self.mark.lock()
    }
}

#[derive(Default)]
struct OutputState {
    last_send: Timestamp,
    closed: bool,
}

/// An open MIDI output
pub struct OutputStream {
    port: Port,
    handle: StreamHandle,
    latency: Timestamp,
    driver: Arc<dyn MidiDriver>,
    clock: Arc<dyn Clock>,
    watermark: Arc<Watermark>,
    state: Mutex<OutputState>,
}

impl OutputStream {
    pub(crate) fn new(
        driver: Arc<dyn MidiDriver>,
        clock: Arc<dyn Clock>,
        watermark: Arc<Watermark>,
        port: Port,
        handle: StreamHandle,
        latency: Timestamp,
    ) -> Self {
        Self {
            port,
            handle,
            latency,
            driver,
            clock,
            watermark,
            state: Mutex::new(OutputState::default()),
        }
    }

    pub fn port(&self) -> &Port {
        &self.port
    }

    pub fn latency(&self) -> Timestamp {
        self.latency
    }

    /// Send time of the last timestamped message, 0 if none yet
    pub fn last_send(&self) -> Timestamp {
        self.state.lock().last_send
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Send a message now (`when == 0`) or at `when + latency`.
    ///
    /// A message starting with `F0` is a sysex block and must end with `F7`;
    /// anything else is a status byte plus at most two data bytes.
    pub fn send(&self, message: &[u8], when: Timestamp) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(MidiError::StreamClosed);
        }
        let Some(&status) = message.first() else {
            return Err(MidiError::EmptyMessage);
        };

        let mut deliver_at = 0;
        if when != 0 {
            if self.latency == 0 {
                return Err(MidiError::LatencyRequired);
            }
            deliver_at = when
                .checked_add(self.latency)
                .ok_or(MidiError::SendTimeOutOfRange(when))?;
            if when < self.clock.now() {
                return Err(MidiError::PastDeadline);
            }
            if state.last_send != 0 && when < state.last_send {
                return Err(MidiError::NonMonotonicSend);
            }
        }

        if status == SYSEX_START {
            if message.last() != Some(&SYSEX_END) {
                return Err(MidiError::MalformedSysex);
            }
            self.driver
                .write_sysex(self.handle, message, when)
                .map_err(|e| MidiError::driver("could not send MIDI sysex message", e))?;
        } else {
            if message.len() > 3 {
                return Err(MidiError::UnexpectedMessageLength(message.len()));
            }
            self.driver
                .write_short(self.handle, message, when)
                .map_err(|e| MidiError::driver("could not send MIDI message", e))?;
        }
        trace!("sent to '{}' at {}: {}", self.port.name, when, format_hex(message));

        if when != 0 {
            state.last_send = when;
            self.watermark.extend(deliver_at);
        }
        Ok(())
    }

    /// Close the stream. Later sends fail with `StreamClosed`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if std::mem::replace(&mut state.closed, true) {
            return;
        }
        drop(state);
        if let Err(e) = self.driver.close(self.handle) {
            warn!("Failed to close MIDI output '{}': {}", self.port.name, e);
        }
        debug!("Closed MIDI output '{}'", self.port.name);
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputStream")
            .field("port", &self.port)
            .field("latency", &self.latency)
            .finish()
    }
}
