//! Error types for the MIDI engine
//!
//! Resolution and validation errors are returned synchronously to the caller.
//! Errors from background reads are delivered as the result of the pending
//! receive instead of being raised on the worker thread.

use std::fmt;

use thiserror::Error;

use crate::port::Direction;

/// Error reported by a driver implementation.
///
/// `code` is the driver's own numeric error code. `host_detail` is set when
/// the driver failed because of the host MIDI API rather than its own logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    pub code: i32,
    pub text: String,
    pub host_detail: Option<String>,
}

impl DriverError {
    pub fn new(code: i32, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
            host_detail: None,
        }
    }

    /// Driver error caused by the host MIDI system
    pub fn host(code: i32, detail: impl Into<String>) -> Self {
        Self {
            code,
            text: "host error".to_string(),
            host_detail: Some(detail.into()),
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host_detail {
            Some(detail) => write!(f, "(host error) {}", detail),
            None => write!(f, "{}", self.text),
        }
    }
}

impl std::error::Error for DriverError {}

/// Errors produced by the MIDI engine
#[derive(Debug, Error)]
pub enum MidiError {
    /// An explicit or environment-provided port name matched no device
    #[error("invalid MIDI {direction} port name \"{name}\"{}", env_suffix(.env_var))]
    NoSuchPort {
        direction: Direction,
        name: String,
        env_var: Option<&'static str>,
    },

    /// No device of the requested direction exists at all
    #[error("no MIDI {0} ports")]
    NoPortsAvailable(Direction),

    /// A driver call failed
    #[error("{context}: {source}")]
    Driver {
        context: &'static str,
        #[source]
        source: DriverError,
    },

    #[error("sysex message must be terminated by 0xf7")]
    MalformedSysex,

    #[error("message sending time has already passed")]
    PastDeadline,

    /// `when + latency` does not fit in a timestamp
    #[error("message sending time {0} is out of range")]
    SendTimeOutOfRange(u64),

    #[error("message send times must be monotonically increasing for one output stream")]
    NonMonotonicSend,

    #[error("can't delay message sending on MIDI output stream opened with zero latency")]
    LatencyRequired,

    #[error("cannot send message without content")]
    EmptyMessage,

    #[error("unexpected message length {0}")]
    UnexpectedMessageLength(usize),

    /// Operation attempted or pending on a closed stream
    #[error("MIDI stream is closed")]
    StreamClosed,

    #[error("error decoding hex byte {0:?} in MIDI message")]
    HexDecode(String),

    #[error("invalid config: {0}")]
    Config(String),

    /// Blocking work needs a tokio runtime to hand its result back
    #[error("runtime error: {0}")]
    Runtime(String),
}

fn env_suffix(env_var: &Option<&'static str>) -> String {
    match env_var {
        Some(var) => format!(" in {} environment variable", var),
        None => String::new(),
    }
}

impl MidiError {
    pub(crate) fn driver(context: &'static str, source: DriverError) -> Self {
        MidiError::Driver { context, source }
    }
}

pub type Result<T> = std::result::Result<T, MidiError>;
