//! Port description and resolution
//!
//! A stream picks its device from an explicit name, then the `MIDI_INPUT` /
//! `MIDI_OUTPUT` environment variable, then the first device of the
//! requested direction.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MidiError, Result};

/// Direction of a MIDI port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    /// Environment variable naming the default port for this direction
    pub fn env_var(self) -> &'static str {
        match self {
            Direction::Input => "MIDI_INPUT",
            Direction::Output => "MIDI_OUTPUT",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// Driver-assigned device identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortId(pub usize);

/// A concrete MIDI device endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: PortId,
    pub name: String,
    pub direction: Direction,
}

impl Port {
    pub fn new(id: usize, name: impl Into<String>, direction: Direction) -> Self {
        Self {
            id: PortId(id),
            name: name.into(),
            direction,
        }
    }
}

/// Resolve a port, consulting the process environment when no name is given
pub fn resolve(ports: &[Port], direction: Direction, explicit: Option<&str>) -> Result<Port> {
    let from_env = std::env::var(direction.env_var())
        .ok()
        .filter(|name| !name.is_empty());
    resolve_with_env(ports, direction, explicit, from_env.as_deref())
}

/// Resolution with the environment value passed in.
///
/// Names match exactly. An explicit name wins over the environment value.
pub fn resolve_with_env(
    ports: &[Port],
    direction: Direction,
    explicit: Option<&str>,
    from_env: Option<&str>,
) -> Result<Port> {
    let mut candidates = ports.iter().filter(|port| port.direction == direction);

    let (wanted, env_var) = match (explicit, from_env) {
        (Some(name), _) => (name, None),
        (None, Some(name)) => (name, Some(direction.env_var())),
        (None, None) => {
            return candidates
                .next()
                .cloned()
                .inspect(|port| debug!("Using first MIDI {} port '{}'", direction, port.name))
                .ok_or(MidiError::NoPortsAvailable(direction));
        }
    };

    candidates
        .find(|port| port.name == wanted)
        .cloned()
        .inspect(|port| debug!("Resolved MIDI {} port '{}'", direction, port.name))
        .ok_or_else(|| MidiError::NoSuchPort {
            direction,
            name: wanted.to_string(),
            env_var,
        })
}
