//! midiclock - timed MIDI streams
//!
//! Asynchronous MIDI input and output streams plus a scheduler for running
//! timestamped callbacks against the MIDI clock. An [`Engine`] owns the
//! driver, the tick fan-out and the control loop.
//!
//! ```no_run
//! use std::sync::Arc;
//! use midiclock::{Clock, Engine, EngineConfig, MidirDriver, SystemClock};
//!
//! # async fn demo() -> midiclock::Result<()> {
//! let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
//! let driver = Arc::new(MidirDriver::new("demo", Arc::clone(&clock)));
//! let engine = Engine::new(driver, clock, EngineConfig::from_env())?;
//! let _ticker = engine.start_ticker()?;
//!
//! let output = engine.open_output(None, Some(10))?;
//! output.send(&[0x90, 60, 100], engine.current_time() + 500)?;
//! engine.run().await
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod filter;
pub mod input;
pub mod keepalive;
pub mod message;
pub mod output;
pub mod port;
pub mod scheduler;
pub mod sysex;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::EngineConfig;
pub use driver::{MidiDriver, MidirDriver, VirtualDriver};
pub use engine::{Engine, Ticker};
pub use error::{DriverError, MidiError, Result};
pub use filter::InputFilter;
pub use input::InputStream;
pub use message::{format_hex, parse_hex_message, DecodedMessage, RawEvent, ShortMessage, SysexMessage};
pub use output::OutputStream;
pub use port::{Direction, Port, PortId};
pub use scheduler::{CallbackFailure, CallbackHandle};
pub use sysex::DeliveryOrder;
