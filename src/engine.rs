//! Engine - owned context for streams, watermark and callback scheduler
//!
//! The engine holds everything that would otherwise be process-wide: the
//! registry of open inputs polled by the tick, the delayed-send watermark, the
//! callback heap and the completion channel feeding the control loop.
//!
//! Time advances through [`Engine::tick`], normally called every millisecond by
//! the thread started with [`Engine::start_ticker`]. [`Engine::run`] is the
//! control loop: it runs completions posted by workers until nothing holds a
//! keep-alive reference any more.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, Timestamp};
use crate::config::EngineConfig;
use crate::driver::MidiDriver;
use crate::error::{MidiError, Result};
use crate::input::{InputShared, InputStream};
use crate::keepalive::KeepAlive;
use crate::output::{OutputStream, Watermark};
use crate::port::{self, Direction, Port};
use crate::scheduler::{Callback, CallbackFailure, CallbackHandle, CallbackScheduler};

/// Work handed from a worker thread to the control loop
pub(crate) type Completion = Box<dyn FnOnce() + Send + 'static>;

struct EngineContext {
    driver: Arc<dyn MidiDriver>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    keep_alive: KeepAlive,
    inputs: Mutex<HashMap<u64, Arc<InputShared>>>,
    watermark: Arc<Watermark>,
    scheduler: Arc<CallbackScheduler>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Completion>>,
    failure_rx: Mutex<Option<mpsc::UnboundedReceiver<CallbackFailure>>>,
    runtime: Handle,
}

impl EngineContext {
    fn tick(&self, now: Timestamp) {
        let inputs: Vec<Arc<InputShared>> = {
            let mut inputs = self.inputs.lock();
            inputs.retain(|_, input| !input.is_closed());
            inputs.values().cloned().collect()
        };
        for input in &inputs {
            input.poll_once();
        }
        self.watermark.check(now);
        self.scheduler.notify_due(now);
    }
}

impl Drop for EngineContext {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}

/// Handle to a MIDI engine. Clones share the same engine.
#[derive(Clone)]
pub struct Engine {
    ctx: Arc<EngineContext>,
}

impl Engine {
    /// Create an engine. Must be called from within a tokio runtime, which
    /// hosts the worker threads.
    pub fn new(driver: Arc<dyn MidiDriver>, clock: Arc<dyn Clock>, config: EngineConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| MidiError::Runtime(format!("engine needs a tokio runtime: {}", e)))?;
        let keep_alive = KeepAlive::new();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();

        let scheduler = Arc::new(CallbackScheduler::new(
            Arc::clone(&clock),
            keep_alive.clone(),
            completion_tx.clone(),
            failure_tx,
            runtime.clone(),
        ));

        Ok(Self {
            ctx: Arc::new(EngineContext {
                driver,
                clock,
                watermark: Arc::new(Watermark::new(keep_alive.clone())),
                config,
                keep_alive,
                inputs: Mutex::new(HashMap::new()),
                scheduler,
                completion_tx,
                completion_rx: tokio::sync::Mutex::new(completion_rx),
                failure_rx: Mutex::new(Some(failure_rx)),
                runtime,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    /// Current engine time in milliseconds
    pub fn current_time(&self) -> Timestamp {
        self.ctx.clock.now()
    }

    pub fn keep_alive(&self) -> &KeepAlive {
        &self.ctx.keep_alive
    }

    pub fn watermark(&self) -> Timestamp {
        self.ctx.watermark.current()
    }

    fn ports(&self) -> Result<Vec<Port>> {
        self.ctx
            .driver
            .enumerate()
            .map_err(|e| MidiError::driver("could not list MIDI ports", e))
    }

    fn port_names(&self, direction: Direction) -> Result<Vec<String>> {
        Ok(self
            .ports()?
            .into_iter()
            .filter(|port| port.direction == direction)
            .map(|port| port.name)
            .collect())
    }

    /// Names of all input devices
    pub fn input_ports(&self) -> Result<Vec<String>> {
        self.port_names(Direction::Input)
    }

    /// Names of all output devices
    pub fn output_ports(&self) -> Result<Vec<String>> {
        self.port_names(Direction::Output)
    }

    /// Open an input. Without a name, the configured port, then `MIDI_INPUT`,
    /// then the first input device is used.
    pub fn open_input(&self, name: Option<&str>) -> Result<InputStream> {
        let explicit = name.or(self.ctx.config.input_port.as_deref());
        let port = port::resolve(&self.ports()?, Direction::Input, explicit)?;
        let handle = self
            .ctx
            .driver
            .open_input(&port)
            .map_err(|e| MidiError::driver("could not open MIDI input port", e))?;

        let stream = InputStream::new(
            Arc::clone(&self.ctx.driver),
            port,
            handle,
            self.ctx.config.read_batch,
            self.ctx.keep_alive.clone(),
            self.ctx.completion_tx.clone(),
            self.ctx.runtime.clone(),
        );
        stream.set_delivery_order(self.ctx.config.delivery_order);
        let shared = stream.shared();
        self.ctx.inputs.lock().insert(shared.id(), shared);
        info!("MIDI input opened: '{}'", stream.port().name);
        Ok(stream)
    }

    /// Open an output. `latency` falls back to the configured default.
    pub fn open_output(&self, name: Option<&str>, latency: Option<Timestamp>) -> Result<OutputStream> {
        let explicit = name.or(self.ctx.config.output_port.as_deref());
        let latency = latency.unwrap_or(self.ctx.config.latency_ms);
        let port = port::resolve(&self.ports()?, Direction::Output, explicit)?;
        let handle = self
            .ctx
            .driver
            .open_output(&port, latency)
            .map_err(|e| MidiError::driver("could not open MIDI output port", e))?;

        info!("MIDI output opened: '{}' (latency {}ms)", port.name, latency);
        Ok(OutputStream::new(
            Arc::clone(&self.ctx.driver),
            Arc::clone(&self.ctx.clock),
            Arc::clone(&self.ctx.watermark),
            port,
            handle,
            latency,
        ))
    }

    /// Run `callback` on the control loop once the engine clock reaches `due`
    pub fn at<F>(&self, due: Timestamp, callback: F) -> CallbackHandle
    where
        F: FnOnce(Timestamp) -> anyhow::Result<()> + Send + 'static,
    {
        let callback: Callback = Box::new(callback);
        self.ctx.scheduler.schedule(due, callback)
    }

    /// Callbacks waiting to be dispatched
    pub fn pending_callbacks(&self) -> usize {
        self.ctx.scheduler.pending()
    }

    /// Failures of dispatched callbacks. Can only be taken once.
    pub fn fatal_errors(&self) -> Option<mpsc::UnboundedReceiver<CallbackFailure>> {
        self.ctx.failure_rx.lock().take()
    }

    /// Fan one tick out to input polling, the watermark and the callback
    /// heap. Never blocks.
    pub fn tick(&self, now: Timestamp) {
        self.ctx.tick(now);
    }

    /// Tick with the engine clock's current time
    pub fn tick_now(&self) {
        self.ctx.tick(self.ctx.clock.now());
    }

    /// Start a thread ticking at the configured interval. Stops when the
    /// returned [`Ticker`] is dropped.
    pub fn start_ticker(&self) -> Result<Ticker> {
        let interval = Duration::from_millis(self.ctx.config.tick_interval_ms.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let ctx = Arc::clone(&self.ctx);
        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("midi-tick".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    ctx.tick(ctx.clock.now());
                    std::thread::sleep(interval);
                }
            })
            .map_err(|e| MidiError::Runtime(format!("failed to start tick thread: {}", e)))?;
        debug!("Tick thread started ({}ms)", interval.as_millis());
        Ok(Ticker {
            stop,
            thread: Some(thread),
        })
    }

    /// Control loop. Runs completions posted by workers until no keep-alive
    /// reference is left.
    pub async fn run(&self) -> Result<()> {
        let mut completions = self.ctx.completion_rx.lock().await;
        loop {
            while let Ok(completion) = completions.try_recv() {
                completion();
            }
            if self.ctx.keep_alive.is_idle() {
                break;
            }
            tokio::select! {
                biased;
                completion = completions.recv() => match completion {
                    Some(completion) => completion(),
                    None => break,
                },
                _ = self.ctx.keep_alive.wait_idle() => {
                    trace!("keep-alive idle, draining completions");
                }
            }
        }
        debug!("Control loop finished");
        Ok(())
    }

    /// Drop pending callbacks and close every registered input
    pub fn shutdown(&self) {
        self.ctx.scheduler.shutdown();
        let inputs: Vec<_> = self.ctx.inputs.lock().drain().map(|(_, input)| input).collect();
        if !inputs.is_empty() {
            warn!("Engine shut down with {} open inputs", inputs.len());
        }
        for input in inputs {
            input.close();
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.ctx.config)
            .field("keep_alive", &self.ctx.keep_alive)
            .finish()
    }
}

/// Running tick thread
pub struct Ticker {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            debug!("Tick thread stopped");
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests;
