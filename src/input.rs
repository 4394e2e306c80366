//! Input streams
//!
//! Each open input owns a reassembler behind a stream-local lock. Receivers
//! block on a worker thread until the tick reports driver data, read a batch
//! through the reassembler and return everything completed so far.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::driver::{MidiDriver, StreamHandle};
use crate::engine::Completion;
use crate::error::{MidiError, Result};
use crate::filter::InputFilter;
use crate::keepalive::KeepAlive;
use crate::message::DecodedMessage;
use crate::port::Port;
use crate::sysex::{DeliveryOrder, SysexAssembler};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

struct InputState {
    assembler: SysexAssembler,
    order: DeliveryOrder,
    closed: bool,
    /// Drained for a receiver that was cancelled before taking them
    undelivered: Vec<DecodedMessage>,
}

/// Part of an input stream shared with workers and the tick
pub(crate) struct InputShared {
    id: u64,
    port: Port,
    handle: StreamHandle,
    driver: Arc<dyn MidiDriver>,
    read_batch: usize,
    state: Mutex<InputState>,
    data_ready: Condvar,
}

impl InputShared {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Non-blocking check run by the tick. Only signals; reading is left to
    /// the blocked receiver so packets are never read twice.
    pub(crate) fn poll_once(&self) {
        let state = self.state.lock();
        if state.closed {
            return;
        }
        // An error wakes the receiver too, it picks the error up from its own driver call
        if self.driver.poll(self.handle).unwrap_or(true) {
            trace!("data ready on MIDI input '{}'", self.port.name);
            // Every waiter rechecks; a cancelled one leaves without reading
            self.data_ready.notify_all();
        }
    }

    fn receive_blocking(&self) -> Result<Vec<DecodedMessage>> {
        self.wait_for_messages(|| false).map(Option::unwrap_or_default)
    }

    /// Block until messages are available. Returns `Ok(None)` without
    /// touching the driver once `cancelled` reports the caller is gone.
    fn wait_for_messages(&self, cancelled: impl Fn() -> bool) -> Result<Option<Vec<DecodedMessage>>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(MidiError::StreamClosed);
            }
            if cancelled() {
                return Ok(None);
            }
            if !state.undelivered.is_empty() || state.assembler.has_messages() {
                let order = state.order;
                let mut messages = std::mem::take(&mut state.undelivered);
                messages.extend(state.assembler.drain(order));
                return Ok(Some(messages));
            }
            let batch = self.driver.poll(self.handle).and_then(|ready| {
                if ready {
                    self.driver.read(self.handle, self.read_batch).map(Some)
                } else {
                    Ok(None)
                }
            });
            match batch {
                Ok(Some(events)) => {
                    trace!("read {} packets from '{}'", events.len(), self.port.name);
                    state.assembler.ingest_all(events);
                }
                Ok(None) => self.data_ready.wait(&mut state),
                Err(source) => {
                    warn!("Read from MIDI input '{}' failed: {}", self.port.name, source);
                    state.assembler.clear_queues();
                    return Err(MidiError::driver("error receiving MIDI data", source));
                }
            }
        }
    }

    /// Hand messages back for the next receiver
    fn stash_undelivered(&self, messages: Vec<DecodedMessage>) {
        let mut state = self.state.lock();
        if state.closed {
            debug!("Dropping {} unclaimed messages from closed input", messages.len());
            return;
        }
        trace!("{} unclaimed messages kept for the next receive", messages.len());
        state.undelivered.extend(messages);
        self.data_ready.notify_all();
    }

    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        self.data_ready.notify_all();
        drop(state);

        if let Err(e) = self.driver.close(self.handle) {
            warn!("Failed to close MIDI input '{}': {}", self.port.name, e);
        }
        debug!("Closed MIDI input '{}'", self.port.name);
    }
}

/// An open MIDI input.
///
/// `receive` and `recv_with` run their wait on a worker thread. The stream
/// closes when dropped.
pub struct InputStream {
    shared: Arc<InputShared>,
    keep_alive: KeepAlive,
    completions: mpsc::UnboundedSender<Completion>,
    runtime: Handle,
}

impl InputStream {
    pub(crate) fn new(
        driver: Arc<dyn MidiDriver>,
        port: Port,
        handle: StreamHandle,
        read_batch: usize,
        keep_alive: KeepAlive,
        completions: mpsc::UnboundedSender<Completion>,
        runtime: Handle,
    ) -> Self {
        let shared = Arc::new(InputShared {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            port,
            handle,
            driver,
            read_batch: read_batch.max(1),
            state: Mutex::new(InputState {
                assembler: SysexAssembler::new(),
                order: DeliveryOrder::default(),
                closed: false,
                undelivered: Vec::new(),
            }),
            data_ready: Condvar::new(),
        });
        Self {
            shared,
            keep_alive,
            completions,
            runtime,
        }
    }

    pub(crate) fn shared(&self) -> Arc<InputShared> {
        Arc::clone(&self.shared)
    }

    pub fn port(&self) -> &Port {
        &self.shared.port
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Signal a waiting receiver if the driver has data. Never blocks.
    pub fn poll_once(&self) {
        self.shared.poll_once();
    }

    /// Set the channel mask and message-class filter
    pub fn set_filter(&self, filter: InputFilter) -> Result<()> {
        if self.is_closed() {
            return Err(MidiError::StreamClosed);
        }
        self.shared
            .driver
            .set_filter(self.shared.handle, filter)
            .map_err(|e| MidiError::driver("could not set MIDI filter", e))?;
        debug!(
            "MIDI input '{}' filter: channels {:04X}, filters {:08X}",
            self.shared.port.name, filter.channels, filter.filters
        );
        Ok(())
    }

    pub fn set_delivery_order(&self, order: DeliveryOrder) {
        self.shared.state.lock().order = order;
    }

    /// Block the calling thread until messages are available.
    ///
    /// Must not be called from the control loop; use [`InputStream::receive`]
    /// or [`InputStream::recv_with`] there.
    pub fn receive_blocking(&self) -> Result<Vec<DecodedMessage>> {
        self.shared.receive_blocking()
    }

    /// Wait on a worker thread for the next batch of messages.
    ///
    /// Cancel safe: if the future is dropped, nothing it would have returned
    /// is lost. The next receive gets it.
    pub async fn receive(&self) -> Result<Vec<DecodedMessage>> {
        let shared = Arc::clone(&self.shared);
        let _guard = self.keep_alive.guard();
        let (tx, rx) = oneshot::channel();
        self.runtime.spawn_blocking(move || {
            let result = match shared.wait_for_messages(|| tx.is_closed()) {
                Ok(None) => return,
                Ok(Some(messages)) => Ok(messages),
                Err(e) => Err(e),
            };
            match tx.send(result) {
                Ok(()) => {}
                Err(Ok(messages)) => shared.stash_undelivered(messages),
                Err(Err(e)) => debug!("Receive cancelled, dropping error: {}", e),
            }
        });
        rx.await
            .map_err(|_| MidiError::Runtime("receive worker stopped".to_string()))?
    }

    /// Wait on a worker thread, then run `callback` on the control loop with
    /// the result.
    pub fn recv_with<F>(&self, callback: F)
    where
        F: FnOnce(Result<Vec<DecodedMessage>>) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let guard = self.keep_alive.guard();
        let completions = self.completions.clone();
        self.runtime.spawn_blocking(move || {
            let result = shared.receive_blocking();
            let completion: Completion = Box::new(move || {
                callback(result);
                drop(guard);
            });
            if completions.send(completion).is_err() {
                debug!("Control loop gone, dropping receive result");
            }
        });
    }

    /// Close the stream. Pending receivers fail with `StreamClosed`.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for InputStream {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for InputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputStream")
            .field("id", &self.shared.id)
            .field("port", &self.shared.port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{VirtualDriver, ERR_HOST};
    use crate::error::DriverError;
    use std::time::Duration;

    struct Fixture {
        driver: Arc<VirtualDriver>,
        port: Port,
        stream: InputStream,
        _completions: mpsc::UnboundedReceiver<Completion>,
        keep_alive: KeepAlive,
    }

    fn fixture() -> Fixture {
        let driver = Arc::new(VirtualDriver::new());
        let port = driver.add_input("Test In");
        let handle = driver.open_input(&port).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let keep_alive = KeepAlive::new();
        let stream = InputStream::new(
            driver.clone(),
            port.clone(),
            handle,
            32,
            keep_alive.clone(),
            tx,
            Handle::current(),
        );
        Fixture {
            driver,
            port,
            stream,
            _completions: rx,
            keep_alive,
        }
    }

    #[tokio::test]
    async fn test_receive_returns_buffered_data() {
        let f = fixture();
        f.driver.inject(f.port.id, 5, &[0x90, 60, 100]);
        let messages = f.stream.receive().await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].bytes(), vec![0x90, 60, 100]);
        assert!(f.keep_alive.is_idle());
    }

    #[tokio::test]
    async fn test_receive_wakes_on_poll() {
        let f = fixture();
        let shared = f.stream.shared();
        let worker = tokio::task::spawn_blocking(move || shared.receive_blocking());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!worker.is_finished());
        f.driver.inject(f.port.id, 7, &[0xB0, 1, 2]);
        f.stream.poll_once();

        let messages = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("receiver woke")
            .unwrap()
            .unwrap();
        assert_eq!(messages[0].timestamp(), 7);
    }

    #[tokio::test]
    async fn test_read_error_clears_queues() {
        let f = fixture();
        f.driver
            .fail_next_read(f.port.id, DriverError::host(ERR_HOST, "device unplugged"));
        f.driver.inject(f.port.id, 1, &[0x90, 1, 1]);

        let err = f.stream.receive().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "error receiving MIDI data: (host error) device unplugged"
        );

        // The packet that was pending when the read failed is still buffered
        // in the driver and arrives with the next read
        let messages = f.stream.receive().await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_receiver() {
        let f = fixture();
        let shared = f.stream.shared();
        let worker = tokio::task::spawn_blocking(move || shared.receive_blocking());
        tokio::time::sleep(Duration::from_millis(20)).await;

        f.stream.close();
        let result = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("receiver woke")
            .unwrap();
        assert!(matches!(result, Err(MidiError::StreamClosed)));

        // Closing twice is harmless
        f.stream.close();
        assert_eq!(f.driver.open_stream_count(), 0);
        assert!(matches!(
            f.stream.set_filter(InputFilter::none()),
            Err(MidiError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_timed_out_receive_keeps_data_for_next() {
        let f = fixture();
        let first = tokio::time::timeout(Duration::from_millis(30), f.stream.receive()).await;
        assert!(first.is_err());
        assert!(f.keep_alive.is_idle());

        f.driver.inject(f.port.id, 9, &[0x90, 60, 100]);
        f.stream.poll_once();

        let messages = tokio::time::timeout(Duration::from_secs(1), f.stream.receive())
            .await
            .expect("second receive woke")
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].bytes(), vec![0x90, 60, 100]);
    }

    #[tokio::test]
    async fn test_unclaimed_messages_come_first() {
        let f = fixture();
        let shared = f.stream.shared();
        f.driver.inject(f.port.id, 3, &[0xB0, 1, 1]);
        let earlier = shared.receive_blocking().unwrap();
        shared.stash_undelivered(earlier);
        f.driver.inject(f.port.id, 4, &[0xB0, 1, 2]);

        let messages = f.stream.receive().await.unwrap();
        let stamps: Vec<_> = messages.iter().map(DecodedMessage::timestamp).collect();
        assert_eq!(stamps, vec![3]);
        let messages = f.stream.receive().await.unwrap();
        assert_eq!(messages[0].timestamp(), 4);
    }

    #[tokio::test]
    async fn test_filter_drops_clock() {
        let f = fixture();
        f.stream.set_filter(InputFilter::default()).unwrap();
        f.driver.inject(f.port.id, 1, &[0xF8]);
        f.driver.inject(f.port.id, 2, &[0x80, 60, 0]);
        let messages = f.stream.receive().await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].timestamp(), 2);
    }
}
