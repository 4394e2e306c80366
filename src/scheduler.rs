//! Timestamped callbacks
//!
//! One min-heap per engine, ordered by due time and then insertion order.
//! While the heap is non-empty a waiter sits on a worker thread until the tick
//! reports the earliest entry due, then hands dispatch to the control loop.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::clock::{Clock, Timestamp};
use crate::engine::Completion;
use crate::keepalive::KeepAlive;

/// Work scheduled with [`CallbackScheduler::schedule`]. Receives the time it
/// was due.
pub type Callback = Box<dyn FnOnce(Timestamp) -> anyhow::Result<()> + Send + 'static>;

/// Identifies a scheduled callback in failure reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CallbackHandle(pub u64);

/// A callback that returned an error or panicked
#[derive(Debug, Clone, Serialize)]
pub struct CallbackFailure {
    pub handle: CallbackHandle,
    pub due: Timestamp,
    pub message: String,
}

struct Entry {
    due: Timestamp,
    seq: u64,
    callback: Callback,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due).then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct HeapState {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
    /// A waiter or a dispatch is outstanding and the keep-alive reference is held
    active: bool,
    shutdown: bool,
}

impl HeapState {
    fn next_due(&self) -> Option<Timestamp> {
        self.heap.peek().map(|Reverse(entry)| entry.due)
    }
}

pub struct CallbackScheduler {
    state: Mutex<HeapState>,
    due: Condvar,
    clock: Arc<dyn Clock>,
    keep_alive: KeepAlive,
    completions: mpsc::UnboundedSender<Completion>,
    failures: mpsc::UnboundedSender<CallbackFailure>,
    runtime: Handle,
}

impl CallbackScheduler {
    pub(crate) fn new(
        clock: Arc<dyn Clock>,
        keep_alive: KeepAlive,
        completions: mpsc::UnboundedSender<Completion>,
        failures: mpsc::UnboundedSender<CallbackFailure>,
        runtime: Handle,
    ) -> Self {
        Self {
            state: Mutex::new(HeapState::default()),
            due: Condvar::new(),
            clock,
            keep_alive,
            completions,
            failures,
            runtime,
        }
    }

    /// Queue `callback` to run on the control loop once `due` is reached.
    /// After shutdown the callback is dropped without running.
    pub fn schedule(self: &Arc<Self>, due: Timestamp, callback: Callback) -> CallbackHandle {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        if state.shutdown {
            debug!("Scheduler shut down, dropping callback {} due at {}", seq, due);
            return CallbackHandle(seq);
        }
        state.heap.push(Reverse(Entry { due, seq, callback }));
        trace!("callback {} scheduled at {}", seq, due);

        if !state.active {
            state.active = true;
            self.keep_alive.acquire();
            drop(state);
            self.spawn_waiter();
        } else {
            // May be earlier than what the waiter is sleeping on
            self.due.notify_one();
        }
        CallbackHandle(seq)
    }

    /// Number of callbacks not yet dispatched
    pub fn pending(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn next_due(&self) -> Option<Timestamp> {
        self.state.lock().next_due()
    }

    /// Tick check: wake the waiter if the earliest entry is due
    pub fn notify_due(&self, now: Timestamp) {
        let state = self.state.lock();
        if state.next_due().is_some_and(|due| due <= now) {
            self.due.notify_one();
        }
    }

    /// Stop the waiter and drop every pending callback
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if std::mem::replace(&mut state.shutdown, true) {
            return;
        }
        let dropped = state.heap.len();
        state.heap.clear();
        if std::mem::take(&mut state.active) {
            self.keep_alive.release();
        }
        self.due.notify_all();
        drop(state);
        if dropped > 0 {
            debug!("Dropped {} pending callbacks on shutdown", dropped);
        }
    }

    fn spawn_waiter(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        self.runtime.spawn_blocking(move || scheduler.wait_until_due());
    }

    /// Worker side: block until the heap minimum is due, then post a dispatch
    fn wait_until_due(self: Arc<Self>) {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            match state.next_due() {
                Some(due) if due <= self.clock.now() => break,
                Some(_) => self.due.wait(&mut state),
                None => return,
            }
        }
        drop(state);

        let scheduler = Arc::clone(&self);
        if self
            .completions
            .send(Box::new(move || scheduler.dispatch_due()))
            .is_err()
        {
            debug!("Control loop gone, callbacks will not be dispatched");
        }
    }

    /// Control-loop side: run every due entry in order, then re-arm or go idle
    pub(crate) fn dispatch_due(self: &Arc<Self>) {
        loop {
            let entry = {
                let mut state = self.state.lock();
                if state.shutdown {
                    return;
                }
                let now = self.clock.now();
                match state.next_due() {
                    Some(due) if due <= now => state.heap.pop().map(|Reverse(entry)| entry),
                    _ => None,
                }
            };
            let Some(entry) = entry else {
                break;
            };
            self.invoke(entry);
        }

        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }
        if state.heap.is_empty() {
            state.active = false;
            self.keep_alive.release();
            trace!("callback heap drained");
        } else {
            drop(state);
            self.spawn_waiter();
        }
    }

    fn invoke(&self, entry: Entry) {
        let Entry { due, seq, callback } = entry;
        trace!("dispatching callback {} due at {}", seq, due);
        let message = match catch_unwind(AssertUnwindSafe(|| callback(due))) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic) => panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "callback panicked".to_string()),
        };
        error!("Callback {} due at {} failed: {}", seq, due, message);
        let _ = self.failures.send(CallbackFailure {
            handle: CallbackHandle(seq),
            due,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    struct Fixture {
        scheduler: Arc<CallbackScheduler>,
        clock: Arc<ManualClock>,
        keep_alive: KeepAlive,
        completions: mpsc::UnboundedReceiver<Completion>,
        failures: mpsc::UnboundedReceiver<CallbackFailure>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(1));
            let keep_alive = KeepAlive::new();
            let (completion_tx, completions) = mpsc::unbounded_channel();
            let (failure_tx, failures) = mpsc::unbounded_channel();
            let scheduler = Arc::new(CallbackScheduler::new(
                clock.clone(),
                keep_alive.clone(),
                completion_tx,
                failure_tx,
                Handle::current(),
            ));
            Self {
                scheduler,
                clock,
                keep_alive,
                completions,
                failures,
            }
        }

        /// Advance the clock, tick, and run the dispatch the waiter posts
        async fn run_to(&mut self, now: Timestamp) {
            self.clock.set(now);
            self.scheduler.notify_due(now);
            let completion = tokio::time::timeout(Duration::from_secs(1), self.completions.recv())
                .await
                .expect("waiter posted a dispatch")
                .expect("channel open");
            completion();
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<Timestamp>>>) -> impl Fn(Timestamp) -> Callback {
        let log = Arc::clone(log);
        move |tag| {
            let log = Arc::clone(&log);
            Box::new(move |_due| {
                log.lock().push(tag);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_dispatch_in_due_order() {
        let mut f = Fixture::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let record = recorder(&log);

        for due in [50, 10, 30] {
            f.scheduler.schedule(due, record(due));
        }
        assert_eq!(f.keep_alive.count(), 1);
        assert_eq!(f.scheduler.next_due(), Some(10));

        f.run_to(60).await;
        assert_eq!(*log.lock(), vec![10, 30, 50]);
        assert_eq!(f.scheduler.pending(), 0);
        assert!(f.keep_alive.is_idle());
    }

    #[tokio::test]
    async fn test_partial_dispatch_rearms() {
        let mut f = Fixture::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let record = recorder(&log);

        f.scheduler.schedule(10, record(10));
        f.scheduler.schedule(40, record(40));

        f.run_to(20).await;
        assert_eq!(*log.lock(), vec![10]);
        assert_eq!(f.keep_alive.count(), 1);

        f.run_to(40).await;
        assert_eq!(*log.lock(), vec![10, 40]);
        assert!(f.keep_alive.is_idle());
    }

    #[tokio::test]
    async fn test_ties_run_in_insertion_order() {
        let mut f = Fixture::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let record = recorder(&log);

        for tag in [3, 1, 2] {
            let callback = record(tag);
            f.scheduler.schedule(25, callback);
        }
        f.run_to(25).await;
        assert_eq!(*log.lock(), vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_dispatch() {
        let mut f = Fixture::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let record = recorder(&log);

        let failing = f
            .scheduler
            .schedule(10, Box::new(|_| Err(anyhow::anyhow!("boom"))));
        f.scheduler
            .schedule(11, Box::new(|_| panic!("callback exploded")));
        f.scheduler.schedule(12, record(12));

        f.run_to(12).await;
        assert_eq!(*log.lock(), vec![12]);

        let first = f.failures.try_recv().unwrap();
        assert_eq!(first.handle, failing);
        assert_eq!(first.message, "boom");
        let second = f.failures.try_recv().unwrap();
        assert_eq!(second.due, 11);
        assert_eq!(second.message, "callback exploded");
        assert!(f.keep_alive.is_idle());
    }

    #[tokio::test]
    async fn test_shutdown_releases_reference() {
        let f = Fixture::new();
        f.scheduler.schedule(1000, Box::new(|_| Ok(())));
        assert_eq!(f.keep_alive.count(), 1);

        f.scheduler.shutdown();
        assert!(f.keep_alive.is_idle());
        assert_eq!(f.scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_schedule_after_shutdown_is_dropped() {
        let mut f = Fixture::new();
        f.scheduler.shutdown();

        let log = Arc::new(Mutex::new(Vec::new()));
        f.scheduler.schedule(1, recorder(&log)(1));
        assert!(f.keep_alive.is_idle());
        assert_eq!(f.scheduler.pending(), 0);

        f.clock.set(5);
        f.scheduler.notify_due(5);
        let posted = tokio::time::timeout(Duration::from_millis(50), f.completions.recv()).await;
        assert!(posted.is_err());
        assert!(log.lock().is_empty());
    }
}
