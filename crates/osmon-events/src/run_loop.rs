//! Per-publisher blocking wait primitive.
//!
//! A [`RunLoop`] parks a publisher thread until a native notification, a
//! flush marker or a wake signal arrives. Native backends post into it
//! through a cloned [`LoopHandle`]. Stop requests are latched: a stop that
//! arrives before the thread enters the loop makes the next
//! [`RunLoop::run`] return [`LoopExit::Cancelled`] without blocking.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::publisher::FlushMode;
use crate::sync::lock;

/// Upper bound a synchronous flush waits for the loop to catch up.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Messages carried by the loop channel.
enum LoopSignal<N> {
    /// A native notification batch.
    Notify(N),
    /// Flush marker, acknowledged once every earlier signal was handled.
    Flush(Option<std_mpsc::SyncSender<()>>),
    /// Re-check the stop latch.
    Wake,
}

#[derive(Debug, Default)]
struct Shared {
    waiting: AtomicBool,
    stop_requested: AtomicBool,
}

/// Why [`RunLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Stopped after handling at least one wait.
    Stopped,
    /// A stop was latched before the loop was entered.
    Cancelled,
    /// Another thread is already running this loop.
    Busy,
}

/// The wait primitive owned by a publisher runtime.
pub struct RunLoop<N> {
    tx: mpsc::UnboundedSender<LoopSignal<N>>,
    rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<LoopSignal<N>>>>,
    shared: Arc<Shared>,
}

impl<N> std::fmt::Debug for RunLoop<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLoop")
            .field("waiting", &self.shared.waiting.load(Ordering::Acquire))
            .field(
                "stop_requested",
                &self.shared.stop_requested.load(Ordering::Acquire),
            )
            .finish_non_exhaustive()
    }
}

impl<N: Send + 'static> Default for RunLoop<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: Send + 'static> RunLoop<N> {
    /// Create an armed, idle run loop.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: std::sync::Mutex::new(Some(rx)),
            shared: Arc::new(Shared::default()),
        }
    }

    /// A cloneable handle for posting into this loop.
    #[must_use]
    pub fn handle(&self) -> LoopHandle<N> {
        LoopHandle {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Block the calling thread, handing each notification to `on_notify`
    /// until a stop is requested.
    ///
    /// Must not be called from inside an async runtime.
    pub fn run(&self, mut on_notify: impl FnMut(N)) -> LoopExit {
        let Some(mut rx) = lock(&self.rx).take() else {
            return LoopExit::Busy;
        };

        let mut exit = LoopExit::Cancelled;
        loop {
            if self.shared.stop_requested.load(Ordering::Acquire) {
                break;
            }
            exit = LoopExit::Stopped;

            self.shared.waiting.store(true, Ordering::Release);
            let signal = rx.blocking_recv();
            self.shared.waiting.store(false, Ordering::Release);

            match signal {
                Some(LoopSignal::Notify(n)) => on_notify(n),
                Some(LoopSignal::Flush(ack)) => {
                    trace!("run loop flush marker reached");
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                },
                Some(LoopSignal::Wake) => {},
                None => break,
            }
        }

        *lock(&self.rx) = Some(rx);
        debug!(?exit, "run loop exited");
        exit
    }

    /// Latch a stop and wake the loop. Idempotent, callable from any thread.
    pub fn stop(&self) {
        self.handle().stop();
    }

    /// Whether a stop is latched.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.shared.stop_requested.load(Ordering::Acquire)
    }

    /// Whether a thread is currently parked in [`run`](Self::run).
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.shared.waiting.load(Ordering::Acquire)
    }

    /// Clear the stop latch so a later [`run`](Self::run) blocks again.
    ///
    /// Signals left over from the previous run are discarded. Pending flush
    /// markers are acknowledged so no caller waits on them.
    pub fn rearm(&self) {
        if let Some(rx) = lock(&self.rx).as_mut() {
            let mut dropped: usize = 0;
            while let Ok(signal) = rx.try_recv() {
                match signal {
                    LoopSignal::Notify(_) => dropped = dropped.saturating_add(1),
                    LoopSignal::Flush(Some(ack)) => {
                        let _ = ack.send(());
                    },
                    LoopSignal::Flush(None) | LoopSignal::Wake => {},
                }
            }
            if dropped > 0 {
                debug!(dropped, "discarded stale notifications on rearm");
            }
        }
        self.shared.stop_requested.store(false, Ordering::Release);
    }
}

/// Sending side of a [`RunLoop`].
///
/// Native backends hold one of these as their notification sink.
pub struct LoopHandle<N> {
    tx: mpsc::UnboundedSender<LoopSignal<N>>,
    shared: Arc<Shared>,
}

impl<N> Clone for LoopHandle<N> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<N> std::fmt::Debug for LoopHandle<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("waiting", &self.shared.waiting.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<N> LoopHandle<N> {
    /// Post a notification. Returns `false` if the loop is gone.
    pub fn post(&self, notification: N) -> bool {
        self.tx.send(LoopSignal::Notify(notification)).is_ok()
    }

    /// Wake the loop without latching a stop.
    pub fn wake(&self) {
        let _ = self.tx.send(LoopSignal::Wake);
    }

    /// Latch a stop and wake the loop.
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::Release);
        self.wake();
    }

    /// Whether a thread is parked in the loop.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.shared.waiting.load(Ordering::Acquire)
    }

    /// Flush the loop.
    ///
    /// [`FlushMode::Sync`] blocks until every notification posted before
    /// this call has been handled, or `timeout` elapses. Returns `false` on
    /// timeout or when the loop is gone. [`FlushMode::Async`] enqueues a
    /// marker and returns `true` immediately.
    pub fn flush(&self, mode: FlushMode, timeout: Duration) -> bool {
        match mode {
            FlushMode::Async => self.tx.send(LoopSignal::Flush(None)).is_ok(),
            FlushMode::Sync => {
                let (ack_tx, ack_rx) = std_mpsc::sync_channel(1);
                if self.tx.send(LoopSignal::Flush(Some(ack_tx))).is_err() {
                    return false;
                }
                ack_rx.recv_timeout(timeout).is_ok()
            },
        }
    }
}
