//! The event publisher contract.

use std::fmt::Debug;
use std::sync::Arc;

use crate::context::EventContext;
use crate::error::EventsResult;
use crate::run_loop::{LoopHandle, RunLoop};
use crate::runtime::{FireSummary, PublisherRuntime};
use crate::subscriber::Subscription;

/// How [`EventPublisher::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Watched at least one target and exited on stop.
    Completed,
    /// Exited on stop with nothing to watch.
    Idle,
    /// Stop arrived before the loop was entered.
    Cancelled,
}

/// Flush behavior for [`EventPublisher::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Block (bounded) until queued notifications have been delivered.
    Sync,
    /// Enqueue a flush marker and return.
    Async,
}

/// An owner of one native event source.
///
/// Implementations are wrapped in a [`PublisherRuntime`], which owns the
/// live subscription set, the lifecycle state and the [`RunLoop`]. Every
/// method takes `&self`; publishers keep their native state behind their
/// own mutex so [`stop`](Self::stop) can run on any thread.
pub trait EventPublisher: Sized + Send + Sync + 'static {
    /// Per-subscription matching data.
    type SubscriptionContext: Send + Sync + Debug + 'static;
    /// Record delivered to matching subscriptions.
    type EventContext: EventContext;
    /// A native batch posted into the run loop.
    type Notification: Send + 'static;

    /// Registry name of this publisher type (e.g. `"fsevents"`).
    fn type_name(&self) -> &'static str;

    /// Rebuild the watch set from the live subscriptions.
    ///
    /// Called with the live set write-locked, after staged changes were
    /// applied. Publishers may fill in resolution fields on the contexts.
    ///
    /// # Errors
    ///
    /// Returns [`EventsError::Configuration`](crate::EventsError::Configuration)
    /// when native resources cannot be created.
    fn configure(&self, subscriptions: &mut [Subscription<Self>]) -> EventsResult<()>;

    /// Block on the run loop, firing events, until stopped.
    ///
    /// # Errors
    ///
    /// Returns an error only on a fatal source failure.
    fn run(&self, ctx: &PublisherContext<'_, Self>) -> EventsResult<RunStatus>;

    /// Release native resources. Safe from any thread and idempotent.
    fn stop(&self);

    /// Stop and forget the captured run loop.
    fn tear_down(&self) {
        self.stop();
    }

    /// Flush pending notifications.
    fn flush(&self, mode: FlushMode) {
        let _ = mode;
    }

    /// Whether `ec` should be delivered to the subscription described by `sc`.
    fn should_fire(&self, sc: &Self::SubscriptionContext, ec: &Self::EventContext) -> bool;

    /// Number of distinct native targets being watched.
    fn num_subscribed_targets(&self) -> usize {
        0
    }

    /// Whether a native stream is live and the run thread is parked.
    fn is_active(&self) -> bool;
}

/// What a publisher's run thread can do with its runtime.
pub struct PublisherContext<'a, P: EventPublisher> {
    runtime: &'a PublisherRuntime<P>,
}

impl<P: EventPublisher> Debug for PublisherContext<'_, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherContext")
            .field("publisher", &self.runtime.name())
            .finish()
    }
}

impl<'a, P: EventPublisher> PublisherContext<'a, P> {
    pub(crate) fn new(runtime: &'a PublisherRuntime<P>) -> Self {
        Self { runtime }
    }

    /// Registry name of the publisher.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.runtime.name()
    }

    /// Fire one event context against the live subscriptions.
    pub fn fire(&self, ec: P::EventContext) -> FireSummary {
        self.runtime.fire(Arc::new(ec))
    }

    /// The runtime's wait primitive.
    #[must_use]
    pub fn run_loop(&self) -> &RunLoop<P::Notification> {
        self.runtime.run_loop()
    }

    /// A sink handle for native backends.
    #[must_use]
    pub fn handle(&self) -> LoopHandle<P::Notification> {
        self.runtime.run_loop().handle()
    }

    /// Whether a stop is already latched.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.runtime.run_loop().is_stop_requested()
    }

    /// Re-run `configure` from the run thread.
    ///
    /// # Errors
    ///
    /// Propagates the publisher's configure error.
    pub fn reconfigure(&self) -> EventsResult<()> {
        self.runtime.configure()
    }
}
