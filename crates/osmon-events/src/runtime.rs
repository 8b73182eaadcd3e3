//! Publisher runtime: live subscriptions, lifecycle state and firing.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info, trace, warn};

use crate::error::{EventsError, EventsResult};
use crate::publisher::{EventPublisher, FlushMode, PublisherContext, RunStatus};
use crate::run_loop::RunLoop;
use crate::subscriber::Subscription;
use crate::sync::{lock, read, write};

/// Shared handle to a typed publisher runtime.
pub type PublisherHandle<P> = Arc<PublisherRuntime<P>>;

/// Lifecycle of one publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    /// Never configured, or torn down.
    Uninitialized,
    /// Configured and ready to run.
    Configured,
    /// A thread is inside `run`.
    Running,
    /// Stop requested while running.
    Stopping,
    /// Run exited, or stopped before it began.
    Stopped,
}

/// Outcome of one firing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FireSummary {
    /// Subscriptions whose predicate matched.
    pub matched: usize,
    /// Rows appended across all matched subscriptions.
    pub rows: usize,
    /// Matched subscriptions whose callback failed.
    pub failures: usize,
}

/// Changes applied to the live set at the next configure.
struct Pending<P: EventPublisher> {
    added: Vec<Subscription<P>>,
    removed: BTreeSet<String>,
}

impl<P: EventPublisher> Default for Pending<P> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            removed: BTreeSet::new(),
        }
    }
}

/// Owns one publisher plus everything the factory needs to drive it.
pub struct PublisherRuntime<P: EventPublisher> {
    publisher: P,
    name: &'static str,
    live: RwLock<Vec<Subscription<P>>>,
    pending: Mutex<Pending<P>>,
    run_loop: RunLoop<P::Notification>,
    state: Mutex<PublisherState>,
}

impl<P: EventPublisher> fmt::Debug for PublisherRuntime<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublisherRuntime")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("live", &read(&self.live).len())
            .finish_non_exhaustive()
    }
}

impl<P: EventPublisher> PublisherRuntime<P> {
    /// Wrap a publisher. The runtime starts [`PublisherState::Uninitialized`].
    #[must_use]
    pub fn new(publisher: P) -> Self {
        let name = publisher.type_name();
        Self {
            publisher,
            name,
            live: RwLock::new(Vec::new()),
            pending: Mutex::new(Pending::default()),
            run_loop: RunLoop::new(),
            state: Mutex::new(PublisherState::Uninitialized),
        }
    }

    /// Registry name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The wrapped publisher.
    #[must_use]
    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// The wait primitive.
    #[must_use]
    pub fn run_loop(&self) -> &RunLoop<P::Notification> {
        &self.run_loop
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PublisherState {
        *lock(&self.state)
    }

    /// Stage a subscription for the next configure.
    pub fn stage_subscription(&self, subscription: Subscription<P>) {
        lock(&self.pending).added.push(subscription);
    }

    /// Stage removal of every subscription owned by `subscriber`.
    ///
    /// Staged-but-not-live subscriptions are discarded immediately. Returns
    /// the number of subscriptions affected.
    pub fn remove_subscriber(&self, subscriber: &str) -> usize {
        let mut pending = lock(&self.pending);
        let before = pending.added.len();
        pending.added.retain(|s| s.subscriber() != subscriber);
        let discarded = before.saturating_sub(pending.added.len());

        let live = read(&self.live)
            .iter()
            .filter(|s| s.subscriber() == subscriber)
            .count();
        if live > 0 {
            pending.removed.insert(subscriber.to_owned());
        }
        discarded.saturating_add(live)
    }

    /// Whether staged changes await the next configure.
    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        let pending = lock(&self.pending);
        !pending.added.is_empty() || !pending.removed.is_empty()
    }

    /// Live plus staged subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        let staged = lock(&self.pending).added.len();
        read(&self.live).len().saturating_add(staged)
    }

    /// Apply staged changes and let the publisher rebuild its watch set.
    ///
    /// From `Uninitialized`, `Configured` or `Stopped` the run loop is
    /// re-armed before the publisher configures, so anything a freshly
    /// started stream posts is kept, and the state moves to `Configured`.
    /// A running publisher stays running.
    ///
    /// # Errors
    ///
    /// Propagates the publisher's configure error; the state is unchanged.
    pub fn configure(&self) -> EventsResult<()> {
        let mut state = lock(&self.state);
        let rearm = matches!(
            *state,
            PublisherState::Uninitialized | PublisherState::Configured | PublisherState::Stopped
        );
        if rearm {
            self.run_loop.rearm();
        }

        let result = {
            let mut pending_guard = lock(&self.pending);
            let mut live = write(&self.live);
            let pending = std::mem::take(&mut *pending_guard);
            drop(pending_guard);
            if !pending.removed.is_empty() {
                live.retain(|s| !pending.removed.contains(s.subscriber()));
            }
            live.extend(pending.added);
            debug!(publisher = %self.name, subscriptions = live.len(), "configuring publisher");
            self.publisher.configure(&mut live)
        };

        if let Err(e) = result {
            warn!(publisher = %self.name, error = %e, "publisher configure failed");
            return Err(e);
        }

        if rearm {
            *state = PublisherState::Configured;
        }
        Ok(())
    }

    /// Run the publisher on the calling thread until it is stopped.
    ///
    /// # Errors
    ///
    /// [`EventsError::NotConfigured`] before the first configure,
    /// [`EventsError::AlreadyRunning`] if another thread is running it, or
    /// the publisher's own fatal error.
    pub fn run(&self) -> EventsResult<RunStatus> {
        {
            let mut state = lock(&self.state);
            match *state {
                PublisherState::Uninitialized => {
                    return Err(EventsError::NotConfigured(self.name.to_owned()));
                },
                PublisherState::Running => {
                    return Err(EventsError::AlreadyRunning(self.name.to_owned()));
                },
                PublisherState::Stopping | PublisherState::Stopped => {
                    *state = PublisherState::Stopped;
                    debug!(publisher = %self.name, "stop latched before run");
                    return Ok(RunStatus::Cancelled);
                },
                PublisherState::Configured => *state = PublisherState::Running,
            }
        }

        info!(publisher = %self.name, "publisher run loop starting");
        let result = self.publisher.run(&PublisherContext::new(self));

        {
            let mut state = lock(&self.state);
            if *state != PublisherState::Uninitialized {
                *state = PublisherState::Stopped;
            }
        }

        match &result {
            Ok(status) => info!(publisher = %self.name, ?status, "publisher run loop exited"),
            Err(e) => warn!(publisher = %self.name, error = %e, "publisher run failed"),
        }
        result
    }

    /// Stop the publisher. Idempotent and callable from any thread.
    pub fn stop(&self) {
        {
            let mut state = lock(&self.state);
            match *state {
                PublisherState::Running => *state = PublisherState::Stopping,
                PublisherState::Configured => *state = PublisherState::Stopped,
                PublisherState::Uninitialized
                | PublisherState::Stopping
                | PublisherState::Stopped => {},
            }
        }
        self.publisher.stop();
        self.run_loop.stop();
    }

    /// Stop, tear down the publisher and return to `Uninitialized`.
    pub fn tear_down(&self) {
        self.stop();
        self.publisher.tear_down();
        *lock(&self.state) = PublisherState::Uninitialized;
        debug!(publisher = %self.name, "publisher torn down");
    }

    /// Flush the publisher's pending notifications.
    pub fn flush(&self, mode: FlushMode) {
        self.publisher.flush(mode);
    }

    /// Whether the publisher reports an active stream.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.publisher.is_active()
    }

    /// Distinct native targets being watched.
    #[must_use]
    pub fn num_subscribed_targets(&self) -> usize {
        self.publisher.num_subscribed_targets()
    }

    /// Test `ec` against every live subscription and deliver it to matches.
    ///
    /// Callback errors and panics are logged and counted, never propagated.
    pub fn fire(&self, ec: Arc<P::EventContext>) -> FireSummary {
        let mut summary = FireSummary::default();
        let live = read(&self.live);
        for subscription in live.iter() {
            if !self.publisher.should_fire(subscription.context(), &ec) {
                continue;
            }
            summary.matched = summary.matched.saturating_add(1);
            match subscription.deliver(&ec) {
                Ok(rows) => summary.rows = summary.rows.saturating_add(rows),
                Err(e) => {
                    summary.failures = summary.failures.saturating_add(1);
                    warn!(publisher = %self.name, error = %e, "subscriber callback failed");
                },
            }
        }
        trace!(
            publisher = %self.name,
            matched = summary.matched,
            rows = summary.rows,
            "fired event"
        );
        summary
    }
}

/// Object-safe lifecycle view stored in the factory registry.
pub trait PublisherLifecycle: Send + Sync {
    /// Registry name.
    fn name(&self) -> &'static str;
    /// Current lifecycle state.
    fn state(&self) -> PublisherState;
    /// See [`PublisherRuntime::configure`].
    ///
    /// # Errors
    ///
    /// Propagates the publisher's configure error.
    fn configure(&self) -> EventsResult<()>;
    /// See [`PublisherRuntime::run`].
    ///
    /// # Errors
    ///
    /// Lifecycle misuse or a fatal publisher error.
    fn run(&self) -> EventsResult<RunStatus>;
    /// See [`PublisherRuntime::stop`].
    fn stop(&self);
    /// See [`PublisherRuntime::tear_down`].
    fn tear_down(&self);
    /// See [`PublisherRuntime::flush`].
    fn flush(&self, mode: FlushMode);
    /// Live plus staged subscriptions.
    fn subscription_count(&self) -> usize;
    /// Whether staged changes await configure.
    fn has_pending_changes(&self) -> bool;
    /// Whether the publisher reports an active stream.
    fn is_active(&self) -> bool;
    /// Distinct native targets being watched.
    fn num_subscribed_targets(&self) -> usize;
    /// Stage removal of a subscriber's subscriptions.
    fn remove_subscriber(&self, subscriber: &str) -> usize;
}

impl<P: EventPublisher> PublisherLifecycle for PublisherRuntime<P> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn state(&self) -> PublisherState {
        PublisherRuntime::state(self)
    }

    fn configure(&self) -> EventsResult<()> {
        PublisherRuntime::configure(self)
    }

    fn run(&self) -> EventsResult<RunStatus> {
        PublisherRuntime::run(self)
    }

    fn stop(&self) {
        PublisherRuntime::stop(self);
    }

    fn tear_down(&self) {
        PublisherRuntime::tear_down(self);
    }

    fn flush(&self, mode: FlushMode) {
        PublisherRuntime::flush(self, mode);
    }

    fn subscription_count(&self) -> usize {
        PublisherRuntime::subscription_count(self)
    }

    fn has_pending_changes(&self) -> bool {
        PublisherRuntime::has_pending_changes(self)
    }

    fn is_active(&self) -> bool {
        PublisherRuntime::is_active(self)
    }

    fn num_subscribed_targets(&self) -> usize {
        PublisherRuntime::num_subscribed_targets(self)
    }

    fn remove_subscriber(&self, subscriber: &str) -> usize {
        PublisherRuntime::remove_subscriber(self, subscriber)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{DateTime, Utc};

    use super::*;
    use crate::context::{EventContext, Row};
    use crate::run_loop::{DEFAULT_FLUSH_TIMEOUT, LoopExit, LoopHandle};
    use crate::subscriber::RowBuffer;

    #[derive(Debug)]
    struct Ping {
        id: u64,
        topic: &'static str,
    }

    impl EventContext for Ping {
        fn transaction_id(&self) -> u64 {
            self.id
        }

        fn time(&self) -> DateTime<Utc> {
            DateTime::<Utc>::UNIX_EPOCH
        }
    }

    #[derive(Default)]
    struct PingPublisher {
        configures: AtomicUsize,
        stops: AtomicUsize,
        post_on_configure: Mutex<Option<LoopHandle<Ping>>>,
    }

    impl EventPublisher for PingPublisher {
        type SubscriptionContext = &'static str;
        type EventContext = Ping;
        type Notification = Ping;

        fn type_name(&self) -> &'static str {
            "ping"
        }

        fn configure(&self, _subscriptions: &mut [Subscription<Self>]) -> EventsResult<()> {
            self.configures.fetch_add(1, Ordering::SeqCst);
            if let Some(handle) = self.post_on_configure.lock().unwrap().as_ref() {
                handle.post(Ping { id: 99, topic: "news" });
            }
            Ok(())
        }

        fn run(&self, ctx: &PublisherContext<'_, Self>) -> EventsResult<RunStatus> {
            match ctx.run_loop().run(|ping| {
                ctx.fire(ping);
            }) {
                LoopExit::Cancelled => Ok(RunStatus::Cancelled),
                LoopExit::Busy => Err(EventsError::AlreadyRunning("ping".to_owned())),
                LoopExit::Stopped => Ok(RunStatus::Completed),
            }
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn should_fire(&self, sc: &&'static str, ec: &Ping) -> bool {
            *sc == ec.topic
        }

        fn is_active(&self) -> bool {
            false
        }
    }

    fn subscribe(
        runtime: &PublisherRuntime<PingPublisher>,
        subscriber: &str,
        topic: &'static str,
    ) -> Arc<RowBuffer> {
        let buffer = Arc::new(RowBuffer::new());
        runtime.stage_subscription(Subscription::new(
            subscriber,
            topic,
            |ec: &Ping, _sc: &&'static str| Ok(vec![Row::new().with("id", ec.id)]),
            Arc::clone(&buffer),
        ));
        buffer
    }

    fn ping(id: u64, topic: &'static str) -> Arc<Ping> {
        Arc::new(Ping { id, topic })
    }

    #[test]
    fn test_run_before_configure_is_rejected() {
        let runtime = PublisherRuntime::new(PingPublisher::default());
        assert!(matches!(runtime.run(), Err(EventsError::NotConfigured(_))));
    }

    #[test]
    fn test_staged_subscriptions_go_live_on_configure() {
        let runtime = PublisherRuntime::new(PingPublisher::default());
        let buffer = subscribe(&runtime, "a", "news");

        assert_eq!(runtime.fire(ping(1, "news")).matched, 0);
        assert_eq!(runtime.subscription_count(), 1);
        assert!(runtime.has_pending_changes());

        runtime.configure().unwrap();
        assert_eq!(runtime.state(), PublisherState::Configured);
        assert!(!runtime.has_pending_changes());

        let summary = runtime.fire(ping(2, "news"));
        assert_eq!(summary, FireSummary { matched: 1, rows: 1, failures: 0 });
        assert_eq!(runtime.fire(ping(3, "sports")).matched, 0);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_stop_before_run_cancels() {
        let runtime = PublisherRuntime::new(PingPublisher::default());
        runtime.configure().unwrap();
        runtime.stop();
        runtime.stop();
        assert_eq!(runtime.state(), PublisherState::Stopped);
        assert_eq!(runtime.run().unwrap(), RunStatus::Cancelled);
        assert_eq!(runtime.publisher().stops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stop_without_configure_is_harmless() {
        let runtime = PublisherRuntime::new(PingPublisher::default());
        runtime.stop();
        assert_eq!(runtime.state(), PublisherState::Uninitialized);
    }

    #[test]
    fn test_run_on_thread_then_stop_then_rerun() {
        let runtime = Arc::new(PublisherRuntime::new(PingPublisher::default()));
        let buffer = subscribe(&runtime, "a", "news");
        runtime.configure().unwrap();

        let thread = {
            let runtime = Arc::clone(&runtime);
            std::thread::spawn(move || runtime.run())
        };
        let handle = runtime.run_loop().handle();
        handle.post(Ping { id: 1, topic: "news" });
        assert!(handle.flush(FlushMode::Sync, crate::run_loop::DEFAULT_FLUSH_TIMEOUT));
        assert_eq!(buffer.len(), 1);

        runtime.stop();
        assert_eq!(thread.join().unwrap().unwrap(), RunStatus::Completed);
        assert_eq!(runtime.state(), PublisherState::Stopped);

        runtime.configure().unwrap();
        assert_eq!(runtime.state(), PublisherState::Configured);
        assert!(!runtime.run_loop().is_stop_requested());
    }

    #[test]
    fn test_notifications_posted_during_restart_configure_survive() {
        let runtime = Arc::new(PublisherRuntime::new(PingPublisher::default()));
        let buffer = subscribe(&runtime, "a", "news");
        runtime.configure().unwrap();
        runtime.stop();
        assert_eq!(runtime.state(), PublisherState::Stopped);

        *runtime.publisher().post_on_configure.lock().unwrap() = Some(runtime.run_loop().handle());
        runtime.configure().unwrap();

        let thread = {
            let runtime = Arc::clone(&runtime);
            std::thread::spawn(move || runtime.run())
        };
        assert!(runtime.run_loop().handle().flush(FlushMode::Sync, DEFAULT_FLUSH_TIMEOUT));
        assert_eq!(buffer.len(), 1);

        runtime.stop();
        assert_eq!(thread.join().unwrap().unwrap(), RunStatus::Completed);
    }

    #[test]
    fn test_failing_and_panicking_callbacks_do_not_block_others() {
        let runtime = PublisherRuntime::new(PingPublisher::default());
        runtime.stage_subscription(Subscription::new(
            "broken",
            "news",
            |_: &Ping, _: &&'static str| {
                Err(EventsError::UnknownSubscriber("nope".to_owned()))
            },
            Arc::new(RowBuffer::new()),
        ));
        runtime.stage_subscription(Subscription::new(
            "panicky",
            "news",
            |_: &Ping, _: &&'static str| -> EventsResult<Vec<Row>> { panic!("boom") },
            Arc::new(RowBuffer::new()),
        ));
        let good = subscribe(&runtime, "good", "news");
        runtime.configure().unwrap();

        let summary = runtime.fire(ping(1, "news"));

        assert_eq!(summary.matched, 3);
        assert_eq!(summary.failures, 2);
        assert_eq!(summary.rows, 1);
        assert_eq!(good.len(), 1);

        // The live lock survives the panic.
        assert_eq!(runtime.fire(ping(2, "news")).rows, 1);
    }

    #[test]
    fn test_remove_subscriber_applies_on_configure() {
        let runtime = PublisherRuntime::new(PingPublisher::default());
        subscribe(&runtime, "a", "news");
        subscribe(&runtime, "b", "news");
        runtime.configure().unwrap();

        assert_eq!(runtime.remove_subscriber("a"), 1);
        assert_eq!(runtime.fire(ping(1, "news")).matched, 2);

        runtime.configure().unwrap();
        assert_eq!(runtime.fire(ping(2, "news")).matched, 1);
    }

    #[test]
    fn test_remove_discards_staged_adds() {
        let runtime = PublisherRuntime::new(PingPublisher::default());
        subscribe(&runtime, "a", "news");
        assert_eq!(runtime.remove_subscriber("a"), 1);
        assert_eq!(runtime.subscription_count(), 0);
    }

    #[test]
    fn test_tear_down_requires_configure() {
        let runtime = PublisherRuntime::new(PingPublisher::default());
        runtime.configure().unwrap();
        runtime.tear_down();
        assert_eq!(runtime.state(), PublisherState::Uninitialized);
        assert!(matches!(runtime.run(), Err(EventsError::NotConfigured(_))));
        assert_eq!(runtime.publisher().configures.load(Ordering::SeqCst), 1);
    }
}
