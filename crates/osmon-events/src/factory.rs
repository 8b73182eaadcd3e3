//! The event factory: publisher and subscriber registry plus thread ownership.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use osmon_config::EventsSection;
use tracing::{debug, error, info, warn};

use crate::context::Row;
use crate::error::{EventsError, EventsResult};
use crate::publisher::EventPublisher;
use crate::runtime::{FireSummary, PublisherHandle, PublisherLifecycle, PublisherRuntime, PublisherState};
use crate::subscriber::{DrainPolicy, EventSubscriber, RowBuffer, SubscriberContext, SubscriptionId};
use crate::sync::{lock, read, write};

/// Default bound for [`EventFactory::end`] when joining threads.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Interval between liveness checks while joining.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Registry entry for one publisher type.
pub(crate) struct PublisherEntry {
    lifecycle: Arc<dyn PublisherLifecycle>,
    typed: Arc<dyn Any + Send + Sync>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PublisherEntry {
    /// Downcast to the typed runtime.
    pub(crate) fn typed<P: EventPublisher>(&self, name: &str) -> EventsResult<PublisherHandle<P>> {
        Arc::clone(&self.typed)
            .downcast::<PublisherRuntime<P>>()
            .map_err(|_| EventsError::PublisherTypeMismatch {
                name: name.to_owned(),
                expected: std::any::type_name::<P>(),
            })
    }

    fn thread_alive(&self) -> bool {
        lock(&self.thread).as_ref().is_some_and(|t| !t.is_finished())
    }
}

struct SubscriberEntry {
    buffer: Arc<RowBuffer>,
    subscriptions: Vec<(String, SubscriptionId)>,
}

/// Outcome of [`EventFactory::start`].
#[derive(Debug, Default)]
pub struct StartReport {
    /// Publishers now running on their own thread.
    pub started: Vec<String>,
    /// Publishers with no subscriptions, left alone.
    pub skipped: Vec<String>,
    /// Publishers that failed to configure or spawn, with the reason.
    pub failed: Vec<(String, EventsError)>,
}

/// Outcome of [`EventFactory::end`].
#[derive(Debug, Default)]
pub struct EndReport {
    /// Publisher threads that exited.
    pub stopped: Vec<String>,
    /// Publisher threads still alive at the join deadline.
    pub leaked: Vec<String>,
    /// Join timeout that applied.
    pub timeout: Duration,
}

impl EndReport {
    /// Convert leaked threads into an error.
    ///
    /// # Errors
    ///
    /// Returns [`EventsError::ThreadJoinTimeout`] naming the first leaked
    /// publisher.
    pub fn into_result(self) -> EventsResult<()> {
        match self.leaked.into_iter().next() {
            Some(publisher) => Err(EventsError::ThreadJoinTimeout {
                publisher,
                timeout: self.timeout,
            }),
            None => Ok(()),
        }
    }
}

enum StartOutcome {
    Started,
    Skipped,
}

/// Process-wide event registry.
///
/// Lifecycle: `new → register* → start → end → tear_down`. The factory is an
/// owned value; share it behind an `Arc` where several components need it.
pub struct EventFactory {
    publishers: RwLock<BTreeMap<String, PublisherEntry>>,
    subscribers: RwLock<BTreeMap<String, SubscriberEntry>>,
    join_timeout: Duration,
    max_buffered_rows: Option<usize>,
    selection: Option<EventsSection>,
    started: AtomicBool,
}

impl fmt::Debug for EventFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFactory")
            .field("publishers", &read(&self.publishers).keys().collect::<Vec<_>>())
            .field("subscribers", &read(&self.subscribers).keys().collect::<Vec<_>>())
            .field("join_timeout", &self.join_timeout)
            .field("started", &self.started.load(Ordering::Acquire))
            .finish()
    }
}

impl Default for EventFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EventFactory {
    /// An empty factory with the default join timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            publishers: RwLock::new(BTreeMap::new()),
            subscribers: RwLock::new(BTreeMap::new()),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            max_buffered_rows: None,
            selection: None,
            started: AtomicBool::new(false),
        }
    }

    /// A factory honoring the `[events]` config section.
    #[must_use]
    pub fn from_config(section: &EventsSection) -> Self {
        let mut factory = Self::new();
        factory.join_timeout = section.join_timeout();
        factory.max_buffered_rows =
            (section.max_buffered_rows > 0).then_some(section.max_buffered_rows);
        factory.selection = Some(section.clone());
        factory
    }

    /// Override the join timeout.
    #[must_use]
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Bound every subscriber's row buffer.
    #[must_use]
    pub fn with_max_buffered_rows(mut self, rows: usize) -> Self {
        self.max_buffered_rows = Some(rows);
        self
    }

    /// The configured join timeout.
    #[must_use]
    pub fn join_timeout(&self) -> Duration {
        self.join_timeout
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a publisher.
    ///
    /// Returns `Ok(None)` when the configuration disables this publisher.
    ///
    /// # Errors
    ///
    /// [`EventsError::RegistryFrozen`] after [`start`](Self::start), or
    /// [`EventsError::DuplicateRegistration`] if the name is taken.
    pub fn register_publisher<P: EventPublisher>(
        &self,
        publisher: P,
    ) -> EventsResult<Option<PublisherHandle<P>>> {
        let name = publisher.type_name();
        if self.selection.as_ref().is_some_and(|s| !s.publisher_enabled(name)) {
            info!(publisher = %name, "publisher disabled by configuration");
            return Ok(None);
        }
        if self.started.load(Ordering::Acquire) {
            return Err(EventsError::RegistryFrozen(name.to_owned()));
        }

        let mut publishers = write(&self.publishers);
        if publishers.contains_key(name) {
            return Err(EventsError::DuplicateRegistration {
                kind: "publisher",
                name: name.to_owned(),
            });
        }

        let runtime = Arc::new(PublisherRuntime::new(publisher));
        publishers.insert(
            name.to_owned(),
            PublisherEntry {
                lifecycle: Arc::clone(&runtime) as Arc<dyn PublisherLifecycle>,
                typed: Arc::clone(&runtime) as Arc<dyn Any + Send + Sync>,
                thread: Mutex::new(None),
            },
        );
        debug!(publisher = %name, "publisher registered");
        Ok(Some(runtime))
    }

    /// Register a subscriber and run its `init`.
    ///
    /// Returns `Ok(false)` when the configuration disables this subscriber.
    /// After [`start`](Self::start), publishers it subscribed to are started
    /// or reconfigured.
    ///
    /// # Errors
    ///
    /// [`EventsError::DuplicateRegistration`] if the name is taken, or the
    /// error returned by `init` (its staged subscriptions are discarded).
    pub fn register_subscriber(&self, subscriber: Arc<dyn EventSubscriber>) -> EventsResult<bool> {
        let name = subscriber.name().to_owned();
        if self.selection.as_ref().is_some_and(|s| !s.subscriber_enabled(&name)) {
            info!(subscriber = %name, "subscriber disabled by configuration");
            return Ok(false);
        }
        if read(&self.subscribers).contains_key(&name) {
            return Err(EventsError::DuplicateRegistration {
                kind: "subscriber",
                name,
            });
        }

        let buffer = Arc::new(match self.max_buffered_rows {
            Some(cap) => RowBuffer::with_capacity(cap),
            None => RowBuffer::new(),
        });

        let subscriptions = {
            let publishers = read(&self.publishers);
            let mut ctx = SubscriberContext::new(&name, &buffer, &publishers);
            if let Err(e) = subscriber.init(&mut ctx) {
                for (publisher, _) in ctx.into_subscriptions() {
                    if let Some(entry) = publishers.get(&publisher) {
                        entry.lifecycle.remove_subscriber(&name);
                    }
                }
                warn!(subscriber = %name, error = %e, "subscriber init failed");
                return Err(e);
            }
            ctx.into_subscriptions()
        };

        let mut touched: Vec<String> = subscriptions.iter().map(|(p, _)| p.clone()).collect();
        touched.sort();
        touched.dedup();

        {
            let mut subscribers = write(&self.subscribers);
            if subscribers.contains_key(&name) {
                drop(subscribers);
                self.discard_subscriptions(&name, &touched);
                return Err(EventsError::DuplicateRegistration {
                    kind: "subscriber",
                    name,
                });
            }
            subscribers.insert(name.clone(), SubscriberEntry {
                buffer,
                subscriptions,
            });
        }
        info!(subscriber = %name, publishers = ?touched, "subscriber registered");

        if self.started.load(Ordering::Acquire) {
            for publisher in &touched {
                if let Err(e) = self.ensure_running(publisher) {
                    warn!(publisher = %publisher, error = %e, "could not start publisher for late subscriber");
                }
            }
        }
        Ok(true)
    }

    fn discard_subscriptions(&self, subscriber: &str, publishers: &[String]) {
        let registry = read(&self.publishers);
        for publisher in publishers {
            if let Some(entry) = registry.get(publisher) {
                entry.lifecycle.remove_subscriber(subscriber);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Typed handle to a registered publisher.
    ///
    /// # Errors
    ///
    /// [`EventsError::UnknownPublisher`] or
    /// [`EventsError::PublisherTypeMismatch`].
    pub fn publisher<P: EventPublisher>(&self, name: &str) -> EventsResult<PublisherHandle<P>> {
        read(&self.publishers)
            .get(name)
            .ok_or_else(|| EventsError::UnknownPublisher(name.to_owned()))?
            .typed(name)
    }

    /// Lifecycle state of a publisher.
    ///
    /// # Errors
    ///
    /// [`EventsError::UnknownPublisher`].
    pub fn publisher_state(&self, name: &str) -> EventsResult<PublisherState> {
        Ok(self.lifecycle(name)?.state())
    }

    /// Whether a publisher currently owns a live thread.
    #[must_use]
    pub fn has_thread(&self, name: &str) -> bool {
        read(&self.publishers)
            .get(name)
            .is_some_and(PublisherEntry::thread_alive)
    }

    /// Registered publisher names.
    #[must_use]
    pub fn publisher_names(&self) -> Vec<String> {
        read(&self.publishers).keys().cloned().collect()
    }

    /// Registered subscriber names.
    #[must_use]
    pub fn subscriber_names(&self) -> Vec<String> {
        read(&self.subscribers).keys().cloned().collect()
    }

    fn lifecycle(&self, name: &str) -> EventsResult<Arc<dyn PublisherLifecycle>> {
        read(&self.publishers)
            .get(name)
            .map(|e| Arc::clone(&e.lifecycle))
            .ok_or_else(|| EventsError::UnknownPublisher(name.to_owned()))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Configure and start every publisher that has subscriptions.
    pub fn start(&self) -> StartReport {
        self.started.store(true, Ordering::Release);
        let names = self.publisher_names();
        self.start_names(&names)
    }

    /// Start only the named publishers.
    ///
    /// # Errors
    ///
    /// [`EventsError::UnknownPublisher`] if any name is not registered; no
    /// publisher is started in that case.
    pub fn start_only(&self, names: &[&str]) -> EventsResult<StartReport> {
        {
            let publishers = read(&self.publishers);
            if let Some(missing) = names.iter().find(|n| !publishers.contains_key(**n)) {
                return Err(EventsError::UnknownPublisher((*missing).to_owned()));
            }
        }
        self.started.store(true, Ordering::Release);
        let names: Vec<String> = names.iter().map(|n| (*n).to_owned()).collect();
        Ok(self.start_names(&names))
    }

    fn start_names(&self, names: &[String]) -> StartReport {
        let mut report = StartReport::default();
        for name in names {
            match self.start_one(name) {
                Ok(StartOutcome::Started) => report.started.push(name.clone()),
                Ok(StartOutcome::Skipped) => report.skipped.push(name.clone()),
                Err(e) => {
                    error!(publisher = %name, error = %e, "publisher failed to start");
                    report.failed.push((name.clone(), e));
                },
            }
        }
        info!(
            started = report.started.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "event factory started"
        );
        report
    }

    /// Make sure `name` is configured and running, applying staged changes.
    ///
    /// A publisher with no subscriptions is left alone.
    ///
    /// # Errors
    ///
    /// [`EventsError::UnknownPublisher`], a configure error, or
    /// [`EventsError::ThreadSpawn`].
    pub fn ensure_running(&self, name: &str) -> EventsResult<()> {
        self.start_one(name).map(|_| ())
    }

    fn start_one(&self, name: &str) -> EventsResult<StartOutcome> {
        let publishers = read(&self.publishers);
        let entry = publishers
            .get(name)
            .ok_or_else(|| EventsError::UnknownPublisher(name.to_owned()))?;
        let lifecycle = Arc::clone(&entry.lifecycle);

        if lifecycle.subscription_count() == 0 {
            debug!(publisher = %name, "publisher has no subscriptions, not starting");
            return Ok(StartOutcome::Skipped);
        }

        let mut thread = lock(&entry.thread);
        if let Some(handle) = thread.take() {
            let state = lifecycle.state();
            if !handle.is_finished()
                && matches!(state, PublisherState::Configured | PublisherState::Running)
            {
                *thread = Some(handle);
                if lifecycle.has_pending_changes() {
                    lifecycle.configure()?;
                }
                return Ok(StartOutcome::Started);
            }
            // A previous run is exiting or exited; reap it before starting over.
            if !join_until(handle, Instant::now().checked_add(self.join_timeout), name) {
                return Err(EventsError::AlreadyRunning(name.to_owned()));
            }
        }

        lifecycle.configure().map_err(|e| match e {
            e @ EventsError::Configuration { .. } => e,
            other => EventsError::Configuration {
                publisher: name.to_owned(),
                message: other.to_string(),
            },
        })?;

        let runner = Arc::clone(&lifecycle);
        let handle = std::thread::Builder::new()
            .name(format!("osmon-{name}"))
            .spawn(move || {
                if let Err(e) = runner.run() {
                    error!(publisher = %runner.name(), error = %e, "publisher run failed");
                }
            })
            .map_err(|source| EventsError::ThreadSpawn {
                publisher: name.to_owned(),
                source,
            })?;
        *thread = Some(handle);
        info!(publisher = %name, "publisher thread started");
        Ok(StartOutcome::Started)
    }

    /// Fire an event context into a publisher from the calling thread.
    ///
    /// # Errors
    ///
    /// [`EventsError::UnknownPublisher`] or
    /// [`EventsError::PublisherTypeMismatch`].
    pub fn fire<P: EventPublisher>(&self, name: &str, ec: P::EventContext) -> EventsResult<FireSummary> {
        Ok(self.publisher::<P>(name)?.fire(Arc::new(ec)))
    }

    /// Stop every publisher and optionally join their threads.
    ///
    /// Threads still alive after the join timeout are reported as leaked and
    /// kept, so a later `end` can try again.
    pub fn end(&self, join: bool) -> EndReport {
        let mut report = EndReport {
            timeout: self.join_timeout,
            ..EndReport::default()
        };
        let publishers = read(&self.publishers);
        for entry in publishers.values() {
            entry.lifecycle.stop();
        }
        if !join {
            return report;
        }

        let deadline = Instant::now().checked_add(self.join_timeout);
        for (name, entry) in publishers.iter() {
            let mut thread = lock(&entry.thread);
            let Some(handle) = thread.take() else {
                continue;
            };
            if join_until_ref(&handle, deadline) {
                if handle.join().is_err() {
                    error!(publisher = %name, "publisher thread panicked");
                }
                report.stopped.push(name.clone());
            } else {
                let e = EventsError::ThreadJoinTimeout {
                    publisher: name.clone(),
                    timeout: self.join_timeout,
                };
                error!(publisher = %name, error = %e, "publisher thread leaked");
                report.leaked.push(name.clone());
                *thread = Some(handle);
            }
        }
        info!(
            stopped = report.stopped.len(),
            leaked = report.leaked.len(),
            "event factory ended"
        );
        report
    }

    /// End with join, tear down every publisher and clear the registry.
    pub fn tear_down(&self) -> EndReport {
        let report = self.end(true);
        {
            let mut publishers = write(&self.publishers);
            for entry in publishers.values() {
                entry.lifecycle.tear_down();
            }
            publishers.clear();
        }
        write(&self.subscribers).clear();
        self.started.store(false, Ordering::Release);
        info!("event factory torn down");
        report
    }

    // -----------------------------------------------------------------------
    // Rows
    // -----------------------------------------------------------------------

    /// Take and clear a subscriber's buffered rows.
    ///
    /// # Errors
    ///
    /// [`EventsError::UnknownSubscriber`].
    pub fn drain_rows(&self, subscriber: &str) -> EventsResult<Vec<Row>> {
        self.take_rows(subscriber, DrainPolicy::Drain)
    }

    /// Copy a subscriber's buffered rows, leaving them in place.
    ///
    /// # Errors
    ///
    /// [`EventsError::UnknownSubscriber`].
    pub fn rows(&self, subscriber: &str) -> EventsResult<Vec<Row>> {
        self.take_rows(subscriber, DrainPolicy::Retain)
    }

    fn take_rows(&self, subscriber: &str, policy: DrainPolicy) -> EventsResult<Vec<Row>> {
        read(&self.subscribers)
            .get(subscriber)
            .map(|e| e.buffer.take(policy))
            .ok_or_else(|| EventsError::UnknownSubscriber(subscriber.to_owned()))
    }

    /// Rows evicted from a bounded subscriber buffer.
    ///
    /// # Errors
    ///
    /// [`EventsError::UnknownSubscriber`].
    pub fn dropped_rows(&self, subscriber: &str) -> EventsResult<u64> {
        read(&self.subscribers)
            .get(subscriber)
            .map(|e| e.buffer.dropped())
            .ok_or_else(|| EventsError::UnknownSubscriber(subscriber.to_owned()))
    }

    /// Unregister a subscriber and drop its subscriptions.
    ///
    /// Configured or running publishers it was subscribed to are
    /// reconfigured.
    ///
    /// # Errors
    ///
    /// [`EventsError::UnknownSubscriber`].
    pub fn remove_subscriber(&self, name: &str) -> EventsResult<()> {
        let entry = write(&self.subscribers)
            .remove(name)
            .ok_or_else(|| EventsError::UnknownSubscriber(name.to_owned()))?;

        let publishers = read(&self.publishers);
        let mut touched: Vec<&str> = entry.subscriptions.iter().map(|(p, _)| p.as_str()).collect();
        touched.sort_unstable();
        touched.dedup();
        for publisher in touched {
            let Some(p) = publishers.get(publisher) else {
                continue;
            };
            p.lifecycle.remove_subscriber(name);
            if matches!(
                p.lifecycle.state(),
                PublisherState::Configured | PublisherState::Running
            ) && let Err(e) = p.lifecycle.configure()
            {
                warn!(publisher = %publisher, error = %e, "reconfigure after removal failed");
            }
        }
        info!(subscriber = %name, "subscriber removed");
        Ok(())
    }
}

impl Drop for EventFactory {
    fn drop(&mut self) {
        let has_threads = read(&self.publishers).values().any(PublisherEntry::thread_alive);
        if has_threads {
            let report = self.end(true);
            if !report.leaked.is_empty() {
                error!(leaked = ?report.leaked, "event factory dropped with live publisher threads");
            }
        }
    }
}

/// Poll until `handle` finishes or `deadline` passes.
fn join_until_ref(handle: &JoinHandle<()>, deadline: Option<Instant>) -> bool {
    loop {
        if handle.is_finished() {
            return true;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return false;
        }
        std::thread::sleep(JOIN_POLL_INTERVAL);
    }
}

fn join_until(handle: JoinHandle<()>, deadline: Option<Instant>, name: &str) -> bool {
    if !join_until_ref(&handle, deadline) {
        return false;
    }
    if handle.join().is_err() {
        error!(publisher = %name, "publisher thread panicked");
    }
    true
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::context::EventContext;
    use crate::publisher::{PublisherContext, RunStatus};
    use crate::run_loop::LoopExit;
    use crate::subscriber::Subscription;

    #[derive(Debug)]
    struct Beat(u64);

    impl EventContext for Beat {
        fn transaction_id(&self) -> u64 {
            self.0
        }

        fn time(&self) -> DateTime<Utc> {
            DateTime::<Utc>::UNIX_EPOCH
        }
    }

    struct Heart(&'static str);

    impl EventPublisher for Heart {
        type SubscriptionContext = ();
        type EventContext = Beat;
        type Notification = ();

        fn type_name(&self) -> &'static str {
            self.0
        }

        fn configure(&self, _: &mut [Subscription<Self>]) -> EventsResult<()> {
            Ok(())
        }

        fn run(&self, ctx: &PublisherContext<'_, Self>) -> EventsResult<RunStatus> {
            Ok(match ctx.run_loop().run(|()| {}) {
                LoopExit::Cancelled => RunStatus::Cancelled,
                LoopExit::Busy | LoopExit::Stopped => RunStatus::Completed,
            })
        }

        fn stop(&self) {}

        fn should_fire(&self, _: &(), _: &Beat) -> bool {
            true
        }

        fn is_active(&self) -> bool {
            false
        }
    }

    struct Listener {
        name: &'static str,
        publisher: &'static str,
    }

    impl EventSubscriber for Listener {
        fn name(&self) -> &str {
            self.name
        }

        fn init(&self, ctx: &mut SubscriberContext<'_>) -> EventsResult<()> {
            ctx.subscribe::<Heart, _>(self.publisher, (), |b: &Beat, _: &()| {
                Ok(vec![Row::new().with("beat", b.0)])
            })?;
            Ok(())
        }
    }

    fn listener(name: &'static str, publisher: &'static str) -> Arc<dyn EventSubscriber> {
        Arc::new(Listener { name, publisher })
    }

    #[test]
    fn test_duplicate_registrations_rejected() {
        let factory = EventFactory::new();
        factory.register_publisher(Heart("heart")).unwrap();
        assert!(matches!(
            factory.register_publisher(Heart("heart")),
            Err(EventsError::DuplicateRegistration { kind: "publisher", .. })
        ));

        factory.register_subscriber(listener("pulse", "heart")).unwrap();
        assert!(matches!(
            factory.register_subscriber(listener("pulse", "heart")),
            Err(EventsError::DuplicateRegistration { kind: "subscriber", .. })
        ));
    }

    #[test]
    fn test_register_after_start_is_frozen() {
        let factory = EventFactory::new();
        let report = factory.start();
        assert!(report.started.is_empty());
        assert!(matches!(
            factory.register_publisher(Heart("heart")),
            Err(EventsError::RegistryFrozen(_))
        ));
    }

    #[test]
    fn test_unknown_publisher_fails_init_and_leaves_no_subscriber() {
        let factory = EventFactory::new();
        assert!(matches!(
            factory.register_subscriber(listener("pulse", "missing")),
            Err(EventsError::UnknownPublisher(_))
        ));
        assert!(factory.subscriber_names().is_empty());
    }

    #[test]
    fn test_typed_lookup_and_mismatch() {
        struct Other;
        impl EventPublisher for Other {
            type SubscriptionContext = ();
            type EventContext = Beat;
            type Notification = ();
            fn type_name(&self) -> &'static str {
                "other"
            }
            fn configure(&self, _: &mut [Subscription<Self>]) -> EventsResult<()> {
                Ok(())
            }
            fn run(&self, _: &PublisherContext<'_, Self>) -> EventsResult<RunStatus> {
                Ok(RunStatus::Idle)
            }
            fn stop(&self) {}
            fn should_fire(&self, _: &(), _: &Beat) -> bool {
                false
            }
            fn is_active(&self) -> bool {
                false
            }
        }

        let factory = EventFactory::new();
        factory.register_publisher(Heart("heart")).unwrap();
        assert!(factory.publisher::<Heart>("heart").is_ok());
        assert!(matches!(
            factory.publisher::<Other>("heart"),
            Err(EventsError::PublisherTypeMismatch { .. })
        ));
        assert!(matches!(
            factory.publisher::<Heart>("lungs"),
            Err(EventsError::UnknownPublisher(_))
        ));
    }

    #[test]
    fn test_from_config_skips_disabled_names() {
        let section = EventsSection {
            disabled_publishers: vec!["lungs".to_owned()],
            disabled_subscribers: vec!["breath".to_owned()],
            join_timeout_ms: 250,
            ..EventsSection::default()
        };
        let factory = EventFactory::from_config(&section);
        assert_eq!(factory.join_timeout(), Duration::from_millis(250));

        assert!(factory.register_publisher(Heart("lungs")).unwrap().is_none());
        assert!(factory.register_publisher(Heart("heart")).unwrap().is_some());
        assert!(!factory.register_subscriber(listener("breath", "heart")).unwrap());
        assert!(factory.register_subscriber(listener("pulse", "heart")).unwrap());
        assert_eq!(factory.publisher_names(), vec!["heart"]);
        assert_eq!(factory.subscriber_names(), vec!["pulse"]);
    }

    #[test]
    fn test_start_skips_unsubscribed_and_end_joins() {
        let factory = EventFactory::new();
        factory.register_publisher(Heart("heart")).unwrap();
        factory.register_publisher(Heart("idle")).unwrap();
        factory.register_subscriber(listener("pulse", "heart")).unwrap();

        let report = factory.start();
        assert_eq!(report.started, vec!["heart"]);
        assert_eq!(report.skipped, vec!["idle"]);
        assert!(factory.has_thread("heart"));
        assert!(!factory.has_thread("idle"));

        let summary = factory.fire::<Heart>("heart", Beat(4)).unwrap();
        assert_eq!(summary.rows, 1);
        assert_eq!(factory.rows("pulse").unwrap().len(), 1);
        assert_eq!(factory.drain_rows("pulse").unwrap().len(), 1);
        assert!(factory.drain_rows("pulse").unwrap().is_empty());

        let end = factory.end(true);
        assert_eq!(end.stopped, vec!["heart"]);
        assert!(end.into_result().is_ok());
        assert!(!factory.has_thread("heart"));
    }

    #[test]
    fn test_start_only_rejects_unknown_names() {
        let factory = EventFactory::new();
        factory.register_publisher(Heart("heart")).unwrap();
        assert!(matches!(
            factory.start_only(&["heart", "lungs"]),
            Err(EventsError::UnknownPublisher(name)) if name == "lungs"
        ));
        assert!(!factory.has_thread("heart"));
    }

    #[test]
    fn test_end_report_into_result_names_leak() {
        let report = EndReport {
            stopped: Vec::new(),
            leaked: vec!["fsevents".to_owned()],
            timeout: Duration::from_millis(10),
        };
        assert!(matches!(
            report.into_result(),
            Err(EventsError::ThreadJoinTimeout { publisher, .. }) if publisher == "fsevents"
        ));
    }

    struct Stuck {
        entered: Arc<AtomicBool>,
        release: Arc<AtomicBool>,
    }

    impl EventPublisher for Stuck {
        type SubscriptionContext = ();
        type EventContext = Beat;
        type Notification = ();

        fn type_name(&self) -> &'static str {
            "stuck"
        }

        fn configure(&self, _: &mut [Subscription<Self>]) -> EventsResult<()> {
            Ok(())
        }

        fn run(&self, _: &PublisherContext<'_, Self>) -> EventsResult<RunStatus> {
            self.entered.store(true, Ordering::SeqCst);
            while !self.release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(2));
            }
            Ok(RunStatus::Completed)
        }

        fn stop(&self) {}

        fn should_fire(&self, _: &(), _: &Beat) -> bool {
            true
        }

        fn is_active(&self) -> bool {
            false
        }
    }

    struct StuckListener;

    impl EventSubscriber for StuckListener {
        fn name(&self) -> &str {
            "waiter"
        }

        fn init(&self, ctx: &mut SubscriberContext<'_>) -> EventsResult<()> {
            ctx.subscribe::<Stuck, _>("stuck", (), |_: &Beat, _: &()| Ok(Vec::new()))?;
            Ok(())
        }
    }

    #[test]
    #[allow(clippy::arithmetic_side_effects)]
    fn test_end_reports_thread_that_ignores_stop_as_leaked() {
        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let factory = EventFactory::new().with_join_timeout(Duration::from_millis(50));
        factory
            .register_publisher(Stuck {
                entered: Arc::clone(&entered),
                release: Arc::clone(&release),
            })
            .unwrap();
        factory.register_subscriber(Arc::new(StuckListener)).unwrap();
        assert_eq!(factory.start().started, vec!["stuck"]);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !entered.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(entered.load(Ordering::SeqCst));

        let report = factory.end(true);
        assert_eq!(report.leaked, vec!["stuck"]);
        assert!(report.stopped.is_empty());
        assert!(factory.has_thread("stuck"));
        assert!(matches!(
            report.into_result(),
            Err(EventsError::ThreadJoinTimeout { publisher, timeout })
                if publisher == "stuck" && timeout == Duration::from_millis(50)
        ));

        release.store(true, Ordering::SeqCst);
        let report = factory.end(true);
        assert_eq!(report.stopped, vec!["stuck"]);
        assert!(report.leaked.is_empty());
    }

    #[test]
    fn test_remove_subscriber_reconfigures_configured_publisher() {
        let factory = EventFactory::new();
        let heart = factory.register_publisher(Heart("heart")).unwrap().unwrap();
        factory.register_subscriber(listener("pulse", "heart")).unwrap();
        factory.register_subscriber(listener("echo", "heart")).unwrap();
        heart.configure().unwrap();
        assert_eq!(heart.state(), PublisherState::Configured);
        assert_eq!(heart.fire(Arc::new(Beat(1))).matched, 2);

        factory.remove_subscriber("pulse").unwrap();

        assert!(!heart.has_pending_changes());
        assert_eq!(heart.fire(Arc::new(Beat(2))).matched, 1);
    }

    #[test]
    fn test_remove_subscriber_and_unknown_rows() {
        let factory = EventFactory::new();
        factory.register_publisher(Heart("heart")).unwrap();
        factory.register_subscriber(listener("pulse", "heart")).unwrap();

        factory.remove_subscriber("pulse").unwrap();
        assert!(matches!(
            factory.drain_rows("pulse"),
            Err(EventsError::UnknownSubscriber(_))
        ));
        assert_eq!(factory.start().skipped, vec!["heart"]);
    }
}
