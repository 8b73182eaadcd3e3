//! Mock publishers and subscribers for testing.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use osmon_events::fsevents::{
    FSEVENTS_PUBLISHER, FsEventContext, FsEventFlags, FsEventsPublisher, FsSubscriptionContext,
};
use osmon_events::{
    EventContext, EventPublisher, EventSubscriber, EventsError, EventsResult, LoopExit, LoopHandle,
    PublisherContext, Row, RunStatus, SubscriberContext, Subscription,
};

// ---------------------------------------------------------------------------
// TickPublisher
// ---------------------------------------------------------------------------

/// Registry name of [`TickPublisher`].
pub const TICK_PUBLISHER: &str = "tick";

/// Event fired by [`TickPublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tick {
    /// Transaction id.
    pub id: u64,
    /// Topic matched against subscription contexts.
    pub topic: String,
    /// Creation time.
    pub time: DateTime<Utc>,
}

impl Tick {
    /// Create a tick stamped now.
    #[must_use]
    pub fn new(id: u64, topic: &str) -> Self {
        Self {
            id,
            topic: topic.to_owned(),
            time: Utc::now(),
        }
    }
}

impl EventContext for Tick {
    fn transaction_id(&self) -> u64 {
        self.id
    }

    fn time(&self) -> DateTime<Utc> {
        self.time
    }
}

/// A publisher whose notifications are [`Tick`]s posted into its run loop.
///
/// Subscription contexts are topics; `"*"` matches every tick.
#[derive(Debug, Default)]
pub struct TickPublisher {
    fail_configure: AtomicBool,
    configures: AtomicUsize,
    stops: AtomicUsize,
    handle: Mutex<Option<LoopHandle<Tick>>>,
}

impl TickPublisher {
    /// A publisher that configures successfully.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A publisher whose configure fails until told otherwise.
    #[must_use]
    pub fn failing() -> Self {
        let publisher = Self::new();
        publisher.set_fail_configure(true);
        publisher
    }

    /// Toggle configure failures.
    pub fn set_fail_configure(&self, fail: bool) {
        self.fail_configure.store(fail, Ordering::SeqCst);
    }

    /// Number of configure calls so far.
    #[must_use]
    pub fn configure_count(&self) -> usize {
        self.configures.load(Ordering::SeqCst)
    }

    /// Number of stop calls so far.
    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Post a tick into the run loop once a run thread has captured it.
    ///
    /// Returns `false` before the first run.
    pub fn post(&self, tick: Tick) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| h.post(tick))
    }
}

impl EventPublisher for TickPublisher {
    type SubscriptionContext = String;
    type EventContext = Tick;
    type Notification = Tick;

    fn type_name(&self) -> &'static str {
        TICK_PUBLISHER
    }

    fn configure(&self, _subscriptions: &mut [Subscription<Self>]) -> EventsResult<()> {
        self.configures.fetch_add(1, Ordering::SeqCst);
        if self.fail_configure.load(Ordering::SeqCst) {
            return Err(EventsError::Configuration {
                publisher: TICK_PUBLISHER.to_owned(),
                message: "configure refused".to_owned(),
            });
        }
        Ok(())
    }

    fn run(&self, ctx: &PublisherContext<'_, Self>) -> EventsResult<RunStatus> {
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(ctx.handle());
        match ctx.run_loop().run(|tick| {
            ctx.fire(tick);
        }) {
            LoopExit::Cancelled => Ok(RunStatus::Cancelled),
            LoopExit::Stopped => Ok(RunStatus::Completed),
            LoopExit::Busy => Err(EventsError::AlreadyRunning(TICK_PUBLISHER.to_owned())),
        }
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            handle.stop();
        }
    }

    fn tear_down(&self) {
        self.stop();
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn should_fire(&self, sc: &String, ec: &Tick) -> bool {
        sc == "*" || *sc == ec.topic
    }

    fn is_active(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(LoopHandle::is_waiting)
    }
}

/// Subscribes to [`TickPublisher`] topics and records `id`/`topic` rows.
#[derive(Debug, Clone)]
pub struct TickSubscriber {
    name: String,
    topics: Vec<String>,
}

impl TickSubscriber {
    /// Create a subscriber for `topics`.
    #[must_use]
    pub fn new(name: &str, topics: &[&str]) -> Self {
        Self {
            name: name.to_owned(),
            topics: topics.iter().map(|t| (*t).to_owned()).collect(),
        }
    }
}

impl EventSubscriber for TickSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, ctx: &mut SubscriberContext<'_>) -> EventsResult<()> {
        for topic in &self.topics {
            ctx.subscribe::<TickPublisher, _>(TICK_PUBLISHER, topic.clone(), |tick, _| {
                Ok(vec![
                    Row::new()
                        .with("id", tick.id)
                        .with("topic", tick.topic.clone()),
                ])
            })?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Filesystem subscribers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Watch {
    path: PathBuf,
    recursive: bool,
    mask: FsEventFlags,
}

impl Watch {
    fn context(&self) -> FsSubscriptionContext {
        FsSubscriptionContext::new(&self.path)
            .recursive(self.recursive)
            .with_mask(self.mask)
    }
}

/// Records every filesystem event it is handed.
///
/// Rows carry `path`, `action`, `transaction_id` and `link`.
#[derive(Debug, Clone)]
pub struct RecordingSubscriber {
    name: String,
    watches: Vec<Watch>,
    calls: Arc<AtomicUsize>,
}

impl RecordingSubscriber {
    /// A subscriber with no watches yet.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            watches: Vec::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Watch `path` with any flags.
    #[must_use]
    pub fn watch(self, path: impl Into<PathBuf>, recursive: bool) -> Self {
        self.watch_masked(path, recursive, FsEventFlags::empty())
    }

    /// Watch `path`, requiring one of `mask`'s bits.
    #[must_use]
    pub fn watch_masked(
        mut self,
        path: impl Into<PathBuf>,
        recursive: bool,
        mask: FsEventFlags,
    ) -> Self {
        self.watches.push(Watch {
            path: path.into(),
            recursive,
            mask,
        });
        self
    }

    /// Callback invocations so far, shared across clones.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EventSubscriber for RecordingSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, ctx: &mut SubscriberContext<'_>) -> EventsResult<()> {
        for watch in &self.watches {
            let calls = Arc::clone(&self.calls);
            ctx.subscribe::<FsEventsPublisher, _>(
                FSEVENTS_PUBLISHER,
                watch.context(),
                move |ec: &FsEventContext, sc: &FsSubscriptionContext| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![
                        Row::new()
                            .with("path", ec.path.display().to_string())
                            .with("action", ec.action.as_str())
                            .with("transaction_id", ec.transaction_id)
                            .with("link", sc.link().display().to_string()),
                    ])
                },
            )?;
        }
        Ok(())
    }
}

/// How a [`FailingSubscriber`] misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    /// Callback returns an error.
    Error,
    /// Callback panics.
    Panic,
    /// `init` stages a subscription, then fails.
    Init,
}

/// A filesystem subscriber that fails in a chosen way.
#[derive(Debug, Clone)]
pub struct FailingSubscriber {
    name: String,
    path: PathBuf,
    mode: FailMode,
}

impl FailingSubscriber {
    /// Create a subscriber watching `path` recursively.
    #[must_use]
    pub fn new(name: &str, path: impl Into<PathBuf>, mode: FailMode) -> Self {
        Self {
            name: name.to_owned(),
            path: path.into(),
            mode,
        }
    }
}

impl EventSubscriber for FailingSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, ctx: &mut SubscriberContext<'_>) -> EventsResult<()> {
        let mode = self.mode;
        let subscriber = self.name.clone();
        ctx.subscribe::<FsEventsPublisher, _>(
            FSEVENTS_PUBLISHER,
            FsSubscriptionContext::new(&self.path).recursive(true),
            move |_: &FsEventContext, _: &FsSubscriptionContext| match mode {
                FailMode::Panic => panic!("{subscriber} callback panicked"),
                FailMode::Error | FailMode::Init => Err(EventsError::SubscriberCallback {
                    subscriber: subscriber.clone(),
                    message: "callback refused".to_owned(),
                }),
            },
        )?;

        if mode == FailMode::Init {
            return Err(EventsError::Configuration {
                publisher: FSEVENTS_PUBLISHER.to_owned(),
                message: format!("{} init refused", self.name),
            });
        }
        Ok(())
    }
}
