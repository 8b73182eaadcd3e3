//! Subscribers, subscriptions and row buffers.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};
use uuid::Uuid;

use crate::context::Row;
use crate::error::{EventsError, EventsResult};
use crate::factory::PublisherEntry;
use crate::publisher::EventPublisher;
use crate::runtime::PublisherRuntime;
use crate::sync::lock;

/// Identifies one subscription across its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Row materialization callback for publisher `P`.
pub type SubscriptionCallback<P> = Arc<
    dyn Fn(
            &<P as EventPublisher>::EventContext,
            &<P as EventPublisher>::SubscriptionContext,
        ) -> EventsResult<Vec<Row>>
        + Send
        + Sync,
>;

/// How [`RowBuffer::take`] treats buffered rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPolicy {
    /// Return the rows and clear the buffer.
    Drain,
    /// Return a copy and leave the rows in place.
    Retain,
}

/// Rows produced for one subscriber, in arrival order.
#[derive(Debug, Default)]
pub struct RowBuffer {
    rows: Mutex<VecDeque<Row>>,
    capacity: Option<usize>,
    dropped: AtomicU64,
}

impl RowBuffer {
    /// An unbounded buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer that evicts the oldest rows beyond `capacity`.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rows: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: Some(capacity),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append rows, returning how many were appended.
    pub fn push_rows(&self, rows: Vec<Row>) -> usize {
        let appended = rows.len();
        let mut buf = lock(&self.rows);
        buf.extend(rows);
        if let Some(cap) = self.capacity {
            let excess = buf.len().saturating_sub(cap);
            if excess > 0 {
                buf.drain(..excess);
                self.dropped
                    .fetch_add(u64::try_from(excess).unwrap_or(u64::MAX), Ordering::Relaxed);
                trace!(evicted = excess, "row buffer full, evicted oldest rows");
            }
        }
        appended
    }

    /// Copy out the buffered rows according to `policy`.
    pub fn take(&self, policy: DrainPolicy) -> Vec<Row> {
        let mut buf = lock(&self.rows);
        match policy {
            DrainPolicy::Drain => buf.drain(..).collect(),
            DrainPolicy::Retain => buf.iter().cloned().collect(),
        }
    }

    /// Number of buffered rows.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.rows).is_empty()
    }

    /// Rows evicted because the buffer was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A live binding of one subscription context to a publisher.
pub struct Subscription<P: EventPublisher> {
    id: SubscriptionId,
    subscriber: String,
    context: P::SubscriptionContext,
    callback: SubscriptionCallback<P>,
    buffer: Arc<RowBuffer>,
}

impl<P: EventPublisher> fmt::Debug for Subscription<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("subscriber", &self.subscriber)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl<P: EventPublisher> Subscription<P> {
    /// Bind `context` and `callback` for `subscriber`, writing into `buffer`.
    pub fn new<F>(
        subscriber: impl Into<String>,
        context: P::SubscriptionContext,
        callback: F,
        buffer: Arc<RowBuffer>,
    ) -> Self
    where
        F: Fn(&P::EventContext, &P::SubscriptionContext) -> EventsResult<Vec<Row>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            id: SubscriptionId::new(),
            subscriber: subscriber.into(),
            context,
            callback: Arc::new(callback),
            buffer,
        }
    }

    /// Subscription id.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Owning subscriber name.
    #[must_use]
    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }

    /// The matching predicate.
    #[must_use]
    pub fn context(&self) -> &P::SubscriptionContext {
        &self.context
    }

    /// Mutable access for link resolution during configure.
    pub fn context_mut(&mut self) -> &mut P::SubscriptionContext {
        &mut self.context
    }

    /// Run the callback and append its rows. Errors and panics are returned
    /// as [`EventsError::SubscriberCallback`], leaving the buffer untouched.
    pub(crate) fn deliver(&self, ec: &P::EventContext) -> EventsResult<usize> {
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.callback)(ec, &self.context)));
        match outcome {
            Ok(Ok(rows)) => Ok(self.buffer.push_rows(rows)),
            Ok(Err(e)) => Err(EventsError::SubscriberCallback {
                subscriber: self.subscriber.clone(),
                message: e.to_string(),
            }),
            Err(panic) => Err(EventsError::SubscriberCallback {
                subscriber: self.subscriber.clone(),
                message: panic_message(panic.as_ref()),
            }),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_owned()
    }
}

/// A consumer of filtered events that produces rows for one table.
pub trait EventSubscriber: Send + Sync {
    /// Unique subscriber (table) name.
    fn name(&self) -> &str;

    /// Register subscriptions. Called once, at registration.
    ///
    /// # Errors
    ///
    /// Returns an error if a subscription cannot be created; the factory then
    /// discards every subscription this subscriber staged.
    fn init(&self, ctx: &mut SubscriberContext<'_>) -> EventsResult<()>;
}

/// Registration-time view of the factory handed to [`EventSubscriber::init`].
pub struct SubscriberContext<'a> {
    subscriber: &'a str,
    buffer: &'a Arc<RowBuffer>,
    publishers: &'a BTreeMap<String, PublisherEntry>,
    subscriptions: Vec<(String, SubscriptionId)>,
}

impl fmt::Debug for SubscriberContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberContext")
            .field("subscriber", &self.subscriber)
            .field("subscriptions", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

impl<'a> SubscriberContext<'a> {
    pub(crate) fn new(
        subscriber: &'a str,
        buffer: &'a Arc<RowBuffer>,
        publishers: &'a BTreeMap<String, PublisherEntry>,
    ) -> Self {
        Self {
            subscriber,
            buffer,
            publishers,
            subscriptions: Vec::new(),
        }
    }

    /// Name of the subscriber being initialized.
    #[must_use]
    pub fn subscriber(&self) -> &str {
        self.subscriber
    }

    /// Stage a subscription on the publisher registered as `publisher`.
    ///
    /// The subscription goes live at the publisher's next configure.
    ///
    /// # Errors
    ///
    /// Returns [`EventsError::UnknownPublisher`] or
    /// [`EventsError::PublisherTypeMismatch`].
    pub fn subscribe<P, F>(
        &mut self,
        publisher: &str,
        context: P::SubscriptionContext,
        callback: F,
    ) -> EventsResult<SubscriptionId>
    where
        P: EventPublisher,
        F: Fn(&P::EventContext, &P::SubscriptionContext) -> EventsResult<Vec<Row>>
            + Send
            + Sync
            + 'static,
    {
        let entry = self
            .publishers
            .get(publisher)
            .ok_or_else(|| EventsError::UnknownPublisher(publisher.to_owned()))?;
        let runtime: Arc<PublisherRuntime<P>> = entry.typed(publisher)?;

        let subscription =
            Subscription::new(self.subscriber, context, callback, Arc::clone(self.buffer));
        let id = subscription.id();
        runtime.stage_subscription(subscription);
        self.subscriptions.push((publisher.to_owned(), id));

        debug!(
            subscriber = %self.subscriber,
            publisher = %publisher,
            subscription = %id,
            "subscription staged"
        );
        Ok(id)
    }

    pub(crate) fn into_subscriptions(self) -> Vec<(String, SubscriptionId)> {
        self.subscriptions
    }
}
