//! osmon Events - publish/subscribe runtime for OS event sources.
//!
//! This crate provides:
//! - The [`EventPublisher`] and [`EventSubscriber`] contracts
//! - [`EventFactory`], the registry that owns publishers, their threads and
//!   subscriber row buffers
//! - [`RunLoop`], the blocking wait primitive each publisher thread parks in
//! - The filesystem publisher ([`fsevents`]) and the `file_events` subscriber
//!
//! # Architecture
//!
//! A publisher owns one native event source. Once configured it runs on its
//! own named thread, blocked in its run loop. Native notifications are posted
//! into the loop, split into event contexts and fired at every subscription
//! whose predicate matches. Each match runs the subscriber's callback, whose
//! rows land in that subscriber's buffer until a table adapter drains them.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use osmon_config::{FileEventsSection, FilePathEntry};
//! use osmon_events::prelude::*;
//!
//! let factory = EventFactory::new();
//! factory.register_publisher(FsEventsPublisher::new()).unwrap();
//!
//! let section = FileEventsSection {
//!     paths: vec![FilePathEntry {
//!         category: "etc".into(),
//!         path: "/etc".into(),
//!         recursive: true,
//!         actions: Vec::new(),
//!     }],
//!     ..FileEventsSection::default()
//! };
//! factory
//!     .register_subscriber(Arc::new(FileEventsSubscriber::from_config(&section)))
//!     .unwrap();
//!
//! factory.start();
//! let rows = factory.drain_rows(FILE_EVENTS_TABLE).unwrap();
//! println!("{} new rows", rows.len());
//! factory.end(true);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod fsevents;
pub mod prelude;

mod context;
mod error;
mod factory;
mod file_events;
mod publisher;
mod run_loop;
mod runtime;
mod subscriber;
mod sync;

pub use context::{EventContext, Row};
pub use error::{EventsError, EventsResult};
pub use factory::{DEFAULT_JOIN_TIMEOUT, EndReport, EventFactory, StartReport};
pub use file_events::{FILE_EVENTS_TABLE, FileEventsSubscriber};
pub use publisher::{EventPublisher, FlushMode, PublisherContext, RunStatus};
pub use run_loop::{DEFAULT_FLUSH_TIMEOUT, LoopExit, LoopHandle, RunLoop};
pub use runtime::{
    FireSummary, PublisherHandle, PublisherLifecycle, PublisherRuntime, PublisherState,
};
pub use subscriber::{
    DrainPolicy, EventSubscriber, RowBuffer, SubscriberContext, Subscription,
    SubscriptionCallback, SubscriptionId,
};
