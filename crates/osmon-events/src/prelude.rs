//! Prelude module - commonly used types for convenient import.
//!
//! Use `use osmon_events::prelude::*;` to import all essential types.

// Errors
pub use crate::{EventsError, EventsResult};

// Contracts
pub use crate::{EventContext, EventPublisher, EventSubscriber, Row};

// Registry
pub use crate::{EndReport, EventFactory, StartReport};

// Runtime
pub use crate::{FlushMode, PublisherContext, PublisherState, RunStatus, SubscriberContext};

// Filesystem
pub use crate::fsevents::{
    FsAction, FsEventContext, FsEventFlags, FsEventsPublisher, FsSubscriptionContext,
};
pub use crate::{FILE_EVENTS_TABLE, FileEventsSubscriber};
