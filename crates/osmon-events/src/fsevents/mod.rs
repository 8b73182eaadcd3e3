//! Filesystem event publisher.
//!
//! [`FsEventsPublisher`] watches a set of paths through a [`WatchBackend`],
//! splits each native notification into one [`FsEventContext`] per action
//! and fires them at matching [`FsSubscriptionContext`]s.

mod backend;
mod context;
mod flags;
mod policy;
mod publisher;

pub use backend::{ManualBackend, NotificationSink, NotifyBackend, WatchBackend, WatchStream};
pub use context::{
    FsEventContext, FsSubscriptionContext, NativeBatch, RawNotification, expand_notification,
};
pub use flags::{ACTION_TABLE, FsAction, FsEventFlags, UnknownAction, actions_for};
pub use policy::{ConfiguredPolicy, DefaultFlagPolicy, FlagPolicy, IgnoreFlags, WatchAdjustment};
pub use publisher::{DEFAULT_MAX_LINK_DEPTH, FSEVENTS_PUBLISHER, FsEventsPublisher};
