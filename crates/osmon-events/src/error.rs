//! Error types for the event runtime.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by publishers, subscribers and the factory.
#[derive(Debug, Error)]
pub enum EventsError {
    /// A publisher could not create its native resources.
    #[error("publisher {publisher} failed to configure: {message}")]
    Configuration {
        /// Publisher type name.
        publisher: String,
        /// What went wrong.
        message: String,
    },

    /// A publisher or subscriber name is already registered.
    #[error("{kind} already registered: {name}")]
    DuplicateRegistration {
        /// `"publisher"` or `"subscriber"`.
        kind: &'static str,
        /// The conflicting name.
        name: String,
    },

    /// A subscriber callback returned an error or panicked.
    #[error("subscriber {subscriber} callback failed: {message}")]
    SubscriberCallback {
        /// Subscriber name.
        subscriber: String,
        /// Error or panic message.
        message: String,
    },

    /// A publisher thread did not exit before the join deadline.
    #[error("publisher {publisher} thread still running after {timeout:?}")]
    ThreadJoinTimeout {
        /// Publisher type name.
        publisher: String,
        /// The join timeout that elapsed.
        timeout: Duration,
    },

    /// No publisher with this name is registered.
    #[error("unknown publisher: {0}")]
    UnknownPublisher(String),

    /// No subscriber with this name is registered.
    #[error("unknown subscriber: {0}")]
    UnknownSubscriber(String),

    /// The publisher exists but is not of the requested type.
    #[error("publisher {name} is not a {expected}")]
    PublisherTypeMismatch {
        /// Publisher type name.
        name: String,
        /// Requested Rust type.
        expected: &'static str,
    },

    /// Publishers cannot be registered once the factory has started.
    #[error("registry frozen, cannot register publisher {0}")]
    RegistryFrozen(String),

    /// `run` was called before `configure`.
    #[error("publisher {0} has not been configured")]
    NotConfigured(String),

    /// A run loop is already active for this publisher.
    #[error("publisher {0} is already running")]
    AlreadyRunning(String),

    /// The OS refused to spawn a publisher thread.
    #[error("failed to spawn thread for publisher {publisher}: {source}")]
    ThreadSpawn {
        /// Publisher type name.
        publisher: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Filesystem watcher error.
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for event runtime operations.
pub type EventsResult<T> = Result<T, EventsError>;
