//! Shared harness for the osmon-events integration tests.

use std::sync::Arc;

use osmon_events::fsevents::{FSEVENTS_PUBLISHER, FsEventsPublisher, ManualBackend, NativeBatch};
use osmon_events::{EventFactory, EventSubscriber, FlushMode, PublisherHandle};
use osmon_test::{DEFAULT_WAIT, setup_test_logging_default, wait_until};

/// A factory with an fsevents publisher on a manual backend.
#[allow(dead_code)]
pub struct FsHarness {
    /// The factory under test.
    pub factory: EventFactory,
    /// Test-side clone of the publisher's backend.
    pub backend: ManualBackend,
}

#[allow(dead_code)]
impl FsHarness {
    /// Build a harness around `publisher_for(backend)`.
    pub fn with(publisher_for: impl FnOnce(ManualBackend) -> FsEventsPublisher) -> Self {
        setup_test_logging_default();
        let backend = ManualBackend::new();
        let factory = EventFactory::new();
        factory
            .register_publisher(publisher_for(backend.clone()))
            .unwrap();
        Self { factory, backend }
    }

    /// Build a harness with the default flag policy.
    pub fn new() -> Self {
        Self::with(FsEventsPublisher::with_backend)
    }

    /// Register a subscriber.
    pub fn subscribe(&self, subscriber: impl EventSubscriber + 'static) {
        assert!(self.factory.register_subscriber(Arc::new(subscriber)).unwrap());
    }

    /// Typed handle to the fsevents runtime.
    pub fn fsevents(&self) -> PublisherHandle<FsEventsPublisher> {
        self.factory
            .publisher::<FsEventsPublisher>(FSEVENTS_PUBLISHER)
            .unwrap()
    }

    /// Start the factory and wait until the fsevents stream is live.
    pub fn start(&self) {
        let report = self.factory.start();
        assert!(report.failed.is_empty(), "start failed: {:?}", report.failed);
        let fsevents = self.fsevents();
        assert!(
            wait_until(DEFAULT_WAIT, || fsevents.is_active()),
            "fsevents never became active"
        );
    }

    /// Start the factory without waiting for any publisher.
    pub fn start_idle(&self) {
        let report = self.factory.start();
        assert!(report.failed.is_empty(), "start failed: {:?}", report.failed);
    }

    /// Emit a batch and wait until it has been delivered.
    pub fn deliver(&self, batch: NativeBatch) {
        assert!(self.backend.emit(batch), "no stream to emit into");
        self.fsevents().flush(FlushMode::Sync);
    }
}
