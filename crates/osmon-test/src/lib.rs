//! osmon Test - Shared test utilities for the osmon event runtime.
//!
//! This crate provides fixtures, mock publishers and subscribers, and small
//! harness helpers used by the integration tests of the osmon crates.
//!
//! # Usage
//!
//! Add to your crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! osmon-test.workspace = true
//! ```
//!
//! Then use in your tests:
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use osmon_events::prelude::*;
//! use osmon_test::prelude::*;
//!
//! #[test]
//! fn test_ticks_reach_subscriber() {
//!     let factory = EventFactory::new();
//!     factory.register_publisher(TickPublisher::new()).unwrap();
//!     factory
//!         .register_subscriber(Arc::new(TickSubscriber::new("ticks", &["a"])))
//!         .unwrap();
//!     factory.start();
//!
//!     factory.fire::<TickPublisher>(TICK_PUBLISHER, Tick::new(1, "a")).unwrap();
//!     assert_eq!(factory.drain_rows("ticks").unwrap().len(), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

pub mod fixtures;
pub mod harness;
pub mod mocks;

pub use fixtures::*;
pub use harness::*;
pub use mocks::*;
