//! osmon Telemetry - logging setup for the osmon event runtime.
//!
//! This crate provides:
//! - Configurable logging setup with multiple formats and targets
//! - Rolling file output via `tracing-appender`
//! - Conversion from `osmon-config`'s `[logging]` section (feature `config`)
//!
//! # Example
//!
//! ```rust,no_run
//! use osmon_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), osmon_telemetry::TelemetryError> {
//! let config = LogConfig::new("debug")
//!     .with_format(LogFormat::Compact)
//!     .with_directive("osmon_events=trace");
//!
//! setup_logging(&config)?;
//! tracing::info!("logging ready");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{
    FileRotation, LogConfig, LogFormat, LogTarget, setup_default_logging, setup_logging,
};
