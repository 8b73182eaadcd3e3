//! Configuration types for the osmon runtime.
//!
//! Every struct implements [`Default`] so that an empty file, or a bare
//! `[section]` header, produces a working configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Publisher/subscriber selection and factory lifecycle knobs.
    pub events: EventsSection,
    /// Filesystem publisher settings.
    pub fsevents: FsEventsSection,
    /// Watched paths for the `file_events` subscriber.
    pub file_events: FileEventsSection,
    /// Logging level, format, and per-crate directives.
    pub logging: LoggingSection,
}

// ---------------------------------------------------------------------------
// EventsSection
// ---------------------------------------------------------------------------

/// Which publishers and subscribers the factory enables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    /// Disable the whole event runtime.
    pub disable_events: bool,
    /// Publishers to enable. Empty means every registered publisher.
    pub enabled_publishers: Vec<String>,
    /// Publishers to skip at registration. Wins over `enabled_publishers`.
    pub disabled_publishers: Vec<String>,
    /// Subscribers to skip at registration.
    pub disabled_subscribers: Vec<String>,
    /// How long `end(join = true)` waits for publisher threads, in milliseconds.
    pub join_timeout_ms: u64,
    /// Per-subscriber row buffer bound. Zero means unbounded.
    pub max_buffered_rows: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            disable_events: false,
            enabled_publishers: Vec::new(),
            disabled_publishers: Vec::new(),
            disabled_subscribers: Vec::new(),
            join_timeout_ms: 3_000,
            max_buffered_rows: 0,
        }
    }
}

impl EventsSection {
    /// Whether a publisher type with this name should be registered.
    #[must_use]
    pub fn publisher_enabled(&self, name: &str) -> bool {
        if self.disable_events || self.disabled_publishers.iter().any(|p| p == name) {
            return false;
        }
        self.enabled_publishers.is_empty() || self.enabled_publishers.iter().any(|p| p == name)
    }

    /// Whether a subscriber with this name should be registered.
    #[must_use]
    pub fn subscriber_enabled(&self, name: &str) -> bool {
        !self.disable_events && !self.disabled_subscribers.iter().any(|s| s == name)
    }

    /// The join timeout as a [`Duration`].
    #[must_use]
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// FsEventsSection
// ---------------------------------------------------------------------------

/// What the filesystem publisher does when a watched root is replaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootChangedAction {
    /// Re-resolve links and rebuild the stream.
    #[default]
    Reconfigure,
    /// Log only.
    Ignore,
}

/// What the filesystem publisher does when a watched volume goes away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmountAction {
    /// Drop the target from the watch set until the next configure.
    #[default]
    Remove,
    /// Log only.
    Ignore,
}

/// Filesystem publisher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsEventsSection {
    /// Symlink hops followed when resolving a subscription target.
    pub max_symlink_depth: usize,
    /// Reaction to a root-changed notification.
    pub root_changed: RootChangedAction,
    /// Reaction to an unmount notification.
    pub unmount: UnmountAction,
}

impl Default for FsEventsSection {
    fn default() -> Self {
        Self {
            max_symlink_depth: 5,
            root_changed: RootChangedAction::default(),
            unmount: UnmountAction::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// FileEventsSection
// ---------------------------------------------------------------------------

/// Default upper bound for hashed file size (50 MiB).
pub const DEFAULT_MAX_HASH_BYTES: u64 = 52_428_800;

/// One watched path for the `file_events` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePathEntry {
    /// Label copied into every row produced for this path.
    pub category: String,
    /// Path or path prefix to watch.
    pub path: PathBuf,
    /// Literal-prefix matching when `true`, case-insensitive `path*` glob otherwise.
    #[serde(default)]
    pub recursive: bool,
    /// Action labels to keep (e.g. `"CREATED"`). Empty keeps every action.
    #[serde(default)]
    pub actions: Vec<String>,
}

/// `file_events` subscriber settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileEventsSection {
    /// Watched paths.
    pub paths: Vec<FilePathEntry>,
    /// Attach a blake3 digest to rows for created or updated regular files.
    pub hash_changed_files: bool,
    /// Files larger than this are not hashed.
    pub max_hash_bytes: u64,
}

impl Default for FileEventsSection {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            hash_changed_files: false,
            max_hash_bytes: DEFAULT_MAX_HASH_BYTES,
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level filter (e.g. `"info"`, `"debug"`).
    pub level: String,
    /// Output format: `pretty`, `compact`, `json` or `full`.
    pub format: String,
    /// Output target: `stderr`, `stdout` or `file`.
    pub target: String,
    /// Directory for rolling log files when `target = "file"`.
    pub directory: Option<PathBuf>,
    /// Per-crate directive overrides (e.g. `osmon_events=trace`).
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "pretty".to_owned(),
            target: "stderr".to_owned(),
            directory: None,
            directives: Vec::new(),
        }
    }
}
