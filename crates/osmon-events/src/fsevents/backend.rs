//! Native watch backends.
//!
//! A [`WatchBackend`] turns a target set into a [`WatchStream`] that posts
//! [`NativeBatch`]es into a publisher's run loop.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use notify::event::{CreateKind, MetadataKind, ModifyKind, RemoveKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, trace, warn};

use super::context::{NativeBatch, RawNotification};
use super::flags::FsEventFlags;
use crate::error::{EventsError, EventsResult};
use crate::run_loop::LoopHandle;
use crate::sync::lock;

/// Where a stream posts its batches.
pub type NotificationSink = LoopHandle<NativeBatch>;

/// A created native stream. Dropping it releases the native resources.
pub trait WatchStream: Send {
    /// Begin delivering notifications.
    ///
    /// # Errors
    ///
    /// Returns an error if no target could be watched.
    fn start(&mut self) -> EventsResult<()>;

    /// Stop delivering notifications. Idempotent.
    fn stop(&mut self);
}

/// Factory for native streams.
pub trait WatchBackend: Send + Sync + 'static {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Create a stream over `paths` that posts into `sink`.
    ///
    /// # Errors
    ///
    /// Returns an error if the native stream cannot be created.
    fn create_stream(
        &self,
        paths: &BTreeSet<PathBuf>,
        sink: NotificationSink,
    ) -> EventsResult<Box<dyn WatchStream>>;
}

// ---------------------------------------------------------------------------
// notify
// ---------------------------------------------------------------------------

/// Backend on the `notify` crate's recommended watcher.
#[derive(Debug)]
pub struct NotifyBackend {
    next_transaction: Arc<AtomicU64>,
}

impl Default for NotifyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyBackend {
    /// A backend whose transaction ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_transaction: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl WatchBackend for NotifyBackend {
    fn name(&self) -> &'static str {
        "notify"
    }

    fn create_stream(
        &self,
        paths: &BTreeSet<PathBuf>,
        sink: NotificationSink,
    ) -> EventsResult<Box<dyn WatchStream>> {
        let roots = paths.clone();
        let counter = Arc::clone(&self.next_transaction);
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if let Some(batch) = map_event(&event, &roots, &counter) {
                        trace!(notifications = batch.len(), "posting notify batch");
                        let _ = sink.post(batch);
                    }
                },
                Err(e) => warn!(error = %e, "filesystem watcher error"),
            },
            notify::Config::default(),
        )?;

        Ok(Box::new(NotifyStream {
            watcher,
            paths: paths.clone(),
            watching: Vec::new(),
        }))
    }
}

struct NotifyStream {
    watcher: RecommendedWatcher,
    paths: BTreeSet<PathBuf>,
    watching: Vec<PathBuf>,
}

impl WatchStream for NotifyStream {
    fn start(&mut self) -> EventsResult<()> {
        let mut last_error = None;
        for path in &self.paths {
            match self.watcher.watch(path, RecursiveMode::Recursive) {
                Ok(()) => {
                    debug!(path = %path.display(), "watching path");
                    self.watching.push(path.clone());
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to watch path");
                    last_error = Some(e);
                },
            }
        }
        match last_error {
            Some(e) if self.watching.is_empty() => Err(e.into()),
            _ => {
                info!(watched = self.watching.len(), "notify stream started");
                Ok(())
            },
        }
    }

    fn stop(&mut self) {
        for path in self.watching.drain(..) {
            if let Err(e) = self.watcher.unwatch(&path) {
                debug!(path = %path.display(), error = %e, "unwatch failed");
            }
        }
    }
}

impl Drop for NotifyStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Translate one notify event into native flag notifications.
///
/// Access events are dropped. Removal or rename of a watched root adds
/// `ROOT_CHANGED`. A rescan with no paths is reported once per root.
fn map_event(event: &Event, roots: &BTreeSet<PathBuf>, counter: &AtomicU64) -> Option<NativeBatch> {
    let mut flags = match event.kind {
        EventKind::Access(_) => return None,
        EventKind::Create(kind) => {
            FsEventFlags::ITEM_CREATED
                | match kind {
                    CreateKind::File => FsEventFlags::ITEM_IS_FILE,
                    CreateKind::Folder => FsEventFlags::ITEM_IS_DIR,
                    _ => FsEventFlags::empty(),
                }
        },
        EventKind::Remove(kind) => {
            FsEventFlags::ITEM_REMOVED
                | match kind {
                    RemoveKind::File => FsEventFlags::ITEM_IS_FILE,
                    RemoveKind::Folder => FsEventFlags::ITEM_IS_DIR,
                    _ => FsEventFlags::empty(),
                }
        },
        EventKind::Modify(ModifyKind::Name(_)) => FsEventFlags::ITEM_RENAMED,
        EventKind::Modify(ModifyKind::Metadata(kind)) => match kind {
            MetadataKind::Ownership | MetadataKind::Permissions => {
                FsEventFlags::ITEM_CHANGE_OWNER
            },
            MetadataKind::Extended => FsEventFlags::ITEM_XATTR_MOD,
            _ => FsEventFlags::ITEM_INODE_META_MOD,
        },
        EventKind::Modify(_) => FsEventFlags::ITEM_MODIFIED,
        EventKind::Any | EventKind::Other => FsEventFlags::empty(),
    };
    if event.need_rescan() {
        flags |= FsEventFlags::MUST_SCAN_SUB_DIRS;
    }

    let paths: Vec<PathBuf> = if event.paths.is_empty() {
        if !flags.contains(FsEventFlags::MUST_SCAN_SUB_DIRS) {
            return None;
        }
        roots.iter().cloned().collect()
    } else {
        event.paths.clone()
    };

    let transaction_id = counter.fetch_add(1, Ordering::Relaxed);
    let batch = paths
        .into_iter()
        .map(|path| {
            let mut bits = flags;
            if flags.intersects(FsEventFlags::ITEM_REMOVED | FsEventFlags::ITEM_RENAMED)
                && roots.contains(&path)
            {
                bits |= FsEventFlags::ROOT_CHANGED;
            }
            RawNotification {
                path,
                flags: bits.bits(),
                transaction_id,
            }
        })
        .collect();
    Some(batch)
}

// ---------------------------------------------------------------------------
// Manual
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ManualInner {
    sink: Mutex<Option<NotificationSink>>,
    generation: AtomicUsize,
    streaming: AtomicBool,
    fail_create: AtomicBool,
    fail_start: AtomicBool,
    created: AtomicUsize,
    paths: Mutex<BTreeSet<PathBuf>>,
}

/// In-process backend driven by [`emit`](Self::emit).
///
/// Clones share state, so a test can keep one clone and hand another to the
/// publisher. Also used to replay recorded notifications.
#[derive(Clone, Default)]
pub struct ManualBackend {
    inner: Arc<ManualInner>,
}

impl fmt::Debug for ManualBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualBackend")
            .field("streaming", &self.is_streaming())
            .field("streams_created", &self.streams_created())
            .finish_non_exhaustive()
    }
}

impl ManualBackend {
    /// A backend that creates working streams.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Post a batch through the started stream.
    ///
    /// Returns `false` if no stream is started.
    pub fn emit(&self, batch: NativeBatch) -> bool {
        if !self.inner.streaming.load(Ordering::Acquire) {
            return false;
        }
        lock(&self.inner.sink)
            .as_ref()
            .is_some_and(|sink| sink.post(batch))
    }

    /// Make subsequent `create_stream` calls fail.
    pub fn fail_create(&self, fail: bool) {
        self.inner.fail_create.store(fail, Ordering::Release);
    }

    /// Make subsequent `start` calls fail.
    pub fn fail_start(&self, fail: bool) {
        self.inner.fail_start.store(fail, Ordering::Release);
    }

    /// Whether a stream is currently started.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.inner.streaming.load(Ordering::Acquire)
    }

    /// Number of streams created so far.
    #[must_use]
    pub fn streams_created(&self) -> usize {
        self.inner.created.load(Ordering::Acquire)
    }

    /// Targets of the most recently created stream.
    #[must_use]
    pub fn watched_paths(&self) -> BTreeSet<PathBuf> {
        lock(&self.inner.paths).clone()
    }
}

impl WatchBackend for ManualBackend {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn create_stream(
        &self,
        paths: &BTreeSet<PathBuf>,
        sink: NotificationSink,
    ) -> EventsResult<Box<dyn WatchStream>> {
        if self.inner.fail_create.load(Ordering::Acquire) {
            return Err(EventsError::Configuration {
                publisher: "fsevents".to_owned(),
                message: "manual backend refused to create a stream".to_owned(),
            });
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        self.inner.created.fetch_add(1, Ordering::AcqRel);
        *lock(&self.inner.paths) = paths.clone();
        *lock(&self.inner.sink) = Some(sink);
        Ok(Box::new(ManualStream {
            inner: Arc::clone(&self.inner),
            generation,
        }))
    }
}

struct ManualStream {
    inner: Arc<ManualInner>,
    generation: usize,
}

impl ManualStream {
    fn is_current(&self) -> bool {
        self.inner.generation.load(Ordering::Acquire) == self.generation
    }
}

impl WatchStream for ManualStream {
    fn start(&mut self) -> EventsResult<()> {
        if self.inner.fail_start.load(Ordering::Acquire) {
            return Err(EventsError::Configuration {
                publisher: "fsevents".to_owned(),
                message: "manual backend refused to start a stream".to_owned(),
            });
        }
        if self.is_current() {
            self.inner.streaming.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn stop(&mut self) {
        if self.is_current() {
            self.inner.streaming.store(false, Ordering::Release);
            *lock(&self.inner.sink) = None;
        }
    }
}

impl Drop for ManualStream {
    fn drop(&mut self) {
        self.stop();
    }
}
