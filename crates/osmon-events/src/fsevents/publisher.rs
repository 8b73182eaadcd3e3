//! The filesystem event publisher.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use osmon_config::FsEventsSection;
use tracing::{debug, error, info, trace, warn};

use super::backend::{NotifyBackend, WatchBackend, WatchStream};
use super::context::{FsEventContext, FsSubscriptionContext, NativeBatch, expand_notification};
use super::flags::FsEventFlags;
use super::policy::{ConfiguredPolicy, DefaultFlagPolicy, FlagPolicy, WatchAdjustment};
use crate::error::{EventsError, EventsResult};
use crate::publisher::{EventPublisher, FlushMode, PublisherContext, RunStatus};
use crate::run_loop::{DEFAULT_FLUSH_TIMEOUT, LoopExit, LoopHandle};
use crate::subscriber::Subscription;
use crate::sync::lock;

/// Registry name of [`FsEventsPublisher`].
pub const FSEVENTS_PUBLISHER: &str = "fsevents";

/// Symbolic links followed per subscription before giving up.
pub const DEFAULT_MAX_LINK_DEPTH: usize = 5;

#[derive(Default)]
struct FsState {
    paths: BTreeSet<PathBuf>,
    stream: Option<Box<dyn WatchStream>>,
    stream_started: bool,
    run_loop: Option<LoopHandle<NativeBatch>>,
}

/// Publishes file change notifications from a [`WatchBackend`].
pub struct FsEventsPublisher {
    backend: Box<dyn WatchBackend>,
    policy: Box<dyn FlagPolicy>,
    max_link_depth: usize,
    state: Mutex<FsState>,
}

impl fmt::Debug for FsEventsPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("FsEventsPublisher")
            .field("backend", &self.backend.name())
            .field("max_link_depth", &self.max_link_depth)
            .field("paths", &state.paths)
            .field("stream_started", &state.stream_started)
            .finish_non_exhaustive()
    }
}

impl Default for FsEventsPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl FsEventsPublisher {
    /// A publisher on the `notify` backend with the default flag policy.
    #[must_use]
    pub fn new() -> Self {
        Self::with_backend(NotifyBackend::new())
    }

    /// A publisher on `backend` with the default flag policy.
    #[must_use]
    pub fn with_backend(backend: impl WatchBackend) -> Self {
        Self {
            backend: Box::new(backend),
            policy: Box::new(DefaultFlagPolicy),
            max_link_depth: DEFAULT_MAX_LINK_DEPTH,
            state: Mutex::new(FsState::default()),
        }
    }

    /// Apply the `[fsevents]` section on top of the `notify` backend.
    #[must_use]
    pub fn from_config(section: &FsEventsSection) -> Self {
        Self::new()
            .with_max_link_depth(section.max_symlink_depth)
            .with_policy(ConfiguredPolicy::from(section))
    }

    /// Replace the flag policy.
    #[must_use]
    pub fn with_policy(mut self, policy: impl FlagPolicy) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Replace the symbolic link depth limit.
    #[must_use]
    pub fn with_max_link_depth(mut self, depth: usize) -> Self {
        self.max_link_depth = depth;
        self
    }

    /// Distinct targets in the current watch set.
    #[must_use]
    pub fn watched_paths(&self) -> BTreeSet<PathBuf> {
        lock(&self.state).paths.clone()
    }

    /// Follow `sc` through symbolic links and store the resolved path.
    ///
    /// Resolution restarts from the recorded link, if any, so a retargeted
    /// link is picked up on reconfigure. Only the first link of a chain is
    /// recorded.
    fn resolve(&self, sc: &mut FsSubscriptionContext) {
        let mut current = if sc.link.as_os_str().is_empty() {
            sc.path.clone()
        } else {
            sc.link.clone()
        };

        let mut depth: usize = 0;
        while depth < self.max_link_depth {
            depth = depth.saturating_add(1);
            if !is_symlink(&current) {
                break;
            }
            if sc.link.as_os_str().is_empty() {
                sc.link.clone_from(&current);
            }
            let target = match std::fs::read_link(&current) {
                Ok(target) => target,
                Err(e) => {
                    warn!(path = %current.display(), error = %e, "failed to read symbolic link");
                    break;
                },
            };
            current = if target.is_relative() {
                sc.link
                    .parent()
                    .map_or_else(|| target.clone(), |parent| parent.join(&target))
            } else {
                target
            };
        }

        if current != sc.path {
            debug!(
                requested = %sc.path.display(),
                resolved = %current.display(),
                "subscription path resolved through links"
            );
            sc.set_path(current);
        }
    }

    fn release(state: &mut FsState) {
        if let Some(mut stream) = state.stream.take() {
            stream.stop();
            debug!("fsevents stream released");
        }
        state.stream_started = false;
    }

    /// Replace the native stream with one over the current target set.
    ///
    /// Does nothing beyond the release until a run loop has been captured.
    fn restart(&self, state: &mut FsState) -> EventsResult<()> {
        Self::release(state);
        let Some(sink) = state.run_loop.clone() else {
            return Ok(());
        };
        if state.paths.is_empty() {
            debug!("no fsevents targets, stream not created");
            return Ok(());
        }

        let mut stream = self
            .backend
            .create_stream(&state.paths, sink)
            .map_err(configuration_error)?;
        if let Err(e) = stream.start() {
            stream.stop();
            return Err(configuration_error(e));
        }

        state.stream = Some(stream);
        state.stream_started = true;
        info!(
            backend = self.backend.name(),
            targets = state.paths.len(),
            "fsevents stream started"
        );
        Ok(())
    }

    fn process_batch(&self, ctx: &PublisherContext<'_, Self>, batch: NativeBatch) {
        let time = Utc::now();
        let mut adjustments = Vec::new();

        for notification in &batch {
            let flags = FsEventFlags::from_bits_retain(notification.flags);
            if flags.contains(FsEventFlags::MUST_SCAN_SUB_DIRS) {
                warn!(
                    path = %notification.path.display(),
                    "notifications coalesced, subtree must be rescanned"
                );
            }
            if flags.contains(FsEventFlags::ROOT_CHANGED) {
                adjustments.push(self.policy.on_root_changed(&notification.path));
            }
            if flags.contains(FsEventFlags::UNMOUNT) {
                adjustments.push(self.policy.on_unmount(&notification.path));
            }

            for ec in expand_notification(notification, time) {
                trace!(
                    path = %ec.path.display(),
                    action = %ec.action,
                    transaction_id = ec.transaction_id,
                    "firing fsevent"
                );
                ctx.fire(ec);
            }
        }

        self.apply_adjustments(ctx, adjustments);
    }

    fn apply_adjustments(&self, ctx: &PublisherContext<'_, Self>, adjustments: Vec<WatchAdjustment>) {
        if adjustments.contains(&WatchAdjustment::Reconfigure) {
            info!("watched root changed, reconfiguring");
            if let Err(e) = ctx.reconfigure() {
                error!(error = %e, "fsevents reconfigure failed");
            }
        }

        let removed: Vec<PathBuf> = adjustments
            .into_iter()
            .filter_map(|a| match a {
                WatchAdjustment::RemoveTarget(path) => Some(path),
                WatchAdjustment::None | WatchAdjustment::Reconfigure => None,
            })
            .collect();
        if removed.is_empty() {
            return;
        }

        let mut state = lock(&self.state);
        let before = state.paths.len();
        state
            .paths
            .retain(|target| !removed.iter().any(|r| target.starts_with(r)));
        if state.paths.len() == before {
            return;
        }
        info!(
            removed = before.saturating_sub(state.paths.len()),
            remaining = state.paths.len(),
            "removed unmounted fsevents targets"
        );
        if let Err(e) = self.restart(&mut state) {
            error!(error = %e, "fsevents restart after unmount failed");
        }
    }
}

fn is_symlink(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink())
}

fn configuration_error(e: EventsError) -> EventsError {
    match e {
        EventsError::Configuration { .. } => e,
        other => EventsError::Configuration {
            publisher: FSEVENTS_PUBLISHER.to_owned(),
            message: other.to_string(),
        },
    }
}

impl EventPublisher for FsEventsPublisher {
    type SubscriptionContext = FsSubscriptionContext;
    type EventContext = FsEventContext;
    type Notification = NativeBatch;

    fn type_name(&self) -> &'static str {
        FSEVENTS_PUBLISHER
    }

    fn configure(&self, subscriptions: &mut [Subscription<Self>]) -> EventsResult<()> {
        let mut paths = BTreeSet::new();
        for subscription in subscriptions.iter_mut() {
            let sc = subscription.context_mut();
            self.resolve(sc);
            paths.insert(sc.path.clone());
        }

        let mut state = lock(&self.state);
        state.paths = paths;
        if state.paths.is_empty() {
            Self::release(&mut state);
            debug!("fsevents configured with no targets");
            return Ok(());
        }
        self.restart(&mut state)
    }

    fn run(&self, ctx: &PublisherContext<'_, Self>) -> EventsResult<RunStatus> {
        if ctx.stop_requested() {
            return Ok(RunStatus::Cancelled);
        }

        let mut had_targets = {
            let mut state = lock(&self.state);
            if state.run_loop.is_none() {
                state.run_loop = Some(ctx.handle());
            }
            if state.stream.is_none()
                && let Err(e) = self.restart(&mut state)
            {
                error!(error = %e, "fsevents stream could not be started");
            }
            !state.paths.is_empty()
        };

        let exit = ctx.run_loop().run(|batch| self.process_batch(ctx, batch));

        {
            let mut state = lock(&self.state);
            had_targets = had_targets || !state.paths.is_empty();
            Self::release(&mut state);
        }

        match exit {
            LoopExit::Cancelled => Ok(RunStatus::Cancelled),
            LoopExit::Stopped if had_targets => Ok(RunStatus::Completed),
            LoopExit::Stopped => Ok(RunStatus::Idle),
            LoopExit::Busy => Err(EventsError::AlreadyRunning(FSEVENTS_PUBLISHER.to_owned())),
        }
    }

    fn stop(&self) {
        let handle = {
            let mut state = lock(&self.state);
            Self::release(&mut state);
            state.run_loop.clone()
        };
        if let Some(handle) = handle {
            handle.stop();
        }
    }

    fn tear_down(&self) {
        self.stop();
        lock(&self.state).run_loop = None;
    }

    /// A synchronous flush called from the run thread itself waits out
    /// [`DEFAULT_FLUSH_TIMEOUT`].
    fn flush(&self, mode: FlushMode) {
        let handle = {
            let state = lock(&self.state);
            if state.stream.is_none() || !state.stream_started {
                return;
            }
            state.run_loop.clone()
        };
        if let Some(handle) = handle
            && !handle.flush(mode, DEFAULT_FLUSH_TIMEOUT)
        {
            warn!(?mode, "fsevents flush did not complete");
        }
    }

    fn should_fire(&self, sc: &FsSubscriptionContext, ec: &FsEventContext) -> bool {
        let path_matches = if sc.recursive {
            ec.path
                .as_os_str()
                .as_encoded_bytes()
                .starts_with(sc.path.as_os_str().as_encoded_bytes())
        } else {
            sc.glob_matches(&ec.path)
        };
        path_matches && (sc.mask == 0 || ec.flags.bits() & sc.mask != 0)
    }

    fn num_subscribed_targets(&self) -> usize {
        lock(&self.state).paths.len()
    }

    fn is_active(&self) -> bool {
        let state = lock(&self.state);
        state.stream.is_some()
            && state.stream_started
            && state.run_loop.as_ref().is_some_and(LoopHandle::is_waiting)
    }
}
