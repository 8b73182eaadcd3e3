//! Reactions to root-changed and unmount notifications.

use std::path::{Path, PathBuf};

use osmon_config::{FsEventsSection, RootChangedAction, UnmountAction};

/// What the publisher should do to its watch set after a firing pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchAdjustment {
    /// Leave the watch set alone.
    None,
    /// Re-resolve every subscription and rebuild the stream.
    Reconfigure,
    /// Drop targets at or below this path until the next configure.
    RemoveTarget(PathBuf),
}

/// Pluggable handling of special filesystem flags.
pub trait FlagPolicy: Send + Sync + 'static {
    /// A watched root was moved, removed or replaced.
    fn on_root_changed(&self, path: &Path) -> WatchAdjustment;

    /// A volume under a watched path was unmounted.
    fn on_unmount(&self, path: &Path) -> WatchAdjustment;
}

/// Reconfigure on root change, remove the target on unmount.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFlagPolicy;

impl FlagPolicy for DefaultFlagPolicy {
    fn on_root_changed(&self, _path: &Path) -> WatchAdjustment {
        WatchAdjustment::Reconfigure
    }

    fn on_unmount(&self, path: &Path) -> WatchAdjustment {
        WatchAdjustment::RemoveTarget(path.to_path_buf())
    }
}

/// Log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreFlags;

impl FlagPolicy for IgnoreFlags {
    fn on_root_changed(&self, _path: &Path) -> WatchAdjustment {
        WatchAdjustment::None
    }

    fn on_unmount(&self, _path: &Path) -> WatchAdjustment {
        WatchAdjustment::None
    }
}

/// Policy chosen per flag by the `[fsevents]` config section.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfiguredPolicy {
    root_changed: RootChangedAction,
    unmount: UnmountAction,
}

impl From<&FsEventsSection> for ConfiguredPolicy {
    fn from(section: &FsEventsSection) -> Self {
        Self {
            root_changed: section.root_changed,
            unmount: section.unmount,
        }
    }
}

impl FlagPolicy for ConfiguredPolicy {
    fn on_root_changed(&self, path: &Path) -> WatchAdjustment {
        match self.root_changed {
            RootChangedAction::Reconfigure => DefaultFlagPolicy.on_root_changed(path),
            RootChangedAction::Ignore => WatchAdjustment::None,
        }
    }

    fn on_unmount(&self, path: &Path) -> WatchAdjustment {
        match self.unmount {
            UnmountAction::Remove => DefaultFlagPolicy.on_unmount(path),
            UnmountAction::Ignore => WatchAdjustment::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let p = DefaultFlagPolicy;
        assert_eq!(p.on_root_changed(Path::new("/w")), WatchAdjustment::Reconfigure);
        assert_eq!(
            p.on_unmount(Path::new("/Volumes/usb")),
            WatchAdjustment::RemoveTarget(PathBuf::from("/Volumes/usb"))
        );
    }

    #[test]
    fn test_configured_policy_mixes_actions() {
        let section = FsEventsSection {
            root_changed: RootChangedAction::Ignore,
            ..FsEventsSection::default()
        };
        let p = ConfiguredPolicy::from(&section);
        assert_eq!(p.on_root_changed(Path::new("/w")), WatchAdjustment::None);
        assert!(matches!(
            p.on_unmount(Path::new("/m")),
            WatchAdjustment::RemoveTarget(_)
        ));
        assert_eq!(IgnoreFlags.on_unmount(Path::new("/m")), WatchAdjustment::None);
    }
}
