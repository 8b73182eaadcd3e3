//! Native filesystem event flags and their action labels.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Per-notification flag bits, using the native stream values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FsEventFlags: u32 {
        /// Events were coalesced; rescan below this path.
        const MUST_SCAN_SUB_DIRS = 0x0000_0001;
        /// Events dropped in user space.
        const USER_DROPPED = 0x0000_0002;
        /// Events dropped in the kernel.
        const KERNEL_DROPPED = 0x0000_0004;
        /// The event id counter wrapped.
        const EVENT_IDS_WRAPPED = 0x0000_0008;
        /// End of historical replay.
        const HISTORY_DONE = 0x0000_0010;
        /// A watched root was moved, removed or replaced.
        const ROOT_CHANGED = 0x0000_0020;
        /// A volume was mounted below a watched path.
        const MOUNT = 0x0000_0040;
        /// A volume was unmounted below a watched path.
        const UNMOUNT = 0x0000_0080;
        /// Item created.
        const ITEM_CREATED = 0x0000_0100;
        /// Item removed.
        const ITEM_REMOVED = 0x0000_0200;
        /// Inode metadata changed.
        const ITEM_INODE_META_MOD = 0x0000_0400;
        /// Item renamed.
        const ITEM_RENAMED = 0x0000_0800;
        /// Item contents modified.
        const ITEM_MODIFIED = 0x0000_1000;
        /// Finder info changed.
        const ITEM_FINDER_INFO_MOD = 0x0000_2000;
        /// Owner changed.
        const ITEM_CHANGE_OWNER = 0x0000_4000;
        /// Extended attributes changed.
        const ITEM_XATTR_MOD = 0x0000_8000;
        /// Item is a regular file.
        const ITEM_IS_FILE = 0x0001_0000;
        /// Item is a directory.
        const ITEM_IS_DIR = 0x0002_0000;
        /// Item is a symbolic link.
        const ITEM_IS_SYMLINK = 0x0004_0000;
    }
}

/// Action label attached to a fired filesystem event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FsAction {
    /// Coalesced events under a root.
    CollisionWithin,
    /// A watched root changed.
    RootChanged,
    /// A volume went away.
    Unmounted,
    /// Item created.
    Created,
    /// Item removed.
    Deleted,
    /// Owner, xattr or inode metadata changed.
    AttributesModified,
    /// Item renamed.
    MovedTo,
    /// Item contents changed.
    Updated,
    /// No known action bit was set.
    Unknown,
}

impl FsAction {
    /// The label written to rows.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CollisionWithin => "COLLISION_WITHIN",
            Self::RootChanged => "ROOT_CHANGED",
            Self::Unmounted => "UNMOUNTED",
            Self::Created => "CREATED",
            Self::Deleted => "DELETED",
            Self::AttributesModified => "ATTRIBUTES_MODIFIED",
            Self::MovedTo => "MOVED_TO",
            Self::Updated => "UPDATED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for FsAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an unrecognized action label.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown filesystem action: {0}")]
pub struct UnknownAction(pub String);

impl FromStr for FsAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "COLLISION_WITHIN" => Self::CollisionWithin,
            "ROOT_CHANGED" => Self::RootChanged,
            "UNMOUNTED" => Self::Unmounted,
            "CREATED" => Self::Created,
            "DELETED" => Self::Deleted,
            "ATTRIBUTES_MODIFIED" => Self::AttributesModified,
            "MOVED_TO" => Self::MovedTo,
            "UPDATED" => Self::Updated,
            "UNKNOWN" => Self::Unknown,
            other => return Err(UnknownAction(other.to_owned())),
        })
    }
}

/// Flag bits that carry an action, in ascending bit order.
pub const ACTION_TABLE: &[(FsEventFlags, FsAction)] = &[
    (FsEventFlags::MUST_SCAN_SUB_DIRS, FsAction::CollisionWithin),
    (FsEventFlags::ROOT_CHANGED, FsAction::RootChanged),
    (FsEventFlags::UNMOUNT, FsAction::Unmounted),
    (FsEventFlags::ITEM_CREATED, FsAction::Created),
    (FsEventFlags::ITEM_REMOVED, FsAction::Deleted),
    (FsEventFlags::ITEM_INODE_META_MOD, FsAction::AttributesModified),
    (FsEventFlags::ITEM_RENAMED, FsAction::MovedTo),
    (FsEventFlags::ITEM_MODIFIED, FsAction::Updated),
    (FsEventFlags::ITEM_CHANGE_OWNER, FsAction::AttributesModified),
    (FsEventFlags::ITEM_XATTR_MOD, FsAction::AttributesModified),
];

/// Distinct actions carried by `flags`, in ascending bit order.
///
/// Empty when no action bit is set.
#[must_use]
pub fn actions_for(flags: FsEventFlags) -> Vec<FsAction> {
    let mut actions = Vec::new();
    for (bit, action) in ACTION_TABLE {
        if flags.contains(*bit) && !actions.contains(action) {
            actions.push(*action);
        }
    }
    actions
}
