//! Test fixtures for common types.

use std::path::{Path, PathBuf};

use osmon_config::FilePathEntry;
use osmon_events::fsevents::{FsEventFlags, FsSubscriptionContext, RawNotification};

/// Create a filesystem subscription context.
#[must_use]
pub fn fs_subscription(path: impl Into<PathBuf>, recursive: bool) -> FsSubscriptionContext {
    FsSubscriptionContext::new(path).recursive(recursive)
}

/// Create a native notification.
#[must_use]
pub fn raw_notification(
    path: impl Into<PathBuf>,
    flags: FsEventFlags,
    transaction_id: u64,
) -> RawNotification {
    RawNotification {
        path: path.into(),
        flags: flags.bits(),
        transaction_id,
    }
}

/// Create a `file_events` path entry that keeps every action.
#[must_use]
pub fn file_entry(category: &str, path: impl Into<PathBuf>, recursive: bool) -> FilePathEntry {
    FilePathEntry {
        category: category.to_owned(),
        path: path.into(),
        recursive,
        actions: Vec::new(),
    }
}

/// A chain of symbolic links ending at a real directory.
#[derive(Debug, Clone)]
pub struct SymlinkChain {
    /// The directory the chain resolves to.
    pub target: PathBuf,
    /// Links, outermost first. `links[i]` points at `links[i + 1]`, the last
    /// one at `target`.
    pub links: Vec<PathBuf>,
}

impl SymlinkChain {
    /// The outermost link, or the target when the chain is empty.
    #[must_use]
    pub fn head(&self) -> &Path {
        self.links.first().unwrap_or(&self.target)
    }
}

/// Build a chain of `len` links inside `dir` ending at `dir/target`.
///
/// Every link uses a relative target.
///
/// # Panics
///
/// Panics if the directory or a link cannot be created.
#[cfg(unix)]
#[must_use]
pub fn symlink_chain(dir: &Path, len: usize) -> SymlinkChain {
    use std::os::unix::fs::symlink;

    let target = dir.join("target");
    std::fs::create_dir_all(&target).expect("Failed to create chain target");

    let mut links = Vec::with_capacity(len);
    let mut points_at = PathBuf::from("target");
    for i in 1..=len {
        let name = format!("link{i}");
        let link = dir.join(&name);
        symlink(&points_at, &link).expect("Failed to create symbolic link");
        links.push(link);
        points_at = PathBuf::from(name);
    }
    links.reverse();

    SymlinkChain { target, links }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_symlink_chain_layout() {
        let dir = tempfile::tempdir().unwrap();
        let chain = symlink_chain(dir.path(), 3);

        assert_eq!(chain.links.len(), 3);
        assert_eq!(chain.head(), dir.path().join("link3"));
        assert_eq!(
            std::fs::read_link(chain.head()).unwrap(),
            PathBuf::from("link2")
        );
        assert_eq!(
            std::fs::canonicalize(chain.head()).unwrap(),
            std::fs::canonicalize(&chain.target).unwrap()
        );
    }
}
