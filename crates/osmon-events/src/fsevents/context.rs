//! Filesystem subscription and event records.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobMatcher};
use tracing::warn;

use super::flags::{FsAction, FsEventFlags, actions_for};
use crate::context::EventContext;

/// One notification as reported by a native backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    /// Path the notification is about.
    pub path: PathBuf,
    /// Raw [`FsEventFlags`] bits.
    pub flags: u32,
    /// Source-assigned id.
    pub transaction_id: u64,
}

/// A batch of notifications delivered by one native callback.
pub type NativeBatch = Vec<RawNotification>;

/// What one filesystem subscription wants to see.
pub struct FsSubscriptionContext {
    /// Watched path. Replaced by the resolved target during configure.
    pub(crate) path: PathBuf,
    /// Literal-prefix matching when `true`, `path*` glob otherwise.
    pub recursive: bool,
    /// Raw flag bits to require. Zero accepts any flags.
    pub mask: u32,
    /// Free-form label copied into rows.
    pub category: String,
    /// The originally requested path when it was a symbolic link.
    pub(crate) link: PathBuf,
    matcher: OnceLock<Option<GlobMatcher>>,
}

impl fmt::Debug for FsSubscriptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsSubscriptionContext")
            .field("path", &self.path)
            .field("recursive", &self.recursive)
            .field("mask", &format_args!("{:#x}", self.mask))
            .field("category", &self.category)
            .field("link", &self.link)
            .finish_non_exhaustive()
    }
}

impl FsSubscriptionContext {
    /// Watch `path` non-recursively with no mask.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            recursive: false,
            mask: 0,
            category: String::new(),
            link: PathBuf::new(),
            matcher: OnceLock::new(),
        }
    }

    /// Set recursive matching.
    #[must_use]
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Require at least one of these flag bits.
    #[must_use]
    pub fn with_mask(mut self, mask: FsEventFlags) -> Self {
        self.mask = mask.bits();
        self
    }

    /// Set the row category label.
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// The path matched against events.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The originally requested link path, empty when none was followed.
    #[must_use]
    pub fn link(&self) -> &Path {
        &self.link
    }

    pub(crate) fn set_path(&mut self, path: PathBuf) {
        self.path = path;
        self.matcher = OnceLock::new();
    }

    /// Case-insensitive `path*` glob test, where `*` may cross `/`.
    pub(crate) fn glob_matches(&self, candidate: &Path) -> bool {
        let matcher = self.matcher.get_or_init(|| {
            let pattern = format!("{}*", escape_braces(&self.path.display().to_string()));
            match GlobBuilder::new(&pattern)
                .case_insensitive(true)
                .literal_separator(false)
                .build()
            {
                Ok(glob) => Some(glob.compile_matcher()),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "invalid subscription glob, matching nothing");
                    None
                },
            }
        });
        matcher.as_ref().is_some_and(|m| m.is_match(candidate))
    }
}

/// Make `{` and `}` literal so the pattern keeps fnmatch semantics.
fn escape_braces(path: &str) -> String {
    let mut escaped = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            '{' => escaped.push_str("[{]"),
            '}' => escaped.push_str("[}]"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// One fired filesystem event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEventContext {
    /// Id shared by every action of the same notification.
    pub transaction_id: u64,
    /// When the batch was received.
    pub time: DateTime<Utc>,
    /// Path the event is about.
    pub path: PathBuf,
    /// Action label for this instance.
    pub action: FsAction,
    /// Full raw flags of the notification.
    pub flags: FsEventFlags,
}

impl EventContext for FsEventContext {
    fn transaction_id(&self) -> u64 {
        self.transaction_id
    }

    fn time(&self) -> DateTime<Utc> {
        self.time
    }
}

/// Split one notification into one context per distinct action.
///
/// Contexts come out in ascending flag order and share the transaction id.
/// A notification with no action bit yields a single `UNKNOWN` context.
#[must_use]
pub fn expand_notification(n: &RawNotification, time: DateTime<Utc>) -> Vec<FsEventContext> {
    let flags = FsEventFlags::from_bits_retain(n.flags);
    let mut actions = actions_for(flags);
    if actions.is_empty() {
        actions.push(FsAction::Unknown);
    }
    actions
        .into_iter()
        .map(|action| FsEventContext {
            transaction_id: n.transaction_id,
            time,
            path: n.path.clone(),
            action,
            flags,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(path: &str, flags: FsEventFlags) -> RawNotification {
        RawNotification {
            path: PathBuf::from(path),
            flags: flags.bits(),
            transaction_id: 42,
        }
    }

    #[test]
    fn test_multiplexed_actions_share_transaction_id() {
        let n = raw(
            "/tmp/a",
            FsEventFlags::ITEM_MODIFIED | FsEventFlags::ITEM_CREATED | FsEventFlags::ITEM_IS_FILE,
        );
        let ctxs = expand_notification(&n, Utc::now());

        let actions: Vec<FsAction> = ctxs.iter().map(|c| c.action).collect();
        assert_eq!(actions, vec![FsAction::Created, FsAction::Updated]);
        assert!(ctxs.iter().all(|c| c.transaction_id == 42));
        assert!(ctxs.iter().all(|c| c.flags.contains(FsEventFlags::ITEM_IS_FILE)));
    }

    #[test]
    fn test_no_action_bits_yields_single_unknown() {
        let ctxs = expand_notification(&raw("/tmp/a", FsEventFlags::ITEM_IS_DIR), Utc::now());
        assert_eq!(ctxs.len(), 1);
        assert_eq!(ctxs[0].action, FsAction::Unknown);
    }

    #[test]
    fn test_rescan_fires_one_collision() {
        let ctxs = expand_notification(
            &raw("/tmp", FsEventFlags::MUST_SCAN_SUB_DIRS | FsEventFlags::USER_DROPPED),
            Utc::now(),
        );
        assert_eq!(ctxs.len(), 1);
        assert_eq!(ctxs[0].action, FsAction::CollisionWithin);
        assert_eq!(ctxs[0].path, PathBuf::from("/tmp"));
    }

    #[test]
    fn test_glob_is_case_insensitive_and_crosses_separators() {
        let sc = FsSubscriptionContext::new("/tmp/Watched");
        assert!(sc.glob_matches(Path::new("/tmp/watched/file.txt")));
        assert!(sc.glob_matches(Path::new("/TMP/WATCHED")));
        assert!(sc.glob_matches(Path::new("/tmp/watched/deep/er/file")));
        assert!(!sc.glob_matches(Path::new("/other/path")));
    }

    #[test]
    fn test_glob_treats_braces_literally() {
        let unbalanced = FsSubscriptionContext::new("/tmp/a{b");
        assert!(unbalanced.glob_matches(Path::new("/tmp/a{b/file")));

        let alternation = FsSubscriptionContext::new("/tmp/{x,y}");
        assert!(alternation.glob_matches(Path::new("/tmp/{x,y}/f")));
        assert!(alternation.glob_matches(Path::new("/tmp/{X,Y}/f")));
        assert!(!alternation.glob_matches(Path::new("/tmp/x/f")));
        assert!(!alternation.glob_matches(Path::new("/tmp/y/f")));
    }

    #[test]
    fn test_set_path_resets_cached_glob() {
        let mut sc = FsSubscriptionContext::new("/a");
        assert!(sc.glob_matches(Path::new("/a/x")));
        sc.set_path(PathBuf::from("/b"));
        assert!(!sc.glob_matches(Path::new("/a/x")));
        assert!(sc.glob_matches(Path::new("/b/x")));
    }
}
