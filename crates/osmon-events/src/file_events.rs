//! The `file_events` subscriber.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use osmon_config::{FileEventsSection, FilePathEntry};
use tracing::{debug, info};

use crate::context::Row;
use crate::error::{EventsError, EventsResult};
use crate::fsevents::{
    FSEVENTS_PUBLISHER, FsAction, FsEventContext, FsEventsPublisher, FsSubscriptionContext,
};
use crate::subscriber::{EventSubscriber, SubscriberContext};

/// Table (subscriber) name.
pub const FILE_EVENTS_TABLE: &str = "file_events";

/// Turns filesystem events on configured paths into `file_events` rows.
#[derive(Debug, Clone, Default)]
pub struct FileEventsSubscriber {
    entries: Vec<FilePathEntry>,
    hash_limit: Option<u64>,
}

impl FileEventsSubscriber {
    /// A subscriber for the given path entries, with hashing off.
    #[must_use]
    pub fn new(entries: Vec<FilePathEntry>) -> Self {
        Self {
            entries,
            hash_limit: None,
        }
    }

    /// Build from the `[file_events]` config section.
    #[must_use]
    pub fn from_config(section: &FileEventsSection) -> Self {
        let subscriber = Self::new(section.paths.clone());
        if section.hash_changed_files {
            subscriber.with_hashing(section.max_hash_bytes)
        } else {
            subscriber
        }
    }

    /// Hash created or updated regular files up to `max_bytes`.
    #[must_use]
    pub fn with_hashing(mut self, max_bytes: u64) -> Self {
        self.hash_limit = Some(max_bytes);
        self
    }

    /// Configured path entries.
    #[must_use]
    pub fn entries(&self) -> &[FilePathEntry] {
        &self.entries
    }
}

impl EventSubscriber for FileEventsSubscriber {
    fn name(&self) -> &str {
        FILE_EVENTS_TABLE
    }

    fn init(&self, ctx: &mut SubscriberContext<'_>) -> EventsResult<()> {
        for entry in &self.entries {
            let filter = parse_actions(entry)?;
            let hash_limit = self.hash_limit;
            let sc = FsSubscriptionContext::new(&entry.path)
                .recursive(entry.recursive)
                .with_category(&entry.category);

            ctx.subscribe::<FsEventsPublisher, _>(FSEVENTS_PUBLISHER, sc, move |ec, sc| {
                Ok(rows_for(ec, sc, &filter, hash_limit))
            })?;
        }
        info!(
            subscriber = FILE_EVENTS_TABLE,
            paths = self.entries.len(),
            hashing = self.hash_limit.is_some(),
            "file_events subscriptions added"
        );
        Ok(())
    }
}

fn parse_actions(entry: &FilePathEntry) -> EventsResult<BTreeSet<FsAction>> {
    entry
        .actions
        .iter()
        .map(|a| {
            a.parse::<FsAction>().map_err(|e| EventsError::Configuration {
                publisher: FSEVENTS_PUBLISHER.to_owned(),
                message: format!("{}: {e}", entry.path.display()),
            })
        })
        .collect()
}

/// Materialize one row, or none when `filter` excludes the action.
fn rows_for(
    ec: &FsEventContext,
    sc: &FsSubscriptionContext,
    filter: &BTreeSet<FsAction>,
    hash_limit: Option<u64>,
) -> Vec<Row> {
    if !filter.is_empty() && !filter.contains(&ec.action) {
        return Vec::new();
    }

    let digest = match (hash_limit, ec.action) {
        (Some(limit), FsAction::Created | FsAction::Updated) => {
            hash_file(&ec.path, limit).unwrap_or_default()
        },
        _ => String::new(),
    };

    vec![
        Row::new()
            .with("target_path", ec.path.display().to_string())
            .with("category", sc.category.clone())
            .with("action", ec.action.as_str())
            .with("transaction_id", ec.transaction_id)
            .with("time", ec.time.timestamp())
            .with("link", sc.link().display().to_string())
            .with("flags", ec.flags.bits())
            .with("blake3", digest),
    ]
}

/// Hex blake3 of a regular file no larger than `limit` bytes.
fn hash_file(path: &Path, limit: u64) -> Option<String> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "not hashing, file unavailable");
            return None;
        },
    };
    if !metadata.is_file() || metadata.len() > limit {
        return None;
    }

    // Read one byte past the limit to notice growth since the size check.
    let mut hasher = blake3::Hasher::new();
    let copied = File::open(path)
        .and_then(|file| io::copy(&mut file.take(limit.saturating_add(1)), &mut hasher));
    match copied {
        Ok(n) if n > limit => {
            debug!(path = %path.display(), limit, "not hashing, file grew past limit");
            None
        },
        Ok(_) => Some(hasher.finalize().to_hex().to_string()),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "failed to hash file");
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::fsevents::FsEventFlags;

    fn entry(path: &str, actions: &[&str]) -> FilePathEntry {
        FilePathEntry {
            category: "etc".to_owned(),
            path: PathBuf::from(path),
            recursive: false,
            actions: actions.iter().map(|a| (*a).to_owned()).collect(),
        }
    }

    fn event(path: &Path, action: FsAction) -> FsEventContext {
        FsEventContext {
            transaction_id: 9,
            time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            path: path.to_path_buf(),
            action,
            flags: FsEventFlags::ITEM_CREATED | FsEventFlags::ITEM_IS_FILE,
        }
    }

    #[test]
    fn test_row_columns() {
        let sc = FsSubscriptionContext::new("/etc").with_category("etc");
        let rows = rows_for(
            &event(Path::new("/etc/hosts"), FsAction::Created),
            &sc,
            &BTreeSet::new(),
            None,
        );

        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.get_str("target_path"), Some("/etc/hosts"));
        assert_eq!(row.get_str("category"), Some("etc"));
        assert_eq!(row.get_str("action"), Some("CREATED"));
        assert_eq!(row.get("transaction_id").and_then(|v| v.as_u64()), Some(9));
        assert_eq!(row.get("time").and_then(|v| v.as_i64()), Some(1_700_000_000));
        assert_eq!(row.get_str("link"), Some(""));
        assert_eq!(row.get("flags").and_then(|v| v.as_u64()), Some(0x1_0100));
        assert_eq!(row.get_str("blake3"), Some(""));
    }

    #[test]
    fn test_action_filter() {
        let filter = parse_actions(&entry("/etc", &["DELETED"])).unwrap();
        let sc = FsSubscriptionContext::new("/etc");
        let path = Path::new("/etc/hosts");

        assert!(rows_for(&event(path, FsAction::Created), &sc, &filter, None).is_empty());
        assert_eq!(rows_for(&event(path, FsAction::Deleted), &sc, &filter, None).len(), 1);
    }

    #[test]
    fn test_unknown_action_is_configuration_error() {
        let err = parse_actions(&entry("/etc", &["EXPLODED"])).unwrap_err();
        assert!(matches!(err, EventsError::Configuration { .. }));
    }

    #[test]
    fn test_hash_only_small_regular_files_on_create_or_update() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, b"hello").unwrap();
        let expected = blake3::hash(b"hello").to_hex().to_string();
        let sc = FsSubscriptionContext::new(dir.path());
        let none = BTreeSet::new();

        let created = rows_for(&event(&file, FsAction::Created), &sc, &none, Some(1024));
        assert_eq!(created[0].get_str("blake3"), Some(expected.as_str()));

        let deleted = rows_for(&event(&file, FsAction::Deleted), &sc, &none, Some(1024));
        assert_eq!(deleted[0].get_str("blake3"), Some(""));

        let too_big = rows_for(&event(&file, FsAction::Updated), &sc, &none, Some(4));
        assert_eq!(too_big[0].get_str("blake3"), Some(""));

        let directory = rows_for(&event(dir.path(), FsAction::Created), &sc, &none, Some(1024));
        assert_eq!(directory[0].get_str("blake3"), Some(""));
    }

    #[test]
    fn test_hash_reads_at_most_limit_plus_one_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.bin");
        std::fs::write(&file, vec![7u8; 64]).unwrap();

        assert_eq!(hash_file(&file, 64), Some(blake3::hash(&[7u8; 64]).to_hex().to_string()));
        assert_eq!(hash_file(&file, 63), None);
        assert_eq!(hash_file(&file, u64::MAX).as_deref().map(str::len), Some(64));
    }

    #[test]
    fn test_from_config_honors_hash_switch() {
        let mut section = FileEventsSection {
            paths: vec![entry("/etc", &[])],
            ..FileEventsSection::default()
        };
        assert!(FileEventsSubscriber::from_config(&section).hash_limit.is_none());

        section.hash_changed_files = true;
        let subscriber = FileEventsSubscriber::from_config(&section);
        assert_eq!(subscriber.hash_limit, Some(section.max_hash_bytes));
        assert_eq!(subscriber.entries().len(), 1);
        assert_eq!(subscriber.name(), FILE_EVENTS_TABLE);
    }
}
