//! Post-merge configuration validation.
//!
//! Validates that deserialized [`Config`](crate::Config) values are within
//! acceptable ranges and that cross-field invariants hold.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Upper bound for `events.join_timeout_ms` (10 minutes).
const MAX_JOIN_TIMEOUT_MS: u64 = 600_000;

/// Upper bound for `fsevents.max_symlink_depth`.
const MAX_SYMLINK_DEPTH: usize = 64;

/// Action labels accepted in `file_events.paths[].actions`.
pub const KNOWN_ACTIONS: &[&str] = &[
    "COLLISION_WITHIN",
    "ROOT_CHANGED",
    "UNMOUNTED",
    "CREATED",
    "DELETED",
    "ATTRIBUTES_MODIFIED",
    "MOVED_TO",
    "UPDATED",
    "UNKNOWN",
];

/// Validate a fully-merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_events(config)?;
    validate_fsevents(config)?;
    validate_file_events(config)?;
    validate_logging(config)?;
    Ok(())
}

fn invalid(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.into(),
        message: message.into(),
    }
}

fn validate_events(config: &Config) -> ConfigResult<()> {
    let e = &config.events;
    if e.join_timeout_ms == 0 || e.join_timeout_ms > MAX_JOIN_TIMEOUT_MS {
        return Err(invalid(
            "events.join_timeout_ms",
            format!("join_timeout_ms must be between 1 and {MAX_JOIN_TIMEOUT_MS}"),
        ));
    }
    if let Some(name) = e
        .enabled_publishers
        .iter()
        .chain(&e.disabled_publishers)
        .chain(&e.disabled_subscribers)
        .find(|n| n.trim().is_empty())
    {
        return Err(invalid(
            "events",
            format!("publisher and subscriber names must not be blank (got {name:?})"),
        ));
    }
    Ok(())
}

fn validate_fsevents(config: &Config) -> ConfigResult<()> {
    if config.fsevents.max_symlink_depth > MAX_SYMLINK_DEPTH {
        return Err(invalid(
            "fsevents.max_symlink_depth",
            format!("max_symlink_depth must be at most {MAX_SYMLINK_DEPTH}"),
        ));
    }
    Ok(())
}

fn validate_file_events(config: &Config) -> ConfigResult<()> {
    let f = &config.file_events;
    for (i, entry) in f.paths.iter().enumerate() {
        if entry.category.trim().is_empty() {
            return Err(invalid(
                format!("file_events.paths[{i}].category"),
                "category must not be empty",
            ));
        }
        if entry.path.as_os_str().is_empty() {
            return Err(invalid(
                format!("file_events.paths[{i}].path"),
                "path must not be empty",
            ));
        }
        if let Some(bad) = entry
            .actions
            .iter()
            .find(|a| !KNOWN_ACTIONS.contains(&a.as_str()))
        {
            return Err(invalid(
                format!("file_events.paths[{i}].actions"),
                format!("unknown action '{bad}'; expected one of: {}", KNOWN_ACTIONS.join(", ")),
            ));
        }
    }
    if f.hash_changed_files && f.max_hash_bytes == 0 {
        return Err(invalid(
            "file_events.max_hash_bytes",
            "max_hash_bytes must be positive when hash_changed_files is enabled",
        ));
    }
    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let l = &config.logging;
    if !matches!(
        l.level.to_ascii_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    ) {
        return Err(invalid(
            "logging.level",
            format!(
                "invalid log level '{}'; expected one of: trace, debug, info, warn, error",
                l.level
            ),
        ));
    }
    if !matches!(l.format.as_str(), "pretty" | "compact" | "json" | "full") {
        return Err(invalid(
            "logging.format",
            format!(
                "invalid log format '{}'; expected one of: pretty, compact, json, full",
                l.format
            ),
        ));
    }
    match l.target.as_str() {
        "stderr" | "stdout" => {},
        "file" => {
            if l.directory.is_none() {
                return Err(invalid(
                    "logging.directory",
                    "directory is required when target = \"file\"",
                ));
            }
        },
        other => {
            return Err(invalid(
                "logging.target",
                format!("invalid log target '{other}'; expected one of: stderr, stdout, file"),
            ));
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::types::FilePathEntry;

    fn field_of(err: ConfigError) -> String {
        match err {
            ConfigError::ValidationError { field, .. } => field,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_symlink_depth_bound() {
        let mut config = Config::default();
        config.fsevents.max_symlink_depth = 65;
        assert_eq!(
            field_of(validate(&config).unwrap_err()),
            "fsevents.max_symlink_depth"
        );
    }

    #[test]
    fn test_unknown_action_rejected() {
        let mut config = Config::default();
        config.file_events.paths.push(FilePathEntry {
            category: "tmp".to_owned(),
            path: PathBuf::from("/tmp"),
            recursive: false,
            actions: vec!["CREATED".to_owned(), "EXPLODED".to_owned()],
        });
        assert_eq!(
            field_of(validate(&config).unwrap_err()),
            "file_events.paths[0].actions"
        );
    }

    #[test]
    fn test_blank_category_rejected() {
        let mut config = Config::default();
        config.file_events.paths.push(FilePathEntry {
            category: " ".to_owned(),
            path: PathBuf::from("/tmp"),
            recursive: true,
            actions: Vec::new(),
        });
        assert_eq!(
            field_of(validate(&config).unwrap_err()),
            "file_events.paths[0].category"
        );
    }

    #[test]
    fn test_file_target_requires_directory() {
        let mut config = Config::default();
        config.logging.target = "file".to_owned();
        assert_eq!(field_of(validate(&config).unwrap_err()), "logging.directory");

        config.logging.directory = Some(PathBuf::from("/var/log/osmon"));
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_bad_log_level_and_format() {
        let mut config = Config::default();
        config.logging.level = "loud".to_owned();
        assert_eq!(field_of(validate(&config).unwrap_err()), "logging.level");

        config.logging.level = "DEBUG".to_owned();
        config.logging.format = "xml".to_owned();
        assert_eq!(field_of(validate(&config).unwrap_err()), "logging.format");
    }
}
