//! Config file discovery and layered loading.
//!
//! Implements the `Config::load()` algorithm:
//! 1. Parse `defaults.toml` → base
//! 2. Merge `/etc/osmon/config.toml` (system)
//! 3. Merge `~/.osmon/config.toml` (user)
//! 4. Merge the explicit file, if one was given
//! 5. Apply `OSMON_*` fallbacks for fields no file set
//! 6. Deserialize merged tree → `Config`
//! 7. Validate

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::env::{apply_env_fallbacks, collect_env_vars};
use crate::error::{ConfigError, ConfigResult};
use crate::merge::{SetFields, deep_merge};
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// System-wide config location.
const SYSTEM_CONFIG_PATH: &str = "/etc/osmon/config.toml";

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// A loaded configuration plus where it came from.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The validated configuration.
    pub config: Config,
    /// Files merged into the result, lowest precedence first.
    pub loaded_files: Vec<PathBuf>,
    /// Dotted field paths set by a file or an environment fallback.
    pub set_fields: SetFields,
}

/// Load the configuration with layered file precedence.
///
/// `explicit` is merged last and must exist. `home_override` replaces the
/// user's home directory for user-level discovery.
///
/// # Errors
///
/// Returns a [`ConfigError`] if any config file is unreadable or malformed,
/// or if the merged configuration fails validation.
pub fn load(explicit: Option<&Path>, home_override: Option<&Path>) -> ConfigResult<ResolvedConfig> {
    let home_dir = match home_override {
        Some(h) => h.to_path_buf(),
        None => home_directory()?,
    };
    load_layers(
        Path::new(SYSTEM_CONFIG_PATH),
        &home_dir.join(".osmon").join("config.toml"),
        explicit,
        &collect_env_vars(),
    )
}

/// Layered load over explicit locations and an environment snapshot.
pub(crate) fn load_layers(
    system_path: &Path,
    user_path: &Path,
    explicit: Option<&Path>,
    env_vars: &HashMap<String, String>,
) -> ConfigResult<ResolvedConfig> {
    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;

    let mut set_fields = SetFields::new();
    let mut loaded_files = Vec::new();

    for path in [system_path, user_path] {
        if let Some(overlay) = try_load_file(path)? {
            deep_merge(&mut merged, &overlay, "", &mut set_fields);
            loaded_files.push(path.to_path_buf());
            info!(path = %path.display(), "loaded config");
        }
    }

    if let Some(path) = explicit {
        let overlay = read_value(path)?;
        deep_merge(&mut merged, &overlay, "", &mut set_fields);
        loaded_files.push(path.to_path_buf());
        info!(path = %path.display(), "loaded explicit config");
    }

    let env_count = apply_env_fallbacks(&mut merged, &mut set_fields, env_vars);
    if env_count > 0 {
        debug!(count = env_count, "applied environment variable fallbacks");
    }

    let config: Config =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged config>".to_owned(),
                source: e,
            })?;

    validate::validate(&config)?;

    Ok(ResolvedConfig {
        config,
        loaded_files,
        set_fields,
    })
}

/// Load a config from a specific file path (no layering, no environment).
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read, parsed or validated.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let value = read_value(path)?;
    let config: Config = value
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::ParseError {
            path: path.display().to_string(),
            source: e,
        })?;
    validate::validate(&config)?;
    Ok(config)
}

/// Try to load a file, returning `None` if the file doesn't exist.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    match read_value(path) {
        Ok(v) => Ok(Some(v)),
        Err(ConfigError::ReadError { source, .. })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            debug!(path = %path.display(), "config file not found, skipping");
            Ok(None)
        },
        Err(e) => Err(e),
    }
}

fn read_value(path: &Path) -> ConfigResult<toml::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        source: e,
    })?;

    // Checked after the read so there is no stat/read window.
    let len = u64::try_from(content.len()).unwrap_or(u64::MAX);
    if len > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {len} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit"
            ),
        });
    }

    toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })
}

/// Determine the user's home directory.
fn home_directory() -> ConfigResult<PathBuf> {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .ok_or(ConfigError::NoHomeDir)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::types::RootChangedAction;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_defaults_deserialize_to_default_config() {
        let config: Config = toml::from_str(DEFAULTS_TOML).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_with_no_files_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = load_layers(
            &dir.path().join("system.toml"),
            &dir.path().join("user.toml"),
            None,
            &HashMap::new(),
        )
        .unwrap();

        assert_eq!(resolved.config, Config::default());
        assert!(resolved.loaded_files.is_empty());
        assert!(resolved.set_fields.is_empty());
    }

    #[test]
    fn test_later_layers_win() {
        let dir = tempfile::tempdir().unwrap();
        let system = write(
            dir.path(),
            "system.toml",
            "[events]\njoin_timeout_ms = 1000\n[fsevents]\nmax_symlink_depth = 3\n",
        );
        let user = write(dir.path(), "user.toml", "[events]\njoin_timeout_ms = 2000\n");
        let explicit = write(
            dir.path(),
            "explicit.toml",
            "[fsevents]\nroot_changed = \"ignore\"\n",
        );

        let resolved = load_layers(&system, &user, Some(&explicit), &HashMap::new()).unwrap();

        assert_eq!(resolved.config.events.join_timeout(), Duration::from_secs(2));
        assert_eq!(resolved.config.fsevents.max_symlink_depth, 3);
        assert_eq!(
            resolved.config.fsevents.root_changed,
            RootChangedAction::Ignore
        );
        assert_eq!(resolved.loaded_files, vec![system, user, explicit]);
    }

    #[test]
    fn test_env_only_fills_fields_no_file_set() {
        let dir = tempfile::tempdir().unwrap();
        let user = write(dir.path(), "user.toml", "[logging]\nlevel = \"warn\"\n");
        let env: HashMap<String, String> = [
            ("OSMON_LOG_LEVEL", "trace"),
            ("OSMON_MAX_SYMLINK_DEPTH", "2"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();

        let resolved =
            load_layers(&dir.path().join("missing.toml"), &user, None, &env).unwrap();

        assert_eq!(resolved.config.logging.level, "warn");
        assert_eq!(resolved.config.fsevents.max_symlink_depth, 2);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_layers(
            &dir.path().join("a.toml"),
            &dir.path().join("b.toml"),
            Some(&dir.path().join("nope.toml")),
            &HashMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let bad = write(dir.path(), "bad.toml", "[events\n");
        let err = load_layers(&bad, &dir.path().join("b.toml"), None, &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_oversized_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut content = String::from("# padding\n");
        content.push_str(&"#".repeat(1_100_000));
        let big = write(dir.path(), "big.toml", &content);
        let err = load_file(&big).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn test_load_file_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "c.toml", "[events]\njoin_timeout_ms = 0\n");
        let err = load_file(&path).unwrap_err();
        assert!(
            matches!(err, ConfigError::ValidationError { ref field, .. } if field == "events.join_timeout_ms")
        );
    }

    #[test]
    fn test_load_with_home_override() {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(home.path().join(".osmon")).unwrap();
        write(
            &home.path().join(".osmon"),
            "config.toml",
            "[events]\nmax_buffered_rows = 64\n",
        );

        let resolved = load(None, Some(home.path())).unwrap();
        assert_eq!(resolved.config.events.max_buffered_rows, 64);
        assert!(resolved.set_fields.contains("events.max_buffered_rows"));
    }
}
