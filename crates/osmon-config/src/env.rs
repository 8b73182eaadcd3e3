//! Environment variable fallbacks.
//!
//! Environment variables are a fallback, not an override: they only apply to
//! fields that no config file set.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::merge::{SetFields, set_nested};

/// How an environment value is parsed into TOML.
#[derive(Clone, Copy)]
enum ValueKind {
    Str,
    Int,
    Bool,
}

/// Mapping from environment variable name to config field path.
struct EnvMapping {
    var_name: &'static str,
    field_path: &'static str,
    kind: ValueKind,
}

const ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: "OSMON_LOG_LEVEL",
        field_path: "logging.level",
        kind: ValueKind::Str,
    },
    EnvMapping {
        var_name: "OSMON_LOG_FORMAT",
        field_path: "logging.format",
        kind: ValueKind::Str,
    },
    EnvMapping {
        var_name: "OSMON_JOIN_TIMEOUT_MS",
        field_path: "events.join_timeout_ms",
        kind: ValueKind::Int,
    },
    EnvMapping {
        var_name: "OSMON_DISABLE_EVENTS",
        field_path: "events.disable_events",
        kind: ValueKind::Bool,
    },
    EnvMapping {
        var_name: "OSMON_MAX_SYMLINK_DEPTH",
        field_path: "fsevents.max_symlink_depth",
        kind: ValueKind::Int,
    },
];

/// Snapshot every `OSMON_*` variable from the process environment.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with("OSMON_"))
        .collect()
}

/// Apply environment fallbacks to fields no file set.
///
/// Returns the number of fields filled from the environment. Values that do
/// not parse are logged and skipped.
pub fn apply_env_fallbacks(
    merged: &mut toml::Value,
    set_fields: &mut SetFields,
    env_vars: &HashMap<String, String>,
) -> usize {
    let mut applied: usize = 0;
    for mapping in ENV_MAPPINGS {
        let Some(raw) = env_vars.get(mapping.var_name) else {
            continue;
        };
        if set_fields.contains(mapping.field_path) {
            debug!(
                var = mapping.var_name,
                field = mapping.field_path,
                "config file already sets field; ignoring environment"
            );
            continue;
        }
        let Some(value) = parse_value(raw, mapping.kind) else {
            warn!(var = mapping.var_name, value = %raw, "unparseable environment value");
            continue;
        };
        set_nested(merged, mapping.field_path, value);
        set_fields.insert(mapping.field_path.to_owned());
        applied = applied.saturating_add(1);
    }
    applied
}

fn parse_value(raw: &str, kind: ValueKind) -> Option<toml::Value> {
    let raw = raw.trim();
    match kind {
        ValueKind::Str => Some(toml::Value::String(raw.to_owned())),
        ValueKind::Int => raw.parse::<i64>().ok().map(toml::Value::Integer),
        ValueKind::Bool => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(toml::Value::Boolean(true)),
            "0" | "false" | "no" | "off" => Some(toml::Value::Boolean(false)),
            _ => None,
        },
    }
}
