//! Layered TOML merging.

use std::collections::BTreeSet;

/// Dotted paths of every leaf a config file explicitly set.
pub type SetFields = BTreeSet<String>;

/// Deep-merge `overlay` into `base`, recording every leaf the overlay sets.
///
/// Tables merge per key. Scalars and arrays from the overlay replace the base
/// value.
pub fn deep_merge(
    base: &mut toml::Value,
    overlay: &toml::Value,
    prefix: &str,
    set_fields: &mut SetFields,
) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let path = join_path(prefix, key);
                if let Some(base_val) = base_table.get_mut(key) {
                    deep_merge(base_val, overlay_val, &path, set_fields);
                } else {
                    base_table.insert(key.clone(), overlay_val.clone());
                    record_leaves(overlay_val, &path, set_fields);
                }
            }
        },
        (base, overlay) => {
            *base = overlay.clone();
            set_fields.insert(prefix.to_owned());
        },
    }
}

fn record_leaves(val: &toml::Value, prefix: &str, set_fields: &mut SetFields) {
    if let toml::Value::Table(table) = val {
        for (key, child) in table {
            record_leaves(child, &join_path(prefix, key), set_fields);
        }
    } else {
        set_fields.insert(prefix.to_owned());
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_owned()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Set a dotted-path value, creating intermediate tables as needed.
pub(crate) fn set_nested(root: &mut toml::Value, path: &str, value: toml::Value) {
    let mut current = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let toml::Value::Table(table) = current else {
            return;
        };
        if segments.peek().is_none() {
            table.insert(segment.to_owned(), value);
            return;
        }
        current = table
            .entry(segment.to_owned())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> toml::Value {
        toml::from_str(s).unwrap()
    }

    #[test]
    fn test_overlay_replaces_scalars_and_keeps_siblings() {
        let mut base = parse("[events]\njoin_timeout_ms = 3000\nmax_buffered_rows = 0\n");
        let overlay = parse("[events]\njoin_timeout_ms = 500\n");
        let mut set = SetFields::new();

        deep_merge(&mut base, &overlay, "", &mut set);

        assert_eq!(base["events"]["join_timeout_ms"].as_integer(), Some(500));
        assert_eq!(base["events"]["max_buffered_rows"].as_integer(), Some(0));
        assert!(set.contains("events.join_timeout_ms"));
        assert!(!set.contains("events.max_buffered_rows"));
    }

    #[test]
    fn test_new_tables_record_all_leaves() {
        let mut base = parse("");
        let overlay = parse("[logging]\nlevel = \"debug\"\nformat = \"json\"\n");
        let mut set = SetFields::new();

        deep_merge(&mut base, &overlay, "", &mut set);

        assert!(set.contains("logging.level"));
        assert!(set.contains("logging.format"));
    }

    #[test]
    fn test_arrays_replace() {
        let mut base = parse("[events]\ndisabled_publishers = [\"a\", \"b\"]\n");
        let overlay = parse("[events]\ndisabled_publishers = [\"c\"]\n");
        let mut set = SetFields::new();

        deep_merge(&mut base, &overlay, "", &mut set);

        let arr = base["events"]["disabled_publishers"].as_array().unwrap();
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0].as_str(), Some("c"));
    }

    #[test]
    fn test_set_nested_creates_tables() {
        let mut root = parse("");
        set_nested(&mut root, "fsevents.max_symlink_depth", toml::Value::Integer(2));
        assert_eq!(root["fsevents"]["max_symlink_depth"].as_integer(), Some(2));
    }
}
