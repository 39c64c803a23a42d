//! Unknown-key detection for `vitalstream.toml`
//!
//! serde ignores keys it does not know, so a misspelled option silently
//! falls back to its default. These checks run before deserialization and
//! only produce warnings.

use std::collections::HashSet;

/// Every key path the config file understands.
const KNOWN_KEYS: &[&str] = &[
    "server",
    "server.addr",
    "storage",
    "storage.data_dir",
    "storage.flush_each_append",
    "rolling_buffer",
    "rolling_buffer.capacity",
    "rolling_buffer.max_age_secs",
    "rolling_buffer.cleanup_interval_secs",
    "trials",
    "trials.end_timeout_secs",
    "trials.dedupe_device_timestamps",
    "ingest",
    "ingest.max_message_bytes",
];

/// All dotted key paths in a TOML document, tables included.
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(table) = value.as_table() {
        for (k, v) in table {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            keys.push(path.clone());
            if v.is_table() {
                keys.extend(walk_toml_keys(v, &path));
            }
        }
    }
    keys
}

/// Keys present in `raw_toml` that no config field reads.
pub fn unknown_keys(raw_toml: &str) -> Vec<String> {
    let Ok(value) = raw_toml.parse::<toml::Value>() else {
        return Vec::new(); // parse errors are reported by serde
    };
    let known: HashSet<&str> = KNOWN_KEYS.iter().copied().collect();
    walk_toml_keys(&value, "")
        .into_iter()
        .filter(|key| !known.contains(key.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_keys_flagged() {
        let raw = r#"
            [rolling_buffer]
            capacity = 30
            max_age = 10

            [trial]
            end_timeout_secs = 5
        "#;
        let unknown = unknown_keys(raw);
        assert!(unknown.contains(&"rolling_buffer.max_age".to_string()));
        assert!(unknown.contains(&"trial".to_string()));
        assert!(!unknown.contains(&"rolling_buffer.capacity".to_string()));
    }

    #[test]
    fn test_known_keys_clean() {
        let raw = "[server]\naddr = \"127.0.0.1:9000\"\n[ingest]\nmax_message_bytes = 1024\n";
        assert!(unknown_keys(raw).is_empty());
    }
}
