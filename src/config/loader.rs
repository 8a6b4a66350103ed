//! Config loading: deep merge over defaults, `${VAR}` substitution, and
//! the sidecar env file.
//!
//! Merge semantics: objects merge key by key, everything else (including
//! arrays) is replaced by the override. Substitution resolves `${VAR}`
//! from the process environment first, then the sidecar file; unknown
//! variables become the empty string. The sidecar never overrides real
//! environment variables.

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::schema::Config;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("config is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Merges `overlay` into `base`. Objects merge recursively; arrays and
/// scalars are replaced whole.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

/// Replaces every `${VAR}` in every string of the tree.
pub fn substitute_env(value: &mut Value, lookup: &dyn Fn(&str) -> Option<String>) {
    match value {
        Value::String(s) => {
            if s.contains("${") {
                *s = expand(s, lookup);
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute_env(item, lookup);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                substitute_env(item, lookup);
            }
        }
        _ => {}
    }
}

fn expand(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                match lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        debug!(var = %name, "Unset variable in config, substituting empty");
                    }
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                // Unterminated ${: keep it literally.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Parses `KEY=VALUE` lines: `export ` prefixes are ignored, surrounding
/// matching quotes stripped, blank and `#` lines skipped, lines without
/// `=` skipped, later `=` characters preserved in the value.
pub fn parse_env_file(content: &str) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = strip_matching_quotes(value);
        vars.push((key.to_string(), value.to_string()));
    }
    vars
}

fn strip_matching_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Loads the sidecar env file into a map. Missing file is not an error.
fn load_env_file(path: &Path) -> HashMap<String, String> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_env_file(&content).into_iter().collect(),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No env file loaded");
            HashMap::new()
        }
    }
}

/// Loads, merges, substitutes and validates the config at `path`.
/// A missing file yields the validated defaults.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let user_value: Value = match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Config file not found, using defaults");
            Value::Object(serde_json::Map::new())
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            });
        }
    };

    load_from_value(user_value, path)
}

/// Same pipeline for an already-parsed JSON value (webhook tests, etc.).
pub fn load_from_value(user_value: Value, config_path: &Path) -> Result<Config, ConfigError> {
    let mut merged = serde_json::to_value(Config::default())?;
    deep_merge(&mut merged, user_value);

    // The env file named by the (pre-substitution) config is consulted as
    // a fallback source; real environment variables always win.
    let env_file_vars = merged
        .pointer("/secrets/env_file")
        .and_then(Value::as_str)
        .map(|name| {
            let sidecar = config_path
                .parent()
                .map(|dir| dir.join(name))
                .unwrap_or_else(|| Path::new(name).to_path_buf());
            load_env_file(&sidecar)
        })
        .unwrap_or_default();

    substitute_env(&mut merged, &|name| {
        std::env::var(name)
            .ok()
            .or_else(|| env_file_vars.get(name).cloned())
    });

    let config: Config = serde_json::from_value(merged)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deep_merge_objects() {
        let mut base = json!({"a": {"x": 1, "y": 2}, "b": 3});
        deep_merge(&mut base, json!({"a": {"y": 9}, "c": 4}));
        assert_eq!(base, json!({"a": {"x": 1, "y": 9}, "b": 3, "c": 4}));
    }

    #[test]
    fn test_deep_merge_replaces_arrays() {
        let mut base = json!({"list": [1, 2, 3]});
        deep_merge(&mut base, json!({"list": [9]}));
        assert_eq!(base, json!({"list": [9]}));
    }

    #[test]
    fn test_substitution_resolves_and_blanks() {
        let mut value = json!({"token": "${PRESENT_TOKEN}", "missing": "x${ABSENT_VAR_42}y"});
        substitute_env(&mut value, &|name| {
            (name == "PRESENT_TOKEN").then(|| "sekrit".to_string())
        });
        assert_eq!(value["token"], "sekrit");
        assert_eq!(value["missing"], "xy");
    }

    #[test]
    fn test_substitution_multiple_in_one_string() {
        let mut value = json!("${A}-${B}");
        substitute_env(&mut value, &|name| Some(name.to_lowercase()));
        assert_eq!(value, "a-b");
    }

    #[test]
    fn test_unterminated_placeholder_kept() {
        let mut value = json!("prefix ${OOPS");
        substitute_env(&mut value, &|_| Some("never".into()));
        assert_eq!(value, "prefix ${OOPS");
    }

    #[test]
    fn test_env_file_parsing_rules() {
        let content = r#"
# comment line
export TOKEN=abc
QUOTED="hello world"
SINGLE='quoted too'
EQUALS=a=b=c
noequals
  SPACED  =  padded
"#;
        let vars: HashMap<_, _> = parse_env_file(content).into_iter().collect();
        assert_eq!(vars["TOKEN"], "abc");
        assert_eq!(vars["QUOTED"], "hello world");
        assert_eq!(vars["SINGLE"], "quoted too");
        assert_eq!(vars["EQUALS"], "a=b=c");
        assert_eq!(vars["SPACED"], "padded");
        assert!(!vars.contains_key("noequals"));
        assert_eq!(vars.len(), 5);
    }

    #[test]
    fn test_mismatched_quotes_kept() {
        let vars: HashMap<_, _> = parse_env_file("K=\"half").into_iter().collect();
        assert_eq!(vars["K"], "\"half");
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let config = load_config(Path::new("/definitely/not/here.json")).unwrap();
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_load_rejects_bad_port() {
        let err = load_from_value(json!({"gateway": {"port": 99999}}), Path::new("c.json"))
            .unwrap_err();
        assert!(err.to_string().contains("gateway.port out of range"));
    }

    #[test]
    fn test_load_rejects_bad_enum() {
        let err = load_from_value(
            json!({"observability": {"log_level": "loud"}}),
            Path::new("c.json"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("observability.log_level"));
    }

    #[test]
    fn test_arrays_replaced_on_override() {
        let config = load_from_value(
            json!({"security": {"blocked_commands": ["only-this"]}}),
            Path::new("c.json"),
        )
        .unwrap();
        assert_eq!(config.security.blocked_commands, vec!["only-this"]);
    }

    #[test]
    fn test_env_file_fallback_and_priority() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gateway.env"), "FROM_FILE_ONLY=file-value\n").unwrap();
        let config_path = dir.path().join("config.json");

        let config = load_from_value(
            json!({
                "secrets": {"env_file": "gateway.env"},
                "agent": {"model": "${FROM_FILE_ONLY}"}
            }),
            &config_path,
        )
        .unwrap();
        assert_eq!(config.agent.model, "file-value");
    }

    #[test]
    fn test_full_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"gateway": {"port": 9100}, "autonomy": {"level": "full"}}"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.gateway.port, 9100);
        assert_eq!(config.autonomy.level, "full");
    }
}
