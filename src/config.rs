//! Engine configuration.
//!
//! Defaults are persisted to a per-user config file. Environment variables
//! override any stored values to allow managed deployments to enforce policy.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Every call runs read-only, whatever the caller asks for.
    pub force_read_only: bool,
    pub connect_timeout_ms: u64,
    /// Deadline applied to calls that do not bring their own.
    pub query_timeout_ms: Option<u64>,
    /// Handles unused for this long are closed; 0 keeps them forever.
    pub idle_timeout_secs: u64,
    /// Documents sampled when describing a collection.
    pub sample_size: u32,
    /// Audit entries buffered before new ones are dropped.
    pub audit_queue: usize,
    /// `runCommand` names classified as writes.
    pub mutating_commands: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            force_read_only: false,
            connect_timeout_ms: 15_000,
            query_timeout_ms: None,
            idle_timeout_secs: 1800,
            sample_size: 1000,
            audit_queue: 256,
            mutating_commands: Vec::new(),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value, "Ignoring unparseable config override");
            None
        }
    }
}

/// Per-user application directory (`~/.polyquery`, `%APPDATA%\Polyquery`).
pub fn app_directory() -> PathBuf {
    if cfg!(windows) {
        let appdata = std::env::var_os("APPDATA")
            .unwrap_or_else(|| std::env::var_os("USERPROFILE").unwrap_or_default());
        let mut path = PathBuf::from(appdata);
        path.push("Polyquery");
        path
    } else {
        let home = std::env::var_os("HOME").unwrap_or_default();
        let mut path = PathBuf::from(home);
        path.push(".polyquery");
        path
    }
}

fn config_path() -> PathBuf {
    app_directory().join("config.json")
}

fn load_from_file(path: &Path) -> Option<EngineConfig> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Invalid config file, using defaults");
            None
        }
    }
}

impl EngineConfig {
    /// Applies `POLYQUERY_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("POLYQUERY_FORCE_READ_ONLY") {
            self.force_read_only = parse_bool(&value);
        }
        if let Some(value) = lookup("POLYQUERY_CONNECT_TIMEOUT_MS")
            .and_then(|v| parse_num("POLYQUERY_CONNECT_TIMEOUT_MS", &v))
        {
            self.connect_timeout_ms = value;
        }
        if let Some(value) = lookup("POLYQUERY_QUERY_TIMEOUT_MS")
            .and_then(|v| parse_num::<u64>("POLYQUERY_QUERY_TIMEOUT_MS", &v))
        {
            self.query_timeout_ms = (value > 0).then_some(value);
        }
        if let Some(value) = lookup("POLYQUERY_IDLE_TIMEOUT_SECS")
            .and_then(|v| parse_num("POLYQUERY_IDLE_TIMEOUT_SECS", &v))
        {
            self.idle_timeout_secs = value;
        }
        if let Some(value) = lookup("POLYQUERY_SAMPLE_SIZE")
            .and_then(|v| parse_num("POLYQUERY_SAMPLE_SIZE", &v))
        {
            self.sample_size = value;
        }
        if let Some(value) = lookup("POLYQUERY_AUDIT_QUEUE")
            .and_then(|v| parse_num("POLYQUERY_AUDIT_QUEUE", &v))
        {
            self.audit_queue = value;
        }
    }

    /// File config (or defaults) with process environment overrides.
    pub fn load() -> Self {
        Self::load_from(&config_path(), |key| std::env::var(key).ok())
    }

    pub fn load_from(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = load_from_file(path).unwrap_or_default();
        config.apply_overrides(lookup);
        config
    }

    pub fn save_to_file(&self) -> Result<(), String> {
        self.save_to(&config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        let payload =
            serde_json::to_string_pretty(self).map_err(|e| format!("Save failed: {}", e))?;
        fs::write(path, payload).map_err(|e| format!("Save failed: {}", e))?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = EngineConfig::default();
        config.apply_overrides(lookup(&[
            ("POLYQUERY_FORCE_READ_ONLY", "yes"),
            ("POLYQUERY_QUERY_TIMEOUT_MS", "2500"),
            ("POLYQUERY_IDLE_TIMEOUT_SECS", "0"),
            ("POLYQUERY_SAMPLE_SIZE", "50"),
        ]));

        assert!(config.force_read_only);
        assert_eq!(config.query_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.sample_size, 50);
        assert_eq!(config.connect_timeout_ms, 15_000);
    }

    #[test]
    fn garbage_overrides_are_ignored() {
        let mut config = EngineConfig::default();
        config.apply_overrides(lookup(&[
            ("POLYQUERY_CONNECT_TIMEOUT_MS", "soon"),
            ("POLYQUERY_FORCE_READ_ONLY", "nope"),
        ]));
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join(format!("polyquery-{}", uuid::Uuid::new_v4())).join("config.json");
        let config = EngineConfig::load_from(&path, |_| None);
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn saved_config_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("polyquery-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.json");

        let config = EngineConfig {
            mutating_commands: vec!["dropDatabase".into()],
            audit_queue: 16,
            ..EngineConfig::default()
        };
        config.save_to(&path).unwrap();

        let loaded = EngineConfig::load_from(&path, lookup(&[("POLYQUERY_AUDIT_QUEUE", "32")]));
        assert_eq!(loaded.mutating_commands, vec!["dropDatabase"]);
        assert_eq!(loaded.audit_queue, 32);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn zero_query_timeout_in_file_means_none() {
        let config: EngineConfig = serde_json::from_str(r#"{"query_timeout_ms": 0}"#).unwrap();
        assert_eq!(config.query_timeout(), None);
    }

    #[test]
    fn partial_files_keep_defaults_for_missing_keys() {
        let config: EngineConfig = serde_json::from_str(r#"{"force_read_only": true}"#).unwrap();
        assert!(config.force_read_only);
        assert_eq!(config.idle_timeout_secs, 1800);
    }
}
