//! TOML-based sync configuration.
//!
//! Holds everything a pass needs to know before it starts:
//! - Conflict strategy, batching and retry policy
//! - Lock TTL and per-pass time budget
//! - Calendar listing window
//! - Extension field definitions and overflow policy
//!
//! Configuration is stored at `~/.config/calsync/config.toml`. The engine never
//! reads it directly; [`Config::sync_config`] produces the immutable
//! [`SyncConfig`] it is constructed with.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::data_dir;
use crate::error::ConfigError;
use crate::sync::{
    default_definitions, ConflictStrategy, FieldDefinition, OverflowPolicy, RetryConfig,
    SyncConfig,
};

/// Pass-level behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    #[serde(default)]
    pub strategy: ConflictStrategy,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// 0 disables the budget.
    #[serde(default = "default_time_budget_secs")]
    pub time_budget_secs: u64,
}

/// Calendar side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarSection {
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    #[serde(default = "default_lookahead_days")]
    pub lookahead_days: u32,
    /// Event file used by the CLI, relative to the data directory.
    #[serde(default = "default_calendar_file")]
    pub file: String,
}

/// Sheet side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetSection {
    /// Row file used by the CLI, relative to the data directory.
    #[serde(default = "default_sheet_file")]
    pub file: String,
}

/// Extension fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldsSection {
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    #[serde(default = "default_definitions")]
    pub definitions: Vec<FieldDefinition>,
}

/// Application configuration.
///
/// Serialized to/from TOML at `~/.config/calsync/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub calendar: CalendarSection,
    #[serde(default)]
    pub sheet: SheetSection,
    #[serde(default)]
    pub fields: FieldsSection,
}

// Default functions
fn default_batch_size() -> usize {
    50
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_retry_delay_ms() -> u64 {
    30_000
}
fn default_lock_ttl_secs() -> u64 {
    360
}
fn default_time_budget_secs() -> u64 {
    300
}
fn default_lookback_days() -> u32 {
    30
}
fn default_lookahead_days() -> u32 {
    365
}
fn default_calendar_file() -> String {
    "calendar.json".into()
}
fn default_sheet_file() -> String {
    "sheet.json".into()
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            strategy: ConflictStrategy::default(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            lock_ttl_secs: default_lock_ttl_secs(),
            time_budget_secs: default_time_budget_secs(),
        }
    }
}

impl Default for CalendarSection {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            lookahead_days: default_lookahead_days(),
            file: default_calendar_file(),
        }
    }
}

impl Default for SheetSection {
    fn default() -> Self {
        Self {
            file: default_sheet_file(),
        }
    }
}

impl Default for FieldsSection {
    fn default() -> Self {
        Self {
            overflow_policy: OverflowPolicy::default(),
            definitions: default_definitions(),
        }
    }
}

/// Relative paths are taken from `dir`.
fn resolve_in(dir: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}

impl CalendarSection {
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        resolve_in(dir, &self.file)
    }
}

impl SheetSection {
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        resolve_in(dir, &self.file)
    }
}

impl Config {
    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let unknown = || ConfigError::UnknownKey(key.to_string());
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };

        if key.is_empty() {
            return Err(unknown());
        }

        let mut parts = key.split('.').peekable();
        let mut current = root;
        while let Some(part) = parts.next() {
            if parts.peek().is_some() {
                current = current.get_mut(part).ok_or_else(unknown)?;
                continue;
            }

            let obj = current.as_object_mut().ok_or_else(unknown)?;
            let existing = obj.get(part).ok_or_else(unknown)?;

            let new_value = match existing {
                serde_json::Value::Bool(_) => value
                    .parse::<bool>()
                    .map(serde_json::Value::Bool)
                    .map_err(|e| invalid(e.to_string()))?,
                serde_json::Value::Number(_) => {
                    if let Ok(n) = value.parse::<u64>() {
                        serde_json::Value::Number(n.into())
                    } else if let Ok(n) = value.parse::<f64>() {
                        serde_json::Number::from_f64(n)
                            .map(serde_json::Value::Number)
                            .ok_or_else(|| invalid(format!("cannot parse '{value}' as number")))?
                    } else {
                        return Err(invalid(format!("cannot parse '{value}' as number")));
                    }
                }
                serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                    serde_json::from_str(value).map_err(|e| invalid(e.to_string()))?
                }
                _ => serde_json::Value::String(value.into()),
            };

            obj.insert(part.to_string(), new_value);
            return Ok(());
        }

        Err(unknown())
    }

    /// `config.toml` inside the data directory.
    pub fn path() -> Result<PathBuf, ConfigError> {
        Ok(data_dir()?.join("config.toml"))
    }

    /// Load from the default location, writing defaults if no file exists yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed,
    /// or if the default config cannot be written to disk.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            let cfg = Self::default();
            cfg.save_to(&path)?;
            Ok(cfg)
        }
    }

    /// Load from an explicit path. Missing sections and keys take defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::LoadFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Persist to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::path()?)
    }

    /// Persist to an explicit path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let save_failed = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_failed(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| save_failed(e.to_string()))
    }

    /// Load from disk, returning default on error.
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a value by dot-separated key. The change is only kept if the
    /// whole config still deserializes; callers decide when to save.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut json = serde_json::to_value(&*self).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        *self = serde_json::from_value(json).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    /// Flattened `key = value` pairs for every leaf, sorted by key.
    pub fn entries(&self) -> Vec<(String, String)> {
        fn walk(prefix: &str, value: &serde_json::Value, out: &mut Vec<(String, String)>) {
            match value {
                serde_json::Value::Object(map) => {
                    for (k, v) in map {
                        let key = if prefix.is_empty() {
                            k.clone()
                        } else {
                            format!("{prefix}.{k}")
                        };
                        walk(&key, v, out);
                    }
                }
                serde_json::Value::String(s) => out.push((prefix.to_string(), s.clone())),
                other => out.push((prefix.to_string(), other.to_string())),
            }
        }

        let mut out = Vec::new();
        if let Ok(json) = serde_json::to_value(self) {
            walk("", &json, &mut out);
        }
        out.sort();
        out
    }

    /// Immutable engine configuration.
    pub fn sync_config(&self) -> SyncConfig {
        let s = &self.sync;
        SyncConfig {
            strategy: s.strategy,
            batch_size: s.batch_size.max(1),
            retry: RetryConfig {
                max_retries: s.max_retries,
                initial_delay: Duration::from_millis(s.retry_delay_ms),
                backoff_multiplier: s.backoff_multiplier,
                max_delay: Duration::from_millis(s.max_retry_delay_ms),
            },
            lock_ttl: Duration::from_secs(s.lock_ttl_secs),
            time_budget: (s.time_budget_secs > 0).then(|| Duration::from_secs(s.time_budget_secs)),
            lookback_days: self.calendar.lookback_days,
            lookahead_days: self.calendar.lookahead_days,
            fields: self.fields.definitions.clone(),
            overflow_policy: self.fields.overflow_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::FieldType;

    #[test]
    fn default_config_roundtrip() {
        let cfg = Config::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.sync.batch_size, 50);
        assert_eq!(parsed.calendar.lookahead_days, 365);
        assert_eq!(parsed.fields.definitions, default_definitions());
    }

    #[test]
    fn get_supports_dot_path_keys() {
        let cfg = Config::default();
        assert_eq!(cfg.get("sync.strategy").as_deref(), Some("last_write_wins"));
        assert_eq!(cfg.get("sync.lock_ttl_secs").as_deref(), Some("360"));
        assert_eq!(cfg.get("sheet.file").as_deref(), Some("sheet.json"));
        assert!(cfg.get("sync.missing_key").is_none());
        assert!(cfg.get("").is_none());
    }

    #[test]
    fn set_json_value_by_path_updates_nested_number() {
        let mut json = serde_json::to_value(Config::default()).unwrap();
        Config::set_json_value_by_path(&mut json, "sync.batch_size", "10").unwrap();
        assert_eq!(
            Config::get_json_value_by_path(&json, "sync.batch_size").unwrap(),
            &serde_json::Value::Number(10.into())
        );
    }

    #[test]
    fn set_json_value_by_path_updates_nested_string() {
        let mut json = serde_json::to_value(Config::default()).unwrap();
        Config::set_json_value_by_path(&mut json, "calendar.file", "team.json").unwrap();
        assert_eq!(
            Config::get_json_value_by_path(&json, "calendar.file").unwrap(),
            &serde_json::Value::String("team.json".to_string())
        );
    }

    #[test]
    fn set_json_value_by_path_rejects_unknown_key() {
        let mut json = serde_json::to_value(Config::default()).unwrap();
        let result = Config::set_json_value_by_path(&mut json, "sync.nonexistent_key", "1");
        assert!(matches!(result, Err(ConfigError::UnknownKey(_))));
    }

    #[test]
    fn set_json_value_by_path_rejects_invalid_number() {
        let mut json = serde_json::to_value(Config::default()).unwrap();
        let result = Config::set_json_value_by_path(&mut json, "sync.max_retries", "lots");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn set_parses_enums_through_serde() {
        let mut cfg = Config::default();
        cfg.set("sync.strategy", "sheets_wins").unwrap();
        assert_eq!(cfg.sync.strategy, ConflictStrategy::SheetsWins);

        cfg.set("fields.overflow_policy", "clamp").unwrap();
        assert_eq!(cfg.fields.overflow_policy, OverflowPolicy::Clamp);

        let err = cfg.set("sync.strategy", "coin_flip").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert_eq!(cfg.sync.strategy, ConflictStrategy::SheetsWins);
    }

    #[test]
    fn set_rejects_fraction_for_integer_field() {
        let mut cfg = Config::default();
        assert!(cfg.set("sync.batch_size", "2.5").is_err());
        assert_eq!(cfg.sync.batch_size, 50);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [sync]
            strategy = "calendar_wins"
            time_budget_secs = 0

            [fields]
            overflow_policy = "clamp"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.sync.strategy, ConflictStrategy::CalendarWins);
        assert_eq!(cfg.sync.max_retries, 3);
        assert_eq!(cfg.calendar.lookahead_days, 365);
        assert_eq!(cfg.fields.definitions.len(), 2);

        let sync = cfg.sync_config();
        assert!(sync.time_budget.is_none());
        assert_eq!(sync.overflow_policy, OverflowPolicy::Clamp);
    }

    #[test]
    fn field_definitions_parse_from_toml_tables() {
        let cfg: Config = toml::from_str(
            r#"
            [[fields.definitions]]
            name = "effort"
            slot = "Effort"
            type = "number"
            min = 0
            max = 8
            default = "1"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.fields.definitions.len(), 1);
        let def = &cfg.fields.definitions[0];
        assert_eq!(def.field_type, FieldType::Number);
        assert_eq!(def.max, Some(8.0));
        assert_eq!(def.max_length, None);
    }

    #[test]
    fn sync_config_carries_retry_and_window() {
        let mut cfg = Config::default();
        cfg.sync.retry_delay_ms = 250;
        cfg.sync.batch_size = 0;
        cfg.calendar.lookback_days = 7;

        let sync = cfg.sync_config();
        assert_eq!(sync.retry.initial_delay, Duration::from_millis(250));
        assert_eq!(sync.retry.max_delay, Duration::from_secs(30));
        assert_eq!(sync.batch_size, 1);
        assert_eq!(sync.lookback_days, 7);
        assert_eq!(sync.time_budget, Some(Duration::from_secs(300)));
    }

    #[test]
    fn unused_side_keys_are_ignored_on_load_and_rejected_on_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[calendar]\ncalendar_id = \"team\"\nlookback_days = 3\n").unwrap();

        let mut cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.calendar.lookback_days, 3);
        assert!(cfg.get("calendar.calendar_id").is_none());
        assert!(matches!(
            cfg.set("sheet.sheet_name", "Roster"),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn save_to_and_load_from_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut cfg = Config::default();
        cfg.set("sheet.file", "roster.json").unwrap();
        cfg.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.sheet.file, "roster.json");
        assert_eq!(loaded.fields.definitions, cfg.fields.definitions);
    }

    #[test]
    fn load_from_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sync\nbatch_size = ").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::LoadFailed { .. }));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn entries_lists_leaf_keys() {
        let entries = Config::default().entries();
        assert!(entries.contains(&("sync.batch_size".to_string(), "50".to_string())));
        assert!(entries.contains(&("calendar.file".to_string(), "calendar.json".to_string())));
        assert!(entries.iter().any(|(k, _)| k == "fields.definitions"));
    }

    #[test]
    fn relative_files_resolve_inside_data_dir() {
        let cfg = Config::default();
        let dir = Path::new("/tmp/calsync");
        assert_eq!(cfg.calendar.path_in(dir), dir.join("calendar.json"));

        let mut sheet = cfg.sheet.clone();
        sheet.file = "/srv/sheet.json".into();
        assert_eq!(sheet.path_in(dir), PathBuf::from("/srv/sheet.json"));
    }
}
