// Runtime Settings
// Timeouts, pool sizing and filesystem locations used by the drivers and backups

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Tunables shared by every driver and the backup service.
///
/// Values come from `Default`, optionally overridden from the environment
/// (`POLYDB_*`) or deserialized from the host application's settings file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DbSettings {
    /// Connection establishment timeout
    pub connect_timeout_secs: u64,
    /// Upper bound for a single query, 0 disables it
    pub query_timeout_secs: u64,
    /// Maximum pooled connections per connection id
    pub pool_size: u32,
    /// Root directory holding one backup folder per connection id
    pub backup_dir: PathBuf,
    /// Directories prepended to PATH when spawning dump/restore tools
    pub extra_tool_paths: Vec<PathBuf>,
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            query_timeout_secs: 300,
            pool_size: 5,
            backup_dir: default_backup_dir(),
            extra_tool_paths: Vec::new(),
        }
    }
}

impl DbSettings {
    /// Defaults with `POLYDB_CONNECT_TIMEOUT_SECS`, `POLYDB_QUERY_TIMEOUT_SECS`,
    /// `POLYDB_POOL_SIZE`, `POLYDB_BACKUP_DIR` and `POLYDB_EXTRA_PATH` applied
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();

        if let Some(secs) = lookup("POLYDB_CONNECT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            settings.connect_timeout_secs = secs;
        }
        if let Some(secs) = lookup("POLYDB_QUERY_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            settings.query_timeout_secs = secs;
        }
        if let Some(size) = lookup("POLYDB_POOL_SIZE").and_then(|v| v.parse::<u32>().ok()) {
            settings.pool_size = size.max(1);
        }
        if let Some(dir) = lookup("POLYDB_BACKUP_DIR").filter(|v| !v.is_empty()) {
            settings.backup_dir = PathBuf::from(dir);
        }
        if let Some(paths) = lookup("POLYDB_EXTRA_PATH") {
            settings.extra_tool_paths = std::env::split_paths(&paths)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
        }

        settings
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        (self.query_timeout_secs > 0).then(|| Duration::from_secs(self.query_timeout_secs))
    }
}

/// `<data dir>/backups`, falling back to the temp dir when no home is available
pub fn default_backup_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "polydb", "polydb")
        .map(|dirs| dirs.data_dir().join("backups"))
        .unwrap_or_else(|| std::env::temp_dir().join("polydb-backups"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = DbSettings::default();
        assert_eq!(settings.connect_timeout(), Duration::from_secs(10));
        assert_eq!(settings.pool_size, 5);
        assert!(settings.backup_dir.ends_with("backups") || settings.backup_dir.ends_with("polydb-backups"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("POLYDB_CONNECT_TIMEOUT_SECS", "3"),
            ("POLYDB_QUERY_TIMEOUT_SECS", "0"),
            ("POLYDB_POOL_SIZE", "0"),
            ("POLYDB_BACKUP_DIR", "/var/backups/polydb"),
        ]);
        let settings = DbSettings::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(settings.connect_timeout_secs, 3);
        assert_eq!(settings.query_timeout(), None);
        assert_eq!(settings.pool_size, 1);
        assert_eq!(settings.backup_dir, PathBuf::from("/var/backups/polydb"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: DbSettings = serde_json::from_str(r#"{"poolSize": 2}"#).unwrap();
        assert_eq!(settings.pool_size, 2);
        assert_eq!(settings.connect_timeout_secs, 10);
    }
}
