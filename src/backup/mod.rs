// Backup Module
// Runs native dump/restore tools per connection and keeps a manifest of the results

pub mod command;
pub mod events;
pub mod manifest;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use crate::db::drivers::Driver;
use crate::db::traits::{ConnectionConfig, DatabaseType, DbDriver};
use crate::settings::DbSettings;
use command::{backup_plan, redact, restore_plan, run_step, tool_search_path, DumpScope, ToolPlan};
pub use events::{BackupLogEvent, EventBus, LogKind, Operation};
pub use manifest::BackupManifest;

fn engine_label(engine: &DatabaseType) -> &'static str {
    match engine {
        DatabaseType::Mssql => "SQL Server",
        other => other.display_name(),
    }
}

/// Backup errors
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("{operation} is not supported for {} connections", engine_label(.engine))]
    Unsupported {
        operation: &'static str,
        engine: DatabaseType,
    },

    #[error("No database selected for this connection")]
    MissingDatabase,

    #[error("Backup not found")]
    NotFound,

    #[error("{0}")]
    Tool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Manifest error: {0}")]
    Manifest(String),
}

/// One completed backup as recorded in the manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    pub id: String,
    pub connection_id: String,
    pub connection_name: String,
    pub engine: DatabaseType,
    pub database: String,
    /// Unix epoch milliseconds
    pub timestamp: i64,
    pub file_path: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct BackupOptions {
    pub data_only: bool,
    pub schema_only: bool,
    pub tables: Vec<String>,
    pub environment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<BackupEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    pub success: bool,
    /// `ERROR:` lines reported by the tool on an otherwise successful replay
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Who is being backed up: registry id, display name and connection settings
#[derive(Debug, Clone, Copy)]
pub struct BackupTarget<'a> {
    pub connection_id: &'a str,
    pub connection_name: &'a str,
    pub config: &'a ConnectionConfig,
}

/// Keep file names to one path component
fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "default".to_string(),
        trimmed => trimmed.to_string(),
    }
}

/// `<database>_<ISO-8601 timestamp with : and . replaced by ->.<ext>`
pub fn backup_file_name(database: &str, engine: DatabaseType, at: chrono::DateTime<chrono::Utc>) -> String {
    let stamp = at
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    let ext = if engine == DatabaseType::Mongodb { "archive" } else { "sql" };
    format!("{}_{}.{}", sanitize_component(database), stamp, ext)
}

/// Fill host/port/credentials from a raw connection string, since the
/// command-line tools take discrete flags
fn resolve_config(config: &ConnectionConfig) -> ConnectionConfig {
    if config.host.is_some() || !config.has_connection_string() || config.engine == DatabaseType::Mongodb {
        return config.clone();
    }
    let raw = config.connection_string.as_deref().unwrap_or_default();
    let mut parsed = Driver::for_engine(config.engine, DbSettings::default()).parse_connection_string(raw);
    parsed.connection_string = None;
    parsed.username = parsed.username.or_else(|| config.username.clone());
    parsed.password = parsed.password.or_else(|| config.password.clone());
    parsed.database = config.database.clone().or(parsed.database);
    parsed
}

fn database_name(config: &ConnectionConfig) -> Result<String, BackupError> {
    if config.engine == DatabaseType::Sqlite {
        let path = config.file_path.as_deref().ok_or(BackupError::MissingDatabase)?;
        return Path::new(path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or(BackupError::MissingDatabase);
    }
    config
        .database
        .clone()
        .filter(|d| !d.is_empty())
        .ok_or(BackupError::MissingDatabase)
}

fn is_restore_warning(line: &str) -> bool {
    line.contains("ERROR:")
}

/// Runs backups and restores and owns the per-connection manifests
pub struct BackupService {
    settings: DbSettings,
    events: EventBus,
    manifest_lock: Mutex<()>,
}

impl BackupService {
    pub fn new(settings: DbSettings) -> Self {
        Self {
            settings,
            events: EventBus::new(),
            manifest_lock: Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackupLogEvent> {
        self.events.subscribe()
    }

    pub fn connection_dir(&self, connection_id: &str) -> PathBuf {
        self.settings.backup_dir.join(sanitize_component(connection_id))
    }

    fn manifest_path(&self, connection_id: &str) -> PathBuf {
        BackupManifest::path_in(&self.connection_dir(connection_id))
    }

    /// Run every step of `plan`, streaming redacted stderr as events.
    /// Returns the collected stderr lines when all steps succeed.
    async fn run_plan(&self, plan: &ToolPlan, operation: Operation, name: &str) -> Result<Vec<String>, BackupError> {
        let command_line = redact(&plan.display());
        tracing::info!(connection = %name, operation = ?operation, command = %command_line, "running tool");
        self.events.emit(operation, name, LogKind::Command, command_line);

        let search_path = tool_search_path(&self.settings.extra_tool_paths);
        let mut stderr = Vec::new();
        for step in &plan.steps {
            let output = run_step(step, search_path.as_ref(), |line| {
                self.events.emit(operation, name, LogKind::Stderr, redact(line));
            })
            .await?;

            if !output.success {
                let detail = output
                    .stderr
                    .last()
                    .map(|l| redact(l))
                    .unwrap_or_else(|| match output.status {
                        Some(code) => format!("exited with status {}", code),
                        None => "terminated by signal".to_string(),
                    });
                return Err(BackupError::Tool(format!("{} failed: {}", step.program, detail)));
            }
            stderr.extend(output.stderr);
        }
        Ok(stderr)
    }

    async fn try_backup(&self, target: BackupTarget<'_>, options: &BackupOptions) -> Result<BackupEntry, BackupError> {
        let config = resolve_config(target.config);
        let database = database_name(&config)?;
        let scope = DumpScope {
            data_only: options.data_only,
            schema_only: options.schema_only,
            tables: &options.tables,
        };

        let now = chrono::Utc::now();
        let dir = self.connection_dir(target.connection_id);
        let file = dir.join(backup_file_name(&database, config.engine, now));
        let plan = backup_plan(&config, &database, &scope, &file)?;

        tokio::fs::create_dir_all(&dir).await?;
        if let Err(e) = self.run_plan(&plan, Operation::Backup, target.connection_name).await {
            // Drop the partial dump
            let _ = tokio::fs::remove_file(&file).await;
            return Err(e);
        }

        let size = tokio::fs::metadata(&file).await?.len();
        let entry = BackupEntry {
            id: uuid::Uuid::new_v4().to_string(),
            connection_id: target.connection_id.to_string(),
            connection_name: target.connection_name.to_string(),
            engine: config.engine,
            database,
            timestamp: now.timestamp_millis(),
            file_path: file.to_string_lossy().into_owned(),
            size,
            data_only: options.data_only.then_some(true),
            schema_only: options.schema_only.then_some(true),
            tables: (!options.tables.is_empty()).then(|| options.tables.clone()),
            environment: options.environment.clone(),
        };

        let _guard = self.manifest_lock.lock().await;
        let path = self.manifest_path(target.connection_id);
        let mut manifest = BackupManifest::load(&path);
        manifest.entries.push(entry.clone());
        manifest.save(&path)?;
        Ok(entry)
    }

    /// Dump the target's database into its backup directory
    pub async fn create_backup(&self, target: BackupTarget<'_>, options: &BackupOptions) -> BackupResult {
        match self.try_backup(target, options).await {
            Ok(entry) => {
                let message = format!("Backup written to {} ({} bytes)", entry.file_path, entry.size);
                tracing::info!(connection_id = %target.connection_id, backup_id = %entry.id, "backup complete");
                self.events.emit(Operation::Backup, target.connection_name, LogKind::Success, message);
                BackupResult {
                    success: true,
                    entry: Some(entry),
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(connection_id = %target.connection_id, error = %e, "backup failed");
                self.events
                    .emit(Operation::Backup, target.connection_name, LogKind::Error, e.to_string());
                BackupResult {
                    success: false,
                    entry: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn try_restore(&self, target: BackupTarget<'_>, backup_id: &str) -> Result<u32, BackupError> {
        let entry = {
            let _guard = self.manifest_lock.lock().await;
            BackupManifest::load(&self.manifest_path(target.connection_id))
                .find(backup_id)
                .cloned()
                .ok_or(BackupError::NotFound)?
        };
        let file = PathBuf::from(&entry.file_path);
        if !file.exists() {
            return Err(BackupError::Tool(format!("Backup file is missing: {}", entry.file_path)));
        }

        let config = resolve_config(target.config);
        let database = database_name(&config).unwrap_or_else(|_| entry.database.clone());
        let plan = restore_plan(&config, &database, entry.data_only.unwrap_or(false), &file)?;

        let stderr = self.run_plan(&plan, Operation::Restore, target.connection_name).await?;
        Ok(stderr.iter().filter(|line| is_restore_warning(line)).count() as u32)
    }

    /// Replay backup `backup_id` into the target connection
    pub async fn restore_backup(&self, target: BackupTarget<'_>, backup_id: &str) -> RestoreResult {
        match self.try_restore(target, backup_id).await {
            Ok(warnings) => {
                let message = match warnings {
                    0 => "Restore complete".to_string(),
                    n => format!("Restore complete with {} warnings", n),
                };
                tracing::info!(connection_id = %target.connection_id, backup_id = %backup_id, warnings, "restore complete");
                self.events.emit(Operation::Restore, target.connection_name, LogKind::Success, message);
                RestoreResult {
                    success: true,
                    warnings: (warnings > 0).then_some(warnings),
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(connection_id = %target.connection_id, error = %e, "restore failed");
                self.events
                    .emit(Operation::Restore, target.connection_name, LogKind::Error, e.to_string());
                RestoreResult {
                    success: false,
                    warnings: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Backups whose files still exist, newest first
    pub async fn list_backups(&self, connection_id: &str) -> Vec<BackupEntry> {
        let _guard = self.manifest_lock.lock().await;
        let mut entries: Vec<BackupEntry> = BackupManifest::load(&self.manifest_path(connection_id))
            .entries
            .into_iter()
            .filter(|e| Path::new(&e.file_path).exists())
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries
    }

    async fn try_delete(&self, connection_id: &str, backup_id: &str) -> Result<(), BackupError> {
        let _guard = self.manifest_lock.lock().await;
        let path = self.manifest_path(connection_id);
        let mut manifest = BackupManifest::load(&path);
        let entry = manifest.remove(backup_id).ok_or(BackupError::NotFound)?;

        match tokio::fs::remove_file(&entry.file_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        manifest.save(&path)
    }

    pub async fn delete_backup(&self, connection_id: &str, backup_id: &str) -> DeleteResult {
        match self.try_delete(connection_id, backup_id).await {
            Ok(()) => {
                tracing::info!(connection_id = %connection_id, backup_id = %backup_id, "backup deleted");
                DeleteResult {
                    success: true,
                    error: None,
                }
            }
            Err(e) => DeleteResult {
                success: false,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn service(dir: &tempfile::TempDir) -> BackupService {
        BackupService::new(DbSettings {
            backup_dir: dir.path().to_path_buf(),
            ..DbSettings::default()
        })
    }

    fn entry(id: &str, file_path: &Path, timestamp: i64) -> BackupEntry {
        BackupEntry {
            id: id.to_string(),
            connection_id: "conn".to_string(),
            connection_name: "Local".to_string(),
            engine: DatabaseType::Sqlite,
            database: "app".to_string(),
            timestamp,
            file_path: file_path.to_string_lossy().into_owned(),
            size: 1,
            data_only: None,
            schema_only: None,
            tables: None,
            environment: None,
        }
    }

    fn seed(svc: &BackupService, entries: Vec<BackupEntry>) -> PathBuf {
        let path = svc.manifest_path("conn");
        let manifest = BackupManifest {
            entries,
            ..BackupManifest::default()
        };
        manifest.save(&path).unwrap();
        path
    }

    #[test]
    fn test_backup_file_name() {
        let at = chrono::Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(
            backup_file_name("app", DatabaseType::Postgresql, at),
            "app_2024-03-01T12-30-05-000Z.sql"
        );
        assert_eq!(
            backup_file_name("../shop", DatabaseType::Mongodb, at),
            "_shop_2024-03-01T12-30-05-000Z.archive"
        );
    }

    #[test]
    fn test_resolve_config_from_connection_string() {
        let mut config = ConnectionConfig::new(DatabaseType::Postgresql);
        config.connection_string = Some("postgresql://admin:secret@db:5433/app".to_string());
        let resolved = resolve_config(&config);
        assert_eq!(resolved.host.as_deref(), Some("db"));
        assert_eq!(resolved.port, Some(5433));
        assert_eq!(resolved.password.as_deref(), Some("secret"));
        assert_eq!(database_name(&resolved).unwrap(), "app");
    }

    #[tokio::test]
    async fn test_list_hides_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let kept = dir.path().join("kept.sql");
        std::fs::write(&kept, "-- dump").unwrap();
        seed(
            &svc,
            vec![
                entry("old", &kept, 1),
                entry("gone", &dir.path().join("gone.sql"), 2),
                entry("new", &kept, 3),
            ],
        );

        let ids: Vec<String> = svc.list_backups("conn").await.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["new".to_string(), "old".to_string()]);
        assert!(svc.list_backups("other").await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_unknown_leaves_manifest_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let path = seed(&svc, vec![entry("a", &dir.path().join("a.sql"), 1)]);
        let before = std::fs::read(&path).unwrap();

        let result = svc.delete_backup("conn", "missing").await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Backup not found"));
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_delete_removes_file_and_entry() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let file = dir.path().join("a.sql");
        std::fs::write(&file, "-- dump").unwrap();
        let path = seed(
            &svc,
            vec![entry("a", &file, 1), entry("b", &dir.path().join("b.sql"), 2)],
        );

        assert!(svc.delete_backup("conn", "a").await.success);
        assert!(!file.exists());
        // Missing backing file is tolerated
        assert!(svc.delete_backup("conn", "b").await.success);
        assert!(BackupManifest::load(&path).entries.is_empty());
    }

    #[tokio::test]
    async fn test_mssql_backup_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let mut events = svc.subscribe();
        let mut config = ConnectionConfig::new(DatabaseType::Mssql);
        config.host = Some("sql".to_string());
        config.database = Some("erp".to_string());
        let target = BackupTarget {
            connection_id: "conn",
            connection_name: "ERP",
            config: &config,
        };

        let result = svc.create_backup(target, &BackupOptions::default()).await;
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Backup is not supported for SQL Server connections")
        );

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, LogKind::Error);
        assert_eq!(event.operation, Operation::Backup);
        assert_eq!(event.connection_name, "ERP");
        assert!(!svc.manifest_path("conn").exists());
    }

    #[tokio::test]
    async fn test_restore_unknown_backup() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let mut config = ConnectionConfig::new(DatabaseType::Sqlite);
        config.file_path = Some(dir.path().join("app.db").to_string_lossy().into_owned());
        let target = BackupTarget {
            connection_id: "conn",
            connection_name: "Local",
            config: &config,
        };
        let result = svc.restore_backup(target, "nope").await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Backup not found"));
    }

    #[tokio::test]
    async fn test_restore_waits_for_manifest_writers() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let mut config = ConnectionConfig::new(DatabaseType::Sqlite);
        config.file_path = Some(dir.path().join("app.db").to_string_lossy().into_owned());
        let target = BackupTarget {
            connection_id: "conn",
            connection_name: "Local",
            config: &config,
        };

        let guard = svc.manifest_lock.lock().await;
        let restore = svc.restore_backup(target, "b1");
        tokio::pin!(restore);
        assert!(tokio::time::timeout(std::time::Duration::from_millis(50), &mut restore)
            .await
            .is_err());

        // The entry lands while the restore is queued behind the lock.
        seed(&svc, vec![entry("b1", &dir.path().join("gone.sql"), 1)]);
        drop(guard);

        let result = restore.await;
        assert!(!result.success);
        let error = result.error.unwrap_or_default();
        assert!(error.starts_with("Backup file is missing"), "{error}");
    }

    #[tokio::test]
    async fn test_missing_database_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);
        let mut config = ConnectionConfig::new(DatabaseType::Postgresql);
        config.host = Some("db".to_string());
        let target = BackupTarget {
            connection_id: "conn",
            connection_name: "PG",
            config: &config,
        };
        let result = svc.create_backup(target, &BackupOptions::default()).await;
        assert_eq!(result.error.as_deref(), Some("No database selected for this connection"));
    }

    #[test]
    fn test_restore_warning_lines() {
        assert!(is_restore_warning("psql:/b/app.sql:12: ERROR:  relation \"t\" already exists"));
        assert!(!is_restore_warning("NOTICE:  schema \"public\" does not exist"));
    }
}
