// Database Driver Traits
// Defines the core abstraction shared by every database engine

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Supported database engines
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Postgresql,
    Mysql,
    Mssql,
    Mongodb,
    Sqlite,
}

impl DatabaseType {
    /// Display name for logs and messages
    pub fn display_name(&self) -> &'static str {
        match self {
            DatabaseType::Postgresql => "PostgreSQL",
            DatabaseType::Mysql => "MySQL",
            DatabaseType::Mssql => "Microsoft SQL Server",
            DatabaseType::Mongodb => "MongoDB",
            DatabaseType::Sqlite => "SQLite",
        }
    }

    /// Default port for the engine
    pub fn default_port(&self) -> u16 {
        match self {
            DatabaseType::Postgresql => 5432,
            DatabaseType::Mysql => 3306,
            DatabaseType::Mssql => 1433,
            DatabaseType::Mongodb => 27017,
            DatabaseType::Sqlite => 0, // File-based, no port
        }
    }

    /// Lowercase tag used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Postgresql => "postgresql",
            DatabaseType::Mysql => "mysql",
            DatabaseType::Mssql => "mssql",
            DatabaseType::Mongodb => "mongodb",
            DatabaseType::Sqlite => "sqlite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common database error type
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Query execution error: {0}")]
    QueryError(String),

    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error("Schema error: {0}")]
    SchemaError(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Connection settings for one connection attempt.
///
/// A `connection_string`, when present, takes precedence over the discrete
/// host/port/credential fields. Values are never mutated once a driver has
/// been handed the config; reconnecting builds a new one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub engine: DatabaseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<bool>,
}

impl ConnectionConfig {
    /// Minimal config carrying only the engine tag
    pub fn new(engine: DatabaseType) -> Self {
        Self {
            engine,
            host: None,
            port: None,
            username: None,
            password: None,
            database: None,
            file_path: None,
            connection_string: None,
            ssl: None,
        }
    }

    /// Port, falling back to the engine default
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or_else(|| self.engine.default_port())
    }

    pub fn ssl_enabled(&self) -> bool {
        self.ssl.unwrap_or(false)
    }

    pub fn has_connection_string(&self) -> bool {
        self.connection_string
            .as_deref()
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false)
    }

    /// Check that every field the engine needs is present. Runs before any I/O.
    pub fn validate(&self) -> Result<(), DatabaseError> {
        match self.engine {
            DatabaseType::Sqlite => {
                if self.file_path.as_deref().map(str::is_empty).unwrap_or(true) {
                    return Err(DatabaseError::InvalidConfig(
                        "SQLite database file path is required".to_string(),
                    ));
                }
            }
            DatabaseType::Postgresql
            | DatabaseType::Mysql
            | DatabaseType::Mssql
            | DatabaseType::Mongodb => {
                if !self.has_connection_string()
                    && self.host.as_deref().map(str::is_empty).unwrap_or(true)
                {
                    return Err(DatabaseError::InvalidConfig(
                        "Host or connection string is required".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Table, view or collection as reported by `list_tables`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DbTable {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(rename = "type")]
    pub table_type: TableKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Table,
    View,
    Collection,
}

/// Column metadata from schema introspection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DbColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
    pub is_primary_key: bool,
    pub is_foreign_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

/// Index metadata; one entry per index name with member columns in definition order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DbIndex {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    #[serde(rename = "type")]
    pub index_type: String,
}

/// Structure of a single table
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub columns: Vec<DbColumn>,
    pub indexes: Vec<DbIndex>,
    pub row_count: u64,
}

impl TableInfo {
    /// Append `column` to the index named `name`, creating the entry on first sight
    pub fn push_index_column(&mut self, name: &str, column: String, unique: bool, index_type: &str) {
        match self.indexes.iter_mut().find(|idx| idx.name == name) {
            Some(idx) => idx.columns.push(column),
            None => self.indexes.push(DbIndex {
                name: name.to_string(),
                columns: vec![column],
                unique,
                index_type: index_type.to_string(),
            }),
        }
    }
}

/// A result row keyed by column name
pub type Row = Map<String, Value>;

/// Query result in the shape shared by all engines.
///
/// Failures are values: a non-empty `error` comes with zeroed rows and columns,
/// never as an `Err`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub row_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<u64>,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResult {
    pub fn failed(error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            execution_time_ms,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Database driver trait - all engines implement this
#[async_trait::async_trait]
pub trait DbDriver: Send + Sync {
    // --- Metadata ---
    /// The engine this driver speaks to
    fn engine(&self) -> DatabaseType;

    /// Default port for the engine
    fn default_port(&self) -> u16 {
        self.engine().default_port()
    }

    /// Build a config from a connection URI. Never fails: unparseable input
    /// yields a config carrying only the engine tag.
    fn parse_connection_string(&self, uri: &str) -> ConnectionConfig;

    // --- Connection Management ---
    /// Open the underlying pool/client and check it before returning
    async fn connect(&self, config: &ConnectionConfig) -> Result<(), DatabaseError>;

    /// Release all native resources. Safe to call repeatedly.
    async fn disconnect(&self);

    /// Local-state liveness check, no round trip
    fn is_connected(&self) -> bool;

    // --- Schema Metadata ---
    async fn list_databases(&self) -> Result<Vec<String>, DatabaseError>;

    async fn list_schemas(&self) -> Result<Vec<String>, DatabaseError>;

    /// Tables, views or collections sorted by name
    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<DbTable>, DatabaseError>;

    async fn get_table_info(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<TableInfo, DatabaseError>;

    // --- Query Execution ---
    /// Run a query; execution failures are reported through `QueryResult::error`
    async fn execute_query(&self, sql: &str, limit: Option<u64>, offset: Option<u64>) -> QueryResult;

    /// Best-effort cancellation of every in-flight query on this connection.
    /// Returns whether any query was running.
    async fn cancel_query(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports_are_distinct() {
        let ports = [
            DatabaseType::Postgresql.default_port(),
            DatabaseType::Mysql.default_port(),
            DatabaseType::Mssql.default_port(),
            DatabaseType::Mongodb.default_port(),
        ];
        assert_eq!(ports, [5432, 3306, 1433, 27017]);
        assert_eq!(DatabaseType::Sqlite.default_port(), 0);
    }

    #[test]
    fn test_config_json_shape() {
        let json = r#"{"engine":"sqlite","filePath":"/tmp/a.db"}"#;
        let config: ConnectionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.engine, DatabaseType::Sqlite);
        assert_eq!(config.file_path.as_deref(), Some("/tmp/a.db"));
        assert_eq!(serde_json::to_string(&config).unwrap(), json);
    }

    #[test]
    fn test_sqlite_requires_file_path() {
        let config = ConnectionConfig::new(DatabaseType::Sqlite);
        assert!(matches!(config.validate(), Err(DatabaseError::InvalidConfig(_))));
    }

    #[test]
    fn test_network_engine_accepts_connection_string_without_host() {
        let mut config = ConnectionConfig::new(DatabaseType::Mongodb);
        assert!(config.validate().is_err());
        config.connection_string = Some("mongodb://localhost".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_port_or_default() {
        let mut config = ConnectionConfig::new(DatabaseType::Mysql);
        assert_eq!(config.port_or_default(), 3306);
        config.port = Some(3307);
        assert_eq!(config.port_or_default(), 3307);
    }

    #[test]
    fn test_push_index_column_groups_by_name() {
        let mut info = TableInfo::default();
        info.push_index_column("idx_ab", "a".to_string(), true, "btree");
        info.push_index_column("idx_c", "c".to_string(), false, "btree");
        info.push_index_column("idx_ab", "b".to_string(), true, "btree");
        assert_eq!(info.indexes.len(), 2);
        assert_eq!(info.indexes[0].columns, vec!["a", "b"]);
    }

    #[test]
    fn test_failed_result_is_zeroed() {
        let result = QueryResult::failed("boom", 12);
        assert_eq!(result.row_count, 0);
        assert!(result.rows.is_empty() && result.columns.is_empty());
        assert_eq!(result.execution_time_ms, 12);
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_table_serializes_type_field() {
        let table = DbTable {
            name: "t".to_string(),
            schema: Some("main".to_string()),
            table_type: TableKind::Table,
            row_count: Some(0),
        };
        let json = serde_json::to_value(&table).unwrap();
        assert_eq!(json, serde_json::json!({"name": "t", "schema": "main", "type": "table", "rowCount": 0}));
    }
}
