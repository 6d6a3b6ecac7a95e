// SQLite Driver
// Implements DbDriver for SQLite using rusqlite. Calls are synchronous and run
// on the blocking pool; cancellation goes through the connection's interrupt handle.

use rusqlite::types::ValueRef;
use rusqlite::{params, Batch, Connection, InterruptHandle, OpenFlags};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::RwLock;

use crate::db::cancel::{signal_all, CancelSlot, PendingQuery, Raced};
use crate::db::sql::{self, count_query, paginate};
use crate::db::traits::{
    ConnectionConfig, DatabaseError, DatabaseType, DbColumn, DbDriver, DbTable, QueryResult, Row,
    TableInfo, TableKind,
};
use crate::settings::DbSettings;

type SharedConnection = Arc<Mutex<Connection>>;

struct SqliteState {
    conn: SharedConnection,
    path: String,
    interrupt: Arc<InterruptHandle>,
}

/// SQLite driver implementation
pub struct SqliteDriver {
    settings: DbSettings,
    state: RwLock<Option<SqliteState>>,
    connected: AtomicBool,
    /// In-flight queries with a flag checked before their statement starts
    cancel: CancelSlot<Arc<AtomicBool>>,
}

/// Rows of the last result set in a script, plus rows changed by the rest
#[derive(Default)]
struct StatementOutput {
    columns: Vec<String>,
    rows: Vec<Row>,
    affected: u64,
}

impl SqliteDriver {
    /// Create a new SQLite driver
    pub fn new(settings: DbSettings) -> Self {
        Self {
            settings,
            state: RwLock::new(None),
            connected: AtomicBool::new(false),
            cancel: CancelSlot::new(),
        }
    }

    /// Extract database path from config, expanding a leading `~/`
    fn database_path(config: &ConnectionConfig) -> Result<String, DatabaseError> {
        let raw = config
            .file_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                DatabaseError::InvalidConfig("SQLite database file path is required".to_string())
            })?;

        let path = match (raw.strip_prefix("~/"), std::env::var_os("HOME")) {
            (Some(rest), Some(home)) => Path::new(&home).join(rest).to_string_lossy().to_string(),
            _ => raw.to_string(),
        };
        Ok(path)
    }

    /// Open SQLite connection
    fn open_connection(path: &str) -> Result<Connection, DatabaseError> {
        Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| DatabaseError::ConnectionFailed(format!("Failed to open SQLite database: {}", e)))
    }

    async fn handle(&self) -> Result<(SharedConnection, String), DatabaseError> {
        let state = self.state.read().await;
        state
            .as_ref()
            .map(|s| (Arc::clone(&s.conn), s.path.clone()))
            .ok_or(DatabaseError::NotConnected)
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, DatabaseError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, DatabaseError> + Send + 'static,
    {
        let (conn, _) = self.handle().await?;
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| DatabaseError::QueryError("SQLite connection lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| DatabaseError::QueryError(format!("SQLite task failed: {}", e)))?
    }

    /// Convert a SQLite value to JSON
    fn json_from_value_ref(value: ValueRef<'_>) -> Value {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::from(i),
            ValueRef::Real(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => Value::from(bytes.to_vec()),
        }
    }

    /// Execute every statement in `sql` in order. The last statement that
    /// yields columns provides the result set.
    fn run_script(conn: &Connection, sql: &str) -> rusqlite::Result<StatementOutput> {
        let changes_before = Self::total_changes(conn)?;
        let mut output = StatementOutput::default();
        let mut batch = Batch::new(conn, sql);
        while let Some(mut stmt) = batch.next()? {
            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            if columns.is_empty() {
                stmt.execute([])?;
                continue;
            }

            let mut out = Vec::new();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let mut record = Row::new();
                for (idx, name) in columns.iter().enumerate() {
                    record.insert(name.clone(), Self::json_from_value_ref(row.get_ref(idx)?));
                }
                out.push(record);
            }
            output.columns = columns;
            output.rows = out;
        }
        // sqlite3_changes() is not reset by DDL, so measure the whole script
        output.affected = Self::total_changes(conn)?.saturating_sub(changes_before);
        Ok(output)
    }

    fn total_changes(conn: &Connection) -> rusqlite::Result<u64> {
        Self::count_rows(conn, "SELECT total_changes()")
    }

    fn count_rows(conn: &Connection, sql: &str) -> rusqlite::Result<u64> {
        conn.query_row(sql, [], |row| row.get::<_, i64>(0))
            .map(|n| n.max(0) as u64)
    }

    fn schema_or_main(schema: Option<&str>) -> String {
        schema.filter(|s| !s.is_empty()).unwrap_or("main").to_string()
    }

    fn index_kind(origin: &str) -> &'static str {
        match origin {
            "pk" => "primary",
            "u" => "unique",
            _ => "btree",
        }
    }

    /// Table names are bound as parameters; only the schema is interpolated
    fn introspect(conn: &Connection, table: &str, schema: &str) -> Result<TableInfo, DatabaseError> {
        let err = |e: rusqlite::Error| DatabaseError::SchemaError(e.to_string());
        let mut info = TableInfo::default();

        let foreign_keys: Vec<String> = {
            let mut stmt = conn
                .prepare(r#"SELECT "from" FROM pragma_foreign_key_list(?1, ?2)"#)
                .map_err(err)?;
            let keys = stmt
                .query_map(params![table, schema], |row| row.get::<_, String>(0))
                .map_err(err)?
                .collect::<Result<_, _>>()
                .map_err(err)?;
            keys
        };

        {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT name, type, "notnull", dflt_value, pk
                    FROM pragma_table_info(?1, ?2)
                    ORDER BY cid
                "#,
                )
                .map_err(err)?;
            info.columns = stmt
                .query_map(params![table, schema], |row| {
                    let name: String = row.get(0)?;
                    let not_null: i64 = row.get(2)?;
                    let pk: i64 = row.get(4)?;
                    Ok(DbColumn {
                        is_foreign_key: foreign_keys.contains(&name),
                        name,
                        data_type: row.get(1)?,
                        nullable: not_null == 0 && pk == 0,
                        is_primary_key: pk > 0,
                        default_value: row.get(3)?,
                    })
                })
                .map_err(err)?
                .collect::<Result<_, _>>()
                .map_err(err)?;
        }

        if info.columns.is_empty() {
            return Err(DatabaseError::SchemaError(format!("Table not found: {}", table)));
        }

        let indexes: Vec<(String, bool, String)> = {
            let mut stmt = conn
                .prepare(r#"SELECT name, "unique", origin FROM pragma_index_list(?1, ?2) ORDER BY seq DESC"#)
                .map_err(err)?;
            let rows = stmt
                .query_map(params![table, schema], |row| {
                    Ok((row.get(0)?, row.get::<_, i64>(1)? != 0, row.get(2)?))
                })
                .map_err(err)?
                .collect::<Result<_, _>>()
                .map_err(err)?;
            rows
        };

        let mut member_stmt = conn
            .prepare("SELECT name FROM pragma_index_info(?1, ?2) ORDER BY seqno")
            .map_err(err)?;
        for (name, unique, origin) in indexes {
            let members: Vec<Option<String>> = member_stmt
                .query_map(params![name, schema], |row| row.get(0))
                .map_err(err)?
                .collect::<Result<_, _>>()
                .map_err(err)?;
            for column in members.into_iter().flatten() {
                info.push_index_column(&name, column, unique, Self::index_kind(&origin));
            }
        }

        let count_sql = format!(
            "SELECT COUNT(*) FROM {}",
            sql::qualified_name(DatabaseType::Sqlite, table, Some(schema))
        );
        info.row_count = Self::count_rows(conn, &count_sql).unwrap_or(0);

        Ok(info)
    }
}

#[async_trait::async_trait]
impl DbDriver for SqliteDriver {
    fn engine(&self) -> DatabaseType {
        DatabaseType::Sqlite
    }

    fn parse_connection_string(&self, uri: &str) -> ConnectionConfig {
        let mut config = ConnectionConfig::new(DatabaseType::Sqlite);
        let trimmed = uri.trim();
        let path = ["sqlite://", "sqlite:", "file://", "file:"]
            .iter()
            .find_map(|prefix| {
                trimmed
                    .get(..prefix.len())
                    .filter(|head| head.eq_ignore_ascii_case(prefix))
                    .map(|_| &trimmed[prefix.len()..])
            })
            .or_else(|| (!trimmed.contains("://")).then_some(trimmed))
            .map(|rest| rest.split('?').next().unwrap_or("").to_string())
            .filter(|p| !p.is_empty());

        config.file_path = path.map(|p| crate::db::uri::decode(&p));
        config
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<(), DatabaseError> {
        config.validate()?;
        let path = Self::database_path(config)?;
        let busy_timeout = self.settings.connect_timeout();

        let open_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Self::open_connection(&open_path)?;
            conn.busy_timeout(busy_timeout)
                .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;
            Ok::<_, DatabaseError>(conn)
        })
        .await
        .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))??;

        let interrupt = Arc::new(conn.get_interrupt_handle());
        let mut state = self.state.write().await;
        *state = Some(SqliteState {
            conn: Arc::new(Mutex::new(conn)),
            path: path.clone(),
            interrupt,
        });
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(path = %path, "SQLite database opened");
        Ok(())
    }

    async fn disconnect(&self) {
        let previous = self.state.write().await.take();
        self.connected.store(false, Ordering::SeqCst);
        if let Some(state) = previous {
            // The handle closes once the last in-flight task drops its clone
            drop(state.conn);
            tracing::info!(path = %state.path, "SQLite database closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn list_databases(&self) -> Result<Vec<String>, DatabaseError> {
        let (_, path) = self.handle().await?;
        let name = Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or(path);
        Ok(vec![name])
    }

    async fn list_schemas(&self) -> Result<Vec<String>, DatabaseError> {
        self.with_conn(|conn| {
            // Query for attached databases
            let mut stmt = conn
                .prepare("SELECT name FROM pragma_database_list() ORDER BY seq")
                .map_err(|e| DatabaseError::QueryError(e.to_string()))?;
            let schemas = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| DatabaseError::QueryError(e.to_string()))?
                .collect::<Result<_, _>>()
                .map_err(|e| DatabaseError::QueryError(e.to_string()))?;
            Ok(schemas)
        })
        .await
    }

    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<DbTable>, DatabaseError> {
        let schema = Self::schema_or_main(schema);
        self.with_conn(move |conn| {
            let query = format!(
                r#"
                SELECT name, type
                FROM {}.sqlite_master
                WHERE type IN ('table', 'view')
                AND name NOT LIKE 'sqlite_%'
                ORDER BY name
            "#,
                sql::quote_ident(DatabaseType::Sqlite, &schema)
            );
            let mut stmt = conn
                .prepare(&query)
                .map_err(|e| DatabaseError::QueryError(e.to_string()))?;
            let entries: Vec<(String, String)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(|e| DatabaseError::QueryError(e.to_string()))?
                .collect::<Result<_, _>>()
                .map_err(|e| DatabaseError::QueryError(e.to_string()))?;

            let tables = entries
                .into_iter()
                .map(|(name, kind)| {
                    let count_sql = format!(
                        "SELECT COUNT(*) FROM {}",
                        sql::qualified_name(DatabaseType::Sqlite, &name, Some(&schema))
                    );
                    DbTable {
                        row_count: Self::count_rows(conn, &count_sql).ok(),
                        name,
                        schema: Some(schema.clone()),
                        table_type: if kind == "view" { TableKind::View } else { TableKind::Table },
                    }
                })
                .collect();
            Ok(tables)
        })
        .await
    }

    async fn get_table_info(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<TableInfo, DatabaseError> {
        let table = table.to_string();
        let schema = Self::schema_or_main(schema);
        self.with_conn(move |conn| Self::introspect(conn, &table, &schema))
            .await
    }

    async fn execute_query(&self, sql: &str, limit: Option<u64>, offset: Option<u64>) -> QueryResult {
        let start = Instant::now();
        let paged = paginate(DatabaseType::Sqlite, sql, limit, offset);
        let total_sql = paged
            .limit_applied
            .then(|| count_query(DatabaseType::Sqlite, sql));

        let raced = self
            .cancel
            .run(|ticket| async move {
                let cancelled = Arc::new(AtomicBool::new(false));
                self.cancel.attach(ticket, Arc::clone(&cancelled)).await;
                self.with_conn(move |conn| {
                    // Interrupting a connection that is not running anything is a no-op
                    if cancelled.load(Ordering::SeqCst) {
                        return Err(DatabaseError::QueryError("Query cancelled".to_string()));
                    }
                    let output = Self::run_script(conn, &paged.sql)
                        .map_err(|e| DatabaseError::QueryError(e.to_string()))?;
                    let total = total_sql.and_then(|q| Self::count_rows(conn, &q).ok());
                    Ok((output, total))
                })
                .await
            })
            .await;

        let elapsed = start.elapsed().as_millis() as u64;
        match raced {
            Raced::Completed(Ok((output, total_rows))) => QueryResult {
                row_count: if output.columns.is_empty() {
                    output.affected
                } else {
                    output.rows.len() as u64
                },
                columns: output.columns,
                rows: output.rows,
                total_rows,
                execution_time_ms: elapsed,
                error: None,
            },
            Raced::Completed(Err(e)) => {
                tracing::debug!(error = %e, "SQLite query failed");
                QueryResult::failed(e.to_string(), elapsed)
            }
            Raced::Cancelled => QueryResult::failed("Query cancelled", elapsed),
        }
    }

    async fn cancel_query(&self) -> bool {
        let pending = self.cancel.take_pending().await;
        if pending.is_empty() {
            return false;
        }
        for flag in pending.iter().filter_map(PendingQuery::hook) {
            flag.store(true, Ordering::SeqCst);
        }
        let interrupt = self.state.read().await.as_ref().map(|s| Arc::clone(&s.interrupt));
        if let Some(interrupt) = interrupt {
            // Stops the running statement; the blocking task then releases the connection
            interrupt.interrupt();
        }
        signal_all(pending)
    }
}
