// MySQL Driver
// Implements DbDriver for MySQL and MariaDB using an sqlx pool

use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::{Column, MySqlPool, Row as _, TypeInfo};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::RwLock;

use crate::db::cancel::{signal_all, with_deadline, CancelSlot, PendingQuery, QueryTicket, Raced};
use crate::db::sql::{self, count_query, paginate};
use crate::db::traits::{
    ConnectionConfig, DatabaseError, DatabaseType, DbColumn, DbDriver, DbTable, QueryResult, Row,
    TableInfo, TableKind,
};
use crate::db::uri;
use crate::settings::DbSettings;

/// MySQL driver implementation
pub struct MysqlDriver {
    settings: DbSettings,
    pool: RwLock<Option<MySqlPool>>,
    connected: AtomicBool,
    /// In-flight queries with the server thread id of their connection
    cancel: CancelSlot<u64>,
}

struct StatementOutput {
    columns: Vec<String>,
    rows: Vec<Row>,
    affected: u64,
}

impl MysqlDriver {
    /// Create a new MySQL driver
    pub fn new(settings: DbSettings) -> Self {
        Self {
            settings,
            pool: RwLock::new(None),
            connected: AtomicBool::new(false),
            cancel: CancelSlot::new(),
        }
    }

    fn connect_options(config: &ConnectionConfig) -> Result<MySqlConnectOptions, DatabaseError> {
        let options = match config.connection_string.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(raw) => MySqlConnectOptions::from_str(raw.trim())
                .map_err(|e| DatabaseError::InvalidConfig(format!("Invalid connection string: {}", e)))?,
            None => {
                let host = config
                    .host
                    .as_deref()
                    .ok_or_else(|| DatabaseError::InvalidConfig("Host is required".to_string()))?;
                let mut options = MySqlConnectOptions::new()
                    .host(host)
                    .port(config.port_or_default())
                    .username(config.username.as_deref().unwrap_or("root"));
                if let Some(password) = config.password.as_deref() {
                    options = options.password(password);
                }
                if let Some(database) = config.database.as_deref().filter(|d| !d.is_empty()) {
                    options = options.database(database);
                }
                options
            }
        };

        let ssl_mode = if config.ssl_enabled() {
            MySqlSslMode::Required
        } else {
            MySqlSslMode::Preferred
        };
        Ok(options.ssl_mode(ssl_mode).charset("utf8mb4"))
    }

    async fn pool(&self) -> Result<MySqlPool, DatabaseError> {
        self.pool.read().await.clone().ok_or(DatabaseError::NotConnected)
    }

    /// Catalog columns can arrive as VARBINARY depending on server collation
    fn text_at(row: &MySqlRow, idx: usize) -> Option<String> {
        row.try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .or_else(|| {
                row.try_get::<Option<Vec<u8>>, _>(idx)
                    .ok()
                    .flatten()
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            })
    }

    fn int_at(row: &MySqlRow, idx: usize) -> Option<i64> {
        row.try_get::<Option<i64>, _>(idx)
            .ok()
            .flatten()
            .or_else(|| row.try_get::<Option<u64>, _>(idx).ok().flatten().map(|n| n as i64))
    }

    async fn count(pool: &MySqlPool, sql: &str) -> Result<u64, sqlx::Error> {
        let n: i64 = sqlx::query_scalar(sql).persistent(false).fetch_one(pool).await?;
        Ok(n.max(0) as u64)
    }

    /// Exact count, falling back to the `TABLE_ROWS` estimate
    async fn table_row_count(
        pool: &MySqlPool,
        table: &str,
        schema: Option<&str>,
        estimate: Option<i64>,
    ) -> Option<u64> {
        let exact = format!(
            "SELECT COUNT(*) FROM {}",
            sql::qualified_name(DatabaseType::Mysql, table, schema)
        );
        match Self::count(pool, &exact).await {
            Ok(n) => Some(n),
            Err(_) => estimate.map(|n| n.max(0) as u64),
        }
    }

    fn schema_arg(schema: Option<&str>) -> Option<&str> {
        schema.filter(|s| !s.is_empty())
    }
}

/// Convert a MySQL cell into JSON by its reported column type
fn cell_to_json(row: &MySqlRow, idx: usize) -> Value {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    let type_name = row.columns()[idx].type_info().name().to_string();
    let converted = match type_name.as_str() {
        "NULL" => Ok(Value::Null),
        "BOOLEAN" => row.try_get::<Option<bool>, _>(idx).map(Value::from),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            row.try_get::<Option<i64>, _>(idx).map(Value::from)
        }
        "YEAR" => row.try_get_unchecked::<Option<i64>, _>(idx).map(Value::from),
        name if name.ends_with("UNSIGNED") => row.try_get::<Option<u64>, _>(idx).map(Value::from),
        "FLOAT" => row.try_get::<Option<f32>, _>(idx).map(Value::from),
        "DOUBLE" => row.try_get::<Option<f64>, _>(idx).map(Value::from),
        "DATETIME" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)
            .map(|v| Value::from(v.map(|t| t.to_string()))),
        "TIMESTAMP" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)
            .map(|v| Value::from(v.map(|t| t.to_rfc3339()))),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(idx)
            .map(|v| Value::from(v.map(|d| d.to_string()))),
        "TIME" => row
            .try_get::<Option<NaiveTime>, _>(idx)
            .map(|v| Value::from(v.map(|t| t.to_string()))),
        "JSON" => row.try_get_unchecked::<Option<String>, _>(idx).map(|v| {
            v.map(|text| serde_json::from_str(&text).unwrap_or(Value::String(text)))
                .unwrap_or(Value::Null)
        }),
        "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT" => row
            .try_get::<Option<Vec<u8>>, _>(idx)
            .map(|v| match v {
                Some(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => Value::String(text),
                    Err(e) => Value::from(e.into_bytes()),
                },
                None => Value::Null,
            }),
        // DECIMAL, ENUM, SET and text types are transmitted as strings
        _ => row.try_get_unchecked::<Option<String>, _>(idx).map(Value::from),
    };

    converted.unwrap_or_else(|_| Value::String(format!("<{}>", type_name)))
}

fn rows_to_output(rows: Vec<MySqlRow>) -> StatementOutput {
    let columns: Vec<String> = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let rows = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .enumerate()
                .map(|(idx, name)| (name.clone(), cell_to_json(row, idx)))
                .collect::<Row>()
        })
        .collect();

    StatementOutput {
        columns,
        rows,
        affected: 0,
    }
}

#[async_trait::async_trait]
impl DbDriver for MysqlDriver {
    fn engine(&self) -> DatabaseType {
        DatabaseType::Mysql
    }

    fn parse_connection_string(&self, input: &str) -> ConnectionConfig {
        match uri::parse_with_scheme(input, &["mysql", "mariadb"]) {
            Some(url) => {
                let mut config = uri::config_from_url(DatabaseType::Mysql, &url);
                let ssl = uri::query_flag(&url, "ssl", "true")
                    || uri::query_param(&url, "ssl-mode")
                        .map(|m| !m.eq_ignore_ascii_case("disabled") && !m.eq_ignore_ascii_case("preferred"))
                        .unwrap_or(false);
                config.ssl = Some(ssl);
                config
            }
            None => ConnectionConfig::new(DatabaseType::Mysql),
        }
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<(), DatabaseError> {
        config.validate()?;
        let options = Self::connect_options(config)?;

        let pool = MySqlPoolOptions::new()
            .max_connections(self.settings.pool_size)
            .acquire_timeout(self.settings.connect_timeout())
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        // Liveness check
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        *self.pool.write().await = Some(pool);
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(
            host = config.host.as_deref().unwrap_or("-"),
            database = config.database.as_deref().unwrap_or("-"),
            "MySQL pool ready"
        );
        Ok(())
    }

    async fn disconnect(&self) {
        let previous = self.pool.write().await.take();
        self.connected.store(false, Ordering::SeqCst);
        if let Some(pool) = previous {
            pool.close().await;
            tracing::info!("MySQL pool closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn list_databases(&self) -> Result<Vec<String>, DatabaseError> {
        let pool = self.pool().await?;
        let rows = sqlx::query("SELECT SCHEMA_NAME FROM information_schema.SCHEMATA ORDER BY SCHEMA_NAME")
            .fetch_all(&pool)
            .await
            .map_err(|e| DatabaseError::QueryError(e.to_string()))?;
        Ok(rows.iter().filter_map(|row| Self::text_at(row, 0)).collect())
    }

    async fn list_schemas(&self) -> Result<Vec<String>, DatabaseError> {
        // A MySQL schema is a database
        self.list_databases().await
    }

    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<DbTable>, DatabaseError> {
        let pool = self.pool().await?;
        let schema = Self::schema_arg(schema);
        let rows = sqlx::query(
            r#"
            SELECT TABLE_NAME, TABLE_TYPE, TABLE_ROWS, TABLE_SCHEMA
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = COALESCE(?, DATABASE())
            ORDER BY TABLE_NAME
        "#,
        )
        .bind(schema)
        .fetch_all(&pool)
        .await
        .map_err(|e| DatabaseError::QueryError(e.to_string()))?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(name) = Self::text_at(row, 0) else {
                continue;
            };
            let kind = Self::text_at(row, 1).unwrap_or_default();
            let owner = Self::text_at(row, 3);
            let row_count =
                Self::table_row_count(&pool, &name, owner.as_deref(), Self::int_at(row, 2)).await;
            tables.push(DbTable {
                name,
                schema: owner,
                table_type: if kind == "VIEW" { TableKind::View } else { TableKind::Table },
                row_count,
            });
        }
        Ok(tables)
    }

    async fn get_table_info(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<TableInfo, DatabaseError> {
        let pool = self.pool().await?;
        let schema = Self::schema_arg(schema);
        let err = |e: sqlx::Error| DatabaseError::SchemaError(e.to_string());
        let mut info = TableInfo::default();

        let foreign_keys: Vec<String> = sqlx::query(
            r#"
            SELECT COLUMN_NAME
            FROM information_schema.KEY_COLUMN_USAGE
            WHERE TABLE_SCHEMA = COALESCE(?, DATABASE())
            AND TABLE_NAME = ?
            AND REFERENCED_TABLE_NAME IS NOT NULL
        "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&pool)
        .await
        .map_err(err)?
        .iter()
        .filter_map(|row| Self::text_at(row, 0))
        .collect();

        let columns = sqlx::query(
            r#"
            SELECT COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE, COLUMN_DEFAULT, COLUMN_KEY
            FROM information_schema.COLUMNS
            WHERE TABLE_SCHEMA = COALESCE(?, DATABASE())
            AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
        "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&pool)
        .await
        .map_err(err)?;

        for row in &columns {
            let Some(name) = Self::text_at(row, 0) else {
                continue;
            };
            info.columns.push(DbColumn {
                is_foreign_key: foreign_keys.contains(&name),
                data_type: Self::text_at(row, 1).unwrap_or_default(),
                nullable: Self::text_at(row, 2).as_deref() == Some("YES"),
                default_value: Self::text_at(row, 3),
                is_primary_key: Self::text_at(row, 4).as_deref() == Some("PRI"),
                name,
            });
        }

        let indexes = sqlx::query(
            r#"
            SELECT INDEX_NAME, COLUMN_NAME, CAST(NON_UNIQUE AS SIGNED), INDEX_TYPE
            FROM information_schema.STATISTICS
            WHERE TABLE_SCHEMA = COALESCE(?, DATABASE())
            AND TABLE_NAME = ?
            ORDER BY INDEX_NAME, SEQ_IN_INDEX
        "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&pool)
        .await
        .map_err(err)?;

        for row in &indexes {
            let (Some(name), Some(column)) = (Self::text_at(row, 0), Self::text_at(row, 1)) else {
                continue;
            };
            let unique = Self::int_at(row, 2) == Some(0);
            let kind = Self::text_at(row, 3).unwrap_or_else(|| "BTREE".to_string());
            info.push_index_column(&name, column, unique, &kind);
        }

        info.row_count = Self::table_row_count(&pool, table, schema, None).await.unwrap_or(0);
        Ok(info)
    }

    async fn execute_query(&self, sql: &str, limit: Option<u64>, offset: Option<u64>) -> QueryResult {
        let start = Instant::now();
        let pool = match self.pool().await {
            Ok(pool) => pool,
            Err(e) => return QueryResult::failed(e.to_string(), start.elapsed().as_millis() as u64),
        };
        let paged = paginate(DatabaseType::Mysql, sql, limit, offset);

        let work = |ticket: QueryTicket| async move {
            let mut conn = pool
                .acquire()
                .await
                .map_err(|e| DatabaseError::QueryError(e.to_string()))?;
            let thread_id: Option<u64> = sqlx::Executor::fetch_one(&mut *conn, sqlx::query("SELECT CONNECTION_ID()"))
                .await
                .and_then(|row| sqlx::Row::try_get::<u64, _>(&row, 0))
                .ok();
            if let Some(thread_id) = thread_id {
                self.cancel.attach(ticket, thread_id).await;
            }

            let output = if sql::is_mysql_read_query(&paged.sql) {
                sqlx::Executor::fetch_all(&mut *conn, sqlx::query(&paged.sql).persistent(false))
                    .await
                    .map(rows_to_output)
            } else {
                sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(&paged.sql))
                    .await
                    .map(|done| StatementOutput {
                        columns: Vec::new(),
                        rows: Vec::new(),
                        affected: done.rows_affected(),
                    })
            }
            .map_err(|e| DatabaseError::QueryError(e.to_string()))?;

            // The connection stays checked out until the block ends, so a
            // KILL QUERY for its thread id cannot hit another caller
            let total = if paged.limit_applied {
                Self::count(&pool, &count_query(DatabaseType::Mysql, sql)).await.ok()
            } else {
                None
            };
            Ok::<_, DatabaseError>((output, total))
        };

        let timeout = self.settings.query_timeout();
        let raced = self.cancel.run(|ticket| with_deadline(timeout, work(ticket))).await;

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
                tracing::debug!(error = %e, "MySQL query failed");
                QueryResult::failed(e.to_string(), elapsed)
            }
            Raced::Cancelled => QueryResult::failed("Query cancelled", elapsed),
        }
    }

    async fn cancel_query(&self) -> bool {
        let pending = self.cancel.take_pending().await;
        if let Ok(pool) = self.pool().await {
            for &thread_id in pending.iter().filter_map(PendingQuery::hook) {
                let kill = format!("KILL QUERY {}", thread_id);
                if let Err(e) = sqlx::raw_sql(&kill).execute(&pool).await {
                    tracing::warn!(thread_id, error = %e, "MySQL KILL QUERY failed");
                }
            }
        }
        signal_all(pending)
    }
}
