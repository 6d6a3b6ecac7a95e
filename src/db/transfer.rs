// Table Transfer
// Copies tables between two live connections, page by page

use serde::{Deserialize, Serialize};

use crate::db::drivers::Driver;
use crate::db::sql::{append_page, qualified_name, quote_ident, value_literal};
use crate::db::traits::{DatabaseError, DatabaseType, DbColumn, DbDriver, QueryResult};

/// SQL Server rejects more than 1000 rows in one VALUES list
const MAX_BATCH: usize = 1000;

/// What to copy and how to prepare the target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TransferOptions {
    pub tables: Vec<String>,
    pub source_schema: Option<String>,
    pub target_schema: Option<String>,
    pub create_table: bool,
    pub drop_existing: bool,
    pub batch_size: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            tables: Vec::new(),
            source_schema: None,
            target_schema: None,
            create_table: true,
            drop_existing: false,
            batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TableTransferResult {
    pub table: String,
    pub rows_copied: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferResult {
    pub success: bool,
    pub tables: Vec<TableTransferResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            tables: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Engine-neutral column category used to pick target DDL types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Date,
    Timestamp,
    Json,
    Text,
}

fn classify(data_type: &str) -> ColumnCategory {
    // Inferred document types look like "string|null"
    let mut parts = data_type
        .split('|')
        .map(|p| p.trim().to_ascii_lowercase())
        .filter(|p| p != "null");
    let base = match (parts.next(), parts.next()) {
        (Some(only), None) => only,
        _ => return ColumnCategory::Text,
    };
    let base = base
        .split('(')
        .next()
        .unwrap_or("")
        .trim_end_matches(" unsigned")
        .trim()
        .to_string();

    match base.as_str() {
        "bool" | "boolean" | "bit" => ColumnCategory::Boolean,
        "smallint" | "integer" | "int" | "int2" | "int4" | "int8" | "bigint" | "tinyint"
        | "mediumint" | "serial" | "bigserial" | "smallserial" | "year" => ColumnCategory::Integer,
        "real" | "float" | "float4" | "float8" | "double" | "double precision" | "number" => {
            ColumnCategory::Float
        }
        "numeric" | "decimal" | "money" | "smallmoney" => ColumnCategory::Decimal,
        "date" => ColumnCategory::Date,
        "json" | "jsonb" | "object" | "array" => ColumnCategory::Json,
        b if b.starts_with("timestamp") || b.starts_with("datetime") || b == "smalldatetime" => {
            ColumnCategory::Timestamp
        }
        _ => ColumnCategory::Text,
    }
}

fn target_type(engine: DatabaseType, category: ColumnCategory, keyed: bool) -> &'static str {
    use ColumnCategory::*;
    use DatabaseType::*;
    match (engine, category) {
        (Sqlite, Integer | Boolean) => "INTEGER",
        (Sqlite, Float) => "REAL",
        (Sqlite, Decimal) => "NUMERIC",
        (Sqlite, _) => "TEXT",

        (Postgresql, Integer) => "BIGINT",
        (Postgresql, Float) => "DOUBLE PRECISION",
        (Postgresql, Decimal) => "NUMERIC",
        (Postgresql, Boolean) => "BOOLEAN",
        (Postgresql, Date) => "DATE",
        (Postgresql, Timestamp) => "TIMESTAMP",
        (Postgresql, Json) => "JSONB",
        (Postgresql, Text) => "TEXT",

        (Mysql, Integer) => "BIGINT",
        (Mysql, Float) => "DOUBLE",
        (Mysql, Decimal) => "DECIMAL(38,10)",
        (Mysql, Boolean) => "TINYINT(1)",
        (Mysql, Date) => "DATE",
        (Mysql, Timestamp) => "DATETIME(6)",
        (Mysql, Json) => "JSON",
        (Mysql, Text) if keyed => "VARCHAR(255)",
        (Mysql, Text) => "LONGTEXT",

        (Mssql, Integer) => "BIGINT",
        (Mssql, Float) => "FLOAT",
        (Mssql, Decimal) => "DECIMAL(38,10)",
        (Mssql, Boolean) => "BIT",
        (Mssql, Date) => "DATE",
        (Mssql, Timestamp) => "DATETIME2",
        (Mssql, Text | Json) if keyed => "NVARCHAR(450)",
        (Mssql, Text | Json) => "NVARCHAR(MAX)",

        (Mongodb, _) => "",
    }
}

/// `CREATE TABLE` for `columns` in the target dialect. Key and NOT NULL
/// constraints are only carried over when `keep_constraints` is set.
fn create_table_sql(
    engine: DatabaseType,
    name: &str,
    columns: &[DbColumn],
    keep_constraints: bool,
) -> String {
    let keys: Vec<&DbColumn> = columns
        .iter()
        .filter(|c| keep_constraints && c.is_primary_key)
        .collect();

    let mut defs: Vec<String> = columns
        .iter()
        .map(|col| {
            let keyed = keys.iter().any(|k| k.name == col.name);
            let mut def = format!(
                "{} {}",
                quote_ident(engine, &col.name),
                target_type(engine, classify(&col.data_type), keyed)
            );
            if keep_constraints && (!col.nullable || keyed) {
                def.push_str(" NOT NULL");
            }
            def
        })
        .collect();

    if !keys.is_empty() {
        let key_list: Vec<String> = keys.iter().map(|k| quote_ident(engine, &k.name)).collect();
        defs.push(format!("PRIMARY KEY ({})", key_list.join(", ")));
    }

    let if_not_exists = if engine == DatabaseType::Mssql { "" } else { "IF NOT EXISTS " };
    format!("CREATE TABLE {}{} ({})", if_not_exists, name, defs.join(", "))
}

fn insert_sql(engine: DatabaseType, name: &str, page: &QueryResult) -> String {
    let columns: Vec<String> = page.columns.iter().map(|c| quote_ident(engine, c)).collect();
    let values: Vec<String> = page
        .rows
        .iter()
        .map(|row| {
            let cells: Vec<String> = page
                .columns
                .iter()
                .map(|c| value_literal(engine, row.get(c).unwrap_or(&serde_json::Value::Null)))
                .collect();
            format!("({})", cells.join(", "))
        })
        .collect();
    format!("INSERT INTO {} ({}) VALUES {}", name, columns.join(", "), values.join(", "))
}

/// Columns that give the source a stable row order: the primary key, or
/// every column when there is none
fn order_columns(columns: &[DbColumn]) -> Vec<&str> {
    let keys: Vec<&str> = columns
        .iter()
        .filter(|c| c.is_primary_key)
        .map(|c| c.name.as_str())
        .collect();
    if keys.is_empty() {
        columns.iter().map(|c| c.name.as_str()).collect()
    } else {
        keys
    }
}

/// One page of the source table in a stable order. The page clause is part
/// of the text so the driver does not run a total-count query per page.
fn page_query(engine: DatabaseType, name: &str, order: &[&str], limit: u64, offset: u64) -> String {
    if engine == DatabaseType::Mongodb {
        return serde_json::json!({
            "collection": name,
            "sort": { "_id": 1 },
            "limit": limit,
            "offset": offset,
        })
        .to_string();
    }

    let mut sql = format!("SELECT * FROM {}", name);
    if !order.is_empty() {
        let keys: Vec<String> = order.iter().map(|c| quote_ident(engine, c)).collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&keys.join(", "));
    }
    append_page(engine, &sql, limit, offset)
}

async fn run_statement(target: &Driver, sql: &str) -> Result<(), DatabaseError> {
    let result = target.execute_query(sql, None, None).await;
    match result.error {
        Some(e) => Err(DatabaseError::QueryError(e)),
        None => Ok(()),
    }
}

async fn transfer_table(
    source: &Driver,
    target: &Driver,
    table: &str,
    options: &TransferOptions,
) -> Result<u64, DatabaseError> {
    let source_engine = source.engine();
    let target_engine = target.engine();
    let source_schema = options.source_schema.as_deref();
    let target_schema = options.target_schema.as_deref();
    let batch = options.batch_size.clamp(1, MAX_BATCH);
    let target_name = qualified_name(target_engine, table, target_schema);

    let source_name = if source_engine == DatabaseType::Mongodb {
        table.to_string()
    } else {
        qualified_name(source_engine, table, source_schema)
    };

    // SQL sources need their key columns for a stable page order
    let source_info = if options.create_table || source_engine != DatabaseType::Mongodb {
        Some(source.get_table_info(table, source_schema).await?)
    } else {
        None
    };
    let order = source_info
        .as_ref()
        .filter(|_| source_engine != DatabaseType::Mongodb)
        .map(|info| order_columns(&info.columns))
        .unwrap_or_default();

    let mongo_target = target.as_mongo();
    let mut pending_create = false;
    match mongo_target {
        Some(mongo) => {
            if options.drop_existing {
                mongo.drop_collection(table, target_schema).await?;
            }
        }
        None => {
            if options.drop_existing {
                run_statement(target, &format!("DROP TABLE IF EXISTS {}", target_name)).await?;
            }
            if let Some(info) = source_info.as_ref().filter(|_| options.create_table) {
                if info.columns.is_empty() {
                    pending_create = true;
                } else {
                    let keep = source_engine != DatabaseType::Mongodb;
                    run_statement(target, &create_table_sql(target_engine, &target_name, &info.columns, keep))
                        .await?;
                }
            }
        }
    }

    let mut copied = 0u64;
    let mut offset = 0u64;
    loop {
        let query = page_query(source_engine, &source_name, &order, batch as u64, offset);
        let page = source.execute_query(&query, None, None).await;
        if let Some(e) = page.error {
            return Err(DatabaseError::QueryError(e));
        }
        if page.rows.is_empty() {
            break;
        }
        let fetched = page.rows.len() as u64;

        match mongo_target {
            Some(mongo) => {
                copied += mongo.insert_documents(table, target_schema, page.rows).await?;
            }
            None => {
                if pending_create {
                    let columns: Vec<DbColumn> = page
                        .columns
                        .iter()
                        .map(|name| DbColumn {
                            name: name.clone(),
                            data_type: "text".to_string(),
                            nullable: true,
                            is_primary_key: false,
                            is_foreign_key: false,
                            default_value: None,
                        })
                        .collect();
                    run_statement(target, &create_table_sql(target_engine, &target_name, &columns, false))
                        .await?;
                    pending_create = false;
                }
                run_statement(target, &insert_sql(target_engine, &target_name, &page)).await?;
                copied += fetched;
            }
        }

        tracing::debug!(table = %table, rows = copied, "transfer batch written");
        offset += fetched;
        if fetched < batch as u64 {
            break;
        }
    }

    Ok(copied)
}

/// Copy every table in `options.tables`. A failing table is recorded and the
/// remaining tables are still attempted.
pub async fn transfer_tables(source: &Driver, target: &Driver, options: &TransferOptions) -> TransferResult {
    if options.tables.is_empty() {
        return TransferResult::failed("No tables selected");
    }

    let mut result = TransferResult {
        success: true,
        ..TransferResult::default()
    };

    for table in &options.tables {
        match transfer_table(source, target, table, options).await {
            Ok(rows_copied) => {
                tracing::info!(table = %table, rows = rows_copied, "table transferred");
                result.tables.push(TableTransferResult {
                    table: table.clone(),
                    rows_copied,
                    error: None,
                });
            }
            Err(e) => {
                tracing::warn!(table = %table, error = %e, "table transfer failed");
                result.success = false;
                result.tables.push(TableTransferResult {
                    table: table.clone(),
                    rows_copied: 0,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    result
}
