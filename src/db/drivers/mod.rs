// Database Drivers
// One implementation per engine, unified behind the `Driver` enum

pub mod mongo;
pub mod mssql;
pub mod mysql;
pub mod postgres;
pub mod sqlite;

pub use mongo::MongoDriver;
pub use mssql::MssqlDriver;
pub use mysql::MysqlDriver;
pub use postgres::PostgresDriver;
pub use sqlite::SqliteDriver;

use crate::db::traits::{
    ConnectionConfig, DatabaseError, DatabaseType, DbDriver, DbTable, QueryResult, TableInfo,
};
use crate::settings::DbSettings;

/// A driver for any supported engine
pub enum Driver {
    Postgres(PostgresDriver),
    Mysql(MysqlDriver),
    Mssql(MssqlDriver),
    Mongodb(MongoDriver),
    Sqlite(SqliteDriver),
}

macro_rules! dispatch {
    ($self:ident, $driver:ident => $body:expr) => {
        match $self {
            Driver::Postgres($driver) => $body,
            Driver::Mysql($driver) => $body,
            Driver::Mssql($driver) => $body,
            Driver::Mongodb($driver) => $body,
            Driver::Sqlite($driver) => $body,
        }
    };
}

impl Driver {
    /// Build a fresh, disconnected driver for `engine`
    pub fn for_engine(engine: DatabaseType, settings: DbSettings) -> Self {
        match engine {
            DatabaseType::Postgresql => Driver::Postgres(PostgresDriver::new(settings)),
            DatabaseType::Mysql => Driver::Mysql(MysqlDriver::new(settings)),
            DatabaseType::Mssql => Driver::Mssql(MssqlDriver::new(settings)),
            DatabaseType::Mongodb => Driver::Mongodb(MongoDriver::new(settings)),
            DatabaseType::Sqlite => Driver::Sqlite(SqliteDriver::new(settings)),
        }
    }

    pub fn as_mongo(&self) -> Option<&MongoDriver> {
        match self {
            Driver::Mongodb(driver) => Some(driver),
            _ => None,
        }
    }
}

#[async_trait::async_trait]
impl DbDriver for Driver {
    fn engine(&self) -> DatabaseType {
        dispatch!(self, d => d.engine())
    }

    fn default_port(&self) -> u16 {
        dispatch!(self, d => d.default_port())
    }

    fn parse_connection_string(&self, uri: &str) -> ConnectionConfig {
        dispatch!(self, d => d.parse_connection_string(uri))
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<(), DatabaseError> {
        dispatch!(self, d => d.connect(config).await)
    }

    async fn disconnect(&self) {
        dispatch!(self, d => d.disconnect().await)
    }

    fn is_connected(&self) -> bool {
        dispatch!(self, d => d.is_connected())
    }

    async fn list_databases(&self) -> Result<Vec<String>, DatabaseError> {
        dispatch!(self, d => d.list_databases().await)
    }

    async fn list_schemas(&self) -> Result<Vec<String>, DatabaseError> {
        dispatch!(self, d => d.list_schemas().await)
    }

    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<DbTable>, DatabaseError> {
        dispatch!(self, d => d.list_tables(schema).await)
    }

    async fn get_table_info(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<TableInfo, DatabaseError> {
        dispatch!(self, d => d.get_table_info(table, schema).await)
    }

    async fn execute_query(&self, sql: &str, limit: Option<u64>, offset: Option<u64>) -> QueryResult {
        dispatch!(self, d => d.execute_query(sql, limit, offset).await)
    }

    async fn cancel_query(&self) -> bool {
        dispatch!(self, d => d.cancel_query().await)
    }
}
