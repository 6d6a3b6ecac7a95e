// Database Module
// Engine drivers, the connection registry and cross-connection operations

pub mod cancel;
pub mod drivers;
pub mod registry;
pub mod sql;
pub mod traits;
pub mod transfer;
pub mod uri;

pub use drivers::{Driver, MongoDriver, MssqlDriver, MysqlDriver, PostgresDriver, SqliteDriver};
pub use registry::ConnectionRegistry;
pub use traits::{
    ConnectionConfig, DatabaseError, DatabaseType, DbColumn, DbDriver, DbIndex, DbTable,
    QueryResult, Row, TableInfo, TableKind,
};
pub use transfer::{TableTransferResult, TransferOptions, TransferResult};
