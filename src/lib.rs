// polydb
// Multi-engine database access: drivers, a connection registry, table
// transfer and backup/restore through the engines' native tools

pub mod backup;
pub mod db;
pub mod logging;
pub mod settings;

pub use backup::{
    BackupEntry, BackupError, BackupLogEvent, BackupOptions, BackupResult, BackupService,
    BackupTarget, DeleteResult, RestoreResult,
};
pub use db::{
    ConnectionConfig, ConnectionRegistry, DatabaseError, DatabaseType, DbDriver, Driver,
    QueryResult, TransferOptions, TransferResult,
};
pub use logging::init_tracing;
pub use settings::DbSettings;
