// Connection Registry
// Maps connection ids to live drivers and owns their lifecycle

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::db::drivers::Driver;
use crate::db::traits::{
    ConnectionConfig, DatabaseError, DbDriver, DbTable, QueryResult, TableInfo,
};
use crate::db::transfer::{self, TransferOptions, TransferResult};
use crate::settings::DbSettings;

/// Registry of connected drivers, one per connection id.
///
/// Callers own it (usually behind an `Arc`) and share it with whatever layer
/// needs database access.
pub struct ConnectionRegistry {
    settings: DbSettings,
    drivers: RwLock<HashMap<String, Arc<Driver>>>,
}

impl ConnectionRegistry {
    pub fn new(settings: DbSettings) -> Self {
        Self {
            settings,
            drivers: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &DbSettings {
        &self.settings
    }

    /// Connect `id` with `config`. Any previous driver under the same id is
    /// torn down; nothing is registered unless the new driver connects.
    pub async fn connect(&self, id: &str, config: &ConnectionConfig) -> Result<(), DatabaseError> {
        config.validate()?;

        let previous = self.drivers.write().await.remove(id);
        if let Some(previous) = previous {
            tracing::info!(connection_id = %id, "replacing existing connection");
            previous.disconnect().await;
        }

        let driver = Driver::for_engine(config.engine, self.settings.clone());
        if let Err(e) = driver.connect(config).await {
            tracing::warn!(connection_id = %id, engine = ?config.engine, error = %e, "connect failed");
            return Err(e);
        }

        self.install(id, Arc::new(driver)).await;
        tracing::info!(connection_id = %id, engine = ?config.engine, "connected");
        Ok(())
    }

    /// Register `driver` under `id`. A driver that an overlapping `connect`
    /// registered in the meantime is torn down after the lock is released.
    async fn install(&self, id: &str, driver: Arc<Driver>) {
        let displaced = self.drivers.write().await.insert(id.to_string(), driver);
        if let Some(displaced) = displaced {
            tracing::info!(connection_id = %id, "closing connection replaced by a concurrent connect");
            displaced.disconnect().await;
        }
    }

    /// Disconnect and forget `id`. Unknown ids are not an error.
    pub async fn disconnect(&self, id: &str) -> Result<(), DatabaseError> {
        let removed = self.drivers.write().await.remove(id);
        if let Some(driver) = removed {
            driver.disconnect().await;
            tracing::info!(connection_id = %id, "disconnected");
        }
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        let drained: Vec<(String, Arc<Driver>)> = self.drivers.write().await.drain().collect();
        for (id, driver) in drained {
            driver.disconnect().await;
            tracing::info!(connection_id = %id, "disconnected");
        }
    }

    /// Connect and immediately disconnect without registering anything
    pub async fn test_connection(&self, config: &ConnectionConfig) -> Result<(), DatabaseError> {
        config.validate()?;
        let driver = Driver::for_engine(config.engine, self.settings.clone());
        let outcome = driver.connect(config).await;
        driver.disconnect().await;
        outcome
    }

    pub async fn get_driver(&self, id: &str) -> Option<Arc<Driver>> {
        self.drivers.read().await.get(id).cloned()
    }

    /// Like `get_driver`, failing with `Not connected` for unknown ids
    pub async fn require(&self, id: &str) -> Result<Arc<Driver>, DatabaseError> {
        self.get_driver(id).await.ok_or(DatabaseError::NotConnected)
    }

    pub async fn is_connected(&self, id: &str) -> bool {
        self.get_driver(id)
            .await
            .map(|driver| driver.is_connected())
            .unwrap_or(false)
    }

    pub async fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.drivers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn list_databases(&self, id: &str) -> Result<Vec<String>, DatabaseError> {
        self.require(id).await?.list_databases().await
    }

    pub async fn list_schemas(&self, id: &str) -> Result<Vec<String>, DatabaseError> {
        self.require(id).await?.list_schemas().await
    }

    pub async fn list_tables(&self, id: &str, schema: Option<&str>) -> Result<Vec<DbTable>, DatabaseError> {
        self.require(id).await?.list_tables(schema).await
    }

    pub async fn get_table_info(
        &self,
        id: &str,
        table: &str,
        schema: Option<&str>,
    ) -> Result<TableInfo, DatabaseError> {
        self.require(id).await?.get_table_info(table, schema).await
    }

    /// Query errors, including an unknown id, come back inside the result
    pub async fn execute_query(
        &self,
        id: &str,
        sql: &str,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> QueryResult {
        match self.get_driver(id).await {
            Some(driver) => driver.execute_query(sql, limit, offset).await,
            None => QueryResult::failed(DatabaseError::NotConnected.to_string(), 0),
        }
    }

    /// Cancel the queries running on `id`. `Ok(false)` when it was idle.
    pub async fn cancel_query(&self, id: &str) -> Result<bool, DatabaseError> {
        Ok(self.require(id).await?.cancel_query().await)
    }

    /// Copy tables from one connection to another. Both sides must be
    /// connected before any work starts.
    pub async fn transfer_tables(
        &self,
        source_id: &str,
        target_id: &str,
        options: &TransferOptions,
    ) -> TransferResult {
        let source = self.get_driver(source_id).await;
        let target = self.get_driver(target_id).await;

        let (source, target) = match (source, target) {
            (Some(source), Some(target)) => (source, target),
            (None, Some(_)) => return TransferResult::failed("Source connection not connected"),
            (Some(_), None) => return TransferResult::failed("Target connection not connected"),
            (None, None) => return TransferResult::failed("Source and target connections not connected"),
        };

        tracing::info!(
            source_id = %source_id,
            target_id = %target_id,
            tables = options.tables.len(),
            "starting table transfer"
        );
        transfer::transfer_tables(&source, &target, options).await
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DbSettings::default())
    }
}
