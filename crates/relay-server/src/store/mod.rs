//! Storage backends
//!
//! Each configured store implements the core `TransactionalStore` contract:
//! MySQL, PostgreSQL and SQLite through a pooled sqlx connection set, SQL
//! Server through tiberius.

pub mod mssql_store;
pub mod sql_store;

pub use mssql_store::MssqlStore;
pub use sql_store::SqlStore;

use crate::config::{BackendKind, StoreConfig};
use relay_core::TransactionalStore;
use std::sync::Arc;

/// A configured store, kept concrete so shutdown can close it.
pub enum Backend {
    Sql(Arc<SqlStore>),
    Mssql(Arc<MssqlStore>),
}

impl Backend {
    pub fn open(config: &StoreConfig) -> anyhow::Result<Self> {
        Ok(match config.kind {
            BackendKind::MsSql => Backend::Mssql(Arc::new(MssqlStore::new(config)?)),
            BackendKind::MySql | BackendKind::Postgres | BackendKind::Sqlite => {
                Backend::Sql(Arc::new(SqlStore::connect_lazy(config)?))
            }
        })
    }

    pub fn store(&self) -> Arc<dyn TransactionalStore> {
        match self {
            Backend::Sql(store) => store.clone(),
            Backend::Mssql(store) => store.clone(),
        }
    }

    pub async fn close(&self) {
        // SQL Server connections live only as long as their handle.
        if let Backend::Sql(store) = self {
            store.close().await;
        }
    }
}
