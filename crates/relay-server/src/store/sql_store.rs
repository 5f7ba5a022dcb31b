//! sqlx-backed transactional store
//!
//! Uses the `Any` driver so each store can point at MySQL, PostgreSQL or
//! SQLite purely through its URL. Connections come from a lazily connected
//! pool: an unreachable backend shows up as a connection error at `begin`, and
//! a handle's release returns its connection to the pool.

use crate::config::StoreConfig;
use async_trait::async_trait;
use relay_core::{StoreError, StoreSession, TransactionalStore, TxState, WriteSpec};
use sqlx::any::AnyPoolOptions;
use sqlx::{Any, AnyPool, Transaction};
use std::sync::Arc;
use tracing::info;

pub struct SqlStore {
    name: String,
    pool: AnyPool,
    statement: Arc<str>,
    with_id: bool,
}

impl SqlStore {
    /// Build the pool without connecting.
    pub fn connect_lazy(config: &StoreConfig) -> anyhow::Result<Self> {
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy(&config.url)?;

        info!(
            store = %config.name,
            kind = config.kind.scheme(),
            table = %config.table,
            max_connections = config.max_connections,
            "store configured"
        );

        Ok(Self {
            name: config.name.clone(),
            pool,
            statement: Arc::from(config.insert_statement()),
            with_id: config.id_column.is_some(),
        })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl TransactionalStore for SqlStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        let tx = self.pool.begin().await.map_err(|e| StoreError::Connection {
            store: self.name.clone(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(SqlSession {
            store: self.name.clone(),
            statement: Arc::clone(&self.statement),
            with_id: self.with_id,
            tx: Some(tx),
        }))
    }
}

struct SqlSession {
    store: String,
    statement: Arc<str>,
    with_id: bool,
    tx: Option<Transaction<'static, Any>>,
}

fn closed(store: &str) -> StoreError {
    StoreError::InvalidState {
        store: store.to_string(),
        expected: TxState::Active,
        actual: TxState::Idle,
    }
}

#[async_trait]
impl StoreSession for SqlSession {
    async fn execute(&mut self, write: &WriteSpec) -> Result<(), StoreError> {
        let tx = self.tx.as_mut().ok_or_else(|| closed(&self.store))?;
        let mut query = sqlx::query(&self.statement);
        if self.with_id {
            query = query.bind(write.message_id.to_string());
        }
        query
            .bind(write.body.as_str())
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Write {
                store: self.store.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or_else(|| closed(&self.store))?;
        tx.commit().await.map_err(|e| StoreError::Commit {
            store: self.store.clone(),
            reason: e.to_string(),
        })
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        tx.rollback().await.map_err(|e| StoreError::Rollback {
            store: self.store.clone(),
            reason: e.to_string(),
        })
    }

    fn release(&mut self) {
        // Dropping an open sqlx transaction queues its rollback; dropping the
        // connection returns it to the pool.
        self.tx.take();
    }
}
