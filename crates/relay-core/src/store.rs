//! Transactional store abstraction
//!
//! A [`TransactionalStore`] opens sessions against one backend. The session
//! itself is driver specific; [`StoreHandle`] wraps it with the transaction
//! state checks and guarantees the session is released exactly once, when the
//! handle is dropped.

use crate::message::{ChatMessage, MessageId};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Transaction state of a [`StoreHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    Active,
    Committed,
    RolledBack,
    Failed,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxState::Idle => "idle",
            TxState::Active => "active",
            TxState::Committed => "committed",
            TxState::RolledBack => "rolled-back",
            TxState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The row one coordinator invocation writes to each store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSpec {
    pub message_id: MessageId,
    pub body: String,
}

impl From<&ChatMessage> for WriteSpec {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            message_id: msg.id,
            body: msg.text.clone(),
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection to {store} failed: {reason}")]
    Connection { store: String, reason: String },

    #[error("write rejected by {store}: {reason}")]
    Write { store: String, reason: String },

    #[error("commit rejected by {store}: {reason}")]
    Commit { store: String, reason: String },

    #[error("rollback failed on {store}: {reason}")]
    Rollback { store: String, reason: String },

    #[error("{store} transaction is {actual}, expected {expected}")]
    InvalidState {
        store: String,
        expected: TxState,
        actual: TxState,
    },
}

/// One backend's live transaction.
#[async_trait]
pub trait StoreSession: Send {
    async fn execute(&mut self, write: &WriteSpec) -> Result<(), StoreError>;
    async fn commit(&mut self) -> Result<(), StoreError>;
    async fn rollback(&mut self) -> Result<(), StoreError>;
    /// Return the underlying connection. Called once, from `StoreHandle::drop`.
    fn release(&mut self);
}

/// A backend able to open transactional sessions.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    fn name(&self) -> &str;

    /// Acquire a connection and start a transaction on it.
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError>;
}

/// Live transactional session owned by a single coordinator invocation.
pub struct StoreHandle {
    store: Arc<str>,
    state: TxState,
    session: Box<dyn StoreSession>,
}

impl StoreHandle {
    pub async fn begin(store: &dyn TransactionalStore) -> Result<Self, StoreError> {
        let session = store.begin().await?;
        debug!(store = store.name(), "transaction started");
        Ok(Self {
            store: Arc::from(store.name()),
            state: TxState::Active,
            session,
        })
    }

    pub fn store(&self) -> &str {
        &self.store
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    fn require_active(&self) -> Result<(), StoreError> {
        if self.state != TxState::Active {
            return Err(StoreError::InvalidState {
                store: self.store.to_string(),
                expected: TxState::Active,
                actual: self.state,
            });
        }
        Ok(())
    }

    pub async fn execute(&mut self, write: &WriteSpec) -> Result<(), StoreError> {
        self.require_active()?;
        if let Err(e) = self.session.execute(write).await {
            self.state = TxState::Failed;
            return Err(e);
        }
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<(), StoreError> {
        self.require_active()?;
        match self.session.commit().await {
            Ok(()) => {
                self.state = TxState::Committed;
                Ok(())
            }
            Err(e) => {
                self.state = TxState::Failed;
                Err(e)
            }
        }
    }

    /// Best effort. The outcome of the transaction is already decided, so a
    /// failure here is logged and swallowed.
    pub async fn rollback(&mut self) {
        if !matches!(self.state, TxState::Active | TxState::Failed) {
            return;
        }
        match self.session.rollback().await {
            Ok(()) => self.state = TxState::RolledBack,
            Err(e) => {
                warn!(store = %self.store, error = %e, "rollback failed");
                self.state = TxState::Failed;
            }
        }
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for StoreHandle {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            warn!(store = %self.store, "releasing handle with an open transaction");
        }
        self.session.release();
        debug!(store = %self.store, state = %self.state, "handle released");
    }
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("store", &self.store)
            .field("state", &self.state)
            .finish()
    }
}
