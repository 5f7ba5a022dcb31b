//! Reconciliation ledger
//!
//! Incidents where the two stores may disagree about a message. They are
//! recorded by the ingress handler and only acted on by an operator.

use crate::coordinator::{DualWriteCoordinator, DualWriteError, Side};
use crate::message::{ChatMessage, MessageId};
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IncidentKind {
    /// Committed on one store, commit failed on the other.
    PartialCommit {
        committed: String,
        failed: String,
        failed_side: Side,
    },
    /// Commit outcome on `store` is unknown.
    InconsistentState { store: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Incident {
    pub message_id: MessageId,
    pub text: String,
    #[serde(flatten)]
    pub kind: IncidentKind,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("no open incident for message {0}")]
    NotFound(MessageId),

    #[error("message {0} has an unknown commit outcome, replay could duplicate it")]
    NotReplayable(MessageId),

    #[error("message {0} is already being replayed")]
    InProgress(MessageId),

    #[error("replay of message {message_id} failed: {source}")]
    Store {
        message_id: MessageId,
        #[source]
        source: StoreError,
    },
}

#[derive(Default)]
struct Entries {
    open: HashMap<MessageId, Incident>,
    /// Incidents with a replay in flight. At most one writer per message.
    replaying: HashSet<MessageId>,
}

#[derive(Default)]
pub struct ReconciliationLedger {
    entries: Mutex<Entries>,
}

/// Releases a replay claim however the replay ends, cancellation included.
struct ReplayClaim<'a> {
    ledger: &'a ReconciliationLedger,
    id: MessageId,
}

impl Drop for ReplayClaim<'_> {
    fn drop(&mut self) {
        self.ledger.entries.lock().replaying.remove(&self.id);
    }
}

impl ReconciliationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `err` if it leaves the stores in disagreement. Returns whether
    /// an incident was opened.
    pub fn record(&self, message: &ChatMessage, err: &DualWriteError) -> bool {
        let kind = match err {
            DualWriteError::PartialCommit {
                committed, failed, ..
            } => IncidentKind::PartialCommit {
                committed: committed.clone(),
                failed: failed.clone(),
                failed_side: Side::B,
            },
            DualWriteError::InconsistentState { store, .. } => IncidentKind::InconsistentState {
                store: store.clone(),
            },
            _ => return false,
        };
        error!(
            message_id = %message.id,
            kind = %err.kind(),
            reconcile = true,
            "stores disagree, incident recorded"
        );
        let incident = Incident {
            message_id: message.id,
            text: message.text.clone(),
            kind,
            recorded_at: Utc::now(),
        };
        self.entries.lock().open.insert(message.id, incident);
        true
    }

    /// Open incidents, oldest first.
    pub fn list(&self) -> Vec<Incident> {
        let mut all: Vec<Incident> = self.entries.lock().open.values().cloned().collect();
        all.sort_by_key(|i| i.recorded_at);
        all
    }

    pub fn get(&self, id: &MessageId) -> Option<Incident> {
        self.entries.lock().open.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write a partially committed message to the store that missed it and
    /// close the incident. Inconsistent-state incidents are refused, as is a
    /// second replay while one is still running.
    pub async fn replay(
        &self,
        id: &MessageId,
        coordinator: &DualWriteCoordinator,
    ) -> Result<Incident, ReplayError> {
        let (incident, side) = {
            let mut entries = self.entries.lock();
            let incident = entries.open.get(id).cloned().ok_or(ReplayError::NotFound(*id))?;
            let side = match &incident.kind {
                IncidentKind::PartialCommit { failed_side, .. } => *failed_side,
                IncidentKind::InconsistentState { .. } => {
                    return Err(ReplayError::NotReplayable(*id))
                }
            };
            if !entries.replaying.insert(*id) {
                return Err(ReplayError::InProgress(*id));
            }
            (incident, side)
        };
        let _claim = ReplayClaim { ledger: self, id: *id };

        let message = ChatMessage {
            id: incident.message_id,
            text: incident.text.clone(),
        };
        coordinator
            .replay(side, &message)
            .await
            .map_err(|source| ReplayError::Store {
                message_id: *id,
                source,
            })?;

        info!(message_id = %id, side = %side, "partial commit reconciled");
        self.entries.lock().open.remove(id);
        Ok(incident)
    }
}
