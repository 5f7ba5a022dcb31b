//! Per-connection entry point: validate, dual-write, then broadcast.

use crate::coordinator::{DualWriteCoordinator, DualWriteError, ErrorKind};
use crate::drain::Drain;
use crate::hub::BroadcastHub;
use crate::message::{ChatMessage, ConnectionId, MessageId, ServerEvent};
use crate::reconcile::ReconciliationLedger;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid message: {0}")]
    Validation(String),

    #[error("server is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] DualWriteError),
}

impl RelayError {
    /// Text sent to the originating connection. Never carries internal detail.
    pub fn user_message(&self) -> &'static str {
        match self {
            RelayError::Validation(_) => "Message must be non-empty text",
            RelayError::ShuttingDown => "Server is shutting down",
            RelayError::Store(e) => match e.kind() {
                ErrorKind::Connection => "Could not reach the message store",
                ErrorKind::ShutdownAbort => "Server is shutting down",
                _ => "Failed to save the message",
            },
        }
    }
}

pub struct MessageIngress {
    coordinator: Arc<DualWriteCoordinator>,
    hub: Arc<BroadcastHub>,
    ledger: Arc<ReconciliationLedger>,
    drain: Arc<Drain>,
}

impl MessageIngress {
    pub fn new(
        coordinator: Arc<DualWriteCoordinator>,
        hub: Arc<BroadcastHub>,
        ledger: Arc<ReconciliationLedger>,
        drain: Arc<Drain>,
    ) -> Self {
        Self {
            coordinator,
            hub,
            ledger,
            drain,
        }
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn ledger(&self) -> &Arc<ReconciliationLedger> {
        &self.ledger
    }

    pub fn coordinator(&self) -> &Arc<DualWriteCoordinator> {
        &self.coordinator
    }

    pub fn drain(&self) -> &Arc<Drain> {
        &self.drain
    }

    /// Handle one inbound `chat_message`. On success the text is broadcast to
    /// every subscriber; on failure only `connection` hears about it.
    pub async fn on_message(
        &self,
        connection: &ConnectionId,
        raw: &serde_json::Value,
    ) -> Result<MessageId, RelayError> {
        let result = self.process(raw).await;
        if let Err(e) = &result {
            self.hub
                .send_to(connection, ServerEvent::ErrorMessage(e.user_message().to_string()));
        }
        result
    }

    async fn process(&self, raw: &serde_json::Value) -> Result<MessageId, RelayError> {
        let message = validate(raw)?;
        let Some(_guard) = self.drain.enter() else {
            warn!(message_id = %message.id, "message refused during shutdown");
            return Err(RelayError::ShuttingDown);
        };

        match self.coordinator.commit_to_both(&message).await {
            Ok(id) => {
                let delivered = self.hub.broadcast_all(&message.text);
                debug!(message_id = %id, delivered, "message broadcast");
                Ok(id)
            }
            Err(e) => {
                if !self.ledger.record(&message, &e) {
                    error!(message_id = %message.id, kind = %e.kind(), error = %e, "dual write failed");
                }
                Err(e.into())
            }
        }
    }

    /// A frame that is not a recognised event. Treated like invalid input.
    pub fn on_malformed(&self, connection: &ConnectionId, reason: &str) {
        warn!(connection_id = %connection, reason, "malformed frame");
        let err = RelayError::Validation(reason.to_string());
        self.hub
            .send_to(connection, ServerEvent::ErrorMessage(err.user_message().to_string()));
    }

    pub fn on_disconnect(&self, connection: &ConnectionId) {
        self.hub.leave(connection);
    }
}

/// Payload must be a JSON string that is not blank.
pub fn validate(raw: &serde_json::Value) -> Result<ChatMessage, RelayError> {
    let text = raw.as_str().ok_or_else(|| {
        warn!("rejected non-text payload");
        RelayError::Validation("payload is not text".to_string())
    })?;
    ChatMessage::parse(text).ok_or_else(|| {
        warn!("rejected blank payload");
        RelayError::Validation("payload is blank".to_string())
    })
}
