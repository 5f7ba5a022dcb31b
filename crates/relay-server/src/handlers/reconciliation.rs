//! Operator endpoints for messages the two stores disagree on.

use crate::config::AppState;
use crate::error::{ApiError, Result};
use axum::{
    extract::{Path, State},
    Json,
};
use relay_core::{Incident, MessageId};
use tracing::info;

/// GET /reconciliation
pub async fn list_incidents(State(state): State<AppState>) -> Json<Vec<Incident>> {
    Json(state.ingress.ledger().list())
}

/// POST /reconciliation/{message_id}/replay
///
/// Writes a partially committed message to the store that missed it.
pub async fn replay_incident(
    Path(message_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Incident>> {
    let id: MessageId = message_id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid message id {:?}", message_id)))?;

    info!(message_id = %id, "replay requested");
    let incident = state
        .ingress
        .ledger()
        .replay(&id, state.ingress.coordinator())
        .await?;
    Ok(Json(incident))
}
