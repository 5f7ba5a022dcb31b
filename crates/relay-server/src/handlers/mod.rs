//! Handlers for server
//!
//! The chat itself runs over a WebSocket; the HTTP routes are for operators.

pub mod reconciliation;
pub mod socket;

// Re-export AppState from config
pub use crate::config::AppState;

pub use reconciliation::{list_incidents, replay_incident};
pub use socket::ws_handler;
