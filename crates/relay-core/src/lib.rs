//! Relay core
//!
//! Everything between an inbound chat message and its broadcast:
//! the dual-write coordinator that records each message in two independent
//! transactional stores, the broadcast hub holding connected subscribers, and
//! the ingress handler wiring them together. Storage drivers and the socket
//! transport live in `relay-server`.

pub mod coordinator;
pub mod drain;
pub mod hub;
pub mod ingress;
pub mod message;
pub mod reconcile;
pub mod store;

pub use coordinator::{DualWriteCoordinator, DualWriteError, ErrorKind, Phase, Side, Step};
pub use drain::{Drain, DrainReport, InFlightGuard};
pub use hub::BroadcastHub;
pub use ingress::{MessageIngress, RelayError};
pub use message::{ChatMessage, ConnectionId, InboundEvent, MessageId, ServerEvent};
pub use reconcile::{Incident, IncidentKind, ReconciliationLedger, ReplayError};
pub use store::{StoreError, StoreHandle, StoreSession, TransactionalStore, TxState, WriteSpec};
