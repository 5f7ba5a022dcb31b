//! Dual-write coordinator
//!
//! Persists one message into two independent transactional stores. There is
//! no shared transaction manager, so the coordinator cannot make the two
//! commits atomic; what it does guarantee is that every outcome is classified:
//!
//! | failing step | rolled back | result                              |
//! |--------------|-------------|-------------------------------------|
//! | begin A      | -           | `Connection(A)`                     |
//! | begin B      | A           | `Connection(B)`                     |
//! | write A      | A, B        | `Write(A)`                          |
//! | write B      | A, B        | `Write(B)`                          |
//! | commit A     | B           | `InconsistentState(A)`              |
//! | commit B     | -           | `PartialCommit(committed A, failed B)` |
//!
//! Steps run strictly in sequence so an early failure never starts work on
//! the other store. Handles are dropped (released) when the invocation
//! returns, whatever the path.

use crate::message::{ChatMessage, MessageId};
use crate::store::{StoreError, StoreHandle, TransactionalStore, TxState, WriteSpec};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Which of the two stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    A,
    B,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::A => f.write_str("a"),
            Side::B => f.write_str("b"),
        }
    }
}

/// Progress of one invocation. Each phase is reached when the step of the
/// same name succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ABegun,
    BBegun,
    AWritten,
    BWritten,
    ACommitted,
    BCommitted,
}

impl Phase {
    /// Handles to roll back when a step fails (or is aborted) in this phase.
    pub fn rollback_plan(self) -> &'static [Side] {
        match self {
            Phase::Idle => &[],
            Phase::ABegun => &[Side::A],
            Phase::BBegun | Phase::AWritten => &[Side::A, Side::B],
            // A's commit outcome is unknown; only B is still ours to undo.
            Phase::BWritten => &[Side::B],
            Phase::ACommitted | Phase::BCommitted => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    BeginA,
    BeginB,
    WriteA,
    WriteB,
    CommitA,
    CommitB,
}

impl Step {
    pub const SEQUENCE: [Step; 6] = [
        Step::BeginA,
        Step::BeginB,
        Step::WriteA,
        Step::WriteB,
        Step::CommitA,
        Step::CommitB,
    ];

    pub fn side(self) -> Side {
        match self {
            Step::BeginA | Step::WriteA | Step::CommitA => Side::A,
            Step::BeginB | Step::WriteB | Step::CommitB => Side::B,
        }
    }

    /// Phase reached when this step succeeds.
    pub fn reaches(self) -> Phase {
        match self {
            Step::BeginA => Phase::ABegun,
            Step::BeginB => Phase::BBegun,
            Step::WriteA => Phase::AWritten,
            Step::WriteB => Phase::BWritten,
            Step::CommitA => Phase::ACommitted,
            Step::CommitB => Phase::BCommitted,
        }
    }

    /// Commits are never interrupted: cutting one short would leave the
    /// store's outcome unknown.
    pub fn interruptible(self) -> bool {
        !matches!(self, Step::CommitA | Step::CommitB)
    }
}

/// Coarse classification used for logging and user-facing notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Write,
    InconsistentState,
    PartialCommit,
    ShutdownAbort,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Connection => "connection_error",
            ErrorKind::Write => "write_error",
            ErrorKind::InconsistentState => "inconsistent_state",
            ErrorKind::PartialCommit => "partial_commit",
            ErrorKind::ShutdownAbort => "shutdown_abort",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum DualWriteError {
    #[error("store {store} unavailable for message {message_id}")]
    Connection {
        message_id: MessageId,
        store: String,
        #[source]
        source: StoreError,
    },

    #[error("store {store} rejected message {message_id}, both sides rolled back")]
    Write {
        message_id: MessageId,
        store: String,
        #[source]
        source: StoreError,
    },

    #[error("commit outcome on {store} unknown for message {message_id}")]
    InconsistentState {
        message_id: MessageId,
        store: String,
        #[source]
        source: StoreError,
    },

    #[error("message {message_id} committed on {committed} but not on {failed}")]
    PartialCommit {
        message_id: MessageId,
        committed: String,
        failed: String,
        #[source]
        source: StoreError,
    },

    #[error("message {message_id} aborted by shutdown in phase {phase:?}")]
    ShutdownAbort { message_id: MessageId, phase: Phase },
}

impl DualWriteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DualWriteError::Connection { .. } => ErrorKind::Connection,
            DualWriteError::Write { .. } => ErrorKind::Write,
            DualWriteError::InconsistentState { .. } => ErrorKind::InconsistentState,
            DualWriteError::PartialCommit { .. } => ErrorKind::PartialCommit,
            DualWriteError::ShutdownAbort { .. } => ErrorKind::ShutdownAbort,
        }
    }

    pub fn message_id(&self) -> MessageId {
        match self {
            DualWriteError::Connection { message_id, .. }
            | DualWriteError::Write { message_id, .. }
            | DualWriteError::InconsistentState { message_id, .. }
            | DualWriteError::PartialCommit { message_id, .. }
            | DualWriteError::ShutdownAbort { message_id, .. } => *message_id,
        }
    }

    /// True when the stores may now disagree and an operator has to look.
    pub fn needs_reconciliation(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InconsistentState | ErrorKind::PartialCommit
        )
    }
}

enum StepOutcome {
    Done,
    Failed(StoreError),
    Aborted,
}

/// State of one `commit_to_both` call. Owns both handles, so leaving scope
/// releases them.
struct Invocation {
    phase: Phase,
    a: Option<StoreHandle>,
    b: Option<StoreHandle>,
}

impl Invocation {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            a: None,
            b: None,
        }
    }

    fn handle(&mut self, side: Side) -> Option<&mut StoreHandle> {
        match side {
            Side::A => self.a.as_mut(),
            Side::B => self.b.as_mut(),
        }
    }

    async fn run(
        &mut self,
        step: Step,
        store: &dyn TransactionalStore,
        write: &WriteSpec,
    ) -> Result<(), StoreError> {
        match step {
            Step::BeginA => self.a = Some(StoreHandle::begin(store).await?),
            Step::BeginB => self.b = Some(StoreHandle::begin(store).await?),
            Step::WriteA | Step::WriteB | Step::CommitA | Step::CommitB => {
                let handle = self
                    .handle(step.side())
                    .ok_or_else(|| StoreError::InvalidState {
                        store: store.name().to_string(),
                        expected: TxState::Active,
                        actual: TxState::Idle,
                    })?;
                if matches!(step, Step::WriteA | Step::WriteB) {
                    handle.execute(write).await?;
                } else {
                    handle.commit().await?;
                }
            }
        }
        self.phase = step.reaches();
        Ok(())
    }

    async fn unwind(&mut self) {
        for side in self.phase.rollback_plan() {
            if let Some(handle) = self.handle(*side) {
                handle.rollback().await;
            }
        }
    }
}

/// Resolves once the abort flag is raised. A dropped sender means no abort
/// will ever come.
async fn aborted(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|abort| *abort).await.is_err() {
        std::future::pending::<()>().await;
    }
}

pub struct DualWriteCoordinator {
    a: Arc<dyn TransactionalStore>,
    b: Arc<dyn TransactionalStore>,
    abort: watch::Receiver<bool>,
}

impl DualWriteCoordinator {
    pub fn new(a: Arc<dyn TransactionalStore>, b: Arc<dyn TransactionalStore>) -> Self {
        let (_tx, abort) = watch::channel(false);
        Self { a, b, abort }
    }

    /// Observe a shutdown abort signal (see [`crate::drain::Drain`]).
    pub fn with_abort(mut self, abort: watch::Receiver<bool>) -> Self {
        self.abort = abort;
        self
    }

    pub fn store(&self, side: Side) -> &Arc<dyn TransactionalStore> {
        match side {
            Side::A => &self.a,
            Side::B => &self.b,
        }
    }

    /// Write `message` to both stores.
    pub async fn commit_to_both(&self, message: &ChatMessage) -> Result<MessageId, DualWriteError> {
        let write = WriteSpec::from(message);
        let mut abort = self.abort.clone();
        let mut inv = Invocation::new();

        for step in Step::SEQUENCE {
            let store = self.store(step.side()).as_ref();
            let outcome = if step.interruptible() {
                tokio::select! {
                    biased;
                    _ = aborted(&mut abort) => StepOutcome::Aborted,
                    res = inv.run(step, store, &write) => match res {
                        Ok(()) => StepOutcome::Done,
                        Err(e) => StepOutcome::Failed(e),
                    },
                }
            } else {
                match inv.run(step, store, &write).await {
                    Ok(()) => StepOutcome::Done,
                    Err(e) => StepOutcome::Failed(e),
                }
            };

            match outcome {
                StepOutcome::Done => {}
                StepOutcome::Failed(source) => {
                    inv.unwind().await;
                    return Err(self.classify(step, message.id, source));
                }
                StepOutcome::Aborted => {
                    let phase = inv.phase;
                    inv.unwind().await;
                    warn!(message_id = %message.id, ?phase, "dual write aborted by shutdown");
                    return Err(DualWriteError::ShutdownAbort {
                        message_id: message.id,
                        phase,
                    });
                }
            }
        }

        debug!(
            message_id = %message.id,
            a = self.a.name(),
            b = self.b.name(),
            "dual write committed"
        );
        Ok(message.id)
    }

    fn classify(&self, step: Step, message_id: MessageId, source: StoreError) -> DualWriteError {
        let store = self.store(step.side()).name().to_string();
        match step {
            Step::BeginA | Step::BeginB => DualWriteError::Connection {
                message_id,
                store,
                source,
            },
            Step::WriteA | Step::WriteB => DualWriteError::Write {
                message_id,
                store,
                source,
            },
            Step::CommitA => DualWriteError::InconsistentState {
                message_id,
                store,
                source,
            },
            Step::CommitB => DualWriteError::PartialCommit {
                message_id,
                committed: self.a.name().to_string(),
                failed: store,
                source,
            },
        }
    }

    /// Write `message` to a single store. Only used to reconcile a partial
    /// commit on operator request, never retried automatically.
    pub async fn replay(&self, side: Side, message: &ChatMessage) -> Result<(), StoreError> {
        let store = self.store(side).as_ref();
        let mut handle = StoreHandle::begin(store).await?;
        let write = WriteSpec::from(message);
        let result = match handle.execute(&write).await {
            Ok(()) => handle.commit().await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            handle.rollback().await;
        }
        result
    }
}
