//! Scriptable in-memory store used across the relay-core tests.
//!
//! Failures can be forced per store with the `fail_*` flags, or per message by
//! putting a directive in the body: `#fail=write_a`, `#fail=commit_b`, ...
//! where the suffix is the store's tag.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::{
    BroadcastHub, ConnectionId, Drain, DualWriteCoordinator, MessageIngress,
    ReconciliationLedger, ServerEvent, StoreError, StoreSession, TransactionalStore, WriteSpec,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
pub struct Counters {
    pub begins: AtomicUsize,
    pub executes: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub releases: AtomicUsize,
}

impl Counters {
    pub fn get(&self, c: &AtomicUsize) -> usize {
        c.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Inner {
    name: String,
    tag: String,
    counters: Counters,
    rows: Mutex<Vec<WriteSpec>>,
    fail_begin: AtomicBool,
    fail_write: AtomicBool,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
    hang_on_write: AtomicBool,
    delay_ms: AtomicUsize,
}

impl Inner {
    async fn pause(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
        } else {
            tokio::task::yield_now().await;
        }
    }

    fn directive(&self, body: &str, op: &str) -> bool {
        body.contains(&format!("#fail={}_{}", op, self.tag))
    }
}

#[derive(Clone)]
pub struct FakeStore {
    inner: Arc<Inner>,
}

impl FakeStore {
    pub fn new(name: &str, tag: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                tag: tag.to_string(),
                ..Default::default()
            }),
        }
    }

    pub fn counters(&self) -> &Counters {
        &self.inner.counters
    }

    pub fn begins(&self) -> usize {
        self.inner.counters.begins.load(Ordering::SeqCst)
    }

    pub fn executes(&self) -> usize {
        self.inner.counters.executes.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.inner.counters.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.inner.counters.rollbacks.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.inner.counters.releases.load(Ordering::SeqCst)
    }

    /// Rows visible after commit.
    pub fn rows(&self) -> Vec<WriteSpec> {
        self.inner.rows.lock().clone()
    }

    pub fn fail_begin(&self, on: bool) {
        self.inner.fail_begin.store(on, Ordering::SeqCst);
    }

    pub fn fail_write(&self, on: bool) {
        self.inner.fail_write.store(on, Ordering::SeqCst);
    }

    pub fn fail_commit(&self, on: bool) {
        self.inner.fail_commit.store(on, Ordering::SeqCst);
    }

    pub fn fail_rollback(&self, on: bool) {
        self.inner.fail_rollback.store(on, Ordering::SeqCst);
    }

    pub fn hang_on_write(&self, on: bool) {
        self.inner.hang_on_write.store(on, Ordering::SeqCst);
    }

    pub fn delay(&self, ms: usize) {
        self.inner.delay_ms.store(ms, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransactionalStore for FakeStore {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        self.inner.pause().await;
        if self.inner.fail_begin.load(Ordering::SeqCst) {
            return Err(StoreError::Connection {
                store: self.inner.name.clone(),
                reason: "unreachable".into(),
            });
        }
        self.inner.counters.begins.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            inner: Arc::clone(&self.inner),
            pending: Vec::new(),
        }))
    }
}

struct FakeSession {
    inner: Arc<Inner>,
    pending: Vec<WriteSpec>,
}

#[async_trait]
impl StoreSession for FakeSession {
    async fn execute(&mut self, write: &WriteSpec) -> Result<(), StoreError> {
        self.inner.counters.executes.fetch_add(1, Ordering::SeqCst);
        if self.inner.hang_on_write.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.pause().await;
        if self.inner.fail_write.load(Ordering::SeqCst) || self.inner.directive(&write.body, "write")
        {
            return Err(StoreError::Write {
                store: self.inner.name.clone(),
                reason: "constraint violation".into(),
            });
        }
        self.pending.push(write.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.inner.pause().await;
        let scripted = self
            .pending
            .iter()
            .any(|w| self.inner.directive(&w.body, "commit"));
        if self.inner.fail_commit.load(Ordering::SeqCst) || scripted {
            self.pending.clear();
            return Err(StoreError::Commit {
                store: self.inner.name.clone(),
                reason: "connection lost".into(),
            });
        }
        self.inner.counters.commits.fetch_add(1, Ordering::SeqCst);
        self.inner.rows.lock().append(&mut self.pending);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.inner.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.pending.clear();
        if self.inner.fail_rollback.load(Ordering::SeqCst) {
            return Err(StoreError::Rollback {
                store: self.inner.name.clone(),
                reason: "session gone".into(),
            });
        }
        Ok(())
    }

    fn release(&mut self) {
        self.inner.counters.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Coordinator, hub and ingress wired over two fake stores.
pub struct Rig {
    pub a: FakeStore,
    pub b: FakeStore,
    pub hub: Arc<BroadcastHub>,
    pub ledger: Arc<ReconciliationLedger>,
    pub drain: Arc<Drain>,
    pub coordinator: Arc<DualWriteCoordinator>,
    pub ingress: Arc<MessageIngress>,
}

impl Rig {
    pub fn new() -> Self {
        let a = FakeStore::new("mysql", "a");
        let b = FakeStore::new("mssql", "b");
        let hub = Arc::new(BroadcastHub::new());
        let ledger = Arc::new(ReconciliationLedger::new());
        let drain = Drain::new();
        let coordinator = Arc::new(
            DualWriteCoordinator::new(Arc::new(a.clone()), Arc::new(b.clone()))
                .with_abort(drain.abort_signal()),
        );
        let ingress = Arc::new(MessageIngress::new(
            coordinator.clone(),
            hub.clone(),
            ledger.clone(),
            drain.clone(),
        ));
        Self {
            a,
            b,
            hub,
            ledger,
            drain,
            coordinator,
            ingress,
        }
    }

    pub fn connect(&self, id: &str) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::from(id);
        self.hub.join(id.clone(), tx);
        (id, rx)
    }
}

pub fn drain_events(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}
