use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use paddock_core::{Row, row};
use paddock_engine::{RemoteError, RemoteStore};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Insert { table: String, row: Row },
    Update { table: String, id: Value, patch: Row },
    Delete { table: String, id: Value },
    SelectAll { table: String },
}

impl RemoteCall {
    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table, .. }
            | Self::Update { table, .. }
            | Self::Delete { table, .. }
            | Self::SelectAll { table } => table,
        }
    }

    /// Key of the entity the call targets, if it carries one.
    pub fn entity_key(&self) -> Option<String> {
        match self {
            Self::Insert { row, .. } => row::row_key(row),
            Self::Update { id, .. } | Self::Delete { id, .. } => row::entity_key(id),
            Self::SelectAll { .. } => None,
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::SelectAll { .. })
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

type FailRule = Box<dyn Fn(&RemoteCall) -> Option<RemoteError> + Send + Sync>;

struct Gate {
    entered: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

/// Held by a test while remote calls are paused.
pub struct GateHandle {
    entered: Receiver<()>,
    release: Sender<()>,
}

impl GateHandle {
    /// Block until a remote call is parked at the gate.
    pub fn wait_entered(&self, timeout: Duration) -> bool {
        self.entered.recv_timeout(timeout).is_ok()
    }

    /// Let one parked call through.
    pub fn release_one(&self) {
        let _ = self.release.send(());
    }
}

/// In-memory backend that records every call in order and fails on demand.
#[derive(Default)]
pub struct ScriptedRemote {
    tables: Mutex<BTreeMap<String, Vec<Row>>>,
    calls: Mutex<Vec<RemoteCall>>,
    rules: Mutex<Vec<FailRule>>,
    fail_next: Mutex<usize>,
    gate: Mutex<Option<Arc<Gate>>>,
}

impl ScriptedRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, table: &str, rows: Vec<Row>) {
        lock(&self.tables).insert(table.to_string(), rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        lock(&self.tables)
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        lock(&self.calls).clone()
    }

    pub fn mutation_calls(&self) -> Vec<RemoteCall> {
        self.calls().into_iter().filter(RemoteCall::is_mutation).collect()
    }

    pub fn calls_for(&self, table: &str, key: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.table() == table && c.entity_key().as_deref() == Some(key))
            .count()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Fail every call matching `pred` with a transient error.
    pub fn fail_when<F>(&self, message: &str, pred: F)
    where
        F: Fn(&RemoteCall) -> bool + Send + Sync + 'static,
    {
        let message = message.to_string();
        lock(&self.rules).push(Box::new(move |call| {
            pred(call).then(|| RemoteError::transient(message.clone()))
        }));
    }

    /// Reject every call matching `pred` as a permanent error.
    pub fn reject_when<F>(&self, message: &str, pred: F)
    where
        F: Fn(&RemoteCall) -> bool + Send + Sync + 'static,
    {
        let message = message.to_string();
        lock(&self.rules).push(Box::new(move |call| {
            pred(call).then(|| RemoteError::rejected(message.clone()))
        }));
    }

    /// Fail the next `n` calls, whatever they are.
    pub fn fail_next(&self, n: usize) {
        *lock(&self.fail_next) = n;
    }

    pub fn clear_failures(&self) {
        lock(&self.rules).clear();
        *lock(&self.fail_next) = 0;
    }

    /// Park every subsequent call until the handle releases it (or is dropped).
    pub fn pause(&self) -> GateHandle {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *lock(&self.gate) = Some(Arc::new(Gate {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        }));
        GateHandle {
            entered: entered_rx,
            release: release_tx,
        }
    }

    /// Stop parking new calls. Calls already parked still need a release.
    pub fn resume(&self) {
        *lock(&self.gate) = None;
    }

    fn enter(&self, call: RemoteCall) -> Result<(), RemoteError> {
        lock(&self.calls).push(call.clone());

        let gate = lock(&self.gate).clone();
        if let Some(gate) = gate {
            let _ = lock(&gate.entered).send(());
            let _ = lock(&gate.release).recv();
        }

        {
            let mut fail_next = lock(&self.fail_next);
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(RemoteError::transient("network unreachable"));
            }
        }

        for rule in lock(&self.rules).iter() {
            if let Some(err) = rule(&call) {
                return Err(err);
            }
        }
        Ok(())
    }
}

impl RemoteStore for ScriptedRemote {
    fn insert(&self, table: &str, row: &Row) -> Result<(), RemoteError> {
        self.enter(RemoteCall::Insert {
            table: table.to_string(),
            row: row.clone(),
        })?;

        let mut tables = lock(&self.tables);
        let rows = tables.entry(table.to_string()).or_default();
        if let Some(key) = row::row_key(row) {
            if rows.iter().any(|r| row::row_key(r).as_deref() == Some(key.as_str())) {
                return Err(RemoteError::rejected(format!("duplicate key {key}")));
            }
        }
        rows.push(row.clone());
        Ok(())
    }

    fn update(&self, table: &str, id: &Value, patch: &Row) -> Result<(), RemoteError> {
        self.enter(RemoteCall::Update {
            table: table.to_string(),
            id: id.clone(),
            patch: patch.clone(),
        })?;

        let key = row::entity_key(id);
        let mut tables = lock(&self.tables);
        let existing = tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|r| row::row_key(r) == key));
        match existing {
            Some(existing) => {
                *existing = row::overlay(existing, patch);
                Ok(())
            }
            None => Err(RemoteError::rejected(format!("no {table} row with id {id}"))),
        }
    }

    fn delete(&self, table: &str, id: &Value) -> Result<(), RemoteError> {
        self.enter(RemoteCall::Delete {
            table: table.to_string(),
            id: id.clone(),
        })?;

        let key = row::entity_key(id);
        if let Some(rows) = lock(&self.tables).get_mut(table) {
            rows.retain(|r| row::row_key(r) != key);
        }
        Ok(())
    }

    fn select_all(&self, table: &str) -> Result<Vec<Row>, RemoteError> {
        self.enter(RemoteCall::SelectAll {
            table: table.to_string(),
        })?;
        Ok(self.rows(table))
    }
}
