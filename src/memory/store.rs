use crate::core::{Result, TxError};
use crate::transaction::{AdmissionQueue, NativeCallback, NativeTransactions, StatementExecutor};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::task::yield_now;

type Tables = BTreeMap<String, Vec<Row>>;

/// One stored row: a store-assigned id plus JSON fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: u64,
    pub fields: Map<String, Value>,
}

impl Row {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Missing fields count as NULL
    pub fn is_null(&self, field: &str) -> bool {
        self.get(field).is_none_or(Value::is_null)
    }
}

/// A statement received by the store and how it ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementRecord {
    pub statement: String,
    pub error: Option<String>,
}

impl StatementRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

struct Snapshot {
    tables: Tables,
    next_id: u64,
}

#[derive(Default)]
struct StoreState {
    tables: Tables,
    next_id: u64,
    open: Option<Snapshot>,
    injected_locks: u32,
    journal: Vec<StatementRecord>,
}

impl StoreState {
    fn begin(&mut self, contended: bool) -> std::result::Result<(), &'static str> {
        if self.open.is_some() {
            return Err("cannot start a transaction within a transaction");
        }
        if contended && self.injected_locks > 0 {
            self.injected_locks -= 1;
            return Err("database is locked");
        }
        self.open = Some(Snapshot {
            tables: self.tables.clone(),
            next_id: self.next_id,
        });
        Ok(())
    }

    fn commit(&mut self) -> std::result::Result<(), &'static str> {
        self.open
            .take()
            .map(|_| ())
            .ok_or("cannot commit - no transaction is active")
    }

    fn rollback(&mut self) -> std::result::Result<(), &'static str> {
        let snapshot = self
            .open
            .take()
            .ok_or("cannot rollback - no transaction is active")?;
        self.tables = snapshot.tables;
        self.next_id = snapshot.next_id;
        Ok(())
    }
}

#[derive(Default)]
struct StoreInner {
    state: Mutex<StoreState>,
    native_gate: tokio::sync::Mutex<()>,
    queue: Arc<AdmissionQueue>,
}

/// In-process table store with single-connection transaction semantics.
///
/// Through [`StatementExecutor`] it behaves like an embedded engine on one
/// connection: every transaction shares the same tables, a second `BEGIN`
/// is refused rather than queued, and contention can be injected. All
/// clones are the same connection and share one admission queue. Through
/// [`NativeTransactions`] it behaves like a trusted server: transactions wait
/// their turn on an internal gate.
///
/// Reads and writes yield to the scheduler after they apply, the way real
/// I/O would, so concurrent callers genuinely interleave.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row, creating the table on first use. Returns the new id.
    pub async fn insert(&self, table: &str, fields: Value) -> Result<u64> {
        let Value::Object(fields) = fields else {
            return Err(TxError::query(
                format!("INSERT INTO {}", table),
                "row must be a JSON object",
            ));
        };

        let id = {
            let mut state = self.inner.state.lock()?;
            state.next_id += 1;
            let id = state.next_id;
            state
                .tables
                .entry(table.to_string())
                .or_default()
                .push(Row { id, fields });
            id
        };

        yield_now().await;
        Ok(id)
    }

    /// All rows of `table`, in insertion order
    pub async fn select(&self, table: &str) -> Result<Vec<Row>> {
        let rows = {
            let state = self.inner.state.lock()?;
            state.tables.get(table).cloned().ok_or_else(|| {
                TxError::query(format!("SELECT * FROM {}", table), format!("no such table: {}", table))
            })?
        };

        yield_now().await;
        Ok(rows)
    }

    /// Merge `changes` into the row with `id`. Returns the number of rows changed.
    pub async fn update(&self, table: &str, id: u64, changes: Value) -> Result<usize> {
        let statement = format!("UPDATE {}", table);
        let Value::Object(changes) = changes else {
            return Err(TxError::query(statement, "changes must be a JSON object"));
        };

        let changed = {
            let mut state = self.inner.state.lock()?;
            let rows = state
                .tables
                .get_mut(table)
                .ok_or_else(|| TxError::query(statement, format!("no such table: {}", table)))?;

            match rows.iter_mut().find(|row| row.id == id) {
                Some(row) => {
                    row.fields.extend(changes);
                    1
                }
                None => 0,
            }
        };

        yield_now().await;
        Ok(changed)
    }

    /// Make the next `count` manual `BEGIN`s fail with "database is locked".
    pub fn inject_lock_contention(&self, count: u32) -> Result<()> {
        let mut state = self.inner.state.lock()?;
        state.injected_locks = state.injected_locks.saturating_add(count);
        Ok(())
    }

    /// Every transaction-control statement received so far
    pub fn statements(&self) -> Result<Vec<StatementRecord>> {
        Ok(self.inner.state.lock()?.journal.clone())
    }

    pub fn in_transaction(&self) -> Result<bool> {
        Ok(self.inner.state.lock()?.open.is_some())
    }

    fn apply(&self, statement: &str, contended: bool) -> Result<()> {
        let normalized = statement.trim().trim_end_matches(';').to_ascii_uppercase();
        let words: Vec<&str> = normalized.split_whitespace().collect();

        let mut state = self.inner.state.lock()?;
        let outcome = match words.as_slice() {
            ["BEGIN", rest @ ..] if is_begin_suffix(rest) => state.begin(contended),
            ["COMMIT"] | ["END"] | ["COMMIT", "TRANSACTION"] | ["END", "TRANSACTION"] => {
                state.commit()
            }
            ["ROLLBACK"] | ["ROLLBACK", "TRANSACTION"] => state.rollback(),
            _ => Err("syntax error"),
        };

        state.journal.push(StatementRecord {
            statement: statement.trim().to_string(),
            error: outcome.err().map(str::to_string),
        });

        outcome.map_err(|message| TxError::query(statement.trim(), message))
    }
}

fn is_begin_suffix(rest: &[&str]) -> bool {
    let rest = match rest.split_last() {
        Some((&"TRANSACTION", head)) => head,
        _ => rest,
    };
    matches!(rest, [] | ["DEFERRED"] | ["IMMEDIATE"] | ["EXCLUSIVE"])
}

#[async_trait]
impl StatementExecutor for MemoryStore {
    async fn execute(&self, statement: &str) -> Result<()> {
        self.apply(statement, true)?;
        yield_now().await;
        Ok(())
    }

    fn admission_queue(&self) -> Arc<AdmissionQueue> {
        Arc::clone(&self.inner.queue)
    }
}

#[async_trait]
impl NativeTransactions for MemoryStore {
    type Handle = MemoryStore;

    async fn transaction(&self, callback: NativeCallback<MemoryStore>) -> Result<()> {
        let _turn = self.inner.native_gate.lock().await;

        self.apply("BEGIN", false)?;
        match callback(self.clone()).await {
            Ok(()) => self.apply("COMMIT", false),
            Err(err) => {
                self.apply("ROLLBACK", false)?;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_select_update() {
        let store = MemoryStore::new();
        let id = store.insert("users", json!({ "name": "Alice" })).await.unwrap();

        assert_eq!(store.update("users", id, json!({ "run_id": "r1" })).await.unwrap(), 1);
        assert_eq!(store.update("users", 999, json!({ "run_id": "r2" })).await.unwrap(), 0);

        let rows = store.select("users").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&json!("Alice")));
        assert_eq!(rows[0].get("run_id"), Some(&json!("r1")));
        assert!(!rows[0].is_null("run_id"));
        assert!(rows[0].is_null("missing"));
    }

    #[tokio::test]
    async fn test_select_unknown_table() {
        let err = MemoryStore::new().select("ghosts").await.unwrap_err();
        assert_eq!(
            crate::core::failure_chain(&err),
            "Failed query: SELECT * FROM ghosts\nno such table: ghosts"
        );
    }

    #[tokio::test]
    async fn test_rollback_restores_snapshot() {
        let store = MemoryStore::new();
        store.insert("users", json!({ "name": "Alice" })).await.unwrap();

        store.execute("BEGIN IMMEDIATE").await.unwrap();
        store.insert("users", json!({ "name": "Bob" })).await.unwrap();
        assert!(store.in_transaction().unwrap());
        store.execute("ROLLBACK").await.unwrap();

        assert_eq!(store.select("users").await.unwrap().len(), 1);
        assert!(!store.in_transaction().unwrap());

        // Ids handed out inside the rolled-back transaction are reused
        assert_eq!(store.insert("users", json!({ "name": "Carol" })).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_nested_begin_refused() {
        let store = MemoryStore::new();
        store.execute("BEGIN").await.unwrap();

        let err = store.execute("begin deferred transaction;").await.unwrap_err();
        assert!(crate::core::failure_chain(&err).contains("cannot start a transaction within a transaction"));

        store.execute("COMMIT").await.unwrap();
        let journal = store.statements().unwrap();
        assert_eq!(journal.len(), 3);
        assert!(journal[0].succeeded());
        assert!(!journal[1].succeeded());
        assert_eq!(journal[1].statement, "begin deferred transaction;");
    }

    #[tokio::test]
    async fn test_injected_contention() {
        let store = MemoryStore::new();
        store.inject_lock_contention(1).unwrap();

        let err = store.execute("BEGIN").await.unwrap_err();
        assert_eq!(err.to_string(), "Failed query: BEGIN");
        assert!(crate::core::failure_chain(&err).ends_with("database is locked"));

        store.execute("BEGIN").await.unwrap();
        store.execute("END").await.unwrap();
    }

    #[tokio::test]
    async fn test_injected_contention_saturates() {
        let store = MemoryStore::new();
        store.inject_lock_contention(u32::MAX).unwrap();
        store.inject_lock_contention(u32::MAX).unwrap();

        assert!(store.execute("BEGIN").await.is_err());
        assert!(!store.in_transaction().unwrap());
    }

    #[test]
    fn test_clones_share_one_admission_queue() {
        let store = MemoryStore::new();
        let other = MemoryStore::new();

        assert!(Arc::ptr_eq(&store.admission_queue(), &store.clone().admission_queue()));
        assert!(!Arc::ptr_eq(&store.admission_queue(), &other.admission_queue()));
        assert!(!Arc::ptr_eq(&store.admission_queue(), AdmissionQueue::global()));
    }

    #[tokio::test]
    async fn test_statement_errors() {
        let store = MemoryStore::new();
        assert!(store.execute("COMMIT").await.is_err());
        assert!(store.execute("ROLLBACK").await.is_err());
        assert!(store.execute("BEGIN SOMETIMES").await.is_err());
        assert!(store.execute("VACUUM").await.is_err());
        assert!(store.statements().unwrap().iter().all(|record| !record.succeeded()));
    }

    #[tokio::test]
    async fn test_native_rolls_back_on_callback_error() {
        let store = MemoryStore::new();
        store.insert("users", json!({ "name": "Alice" })).await.unwrap();

        let result = store
            .transaction(Box::new(|tx: MemoryStore| {
                async move {
                    tx.insert("users", json!({ "name": "Mallory" })).await?;
                    Err::<(), _>(TxError::WorkAborted)
                }
                .boxed()
            }))
            .await;

        assert!(matches!(result, Err(TxError::WorkAborted)));
        assert_eq!(store.select("users").await.unwrap().len(), 1);
    }
}
