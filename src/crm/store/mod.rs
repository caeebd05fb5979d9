//! Generic record store seam.
//!
//! The CRM talks to its tables only through `RecordStore`: select with joins,
//! insert, update by id and delete by id, all moving `serde_json::Value` rows.
//! Typed mapping happens one layer up, in `dto`.

pub mod rest;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use super::schema::Table;
use crate::config::{StoreBackend, StoreConfig};
use crate::errors::StoreError;

pub use rest::RestStore;
pub use sqlite::SqliteStore;

/// A joined sub-object: `alias:table!foreign_key(*)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Embed {
    pub alias: &'static str,
    pub table: Table,
    pub foreign_key: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: &'static str,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub table: Table,
    pub embeds: Vec<Embed>,
    pub filters: Vec<(String, String)>,
    pub order: Option<Order>,
}

impl SelectQuery {
    pub fn all(table: Table) -> Self {
        Self {
            table,
            embeds: Vec::new(),
            filters: Vec::new(),
            order: None,
        }
    }

    pub fn embed(mut self, alias: &'static str, table: Table, foreign_key: &'static str) -> Self {
        self.embeds.push(Embed {
            alias,
            table,
            foreign_key,
        });
        self
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push((column.into(), value.into()));
        self
    }

    pub fn order_by(mut self, column: &'static str, ascending: bool) -> Self {
        self.order = Some(Order { column, ascending });
        self
    }

    /// The select list in PostgREST syntax, e.g. `*,contact:contacts!contact_id(*)`.
    pub fn select_clause(&self) -> String {
        let mut clause = String::from("*");
        for embed in &self.embeds {
            clause.push_str(&format!(
                ",{}:{}!{}(*)",
                embed.alias,
                embed.table.name(),
                embed.foreign_key
            ));
        }
        clause
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Short backend name for logs and status output.
    fn backend(&self) -> &'static str;

    async fn select(&self, query: &SelectQuery) -> Result<Vec<Value>, StoreError>;

    /// Insert one row and return the stored representation.
    async fn insert(&self, table: Table, row: Value) -> Result<Value, StoreError>;

    /// Patch the row with `id`. Fails with `NotFound` when no row matches.
    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value, StoreError>;

    async fn delete(&self, table: Table, id: &str) -> Result<(), StoreError>;
}

// ── Change notifications ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
}

/// Fan-out of row change events. Contents are only a refresh trigger.
#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // No subscribers is fine: nobody is waiting on the change.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Open the store selected by configuration.
pub fn open_store(config: &StoreConfig, feed: ChangeFeed) -> anyhow::Result<Arc<dyn RecordStore>> {
    match config.backend {
        StoreBackend::Sqlite => {
            let store = SqliteStore::new(&config.sqlite_path, feed)?;
            Ok(Arc::new(store))
        }
        StoreBackend::Rest => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("store.url is required for the rest backend"))?;
            let key = config
                .api_key
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("store.api_key is required for the rest backend"))?;
            Ok(Arc::new(RestStore::new(url, key)?))
        }
    }
}

#[cfg(test)]
pub mod testing {
    //! Store wrapper that records every call and can be told to fail.

    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum StoreOp {
        Select(Table),
        Insert(Table, Value),
        Update(Table, String, Value),
        Delete(Table, String),
    }

    impl StoreOp {
        pub fn is_mutation(&self) -> bool {
            !matches!(self, StoreOp::Select(_))
        }
    }

    pub struct RecordingStore {
        inner: Arc<dyn RecordStore>,
        ops: Mutex<Vec<StoreOp>>,
        failing_selects: Mutex<HashSet<Table>>,
        failing_writes: Mutex<HashSet<Table>>,
    }

    impl RecordingStore {
        pub fn new(inner: Arc<dyn RecordStore>) -> Self {
            Self {
                inner,
                ops: Mutex::new(Vec::new()),
                failing_selects: Mutex::new(HashSet::new()),
                failing_writes: Mutex::new(HashSet::new()),
            }
        }

        pub fn in_memory() -> Arc<Self> {
            let inner = SqliteStore::new_in_memory(ChangeFeed::default()).unwrap();
            Arc::new(Self::new(Arc::new(inner)))
        }

        pub fn ops(&self) -> Vec<StoreOp> {
            self.ops.lock().unwrap().clone()
        }

        pub fn mutations(&self) -> Vec<StoreOp> {
            self.ops().into_iter().filter(StoreOp::is_mutation).collect()
        }

        pub fn clear(&self) {
            self.ops.lock().unwrap().clear();
        }

        pub fn fail_selects_on(&self, table: Table) {
            self.failing_selects.lock().unwrap().insert(table);
        }

        pub fn fail_writes_on(&self, table: Table) {
            self.failing_writes.lock().unwrap().insert(table);
        }

        pub fn heal(&self) {
            self.failing_selects.lock().unwrap().clear();
            self.failing_writes.lock().unwrap().clear();
        }

        fn write_fails(&self, table: Table) -> Result<(), StoreError> {
            if self.failing_writes.lock().unwrap().contains(&table) {
                return Err(StoreError::RowLevelSecurity {
                    table: table.name().to_string(),
                    message: "new row violates row-level security policy".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RecordStore for RecordingStore {
        fn backend(&self) -> &'static str {
            "recording"
        }

        async fn select(&self, query: &SelectQuery) -> Result<Vec<Value>, StoreError> {
            self.ops.lock().unwrap().push(StoreOp::Select(query.table));
            if self.failing_selects.lock().unwrap().contains(&query.table) {
                return Err(StoreError::MissingRelation {
                    relation: query.table.name().to_string(),
                });
            }
            self.inner.select(query).await
        }

        async fn insert(&self, table: Table, row: Value) -> Result<Value, StoreError> {
            self.ops
                .lock()
                .unwrap()
                .push(StoreOp::Insert(table, row.clone()));
            self.write_fails(table)?;
            self.inner.insert(table, row).await
        }

        async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value, StoreError> {
            self.ops
                .lock()
                .unwrap()
                .push(StoreOp::Update(table, id.to_string(), patch.clone()));
            self.write_fails(table)?;
            self.inner.update(table, id, patch).await
        }

        async fn delete(&self, table: Table, id: &str) -> Result<(), StoreError> {
            self.ops
                .lock()
                .unwrap()
                .push(StoreOp::Delete(table, id.to_string()));
            self.write_fails(table)?;
            self.inner.delete(table, id).await
        }
    }
}
