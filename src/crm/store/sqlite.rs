use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params_from_iter};
use serde_json::{Map, Value};

use super::{ChangeEvent, ChangeFeed, ChangeKind, RecordStore, SelectQuery};
use crate::crm::schema::{Column, ColumnKind, SQLITE_SCHEMA, Table};
use crate::errors::StoreError;

/// SQLite-backed `RecordStore` for local development and tests.
///
/// Access runs on tokio's blocking pool through `call`, the same way the
/// connection is shared behind `Arc<Mutex>`. Every successful write is
/// published to the change feed, standing in for the hosted store's realtime
/// notifications.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    feed: ChangeFeed,
}

impl SqliteStore {
    /// Open (or create) a database file and create any missing tables.
    pub fn new(path: &Path, feed: ChangeFeed) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        Self::init(conn, feed)
    }

    pub fn new_in_memory(feed: ChangeFeed) -> anyhow::Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        Self::init(conn, feed)
    }

    fn init(conn: Connection, feed: ChangeFeed) -> anyhow::Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        conn.execute_batch(SQLITE_SCHEMA)
            .context("Failed to create CRM tables")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            feed,
        })
    }

    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| StoreError::Database(anyhow::anyhow!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Database(anyhow::anyhow!("DB task panicked: {}", e)))?
    }

    #[cfg(test)]
    pub(crate) fn exec_sync(&self, sql: &str) {
        self.conn.lock().unwrap().execute_batch(sql).unwrap();
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn select(&self, query: &SelectQuery) -> Result<Vec<Value>, StoreError> {
        let query = query.clone();
        let rows = self.call(move |conn| select_rows(conn, &query)).await?;
        Ok(rows)
    }

    async fn insert(&self, table: Table, row: Value) -> Result<Value, StoreError> {
        let stored = self.call(move |conn| insert_row(conn, table, row)).await?;
        tracing::debug!(table = %table, "sqlite insert");
        self.feed.publish(ChangeEvent {
            table,
            kind: ChangeKind::Insert,
        });
        Ok(stored)
    }

    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value, StoreError> {
        let id = id.to_string();
        let stored = self
            .call(move |conn| update_row(conn, table, &id, patch))
            .await?;
        self.feed.publish(ChangeEvent {
            table,
            kind: ChangeKind::Update,
        });
        Ok(stored)
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        let removed = self
            .call(move |conn| {
                let sql = format!("DELETE FROM {} WHERE id = ?1", table.name());
                conn.execute(&sql, [&id]).map_err(|e| map_sqlite_error(table, e))
            })
            .await?;
        if removed > 0 {
            self.feed.publish(ChangeEvent {
                table,
                kind: ChangeKind::Delete,
            });
        }
        Ok(())
    }
}

// ── Row access ────────────────────────────────────────────────────────

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn select_rows(conn: &Connection, query: &SelectQuery) -> Result<Vec<Value>, StoreError> {
    let table = query.table;
    let mut sql = format!("SELECT {} FROM {}", column_list(table), table.name());
    let mut args = Vec::with_capacity(query.filters.len());

    for (i, (name, value)) in query.filters.iter().enumerate() {
        let column = known_column(table, name)?;
        args.push(to_sql(table, column, &Value::String(value.clone()))?);
        sql.push_str(if i == 0 { " WHERE " } else { " AND " });
        sql.push_str(&format!("{} = ?{}", column.name, i + 1));
    }

    if let Some(order) = &query.order {
        let column = known_column(table, order.column)?;
        // Postgres sorts NULLs last ascending and first descending
        if order.ascending {
            sql.push_str(&format!(
                " ORDER BY ({0} IS NULL) ASC, {0} ASC",
                column.name
            ));
        } else {
            sql.push_str(&format!(
                " ORDER BY ({0} IS NULL) DESC, {0} DESC",
                column.name
            ));
        }
    }

    let mut rows = query_rows(conn, table, &sql, args)?;

    for embed in &query.embeds {
        known_column(table, embed.foreign_key)?;
        let related = index_by_id(conn, embed.table)?;
        for row in rows.iter_mut() {
            let joined = row
                .get(embed.foreign_key)
                .and_then(Value::as_str)
                .and_then(|id| related.get(id))
                .cloned()
                .unwrap_or(Value::Null);
            if let Some(obj) = row.as_object_mut() {
                obj.insert(embed.alias.to_string(), joined);
            }
        }
    }

    Ok(rows)
}

fn index_by_id(conn: &Connection, table: Table) -> Result<HashMap<String, Value>, StoreError> {
    let sql = format!("SELECT {} FROM {}", column_list(table), table.name());
    let rows = query_rows(conn, table, &sql, Vec::new())?;
    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let id = row.get("id")?.as_str()?.to_string();
            Some((id, row))
        })
        .collect())
}

fn query_rows(
    conn: &Connection,
    table: Table,
    sql: &str,
    args: Vec<SqlValue>,
) -> Result<Vec<Value>, StoreError> {
    let columns = table.columns();
    let mut stmt = conn.prepare(sql).map_err(|e| map_sqlite_error(table, e))?;
    let rows = stmt
        .query_map(params_from_iter(args), |row| {
            let mut obj = Map::new();
            for (idx, column) in columns.iter().enumerate() {
                let raw: SqlValue = row.get(idx)?;
                obj.insert(column.name.to_string(), from_sql(column.kind, raw));
            }
            Ok(Value::Object(obj))
        })
        .map_err(|e| map_sqlite_error(table, e))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| map_sqlite_error(table, e))
}

fn fetch_by_id(conn: &Connection, table: Table, id: &str) -> Result<Option<Value>, StoreError> {
    let sql = format!(
        "SELECT {} FROM {} WHERE id = ?1",
        column_list(table),
        table.name()
    );
    let mut rows = query_rows(conn, table, &sql, vec![SqlValue::Text(id.to_string())])?;
    Ok(rows.pop())
}

fn insert_row(conn: &Connection, table: Table, row: Value) -> Result<Value, StoreError> {
    let mut obj = into_object(table, row)?;
    let id = match obj.get("id").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => uuid::Uuid::new_v4().to_string(),
    };
    obj.insert("id".into(), Value::String(id.clone()));
    let stamp = now();
    if !obj.get("created_at").is_some_and(|v| !v.is_null()) {
        obj.insert("created_at".into(), Value::String(stamp.clone()));
    }
    if table.has_updated_at() && !obj.get("updated_at").is_some_and(|v| !v.is_null()) {
        obj.insert("updated_at".into(), Value::String(stamp));
    }

    let mut names = Vec::with_capacity(obj.len());
    let mut args = Vec::with_capacity(obj.len());
    for (name, value) in &obj {
        let column = known_column(table, name)?;
        // Let column defaults apply to explicit nulls the schema marks NOT NULL
        if value.is_null() {
            continue;
        }
        names.push(column.name);
        args.push(to_sql(table, column, value)?);
    }

    let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.name(),
        names.join(", "),
        placeholders.join(", ")
    );
    conn.execute(&sql, params_from_iter(args))
        .map_err(|e| map_sqlite_error(table, e))?;

    fetch_by_id(conn, table, &id)?.ok_or_else(|| StoreError::NotFound {
        table: table.name().to_string(),
        id,
    })
}

fn update_row(conn: &Connection, table: Table, id: &str, patch: Value) -> Result<Value, StoreError> {
    let mut obj = into_object(table, patch)?;
    obj.remove("id");
    if table.has_updated_at() && !obj.contains_key("updated_at") {
        obj.insert("updated_at".into(), Value::String(now()));
    }

    let not_found = || StoreError::NotFound {
        table: table.name().to_string(),
        id: id.to_string(),
    };

    if obj.is_empty() {
        return fetch_by_id(conn, table, id)?.ok_or_else(not_found);
    }

    let mut sets = Vec::with_capacity(obj.len());
    let mut args = Vec::with_capacity(obj.len() + 1);
    for (i, (name, value)) in obj.iter().enumerate() {
        let column = known_column(table, name)?;
        sets.push(format!("{} = ?{}", column.name, i + 1));
        args.push(to_sql(table, column, value)?);
    }
    args.push(SqlValue::Text(id.to_string()));

    let sql = format!(
        "UPDATE {} SET {} WHERE id = ?{}",
        table.name(),
        sets.join(", "),
        args.len()
    );
    let changed = conn
        .execute(&sql, params_from_iter(args))
        .map_err(|e| map_sqlite_error(table, e))?;
    if changed == 0 {
        return Err(not_found());
    }

    fetch_by_id(conn, table, id)?.ok_or_else(not_found)
}

// ── Conversions ───────────────────────────────────────────────────────

fn column_list(table: Table) -> String {
    table
        .columns()
        .iter()
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ")
}

fn into_object(table: Table, value: Value) -> Result<Map<String, Value>, StoreError> {
    match value {
        Value::Object(obj) => Ok(obj),
        other => Err(StoreError::Rejected {
            code: Some("PGRST102".into()),
            message: format!("Expected a JSON object for {}, got {}", table, other),
        }),
    }
}

fn known_column(table: Table, name: &str) -> Result<&'static Column, StoreError> {
    table.column(name).ok_or_else(|| StoreError::Rejected {
        code: Some("PGRST204".into()),
        message: format!(
            "Could not find the '{}' column of '{}' in the schema cache",
            name, table
        ),
    })
}

fn invalid_input(table: Table, column: &Column, value: &Value) -> StoreError {
    StoreError::Rejected {
        code: Some("22P02".into()),
        message: format!(
            "invalid input for column \"{}\" of \"{}\": {}",
            column.name, table, value
        ),
    }
}

fn to_sql(table: Table, column: &Column, value: &Value) -> Result<SqlValue, StoreError> {
    let converted = match (column.kind, value) {
        (_, Value::Null) => Some(SqlValue::Null),
        (ColumnKind::Text, Value::String(s)) => Some(SqlValue::Text(s.clone())),
        (ColumnKind::Text, Value::Number(n)) => Some(SqlValue::Text(n.to_string())),
        (ColumnKind::Real, Value::Number(n)) => n.as_f64().map(SqlValue::Real),
        (ColumnKind::Real, Value::String(s)) => s.trim().parse::<f64>().ok().map(SqlValue::Real),
        (ColumnKind::Integer, Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .map(SqlValue::Integer),
        (ColumnKind::Integer, Value::String(s)) => {
            s.trim().parse::<i64>().ok().map(SqlValue::Integer)
        }
        (ColumnKind::Bool, Value::Bool(b)) => Some(SqlValue::Integer(i64::from(*b))),
        (ColumnKind::Bool, Value::String(s)) => match s.as_str() {
            "true" => Some(SqlValue::Integer(1)),
            "false" => Some(SqlValue::Integer(0)),
            _ => None,
        },
        _ => None,
    };
    converted.ok_or_else(|| invalid_input(table, column, value))
}

fn from_sql(kind: ColumnKind, raw: SqlValue) -> Value {
    match raw {
        SqlValue::Null | SqlValue::Blob(_) => Value::Null,
        SqlValue::Integer(i) => match kind {
            ColumnKind::Bool => Value::Bool(i != 0),
            ColumnKind::Real => serde_json::Number::from_f64(i as f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            _ => Value::from(i),
        },
        SqlValue::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        SqlValue::Text(s) => Value::String(s),
    }
}

/// Classify a SQLite failure the way the hosted store's codes are classified.
fn map_sqlite_error(table: Table, err: rusqlite::Error) -> StoreError {
    let message = err.to_string();
    let code = if message.contains("no such table") {
        Some("42P01")
    } else if message.contains("UNIQUE constraint failed") {
        Some("23505")
    } else if message.contains("FOREIGN KEY constraint failed") {
        Some("23503")
    } else if message.contains("NOT NULL constraint failed") {
        Some("23502")
    } else if message.contains("CHECK constraint failed") {
        Some("23514")
    } else {
        None
    };
    match code {
        Some(code) => StoreError::classify(table.name(), Some(code), &message),
        None => StoreError::Database(anyhow::Error::new(err)),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn store() -> SqliteStore {
        SqliteStore::new_in_memory(ChangeFeed::default()).unwrap()
    }

    #[tokio::test]
    async fn test_insert_fills_id_and_timestamps() {
        let store = store();
        let row = store
            .insert(
                Table::Staff,
                json!({"name": "Ana Silva", "email": "ana@wexlot.com"}),
            )
            .await
            .unwrap();

        assert_eq!(row["name"], "Ana Silva");
        assert_eq!(row["role"], "staff");
        assert!(uuid::Uuid::parse_str(row["id"].as_str().unwrap()).is_ok());
        assert!(row["created_at"].as_str().unwrap().ends_with('Z'));
        assert_eq!(row["avatar_url"], Value::Null);
    }

    #[tokio::test]
    async fn test_deal_defaults_and_numeric_columns() {
        let store = store();
        let row = store
            .insert(Table::Deals, json!({"title": "Fleet", "stage": "demo"}))
            .await
            .unwrap();
        assert_eq!(row["value"].as_f64(), Some(0.0));
        assert_eq!(row["probability"], 50);

        let row = store
            .insert(
                Table::Deals,
                json!({"title": "Depot", "stage": "demo", "value": "1500.5", "probability": 30}),
            )
            .await
            .unwrap();
        assert_eq!(row["value"].as_f64(), Some(1500.5));
    }

    #[tokio::test]
    async fn test_activity_completed_is_boolean() {
        let store = store();
        let row = store
            .insert(
                Table::Activities,
                json!({"type": "call", "description": "Ring back"}),
            )
            .await
            .unwrap();
        assert_eq!(row["completed"], false);

        let id = row["id"].as_str().unwrap();
        let row = store
            .update(Table::Activities, id, json!({"completed": true}))
            .await
            .unwrap();
        assert_eq!(row["completed"], true);
    }

    #[tokio::test]
    async fn test_update_missing_row_is_not_found() {
        let store = store();
        let err = store
            .update(Table::Deals, "nope", json!({"stage": "demo"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_bumps_updated_at() {
        let store = store();
        let row = store
            .insert(
                Table::Companies,
                json!({"name": "Acme", "updated_at": "2020-01-01T00:00:00.000Z"}),
            )
            .await
            .unwrap();
        let id = row["id"].as_str().unwrap();
        let row = store
            .update(Table::Companies, id, json!({"industry": "Logistics"}))
            .await
            .unwrap();
        assert_eq!(row["industry"], "Logistics");
        assert_ne!(row["updated_at"], "2020-01-01T00:00:00.000Z");
    }

    #[tokio::test]
    async fn test_unique_email_is_conflict() {
        let store = store();
        let staff = json!({"name": "Ana", "email": "ana@wexlot.com"});
        store.insert(Table::Staff, staff.clone()).await.unwrap();
        let err = store.insert(Table::Staff, staff).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_unknown_column_rejected() {
        let store = store();
        let err = store
            .insert(Table::Platforms, json!({"name": "X", "colour": "red"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("colour"));
        assert!(!err.is_missing_relation());
    }

    #[tokio::test]
    async fn test_missing_table_is_missing_relation() {
        let store = store();
        store.exec_sync("DROP TABLE interactions;");
        let err = store
            .select(&SelectQuery::all(Table::Interactions))
            .await
            .unwrap_err();
        assert!(err.is_missing_relation(), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_select_with_embeds() {
        let store = store();
        let contact = store
            .insert(
                Table::Contacts,
                json!({"first_name": "Jane", "last_name": "Doe"}),
            )
            .await
            .unwrap();
        store
            .insert(
                Table::Deals,
                json!({"title": "Jane deal", "stage": "demo", "contact_id": contact["id"]}),
            )
            .await
            .unwrap();
        store
            .insert(Table::Deals, json!({"title": "Orphan", "stage": "demo"}))
            .await
            .unwrap();

        let query = SelectQuery::all(Table::Deals)
            .embed("contact", Table::Contacts, "contact_id")
            .order_by("title", true);
        let rows = store.select(&query).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["title"], "Jane deal");
        assert_eq!(rows[0]["contact"]["first_name"], "Jane");
        assert_eq!(rows[1]["contact"], Value::Null);
    }

    #[tokio::test]
    async fn test_order_puts_nulls_last_ascending() {
        let store = store();
        for (desc, due) in [("later", Some("2024-03-01")), ("none", None), ("soon", Some("2024-01-01"))] {
            store
                .insert(
                    Table::Activities,
                    json!({"type": "task", "description": desc, "due_date": due}),
                )
                .await
                .unwrap();
        }
        let rows = store
            .select(&SelectQuery::all(Table::Activities).order_by("due_date", true))
            .await
            .unwrap();
        let order: Vec<&str> = rows
            .iter()
            .map(|r| r["description"].as_str().unwrap())
            .collect();
        assert_eq!(order, vec!["soon", "later", "none"]);

        let rows = store
            .select(&SelectQuery::all(Table::Activities).order_by("due_date", false))
            .await
            .unwrap();
        assert_eq!(rows[0]["description"], "none");
        assert_eq!(rows[1]["description"], "later");
    }

    #[tokio::test]
    async fn test_eq_filter() {
        let store = store();
        store
            .insert(Table::Incidents, json!({"title": "a", "description": "x"}))
            .await
            .unwrap();
        store
            .insert(
                Table::Incidents,
                json!({"title": "b", "description": "y", "status": "resolved"}),
            )
            .await
            .unwrap();
        let rows = store
            .select(&SelectQuery::all(Table::Incidents).eq("status", "ongoing"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], "a");
        assert_eq!(rows[0]["severity"], "medium");
    }

    #[tokio::test]
    async fn test_delete_sets_references_null() {
        let store = store();
        let platform = store
            .insert(Table::Platforms, json!({"name": "Fleet"}))
            .await
            .unwrap();
        let pid = platform["id"].as_str().unwrap().to_string();
        store
            .insert(
                Table::Deals,
                json!({"title": "D", "stage": "demo", "platform_id": pid}),
            )
            .await
            .unwrap();

        store.delete(Table::Platforms, &pid).await.unwrap();
        let deals = store.select(&SelectQuery::all(Table::Deals)).await.unwrap();
        assert_eq!(deals[0]["platform_id"], Value::Null);

        // Deleting again is a no-op, as with the hosted store
        store.delete(Table::Platforms, &pid).await.unwrap();
    }

    #[tokio::test]
    async fn test_writes_publish_change_events() {
        let feed = ChangeFeed::new(16);
        let mut rx = feed.subscribe();
        let store = SqliteStore::new_in_memory(feed).unwrap();

        let row = store
            .insert(Table::Platforms, json!({"name": "Fleet"}))
            .await
            .unwrap();
        let id = row["id"].as_str().unwrap();
        store
            .update(Table::Platforms, id, json!({"name": "Fleet Pro"}))
            .await
            .unwrap();
        store.delete(Table::Platforms, id).await.unwrap();

        let kinds: Vec<ChangeKind> = vec![
            rx.recv().await.unwrap().kind,
            rx.recv().await.unwrap().kind,
            rx.recv().await.unwrap().kind,
        ];
        assert_eq!(
            kinds,
            vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]
        );
    }

    #[tokio::test]
    async fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("crm.db");
        {
            let store = SqliteStore::new(&path, ChangeFeed::default()).unwrap();
            store
                .insert(Table::Platforms, json!({"name": "Fleet"}))
                .await
                .unwrap();
        }
        let store = SqliteStore::new(&path, ChangeFeed::default()).unwrap();
        let rows = store.select(&SelectQuery::all(Table::Platforms)).await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
