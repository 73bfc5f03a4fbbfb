//! In-memory storage backend.
//!
//! Rows live in insertion order per table. Writers are serialized by a
//! single writer lock; a transaction stages a private copy of the tables
//! and swaps it in on commit, so readers only ever observe committed state.

use super::{
    ChangeFeed, Column, ColumnType, Direction, FeedSlot, PendingEvents, Query, Session, Storage,
    TableSchema,
};
use crate::error::{Result, SyncError};
use crate::types::{ChangeEvent, PrimaryKey, Record};
use crate::visor::Visor;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;

type Tables = HashMap<String, Table>;

/// Declared columns plus rows. Every row carries every column, in
/// declaration order, with values stored the way SQLite would store them.
#[derive(Clone, Debug)]
struct Table {
    name: String,
    columns: Vec<Column>,
    rows: Vec<Record>,
}

impl Table {
    fn kind(&self, field: &str) -> Result<ColumnType> {
        self.columns
            .iter()
            .find(|c| c.name == field)
            .map(|c| c.kind)
            .ok_or_else(|| SyncError::Storage(format!("no such column: {}", field)))
    }

    /// Full row for `fields`; absent columns are null.
    fn shape(&self, fields: &Record) -> Result<Record> {
        if let Some(unknown) = fields.keys().find(|f| self.kind(f).is_err()) {
            return Err(SyncError::Storage(format!(
                "table {} has no column named {}",
                self.name, unknown
            )));
        }
        Ok(self
            .columns
            .iter()
            .map(|c| {
                let value = fields.get(&c.name).map_or(Value::Null, |v| c.kind.coerce(v));
                (c.name.clone(), value)
            })
            .collect())
    }

    /// A client-supplied key as stored in the primary key column.
    fn stored_key(&self, visor: &Visor, key: &PrimaryKey) -> Result<PrimaryKey> {
        let kind = self.kind(&visor.primary_key)?;
        Ok(PrimaryKey::from_value(&kind.coerce(&key.to_value())).unwrap_or_else(|| key.clone()))
    }
}

/// Storage backed by process memory.
#[derive(Default)]
pub struct MemoryStorage {
    tables: RwLock<Tables>,
    /// Held for the duration of any write or transaction.
    writer: Mutex<()>,
    feed: FeedSlot,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed rows of a table, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }
}

impl Storage for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn session(&self) -> Result<Box<dyn Session + '_>> {
        Ok(Box::new(MemorySession {
            storage: self,
            staged: None,
            pending: PendingEvents::new(self.feed.get()),
        }))
    }

    fn apply_schema(&self, schema: &TableSchema) -> Result<()> {
        if schema.columns.is_empty() {
            return Err(SyncError::Storage(format!("table {} has no columns", schema.name)));
        }
        let mut table = Table {
            name: schema.name.clone(),
            columns: schema.columns.clone(),
            rows: Vec::with_capacity(schema.rows.len()),
        };
        // Seeding uses the insert path so keys and values match a real insert.
        let pk = schema
            .columns
            .iter()
            .find(|c| c.kind == ColumnType::Serial)
            .unwrap_or(&schema.columns[0]);
        let seeder = Visor::new(schema.name.clone(), schema.name.clone(), pk.name.clone());
        for row in &schema.rows {
            insert_row(&mut table, &seeder, row)?;
        }

        let _writer = self.writer.lock();
        self.tables.write().insert(schema.name.clone(), table);
        Ok(())
    }

    fn install_feed(&self, feed: ChangeFeed) {
        self.feed.install(feed);
    }
}

/// Private copy of the tables for an open transaction.
struct Staged<'a> {
    writer: MutexGuard<'a, ()>,
    tables: Tables,
}

struct MemorySession<'a> {
    storage: &'a MemoryStorage,
    staged: Option<Staged<'a>>,
    pending: PendingEvents,
}

impl MemorySession<'_> {
    /// Run a write against staged tables, or directly against the live
    /// tables under the writer lock.
    fn write<T>(&mut self, op: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        match self.staged.as_mut() {
            Some(staged) => op(&mut staged.tables),
            None => {
                let _writer = self.storage.writer.lock();
                let mut tables = self.storage.tables.write();
                op(&mut tables)
            }
        }
    }

    fn publish(&mut self, visor: &Visor, keys: Vec<PrimaryKey>) {
        let in_tx = self.staged.is_some();
        for key in keys {
            self.pending
                .record(ChangeEvent::new(visor.table.clone(), key), in_tx);
        }
    }
}

impl Session for MemorySession<'_> {
    fn query(&mut self, visor: &Visor, query: &Query) -> Result<Vec<Record>> {
        match &self.staged {
            Some(staged) => select(&staged.tables, visor, query),
            None => select(&self.storage.tables.read(), visor, query),
        }
    }

    fn insert(&mut self, visor: &Visor, fields: &Record) -> Result<Record> {
        let record = self.write(|tables| insert_row(table_mut(tables, &visor.table)?, visor, fields))?;
        let key = visor.key_of(&record)?;
        self.publish(visor, vec![key]);
        Ok(record)
    }

    fn update(&mut self, visor: &Visor, key: &PrimaryKey, changes: &Record) -> Result<usize> {
        let touched = self.write(|tables| {
            let table = table_mut(tables, &visor.table)?;
            let key = table.stored_key(visor, key)?;
            let mut coerced = Vec::with_capacity(changes.len());
            for (field, value) in changes {
                coerced.push((field.clone(), table.kind(field)?.coerce(value)));
            }

            let mut touched = Vec::new();
            for row in table
                .rows
                .iter_mut()
                .filter(|row| row_key(visor, row).as_ref() == Some(&key))
            {
                for (field, value) in &coerced {
                    row.insert(field.clone(), value.clone());
                }
                touched.extend(row_key(visor, row));
            }
            Ok(touched)
        })?;

        let affected = touched.len();
        if !changes.is_empty() {
            self.publish(visor, touched);
        }
        Ok(affected)
    }

    fn delete(&mut self, visor: &Visor, key: &PrimaryKey) -> Result<usize> {
        let removed = self.write(|tables| {
            let table = table_mut(tables, &visor.table)?;
            let key = table.stored_key(visor, key)?;
            let before = table.rows.len();
            table
                .rows
                .retain(|row| row_key(visor, row).as_ref() != Some(&key));
            Ok(vec![key; before - table.rows.len()])
        })?;

        let affected = removed.len();
        self.publish(visor, removed);
        Ok(affected)
    }

    fn begin(&mut self) -> Result<()> {
        if self.staged.is_some() {
            return Err(SyncError::Transaction("transaction already open".into()));
        }
        let writer = self.storage.writer.lock();
        let tables = self.storage.tables.read().clone();
        self.staged = Some(Staged { writer, tables });
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| SyncError::Transaction("no open transaction".into()))?;
        *self.storage.tables.write() = staged.tables;
        // Writer lock is released here, before events go out.
        drop(staged.writer);
        self.pending.flush();
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.staged = None;
        self.pending.discard();
        Ok(())
    }
}

fn table_mut<'t>(tables: &'t mut Tables, table: &str) -> Result<&'t mut Table> {
    tables
        .get_mut(table)
        .ok_or_else(|| SyncError::Storage(format!("no such table: {}", table)))
}

fn row_key(visor: &Visor, row: &Record) -> Option<PrimaryKey> {
    row.get(&visor.primary_key).and_then(PrimaryKey::from_value)
}

fn insert_row(table: &mut Table, visor: &Visor, fields: &Record) -> Result<Record> {
    let mut record = table.shape(fields)?;

    match record.get(&visor.primary_key).and_then(PrimaryKey::from_value) {
        Some(key) => {
            if table.rows.iter().any(|row| row_key(visor, row).as_ref() == Some(&key)) {
                return Err(SyncError::Storage(format!(
                    "UNIQUE constraint failed: {}.{}",
                    visor.table, visor.primary_key
                )));
            }
        }
        None => {
            let next = table
                .rows
                .iter()
                .filter_map(|row| match row_key(visor, row) {
                    Some(PrimaryKey::Int(i)) => Some(i),
                    _ => None,
                })
                .max()
                .unwrap_or(0)
                + 1;
            record.insert(visor.primary_key.clone(), Value::from(next));
        }
    }

    table.rows.push(record.clone());
    Ok(record)
}

fn select(tables: &Tables, visor: &Visor, query: &Query) -> Result<Vec<Record>> {
    let table = tables
        .get(&visor.table)
        .ok_or_else(|| SyncError::Storage(format!("no such table: {}", visor.table)))?;

    let mut filters = Vec::with_capacity(query.filters.len());
    for (field, value) in &query.filters {
        filters.push((field, table.kind(field)?.coerce(value)));
    }
    let link = match &query.foreign_key {
        Some(fk) => {
            let kind = table.kind(&fk.field)?;
            let values: Vec<Value> = fk.values.iter().map(|v| kind.coerce(v)).collect();
            Some((&fk.field, values))
        }
        None => None,
    };
    for (field, _) in &query.order {
        table.kind(field)?;
    }

    let mut selected: Vec<Record> = table
        .rows
        .iter()
        .filter(|row| {
            filters
                .iter()
                .all(|(field, value)| row.get(*field).unwrap_or(&Value::Null) == value)
        })
        .filter(|row| match &link {
            Some((field, values)) => row
                .get(*field)
                .map(|v| !v.is_null() && values.contains(v))
                .unwrap_or(false),
            None => true,
        })
        .cloned()
        .collect();

    if !query.order.is_empty() {
        // Stable sort keeps insertion order between equal rows.
        selected.sort_by(|a, b| {
            for (field, direction) in &query.order {
                let ord = compare_values(
                    a.get(field).unwrap_or(&Value::Null),
                    b.get(field).unwrap_or(&Value::Null),
                );
                let ord = match direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }

    Ok(selected)
}

/// Total order over JSON values: null < bool < number < string < other.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) | Value::Object(_) => 4,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{change_queue, ColumnType, Transaction};
    use serde_json::json;

    fn obj(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    fn storage_with_tasks() -> MemoryStorage {
        let storage = MemoryStorage::new();
        storage
            .apply_schema(
                &TableSchema::new("tasks")
                    .column("id", ColumnType::Serial)
                    .column("title", ColumnType::Text)
                    .row(json!({"id": 2, "title": "b"}))
                    .row(json!({"id": 1, "title": "a"})),
            )
            .unwrap();
        storage
    }

    #[test]
    fn test_insert_assigns_next_key() {
        let storage = storage_with_tasks();
        let visor = Visor::new("Task", "tasks", "id");
        let mut session = storage.session().unwrap();

        let record = session.insert(&visor, &obj(json!({"title": "c"}))).unwrap();
        assert_eq!(record["id"], json!(3));
    }

    #[test]
    fn test_order_and_filter() {
        let storage = storage_with_tasks();
        let visor = Visor::new("Task", "tasks", "id");
        let mut session = storage.session().unwrap();

        let rows = session
            .query(&visor, &Query::all().order_by("id", Direction::Asc))
            .unwrap();
        assert_eq!(rows[0]["id"], json!(1));

        let rows = session.query(&visor, &Query::all().filter("title", "b")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(2));
    }

    #[test]
    fn test_transaction_rollback_on_drop() {
        let storage = storage_with_tasks();
        let visor = Visor::new("Task", "tasks", "id");
        let mut session = storage.session().unwrap();

        {
            let mut tx = Transaction::begin(session.as_mut()).unwrap();
            tx.update(&visor, &PrimaryKey::Int(1), &obj(json!({"title": "changed"})))
                .unwrap();
            // dropped without commit
        }

        let rows = storage.rows("tasks");
        assert!(rows.iter().all(|r| r["title"] != json!("changed")));
    }

    #[test]
    fn test_uncommitted_writes_invisible_to_readers() {
        let storage = storage_with_tasks();
        let visor = Visor::new("Task", "tasks", "id");
        let mut session = storage.session().unwrap();

        let mut tx = Transaction::begin(session.as_mut()).unwrap();
        tx.delete(&visor, &PrimaryKey::Int(1)).unwrap();
        assert_eq!(storage.rows("tasks").len(), 2);
        tx.commit().unwrap();
        assert_eq!(storage.rows("tasks").len(), 1);
    }

    #[test]
    fn test_events_published_after_commit() {
        let storage = storage_with_tasks();
        let (feed, events) = change_queue();
        storage.install_feed(feed);
        let visor = Visor::new("Task", "tasks", "id");
        let mut session = storage.session().unwrap();

        let mut tx = Transaction::begin(session.as_mut()).unwrap();
        tx.update(&visor, &PrimaryKey::Int(2), &obj(json!({"title": "bb"})))
            .unwrap();
        assert!(events.try_recv().is_err());
        tx.commit().unwrap();

        assert_eq!(events.try_recv().unwrap(), ChangeEvent::new("tasks", PrimaryKey::Int(2)));
    }

    #[test]
    fn test_rows_carry_every_column() {
        let storage = storage_with_tasks();
        let visor = Visor::new("Task", "tasks", "id");
        let mut session = storage.session().unwrap();

        let record = session.insert(&visor, &obj(json!({}))).unwrap();
        assert_eq!(Value::Object(record), json!({"id": 3, "title": null}));

        let err = session
            .update(&visor, &PrimaryKey::Int(1), &obj(json!({"nosuch": 1})))
            .unwrap_err();
        assert!(err.to_string().contains("no such column: nosuch"));

        let err = session.insert(&visor, &obj(json!({"nosuch": 1}))).unwrap_err();
        assert!(err.to_string().contains("has no column named nosuch"));

        let err = session
            .query(&visor, &Query::all().filter("nosuch", 1))
            .unwrap_err();
        assert!(err.to_string().contains("no such column"));
    }

    #[test]
    fn test_text_key_matches_integer_column() {
        let storage = storage_with_tasks();
        let (feed, events) = change_queue();
        storage.install_feed(feed);
        let visor = Visor::new("Task", "tasks", "id");
        let mut session = storage.session().unwrap();

        let affected = session
            .update(&visor, &PrimaryKey::Str("1".into()), &obj(json!({"title": true})))
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(events.try_recv().unwrap(), ChangeEvent::new("tasks", PrimaryKey::Int(1)));

        let rows = session.query(&visor, &Query::all().filter("id", "1")).unwrap();
        assert_eq!(rows[0]["title"], json!("1"));
    }

    #[test]
    fn test_compare_values_ranks() {
        assert_eq!(compare_values(&Value::Null, &json!(0)), Ordering::Less);
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!(1.5), &json!(1)), Ordering::Greater);
        assert_eq!(compare_values(&json!("b"), &json!("a")), Ordering::Greater);
        assert_eq!(compare_values(&json!(5), &json!("5")), Ordering::Less);
    }
}
