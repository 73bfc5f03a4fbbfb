//! SQLite storage backend.
//!
//! A small pool of connections to one database file. Sessions hold a pooled
//! connection for their lifetime; transactions are `BEGIN IMMEDIATE` so
//! writers serialize on the database lock instead of failing at commit.
//! Client field names are mapped to column names through [`FieldNaming`].

use super::{
    ChangeFeed, ColumnType, FeedSlot, FieldNaming, PendingEvents, Query, Session, Storage,
    TableSchema,
};
use crate::error::{Result, SyncError};
use crate::types::{ChangeEvent, PrimaryKey, Record};
use crate::visor::Visor;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// SQLite backend configuration.
#[derive(Clone, Debug)]
pub struct SqliteConfig {
    /// Database file, or `:memory:`.
    pub path: PathBuf,

    /// Number of pooled connections. Forced to 1 for `:memory:`.
    /// Default: 4
    pub pool_size: usize,

    /// How long a connection waits on a locked database.
    /// Default: 5s
    pub busy_timeout: Duration,

    /// Field to column name mapping.
    pub naming: FieldNaming,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./livesync.db"),
            pool_size: 4,
            busy_timeout: Duration::from_secs(5),
            naming: FieldNaming::CamelCase,
        }
    }
}

/// Storage backed by a SQLite database.
pub struct SqliteStorage {
    config: SqliteConfig,
    pool: Vec<Mutex<Connection>>,
    next: AtomicUsize,
    feed: FeedSlot,
}

impl SqliteStorage {
    pub fn open(config: SqliteConfig) -> Result<Self> {
        let size = if config.path == Path::new(":memory:") {
            1
        } else {
            config.pool_size.max(1)
        };

        let mut pool = Vec::with_capacity(size);
        for _ in 0..size {
            pool.push(Mutex::new(open_connection(&config)?));
        }

        info!(path = %config.path.display(), pool_size = size, "opened sqlite storage");

        Ok(Self {
            config,
            pool,
            next: AtomicUsize::new(0),
            feed: FeedSlot::default(),
        })
    }

    /// Single-connection database living in memory.
    pub fn in_memory() -> Result<Self> {
        Self::open(SqliteConfig {
            path: PathBuf::from(":memory:"),
            ..Default::default()
        })
    }

    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    /// Take an idle connection, or wait on one in round-robin order.
    fn acquire(&self) -> MutexGuard<'_, Connection> {
        for conn in &self.pool {
            if let Some(guard) = conn.try_lock() {
                return guard;
            }
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        self.pool[idx].lock()
    }
}

impl Storage for SqliteStorage {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn session(&self) -> Result<Box<dyn Session + '_>> {
        Ok(Box::new(SqliteSession {
            conn: self.acquire(),
            naming: self.config.naming,
            in_tx: false,
            pending: PendingEvents::new(self.feed.get()),
        }))
    }

    fn apply_schema(&self, schema: &TableSchema) -> Result<()> {
        let naming = self.config.naming;
        let table = quote(&schema.name);
        let columns: Vec<String> = schema
            .columns
            .iter()
            .map(|c| format!("{} {}", quote(&naming.to_db(&c.name)), column_sql(c.kind)))
            .collect();

        let mut conn = self.acquire();
        let tx = conn.transaction()?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {table}; CREATE TABLE {table} ({});",
            columns.join(", ")
        ))?;

        for row in &schema.rows {
            let (names, params): (Vec<String>, Vec<SqlValue>) = row
                .iter()
                .map(|(field, value)| (quote(&naming.to_db(field)), to_sql_value(value)))
                .unzip();
            let sql = format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                names.join(", "),
                placeholders(1, params.len())
            );
            tx.execute(&sql, params_from_iter(params))?;
        }

        tx.commit()?;
        debug!(table = %schema.name, rows = schema.rows.len(), "applied schema");
        Ok(())
    }

    fn install_feed(&self, feed: ChangeFeed) {
        self.feed.install(feed);
    }
}

struct SqliteSession<'a> {
    conn: MutexGuard<'a, Connection>,
    naming: FieldNaming,
    in_tx: bool,
    pending: PendingEvents,
}

impl SqliteSession<'_> {
    fn column(&self, field: &str) -> String {
        quote(&self.naming.to_db(field))
    }

    /// Run a row-returning statement and map rows to records.
    fn fetch(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Record>> {
        debug!(sql = %sql, params = params.len(), "sqlite fetch");
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(|c| self.naming.from_db(c))
            .collect();

        let mut rows = stmt.query(params_from_iter(params))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Record::new();
            for (i, name) in columns.iter().enumerate() {
                record.insert(name.clone(), from_sql_value(row.get_ref(i)?));
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Record a change event per written row, keyed as stored. `rows` hold
    /// the primary key returned by the statement.
    fn publish(&mut self, visor: &Visor, rows: &[Record]) -> Result<usize> {
        for row in rows {
            let key = visor.key_of(row)?;
            self.pending
                .record(ChangeEvent::new(visor.table.clone(), key), self.in_tx);
        }
        Ok(rows.len())
    }
}

impl Session for SqliteSession<'_> {
    fn query(&mut self, visor: &Visor, query: &Query) -> Result<Vec<Record>> {
        let mut sql = format!("SELECT * FROM {}", quote(&visor.table));
        let mut params = Vec::new();
        let mut clauses = Vec::new();

        for (field, value) in &query.filters {
            let column = self.column(field);
            if value.is_null() {
                clauses.push(format!("{} IS NULL", column));
            } else {
                params.push(to_sql_value(value));
                clauses.push(format!("{} = ?{}", column, params.len()));
            }
        }

        if let Some(fk) = &query.foreign_key {
            if fk.values.is_empty() {
                clauses.push("0".to_string());
            } else {
                let first = params.len() + 1;
                params.extend(fk.values.iter().map(to_sql_value));
                clauses.push(format!(
                    "{} IN ({})",
                    self.column(&fk.field),
                    placeholders(first, fk.values.len())
                ));
            }
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        if !query.order.is_empty() {
            let order: Vec<String> = query
                .order
                .iter()
                .map(|(field, direction)| format!("{} {}", self.column(field), direction.as_sql()))
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
        }

        self.fetch(&sql, params)
    }

    fn insert(&mut self, visor: &Visor, fields: &Record) -> Result<Record> {
        let table = quote(&visor.table);
        let (names, params): (Vec<String>, Vec<SqlValue>) = fields
            .iter()
            .map(|(field, value)| (self.column(field), to_sql_value(value)))
            .unzip();

        let sql = if names.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES RETURNING *", table)
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
                table,
                names.join(", "),
                placeholders(1, params.len())
            )
        };

        let record = self
            .fetch(&sql, params)?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::NoResult(visor.table.clone()))?;
        self.publish(visor, std::slice::from_ref(&record))?;
        Ok(record)
    }

    fn update(&mut self, visor: &Visor, key: &PrimaryKey, changes: &Record) -> Result<usize> {
        let table = quote(&visor.table);
        let pk = self.column(&visor.primary_key);

        if changes.is_empty() {
            let count: i64 = self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE {} = ?1", table, pk),
                [key_to_sql(key)],
                |row| row.get(0),
            )?;
            return Ok(count as usize);
        }

        let mut params: Vec<SqlValue> = Vec::with_capacity(changes.len() + 1);
        let mut sets = Vec::with_capacity(changes.len());
        for (field, value) in changes {
            params.push(to_sql_value(value));
            sets.push(format!("{} = ?{}", self.column(field), params.len()));
        }
        params.push(key_to_sql(key));
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{} RETURNING {}",
            table,
            sets.join(", "),
            pk,
            params.len(),
            pk
        );

        let rows = self.fetch(&sql, params)?;
        self.publish(visor, &rows)
    }

    fn delete(&mut self, visor: &Visor, key: &PrimaryKey) -> Result<usize> {
        let pk = self.column(&visor.primary_key);
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1 RETURNING {}",
            quote(&visor.table),
            pk,
            pk
        );
        let rows = self.fetch(&sql, vec![key_to_sql(key)])?;
        self.publish(visor, &rows)
    }

    fn begin(&mut self) -> Result<()> {
        if self.in_tx {
            return Err(SyncError::Transaction("transaction already open".into()));
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        self.in_tx = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.in_tx {
            return Err(SyncError::Transaction("no open transaction".into()));
        }
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| SyncError::Transaction(e.to_string()))?;
        self.in_tx = false;
        self.pending.flush();
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.pending.discard();
        if self.in_tx {
            self.in_tx = false;
            self.conn
                .execute_batch("ROLLBACK")
                .map_err(|e| SyncError::Transaction(e.to_string()))?;
        }
        Ok(())
    }
}

impl Drop for SqliteSession<'_> {
    fn drop(&mut self) {
        // Never hand a connection back to the pool mid-transaction.
        if self.in_tx {
            if let Err(e) = self.rollback() {
                warn!(error = %e, "rollback on session release failed");
            }
        }
    }
}

fn open_connection(config: &SqliteConfig) -> Result<Connection> {
    let conn = Connection::open(&config.path)?;
    conn.busy_timeout(config.busy_timeout)?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    debug!(path = %config.path.display(), journal_mode = %mode, "opened sqlite connection");
    Ok(conn)
}

fn column_sql(kind: ColumnType) -> &'static str {
    match kind {
        ColumnType::Serial => "INTEGER PRIMARY KEY",
        ColumnType::Integer => "INTEGER",
        ColumnType::Real => "REAL",
        ColumnType::Text => "TEXT",
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// `?first, ?first+1, ...` for `count` parameters.
fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn key_to_sql(key: &PrimaryKey) -> SqlValue {
    match key {
        PrimaryKey::Int(i) => SqlValue::Integer(*i),
        PrimaryKey::Str(s) => SqlValue::Text(s.clone()),
    }
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

fn from_sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{change_queue, Direction, Transaction};
    use serde_json::json;

    fn obj(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    fn storage() -> SqliteStorage {
        let storage = SqliteStorage::in_memory().unwrap();
        storage
            .apply_schema(
                &TableSchema::new("tasks")
                    .column("id", ColumnType::Serial)
                    .column("title", ColumnType::Text)
                    .column("parentId", ColumnType::Integer)
                    .row(json!({"id": 1, "title": "a", "parentId": null}))
                    .row(json!({"id": 2, "title": "b", "parentId": 1})),
            )
            .unwrap();
        storage
    }

    #[test]
    fn test_query_maps_column_names() {
        let storage = storage();
        let visor = Visor::new("Task", "tasks", "id");
        let mut session = storage.session().unwrap();

        let rows = session
            .query(&visor, &Query::all().order_by("id", Direction::Desc))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], json!(2));
        assert_eq!(rows[0]["parentId"], json!(1));
        assert!(rows[1].contains_key("parentId"));
        assert!(!rows[1].contains_key("parent_id"));
    }

    #[test]
    fn test_null_filter_and_empty_link() {
        let storage = storage();
        let visor = Visor::new("Task", "tasks", "id");
        let mut session = storage.session().unwrap();

        let roots = session
            .query(&visor, &Query::all().filter("parentId", Value::Null))
            .unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0]["id"], json!(1));

        let none = session
            .query(&visor, &Query::all().linked("parentId", vec![]))
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_insert_returning() {
        let storage = storage();
        let visor = Visor::new("Task", "tasks", "id");
        let mut session = storage.session().unwrap();

        let record = session.insert(&visor, &obj(json!({"title": "c"}))).unwrap();
        assert_eq!(record["id"], json!(3));
        assert_eq!(record["title"], json!("c"));
    }

    #[test]
    fn test_rollback_discards_writes_and_events() {
        let storage = storage();
        let (feed, events) = change_queue();
        storage.install_feed(feed);
        let visor = Visor::new("Task", "tasks", "id");
        let mut session = storage.session().unwrap();

        {
            let mut tx = Transaction::begin(session.as_mut()).unwrap();
            tx.delete(&visor, &PrimaryKey::Int(1)).unwrap();
        }

        assert!(events.try_recv().is_err());
        let rows = session.query(&visor, &Query::all()).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_text_key_publishes_stored_key() {
        let storage = storage();
        let (feed, events) = change_queue();
        storage.install_feed(feed);
        let visor = Visor::new("Task", "tasks", "id");
        let mut session = storage.session().unwrap();

        let affected = session
            .update(&visor, &PrimaryKey::Str("1".into()), &obj(json!({"title": "x"})))
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(events.try_recv().unwrap(), ChangeEvent::new("tasks", PrimaryKey::Int(1)));

        assert_eq!(session.delete(&visor, &PrimaryKey::Str("2".into())).unwrap(), 1);
        assert_eq!(events.try_recv().unwrap(), ChangeEvent::new("tasks", PrimaryKey::Int(2)));
    }

    #[test]
    fn test_value_conversion() {
        assert_eq!(to_sql_value(&json!(true)), SqlValue::Integer(1));
        assert_eq!(to_sql_value(&json!(2.5)), SqlValue::Real(2.5));
        assert_eq!(from_sql_value(ValueRef::Blob(&[0xde, 0xad])), json!("dead"));
        assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(placeholders(3, 2), "?3, ?4");
    }
}
