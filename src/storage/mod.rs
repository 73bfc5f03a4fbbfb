//! Storage boundary: backends, sessions and transactions.
//!
//! Everything the core needs from persistence goes through two traits:
//! - [`Storage`]: a shared backend that hands out sessions
//! - [`Session`]: a unit of work with query/insert/update/delete
//!
//! Multi-statement work is wrapped in a [`Transaction`] guard, which rolls
//! back on every exit path that is not an explicit [`Transaction::commit`].
//!
//! Backends publish a [`ChangeEvent`] for every committed write through the
//! [`ChangeFeed`] installed with [`Storage::install_feed`].
//!
//! # Example
//!
//! ```ignore
//! let mut session = storage.session()?;
//! let mut tx = Transaction::begin(session.as_mut())?;
//! tx.update(&visor, &PrimaryKey::Int(1), &changes)?;
//! tx.commit()?;
//! ```

mod memory;
mod naming;
mod schema;
mod sqlite;

pub use memory::MemoryStorage;
pub use naming::FieldNaming;
pub use schema::{Column, ColumnType, TableSchema};
pub use sqlite::{SqliteConfig, SqliteStorage};

use crate::error::Result;
use crate::types::{ChangeEvent, PrimaryKey, Record};
use crate::visor::Visor;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::ops::{Deref, DerefMut};
use tracing::warn;

/// Sort direction for an order directive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn as_sql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

impl<'de> Deserialize<'de> for Direction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct DirectionVisitor;

        impl<'de> Visitor<'de> for DirectionVisitor {
            type Value = Direction;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("\"asc\", \"desc\", 1 or -1")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Direction, E> {
                match v.to_ascii_lowercase().as_str() {
                    "asc" => Ok(Direction::Asc),
                    "desc" => Ok(Direction::Desc),
                    other => Err(E::custom(format!("unknown order direction: {}", other))),
                }
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Direction, E> {
                match v {
                    1 => Ok(Direction::Asc),
                    -1 => Ok(Direction::Desc),
                    other => Err(E::custom(format!("unknown order direction: {}", other))),
                }
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Direction, E> {
                match v {
                    1 => Ok(Direction::Asc),
                    other => Err(E::custom(format!("unknown order direction: {}", other))),
                }
            }
        }

        deserializer.deserialize_any(DirectionVisitor)
    }
}

/// `field IN (values)` restriction derived from an earlier subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct ForeignKeyFilter {
    pub field: String,
    pub values: Vec<Value>,
}

/// Selection over one visor's table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    /// Equality filters, all of which must match.
    pub filters: Vec<(String, Value)>,
    /// Order directives, applied left to right.
    pub order: Vec<(String, Direction)>,
    pub foreign_key: Option<ForeignKeyFilter>,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order.push((field.into(), direction));
        self
    }

    pub fn linked(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.foreign_key = Some(ForeignKeyFilter {
            field: field.into(),
            values,
        });
        self
    }
}

/// A unit of work against a backend.
///
/// Outside of `begin`/`commit` every write is applied (and published)
/// immediately.
pub trait Session {
    /// Select rows of `visor.table` matching `query`.
    fn query(&mut self, visor: &Visor, query: &Query) -> Result<Vec<Record>>;

    /// Insert a row and return it as stored, including assigned keys.
    fn insert(&mut self, visor: &Visor, fields: &Record) -> Result<Record>;

    /// Apply `changes` to the row with primary key `key`. Returns rows affected.
    fn update(&mut self, visor: &Visor, key: &PrimaryKey, changes: &Record) -> Result<usize>;

    /// Delete the row with primary key `key`. Returns rows affected.
    fn delete(&mut self, visor: &Visor, key: &PrimaryKey) -> Result<usize>;

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;
}

/// A shared persistence backend.
pub trait Storage: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Acquire a session. Sessions are cheap and short-lived.
    fn session(&self) -> Result<Box<dyn Session + '_>>;

    /// Create (or recreate) a table and load its seed rows.
    fn apply_schema(&self, schema: &TableSchema) -> Result<()>;

    /// Install the producer half of the change-event queue.
    fn install_feed(&self, feed: ChangeFeed);
}

/// Scoped transaction over a session.
///
/// Rolls back on drop unless [`commit`](Self::commit) succeeded.
pub struct Transaction<'t, S: Session + ?Sized> {
    session: &'t mut S,
    finished: bool,
}

impl<'t, S: Session + ?Sized> Transaction<'t, S> {
    pub fn begin(session: &'t mut S) -> Result<Self> {
        session.begin()?;
        Ok(Self {
            session,
            finished: false,
        })
    }

    pub fn commit(mut self) -> Result<()> {
        self.session.commit()?;
        self.finished = true;
        Ok(())
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.session.rollback()
    }
}

impl<S: Session + ?Sized> Deref for Transaction<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.session
    }
}

impl<S: Session + ?Sized> DerefMut for Transaction<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.session
    }
}

impl<S: Session + ?Sized> Drop for Transaction<'_, S> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.session.rollback() {
                warn!(error = %e, "rollback of abandoned transaction failed");
            }
        }
    }
}

/// Producer half of the process-wide change-event queue.
#[derive(Clone, Debug)]
pub struct ChangeFeed {
    sender: Sender<ChangeEvent>,
}

impl ChangeFeed {
    /// Enqueue one event. Returns false once the consumer is gone.
    pub fn publish(&self, event: ChangeEvent) -> bool {
        self.sender.send(event).is_ok()
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = ChangeEvent>) {
        for event in events {
            if !self.publish(event) {
                break;
            }
        }
    }
}

/// Create the change-event queue: a feed for producers and the receiver
/// the notifier drains.
pub fn change_queue() -> (ChangeFeed, Receiver<ChangeEvent>) {
    let (sender, receiver) = unbounded();
    (ChangeFeed { sender }, receiver)
}

/// Installed feed shared by a backend and its sessions.
#[derive(Default)]
pub(crate) struct FeedSlot(RwLock<Option<ChangeFeed>>);

impl FeedSlot {
    pub(crate) fn install(&self, feed: ChangeFeed) {
        *self.0.write() = Some(feed);
    }

    pub(crate) fn get(&self) -> Option<ChangeFeed> {
        self.0.read().clone()
    }
}

/// Events buffered by a session until they may be published.
#[derive(Default)]
pub(crate) struct PendingEvents {
    feed: Option<ChangeFeed>,
    events: Vec<ChangeEvent>,
}

impl PendingEvents {
    pub(crate) fn new(feed: Option<ChangeFeed>) -> Self {
        Self {
            feed,
            events: Vec::new(),
        }
    }

    /// Record a write; published now unless a transaction is open.
    pub(crate) fn record(&mut self, event: ChangeEvent, in_transaction: bool) {
        if in_transaction {
            self.events.push(event);
        } else if let Some(feed) = &self.feed {
            feed.publish(event);
        }
    }

    pub(crate) fn flush(&mut self) {
        let events = std::mem::take(&mut self.events);
        if let Some(feed) = &self.feed {
            feed.publish_all(events);
        }
    }

    pub(crate) fn discard(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direction_forms() {
        let parsed: Vec<Direction> = serde_json::from_value(json!(["asc", "DESC", 1, -1])).unwrap();
        assert_eq!(
            parsed,
            vec![Direction::Asc, Direction::Desc, Direction::Asc, Direction::Desc]
        );
        assert!(serde_json::from_value::<Direction>(json!("sideways")).is_err());
        assert!(serde_json::from_value::<Direction>(json!(0)).is_err());
    }

    #[test]
    fn test_pending_events_publish_on_flush_only() {
        let (feed, events) = change_queue();
        let mut pending = PendingEvents::new(Some(feed));

        pending.record(ChangeEvent::new("tasks", PrimaryKey::Int(1)), true);
        assert!(events.try_recv().is_err());

        pending.flush();
        assert_eq!(events.try_recv().unwrap(), ChangeEvent::new("tasks", PrimaryKey::Int(1)));

        pending.record(ChangeEvent::new("tasks", PrimaryKey::Int(2)), true);
        pending.discard();
        pending.flush();
        assert!(events.try_recv().is_err());

        pending.record(ChangeEvent::new("tasks", PrimaryKey::Int(3)), false);
        assert_eq!(events.try_recv().unwrap(), ChangeEvent::new("tasks", PrimaryKey::Int(3)));
    }
}
