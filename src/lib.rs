//! # livesync
//!
//! Realtime data synchronization over entity collections: clients declare
//! named subscriptions, the engine resolves them into one normalized
//! document, and re-pushes that document whenever an observed row changes.
//!
//! ## Core Concepts
//!
//! - **Visors**: Named views of a table, with primary key and links
//! - **Subscriptions**: Ordered descriptors with `fromSub` joins and recursive trees
//! - **Mutations**: Insert, plus all-or-nothing batched update and delete
//! - **Notifier**: Change-event driven re-resolution per connection
//! - **Storage**: Session/transaction contract with memory and SQLite backends
//!
//! ## Example
//!
//! ```ignore
//! use livesync::{Engine, EngineConfig, MemoryStorage, User, Visor, VisorRegistry};
//! use std::sync::Arc;
//!
//! let registry = VisorRegistry::new()
//!     .with(Visor::new("Account", "accounts", "id"))?;
//! let engine = Engine::new(registry, Arc::new(MemoryStorage::new()), EngineConfig::default());
//! let _dispatcher = engine.start_dispatcher()?;
//!
//! let conn = engine.connect(User::new(1));
//! let reply = engine.handle_message(&conn, r#"{"type":"sub","sub":{"all":{"visor":"Account"}}}"#);
//!
//! // Later writes by anyone re-push the document on `conn.recv()`.
//! engine.disconnect(conn);
//! ```

pub mod engine;
pub mod error;
pub mod mutation;
pub mod notify;
pub mod protocol;
pub mod storage;
pub mod subscriptions;
pub mod types;
pub mod visor;

// Re-exports
pub use engine::{Engine, EngineConfig};
pub use error::{ErrorKind, Result, SyncError};
pub use mutation::Mutations;
pub use notify::{
    Connection, ConnectionHandle, ConnectionId, ConnectionState, DispatchStats, Dispatcher,
    Notifier, NotifierConfig,
};
pub use protocol::{parse_message, InsertTarget, Reply, Request, Response, Selector, Status};
pub use storage::{
    change_queue, ChangeFeed, Column, ColumnType, Direction, FieldNaming, ForeignKeyFilter,
    MemoryStorage, Query, Session, SqliteConfig, SqliteStorage, Storage, TableSchema, Transaction,
};
pub use subscriptions::{
    Recursive, Resolution, Resolver, ResponseData, SubscriptionDescriptor, SubscriptionEntry,
    SubscriptionResult, SubscriptionSet,
};
pub use types::*;
pub use visor::{Visor, VisorRegistry};
