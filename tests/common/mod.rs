//! Shared fixtures: one schema, seeded identically on both backends.

#![allow(dead_code)]

use livesync::{
    ColumnType, Engine, EngineConfig, MemoryStorage, SqliteConfig, SqliteStorage, Storage,
    TableSchema, Visor, VisorRegistry,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn schemas() -> Vec<TableSchema> {
    vec![
        TableSchema::new("accounts")
            .column("id", ColumnType::Serial)
            .column("name", ColumnType::Text)
            .column("lastUpdatedBy", ColumnType::Integer)
            .row(json!({"id": 1, "name": "aaa"}))
            .row(json!({"id": 2, "name": "bbb"})),
        TableSchema::new("tasks")
            .column("id", ColumnType::Serial)
            .column("title", ColumnType::Text)
            .column("parentId", ColumnType::Integer)
            .column("lastUpdatedBy", ColumnType::Integer)
            .row(json!({"id": 1, "title": "plan", "parentId": null}))
            .row(json!({"id": 2, "title": "draft", "parentId": 1}))
            .row(json!({"id": 3, "title": "review", "parentId": null}))
            .row(json!({"id": 4, "title": "ship", "parentId": null})),
        TableSchema::new("suites")
            .column("id", ColumnType::Serial)
            .column("name", ColumnType::Text)
            .column("lastUpdatedBy", ColumnType::Integer)
            .row(json!({"id": 1, "name": "core"}))
            .row(json!({"id": 2, "name": "extra"})),
        TableSchema::new("cases")
            .column("id", ColumnType::Serial)
            .column("suiteId", ColumnType::Integer)
            .column("title", ColumnType::Text)
            .column("position", ColumnType::Integer)
            .column("lastUpdatedBy", ColumnType::Integer)
            .row(json!({"id": 1, "suiteId": 1, "title": "boots", "position": 2}))
            .row(json!({"id": 2, "suiteId": 1, "title": "logs in", "position": 1}))
            .row(json!({"id": 3, "suiteId": 2, "title": "exports", "position": 1})),
    ]
}

pub fn registry() -> VisorRegistry {
    let mut registry = VisorRegistry::new();
    for visor in [
        Visor::new("Account", "accounts", "id"),
        Visor::new("Task", "tasks", "id"),
        Visor::new("Suite", "suites", "id"),
        Visor::new("Case", "cases", "id").link("suites", "suiteId"),
    ] {
        registry.register(visor).unwrap();
    }
    registry
}

/// A seeded backend plus whatever keeps it alive.
pub struct Backend {
    pub name: &'static str,
    pub storage: Arc<dyn Storage>,
    _dir: Option<TempDir>,
}

pub fn memory() -> Backend {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    seed(storage.as_ref());
    Backend {
        name: "memory",
        storage,
        _dir: None,
    }
}

pub fn sqlite() -> Backend {
    let dir = TempDir::new().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(
        SqliteStorage::open(SqliteConfig {
            path: dir.path().join("sync.db"),
            pool_size: 2,
            ..Default::default()
        })
        .unwrap(),
    );
    seed(storage.as_ref());
    Backend {
        name: "sqlite",
        storage,
        _dir: Some(dir),
    }
}

pub fn backends() -> Vec<Backend> {
    vec![memory(), sqlite()]
}

fn seed(storage: &dyn Storage) {
    for schema in schemas() {
        storage.apply_schema(&schema).unwrap();
    }
}

/// Engine over a backend; the backend must outlive it.
pub fn engine(backend: &Backend) -> Engine {
    init_tracing();
    Engine::new(registry(), backend.storage.clone(), EngineConfig::default())
}

/// Send a JSON request and parse the JSON reply.
pub fn send(engine: &Engine, conn: &livesync::ConnectionHandle, request: Value) -> Value {
    let reply = engine.handle_message(conn, &request.to_string());
    serde_json::from_str(&reply).unwrap()
}
