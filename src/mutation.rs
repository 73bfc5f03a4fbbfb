//! Insert, batched update and batched delete.
//!
//! Batches are validated in full before anything is written, then applied
//! inside one transaction. Change events come from the backend after commit,
//! never from here.

use crate::error::{Result, SyncError};
use crate::protocol::Selector;
use crate::storage::{Storage, Transaction};
use crate::types::{PrimaryKey, Record, User};
use crate::visor::{Visor, VisorRegistry};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Write path shared by all connections.
pub struct Mutations {
    registry: Arc<VisorRegistry>,
    storage: Arc<dyn Storage>,
    modifier_field: Option<String>,
}

/// A validated statement of a batch.
struct Planned {
    visor: Arc<Visor>,
    key: PrimaryKey,
    changes: Record,
}

impl Mutations {
    pub fn new(
        registry: Arc<VisorRegistry>,
        storage: Arc<dyn Storage>,
        modifier_field: Option<String>,
    ) -> Self {
        Self {
            registry,
            storage,
            modifier_field,
        }
    }

    /// Insert one row and return it as stored.
    pub fn insert(&self, user: &User, visor_name: &str, fields: &Record) -> Result<Record> {
        let visor = self.registry.get(visor_name)?;
        let fields = self.stamp(user, fields.clone());

        let mut session = self.storage.session()?;
        let record = session.insert(&visor, &fields)?;
        debug!(
            visor = %visor.name,
            key = ?record.get(&visor.primary_key),
            "inserted row"
        );
        Ok(record)
    }

    /// Apply every `(selector, changes)` pair, or none of them.
    /// Returns the number of statements applied.
    pub fn update(&self, user: &User, statements: &[(Selector, Record)]) -> Result<usize> {
        let plan = statements
            .iter()
            .map(|(selector, changes)| self.plan(user, selector, changes.clone()))
            .collect::<Result<Vec<_>>>()?;
        if plan.is_empty() {
            return Ok(0);
        }

        let mut session = self.storage.session()?;
        let mut tx = Transaction::begin(session.as_mut())?;
        for step in &plan {
            if tx.update(&step.visor, &step.key, &step.changes)? == 0 {
                return Err(not_found(&step.visor, &step.key));
            }
        }
        tx.commit()?;

        debug!(user_id = ?user.user_id, statements = plan.len(), "update batch committed");
        Ok(plan.len())
    }

    /// Delete every selected row, or none of them.
    /// Returns the number of statements applied.
    pub fn delete(&self, user: &User, selectors: &[Selector]) -> Result<usize> {
        let plan = selectors
            .iter()
            .map(|selector| self.plan(user, selector, Record::new()))
            .collect::<Result<Vec<_>>>()?;
        if plan.is_empty() {
            return Ok(0);
        }

        let mut session = self.storage.session()?;
        let mut tx = Transaction::begin(session.as_mut())?;
        for step in &plan {
            if tx.delete(&step.visor, &step.key)? == 0 {
                return Err(not_found(&step.visor, &step.key));
            }
        }
        tx.commit()?;

        debug!(user_id = ?user.user_id, statements = plan.len(), "delete batch committed");
        Ok(plan.len())
    }

    fn plan(&self, user: &User, selector: &Selector, changes: Record) -> Result<Planned> {
        let visor = self.registry.get(&selector.visor)?;
        let key = selector.key(&visor)?;
        let changes = if changes.is_empty() {
            changes
        } else {
            self.stamp(user, changes)
        };
        Ok(Planned {
            visor,
            key,
            changes,
        })
    }

    /// Record who wrote the row, when the user is known.
    fn stamp(&self, user: &User, mut fields: Record) -> Record {
        if let (Some(field), Some(user_id)) = (&self.modifier_field, user.user_id) {
            fields.insert(field.clone(), Value::from(user_id));
        }
        fields
    }
}

fn not_found(visor: &Visor, key: &PrimaryKey) -> SyncError {
    SyncError::NotFound {
        table: visor.table.clone(),
        key: key.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ColumnType, MemoryStorage, TableSchema};
    use crate::error::ErrorKind;
    use serde_json::json;

    fn obj(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    fn setup() -> (Arc<MemoryStorage>, Mutations) {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .apply_schema(
                &TableSchema::new("accounts")
                    .column("id", ColumnType::Serial)
                    .column("name", ColumnType::Text)
                    .column("lastUpdatedBy", ColumnType::Integer)
                    .row(json!({"id": 1, "name": "aaa"}))
                    .row(json!({"id": 2, "name": "bbb"})),
            )
            .unwrap();
        let registry = VisorRegistry::new()
            .with(Visor::new("Account", "accounts", "id"))
            .unwrap();
        let mutations = Mutations::new(
            Arc::new(registry),
            storage.clone(),
            Some("lastUpdatedBy".to_string()),
        );
        (storage, mutations)
    }

    #[test]
    fn test_insert_stamps_modifier() {
        let (_storage, mutations) = setup();
        let record = mutations
            .insert(&User::new(42), "Account", &obj(json!({"name": "ccc"})))
            .unwrap();
        assert_eq!(record["id"], json!(3));
        assert_eq!(record["lastUpdatedBy"], json!(42));

        let record = mutations
            .insert(&User::anonymous(), "Account", &obj(json!({"name": "ddd"})))
            .unwrap();
        assert_eq!(record["lastUpdatedBy"], Value::Null);
    }

    #[test]
    fn test_update_missing_row_rolls_back_batch() {
        let (storage, mutations) = setup();
        let err = mutations
            .update(
                &User::new(1),
                &[
                    (Selector::new("Account", "id", 1), obj(json!({"name": "changed"}))),
                    (Selector::new("Account", "id", 99), obj(json!({"name": "ghost"}))),
                ],
            )
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(storage.rows("accounts")[0]["name"], json!("aaa"));
    }

    #[test]
    fn test_invalid_visor_writes_nothing() {
        let (storage, mutations) = setup();
        let err = mutations
            .delete(
                &User::anonymous(),
                &[Selector::new("Account", "id", 1), Selector::new("Nope", "id", 2)],
            )
            .unwrap_err();

        assert!(matches!(err, SyncError::VisorNotFound(_)));
        assert_eq!(storage.rows("accounts").len(), 2);
    }

    #[test]
    fn test_delete_batch() {
        let (storage, mutations) = setup();
        let applied = mutations
            .delete(
                &User::anonymous(),
                &[Selector::new("Account", "id", 1), Selector::new("Account", "id", 2)],
            )
            .unwrap();
        assert_eq!(applied, 2);
        assert!(storage.rows("accounts").is_empty());
    }
}
