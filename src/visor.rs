//! Entity descriptors and their registry.
//!
//! A [`Visor`] names an entity collection: which table it lives in, which
//! field is its primary key, and which foreign-key fields link it to other
//! tables. Visors are registered once at start-up into a [`VisorRegistry`],
//! which is then shared read-only by the resolver and the mutation pipeline.

use crate::error::{Result, SyncError};
use crate::types::{PrimaryKey, Record};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Static metadata for one entity collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Visor {
    /// Name clients use to refer to this visor.
    pub name: String,
    /// Backing table.
    pub table: String,
    /// Primary-key field name.
    pub primary_key: String,
    /// Target table -> foreign-key field on this visor's table.
    pub links: BTreeMap<String, String>,
}

impl Visor {
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        primary_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            primary_key: primary_key.into(),
            links: BTreeMap::new(),
        }
    }

    /// Declare that rows of this visor point at rows of `target_table`
    /// through `field`.
    pub fn link(mut self, target_table: impl Into<String>, field: impl Into<String>) -> Self {
        self.links.insert(target_table.into(), field.into());
        self
    }

    /// Foreign-key field linking this visor to `target_table`.
    pub fn link_field(&self, target_table: &str) -> Option<&str> {
        self.links.get(target_table).map(String::as_str)
    }

    /// Primary key of a stored record.
    pub fn key_of(&self, record: &Record) -> Result<PrimaryKey> {
        record
            .get(&self.primary_key)
            .and_then(PrimaryKey::from_value)
            .ok_or_else(|| SyncError::InvalidRecord {
                table: self.table.clone(),
                reason: format!("missing or non-scalar primary key '{}'", self.primary_key),
            })
    }
}

/// Name -> visor lookup, populated at start-up.
#[derive(Clone, Debug, Default)]
pub struct VisorRegistry {
    visors: HashMap<String, Arc<Visor>>,
}

impl VisorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a visor. Names must be unique.
    pub fn register(&mut self, visor: Visor) -> Result<()> {
        if self.visors.contains_key(&visor.name) {
            return Err(SyncError::VisorExists(visor.name));
        }
        self.visors.insert(visor.name.clone(), Arc::new(visor));
        Ok(())
    }

    /// Builder-style registration.
    pub fn with(mut self, visor: Visor) -> Result<Self> {
        self.register(visor)?;
        Ok(self)
    }

    /// Look up a visor by name.
    pub fn get(&self, name: &str) -> Result<Arc<Visor>> {
        self.visors
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::VisorNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.visors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.visors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Visor>> {
        self.visors.values()
    }
}
