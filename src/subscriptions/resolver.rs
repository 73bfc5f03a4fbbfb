//! Resolves an ordered subscription set into one normalized document.

use crate::error::{Result, SyncError};
use crate::storage::{ForeignKeyFilter, Query, Session, Storage};
use crate::types::{PrimaryKey, Record, User};
use crate::visor::VisorRegistry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use super::types::{Resolution, SubscriptionDescriptor, SubscriptionResult, SubscriptionSet};

/// Turns subscription sets into [`Resolution`]s using a storage session.
pub struct Resolver {
    registry: Arc<VisorRegistry>,
    storage: Arc<dyn Storage>,
}

impl Resolver {
    pub fn new(registry: Arc<VisorRegistry>, storage: Arc<dyn Storage>) -> Self {
        Self { registry, storage }
    }

    /// Resolve every entry of `set` in client order.
    ///
    /// Validation and dependency failures are recorded per entry in
    /// `errors`; any other failure aborts the whole resolution.
    pub fn resolve(&self, user: &User, set: &SubscriptionSet) -> Result<Resolution> {
        let mut session = self.storage.session()?;
        let mut resolution = Resolution::default();

        for (name, entry) in set.iter() {
            let outcome = match entry {
                Ok(descriptor) => resolve_entry(
                    &self.registry,
                    session.as_mut(),
                    name,
                    descriptor,
                    &mut resolution,
                ),
                Err(reason) => Err(SyncError::InvalidSubscription {
                    name: name.to_string(),
                    reason: reason.clone(),
                }),
            };

            match outcome {
                Ok(result) => {
                    resolution.sub.insert(name.to_string(), result);
                }
                Err(e) if e.is_entry_scoped() => {
                    debug!(subscription = %name, error = %e, "subscription entry rejected");
                    resolution.errors.push(format!("{}: {}", name, e));
                }
                Err(e) => return Err(e),
            }
        }

        debug!(
            user_id = ?user.user_id,
            entries = set.len(),
            errors = resolution.errors.len(),
            "resolved subscription set"
        );
        Ok(resolution)
    }
}

fn resolve_entry(
    registry: &VisorRegistry,
    session: &mut dyn Session,
    name: &str,
    descriptor: &SubscriptionDescriptor,
    resolution: &mut Resolution,
) -> Result<SubscriptionResult> {
    let visor = registry.get(&descriptor.visor)?;

    let mut query = Query {
        filters: descriptor
            .filter
            .iter()
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect(),
        order: descriptor.order.clone(),
        foreign_key: None,
    };

    let link = match &descriptor.from_sub {
        Some(from) => {
            let source = resolution
                .sub
                .get(from)
                .ok_or_else(|| SyncError::UnresolvedDependency {
                    name: name.to_string(),
                    from: from.clone(),
                })?;
            let field = visor
                .link_field(&source.data_field)
                .ok_or_else(|| SyncError::UnknownLink {
                    table: visor.table.clone(),
                    target: source.data_field.clone(),
                })?;
            query.foreign_key = Some(ForeignKeyFilter {
                field: field.to_string(),
                values: source.ids.iter().map(PrimaryKey::to_value).collect(),
            });
            Some(field.to_string())
        }
        None => None,
    };

    let records = session.query(&visor, &query)?;

    // Keys and link values, in query order, before the records move into the
    // shared document.
    let mut rows: Vec<Row> = Vec::with_capacity(records.len());
    let parent_field = descriptor.recursive.as_ref().map(|r| r.parent_field.as_str());
    for record in records {
        let key = visor.key_of(&record)?;
        rows.push(Row {
            key: key.clone(),
            parent: parent_field.and_then(|field| link_value(&record, field)),
            link: link.as_deref().and_then(|field| link_value(&record, field)),
        });
        resolution.data.merge(&visor.table, key, record);
    }

    let ids = match &descriptor.recursive {
        Some(recursive) => {
            resolution
                .data
                .ensure_children(&visor.table, &recursive.children_field);

            let mut ids = Vec::new();
            for row in &rows {
                let folded = match &row.parent {
                    Some(parent) => resolution.data.append_child(
                        &visor.table,
                        parent,
                        &recursive.children_field,
                        &row.key,
                    ),
                    None => false,
                };
                if !folded {
                    ids.push(row.key.clone());
                }
            }
            ids
        }
        None => rows.iter().map(|row| row.key.clone()).collect(),
    };

    let mut result = SubscriptionResult::ok(visor.table.clone(), ids);
    if link.is_some() {
        let mut from_sub: BTreeMap<PrimaryKey, Vec<PrimaryKey>> = BTreeMap::new();
        for row in &rows {
            if let Some(target) = &row.link {
                from_sub.entry(target.clone()).or_default().push(row.key.clone());
            }
        }
        result.from_sub = from_sub;
    }

    debug!(
        subscription = %name,
        visor = %visor.name,
        rows = rows.len(),
        top_level = result.ids.len(),
        "resolved subscription entry"
    );
    Ok(result)
}

struct Row {
    key: PrimaryKey,
    parent: Option<PrimaryKey>,
    link: Option<PrimaryKey>,
}

fn link_value(record: &Record, field: &str) -> Option<PrimaryKey> {
    record.get(field).and_then(PrimaryKey::from_value)
}
