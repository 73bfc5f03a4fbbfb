//! Subscription descriptors, results and the normalized response document.

use crate::storage::Direction;
use crate::types::{PrimaryKey, Record};
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// One named subscription as submitted by a client.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionDescriptor {
    /// Visor to select from.
    pub visor: String,

    /// Earlier subscription of the same set whose ids restrict this one.
    #[serde(default)]
    pub from_sub: Option<String>,

    /// Equality filters.
    #[serde(default, rename = "where")]
    pub filter: Record,

    /// Order directives, in client order.
    #[serde(default, deserialize_with = "ordered_directions")]
    pub order: Vec<(String, Direction)>,

    /// Fold rows into their parent's children list.
    #[serde(default)]
    pub recursive: Option<Recursive>,
}

impl SubscriptionDescriptor {
    pub fn new(visor: impl Into<String>) -> Self {
        Self {
            visor: visor.into(),
            from_sub: None,
            filter: Record::new(),
            order: Vec::new(),
            recursive: None,
        }
    }

    pub fn from_sub(mut self, name: impl Into<String>) -> Self {
        self.from_sub = Some(name.into());
        self
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(field.into(), value.into());
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order.push((field.into(), direction));
        self
    }

    pub fn recursive(
        mut self,
        parent_field: impl Into<String>,
        children_field: impl Into<String>,
    ) -> Self {
        self.recursive = Some(Recursive {
            parent_field: parent_field.into(),
            children_field: children_field.into(),
        });
        self
    }
}

/// `[parentLinkField, childrenInjectField]`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(from = "(String, String)")]
pub struct Recursive {
    pub parent_field: String,
    pub children_field: String,
}

impl From<(String, String)> for Recursive {
    fn from((parent_field, children_field): (String, String)) -> Self {
        Self {
            parent_field,
            children_field,
        }
    }
}

fn ordered_directions<'de, D>(deserializer: D) -> Result<Vec<(String, Direction)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OrderVisitor;

    impl<'de> Visitor<'de> for OrderVisitor {
        type Value = Vec<(String, Direction)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of field to direction")
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut order = Vec::new();
            while let Some((field, direction)) = map.next_entry::<String, Direction>()? {
                order.push((field, direction));
            }
            Ok(order)
        }
    }

    deserializer.deserialize_any(OrderVisitor)
}

/// A descriptor, or the reason it could not be parsed.
pub type SubscriptionEntry = Result<SubscriptionDescriptor, String>;

/// Ordered `name -> descriptor` set.
///
/// Each entry is parsed on its own, so one malformed descriptor does not
/// reject its siblings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubscriptionSet {
    entries: Vec<(String, SubscriptionEntry)>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, descriptor: SubscriptionDescriptor) -> Self {
        self.insert(name.into(), Ok(descriptor));
        self
    }

    /// Insert an entry. A repeated name replaces the earlier entry in place.
    pub fn insert(&mut self, name: String, entry: SubscriptionEntry) {
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = entry,
            None => self.entries.push((name, entry)),
        }
    }

    /// Parse one entry from its JSON form.
    pub fn insert_value(&mut self, name: String, value: Value) {
        let entry = serde_json::from_value(value).map_err(|e| e.to_string());
        self.insert(name, entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SubscriptionEntry)> {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'de> Deserialize<'de> for SubscriptionSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SetVisitor;

        impl<'de> Visitor<'de> for SetVisitor {
            type Value = SubscriptionSet;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of subscription name to descriptor")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut set = SubscriptionSet::new();
                while let Some((name, value)) = map.next_entry::<String, Value>()? {
                    set.insert_value(name, value);
                }
                Ok(set)
            }
        }

        deserializer.deserialize_map(SetVisitor)
    }
}

/// Outcome of one subscription entry.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResult {
    pub status: String,

    /// Table bucket in the response document holding this entry's items.
    pub data_field: String,

    /// Top-level keys, in query order.
    pub ids: Vec<PrimaryKey>,

    /// Foreign-key value -> child keys. Empty unless the entry has `fromSub`.
    pub from_sub: BTreeMap<PrimaryKey, Vec<PrimaryKey>>,
}

impl SubscriptionResult {
    pub fn ok(data_field: impl Into<String>, ids: Vec<PrimaryKey>) -> Self {
        Self {
            status: "ok".to_string(),
            data_field: data_field.into(),
            ids,
            from_sub: BTreeMap::new(),
        }
    }

    /// Whether this result surfaces the row `key` of `table`.
    pub fn observes(&self, table: &str, key: &PrimaryKey) -> bool {
        self.data_field == table && self.ids.contains(key)
    }
}

/// Normalized document: `table -> key -> item`.
///
/// Shared by every entry of one resolution. Items are merged field by field,
/// so later entries augment what earlier entries put there.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ResponseData {
    tables: BTreeMap<String, BTreeMap<PrimaryKey, Record>>,
}

impl ResponseData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `record` into the item at `table/key`.
    pub fn merge(&mut self, table: &str, key: PrimaryKey, record: Record) {
        let item = self
            .tables
            .entry(table.to_string())
            .or_default()
            .entry(key)
            .or_default();
        for (field, value) in record {
            item.insert(field, value);
        }
    }

    pub fn get(&self, table: &str, key: &PrimaryKey) -> Option<&Record> {
        self.tables.get(table).and_then(|bucket| bucket.get(key))
    }

    pub fn contains(&self, table: &str, key: &PrimaryKey) -> bool {
        self.get(table, key).is_some()
    }

    pub fn bucket(&self, table: &str) -> Option<&BTreeMap<PrimaryKey, Record>> {
        self.tables.get(table)
    }

    pub fn tables(&self) -> impl Iterator<Item = (&str, &BTreeMap<PrimaryKey, Record>)> {
        self.tables.iter().map(|(name, bucket)| (name.as_str(), bucket))
    }

    /// Give every item of `table` an array-valued `field`, keeping existing arrays.
    pub fn ensure_children(&mut self, table: &str, field: &str) {
        if let Some(bucket) = self.tables.get_mut(table) {
            for item in bucket.values_mut() {
                if !item.get(field).map_or(false, Value::is_array) {
                    item.insert(field.to_string(), Value::Array(Vec::new()));
                }
            }
        }
    }

    /// Append `child` to the `field` list of `table/parent`.
    ///
    /// Returns false when the parent item is absent. A child already listed
    /// is not appended again.
    pub fn append_child(
        &mut self,
        table: &str,
        parent: &PrimaryKey,
        field: &str,
        child: &PrimaryKey,
    ) -> bool {
        let Some(item) = self.tables.get_mut(table).and_then(|b| b.get_mut(parent)) else {
            return false;
        };

        let children = item
            .entry(field.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !children.is_array() {
            *children = Value::Array(Vec::new());
        }
        if let Value::Array(list) = children {
            let value = child.to_value();
            if !list.contains(&value) {
                list.push(value);
            }
        }
        true
    }
}

/// Resolved document for one subscription set.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Resolution {
    pub data: ResponseData,
    pub sub: BTreeMap<String, SubscriptionResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl Resolution {
    /// Whether any entry surfaces the row `key` of `table`.
    pub fn observes(&self, table: &str, key: &PrimaryKey) -> bool {
        self.sub.values().any(|result| result.observes(table, key))
    }
}
