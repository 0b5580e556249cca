// ABOUTME: Declares the local collections and their secondary indexes.
// ABOUTME: Index definitions extract lookup keys from entity payloads, including multi-entry arrays.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entity::Entity;

pub const MIGRANTS: &str = "migrants";
pub const HEALTH_RECORDS: &str = "health_records";
pub const CONSENT_RECORDS: &str = "consent_records";

/// A secondary index over one payload field of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    /// Dotted path into the entity payload.
    pub field: String,
    pub unique: bool,
    /// Index every element of an array field instead of the field itself.
    pub multi_entry: bool,
}

impl IndexDef {
    pub fn new(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
            unique: false,
            multi_entry: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn multi_entry(mut self) -> Self {
        self.multi_entry = true;
        self
    }

    /// Lookup keys this index holds for the entity. Missing fields, nulls,
    /// and nested objects produce no key.
    pub fn keys(&self, entity: &Entity) -> Vec<String> {
        let Some(value) = entity.field(&self.field) else {
            return Vec::new();
        };

        match value {
            serde_json::Value::Array(items) if self.multi_entry => {
                let mut keys: Vec<String> = items.iter().filter_map(scalar_key).collect();
                keys.sort();
                keys.dedup();
                keys
            }
            other => scalar_key(other).into_iter().collect(),
        }
    }
}

fn scalar_key(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A named collection of entities and the indexes maintained for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDef {
    pub name: String,
    pub indexes: Vec<IndexDef>,
}

impl CollectionDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

/// The set of collections the local store accepts writes for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    collections: BTreeMap<String, CollectionDef>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, collection: CollectionDef) -> Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionDef> {
        self.collections.get(name)
    }

    pub fn collections(&self) -> impl Iterator<Item = &CollectionDef> {
        self.collections.values()
    }

    /// Stable textual identity of the index layout. The store rebuilds its
    /// index table whenever the persisted fingerprint differs.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(&self.collections).unwrap_or_default()
    }

    /// Collections used by the migrant health record application.
    pub fn migrant_health() -> Self {
        Self::new()
            .with_collection(
                CollectionDef::new(MIGRANTS)
                    .with_index(IndexDef::new("qr_code", "qr_code").unique())
                    .with_index(IndexDef::new("phone", "phone_numbers").multi_entry()),
            )
            .with_collection(
                CollectionDef::new(HEALTH_RECORDS)
                    .with_index(IndexDef::new("migrant_id", "migrant_id"))
                    .with_index(IndexDef::new("encounter_date", "encounter_date")),
            )
            .with_collection(
                CollectionDef::new(CONSENT_RECORDS)
                    .with_index(IndexDef::new("migrant_id", "migrant_id")),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_index_yields_single_key() {
        let index = IndexDef::new("qr_code", "qr_code").unique();
        let entity = Entity::new("M1", json!({"qr_code": "QR-001"}));
        assert_eq!(index.keys(&entity), vec!["QR-001".to_string()]);
    }

    #[test]
    fn multi_entry_index_yields_each_element() {
        let index = IndexDef::new("phone", "phone_numbers").multi_entry();
        let entity = Entity::new(
            "M1",
            json!({"phone_numbers": ["+91 900", "+91 800", "+91 900"]}),
        );
        assert_eq!(
            index.keys(&entity),
            vec!["+91 800".to_string(), "+91 900".to_string()]
        );
    }

    #[test]
    fn missing_or_structured_fields_yield_no_keys() {
        let index = IndexDef::new("qr_code", "qr_code");
        assert!(index.keys(&Entity::new("M1", json!({}))).is_empty());
        assert!(index.keys(&Entity::new("M1", json!({"qr_code": null}))).is_empty());
        assert!(
            index
                .keys(&Entity::new("M1", json!({"qr_code": {"v": 1}})))
                .is_empty()
        );
    }

    #[test]
    fn migrant_health_schema_declares_expected_indexes() {
        let schema = Schema::migrant_health();
        let migrants = schema.collection(MIGRANTS).unwrap();
        assert!(migrants.index("qr_code").unwrap().unique);
        assert!(migrants.index("phone").unwrap().multi_entry);
        assert!(schema.collection(HEALTH_RECORDS).unwrap().index("migrant_id").is_some());
        assert!(schema.collection(CONSENT_RECORDS).is_some());
        assert!(schema.collection("appointments").is_none());
    }

    #[test]
    fn fingerprint_changes_when_indexes_change() {
        let before = Schema::migrant_health();
        let after = Schema::migrant_health().with_collection(
            CollectionDef::new(MIGRANTS).with_index(IndexDef::new("qr_code", "qr_code").unique()),
        );
        assert_eq!(before.fingerprint(), Schema::migrant_health().fingerprint());
        assert_ne!(before.fingerprint(), after.fingerprint());
    }
}
