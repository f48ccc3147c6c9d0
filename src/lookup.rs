//! Key/value lookup collaborator
//!
//! Entity values are stored elsewhere; the association engine only sees the
//! small integer keys the lookup store assigns to them.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::types::{FieldValue, Key};
use crate::{Error, Result};

/// Resolves entity values to surrogate keys and answers field queries.
pub trait KeyLookup: Send + Sync {
    /// Key of `value`, assigning a fresh one if it is unknown.
    fn resolve_or_create(&self, value: &str) -> Result<Key>;

    /// Key of `value` if one was ever assigned.
    fn resolve(&self, value: &str) -> Result<Option<Key>>;

    fn get_by_id(&self, key: Key) -> Result<Option<String>>;

    /// Value of `field` for the entity behind `key`.
    fn get_field(&self, key: Key, field: &str) -> Result<Option<FieldValue>>;
}

#[derive(Default)]
struct LookupState {
    keys: HashMap<String, Key>,
    values: Vec<String>,
    fields: HashMap<Key, HashMap<String, FieldValue>>,
}

/// In-memory [`KeyLookup`] assigning keys densely from 0.
#[derive(Default)]
pub struct MemoryLookup {
    state: RwLock<LookupState>,
}

impl MemoryLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_field(&self, key: Key, field: impl Into<String>, value: impl Into<FieldValue>) -> Result<()> {
        let mut state = self.state.write();
        if key as usize >= state.values.len() {
            return Err(Error::lookup(format!("unknown key {}", key)));
        }
        state
            .fields
            .entry(key)
            .or_default()
            .insert(field.into(), value.into());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.read().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyLookup for MemoryLookup {
    fn resolve_or_create(&self, value: &str) -> Result<Key> {
        if let Some(&key) = self.state.read().keys.get(value) {
            return Ok(key);
        }

        let mut state = self.state.write();
        // another writer may have raced us between the two locks
        if let Some(&key) = state.keys.get(value) {
            return Ok(key);
        }
        let key = Key::try_from(state.values.len())
            .map_err(|_| Error::lookup("key space exhausted"))?;
        state.values.push(value.to_string());
        state.keys.insert(value.to_string(), key);
        Ok(key)
    }

    fn resolve(&self, value: &str) -> Result<Option<Key>> {
        Ok(self.state.read().keys.get(value).copied())
    }

    fn get_by_id(&self, key: Key) -> Result<Option<String>> {
        Ok(self.state.read().values.get(key as usize).cloned())
    }

    fn get_field(&self, key: Key, field: &str) -> Result<Option<FieldValue>> {
        Ok(self
            .state
            .read()
            .fields
            .get(&key)
            .and_then(|fields| fields.get(field))
            .cloned())
    }
}

/// [`KeyLookup`] for callers that already speak in keys: values are the
/// decimal rendering of the key itself and no fields are known.
#[derive(Debug, Default, Clone, Copy)]
pub struct NumericLookup;

impl KeyLookup for NumericLookup {
    fn resolve_or_create(&self, value: &str) -> Result<Key> {
        value
            .trim()
            .parse()
            .map_err(|_| Error::lookup(format!("{:?} is not a numeric key", value)))
    }

    fn resolve(&self, value: &str) -> Result<Option<Key>> {
        Ok(value.trim().parse().ok())
    }

    fn get_by_id(&self, key: Key) -> Result<Option<String>> {
        Ok(Some(key.to_string()))
    }

    fn get_field(&self, _key: Key, _field: &str) -> Result<Option<FieldValue>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_lookup_assigns_dense_keys() {
        let lookup = MemoryLookup::new();
        assert_eq!(lookup.resolve_or_create("a").unwrap(), 0);
        assert_eq!(lookup.resolve_or_create("b").unwrap(), 1);
        assert_eq!(lookup.resolve_or_create("a").unwrap(), 0);
        assert_eq!(lookup.resolve("c").unwrap(), None);
        assert_eq!(lookup.get_by_id(1).unwrap().as_deref(), Some("b"));
        assert_eq!(lookup.len(), 2);
    }

    #[test]
    fn test_memory_lookup_fields() {
        let lookup = MemoryLookup::new();
        let key = lookup.resolve_or_create("doc").unwrap();
        lookup.set_field(key, "lang", "en").unwrap();

        assert_eq!(
            lookup.get_field(key, "lang").unwrap(),
            Some(FieldValue::String("en".into()))
        );
        assert_eq!(lookup.get_field(key, "size").unwrap(), None);
        assert!(lookup.set_field(42, "lang", "en").is_err());
    }

    #[test]
    fn test_numeric_lookup() {
        assert_eq!(NumericLookup.resolve(" 17 ").unwrap(), Some(17));
        assert_eq!(NumericLookup.resolve("x").unwrap(), None);
        assert!(NumericLookup.resolve_or_create("x").is_err());
    }
}
