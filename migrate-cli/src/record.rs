//! A single exported/imported record: its id plus a field map. Fields are
//! kept in a `BTreeMap` so archive serialization is deterministic (stable
//! field ordering makes diffing exported archives meaningful).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_inserts_fields() {
        let id = Uuid::nil();
        let record = Record::new(id).with_field("name", Value::String("x".into()));
        assert_eq!(record.get("name"), Some(&Value::String("x".into())));
        assert_eq!(record.id, id);
    }
}
