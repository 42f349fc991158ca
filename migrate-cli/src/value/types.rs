//! The backend's typed value representation, kept as a tagged
//! variant rather than a dynamic bag so encoding/decoding dispatch is
//! exhaustive over variants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A reference to another record by (entity, id). Whether the target was
/// known to exist in the source at export time is derived by the importer
/// from the bundle's own per-entity id sets rather than carried on every
/// reference value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub entity: String,
    pub id: Uuid,
}

impl Reference {
    pub fn new(entity: impl Into<String>, id: Uuid) -> Self {
        Self {
            entity: entity.into(),
            id,
        }
    }
}

/// A decimal-typed value. The textual form is kept alongside the parsed
/// `f64` so encode(decode(v)) round-trips bit-exactly without going through
/// a lossy binary-float re-serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecimalValue {
    pub text: String,
    pub numeric: f64,
}

impl DecimalValue {
    pub fn parse(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        let numeric: f64 = trimmed.parse().ok()?;
        Some(Self {
            text: trimmed.to_string(),
            numeric,
        })
    }
}

impl PartialEq for DecimalValue {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

/// A tagged-variant value as it exists in a backend record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    String(String),
    Int64(i64),
    Decimal(DecimalValue),
    Money(DecimalValue),
    Bool(bool),
    DateTime(DateTime<Utc>),
    Guid(Uuid),
    Reference(Reference),
    OptionSet(i32),
    MultiOptionSet(Vec<i32>),
    PartyList(Vec<Reference>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The reference this value points to, if any — used by the dependency
    /// analyzer and the importer's elide/remap step. `PartyList` only
    /// exposes its *first* reference here; callers that need every
    /// party-list entry should match on the variant directly.
    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            Value::Reference(r) => Some(r),
            Value::PartyList(list) => list.first(),
            _ => None,
        }
    }

    /// Every reference in a `PartyList`, in order. Plain `Reference`
    /// values are not party lists and yield `None` here — use
    /// [`Value::as_reference`] for those.
    pub fn as_party_list(&self) -> Option<&[Reference]> {
        match self {
            Value::PartyList(list) => Some(list),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_equality_is_textual() {
        let a = DecimalValue::parse("1.50").unwrap();
        let b = DecimalValue::parse("1.5").unwrap();
        // Same numeric value, different canonical text: not equal by our
        // round-trip-sensitive definition.
        assert_ne!(a, b);
        let c = DecimalValue::parse("1.50").unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn null_is_null() {
        assert!(Value::Null.is_null());
        assert!(!Value::Int64(0).is_null());
    }
}
