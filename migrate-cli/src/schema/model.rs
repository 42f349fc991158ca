//! In-memory schema model: entities, fields, and M:N relationship
//! descriptors parsed from `data_schema.xml`.

use serde::{Deserialize, Serialize};

/// A field's resolved type, after alias mapping and `lookupentity` inference
/// (see [`crate::schema::reader::resolve_field_type`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    String,
    Int,
    BigInt,
    Decimal,
    Money,
    Double,
    Boolean,
    DateTime,
    Guid,
    Reference,
    OptionSet,
    MultiOptionSet,
    State,
    Status,
    PartyList,
    Memo,
}

impl FieldType {
    /// Whether this type's value is a reference to another entity's record.
    pub fn is_reference(self) -> bool {
        matches!(self, FieldType::Reference | FieldType::PartyList)
    }
}

/// A single field on an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
    /// Present on reference-typed fields; names the target entity.
    pub lookup_entity: Option<String>,
    pub is_create_valid: bool,
    pub is_update_valid: bool,
}

/// An entity and its fields, as declared in the schema document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub name: String,
    pub primary_id_field: String,
    pub fields: Vec<FieldDescriptor>,
}

impl EntityDescriptor {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// All reference fields (lookups and party lists) declared on this
    /// entity, used by the dependency analyzer (C6) to build graph edges.
    pub fn reference_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.field_type.is_reference())
    }
}

/// A many-to-many relationship, realized through an intersect entity with
/// two foreign-key attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipDescriptor {
    pub intersect_entity: String,
    pub entity1: String,
    pub key1: String,
    pub entity2: String,
    pub key2: String,
}

/// The full schema: an ordered list of entities plus the relationships
/// section, preserved for verbatim re-emission on export.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    pub entities: Vec<EntityDescriptor>,
    pub relationships: Vec<RelationshipDescriptor>,
}

impl Schema {
    pub fn entity(&self, name: &str) -> Option<&EntityDescriptor> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.iter().map(|e| e.name.as_str())
    }

    /// M:N relationships where both endpoints are entities present in this
    /// schema (the only ones the exporter/importer can act on).
    pub fn in_scope_relationships(&self) -> impl Iterator<Item = &RelationshipDescriptor> {
        self.relationships
            .iter()
            .filter(|r| self.entity(&r.entity1).is_some() && self.entity(&r.entity2).is_some())
    }
}
