//! Metadata service contract (C4): a narrow async interface over a live
//! environment's field metadata, option sets, M:N relationships, and
//! alternate keys, pared down to what the dependency analyzer and importer
//! actually consume.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MigrationError;
use crate::schema::model::RelationshipDescriptor;

/// Field metadata as retrieved from a live environment, used during
/// schema validation to classify bundle fields as create/update
/// valid, and by the dependency analyzer to resolve undeclared references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMeta {
    pub logical_name: String,
    pub is_create_valid: bool,
    pub is_update_valid: bool,
    pub required: RequiredLevel,
    /// For lookup fields: the target entity.
    pub related_entity: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequiredLevel {
    None,
    Recommended,
    Required,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionSetValue {
    pub label: String,
    pub value: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlternateKey {
    pub name: String,
    pub key_fields: Vec<String>,
}

/// The metadata service contract. All operations are suspending and
/// fail with `MetadataUnavailable`.
#[async_trait]
pub trait MetadataService: Send + Sync {
    async fn field_metadata(&self, entity: &str) -> Result<Vec<FieldMeta>, MigrationError>;

    async fn option_set_values(
        &self,
        entity: &str,
        field: &str,
    ) -> Result<Vec<OptionSetValue>, MigrationError>;

    async fn m2m_relationships(
        &self,
        entity: &str,
    ) -> Result<Vec<RelationshipDescriptor>, MigrationError>;

    async fn alternate_keys(&self, entity: &str) -> Result<Vec<AlternateKey>, MigrationError>;
}
