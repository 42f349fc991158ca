//! A filesystem-backed [`Client`] and [`MetadataService`] pair, each entity
//! stored as its own JSON file. Meant for local testing, demos, and the
//! shipped CLI's end-to-end smoke path — not a model for a real backend
//! integration, which would speak the target environment's own wire
//! protocol instead of JSON-on-disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::MigrationError;
use crate::metadata::{AlternateKey, FieldMeta, MetadataService, OptionSetValue, RequiredLevel};
use crate::pool::{BulkOutcome, Client, ClientError, RetrievedPage, WriteOutcome};
use crate::record::Record;
use crate::schema::model::{RelationshipDescriptor, Schema};

pub struct LocalFileClient {
    root: PathBuf,
    entities: Mutex<HashMap<String, Vec<Record>>>,
    associations: Mutex<HashMap<String, Vec<(uuid::Uuid, uuid::Uuid)>>>,
}

impl LocalFileClient {
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            entities: Mutex::new(HashMap::new()),
            associations: Mutex::new(HashMap::new()),
        })
    }

    fn entity_path(&self, entity: &str) -> PathBuf {
        self.root.join(format!("{entity}.json"))
    }

    fn assoc_path(&self, relationship: &str) -> PathBuf {
        self.root.join(format!("{relationship}.assoc.json"))
    }

    fn with_entity<R>(&self, entity: &str, f: impl FnOnce(&mut Vec<Record>) -> R) -> R {
        let mut entities = self.entities.lock().unwrap();
        let records = entities.entry(entity.to_string()).or_insert_with(|| {
            let path = self.entity_path(entity);
            std::fs::read_to_string(&path)
                .ok()
                .and_then(|text| serde_json::from_str(&text).ok())
                .unwrap_or_default()
        });
        let result = f(records);
        let _ = std::fs::write(
            self.entity_path(entity),
            serde_json::to_string_pretty(records).unwrap_or_default(),
        );
        result
    }

    fn with_associations<R>(
        &self,
        relationship: &str,
        f: impl FnOnce(&mut Vec<(uuid::Uuid, uuid::Uuid)>) -> R,
    ) -> R {
        let mut associations = self.associations.lock().unwrap();
        let pairs = associations
            .entry(relationship.to_string())
            .or_insert_with(|| {
                let path = self.assoc_path(relationship);
                std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|text| serde_json::from_str(&text).ok())
                    .unwrap_or_default()
            });
        let result = f(pairs);
        let _ = std::fs::write(
            self.assoc_path(relationship),
            serde_json::to_string_pretty(pairs).unwrap_or_default(),
        );
        result
    }
}

#[async_trait]
impl Client for LocalFileClient {
    async fn retrieve_page(
        &self,
        entity: &str,
        page_size: u32,
        page_number: u32,
        _cookie: Option<&str>,
    ) -> Result<RetrievedPage, ClientError> {
        let (records, total) = self.with_entity(entity, |records| {
            records.sort_by_key(|r| r.id);
            let start = page_number as usize * page_size as usize;
            let page = records
                .iter()
                .skip(start)
                .take(page_size as usize)
                .cloned()
                .collect::<Vec<_>>();
            (page, records.len())
        });
        let has_more = (page_number as usize + 1) * page_size as usize < total;
        Ok(RetrievedPage {
            records,
            next_cookie: has_more.then(|| (page_number + 1).to_string()),
            has_more,
            total_hint: Some(total as u64),
        })
    }

    async fn retrieve_associations(
        &self,
        relationship: &RelationshipDescriptor,
        page_size: u32,
        page_number: u32,
        _cookie: Option<&str>,
    ) -> Result<(Vec<(uuid::Uuid, uuid::Uuid)>, Option<String>, bool), ClientError> {
        let (pairs, total) = self.with_associations(&relationship.intersect_entity, |pairs| {
            let start = page_number as usize * page_size as usize;
            let page = pairs
                .iter()
                .skip(start)
                .take(page_size as usize)
                .copied()
                .collect::<Vec<_>>();
            (page, pairs.len())
        });
        let has_more = (page_number as usize + 1) * page_size as usize < total;
        Ok((
            pairs,
            has_more.then(|| (page_number + 1).to_string()),
            has_more,
        ))
    }

    async fn exists(&self, entity: &str, id: uuid::Uuid) -> Result<bool, ClientError> {
        Ok(self.with_entity(entity, |records| records.iter().any(|r| r.id == id)))
    }

    async fn upsert(&self, entity: &str, record: &Record) -> Result<WriteOutcome, ClientError> {
        self.with_entity(entity, |records| {
            match records.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record.clone(),
                None => records.push(record.clone()),
            }
        });
        Ok(WriteOutcome {
            old_id: record.id,
            new_id: record.id,
        })
    }

    async fn upsert_multiple(
        &self,
        entity: &str,
        records: &[Record],
    ) -> Result<BulkOutcome, ClientError> {
        let results = records
            .iter()
            .map(|r| {
                self.with_entity(entity, |existing| {
                    match existing.iter_mut().find(|e| e.id == r.id) {
                        Some(slot) => *slot = r.clone(),
                        None => existing.push(r.clone()),
                    }
                });
                Ok(WriteOutcome {
                    old_id: r.id,
                    new_id: r.id,
                })
            })
            .collect();
        Ok(BulkOutcome::Results(results))
    }

    async fn update(&self, entity: &str, record: &Record) -> Result<WriteOutcome, ClientError> {
        let found = self.with_entity(entity, |records| {
            match records.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => {
                    *existing = record.clone();
                    true
                }
                None => false,
            }
        });
        if found {
            Ok(WriteOutcome {
                old_id: record.id,
                new_id: record.id,
            })
        } else {
            Err(ClientError::NotFound)
        }
    }

    async fn update_multiple(
        &self,
        entity: &str,
        records: &[Record],
    ) -> Result<BulkOutcome, ClientError> {
        let results = records
            .iter()
            .map(|r| {
                let found = self.with_entity(entity, |existing| {
                    match existing.iter_mut().find(|e| e.id == r.id) {
                        Some(slot) => {
                            *slot = r.clone();
                            true
                        }
                        None => false,
                    }
                });
                if found {
                    Ok(WriteOutcome {
                        old_id: r.id,
                        new_id: r.id,
                    })
                } else {
                    Err(ClientError::NotFound)
                }
            })
            .collect();
        Ok(BulkOutcome::Results(results))
    }

    async fn associate(
        &self,
        relationship: &RelationshipDescriptor,
        from: uuid::Uuid,
        to: &[uuid::Uuid],
    ) -> Result<(), ClientError> {
        self.with_associations(&relationship.intersect_entity, |pairs| {
            for &target in to {
                if !pairs.contains(&(from, target)) {
                    pairs.push((from, target));
                }
            }
        });
        Ok(())
    }
}

/// A [`MetadataService`] that answers entirely from the already-parsed
/// schema: every declared field is both create- and update-valid and
/// never required, lookup fields name their target entity, and M:N
/// relationships come straight from [`Schema::relationships`]. Good enough
/// for the reference backend; a real environment's metadata endpoint
/// would answer these independently of the schema document.
pub struct SchemaMetadataService {
    schema: Schema,
}

impl SchemaMetadataService {
    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }
}

#[async_trait]
impl MetadataService for SchemaMetadataService {
    async fn field_metadata(&self, entity: &str) -> Result<Vec<FieldMeta>, MigrationError> {
        let descriptor = self.schema.entity(entity).ok_or_else(|| {
            MigrationError::MetadataUnavailable {
                entity: entity.to_string(),
                detail: "not declared in schema".to_string(),
            }
        })?;
        Ok(descriptor
            .fields
            .iter()
            .map(|f| FieldMeta {
                logical_name: f.name.clone(),
                is_create_valid: f.is_create_valid,
                is_update_valid: f.is_update_valid,
                required: RequiredLevel::None,
                related_entity: f.lookup_entity.clone(),
            })
            .collect())
    }

    async fn option_set_values(
        &self,
        _entity: &str,
        _field: &str,
    ) -> Result<Vec<OptionSetValue>, MigrationError> {
        Ok(vec![])
    }

    async fn m2m_relationships(
        &self,
        entity: &str,
    ) -> Result<Vec<RelationshipDescriptor>, MigrationError> {
        Ok(self
            .schema
            .relationships
            .iter()
            .filter(|r| r.entity1 == entity || r.entity2 == entity)
            .cloned()
            .collect())
    }

    async fn alternate_keys(&self, _entity: &str) -> Result<Vec<AlternateKey>, MigrationError> {
        Ok(vec![])
    }
}
