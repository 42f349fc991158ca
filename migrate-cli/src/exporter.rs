//! Exporter (C7): streams every entity's records and M:N associations from
//! a source pool into an [`crate::archive::ArchiveWriter`], page by page,
//! all entities concurrently bounded by the pool's DOP.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::archive::ArchiveWriter;
use crate::error::MigrationError;
use crate::pool::resilience::{RetryPolicy, RetryableError};
use crate::pool::{ClientError, ConnectionPool};
use crate::report::{Phase, Reporter};
use crate::schema::model::Schema;

/// Outcome of exporting a single entity: either the full record count, or
/// the error that isolated it — a per-entity failure is isolated, other
/// entities continue.
#[derive(Debug)]
pub enum EntityExportOutcome {
    Ok { records: u64 },
    Failed { message: String },
}

/// A manifest of what an export run actually wrote, marking partial
/// results when a pool-level failure aborted the whole run.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ExportManifest {
    pub aborted: bool,
    pub entities: HashMap<String, String>,
    pub relationships: HashMap<String, String>,
}

impl ExportManifest {
    pub fn write_to(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)
    }
}

/// Export every entity in `schema` (plus its in-scope M:N relationships)
/// from `pool` into a new archive at `out_path`.
pub async fn run_export(
    schema: &Schema,
    schema_xml: &str,
    pool: Arc<dyn ConnectionPool>,
    page_size: u32,
    out_path: impl AsRef<Path>,
    reporter: Arc<Reporter>,
    cancel: CancellationToken,
    retry: Arc<RetryPolicy>,
) -> Result<ExportManifest, MigrationError> {
    reporter.emit(crate::report::ProgressEvent::Start);
    reporter.phase(Phase::TierWrite);

    let writer = Arc::new(std::sync::Mutex::new(ArchiveWriter::new(
        out_path.as_ref(),
        schema_xml,
    )));
    let mut manifest = ExportManifest::default();

    // Wave 1: records, all entities concurrently. `pool.acquire` bounds
    // actual in-flight concurrency to the DOP regardless of how many
    // tasks are spawned.
    let record_tasks = schema.entities.iter().map(|entity| {
        let pool = pool.clone();
        let writer = writer.clone();
        let reporter = reporter.clone();
        let cancel = cancel.clone();
        let retry = retry.clone();
        let entity = entity.clone();
        async move {
            let outcome = export_entity_records(&entity, &pool, page_size, &writer, &reporter, &cancel, &retry).await;
            (entity.name.clone(), outcome)
        }
    });

    let record_results = join_all(record_tasks).await;
    for (name, outcome) in record_results {
        match outcome {
            Ok(n) => {
                manifest.entities.insert(name, format!("ok:{n}"));
            }
            Err(MigrationError::Cancelled) => {
                manifest.aborted = true;
                manifest.entities.insert(name, "cancelled".to_string());
            }
            Err(e) => {
                manifest.entities.insert(name.clone(), format!("failed:{e}"));
                reporter.entity_complete(&name, 0, 1);
            }
        }
    }

    // Wave 2: M:N relationships, in parallel by relationship, after every
    // entity's record wave has had a chance to run.
    reporter.phase(Phase::Relationships);
    let rel_tasks = schema.in_scope_relationships().map(|rel| {
        let pool = pool.clone();
        let writer = writer.clone();
        let reporter = reporter.clone();
        let cancel = cancel.clone();
        let retry = retry.clone();
        let rel = rel.clone();
        async move {
            let outcome = export_relationship(&rel, &pool, page_size, &writer, &reporter, &cancel, &retry).await;
            (rel.intersect_entity.clone(), outcome)
        }
    });
    let rel_results = join_all(rel_tasks).await;
    for (name, outcome) in rel_results {
        match outcome {
            Ok(n) => {
                manifest.relationships.insert(name, format!("ok:{n}"));
            }
            Err(e) => {
                manifest.relationships.insert(name, format!("failed:{e}"));
            }
        }
    }

    let writer = Arc::try_unwrap(writer)
        .map_err(|_| MigrationError::Unknown("archive writer still shared at finish".into()))?
        .into_inner()
        .unwrap();
    writer.finish()?;

    reporter.emit(crate::report::ProgressEvent::End);
    Ok(manifest)
}

async fn export_entity_records(
    entity: &crate::schema::model::EntityDescriptor,
    pool: &Arc<dyn ConnectionPool>,
    page_size: u32,
    writer: &Arc<std::sync::Mutex<ArchiveWriter>>,
    reporter: &Reporter,
    cancel: &CancellationToken,
    retry: &RetryPolicy,
) -> Result<u64, MigrationError> {
    reporter.entity_progress(&entity.name, 0, None, 0.0);
    let start = Instant::now();
    let mut page_number = 0u32;
    let mut cookie: Option<String> = None;
    let mut total = 0u64;
    let mut total_hint = None;

    loop {
        if cancel.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }
        let client = pool
            .acquire(cancel)
            .await
            .map_err(|e| client_fatal(&entity.name, e))?;
        let page = retry
            .run(classify_retry, || client.retrieve_page(&entity.name, page_size, page_number, cookie.as_deref()))
            .await
            .map_err(|e| client_fatal(&entity.name, e))?;
        drop(client);

        total += page.records.len() as u64;
        total_hint = page.total_hint.or(total_hint);

        {
            let mut writer = writer.lock().unwrap();
            let sink = writer.entity_sink(&entity.name);
            sink.append_records(&page.records, entity)?;
        }

        let elapsed = start.elapsed().as_secs_f64().max(0.001);
        reporter.entity_progress(&entity.name, total, total_hint, total as f64 / elapsed);

        if !page.has_more {
            break;
        }
        cookie = page.next_cookie;
        page_number += 1;
    }

    reporter.entity_complete(&entity.name, total, 0);
    Ok(total)
}

async fn export_relationship(
    relationship: &crate::schema::model::RelationshipDescriptor,
    pool: &Arc<dyn ConnectionPool>,
    page_size: u32,
    writer: &Arc<std::sync::Mutex<ArchiveWriter>>,
    reporter: &Reporter,
    cancel: &CancellationToken,
    retry: &RetryPolicy,
) -> Result<u64, MigrationError> {
    let name = &relationship.intersect_entity;
    reporter.relationship_progress(name, 0, None);
    let mut page_number = 0u32;
    let mut cookie: Option<String> = None;
    let mut total = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }
        let client = pool
            .acquire(cancel)
            .await
            .map_err(|e| client_fatal(name, e))?;
        let (pairs, next_cookie, has_more) = retry
            .run(classify_retry, || client.retrieve_associations(relationship, page_size, page_number, cookie.as_deref()))
            .await
            .map_err(|e| client_fatal(name, e))?;
        drop(client);

        total += pairs.len() as u64;
        {
            let mut writer = writer.lock().unwrap();
            let sink = writer.entity_sink(&relationship.entity1);
            sink.append_associations(name, &pairs);
        }
        reporter.relationship_progress(name, total, None);

        if !has_more {
            break;
        }
        cookie = next_cookie;
        page_number += 1;
    }

    Ok(total)
}

/// Only `THROTTLED` reads get the backoff-and-retry treatment; every other
/// `ClientError` surfaces on the first attempt.
fn classify_retry(e: &ClientError) -> RetryableError {
    match e {
        ClientError::Throttled => RetryableError::Throttled,
        _ => RetryableError::Fatal,
    }
}

fn client_fatal(entity: &str, e: ClientError) -> MigrationError {
    match e {
        ClientError::Fatal(detail) => MigrationError::NetworkFailure(format!("{entity}: {detail}")),
        other => MigrationError::Unknown(format!("{entity}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::resilience::{ConcurrencyConfig, ConcurrencyLimiter};
    use crate::pool::{BulkOutcome, RetrievedPage, SharedClientPool, WriteOutcome};
    use crate::record::Record;
    use crate::schema::model::{EntityDescriptor, FieldDescriptor, FieldType};
    use async_trait::async_trait;
    use uuid::Uuid;

    struct PagingClient {
        pages: std::sync::Mutex<Vec<Vec<Record>>>,
    }

    #[async_trait]
    impl crate::pool::Client for PagingClient {
        async fn retrieve_page(
            &self,
            _entity: &str,
            _page_size: u32,
            page_number: u32,
            _cookie: Option<&str>,
        ) -> Result<RetrievedPage, ClientError> {
            let pages = self.pages.lock().unwrap();
            let idx = page_number as usize;
            let records = pages.get(idx).cloned().unwrap_or_default();
            let has_more = idx + 1 < pages.len();
            Ok(RetrievedPage {
                records,
                next_cookie: if has_more { Some("next".into()) } else { None },
                has_more,
                total_hint: Some(pages.iter().map(|p| p.len() as u64).sum()),
            })
        }

        async fn retrieve_associations(
            &self,
            _relationship: &crate::schema::model::RelationshipDescriptor,
            _page_size: u32,
            _page_number: u32,
            _cookie: Option<&str>,
        ) -> Result<(Vec<(Uuid, Uuid)>, Option<String>, bool), ClientError> {
            Ok((vec![], None, false))
        }

        async fn exists(&self, _entity: &str, _id: Uuid) -> Result<bool, ClientError> {
            Ok(false)
        }

        async fn upsert(&self, _entity: &str, r: &Record) -> Result<WriteOutcome, ClientError> {
            Ok(WriteOutcome { old_id: r.id, new_id: r.id })
        }

        async fn upsert_multiple(&self, _entity: &str, _records: &[Record]) -> Result<BulkOutcome, ClientError> {
            Ok(BulkOutcome::NotSupported)
        }

        async fn update(&self, _entity: &str, r: &Record) -> Result<WriteOutcome, ClientError> {
            Ok(WriteOutcome { old_id: r.id, new_id: r.id })
        }

        async fn update_multiple(&self, _entity: &str, _records: &[Record]) -> Result<BulkOutcome, ClientError> {
            Ok(BulkOutcome::NotSupported)
        }

        async fn associate(
            &self,
            _relationship: &crate::schema::model::RelationshipDescriptor,
            _from: Uuid,
            _to: &[Uuid],
        ) -> Result<(), ClientError> {
            Ok(())
        }
    }

    fn account_entity() -> EntityDescriptor {
        EntityDescriptor {
            name: "account".into(),
            primary_id_field: "accountid".into(),
            fields: vec![FieldDescriptor {
                name: "name".into(),
                field_type: FieldType::String,
                lookup_entity: None,
                is_create_valid: true,
                is_update_valid: true,
            }],
        }
    }

    #[tokio::test]
    async fn exports_all_pages_and_reports_completion() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("bundle.zip");

        let page1 = vec![crate::record::Record::new(Uuid::new_v4()).with_field(
            "name",
            crate::value::Value::String("Acme".into()),
        )];
        let page2 = vec![crate::record::Record::new(Uuid::new_v4())];
        let client = Arc::new(PagingClient {
            pages: std::sync::Mutex::new(vec![page1, page2]),
        });
        let limiter = ConcurrencyLimiter::new(ConcurrencyConfig { dop: 4, enabled: true });
        let pool: Arc<dyn ConnectionPool> = Arc::new(SharedClientPool::new(client, limiter));

        let schema = Schema {
            entities: vec![account_entity()],
            relationships: vec![],
        };
        let reporter = Arc::new(Reporter::new());
        let mut rx = reporter.subscribe();

        let retry = Arc::new(RetryPolicy::new(crate::pool::resilience::RetryConfig::default()));
        let manifest = run_export(
            &schema,
            "<entities/>",
            pool,
            5000,
            &out,
            reporter,
            CancellationToken::new(),
            retry,
        )
        .await
        .unwrap();

        assert_eq!(manifest.entities.get("account"), Some(&"ok:2".to_string()));
        assert!(!manifest.aborted);
        assert!(out.exists());

        let mut saw_complete = false;
        while let Ok(event) = rx.try_recv() {
            if let crate::report::ProgressEvent::EntityComplete { ok, .. } = event {
                assert_eq!(ok, 2);
                saw_complete = true;
            }
        }
        assert!(saw_complete);

        let mut reader = crate::archive::ArchiveReader::open(&out).unwrap();
        let data = reader.read_entity(&account_entity()).unwrap().unwrap();
        assert_eq!(data.records.len(), 2);
    }
}
