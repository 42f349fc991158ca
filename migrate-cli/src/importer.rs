//! Tiered Importer (C10): the phased import driver — SchemaValidate, Plan,
//! the per-tier write/M:N wave loop, the deferred-field pass, and the
//! final error report.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::archive::ArchiveReader;
use crate::capability::{BulkCapabilityCache, BulkOp, Tri};
use crate::dependency::{self};
use crate::error::{ErrorCategory, MigrationError};
use crate::idmap::IdMap;
use crate::metadata::MetadataService;
use crate::pool::resilience::{RetryPolicy, RetryableError};
use crate::pool::{BulkOutcome, Client, ClientError, ConnectionPool, WriteOutcome};
use crate::record::Record;
use crate::report::{Phase, ReportBuilder, Reporter};
use crate::schema::model::{EntityDescriptor, Schema};
use crate::session::{ImportMode, ImportSession, UserMap};
use crate::value::Value;

/// Result of a full import run.
pub struct ImportResult {
    pub id_map: IdMap,
    pub report: crate::report::ErrorReport,
}

/// A reference field whose value was elided from a write payload because
/// its target wasn't known to be mapped yet — either statically deferred
/// (self/intra-SCC) or a same-tier forward reference discovered at write
/// time.
#[derive(Debug, Clone)]
struct PendingUpdate {
    entity: String,
    record_id: Uuid,
    field: String,
    target_entity: String,
    target_old_id: Uuid,
    /// `None` for a plain reference field; `Some(i)` for the `i`th entry
    /// of a `partylist` field, so the deferred pass can tell a single
    /// deferred reference apart from one member of a multi-party list
    /// that shares the same field name.
    list_index: Option<usize>,
}

/// Drives the full tiered import.
pub async fn run_import(
    bundle_path: impl AsRef<Path>,
    schema_override: Option<Schema>,
    pool: Arc<dyn ConnectionPool>,
    metadata: Arc<dyn MetadataService>,
    user_map: Option<UserMap>,
    session: ImportSession,
    reporter: Arc<Reporter>,
    cancel: CancellationToken,
) -> Result<ImportResult, MigrationError> {
    reporter.emit(crate::report::ProgressEvent::Start);

    let mut archive = ArchiveReader::open(bundle_path)?;
    let bundle_schema = match schema_override {
        Some(s) => s,
        None => crate::schema::parse_schema(&archive.read_schema_xml()?)?,
    };
    let present_in_archive: HashSet<String> = archive.entities_present().into_iter().collect();

    let id_map = IdMap::new();
    let capability = BulkCapabilityCache::new();
    let retry = Arc::new(crate::session::retry_policy(&session.options));
    let report = ReportBuilder::new(session.clone_for_report());
    if session.options.verbose_report {
        for name in bundle_schema.entity_names() {
            report.enable_verbose(name);
        }
    }

    // Phase 1: SchemaValidate.
    reporter.phase(Phase::SchemaValidate);
    let mut in_scope: HashSet<String> = HashSet::new();
    let mut entity_data: HashMap<String, crate::archive::EntityData> = HashMap::new();
    let mut writable_fields: HashMap<String, HashSet<String>> = HashMap::new();

    for entity in &bundle_schema.entities {
        report.ensure_entity(&entity.name);
        if !present_in_archive.contains(&entity.name) {
            // Declared in the schema but absent from the archive: skip
            // with a warning, not a hard failure.
            log::warn!("entity '{}' has no data in the archive, skipping", entity.name);
            continue;
        }

        let data = match archive.read_entity(entity) {
            Ok(Some(d)) => d,
            Ok(None) => continue,
            Err(e) => {
                report.record_error(&entity.name, Uuid::nil(), None, ErrorCategory::Unknown, e.to_string());
                continue;
            }
        };

        match metadata.field_metadata(&entity.name).await {
            Ok(target_fields) => {
                let target_by_name: HashMap<&str, _> =
                    target_fields.iter().map(|f| (f.logical_name.as_str(), f)).collect();

                let mut missing_required = Vec::new();
                let mut writable = HashSet::new();
                for field in &entity.fields {
                    match target_by_name.get(field.name.as_str()) {
                        Some(meta) => {
                            let valid = match session.options.mode {
                                ImportMode::CreateOnly => meta.is_create_valid,
                                ImportMode::UpdateOnly => meta.is_update_valid,
                                ImportMode::Upsert => meta.is_create_valid || meta.is_update_valid,
                            };
                            if valid {
                                writable.insert(field.name.clone());
                            }
                        }
                        None => {
                            report.record_stripped_field(&entity.name, &field.name);
                        }
                    }
                }
                for meta in &target_fields {
                    if meta.required == crate::metadata::RequiredLevel::Required
                        && entity.field(&meta.logical_name).is_none()
                    {
                        missing_required.push(meta.logical_name.clone());
                    }
                }

                if !missing_required.is_empty() {
                    report.record_error(
                        &entity.name,
                        Uuid::nil(),
                        None,
                        ErrorCategory::SchemaMismatch,
                        format!("missing required field(s): {}", missing_required.join(", ")),
                    );
                    report.record_skipped(&entity.name, data.records.len() as u64);
                    continue;
                }

                writable_fields.insert(entity.name.clone(), writable);
                entity_data.insert(entity.name.clone(), data);
                in_scope.insert(entity.name.clone());
            }
            Err(e) => {
                report.record_error(&entity.name, Uuid::nil(), None, ErrorCategory::Unknown, e.to_string());
                report.record_skipped(&entity.name, data.records.len() as u64);
            }
        }
    }

    // Phase 2: Plan.
    reporter.phase(Phase::Plan);
    let mut plan = dependency::build_plan(&bundle_schema, &in_scope);
    let mut extra: Vec<String> = present_in_archive
        .iter()
        .filter(|e| bundle_schema.entity(e.as_str()).is_none())
        .cloned()
        .collect();
    extra.sort();
    for name in extra {
        if let Ok(Some(data)) = archive.read_entity(&unknown_entity_descriptor(&name)) {
            entity_data.insert(name.clone(), data);
            writable_fields.insert(name.clone(), HashSet::new());
            in_scope.insert(name.clone());
            plan.tiers.push(crate::dependency::Tier {
                entities: vec![name],
                deferred_fields: vec![],
            });
        }
    }

    let bundle_id_sets: HashMap<String, HashSet<Uuid>> = entity_data
        .iter()
        .map(|(name, data)| (name.clone(), data.records.iter().map(|r| r.id).collect()))
        .collect();

    let mut pending_updates: Vec<PendingUpdate> = Vec::new();
    let mut associated_relationships: HashSet<String> = HashSet::new();

    // Phase 3: tier loop.
    reporter.phase(Phase::TierWrite);
    let tier_index = plan.tier_index();
    for (tier_no, tier) in plan.tiers.iter().enumerate() {
        if cancel.is_cancelled() {
            reporter.emit(crate::report::ProgressEvent::Cancelled);
            break;
        }

        let deferred_names: HashMap<String, HashSet<String>> = tier
            .entities
            .iter()
            .map(|e| (e.clone(), tier.deferred_field_names(e).into_iter().map(String::from).collect()))
            .collect();

        let max_parallel = session.options.max_parallel_entities.max(1);
        let mut entity_chunks = tier.entities.chunks(max_parallel);
        while let Some(chunk) = entity_chunks.next() {
            let tasks = chunk.iter().map(|entity_name| {
                let entity = bundle_schema
                    .entity(entity_name)
                    .cloned()
                    .unwrap_or_else(|| unknown_entity_descriptor(entity_name));
                let records = entity_data.get(entity_name).map(|d| d.records.clone()).unwrap_or_default();
                let writable = writable_fields.get(entity_name).cloned().unwrap_or_default();
                let deferred = deferred_names.get(entity_name).cloned().unwrap_or_default();
                let pool = pool.clone();
                let id_map = &id_map;
                let capability = &capability;
                let report = &report;
                let reporter = reporter.clone();
                let user_map = user_map.clone();
                let options = session.options.clone();
                let cancel = cancel.clone();
                let bundle_id_sets = &bundle_id_sets;
                let retry = retry.clone();

                async move {
                    write_entity_tier(
                        &entity,
                        records,
                        &writable,
                        &deferred,
                        tier_no,
                        &tier_index,
                        pool,
                        id_map,
                        capability,
                        report,
                        &reporter,
                        user_map.as_ref(),
                        &options,
                        &cancel,
                        bundle_id_sets,
                        &retry,
                    )
                    .await
                }
            });
            let results: Vec<Vec<PendingUpdate>> = join_all(tasks).await;
            for r in results {
                pending_updates.extend(r);
            }
        }

        // M:N wave: relationships whose both endpoints are at or before
        // this tier and haven't been associated by an earlier tier yet —
        // each relationship is associated exactly once, as soon as it
        // becomes ready, not re-imported on every later tier.
        reporter.phase(Phase::Relationships);
        let ready_rels: Vec<_> = bundle_schema
            .in_scope_relationships()
            .filter(|rel| {
                if associated_relationships.contains(&rel.intersect_entity) {
                    return false;
                }
                let t1 = tier_index.get(&rel.entity1);
                let t2 = tier_index.get(&rel.entity2);
                matches!((t1, t2), (Some(&a), Some(&b)) if a <= tier_no && b <= tier_no)
            })
            .cloned()
            .collect();
        for rel in &ready_rels {
            associated_relationships.insert(rel.intersect_entity.clone());
        }

        let rel_tasks = ready_rels.iter().map(|rel| {
            // Associations are recorded under entity1's archive section
            // (see exporter); look them up there by relationship name.
            let pairs = entity_data
                .get(&rel.entity1)
                .and_then(|d| d.associations.get(&rel.intersect_entity).cloned())
                .unwrap_or_default();
            let pool = pool.clone();
            let id_map = &id_map;
            let rel = rel.clone();
            let reporter = reporter.clone();
            let cancel = cancel.clone();
            let retry = retry.clone();
            async move { import_associations(&rel, &pairs, id_map, &pool, &reporter, &cancel, &retry).await }
        });
        join_all(rel_tasks).await;
        reporter.phase(Phase::TierWrite);
    }

    // Phase 4: deferred-field pass.
    reporter.phase(Phase::DeferredFields);
    run_deferred_pass(
        &pending_updates,
        &bundle_schema,
        &writable_fields,
        pool.clone(),
        &id_map,
        &capability,
        &report,
        &session.options,
        &cancel,
        &retry,
    )
    .await;

    // Phase 5: report.
    reporter.phase(Phase::Report);
    reporter.emit(crate::report::ProgressEvent::End);

    Ok(ImportResult {
        id_map,
        report: report.finish(),
    })
}

/// A placeholder descriptor for an entity present in the archive but not
/// declared by the active schema — every field decodes as `String`
/// ("import without schema metadata").
fn unknown_entity_descriptor(name: &str) -> EntityDescriptor {
    EntityDescriptor {
        name: name.to_string(),
        primary_id_field: format!("{name}id"),
        fields: vec![],
    }
}

#[allow(clippy::too_many_arguments)]
async fn write_entity_tier(
    entity: &EntityDescriptor,
    records: Vec<Record>,
    writable_fields: &HashSet<String>,
    statically_deferred: &HashSet<String>,
    tier_no: usize,
    tier_index: &HashMap<String, usize>,
    pool: Arc<dyn ConnectionPool>,
    id_map: &IdMap,
    capability: &BulkCapabilityCache,
    report: &ReportBuilder,
    reporter: &Reporter,
    user_map: Option<&UserMap>,
    options: &crate::session::MigrationOptions,
    cancel: &CancellationToken,
    bundle_id_sets: &HashMap<String, HashSet<Uuid>>,
    retry: &RetryPolicy,
) -> Vec<PendingUpdate> {
    let total = records.len() as u64;
    reporter.entity_progress(&entity.name, 0, Some(total), 0.0);
    let start = Instant::now();

    let mut pending = Vec::new();
    let mut payloads: Vec<Record> = Vec::with_capacity(records.len());

    for record in &records {
        let mut payload = Record::new(record.id);
        for (field_name, value) in &record.fields {
            if !entity.fields.is_empty() && !writable_fields.contains(field_name) {
                continue;
            }
            let field_desc = entity.field(field_name);
            let is_reference = field_desc.map(|f| f.field_type.is_reference()).unwrap_or(false);
            let is_party_list = field_desc
                .map(|f| f.field_type == crate::schema::model::FieldType::PartyList)
                .unwrap_or(false);

            if !is_reference {
                payload.fields.insert(field_name.clone(), remap_owner(value, field_name, user_map));
                continue;
            }

            if is_party_list {
                let Some(parties) = value.as_party_list() else {
                    continue;
                };
                resolve_party_list(
                    entity,
                    record.id,
                    field_name,
                    parties,
                    statically_deferred,
                    tier_no,
                    tier_index,
                    id_map,
                    report,
                    &mut pending,
                    &mut payload,
                );
                continue;
            }

            let Some(reference) = value.as_reference() else {
                continue;
            };

            if statically_deferred.contains(field_name.as_str()) {
                pending.push(PendingUpdate {
                    entity: entity.name.clone(),
                    record_id: record.id,
                    field: field_name.clone(),
                    target_entity: reference.entity.clone(),
                    target_old_id: reference.id,
                    list_index: None,
                });
                continue;
            }

            match id_map.get(&reference.entity, reference.id) {
                Some(new_id) => {
                    payload.fields.insert(
                        field_name.clone(),
                        Value::Reference(crate::value::Reference::new(reference.entity.as_str(), new_id)),
                    );
                }
                None => {
                    let same_or_later_tier = tier_index
                        .get(&reference.entity)
                        .map(|&t| t >= tier_no)
                        .unwrap_or(false);
                    if same_or_later_tier {
                        // Forward reference inside this tier's SCC that
                        // wasn't statically flagged — elide and patch in
                        // the deferred pass.
                        pending.push(PendingUpdate {
                            entity: entity.name.clone(),
                            record_id: record.id,
                            field: field_name.clone(),
                            target_entity: reference.entity.clone(),
                            target_old_id: reference.id,
                            list_index: None,
                        });
                    } else {
                        report.record_error(
                            &entity.name,
                            record.id,
                            Some(field_name.clone()),
                            ErrorCategory::ReferenceUnmapped,
                            format!("{}/{} is not mapped", reference.entity, reference.id),
                        );
                    }
                }
            }
        }
        payloads.push(payload);
    }

    let mode_filtered = match options.mode {
        ImportMode::Upsert => payloads,
        ImportMode::CreateOnly | ImportMode::UpdateOnly => {
            filter_by_mode(payloads, &pool, &entity.name, options.mode, report, cancel, retry).await
        }
    };

    let mut ok = 0u64;
    let mut failed = 0u64;
    for chunk in mode_filtered.chunks(options.batch_size) {
        if cancel.is_cancelled() {
            break;
        }
        let outcomes =
            write_batch_with_probe(&pool, &entity.name, capability, BulkOp::Create, chunk, cancel, retry).await;
        for (old_id, result) in outcomes {
            match result {
                Ok(outcome) => {
                    id_map.insert(&entity.name, old_id, outcome.new_id);
                    report.record_created(&entity.name, outcome.new_id);
                    ok += 1;
                }
                Err(category_err) => {
                    if let Some((category, message)) = category_err {
                        if !category.is_suppressed() {
                            report.record_error(&entity.name, old_id, None, category, message);
                            failed += 1;
                        }
                    }
                }
            }
        }
        let elapsed = start.elapsed().as_secs_f64().max(0.001);
        reporter.entity_progress(&entity.name, ok + failed, Some(total), ok as f64 / elapsed);
    }

    reporter.entity_complete(&entity.name, ok, failed);
    pending
}

/// Resolves every entry of a `partylist` field, mirroring the single-
/// reference elide/remap/defer logic but over a list. A `partylist` can't
/// be partially written, so the whole field is elided the moment any
/// member needs deferring — every still-resolvable member then also goes
/// into `pending` (tagged with its list position) so the deferred pass can
/// rebuild the complete list later.
#[allow(clippy::too_many_arguments)]
fn resolve_party_list(
    entity: &EntityDescriptor,
    record_id: Uuid,
    field_name: &str,
    parties: &[crate::value::Reference],
    statically_deferred: &HashSet<String>,
    tier_no: usize,
    tier_index: &HashMap<String, usize>,
    id_map: &IdMap,
    report: &ReportBuilder,
    pending: &mut Vec<PendingUpdate>,
    payload: &mut Record,
) {
    let field_is_deferred = statically_deferred.contains(field_name);

    enum Member {
        Resolved(Uuid),
        Deferred,
    }

    let mut members = Vec::with_capacity(parties.len());
    let mut needs_defer = field_is_deferred;

    for party in parties {
        if field_is_deferred {
            members.push(Some(Member::Deferred));
            continue;
        }
        match id_map.get(&party.entity, party.id) {
            Some(new_id) => members.push(Some(Member::Resolved(new_id))),
            None => {
                let same_or_later_tier = tier_index
                    .get(&party.entity)
                    .map(|&t| t >= tier_no)
                    .unwrap_or(false);
                if same_or_later_tier {
                    needs_defer = true;
                    members.push(Some(Member::Deferred));
                } else {
                    report.record_error(
                        &entity.name,
                        record_id,
                        Some(field_name.to_string()),
                        ErrorCategory::ReferenceUnmapped,
                        format!("{}/{} is not mapped", party.entity, party.id),
                    );
                    members.push(None);
                }
            }
        }
    }

    if needs_defer {
        for (idx, (party, member)) in parties.iter().zip(members.iter()).enumerate() {
            if member.is_none() {
                continue;
            }
            pending.push(PendingUpdate {
                entity: entity.name.clone(),
                record_id,
                field: field_name.to_string(),
                target_entity: party.entity.clone(),
                target_old_id: party.id,
                list_index: Some(idx),
            });
        }
    } else {
        let resolved: Vec<crate::value::Reference> = parties
            .iter()
            .zip(members)
            .filter_map(|(party, member)| match member {
                Some(Member::Resolved(new_id)) => Some(crate::value::Reference::new(party.entity.as_str(), new_id)),
                _ => None,
            })
            .collect();
        payload.fields.insert(field_name.to_string(), Value::PartyList(resolved));
    }
}

fn remap_owner(value: &Value, field_name: &str, user_map: Option<&UserMap>) -> Value {
    let is_owner_field = field_name == "ownerid" || field_name == "owninguser" || field_name == "owningteam";
    match (is_owner_field, value, user_map) {
        (true, Value::Reference(r), Some(map)) => match map.resolve(r.id) {
            Some(new_owner) => Value::Reference(crate::value::Reference::new(r.entity.as_str(), new_owner)),
            None => value.clone(),
        },
        _ => value.clone(),
    }
}

async fn filter_by_mode(
    payloads: Vec<Record>,
    pool: &Arc<dyn ConnectionPool>,
    entity: &str,
    mode: ImportMode,
    report: &ReportBuilder,
    cancel: &CancellationToken,
    retry: &RetryPolicy,
) -> Vec<Record> {
    let mut out = Vec::with_capacity(payloads.len());
    let mut skipped = 0u64;
    for record in payloads {
        if cancel.is_cancelled() {
            break;
        }
        let client = match pool.acquire(cancel).await {
            Ok(c) => c,
            Err(_) => break,
        };
        let exists = retry
            .run(classify_retry, || client.exists(entity, record.id))
            .await
            .unwrap_or(false);
        drop(client);
        let keep = match mode {
            ImportMode::CreateOnly => !exists,
            ImportMode::UpdateOnly => exists,
            ImportMode::Upsert => true,
        };
        if keep {
            out.push(record);
        } else {
            skipped += 1;
        }
    }
    if skipped > 0 {
        report.record_skipped(entity, skipped);
    }
    out
}

/// Probe-once batch write: the first batch of the session for an entity
/// whose capability is `Unknown` sends a single-record probe before
/// committing to the rest. Works for either
/// `UpsertMultiple` (create wave) or `UpdateMultiple` (deferred pass) via
/// `op`.
#[allow(clippy::too_many_arguments)]
async fn write_batch_with_probe(
    pool: &Arc<dyn ConnectionPool>,
    entity: &str,
    capability: &BulkCapabilityCache,
    op: BulkOp,
    chunk: &[Record],
    cancel: &CancellationToken,
    retry: &RetryPolicy,
) -> Vec<(Uuid, Result<WriteOutcome, Option<(ErrorCategory, String)>>)> {
    if chunk.is_empty() {
        return Vec::new();
    }

    let state = capability.get(entity, op);
    let client = match pool.acquire(cancel).await {
        Ok(c) => c,
        Err(e) => {
            return chunk
                .iter()
                .map(|r| (r.id, Err(Some((ErrorCategory::Unknown, e.to_string())))))
                .collect();
        }
    };

    match state {
        Tri::NotSupported => {
            let mut out = Vec::with_capacity(chunk.len());
            for record in chunk {
                out.push((record.id, single_write(&*client, entity, record, op, retry).await));
            }
            out
        }
        Tri::Supported => bulk_write(&*client, entity, chunk, op, retry).await,
        Tri::Unknown => {
            let probe = &chunk[0..1];
            let probe_result = bulk_op_call(&*client, entity, probe, op, retry).await;
            match probe_result {
                Ok(BulkOutcome::NotSupported) | Err(ClientError::BulkNotSupported) => {
                    capability.set(entity, op, Tri::NotSupported);
                    let mut out = Vec::new();
                    for record in chunk {
                        out.push((record.id, single_write(&*client, entity, record, op, retry).await));
                    }
                    out
                }
                Ok(BulkOutcome::Results(results)) => {
                    capability.set(entity, op, Tri::Supported);
                    let mut out = vec![(chunk[0].id, classify(results.into_iter().next()))];
                    if chunk.len() > 1 {
                        out.extend(bulk_write(&*client, entity, &chunk[1..], op, retry).await);
                    }
                    out
                }
                Err(other) => chunk
                    .iter()
                    .map(|r| (r.id, Err(Some((ErrorCategory::Unknown, other.to_string())))))
                    .collect(),
            }
        }
    }
}

async fn bulk_write(
    client: &dyn Client,
    entity: &str,
    chunk: &[Record],
    op: BulkOp,
    retry: &RetryPolicy,
) -> Vec<(Uuid, Result<WriteOutcome, Option<(ErrorCategory, String)>>)> {
    match bulk_op_call(client, entity, chunk, op, retry).await {
        Ok(BulkOutcome::Results(results)) => chunk
            .iter()
            .zip(results)
            .map(|(r, res)| (r.id, classify(Some(res))))
            .collect(),
        Ok(BulkOutcome::NotSupported) => {
            // Capability flipped under us mid-session; fall back once for
            // this chunk rather than erroring every record.
            let mut out = Vec::new();
            for record in chunk {
                out.push((record.id, single_write(client, entity, record, op, retry).await));
            }
            out
        }
        Err(e) => chunk
            .iter()
            .map(|r| (r.id, Err(Some((ErrorCategory::Unknown, e.to_string())))))
            .collect(),
    }
}

/// Every bulk/single write goes through `retry` so a `THROTTLED` response
/// is retried with backoff instead of immediately surfaced as a per-record
/// failure — the probe-once invariant is unaffected since retries happen
/// within the same attempt, not as additional attempts.
async fn bulk_op_call(
    client: &dyn Client,
    entity: &str,
    chunk: &[Record],
    op: BulkOp,
    retry: &RetryPolicy,
) -> Result<BulkOutcome, ClientError> {
    retry
        .run(classify_retry, || async {
            match op {
                BulkOp::Create => client.upsert_multiple(entity, chunk).await,
                BulkOp::Update => client.update_multiple(entity, chunk).await,
            }
        })
        .await
}

async fn single_write(
    client: &dyn Client,
    entity: &str,
    record: &Record,
    op: BulkOp,
    retry: &RetryPolicy,
) -> Result<WriteOutcome, Option<(ErrorCategory, String)>> {
    let result = retry
        .run(classify_retry, || async {
            match op {
                BulkOp::Create => client.upsert(entity, record).await,
                BulkOp::Update => client.update(entity, record).await,
            }
        })
        .await;
    classify(Some(result))
}

/// Only `THROTTLED` gets the backoff-and-retry treatment; every other
/// `ClientError` is a single attempt, classified by [`classify`] as before.
fn classify_retry(e: &ClientError) -> RetryableError {
    match e {
        ClientError::Throttled => RetryableError::Throttled,
        _ => RetryableError::Fatal,
    }
}

fn classify(
    result: Option<Result<WriteOutcome, ClientError>>,
) -> Result<WriteOutcome, Option<(ErrorCategory, String)>> {
    match result {
        None => Err(None),
        Some(Ok(outcome)) => Ok(outcome),
        Some(Err(ClientError::DuplicateKey)) => Err(Some((ErrorCategory::DuplicateKeyM2m, "duplicate key".into()))),
        Some(Err(ClientError::BulkNotSupported)) => Err(Some((ErrorCategory::BulkNotSupported, "bulk not supported".into()))),
        Some(Err(ClientError::Throttled)) => Err(Some((ErrorCategory::Throttled, "throttled".into()))),
        Some(Err(ClientError::NotFound)) => Err(Some((ErrorCategory::ReferenceUnmapped, "record not found".into()))),
        Some(Err(ClientError::Fatal(msg))) => Err(Some((ErrorCategory::Unknown, msg))),
        Some(Err(ClientError::Other(msg))) => Err(Some((ErrorCategory::Unknown, msg))),
    }
}

async fn import_associations(
    relationship: &crate::schema::model::RelationshipDescriptor,
    pairs: &[(Uuid, Uuid)],
    id_map: &IdMap,
    pool: &Arc<dyn ConnectionPool>,
    reporter: &Reporter,
    cancel: &CancellationToken,
    retry: &RetryPolicy,
) {
    if pairs.is_empty() {
        return;
    }
    let name = &relationship.intersect_entity;
    let mut by_from: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (old_from, old_to) in pairs {
        let Some(new_from) = id_map.get(&relationship.entity1, *old_from) else {
            continue;
        };
        let Some(new_to) = id_map.get(&relationship.entity2, *old_to) else {
            continue;
        };
        by_from.entry(new_from).or_default().push(new_to);
    }

    let mut done = 0u64;
    let total = pairs.len() as u64;
    for (from, to) in by_from {
        let Ok(client) = pool.acquire(cancel).await else {
            continue;
        };
        let outcome = retry
            .run(classify_retry, || client.associate(relationship, from, &to))
            .await;
        match outcome {
            Ok(()) => {}
            Err(ClientError::Other(msg)) if msg.to_ascii_lowercase().contains("duplicate key") => {
                // Idempotent: duplicate-key is success.
            }
            Err(_) => {}
        }
        done += to.len() as u64;
        reporter.relationship_progress(name, done, Some(total));
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_deferred_pass(
    pending: &[PendingUpdate],
    schema: &Schema,
    writable_fields: &HashMap<String, HashSet<String>>,
    pool: Arc<dyn ConnectionPool>,
    id_map: &IdMap,
    capability: &BulkCapabilityCache,
    report: &ReportBuilder,
    options: &crate::session::MigrationOptions,
    cancel: &CancellationToken,
    retry: &RetryPolicy,
) {
    let mut by_entity: HashMap<String, Vec<&PendingUpdate>> = HashMap::new();
    for p in pending {
        by_entity.entry(p.entity.clone()).or_default().push(p);
    }

    for (entity, updates) in by_entity {
        if cancel.is_cancelled() {
            break;
        }
        let _ = schema.entity(&entity);
        let _ = writable_fields.get(&entity);

        // Group by (record, field) first: a `partylist` field contributes
        // several entries (one per `list_index`) that must be rebuilt into
        // a single `Value::PartyList`, while a plain reference field has
        // exactly one entry with `list_index: None`.
        let mut groups: HashMap<(Uuid, String), Vec<(Option<usize>, crate::value::Reference)>> = HashMap::new();
        let mut new_record_ids: HashMap<Uuid, Uuid> = HashMap::new();
        for update in &updates {
            let Some(new_id) = id_map.get(&entity, update.record_id) else {
                continue;
            };
            new_record_ids.insert(update.record_id, new_id);

            let Some(new_target) = id_map.get(&update.target_entity, update.target_old_id) else {
                report.record_error(
                    &entity,
                    update.record_id,
                    Some(update.field.clone()),
                    ErrorCategory::ReferenceUnmapped,
                    format!("{}/{} never mapped", update.target_entity, update.target_old_id),
                );
                continue;
            };
            groups
                .entry((update.record_id, update.field.clone()))
                .or_default()
                .push((
                    update.list_index,
                    crate::value::Reference::new(update.target_entity.as_str(), new_target),
                ));
        }

        let mut by_record: HashMap<Uuid, Record> = HashMap::new();
        for ((old_record_id, field), mut entries) in groups {
            let Some(&new_id) = new_record_ids.get(&old_record_id) else {
                continue;
            };
            let record = by_record.entry(old_record_id).or_insert_with(|| Record::new(new_id));
            let is_party_list = entries.iter().any(|(idx, _)| idx.is_some());
            if is_party_list {
                entries.sort_by_key(|(idx, _)| idx.unwrap_or(usize::MAX));
                let list: Vec<crate::value::Reference> = entries.into_iter().map(|(_, r)| r).collect();
                record.fields.insert(field, Value::PartyList(list));
            } else if let Some((_, reference)) = entries.into_iter().next() {
                record.fields.insert(field, Value::Reference(reference));
            }
        }

        let records: Vec<Record> = by_record.into_values().collect();
        for chunk in records.chunks(options.batch_size) {
            if cancel.is_cancelled() {
                break;
            }
            let outcomes =
                write_batch_with_probe(&pool, &entity, capability, BulkOp::Update, chunk, cancel, retry).await;
            for (old_id, result) in outcomes {
                match result {
                    Ok(outcome) => report.record_updated(&entity, outcome.new_id),
                    Err(Some((category, message))) if !category.is_suppressed() => {
                        report.record_error(&entity, old_id, None, category, message);
                    }
                    _ => {}
                }
            }
        }
    }
}
