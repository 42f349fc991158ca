//! Progress & Error Reporter (C11): a broadcast event stream plus the
//! append-only builder for the v1.1 error report artifact.
//!
//! Step updates need to reach more than one concurrent subscriber (a
//! human stderr sink and a JSON-lines sink can both be live at once), so
//! this uses `tokio::sync::broadcast` rather than a single-consumer
//! channel.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::ErrorCategory;
use crate::session::ImportSession;

/// A phase of the tiered import, surfaced via `PhaseChange`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    SchemaValidate,
    Plan,
    TierWrite,
    Relationships,
    DeferredFields,
    Report,
}

/// A single progress event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProgressEvent {
    Start,
    PhaseChange { phase: Phase },
    EntityProgress {
        entity: String,
        current: u64,
        total: Option<u64>,
        rec_per_sec: f64,
    },
    RelationshipProgress {
        relationship: String,
        current: u64,
        total: Option<u64>,
    },
    EntityComplete { entity: String, ok: u64, failed: u64 },
    Cancelled,
    End,
}

/// Broadcasts [`ProgressEvent`]s to any number of subscribers. Cloning is
/// cheap (it clones the sender handle); every clone shares the same
/// channel.
#[derive(Clone)]
pub struct Reporter {
    tx: broadcast::Sender<ProgressEvent>,
}

impl Reporter {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Dropped silently if nobody is subscribed — progress
    /// reporting must never fail the migration itself.
    pub fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }

    pub fn phase(&self, phase: Phase) {
        self.emit(ProgressEvent::PhaseChange { phase });
    }

    pub fn entity_progress(&self, entity: &str, current: u64, total: Option<u64>, rec_per_sec: f64) {
        self.emit(ProgressEvent::EntityProgress {
            entity: entity.to_string(),
            current,
            total,
            rec_per_sec,
        });
    }

    pub fn relationship_progress(&self, relationship: &str, current: u64, total: Option<u64>) {
        self.emit(ProgressEvent::RelationshipProgress {
            relationship: relationship.to_string(),
            current,
            total,
        });
    }

    pub fn entity_complete(&self, entity: &str, ok: u64, failed: u64) {
        self.emit(ProgressEvent::EntityComplete {
            entity: entity.to_string(),
            ok,
            failed,
        });
    }

    /// Spawn the human-readable sink onto a diagnostic channel (not
    /// standard output). Returns the task handle so callers can await it
    /// after the migration ends — dropping the `Reporter` closes the
    /// channel and the task exits.
    pub fn spawn_human_sink(&self) -> tokio::task::JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                log::info!("{}", human_line(&event));
                if matches!(event, ProgressEvent::End) {
                    break;
                }
            }
        })
    }

    /// Spawn a sink that appends one JSON object per line to `path`.
    pub fn spawn_json_sink(&self, path: impl AsRef<Path>) -> std::io::Result<tokio::task::JoinHandle<()>> {
        let file = std::fs::File::create(path)?;
        let mut writer = std::io::BufWriter::new(file);
        let mut rx = self.subscribe();
        Ok(tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    let _ = writeln!(writer, "{line}");
                    let _ = writer.flush();
                }
                if matches!(event, ProgressEvent::End) {
                    break;
                }
            }
        }))
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}

fn human_line(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::Start => "migration started".to_string(),
        ProgressEvent::PhaseChange { phase } => format!("phase: {phase:?}"),
        ProgressEvent::EntityProgress {
            entity,
            current,
            total,
            rec_per_sec,
        } => match total {
            Some(t) => format!("{entity}: {current}/{t} ({rec_per_sec:.0} rec/s)"),
            None => format!("{entity}: {current} ({rec_per_sec:.0} rec/s)"),
        },
        ProgressEvent::RelationshipProgress {
            relationship,
            current,
            total,
        } => match total {
            Some(t) => format!("  m:n {relationship}: {current}/{t}"),
            None => format!("  m:n {relationship}: {current}"),
        },
        ProgressEvent::EntityComplete { entity, ok, failed } => {
            format!("{entity}: done ({ok} ok, {failed} failed)")
        }
        ProgressEvent::Cancelled => "migration cancelled".to_string(),
        ProgressEvent::End => "migration finished".to_string(),
    }
}

// ---------------------------------------------------------------------
// Error report (v1.1)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub cli_version: String,
    pub sdk_version: String,
    pub runtime: String,
    pub platform: String,
    pub import_mode: String,
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordError {
    pub record_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub category: ErrorCategory,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntitySummary {
    pub entity: String,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub errors: Vec<RecordError>,
    /// Present only when `verbose_report` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successful_record_ids: Option<Vec<Uuid>>,
    /// Fields stripped during SchemaValidate because the target doesn't
    /// know them.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stripped_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub version: String,
    pub execution_context: ExecutionContext,
    pub entities: Vec<EntitySummary>,
}

/// Append-only accumulator for the error report. Every worker can append
/// concurrently; only `finish()` (called at the single-threaded phase
/// boundary) walks the whole thing into the final document.
pub struct ReportBuilder {
    session: ImportSession,
    mode_label: String,
    entities: Mutex<BTreeMap<String, EntitySummary>>,
}

impl ReportBuilder {
    pub fn new(session: ImportSession) -> Self {
        let mode_label = format!("{:?}", session.options.mode);
        Self {
            session,
            mode_label,
            entities: Mutex::new(BTreeMap::new()),
        }
    }

    fn with_entity<F: FnOnce(&mut EntitySummary)>(&self, entity: &str, f: F) {
        let mut map = self.entities.lock().unwrap();
        let summary = map.entry(entity.to_string()).or_insert_with(|| EntitySummary {
            entity: entity.to_string(),
            ..Default::default()
        });
        f(summary);
    }

    pub fn record_created(&self, entity: &str, id: Uuid) {
        self.with_entity(entity, |s| {
            s.created += 1;
            if let Some(ids) = s.successful_record_ids.as_mut() {
                ids.push(id);
            }
        });
    }

    pub fn record_updated(&self, entity: &str, id: Uuid) {
        self.with_entity(entity, |s| {
            s.updated += 1;
            if let Some(ids) = s.successful_record_ids.as_mut() {
                ids.push(id);
            }
        });
    }

    pub fn record_skipped(&self, entity: &str, count: u64) {
        self.with_entity(entity, |s| s.skipped += count);
    }

    pub fn record_stripped_field(&self, entity: &str, field: &str) {
        self.with_entity(entity, |s| {
            if !s.stripped_fields.iter().any(|f| f == field) {
                s.stripped_fields.push(field.to_string());
            }
        });
    }

    /// Record a per-record failure. Suppressed categories
    /// (`BULK_NOT_SUPPORTED`, `DUPLICATE_KEY_M2M`) should not be passed
    /// here — callers check [`ErrorCategory::is_suppressed`] first and
    /// treat those as success instead.
    pub fn record_error(&self, entity: &str, record_id: Uuid, field: Option<String>, category: ErrorCategory, message: String) {
        let retryable = category.is_retryable();
        self.with_entity(entity, |s| {
            s.failed += 1;
            s.errors.push(RecordError {
                record_id,
                field,
                category,
                message,
                retryable,
            });
        });
    }

    /// Ensures `entity` registers a summary even when no records flowed
    /// through it (an entity aborted entirely in SchemaValidate still
    /// needs a zeroed line in the report).
    pub fn ensure_entity(&self, entity: &str) {
        self.with_entity(entity, |_| {});
    }

    pub fn enable_verbose(&self, entity: &str) {
        self.with_entity(entity, |s| {
            if s.successful_record_ids.is_none() {
                s.successful_record_ids = Some(Vec::new());
            }
        });
    }

    pub fn finish(self) -> ErrorReport {
        let options_json = serde_json::json!({
            "batchSize": self.session.options.batch_size,
            "pageSize": self.session.options.page_size,
            "maxParallelEntities": self.session.options.max_parallel_entities,
            "dop": self.session.options.dop,
            "verboseReport": self.session.options.verbose_report,
        });

        ErrorReport {
            version: "1.1".to_string(),
            execution_context: ExecutionContext {
                cli_version: self.session.cli_version,
                sdk_version: self.session.sdk_version,
                runtime: self.session.runtime,
                platform: self.session.platform,
                import_mode: self.mode_label,
                options: options_json,
            },
            entities: self.entities.into_inner().unwrap().into_values().collect(),
        }
    }
}

impl ErrorReport {
    pub fn write_to(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }

    pub fn total_failed(&self) -> u64 {
        self.entities.iter().map(|e| e.failed).sum()
    }

    pub fn total_created(&self) -> u64 {
        self.entities.iter().map(|e| e.created).sum()
    }

    pub fn total_updated(&self) -> u64 {
        self.entities.iter().map(|e| e.updated).sum()
    }

    pub fn total_skipped(&self) -> u64 {
        self.entities.iter().map(|e| e.skipped).sum()
    }

    /// Top-N failure categories by count, for the user-visible summary.
    pub fn top_failure_categories(&self, n: usize) -> Vec<(ErrorCategory, u64)> {
        let mut counts: BTreeMap<ErrorCategory, u64> = BTreeMap::new();
        for entity in &self.entities {
            for err in &entity.errors {
                *counts.entry(err.category).or_insert(0) += 1;
            }
        }
        let mut pairs: Vec<_> = counts.into_iter().collect();
        pairs.sort_by(|a, b| b.1.cmp(&a.1));
        pairs.truncate(n);
        pairs
    }
}
