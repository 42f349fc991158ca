//! Options and session plumbing. Replaces the source's
//! process-wide defaults for serialization options, correlation ids, and
//! logger context with an explicit value threaded through export/import.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::MigrationError;
use crate::pool::resilience::ResilienceConfig;

/// How the tiered importer reconciles existing target records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    Upsert,
    CreateOnly,
    UpdateOnly,
}

impl Default for ImportMode {
    fn default() -> Self {
        ImportMode::Upsert
    }
}

/// Tunable knobs for a migration run. Loaded from an optional TOML file
/// plus CLI overrides by [`crate::config`]; every field has the default
/// named in the component design.
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    /// Records per `UpsertMultiple`/`UpdateMultiple` batch attempt.
    pub batch_size: usize,
    /// Records requested per export page.
    pub page_size: u32,
    /// Cap on concurrently-writing entities within one tier, independent
    /// of the pool's own DOP.
    pub max_parallel_entities: usize,
    pub mode: ImportMode,
    pub dop: usize,
    pub resilience: ResilienceConfig,
    /// Resolved off by default: include successful
    /// record ids in the error report.
    pub verbose_report: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        let dop = ResilienceConfig::default().concurrency.dop;
        Self {
            batch_size: 200,
            page_size: 5000,
            max_parallel_entities: dop,
            mode: ImportMode::default(),
            dop,
            resilience: ResilienceConfig::default(),
            verbose_report: false,
        }
    }
}

impl MigrationOptions {
    /// Validates the bounds called out in the component design
    /// (`1 <= page_size <= 5000`, the rest simply non-zero).
    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.page_size < 1 || self.page_size > 5000 {
            return Err(MigrationError::SchemaInvalid(format!(
                "page_size must be in 1..=5000, got {}",
                self.page_size
            )));
        }
        if self.batch_size == 0 {
            return Err(MigrationError::SchemaInvalid(
                "batch_size must be >= 1".into(),
            ));
        }
        if self.max_parallel_entities == 0 {
            return Err(MigrationError::SchemaInvalid(
                "max_parallel_entities must be >= 1".into(),
            ));
        }
        if self.dop == 0 {
            return Err(MigrationError::SchemaInvalid("dop must be >= 1".into()));
        }
        Ok(())
    }
}

/// Correlation id, resolved options, and version strings threaded through
/// both export and import rather than kept as process-wide statics.
#[derive(Debug, Clone)]
pub struct ImportSession {
    pub correlation_id: Uuid,
    pub options: MigrationOptions,
    pub started_at: DateTime<Utc>,
    pub cli_version: String,
    pub sdk_version: String,
    pub runtime: String,
    pub platform: String,
}

impl ImportSession {
    pub fn new(options: MigrationOptions, started_at: DateTime<Utc>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            options,
            started_at,
            cli_version: env!("CARGO_PKG_VERSION").to_string(),
            sdk_version: "n/a".to_string(),
            runtime: format!("rustc/{}", rustc_marker()),
            platform: std::env::consts::OS.to_string(),
        }
    }

    /// A cheap clone for handing an owned copy to the report builder,
    /// which outlives the session value driving the import loop.
    pub fn clone_for_report(&self) -> Self {
        self.clone()
    }
}

fn rustc_marker() -> &'static str {
    "stable"
}

/// The user-mapping contract: owner fields are remapped through
/// `map`, falling back to `owner_fallback` (or being left unmapped, for
/// the caller to decide) when the source user id isn't present. Producing
/// this map is an external generator's job — this is just the consumer
/// side.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMap {
    pub owner_fallback: Option<Uuid>,
    pub map: HashMap<Uuid, Uuid>,
}

impl UserMap {
    pub fn resolve(&self, source_user_id: Uuid) -> Option<Uuid> {
        self.map.get(&source_user_id).copied().or(self.owner_fallback)
    }
}

/// Backoff schedule used by the throttling retry path (`THROTTLED`),
/// derived from [`MigrationOptions::resilience`].
pub fn retry_policy(options: &MigrationOptions) -> crate::pool::resilience::RetryPolicy {
    crate::pool::resilience::RetryPolicy::new(options.resilience.retry.clone())
}

pub fn default_operation_timeout() -> Duration {
    Duration::from_secs(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_documented_defaults() {
        let options = MigrationOptions::default();
        assert_eq!(options.batch_size, 200);
        assert_eq!(options.page_size, 5000);
        assert_eq!(options.mode, ImportMode::Upsert);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn page_size_out_of_bounds_is_rejected() {
        let mut options = MigrationOptions::default();
        options.page_size = 5001;
        assert!(options.validate().is_err());
        options.page_size = 0;
        assert!(options.validate().is_err());
    }

    #[test]
    fn user_map_falls_back_to_owner_fallback() {
        let fallback = Uuid::new_v4();
        let known_user = Uuid::new_v4();
        let known_target = Uuid::new_v4();
        let mut map = HashMap::new();
        map.insert(known_user, known_target);
        let user_map = UserMap {
            owner_fallback: Some(fallback),
            map,
        };
        assert_eq!(user_map.resolve(known_user), Some(known_target));
        assert_eq!(user_map.resolve(Uuid::new_v4()), Some(fallback));
    }
}
