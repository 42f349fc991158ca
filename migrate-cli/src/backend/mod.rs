//! Reference backend (not part of the engine proper): a local,
//! directory-backed [`pool::Client`](crate::pool::Client) and
//! [`metadata::MetadataService`](crate::metadata::MetadataService) pair.
//!
//! The engine only specifies the connection-pool and metadata-service
//! *contracts* — wiring either one up to a live environment (authentication,
//! credential storage, the environment's actual endpoint) is deliberately
//! someone else's problem. This module exists so the shipped CLI binary has
//! a real, runnable backend to exercise export/import against: it stores
//! each entity as a JSON array of records in `{root}/{entity}.json` and
//! each M:N relationship as pairs in `{root}/{relationship}.assoc.json`.

pub mod local;

pub use local::{LocalFileClient, SchemaMetadataService};

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::MigrationError;

/// How to construct the reference local-file pool: where its data lives
/// and how much parallelism to allow.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PoolConfig {
    pub root: PathBuf,
    #[serde(default = "default_dop")]
    pub dop: usize,
}

fn default_dop() -> usize {
    8
}

impl PoolConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            MigrationError::SchemaInvalid(format!("cannot read pool config {path:?}: {e}"))
        })?;
        toml::from_str(&text).map_err(|e| {
            MigrationError::SchemaInvalid(format!("invalid pool config {path:?}: {e}"))
        })
    }
}
