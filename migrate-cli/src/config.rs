//! Loads [`MigrationOptions`] from an optional TOML file, then applies the
//! engine's own defaults for anything the file doesn't set. CLI flags sit
//! above this layer and overwrite whatever the file produced.

use std::path::Path;

use serde::Deserialize;

use crate::error::MigrationError;
use crate::session::{ImportMode, MigrationOptions};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct FileOptions {
    batch_size: Option<usize>,
    page_size: Option<u32>,
    max_parallel_entities: Option<usize>,
    mode: Option<ImportMode>,
    dop: Option<usize>,
    verbose_report: Option<bool>,
}

/// Load options from `path`, falling back to [`MigrationOptions::default`]
/// for any field the file omits. `path` of `None` returns the defaults
/// untouched.
pub fn load_options(path: Option<&Path>) -> Result<MigrationOptions, MigrationError> {
    let mut options = MigrationOptions::default();
    let Some(path) = path else {
        options.validate()?;
        return Ok(options);
    };

    let text = std::fs::read_to_string(path).map_err(|e| {
        MigrationError::SchemaInvalid(format!("cannot read options file {path:?}: {e}"))
    })?;
    let file: FileOptions = toml::from_str(&text).map_err(|e| {
        MigrationError::SchemaInvalid(format!("invalid options file {path:?}: {e}"))
    })?;

    if let Some(v) = file.batch_size {
        options.batch_size = v;
    }
    if let Some(v) = file.page_size {
        options.page_size = v;
    }
    if let Some(v) = file.max_parallel_entities {
        options.max_parallel_entities = v;
    }
    if let Some(v) = file.mode {
        options.mode = v;
    }
    if let Some(v) = file.dop {
        options.dop = v;
    }
    if let Some(v) = file.verbose_report {
        options.verbose_report = v;
    }

    options.validate()?;
    Ok(options)
}

/// The per-user config directory's default options file, if the platform
/// has one and it exists. Neither having no home directory nor a missing
/// file is an error — callers just fall back to defaults.
pub fn default_options_path() -> Option<std::path::PathBuf> {
    let path = dirs::config_dir()?.join("migrate").join("options.toml");
    path.exists().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_yields_defaults() {
        let options = load_options(None).unwrap();
        assert_eq!(options.batch_size, 200);
        assert_eq!(options.mode, ImportMode::Upsert);
    }

    #[test]
    fn file_overrides_only_set_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.toml");
        std::fs::write(&path, "batch-size = 50\nmode = \"createonly\"\n").unwrap();

        let options = load_options(Some(&path)).unwrap();
        assert_eq!(options.batch_size, 50);
        assert_eq!(options.mode, ImportMode::CreateOnly);
        assert_eq!(options.page_size, 5000);
    }

    #[test]
    fn out_of_bounds_file_value_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.toml");
        std::fs::write(&path, "page-size = 0\n").unwrap();
        assert!(load_options(Some(&path)).is_err());
    }
}
