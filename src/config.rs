use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Default runtime configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config/neuro_adapters.toml";
/// Interpreter used to call cmtklib when no override is supplied.
pub const DEFAULT_PYTHON: &str = "python";
/// Working directory for tool runs when neither the CLI nor the file names one.
pub const DEFAULT_WORKING_DIR: &str = ".";

#[derive(Deserialize, Default, Debug)]
/// Runtime overrides loaded from the TOML config referenced by `main`.
pub struct RuntimeConfigFile {
    /// Adapter name to binary path, e.g. `dcm2niix = "/opt/dcm2niix/bin/dcm2niix"`.
    #[serde(default)]
    pub binaries: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub python: Option<String>,
    pub report_csv: Option<PathBuf>,
    pub report_json: Option<PathBuf>,
}

/// Final configuration used by the CLI.
#[derive(Debug)]
pub struct EffectiveConfig {
    pub binaries: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    pub python: String,
    pub report_csv: Option<PathBuf>,
    pub report_json: Option<PathBuf>,
}

impl EffectiveConfig {
    /// Returns the crate-level defaults before CLI/runtime overrides are merged.
    pub fn defaults() -> Self {
        Self {
            binaries: BTreeMap::new(),
            working_dir: PathBuf::from(DEFAULT_WORKING_DIR),
            python: DEFAULT_PYTHON.to_string(),
            report_csv: None,
            report_json: None,
        }
    }

    /// Configured binary for `adapter`, if any.
    pub fn binary_for(&self, adapter: &str) -> Option<&str> {
        self.binaries.get(adapter).map(String::as_str)
    }
}

/// Attempts to read the runtime config file.
///
/// Returns `Ok(None)` when the file is missing so defaults are preserved.
pub fn load_runtime_config(path: Option<&Path>) -> Result<Option<RuntimeConfigFile>> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(DEFAULT_CONFIG_PATH),
    };

    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read runtime config {}", path.display()))?;
    let mut parsed: RuntimeConfigFile =
        toml::from_str(&content).context("Failed to parse runtime config")?;
    parsed.binaries = parsed
        .binaries
        .into_iter()
        .filter_map(|(k, v)| sanitize_optional_string(Some(v)).map(|v| (k, v)))
        .collect();
    Ok(Some(parsed))
}

/// Trims whitespace and drops empty strings.
pub fn sanitize_optional_string(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    })
}
