//! Layered per-step configuration
//!
//! Every install step hands the external tool a config document built from
//! one shared base (target path, log/error-tarball paths, resume-data
//! path) deep-merged with a step-specific override. The base is built once
//! per install run; each merge works on a fresh copy, so steps stay
//! independent and replayable.

use crate::error::Result;
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};

/// Builds the configuration passed to each install step.
#[derive(Debug, Clone)]
pub struct StepConfigBuilder {
    base: Value,
}

impl StepConfigBuilder {
    /// Build the shared base configuration for one install run.
    ///
    /// Unmounting is disabled here: taking the target apart is a separate
    /// explicit step, never a side effect of an install step.
    pub fn new(target: &Path, logs_dir: &Path, resume_data_file: &Path) -> Self {
        let base = json!({
            "install": {
                "target": target.display().to_string(),
                "unmount": "disabled",
                "save_install_config": false,
                "save_install_log": false,
                "log_file": logs_dir.join("curtin-install.log").display().to_string(),
                "log_file_append": true,
                "error_tarfile": logs_dir.join("curtin-errors.tar").display().to_string(),
                "resume_data": resume_data_file.display().to_string(),
            }
        });
        Self { base }
    }

    /// The shared base configuration.
    pub fn base(&self) -> &Value {
        &self.base
    }

    /// A fresh copy of the base with `overrides` deep-merged in.
    pub fn merged(&self, overrides: &Value) -> Value {
        let mut config = self.base.clone();
        merge_config(&mut config, overrides);
        config
    }

    /// Path of the shared step log file, from the base configuration.
    pub fn log_file(&self) -> PathBuf {
        PathBuf::from(
            self.base["install"]["log_file"]
                .as_str()
                .unwrap_or_default(),
        )
    }

    /// Path of the error tarball the tool writes on failure.
    pub fn error_tarfile(&self) -> PathBuf {
        PathBuf::from(
            self.base["install"]["error_tarfile"]
                .as_str()
                .unwrap_or_default(),
        )
    }
}

/// Deep-merge `overrides` into `base`.
///
/// Nested objects merge key-by-key; any non-object value overwrites.
/// Neither input shape is validated: a malformed override is a caller
/// programming error, not a runtime failure to recover from.
pub fn merge_config(base: &mut Value, overrides: &Value) {
    match (base, overrides) {
        (Value::Object(base_map), Value::Object(override_map)) => {
            for (key, value) in override_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_config(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overrides) => {
            *base = overrides.clone();
        }
    }
}

/// Serialize a step configuration to disk, creating parent directories.
pub fn write_config(config_file: &Path, config: &Value) -> Result<()> {
    if let Some(parent) = config_file.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut rendered = serde_json::to_string_pretty(config)?;
    rendered.push('\n');
    fs::write(config_file, rendered)?;
    Ok(())
}
