//! Single install-step execution
//!
//! One named step = one config document on disk + one invocation of the
//! external tool with a stage list. The runner also forwards the device
//! map a partitioning step produces back into the filesystem model, so
//! later steps can render configs against the concrete devices.
//!
//! Retrying is a policy decision of specific callers (package download),
//! never of the step runner: a tool failure here propagates as a step
//! failure.

use crate::curtin::{CommandRunner, CurtinCommand};
use crate::error::{InstallError, Result};
use crate::model::{DeviceMap, FilesystemModel};
use crate::step_config::write_config;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Executes one named install step.
pub struct StepRunner {
    runner: Arc<dyn CommandRunner>,
    fs_model: Arc<dyn FilesystemModel>,
}

impl StepRunner {
    pub fn new(runner: Arc<dyn CommandRunner>, fs_model: Arc<dyn FilesystemModel>) -> Self {
        Self { runner, fs_model }
    }

    /// Run one install step: write its config, mark the shared log,
    /// invoke the tool, and absorb any device map it produced.
    pub fn run_step(
        &self,
        name: &str,
        stages: &[String],
        config_file: &Path,
        source: Option<&str>,
        config: &Value,
    ) -> Result<()> {
        tracing::info!("executing install step {}", name);

        write_config(config_file, config)?;

        if let Some(log_file) = config["install"]["log_file"].as_str() {
            append_step_marker(Path::new(log_file), name)?;
        }

        let command = CurtinCommand::Install {
            config_file: config_file.to_path_buf(),
            stages: stages.to_vec(),
            source: source.map(String::from),
        };
        self.runner
            .run(&command.to_argv())
            .map_err(|err| InstallError::step(name, err))?;

        if let Some(path) = config
            .get("storage")
            .and_then(|storage| storage.get("device_map_path"))
            .and_then(Value::as_str)
        {
            let device_map = read_device_map(Path::new(path))?;
            self.fs_model.update_devices(device_map);
        }

        Ok(())
    }
}

/// Append a marker line identifying the step in the shared tool log.
fn append_step_marker(log_file: &Path, name: &str) -> Result<()> {
    if let Some(parent) = log_file.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(log_file)?;
    writeln!(file, "\n---- [[ subflow step {} ]] ----", name)?;
    Ok(())
}

/// Read and parse the device map a partitioning step wrote.
///
/// A missing or corrupt file at a configured path is a hard failure:
/// every later step depends on the mapping, so continuing without it
/// would partition against stale devices.
fn read_device_map(path: &Path) -> Result<DeviceMap> {
    let raw = fs::read_to_string(path)
        .map_err(|err| InstallError::device_map(path, err.to_string()))?;
    serde_json::from_str(&raw).map_err(|err| InstallError::device_map(path, err.to_string()))
}
