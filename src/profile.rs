//! Install profile
//!
//! Everything the engine needs to know about one install run that does
//! not come from a collaborator: the target path, the OEM meta-packages
//! relevant to the hardware, network availability, the update policy for
//! the unattended-upgrade run, and extra packages to install during
//! postinstall.
//!
//! Loaded from a JSON file for headless runs, or assembled by the forms
//! layer for attended ones.

use crate::error::{InstallError, Result};
use crate::unattended::UpdatePolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn default_true() -> bool {
    true
}

fn default_policy() -> UpdatePolicy {
    UpdatePolicy::Security
}

fn default_syslog_id() -> String {
    "subflow".to_string()
}

/// Configuration for one install run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallProfile {
    /// Root filesystem the install is directed at.
    pub target: PathBuf,

    /// Auto-confirm the destructive phase instead of waiting for an
    /// explicit confirmation.
    #[serde(default)]
    pub unattended: bool,

    /// Whether a network is available (gates OEM source refresh and the
    /// unattended-upgrade run).
    #[serde(default = "default_true")]
    pub has_network: bool,

    /// OEM meta-packages relevant to the current hardware.
    #[serde(default)]
    pub oem_metapackages: Vec<String>,

    /// Extra packages installed into the target during postinstall.
    #[serde(default)]
    pub extra_packages: Vec<String>,

    /// Which origins the unattended-upgrade run may pull from.
    #[serde(default = "default_policy")]
    pub updates: UpdatePolicy,

    /// Syslog identifier the engine's log stream subscription filters on.
    #[serde(default = "default_syslog_id")]
    pub syslog_id: String,
}

impl InstallProfile {
    /// A minimal profile for `target` with defaults everywhere else.
    pub fn for_target(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            unattended: false,
            has_network: true,
            oem_metapackages: Vec::new(),
            extra_packages: Vec::new(),
            updates: UpdatePolicy::Security,
            syslog_id: default_syslog_id(),
        }
    }

    /// Load and validate a profile from a JSON file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let profile: Self = serde_json::from_str(&raw)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Validate profile invariants.
    pub fn validate(&self) -> Result<()> {
        if self.target.as_os_str().is_empty() {
            return Err(InstallError::general("profile: target must not be empty"));
        }
        if !self.target.is_absolute() {
            return Err(InstallError::general(format!(
                "profile: target {} must be an absolute path",
                self.target.display()
            )));
        }
        if self.syslog_id.is_empty() {
            return Err(InstallError::general("profile: syslog_id must not be empty"));
        }
        Ok(())
    }
}
