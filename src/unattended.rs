//! Unattended-upgrade supervision
//!
//! Runs the target's unattended-upgrade tool once, right after install,
//! so the first boot starts from a patched system. The subprocess is the
//! only piece of the engine that runs concurrently with anything else and
//! the only one that is independently cancellable mid-flight.
//!
//! # Failure Policy
//!
//! **NON-FATAL**: a failed upgrade run is logged (with the subprocess
//! streams) and annotated, but never fails the install; the target is
//! complete and bootable without it.
//!
//! # Cancellation
//!
//! `cancel` asks the tool to stop via its own shutdown-only interface
//! inside the target; the supervisor only terminates the subprocess
//! itself in simulated (dry-run) mode. The session field is cleared under
//! the same lock `cancel` takes, so a cancel can never race the cleanup.

use crate::curtin::{CommandRunner, CurtinCommand};
use crate::error::Result;
use crate::process_guard;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use strum::{Display, EnumString};

/// Which origins the unattended-upgrade run may pull from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UpdatePolicy {
    /// Security pockets only.
    Security,
    /// Security plus regular updates.
    All,
}

/// How an unattended-upgrade run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// The run completed and applied its updates.
    Applied,
    /// The run failed; logged and annotated, the install continues.
    Failed,
    /// The run was cancelled on request. An expected outcome, not a
    /// failure.
    Cancelled,
}

/// Shared preamble: never fail the run over battery power, skip metered
/// connections.
const UU_APT_CONF: &str = "\
# Config for the unattended-upgrades run to avoid failing on battery power or
# a metered connection.
Unattended-Upgrade::OnlyOnACPower \"false\";
Unattended-Upgrade::Skip-Updates-On-Metered-Connections \"true\";
";

const UU_APT_CONF_UPDATE_SECURITY: &str = "\
# A copy of the current default unattended-upgrades config to grab
# security.
Unattended-Upgrade::Allowed-Origins {
        \"${distro_id}:${distro_codename}\";
        \"${distro_id}:${distro_codename}-security\";
        \"${distro_id}ESMApps:${distro_codename}-apps-security\";
        \"${distro_id}ESM:${distro_codename}-infra-security\";
};
";

const UU_APT_CONF_UPDATE_ALL: &str = "\
# A modified version of the unattended-upgrades default Allowed-Origins
# to include updates in the permitted origins.
Unattended-Upgrade::Allowed-Origins {
        \"${distro_id}:${distro_codename}\";
        \"${distro_id}:${distro_codename}-updates\";
        \"${distro_id}:${distro_codename}-security\";
        \"${distro_id}ESMApps:${distro_codename}-apps-security\";
        \"${distro_id}ESM:${distro_codename}-infra-security\";
};
";

/// The apt configuration fragment for `policy`.
pub fn apt_conf_contents(policy: UpdatePolicy) -> String {
    let mut contents = String::from(UU_APT_CONF);
    contents.push_str(match policy {
        UpdatePolicy::All => UU_APT_CONF_UPDATE_ALL,
        UpdatePolicy::Security => UU_APT_CONF_UPDATE_SECURITY,
    });
    contents
}

/// Exists only while an unattended-upgrade subprocess is active.
struct UpgradeSession {
    pid: Option<u32>,
    cancel_requested: bool,
}

/// Starts and cancels the unattended-upgrade subprocess.
pub struct UpgradeSupervisor {
    runner: Arc<dyn CommandRunner>,
    target: PathBuf,
    dry_run: bool,
    session: Mutex<Option<UpgradeSession>>,
}

impl UpgradeSupervisor {
    pub fn new(runner: Arc<dyn CommandRunner>, target: PathBuf, dry_run: bool) -> Self {
        Self {
            runner,
            target,
            dry_run,
            session: Mutex::new(None),
        }
    }

    /// Whether an unattended-upgrade subprocess is currently active.
    pub fn is_running(&self) -> bool {
        self.session.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Write the apt policy fragment, run unattended-upgrades in the
    /// target, and await its completion.
    pub fn start(&self, policy: UpdatePolicy) -> Result<UpgradeOutcome> {
        let aptdir = if self.dry_run {
            self.target.join("tmp")
        } else {
            self.target.join("etc/apt/apt.conf.d")
        };
        fs::create_dir_all(&aptdir)?;
        fs::write(
            aptdir.join("zzzz-temp-installer-unattended-upgrade"),
            apt_conf_contents(policy),
        )?;

        tracing::info!("downloading and installing {} updates", policy);
        let argv = CurtinCommand::InTarget {
            target: self.target.clone(),
            args: vec!["unattended-upgrades".to_string(), "-v".to_string()],
        }
        .to_argv();
        let mut command = self.runner.start(&argv)?;

        if let Ok(mut session) = self.session.lock() {
            *session = Some(UpgradeSession {
                pid: command.pid(),
                cancel_requested: false,
            });
        }

        let outcome = command.wait();

        // Clearing the session takes the same lock cancel() holds while it
        // issues the graceful shutdown, so the two cannot interleave.
        let cancel_requested = match self.session.lock() {
            Ok(mut session) => session.take().is_some_and(|s| s.cancel_requested),
            Err(_) => false,
        };

        let outcome = outcome?;
        if cancel_requested {
            tracing::info!("unattended upgrades cancelled");
            Ok(UpgradeOutcome::Cancelled)
        } else if outcome.success() {
            Ok(UpgradeOutcome::Applied)
        } else {
            tracing::error!(
                "FAILED to apply {} updates (exit code {})\nstdout:\n{}\nstderr:\n{}",
                policy,
                outcome.code,
                outcome.stdout.trim_end(),
                outcome.stderr.trim_end(),
            );
            Ok(UpgradeOutcome::Failed)
        }
    }

    /// Request a graceful stop of a running upgrade.
    ///
    /// Goes through the upgrade tool's own shutdown-only mode inside the
    /// target; the subprocess itself is only terminated in simulated mode.
    /// A no-op when no upgrade is running.
    pub fn cancel(&self) -> Result<()> {
        let Ok(mut session) = self.session.lock() else {
            return Ok(());
        };
        let Some(active) = session.as_mut() else {
            tracing::debug!("no unattended upgrade to cancel");
            return Ok(());
        };
        active.cancel_requested = true;

        tracing::info!("cancelling update");
        self.runner.run(&[
            "chroot".to_string(),
            self.target.display().to_string(),
            "/usr/share/unattended-upgrades/unattended-upgrade-shutdown".to_string(),
            "--stop-only".to_string(),
        ])?;

        if self.dry_run {
            if let Some(pid) = active.pid {
                process_guard::terminate_group(pid);
            }
        }
        Ok(())
    }
}
