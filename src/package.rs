//! Package installation with bounded retry
//!
//! Installs one package into the target through the external tool, split
//! into two phases: a download-only phase and an unpack phase.
//!
//! # Failure Policy
//!
//! Only the download phase retries: network flakiness affects fetching,
//! and nothing else. Up to 3 attempts total, sleeping `1 + attempt*3`
//! seconds between them; exhaustion propagates the last error before the
//! unpack phase is ever reached. The unpack phase runs exactly once and
//! is never retried: local unpacking is deterministic, so retrying it
//! cannot help.

use crate::curtin::{CommandRunner, CurtinCommand, SystemInstallPhase};
use crate::error::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Total download attempts per package.
const DOWNLOAD_ATTEMPTS: usize = 3;

/// Backoff before retry `attempt + 1` (zero-based attempt index).
pub fn backoff_delay(attempt: usize) -> Duration {
    Duration::from_secs(1 + attempt as u64 * 3)
}

/// Installs packages into the target with download retry.
pub struct PackageInstaller {
    runner: Arc<dyn CommandRunner>,
    target: PathBuf,
    sleeper: Box<dyn Fn(Duration) + Send + Sync>,
}

impl PackageInstaller {
    pub fn new(runner: Arc<dyn CommandRunner>, target: PathBuf) -> Self {
        Self::with_sleeper(runner, target, Box::new(std::thread::sleep))
    }

    /// Construct with a custom backoff sleeper (tests).
    pub fn with_sleeper(
        runner: Arc<dyn CommandRunner>,
        target: PathBuf,
        sleeper: Box<dyn Fn(Duration) + Send + Sync>,
    ) -> Self {
        Self {
            runner,
            target,
            sleeper,
        }
    }

    /// Attempt to download the package up to three times, then unpack it.
    pub fn install_package(&self, package: &str) -> Result<()> {
        let download = CurtinCommand::SystemInstall {
            target: self.target.clone(),
            phase: SystemInstallPhase::DownloadOnly,
            package: package.to_string(),
        }
        .to_argv();

        for attempt in 0..DOWNLOAD_ATTEMPTS {
            match self.runner.run(&download) {
                Ok(()) => break,
                Err(err) => {
                    tracing::error!("failed to download package {}: {}", package, err);
                    if attempt + 1 < DOWNLOAD_ATTEMPTS {
                        (self.sleeper)(backoff_delay(attempt));
                    } else {
                        return Err(err);
                    }
                }
            }
        }

        tracing::info!("unpacking {}", package);
        let unpack = CurtinCommand::SystemInstall {
            target: self.target.clone(),
            phase: SystemInstallPhase::AssumeDownloaded,
            package: package.to_string(),
        }
        .to_argv();
        self.runner.run(&unpack)
    }
}
