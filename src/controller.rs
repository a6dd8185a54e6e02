//! Top-level install coordination
//!
//! Owns the observable install state and drives one run end to end:
//! wait for the install trigger, loop until the destructive phase is
//! confirmed, execute the curtin sequence, suspend until postinstall
//! configuration arrives, run postinstall, report failures with whatever
//! diagnostic context the log stream yielded.
//!
//! The run executes blocking on its own thread. Suspension points
//! (install trigger, confirmation, postinstall trigger) are channel
//! receives fed through [`InstallControl`] by the forms layer or by an
//! unattended driver. The only concurrent work is the unattended-upgrade
//! subprocess, which [`InstallController::stop_unattended_upgrades`] can
//! cancel from any other thread.

use crate::curtin::{CommandRunner, CurtinCommand};
use crate::error::{InstallError, Result};
use crate::journal::{LogEvent, TracebackExtractor};
use crate::model::{AptConfigurer, FilesystemModel, Mounter};
use crate::package::PackageInstaller;
use crate::profile::InstallProfile;
use crate::sequencer::InstallSequencer;
use crate::state::{InstallState, StateTracker};
use crate::step_config::StepConfigBuilder;
use crate::unattended::{UpgradeOutcome, UpgradeSupervisor};
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

// ============================================================================
// Failure reporting
// ============================================================================

/// Category of a diagnostic report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReportKind {
    /// The install run itself failed.
    InstallFail,
    /// A network operation failed.
    NetworkFail,
    /// Anything else.
    Unknown,
}

/// Structured failure report surfaced when a run aborts.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub kind: ErrorReportKind,
    pub message: String,
    /// Traceback excerpt scanned off the log event stream, if one was
    /// observed before the failure.
    pub traceback: Option<String>,
}

// ============================================================================
// Flow control
// ============================================================================

/// Receiving side of the engine's suspension points.
struct FlowGates {
    install: Receiver<()>,
    confirm: Receiver<bool>,
    postinstall: Receiver<()>,
}

/// Handle the forms layer (or an unattended driver) uses to move the
/// engine past its suspension points.
#[derive(Clone)]
pub struct InstallControl {
    install: Sender<()>,
    confirm: Sender<bool>,
    postinstall: Sender<()>,
}

impl InstallControl {
    /// Signal that the install prerequisites are configured.
    pub fn trigger_install(&self) -> Result<()> {
        self.install
            .send(())
            .map_err(|_| InstallError::flow_interrupted("engine is gone"))
    }

    /// Answer the confirmation prompt. `false` sends the run back to
    /// waiting.
    pub fn confirm(&self, approved: bool) -> Result<()> {
        self.confirm
            .send(approved)
            .map_err(|_| InstallError::flow_interrupted("engine is gone"))
    }

    /// Signal that postinstall configuration is complete.
    pub fn trigger_postinstall(&self) -> Result<()> {
        self.postinstall
            .send(())
            .map_err(|_| InstallError::flow_interrupted("engine is gone"))
    }
}

fn flow_channels() -> (FlowGates, InstallControl) {
    let (install_tx, install_rx) = channel();
    let (confirm_tx, confirm_rx) = channel();
    let (postinstall_tx, postinstall_rx) = channel();
    (
        FlowGates {
            install: install_rx,
            confirm: confirm_rx,
            postinstall: postinstall_rx,
        },
        InstallControl {
            install: install_tx,
            confirm: confirm_tx,
            postinstall: postinstall_tx,
        },
    )
}

// ============================================================================
// Controller
// ============================================================================

/// Coordinates one install run.
pub struct InstallController {
    profile: InstallProfile,
    dry_run: bool,
    runner: Arc<dyn CommandRunner>,
    apt: Arc<dyn AptConfigurer>,
    sequencer: InstallSequencer,
    packages: Arc<PackageInstaller>,
    supervisor: UpgradeSupervisor,
    state: StateTracker,
    gates: Mutex<FlowGates>,
    tb_extractor: Arc<Mutex<TracebackExtractor>>,
    last_report: Mutex<Option<FailureReport>>,
    // Scratch dir holding the resume-data file; lives as long as the run.
    _resume_dir: tempfile::TempDir,
}

impl InstallController {
    /// Assemble a controller for one run.
    ///
    /// `root` is where the installer's log tree lives: `/` on a live
    /// system, an output directory in dry-run.
    pub fn new(
        profile: InstallProfile,
        root: PathBuf,
        dry_run: bool,
        fs_model: Arc<dyn FilesystemModel>,
        apt: Arc<dyn AptConfigurer>,
        mounter: Arc<dyn Mounter>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<(Self, InstallControl)> {
        profile.validate()?;

        let logs_dir = root.join("var/log/installer");
        let resume_dir = tempfile::tempdir()?;
        let config_builder = StepConfigBuilder::new(
            &profile.target,
            &logs_dir,
            &resume_dir.path().join("resume-data.json"),
        );

        let packages = Arc::new(PackageInstaller::new(
            Arc::clone(&runner),
            profile.target.clone(),
        ));
        let sequencer = InstallSequencer::new(
            Arc::clone(&runner),
            fs_model,
            Arc::clone(&apt),
            mounter,
            Arc::clone(&packages),
            config_builder,
            profile.target.clone(),
            logs_dir,
            profile.oem_metapackages.clone(),
            profile.has_network,
        );
        let supervisor =
            UpgradeSupervisor::new(Arc::clone(&runner), profile.target.clone(), dry_run);

        let (gates, control) = flow_channels();
        let controller = Self {
            profile,
            dry_run,
            runner,
            apt,
            sequencer,
            packages,
            supervisor,
            state: StateTracker::new(),
            gates: Mutex::new(gates),
            tb_extractor: Arc::new(Mutex::new(TracebackExtractor::new())),
            last_report: Mutex::new(None),
            _resume_dir: resume_dir,
        };
        Ok((controller, control))
    }

    /// Current observable state of the run.
    pub fn state(&self) -> InstallState {
        self.state.current()
    }

    /// Observe every state transition, in order.
    pub fn subscribe_states(&self) -> Receiver<InstallState> {
        self.state.subscribe()
    }

    /// The failure report of an aborted run, if any.
    pub fn failure_report(&self) -> Option<FailureReport> {
        self.last_report.lock().ok().and_then(|r| r.clone())
    }

    /// Subscribe the traceback scanner to the installer's log stream for
    /// the lifetime of the run.
    pub fn attach_log_stream(&self, events: Receiver<LogEvent>) -> JoinHandle<()> {
        crate::journal::subscribe(
            events,
            self.profile.syslog_id.clone(),
            Arc::clone(&self.tb_extractor),
        )
    }

    /// Drive one full install run. Blocks until the run reaches `Done`
    /// or fails; on failure a diagnostic report is recorded before the
    /// error propagates.
    pub fn run(&self) -> Result<()> {
        match self.install() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.report_failure(&err);
                Err(err)
            }
        }
    }

    fn install(&self) -> Result<()> {
        loop {
            self.state.update(InstallState::Waiting);
            self.recv_install()?;

            self.state.update(InstallState::NeedsConfirmation);
            let confirmed = if self.profile.unattended {
                true
            } else {
                self.recv_confirmation()?
            };
            if confirmed {
                break;
            }
            // Denied: back to waiting, the whole cycle repeats.
        }

        self.state.update(InstallState::Running);

        let for_install_path = self.apt.configure_for_install()?;

        if self.profile.target.exists() {
            self.unmount_target()?;
        }

        let source = format!("cp://{}", for_install_path.display());
        self.sequencer.run(&source)?;

        self.state.update(InstallState::WaitingPostinstall);
        self.recv_postinstall()?;

        self.state.update(InstallState::Running);
        self.postinstall()?;

        self.state.update(InstallState::Done);
        Ok(())
    }

    /// Final system configuration, after the destructive phase.
    fn postinstall(&self) -> Result<()> {
        for package in &self.profile.extra_packages {
            self.packages.install_package(package)?;
        }

        if self.profile.has_network {
            self.state.update(InstallState::UuRunning);
            match self.supervisor.start(self.profile.updates) {
                Ok(UpgradeOutcome::Applied) => {
                    tracing::info!("applied {} updates", self.profile.updates);
                }
                Ok(UpgradeOutcome::Cancelled) => {
                    tracing::info!("unattended upgrades cancelled, continuing");
                }
                // Failure details were already logged by the supervisor.
                Ok(UpgradeOutcome::Failed) => {}
                Err(err) => {
                    tracing::warn!("unattended upgrades did not run: {}", err);
                }
            }
        }

        self.apt.deconfigure(&self.profile.target)?;
        Ok(())
    }

    /// Whether an unattended-upgrade subprocess is currently active.
    pub fn upgrade_running(&self) -> bool {
        self.supervisor.is_running()
    }

    /// Cancel a running unattended-upgrade subprocess.
    ///
    /// Safe to call from any thread; a no-op unless the run is currently
    /// in `UuRunning`.
    pub fn stop_unattended_upgrades(&self) -> Result<()> {
        if self.state.current() == InstallState::UuRunning {
            self.state.update(InstallState::UuCancelling);
            self.supervisor.cancel()?;
        }
        Ok(())
    }

    fn unmount_target(&self) -> Result<()> {
        tracing::info!("unmounting {}", self.profile.target.display());
        let argv = CurtinCommand::Unmount {
            target: self.profile.target.clone(),
        }
        .to_argv();
        self.runner.run(&argv)?;
        if !self.dry_run {
            fs::remove_dir_all(&self.profile.target)?;
        }
        Ok(())
    }

    fn report_failure(&self, err: &InstallError) {
        let traceback = self
            .tb_extractor
            .lock()
            .ok()
            .and_then(|extractor| extractor.excerpt());
        let report = FailureReport {
            kind: ErrorReportKind::InstallFail,
            message: err.to_string(),
            traceback,
        };
        tracing::error!("install failed: {}", report.message);
        if let Ok(mut last) = self.last_report.lock() {
            *last = Some(report);
        }
    }

    fn recv_install(&self) -> Result<()> {
        let gates = self
            .gates
            .lock()
            .map_err(|_| InstallError::flow_interrupted("flow gates poisoned"))?;
        gates
            .install
            .recv()
            .map_err(|_| InstallError::flow_interrupted("install trigger channel closed"))
    }

    fn recv_confirmation(&self) -> Result<bool> {
        let gates = self
            .gates
            .lock()
            .map_err(|_| InstallError::flow_interrupted("flow gates poisoned"))?;
        gates
            .confirm
            .recv()
            .map_err(|_| InstallError::flow_interrupted("confirmation channel closed"))
    }

    fn recv_postinstall(&self) -> Result<()> {
        let gates = self
            .gates
            .lock()
            .map_err(|_| InstallError::flow_interrupted("flow gates poisoned"))?;
        gates
            .postinstall
            .recv()
            .map_err(|_| InstallError::flow_interrupted("postinstall trigger channel closed"))
    }
}
