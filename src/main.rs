//! subflow - main entry point
//!
//! Headless front door for the install engine: profile validation and
//! full dry-run rehearsals of the install sequence. The interactive
//! forms layer drives the same [`InstallController`] API through its own
//! process.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use subflow::cli::{Cli, Commands};
use subflow::model::{ActionRenderMode, AptConfigurer, DeviceMap, FilesystemModel, Mounter};
use subflow::{
    InstallController, InstallProfile, InstallState, ProcessGuard, Result, SystemCommandRunner,
};

/// Initialize the tracing subscriber; RUST_LOG overrides the default.
fn init_logging() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn main() -> anyhow::Result<()> {
    init_logging();
    tracing::info!("subflow starting up");

    // Terminates any spawned tool processes on every exit path.
    let _guard = ProcessGuard::new();

    let cli = Cli::parse_args();
    match cli.command {
        Commands::Validate { profile } => match InstallProfile::load_from_file(&profile) {
            Ok(profile) => {
                println!("✓ profile is valid: target {}", profile.target.display());
                Ok(())
            }
            Err(err) => {
                eprintln!("✗ invalid profile: {err}");
                std::process::exit(1);
            }
        },
        Commands::Rehearse {
            profile,
            output,
            core_boot,
            tpm,
            recovery,
        } => run_rehearsal(&profile, &output, core_boot, tpm, recovery),
    }
}

// ============================================================================
// Rehearsal collaborators
// ============================================================================

/// Stand-in filesystem model with a fixed minimal storage config.
struct RehearsalModel {
    core_boot: bool,
    tpm: bool,
    recovery: Option<PathBuf>,
    devices: Mutex<DeviceMap>,
}

impl FilesystemModel for RehearsalModel {
    fn render(&self, mode: ActionRenderMode) -> serde_json::Value {
        tracing::debug!("rendering storage config ({mode:?})");
        serde_json::json!({
            "storage": { "version": 2, "config": [] }
        })
    }

    fn is_core_boot_classic(&self) -> bool {
        self.core_boot
    }

    fn use_tpm(&self) -> bool {
        self.tpm
    }

    fn reset_partition(&self) -> Option<PathBuf> {
        self.recovery.clone()
    }

    fn update_devices(&self, device_map: DeviceMap) {
        tracing::info!("absorbed device map with {} entries", device_map.len());
        if let Ok(mut devices) = self.devices.lock() {
            devices.extend(device_map);
        }
    }

    fn setup_encryption(&self) -> Result<()> {
        tracing::info!("setting up TPM-backed encryption (rehearsal)");
        Ok(())
    }

    fn finish_install(&self) -> Result<()> {
        tracing::info!("finalizing filesystem model (rehearsal)");
        Ok(())
    }
}

/// Stand-in apt configurer serving the source from the output tree.
struct RehearsalApt {
    source: PathBuf,
}

impl AptConfigurer for RehearsalApt {
    fn configure_for_install(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.source)?;
        Ok(self.source.clone())
    }

    fn setup_target(&self, target: &Path) -> Result<()> {
        tracing::info!("setting up chroot target {} (rehearsal)", target.display());
        Ok(())
    }

    fn deconfigure(&self, target: &Path) -> Result<()> {
        tracing::info!("restoring apt configuration in {} (rehearsal)", target.display());
        Ok(())
    }
}

/// Stand-in mounter backed by plain directories under the output tree.
struct RehearsalMounter {
    mounts: PathBuf,
}

impl Mounter for RehearsalMounter {
    fn with_mounted(
        &self,
        device: &Path,
        f: &mut dyn FnMut(&Path) -> Result<()>,
    ) -> Result<()> {
        let mountpoint = self.mounts.join("rp");
        std::fs::create_dir_all(&mountpoint)?;
        tracing::info!("mounted {} at {} (rehearsal)", device.display(), mountpoint.display());
        let result = f(&mountpoint);
        tracing::info!("unmounted {} (rehearsal)", mountpoint.display());
        result
    }
}

// ============================================================================
// Rehearsal driver
// ============================================================================

fn run_rehearsal(
    profile_path: &Path,
    output: &Path,
    core_boot: bool,
    tpm: bool,
    recovery: bool,
) -> anyhow::Result<()> {
    let mut profile = InstallProfile::load_from_file(profile_path)
        .with_context(|| format!("loading profile {}", profile_path.display()))?;

    std::fs::create_dir_all(output)
        .with_context(|| format!("creating output directory {}", output.display()))?;
    let output = std::fs::canonicalize(output)?;

    // Rehearsals never touch the profile's real target; everything lands
    // under the output tree.
    profile.target = output.join("target");
    tracing::info!("rehearsal target is {}", profile.target.display());

    let runner = Arc::new(SystemCommandRunner::new(true));
    let model = Arc::new(RehearsalModel {
        core_boot,
        tpm,
        recovery: recovery.then(|| PathBuf::from("/dev/disk/by-label/reset-partition")),
        devices: Mutex::new(DeviceMap::new()),
    });
    let apt = Arc::new(RehearsalApt {
        source: output.join("source"),
    });
    let mounter = Arc::new(RehearsalMounter {
        mounts: output.join("mounts"),
    });

    let unattended = profile.unattended;
    let (controller, control) = InstallController::new(
        profile,
        output.clone(),
        true,
        model,
        apt,
        mounter,
        runner,
    )?;
    let controller = Arc::new(controller);
    let states = controller.subscribe_states();

    let engine = {
        let controller = Arc::clone(&controller);
        std::thread::spawn(move || controller.run())
    };

    control.trigger_install()?;
    if !unattended {
        // Headless rehearsal: stand in for the confirmation dialog.
        control.confirm(true)?;
    }

    loop {
        match states.recv_timeout(Duration::from_secs(1)) {
            Ok(state) => {
                println!("state: {state}");
                if state == InstallState::WaitingPostinstall {
                    control.trigger_postinstall()?;
                }
                if state == InstallState::Done {
                    break;
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                if engine.is_finished() {
                    break;
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    match engine.join() {
        Ok(Ok(())) => {
            println!("✓ rehearsal complete; artifacts under {}", output.display());
            Ok(())
        }
        Ok(Err(err)) => {
            if let Some(report) = controller.failure_report() {
                eprintln!("✗ {}", report.message);
                if let Some(traceback) = report.traceback {
                    eprintln!("{traceback}");
                }
            }
            Err(err.into())
        }
        Err(_) => anyhow::bail!("engine thread panicked"),
    }
}
