//! Install step sequencing
//!
//! Decides which steps run, in which order, with which config. The
//! branch between target variants happens exactly once, when the plan is
//! built: the plan is an ordered list of tagged actions consumed
//! linearly, so conditional logic never leaks into execution.
//!
//! # Ordering
//!
//! Steps are strictly sequential; no action starts before its
//! predecessor's tool invocation has returned successfully. Later steps
//! render their configs at dispatch time because they depend on side
//! effects of earlier steps (most importantly the device map a
//! partitioning step produces).
//!
//! # Target variants
//!
//! - **Core-boot-classic** needs partition → (encrypt) → format ordering,
//!   because TPM-backed encryption must happen between partition creation
//!   and filesystem formatting.
//! - **Classic** instead bootstraps OEM meta-packages iteratively: each
//!   package ships its own apt source, which must be discovered before
//!   the package can be upgraded from it.

use crate::curtin::{CommandRunner, CurtinCommand};
use crate::error::Result;
use crate::model::{ActionRenderMode, AptConfigurer, FilesystemModel, Mounter};
use crate::package::PackageInstaller;
use crate::step_config::{StepConfigBuilder, merge_config};
use crate::step_runner::StepRunner;
use serde_json::{Value, json};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

// ============================================================================
// Plan model
// ============================================================================

/// How a curtin step's config override is rendered at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    /// No override: the shared base config alone.
    Empty,
    /// Filesystem render in the given mode, optionally asking the tool to
    /// write a device map under the log directory.
    Filesystem {
        mode: ActionRenderMode,
        device_map: Option<&'static str>,
    },
    /// Full model render for a generic step.
    Generic,
    /// Generic render plus the fstab-editing swap commands.
    Swap,
}

/// One curtin install step, created at plan-build time and discarded
/// after execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSpec {
    pub name: &'static str,
    pub stages: Vec<String>,
    pub config: ConfigKind,
    pub with_source: bool,
}

/// One entry of the install plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanAction {
    /// Run a curtin install step.
    CurtinStep(StepSpec),
    /// Set up TPM-backed encryption (between partitioning and formatting).
    SetupEncryption,
    /// Write the core-boot /boot/grub bind mount into the target fstab.
    CreateFstab,
    /// Model-specific finalize hook.
    FinishInstall,
    /// Mount/prepare the chroot target via the apt subsystem.
    SetupTarget,
    /// Install every OEM meta-package into the target.
    InstallOemPackages,
    /// Refresh apt metadata scoped to each OEM package's own source list.
    UpdateOemSources,
    /// Populate the reset/recovery partition from the install medium.
    PopulateRecovery { device: PathBuf },
}

fn step(name: &'static str, stages: &[&str], config: ConfigKind, with_source: bool) -> PlanAction {
    PlanAction::CurtinStep(StepSpec {
        name,
        stages: stages.iter().map(|s| s.to_string()).collect(),
        config,
        with_source,
    })
}

// ============================================================================
// Sequencer
// ============================================================================

/// Builds and executes the per-run install plan.
pub struct InstallSequencer {
    runner: Arc<dyn CommandRunner>,
    fs_model: Arc<dyn FilesystemModel>,
    apt: Arc<dyn AptConfigurer>,
    mounter: Arc<dyn Mounter>,
    packages: Arc<PackageInstaller>,
    step_runner: StepRunner,
    config_builder: StepConfigBuilder,
    target: PathBuf,
    logs_dir: PathBuf,
    config_dir: PathBuf,
    oem_metapackages: Vec<String>,
    has_network: bool,
}

#[allow(clippy::too_many_arguments)]
impl InstallSequencer {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        fs_model: Arc<dyn FilesystemModel>,
        apt: Arc<dyn AptConfigurer>,
        mounter: Arc<dyn Mounter>,
        packages: Arc<PackageInstaller>,
        config_builder: StepConfigBuilder,
        target: PathBuf,
        logs_dir: PathBuf,
        oem_metapackages: Vec<String>,
        has_network: bool,
    ) -> Self {
        let step_runner = StepRunner::new(Arc::clone(&runner), Arc::clone(&fs_model));
        let config_dir = logs_dir.join("curtin-install");
        Self {
            runner,
            fs_model,
            apt,
            mounter,
            packages,
            step_runner,
            config_builder,
            target,
            logs_dir,
            config_dir,
            oem_metapackages,
            has_network,
        }
    }

    /// Build the ordered plan for this run. Branches exactly once on the
    /// target variant.
    pub fn plan(&self) -> Vec<PlanAction> {
        let mut plan = vec![step("initial", &[], ConfigKind::Empty, false)];

        if self.fs_model.is_core_boot_classic() {
            plan.push(step(
                "partitioning",
                &["partitioning"],
                ConfigKind::Filesystem {
                    mode: ActionRenderMode::Devices,
                    device_map: Some("device-map-partition.json"),
                },
                false,
            ));
            if self.fs_model.use_tpm() {
                plan.push(PlanAction::SetupEncryption);
            }
            plan.push(step(
                "formatting",
                &["partitioning"],
                ConfigKind::Filesystem {
                    mode: ActionRenderMode::FormatMount,
                    device_map: Some("device-map-format.json"),
                },
                false,
            ));
            plan.push(step("extract", &["extract"], ConfigKind::Generic, true));
            plan.push(PlanAction::CreateFstab);
            plan.push(step("swap", &["swap"], ConfigKind::Swap, false));
            plan.push(PlanAction::FinishInstall);
            plan.push(PlanAction::SetupTarget);
        } else {
            plan.push(step(
                "partitioning",
                &["partitioning"],
                ConfigKind::Filesystem {
                    mode: ActionRenderMode::Default,
                    device_map: Some("device-map.json"),
                },
                false,
            ));
            plan.push(step("extract", &["extract"], ConfigKind::Generic, true));
            plan.push(PlanAction::SetupTarget);
            if !self.oem_metapackages.is_empty() {
                plan.push(PlanAction::InstallOemPackages);
                if self.has_network {
                    // Discover each package's own archive, then upgrade to
                    // the version it carries.
                    plan.push(PlanAction::UpdateOemSources);
                    plan.push(PlanAction::InstallOemPackages);
                }
            }
            plan.push(step("curthooks", &["curthooks"], ConfigKind::Generic, false));
        }

        if let Some(device) = self.fs_model.reset_partition() {
            plan.push(PlanAction::PopulateRecovery { device });
        }

        plan
    }

    /// Execute the plan for this run against `source`.
    pub fn run(&self, source: &str) -> Result<()> {
        for action in self.plan() {
            self.execute(&action, source)?;
        }
        Ok(())
    }

    fn execute(&self, action: &PlanAction, source: &str) -> Result<()> {
        match action {
            PlanAction::CurtinStep(spec) => {
                let overrides = self.render_overrides(spec.config);
                let source = spec.with_source.then_some(source);
                self.run_curtin_step(spec.name, &spec.stages, &overrides, source)
            }
            PlanAction::SetupEncryption => self.fs_model.setup_encryption(),
            PlanAction::CreateFstab => self.create_core_boot_classic_fstab(),
            PlanAction::FinishInstall => self.fs_model.finish_install(),
            PlanAction::SetupTarget => self.apt.setup_target(&self.target),
            PlanAction::InstallOemPackages => {
                for package in &self.oem_metapackages {
                    self.packages.install_package(package)?;
                }
                Ok(())
            }
            PlanAction::UpdateOemSources => self.update_oem_sources(),
            PlanAction::PopulateRecovery { device } => self.populate_recovery(device),
        }
    }

    /// Render a step's config override at dispatch time.
    fn render_overrides(&self, kind: ConfigKind) -> Value {
        match kind {
            ConfigKind::Empty => json!({}),
            ConfigKind::Filesystem { mode, device_map } => {
                let mut cfg = self.fs_model.render(mode);
                if let Some(name) = device_map {
                    let path = self.logs_dir.join(name).display().to_string();
                    merge_config(&mut cfg, &json!({"storage": {"device_map_path": path}}));
                }
                cfg
            }
            ConfigKind::Generic => self.fs_model.render(ActionRenderMode::Default),
            ConfigKind::Swap => {
                let mut cfg = self.fs_model.render(ActionRenderMode::Default);
                let fstab = self.target.join("etc/fstab").display().to_string();
                merge_config(
                    &mut cfg,
                    &json!({"swap_commands": {"subflow": ["curtin", "swap", "--fstab", fstab]}}),
                );
                cfg
            }
        }
    }

    fn run_curtin_step(
        &self,
        name: &str,
        stages: &[String],
        overrides: &Value,
        source: Option<&str>,
    ) -> Result<()> {
        let config = self.config_builder.merged(overrides);
        let filename = format!("subflow-{}.conf", name.replace(' ', "-"));
        self.step_runner
            .run_step(name, stages, &self.config_dir.join(filename), source, &config)
    }

    /// /boot/grub on a core-boot-classic target is a bind mount of the
    /// boot partition's grub directory.
    fn create_core_boot_classic_fstab(&self) -> Result<()> {
        tracing::info!("creating fstab");
        let etc = self.target.join("etc");
        fs::create_dir_all(&etc)?;
        fs::write(
            etc.join("fstab"),
            "/run/mnt/ubuntu-boot/EFI/ubuntu /boot/grub none bind\n",
        )?;
        Ok(())
    }

    /// Run apt-get update scoped to each OEM package's own source list.
    fn update_oem_sources(&self) -> Result<()> {
        for package in &self.oem_metapackages {
            let source_list = format!("/etc/apt/sources.list.d/{}.list", package);
            let argv = CurtinCommand::InTarget {
                target: self.target.clone(),
                args: vec![
                    "apt-get".to_string(),
                    "update".to_string(),
                    "-o".to_string(),
                    format!("Dir::Etc::SourceList={}", source_list),
                    "-o".to_string(),
                    "Dir::Etc::SourceParts=/dev/null".to_string(),
                    "--no-list-cleanup".to_string(),
                ],
            }
            .to_argv();
            self.runner.run(&argv)?;
        }
        Ok(())
    }

    /// Populate the recovery partition from the install medium, inside a
    /// scoped mount that unmounts on every exit path.
    fn populate_recovery(&self, device: &std::path::Path) -> Result<()> {
        self.mounter.with_mounted(device, &mut |mountpoint| {
            let overrides = json!({
                "install": {
                    "target": mountpoint.display().to_string(),
                    "resume_data": null,
                    "extra_rsync_args": ["--no-links"],
                }
            });
            self.run_curtin_step(
                "populate recovery",
                &["extract".to_string()],
                &overrides,
                Some("cp:///cdrom"),
            )
        })
    }
}
