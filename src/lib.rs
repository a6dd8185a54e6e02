//! subflow - installation orchestration engine
//!
//! Drives an unattended or semi-attended sequence of destructive,
//! order-dependent install steps (partitioning, extraction, package
//! installation, post-install configuration) against a target root
//! filesystem, delegating the actual work to the external curtin tool.

pub mod cli;
pub mod controller;
pub mod curtin;
pub mod error;
pub mod journal;
pub mod model;
pub mod package;
pub mod process_guard;
pub mod profile;
pub mod sequencer;
pub mod sizes;
pub mod state;
pub mod step_config;
pub mod step_runner;
pub mod unattended;

// Re-export main types for convenience
pub use controller::{ErrorReportKind, FailureReport, InstallControl, InstallController};
pub use curtin::{CommandOutcome, CommandRunner, CurtinCommand, RunningCommand, SystemCommandRunner};
pub use error::{InstallError, Result};
pub use journal::{LogEvent, TracebackExtractor};
pub use model::{ActionRenderMode, AptConfigurer, DeviceMap, FilesystemModel, Mounter};
pub use package::PackageInstaller;
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use profile::InstallProfile;
pub use sequencer::{InstallSequencer, PlanAction, StepSpec};
pub use sizes::{
    GuidedResizeValues, PartitionScaleFactors, calculate_guided_resize,
    calculate_suggested_install_min, get_bootfs_size, get_efi_size, scale_partitions,
    scaled_rootfs_size,
};
pub use state::{InstallState, StateTracker};
pub use unattended::{UpdatePolicy, UpgradeOutcome, UpgradeSupervisor};
