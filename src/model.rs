//! Collaborator contracts for the install engine
//!
//! The engine orchestrates; it does not own the declarative filesystem
//! model, the mirror/apt subsystem, or the mount plumbing. Those live
//! behind the traits in this module so the engine can be driven against
//! the real implementations or against fakes in tests.
//!
//! # Architecture Rule
//!
//! The engine never reaches around these traits. Every piece of target
//! state it needs (rendered storage actions, encryption hooks, apt
//! configuration, scoped mounts) comes through here.

use crate::error::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A mapping from logical partition/volume identifiers to concrete device
/// paths, produced by a partitioning step and consumed by later steps.
pub type DeviceMap = HashMap<String, String>;

/// Selects which slice of the storage actions a model render produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionRenderMode {
    /// Everything: full config for a generic install step.
    Default,
    /// Only the actions that create partitions and volumes.
    Devices,
    /// Only the actions that format and mount filesystems.
    FormatMount,
}

/// Contract with the declarative filesystem/model layer.
///
/// Implementations own the storage action graph; the engine only asks for
/// rendered configuration and pushes back device maps as partitioning
/// steps produce them.
pub trait FilesystemModel: Send + Sync {
    /// Render the model as structured configuration for an install step.
    fn render(&self, mode: ActionRenderMode) -> Value;

    /// Whether the target is the core-boot-classic variant, which needs
    /// the stricter partition/encrypt/format ordering.
    fn is_core_boot_classic(&self) -> bool;

    /// Whether TPM-backed full-disk encryption was requested.
    fn use_tpm(&self) -> bool;

    /// Path of the reset/recovery partition, if the layout has one.
    fn reset_partition(&self) -> Option<PathBuf>;

    /// Absorb the device map produced by a partitioning step.
    fn update_devices(&self, device_map: DeviceMap);

    /// Set up TPM-backed encryption between partition creation and
    /// filesystem formatting (core-boot-classic only).
    fn setup_encryption(&self) -> Result<()>;

    /// Model-specific finalize hook, run after the swap step.
    fn finish_install(&self) -> Result<()>;
}

/// Contract with the mirror/apt configuration subsystem.
pub trait AptConfigurer: Send + Sync {
    /// Prepare the apt configuration used for the install and return the
    /// path the install source is served from.
    fn configure_for_install(&self) -> Result<PathBuf>;

    /// Mount/prepare the chroot target for in-target package operations.
    fn setup_target(&self, target: &Path) -> Result<()>;

    /// Restore the target's apt configuration after postinstall.
    fn deconfigure(&self, target: &Path) -> Result<()>;
}

/// Scoped mount provider.
///
/// `with_mounted` mounts `device`, runs the closure against the
/// mountpoint, and unmounts on every exit path, including when the
/// closure fails.
pub trait Mounter: Send + Sync {
    fn with_mounted(
        &self,
        device: &Path,
        f: &mut dyn FnMut(&Path) -> Result<()>,
    ) -> Result<()>;
}
