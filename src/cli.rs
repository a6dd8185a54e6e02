use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// subflow - installation orchestration engine
#[derive(Parser)]
#[command(name = "subflow")]
#[command(about = "Drives an unattended curtin install sequence against a target root")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate an install profile
    Validate {
        /// Path to the install profile to validate
        profile: PathBuf,
    },
    /// Rehearse the full install sequence in dry-run mode.
    ///
    /// Runs the complete state machine and step plan with simulated
    /// collaborators: no command touches the system, but every step
    /// config, log marker, and state transition is produced for real.
    Rehearse {
        /// Path to the install profile
        #[arg(short, long)]
        profile: PathBuf,

        /// Output directory for logs and per-step configs
        #[arg(short, long, default_value = "./subflow-rehearsal")]
        output: PathBuf,

        /// Rehearse the core-boot-classic step ordering
        #[arg(long)]
        core_boot: bool,

        /// Include TPM-backed encryption setup (core-boot only)
        #[arg(long)]
        tpm: bool,

        /// Simulate a reset/recovery partition
        #[arg(long)]
        recovery: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
