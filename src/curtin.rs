//! External install-tool invocation
//!
//! This module is the ONLY sanctioned way to execute curtin. All tool
//! invocations go through a [`CommandRunner`] to ensure:
//!
//! - Process group isolation (an engine crash must not orphan a running
//!   partitioner)
//! - PID registration with the global [`ChildRegistry`] for cleanup
//! - Type-safe argument construction via [`CurtinCommand`]
//!
//! The trait seam also lets tests drive the sequencer, the package
//! installer, and the upgrade supervisor against recording fakes.

use crate::error::{InstallError, Result};
use crate::process_guard::{ChildRegistry, CommandProcessGroup};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

// ============================================================================
// Command construction
// ============================================================================

/// Which phase a `system-install` invocation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemInstallPhase {
    /// Fetch the package into the target's cache without unpacking.
    DownloadOnly,
    /// Unpack a previously downloaded package.
    AssumeDownloaded,
}

/// One invocation of the external install tool.
///
/// Mirrors the tool's CLI contract: a mode, a config file or target, an
/// optional source URI, and a stage list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CurtinCommand {
    /// Run install stages against a config file.
    Install {
        config_file: PathBuf,
        stages: Vec<String>,
        source: Option<String>,
    },
    /// Unmount everything below a target directory.
    Unmount { target: PathBuf },
    /// Run a command inside the target chroot.
    InTarget { target: PathBuf, args: Vec<String> },
    /// Download or unpack a single package inside the target.
    SystemInstall {
        target: PathBuf,
        phase: SystemInstallPhase,
        package: String,
    },
}

impl CurtinCommand {
    /// Build the argv for this invocation.
    pub fn to_argv(&self) -> Vec<String> {
        let mut argv = vec!["curtin".to_string()];
        match self {
            Self::Install {
                config_file,
                stages,
                source,
            } => {
                argv.push("-c".to_string());
                argv.push(config_file.display().to_string());
                argv.push("install".to_string());
                argv.push("--set".to_string());
                argv.push(format!(
                    "json:stages={}",
                    serde_json::Value::from(stages.clone())
                ));
                if let Some(source) = source {
                    argv.push(source.clone());
                }
            }
            Self::Unmount { target } => {
                argv.push("unmount".to_string());
                argv.push("-t".to_string());
                argv.push(target.display().to_string());
            }
            Self::InTarget { target, args } => {
                argv.push("in-target".to_string());
                argv.push("-t".to_string());
                argv.push(target.display().to_string());
                argv.push("--".to_string());
                argv.extend(args.iter().cloned());
            }
            Self::SystemInstall {
                target,
                phase,
                package,
            } => {
                argv.push("system-install".to_string());
                argv.push("-t".to_string());
                argv.push(target.display().to_string());
                argv.push(
                    match phase {
                        SystemInstallPhase::DownloadOnly => "--download-only",
                        SystemInstallPhase::AssumeDownloaded => "--assume-downloaded",
                    }
                    .to_string(),
                );
                argv.push("--".to_string());
                argv.push(package.clone());
            }
        }
        argv
    }
}

// ============================================================================
// Runner contract
// ============================================================================

/// Captured result of a finished external command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Exit code (-1 if terminated by signal).
    pub code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutcome {
    /// Whether the command exited zero.
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// A command started with [`CommandRunner::start`], still running.
pub trait RunningCommand: Send {
    /// Process id, when an OS process backs the command.
    fn pid(&self) -> Option<u32>;

    /// Block until the command finishes, capturing its output. A non-zero
    /// exit is reported in the outcome, not as an error; spawn-level
    /// failures (broken pipe, wait called twice) are errors.
    fn wait(&mut self) -> Result<CommandOutcome>;
}

/// Executes external commands for the engine.
///
/// `run` blocks and treats a non-zero exit as an error; `start` hands back
/// a [`RunningCommand`] so the caller can await completion while another
/// flow requests cancellation.
pub trait CommandRunner: Send + Sync {
    fn run(&self, argv: &[String]) -> Result<()>;
    fn start(&self, argv: &[String]) -> Result<Box<dyn RunningCommand>>;
}

// ============================================================================
// System runner
// ============================================================================

/// Runs commands against the live system, or simulates them in dry-run.
pub struct SystemCommandRunner {
    dry_run: bool,
}

impl SystemCommandRunner {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    fn spawn(&self, argv: &[String]) -> Result<Child> {
        let program = &argv[0];
        let child = Command::new(program)
            .args(&argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .in_new_process_group()
            .spawn()
            .map_err(InstallError::Io)?;

        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.register(child.id());
        }
        Ok(child)
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, argv: &[String]) -> Result<()> {
        tracing::info!("running: {}", argv.join(" "));
        if self.dry_run {
            simulate_install_side_effects(argv)?;
            tracing::info!("dry-run: skipped");
            return Ok(());
        }

        if argv.is_empty() {
            return Err(InstallError::general("empty command line"));
        }

        let child = self.spawn(argv)?;
        let pid = child.id();
        let output = child.wait_with_output();
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.unregister(pid);
        }
        let output = output.map_err(InstallError::Io)?;

        if output.status.success() {
            Ok(())
        } else {
            Err(InstallError::command(
                argv[0].clone(),
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    fn start(&self, argv: &[String]) -> Result<Box<dyn RunningCommand>> {
        tracing::info!("starting: {}", argv.join(" "));
        if self.dry_run {
            // Simulated long-running command, so the cancellation path has
            // a real process group to terminate.
            let argv = vec!["sh".to_string(), "-c".to_string(), "sleep 2".to_string()];
            let child = self.spawn(&argv)?;
            return Ok(Box::new(SpawnedCommand::new(child)));
        }

        if argv.is_empty() {
            return Err(InstallError::general("empty command line"));
        }

        let child = self.spawn(argv)?;
        Ok(Box::new(SpawnedCommand::new(child)))
    }
}

/// In dry-run, honor the parts of the install contract that later steps
/// depend on: a step whose config asks for a device map gets an empty one
/// written at the configured path.
fn simulate_install_side_effects(argv: &[String]) -> Result<()> {
    if !argv.iter().any(|a| a == "install") {
        return Ok(());
    }
    let Some(pos) = argv.iter().position(|a| a == "-c") else {
        return Ok(());
    };
    let Some(config_path) = argv.get(pos + 1) else {
        return Ok(());
    };
    let raw = std::fs::read_to_string(config_path)?;
    let config: serde_json::Value = serde_json::from_str(&raw)?;
    if let Some(path) = config
        .get("storage")
        .and_then(|storage| storage.get("device_map_path"))
        .and_then(serde_json::Value::as_str)
    {
        std::fs::write(path, "{}\n")?;
    }
    Ok(())
}

/// A spawned OS process implementing [`RunningCommand`].
struct SpawnedCommand {
    pid: u32,
    child: Option<Child>,
}

impl SpawnedCommand {
    fn new(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: Some(child),
        }
    }
}

impl RunningCommand for SpawnedCommand {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn wait(&mut self) -> Result<CommandOutcome> {
        let child = self
            .child
            .take()
            .ok_or_else(|| InstallError::general("command already waited on"))?;
        let output = child.wait_with_output();
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.unregister(self.pid);
        }
        let output = output.map_err(InstallError::Io)?;
        Ok(CommandOutcome {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_install_argv_includes_stage_list() {
        let cmd = CurtinCommand::Install {
            config_file: PathBuf::from("/tmp/step.conf"),
            stages: vec!["partitioning".to_string()],
            source: None,
        };
        let argv = cmd.to_argv();
        assert_eq!(argv[0], "curtin");
        assert!(argv.contains(&"install".to_string()));
        assert!(argv.contains(&"json:stages=[\"partitioning\"]".to_string()));
        // No source argument when none is given
        assert_eq!(argv.last(), Some(&"json:stages=[\"partitioning\"]".to_string()));
    }

    #[test]
    fn test_install_argv_appends_source() {
        let cmd = CurtinCommand::Install {
            config_file: PathBuf::from("/tmp/step.conf"),
            stages: vec!["extract".to_string()],
            source: Some("cp:///media/source".to_string()),
        };
        let argv = cmd.to_argv();
        assert_eq!(argv.last(), Some(&"cp:///media/source".to_string()));
    }

    #[test]
    fn test_system_install_argv_phases() {
        let download = CurtinCommand::SystemInstall {
            target: PathBuf::from("/target"),
            phase: SystemInstallPhase::DownloadOnly,
            package: "oem-foo-meta".to_string(),
        };
        assert!(download.to_argv().contains(&"--download-only".to_string()));

        let unpack = CurtinCommand::SystemInstall {
            target: PathBuf::from("/target"),
            phase: SystemInstallPhase::AssumeDownloaded,
            package: "oem-foo-meta".to_string(),
        };
        assert!(unpack.to_argv().contains(&"--assume-downloaded".to_string()));
    }

    #[test]
    fn test_in_target_argv_separates_command() {
        let cmd = CurtinCommand::InTarget {
            target: PathBuf::from("/target"),
            args: vec!["apt-get".to_string(), "update".to_string()],
        };
        let argv = cmd.to_argv();
        let sep = argv.iter().position(|a| a == "--").expect("separator");
        assert_eq!(&argv[sep + 1..], ["apt-get", "update"]);
    }

    #[test]
    fn test_dry_run_run_succeeds_without_tool() {
        let runner = SystemCommandRunner::new(true);
        let cmd = CurtinCommand::Unmount {
            target: Path::new("/nonexistent-target").to_path_buf(),
        };
        assert!(runner.run(&cmd.to_argv()).is_ok());
    }

    #[test]
    fn test_dry_run_install_simulates_device_map() {
        let dir = tempfile::tempdir().expect("tempdir");
        let device_map = dir.path().join("device-map.json");
        let config_file = dir.path().join("subflow-partitioning.conf");
        std::fs::write(
            &config_file,
            serde_json::json!({
                "storage": { "device_map_path": device_map.display().to_string() }
            })
            .to_string(),
        )
        .expect("write config");

        let runner = SystemCommandRunner::new(true);
        let cmd = CurtinCommand::Install {
            config_file,
            stages: vec!["partitioning".to_string()],
            source: None,
        };
        runner.run(&cmd.to_argv()).expect("dry run");

        let raw = std::fs::read_to_string(device_map).expect("device map written");
        assert_eq!(raw.trim(), "{}");
    }

    #[test]
    fn test_real_run_reports_exit_code() {
        let runner = SystemCommandRunner::new(false);
        let argv = vec!["sh".to_string(), "-c".to_string(), "exit 7".to_string()];
        match runner.run(&argv) {
            Err(InstallError::Command { code, .. }) => assert_eq!(code, 7),
            other => panic!("expected command error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_started_command_wait_captures_output() {
        let runner = SystemCommandRunner::new(false);
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo out; echo err >&2; exit 3".to_string(),
        ];
        let mut running = runner.start(&argv).expect("start");
        let outcome = running.wait().expect("wait");
        assert_eq!(outcome.code, 3);
        assert!(!outcome.success());
        assert_eq!(outcome.stdout.trim(), "out");
        assert_eq!(outcome.stderr.trim(), "err");
    }
}
