//! Shared test doubles for engine integration tests.
//!
//! All fakes record into one shared [`EventLog`] so tests can assert the
//! relative ordering of steps, model hooks, and apt operations; the
//! ordering guarantees are the point of the sequencer.

#![allow(dead_code)] // Not every test binary uses every helper

use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use subflow::curtin::{CommandOutcome, CommandRunner, RunningCommand, SystemCommandRunner};
use subflow::error::Result;
use subflow::model::{ActionRenderMode, AptConfigurer, DeviceMap, FilesystemModel, Mounter};

/// Ordered log of everything the fakes observed.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.into());
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Index of the first event equal to `wanted`; panics when absent.
    pub fn index_of(&self, wanted: &str) -> usize {
        let events = self.snapshot();
        events
            .iter()
            .position(|e| e == wanted)
            .unwrap_or_else(|| panic!("event {wanted:?} not in {events:?}"))
    }

    pub fn count_of(&self, wanted: &str) -> usize {
        self.snapshot().iter().filter(|e| *e == wanted).count()
    }
}

// ============================================================================
// Command runner
// ============================================================================

/// Wraps the dry-run system runner so install steps get their simulated
/// side effects, while recording a labelled event per invocation. Started
/// commands either exit immediately or block until released (to hold an
/// unattended-upgrade run open for cancellation tests).
pub struct TestRunner {
    inner: SystemCommandRunner,
    pub events: EventLog,
    pub calls: Mutex<Vec<Vec<String>>>,
    blocking_start: bool,
    uu_code: i32,
    uu_exit: Mutex<Option<Sender<i32>>>,
}

impl TestRunner {
    pub fn new(events: EventLog) -> Self {
        Self {
            inner: SystemCommandRunner::new(true),
            events,
            calls: Mutex::new(Vec::new()),
            blocking_start: false,
            uu_code: 0,
            uu_exit: Mutex::new(None),
        }
    }

    /// Started commands block until a shutdown invocation releases them.
    pub fn with_blocking_start(events: EventLog) -> Self {
        Self {
            blocking_start: true,
            ..Self::new(events)
        }
    }

    /// Started commands exit immediately with the given code.
    pub fn with_uu_exit_code(events: EventLog, code: i32) -> Self {
        Self {
            uu_code: code,
            ..Self::new(events)
        }
    }

    fn label(argv: &[String]) -> String {
        if argv.iter().any(|a| a.contains("unattended-upgrade-shutdown")) {
            return "uu:shutdown".to_string();
        }
        if argv.iter().any(|a| a == "--download-only") {
            return format!("pkg:download:{}", argv.last().cloned().unwrap_or_default());
        }
        if argv.iter().any(|a| a == "--assume-downloaded") {
            return format!("pkg:unpack:{}", argv.last().cloned().unwrap_or_default());
        }
        if argv.iter().any(|a| a == "apt-get") {
            return "oem:update".to_string();
        }
        if argv.iter().any(|a| a == "unmount") {
            return "unmount".to_string();
        }
        if argv.iter().any(|a| a == "install") {
            // argv = ["curtin", "-c", <config>, "install", ...]
            let step = Path::new(&argv[2])
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix("subflow-"))
                .unwrap_or("unknown")
                .to_string();
            return format!("step:{step}");
        }
        format!("run:{}", argv.first().cloned().unwrap_or_default())
    }
}

impl CommandRunner for TestRunner {
    fn run(&self, argv: &[String]) -> Result<()> {
        self.calls.lock().expect("calls lock").push(argv.to_vec());
        let label = Self::label(argv);
        self.events.push(&label);

        // The graceful shutdown releases a blocked upgrade subprocess,
        // like the real tool's shutdown-only mode does.
        if label == "uu:shutdown" {
            if let Ok(exit) = self.uu_exit.lock() {
                if let Some(tx) = exit.as_ref() {
                    let _ = tx.send(0);
                }
            }
        }

        self.inner.run(argv)
    }

    fn start(&self, argv: &[String]) -> Result<Box<dyn RunningCommand>> {
        self.calls.lock().expect("calls lock").push(argv.to_vec());
        self.events.push("uu:start");

        if self.blocking_start {
            let (tx, rx) = channel();
            *self.uu_exit.lock().expect("uu lock") = Some(tx);
            Ok(Box::new(BlockedCommand { exit: rx }))
        } else {
            Ok(Box::new(ExitedCommand { code: self.uu_code }))
        }
    }
}

struct ExitedCommand {
    code: i32,
}

impl RunningCommand for ExitedCommand {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn wait(&mut self) -> Result<CommandOutcome> {
        Ok(CommandOutcome {
            code: self.code,
            stdout: String::from("simulated upgrade output"),
            stderr: String::from("simulated upgrade failure"),
        })
    }
}

struct BlockedCommand {
    exit: Receiver<i32>,
}

impl RunningCommand for BlockedCommand {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn wait(&mut self) -> Result<CommandOutcome> {
        let code = self.exit.recv().unwrap_or(-1);
        Ok(CommandOutcome {
            code,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

// ============================================================================
// Filesystem model
// ============================================================================

pub struct TestModel {
    pub core_boot: bool,
    pub tpm: bool,
    pub recovery: Option<PathBuf>,
    pub events: EventLog,
    pub device_maps: Mutex<Vec<DeviceMap>>,
}

impl TestModel {
    pub fn classic(events: EventLog) -> Self {
        Self {
            core_boot: false,
            tpm: false,
            recovery: None,
            events,
            device_maps: Mutex::new(Vec::new()),
        }
    }

    pub fn core_boot(events: EventLog, tpm: bool) -> Self {
        Self {
            core_boot: true,
            tpm,
            recovery: None,
            events,
            device_maps: Mutex::new(Vec::new()),
        }
    }
}

impl FilesystemModel for TestModel {
    fn render(&self, _mode: ActionRenderMode) -> Value {
        json!({"storage": {"version": 2, "config": []}})
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
        self.events.push("fs:update_devices");
        self.device_maps.lock().expect("lock").push(device_map);
    }

    fn setup_encryption(&self) -> Result<()> {
        self.events.push("fs:setup_encryption");
        Ok(())
    }

    fn finish_install(&self) -> Result<()> {
        self.events.push("fs:finish_install");
        Ok(())
    }
}

// ============================================================================
// Apt configurer and mounter
// ============================================================================

pub struct TestApt {
    pub events: EventLog,
    pub source: PathBuf,
}

impl AptConfigurer for TestApt {
    fn configure_for_install(&self) -> Result<PathBuf> {
        self.events.push("apt:configure");
        std::fs::create_dir_all(&self.source)?;
        Ok(self.source.clone())
    }

    fn setup_target(&self, _target: &Path) -> Result<()> {
        self.events.push("apt:setup_target");
        Ok(())
    }

    fn deconfigure(&self, _target: &Path) -> Result<()> {
        self.events.push("apt:deconfigure");
        Ok(())
    }
}

pub struct TestMounter {
    pub events: EventLog,
    pub mountpoint: PathBuf,
}

impl Mounter for TestMounter {
    fn with_mounted(
        &self,
        _device: &Path,
        f: &mut dyn FnMut(&Path) -> Result<()>,
    ) -> Result<()> {
        self.events.push("mount:rp");
        std::fs::create_dir_all(&self.mountpoint)?;
        let result = f(&self.mountpoint);
        self.events.push("unmount:rp");
        result
    }
}
