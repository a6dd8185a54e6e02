//! Observable install state
//!
//! An install run moves through a small set of externally visible states.
//! The controller owns the current state and mutates it only through
//! [`StateTracker::update`], which also notifies every subscribed
//! observer. Observers (the forms layer, the API) only ever see states in
//! the order the engine entered them.
//!
//! # State Flow
//!
//! ```text
//! Waiting ⇄ NeedsConfirmation
//!              ↓ (confirmed)
//!           Running
//!              ↓ (curtin sequence complete)
//!       WaitingPostinstall
//!              ↓ (postinstall trigger)
//!           Running ─────→ UuRunning ──→ UuCancelling
//!              ↓               ↓               ↓
//!            Done ←────────────┴───────────────┘
//! ```
//!
//! Failure is not a state: a failed run propagates an error carrying a
//! diagnostic report and simply never reaches `Done`.

use std::sync::Mutex;
use std::sync::mpsc::{Receiver, Sender, channel};
use strum::{Display, EnumString};

/// Externally visible phase of the install run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum InstallState {
    /// Waiting for the install trigger.
    Waiting,
    /// Waiting for the user to confirm the destructive run.
    NeedsConfirmation,
    /// The curtin sequence or the postinstall sequence is executing.
    Running,
    /// The destructive phase is done; waiting for postinstall config.
    WaitingPostinstall,
    /// Unattended upgrades are running in the target.
    UuRunning,
    /// A cancellation of the unattended upgrades was requested.
    UuCancelling,
    /// The install completed (terminal).
    Done,
}

impl InstallState {
    /// Returns true if this is the terminal state.
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done)
    }

    /// Whether `next` is a legal successor of this state.
    ///
    /// The only backward edge is the confirmation retry loop: a denied
    /// confirmation sends the run back to `Waiting`.
    pub const fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Waiting, Self::NeedsConfirmation)
                | (Self::NeedsConfirmation, Self::Waiting)
                | (Self::NeedsConfirmation, Self::Running)
                | (Self::Running, Self::WaitingPostinstall)
                | (Self::Running, Self::UuRunning)
                | (Self::Running, Self::Done)
                | (Self::WaitingPostinstall, Self::Running)
                | (Self::UuRunning, Self::UuCancelling)
                | (Self::UuRunning, Self::Done)
                | (Self::UuCancelling, Self::Done)
        )
    }
}

/// Owns the current install state and notifies observers of changes.
pub struct StateTracker {
    inner: Mutex<TrackerInner>,
}

struct TrackerInner {
    current: InstallState,
    observers: Vec<Sender<InstallState>>,
}

impl StateTracker {
    /// Create a tracker in the initial `Waiting` state.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                current: InstallState::Waiting,
                observers: Vec::new(),
            }),
        }
    }

    /// The state the run is currently in.
    pub fn current(&self) -> InstallState {
        self.inner
            .lock()
            .map(|inner| inner.current)
            .unwrap_or(InstallState::Waiting)
    }

    /// Register an observer; every subsequent transition is delivered on
    /// the returned channel in order.
    pub fn subscribe(&self) -> Receiver<InstallState> {
        let (tx, rx) = channel();
        if let Ok(mut inner) = self.inner.lock() {
            inner.observers.push(tx);
        }
        rx
    }

    /// Transition to `next` and notify all observers.
    ///
    /// This is the single mutation point for the install state. An illegal
    /// transition indicates a sequencing bug in the caller; it is logged
    /// (and trips a debug assertion) but still applied, so observers never
    /// see a state the engine is not actually in.
    pub fn update(&self, next: InstallState) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.current != next && !inner.current.can_transition(next) {
            tracing::warn!("unexpected state transition {} -> {}", inner.current, next);
            debug_assert!(
                inner.current.can_transition(next),
                "unexpected state transition {} -> {}",
                inner.current,
                next
            );
        }
        tracing::info!("install state: {} -> {}", inner.current, next);
        inner.current = next;
        // Drop observers whose receiving end has gone away.
        inner.observers.retain(|tx| tx.send(next).is_ok());
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}
