//! Simulation kernel contract
//!
//! Every backend implements [`SimulationKernel`], the lifecycle half of the
//! contract, plus [`TrafficBackend`] for the traffic-specific data surface.
//! The master kernel drives backends purely through these traits, so the
//! in-process model and a remote simulator are interchangeable to callers.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::scenario::{EdgeSpec, SignalColor};
use crate::Result;

/// Lifecycle phase of a kernel
///
/// Phases only move forward: `Uninitialized` to `Running` on a successful
/// start, `Running` to `Stopped` on teardown. A stopped kernel is dead;
/// build a new one for the next episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelPhase {
    /// Constructed but not started; no backend handle exists yet.
    Uninitialized,
    /// Started and holding a live backend handle.
    Running,
    /// Torn down; the handle has been released.
    Stopped,
}

impl std::fmt::Display for KernelPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Cached simulation clock
///
/// `update()` folds the backend's authoritative time into this cache; reads
/// between updates see the last folded value, never a half-stepped one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SimClock {
    /// Simulation time in seconds
    pub sim_time: f64,
    /// Completed simulation steps
    pub step_count: u64,
}

impl SimClock {
    /// Advance by one tick of the given duration
    pub fn advance(&mut self, tick_s: f64) {
        self.step_count += 1;
        // derive time from the step count so long episodes do not drift
        self.sim_time = self.step_count as f64 * tick_s;
    }
}

/// When a snapshot operation is valid for a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotWindow {
    /// Before start, or after start but before the first step.
    BeforeFirstStep,
    /// Only while the kernel is running.
    WhileRunning,
    /// Before start or while running; never after teardown.
    Anytime,
    /// The backend does not support the operation at all.
    Never,
}

impl SnapshotWindow {
    /// Whether the window admits the operation in the given phase
    pub fn allows(self, phase: KernelPhase, step_count: u64) -> bool {
        match self {
            Self::Never => false,
            Self::Anytime => phase != KernelPhase::Stopped,
            Self::WhileRunning => phase == KernelPhase::Running,
            Self::BeforeFirstStep => {
                phase == KernelPhase::Uninitialized
                    || (phase == KernelPhase::Running && step_count == 0)
            }
        }
    }
}

/// Per-backend snapshot windows for load and save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotWindows {
    /// When `load_simulation` is valid
    pub load: SnapshotWindow,
    /// When `save_simulation` is valid
    pub save: SnapshotWindow,
}

/// One vehicle as seen at a tick boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleObs {
    /// Vehicle id, unique within the episode
    pub id: String,
    /// Edge the vehicle is currently on
    pub edge: String,
    /// Lane index on that edge
    pub lane: u32,
    /// Distance from the edge start in meters
    pub position_m: f64,
    /// Current speed in m/s
    pub speed_mps: f64,
}

/// One signal head as seen at a tick boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalObs {
    /// Signal id
    pub id: String,
    /// Index into the signal's phase plan
    pub phase_index: usize,
    /// Color currently shown
    pub color: SignalColor,
}

/// Consistent view of the simulation at one tick boundary
///
/// The master kernel pulls one frame per step and fans it out to the
/// sibling kernels; nothing downstream talks to the backend directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorldFrame {
    /// Clock at the moment the frame was taken
    pub clock: SimClock,
    /// All vehicles currently in the network
    pub vehicles: Vec<VehicleObs>,
    /// All signal heads
    pub signals: Vec<SignalObs>,
    /// Ids of vehicles that entered the network on this tick
    pub departed: Vec<String>,
    /// Ids of vehicles that left the network on this tick
    pub arrived: Vec<String>,
}

/// Lifecycle contract between an environment and a simulator backend
///
/// The contract is single-threaded: one owner drives the kernel and every
/// call completes before the next begins. Backends do not spawn watchdogs;
/// the driver measures wall-clock time around `simulation_step` and reacts
/// to overruns itself (see [`crate::experiment::Experiment`]).
///
/// Phase errors are uniform across backends: any operation that needs a
/// live handle fails with [`crate::Error::InvalidState`] when the kernel is
/// not running, and with [`crate::Error::BackendUnavailable`] when the
/// kernel is running but the handle has died underneath it.
pub trait SimulationKernel: Send {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Current lifecycle phase
    fn phase(&self) -> KernelPhase;

    /// Cached clock, as of the last `update()`
    fn clock(&self) -> SimClock;

    /// Fixed step length in seconds, set at configuration time
    fn tick(&self) -> f64;

    /// Snapshot windows this backend supports
    fn snapshot_windows(&self) -> SnapshotWindows;

    /// Acquire the backend handle and enter `Running`
    ///
    /// Fails with `ConfigInvalid` if parameters are rejected,
    /// `BackendUnavailable` if the simulator cannot be reached, and
    /// `AlreadyStarted` on a second start. A failed start leaves the
    /// kernel `Uninitialized`.
    fn start_simulation(&mut self) -> Result<()>;

    /// Advance the simulation by exactly one tick
    ///
    /// Does not refresh the cached clock; call `update()` afterwards.
    fn simulation_step(&mut self) -> Result<()>;

    /// Fold the backend's authoritative time into the cached clock
    ///
    /// Performs no I/O on any backend and cannot fail while the handle is
    /// valid. Calling it twice without an intervening step is a no-op.
    fn update(&mut self) -> Result<()>;

    /// Restore simulation state from a snapshot at `path`
    ///
    /// On any failure the current state is untouched: `SnapshotNotFound`
    /// if nothing exists at the path, `SnapshotInvalid` if the content is
    /// rejected, `Unsupported` outside the backend's load window.
    fn load_simulation(&mut self, path: &Path) -> Result<()>;

    /// Persist a snapshot of the current state to `path`
    ///
    /// Must not advance time or otherwise disturb the running simulation.
    /// Fails with `WriteFailed` on I/O errors and `Unsupported` outside
    /// the backend's save window.
    fn save_simulation(&mut self, path: &Path) -> Result<()>;

    /// Release the backend handle and enter `Stopped`
    ///
    /// Infallible and idempotent; called from `Drop` as well, so a leaked
    /// kernel still releases its session.
    fn teardown(&mut self);

    /// Cached simulation time in seconds
    fn sim_time(&self) -> f64 {
        self.clock().sim_time
    }

    /// Cached completed step count
    fn step_count(&self) -> u64 {
        self.clock().step_count
    }

    /// Whether the kernel is in the `Running` phase
    fn is_running(&self) -> bool {
        self.phase() == KernelPhase::Running
    }
}

/// Traffic data surface on top of the lifecycle contract
///
/// Everything the sibling kernels need is pulled through these three
/// methods, so backends stay free to cache or recompute as they like.
pub trait TrafficBackend: SimulationKernel {
    /// View of the world at the current tick boundary
    fn world(&self) -> WorldFrame;

    /// Current network geometry
    ///
    /// Re-read by the master after start and after every snapshot load,
    /// since snapshots carry geometry.
    fn edges(&self) -> Vec<EdgeSpec>;

    /// Force a signal onto a phase of its plan, effective this tick
    ///
    /// Unknown ids and out-of-range phase indexes are contract violations
    /// and fail with `InvalidState`.
    fn set_signal_phase(&mut self, signal_id: &str, phase_index: usize) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advance_is_drift_free() {
        let mut clock = SimClock::default();
        for _ in 0..10_000 {
            clock.advance(0.1);
        }
        assert_eq!(clock.step_count, 10_000);
        assert_eq!(clock.sim_time, 1000.0);
    }

    #[test]
    fn test_window_never() {
        for phase in [
            KernelPhase::Uninitialized,
            KernelPhase::Running,
            KernelPhase::Stopped,
        ] {
            assert!(!SnapshotWindow::Never.allows(phase, 0));
        }
    }

    #[test]
    fn test_window_anytime_excludes_stopped() {
        assert!(SnapshotWindow::Anytime.allows(KernelPhase::Uninitialized, 0));
        assert!(SnapshotWindow::Anytime.allows(KernelPhase::Running, 500));
        assert!(!SnapshotWindow::Anytime.allows(KernelPhase::Stopped, 500));
    }

    #[test]
    fn test_window_while_running() {
        assert!(!SnapshotWindow::WhileRunning.allows(KernelPhase::Uninitialized, 0));
        assert!(SnapshotWindow::WhileRunning.allows(KernelPhase::Running, 0));
        assert!(!SnapshotWindow::WhileRunning.allows(KernelPhase::Stopped, 0));
    }

    #[test]
    fn test_window_before_first_step() {
        let w = SnapshotWindow::BeforeFirstStep;
        assert!(w.allows(KernelPhase::Uninitialized, 0));
        assert!(w.allows(KernelPhase::Running, 0));
        assert!(!w.allows(KernelPhase::Running, 1));
        assert!(!w.allows(KernelPhase::Stopped, 0));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(KernelPhase::Uninitialized.to_string(), "uninitialized");
        assert_eq!(KernelPhase::Running.to_string(), "running");
        assert_eq!(KernelPhase::Stopped.to_string(), "stopped");
    }
}
