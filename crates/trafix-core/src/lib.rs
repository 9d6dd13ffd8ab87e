//! trafix-core: Traffic micro-simulation kernel for RL experiments
//!
//! A small traffic simulation framework built around a uniform kernel
//! contract, so that training code written against the kernel API runs
//! unchanged on top of the in-process car-following model or a remote
//! simulator attached over TCP.
//!
//! # Modules
//!
//! - [`kernel`] - Simulation lifecycle contract and the master/sibling kernels
//! - [`scenario`] - Declarative road networks, demand, and signal plans
//! - [`sim`] - Backend implementations (in-process micro model, remote attach)
//! - [`experiment`] - Episode runner with watchdog and step-record streaming
//!
//! # Architecture
//!
//! ```text
//! Training code                          trafix-core
//! ┌──────────────┐                    ┌───────────────┐
//! │   Policies   │───actions────────► │  MasterKernel │
//! │  (Python/RL) │◄──observations─────│  veh/net/sig  │
//! └──────────────┘                    └───────┬───────┘
//!                                             │ SimulationKernel
//!                                     ┌───────┴───────┐
//!                                     │ MicroSim      │
//!                                     │ RemoteSim     │
//!                                     └───────────────┘
//! ```
//!
//! Policy and learning code live outside this crate. Rust owns the
//! simulation step, the state queries, and the backend plumbing.

#![warn(unused_must_use)]

pub mod experiment;
pub mod kernel;
pub mod scenario;
pub mod sim;

// Re-exports for convenience
pub use experiment::{EpisodeReport, Experiment, ExperimentConfig, RecordFanout, StepRecord};
pub use kernel::{
    KernelPhase, MasterKernel, SimClock, SimulationKernel, SnapshotWindow, SnapshotWindows,
    TrafficBackend, WorldFrame,
};
pub use scenario::Scenario;
pub use sim::{MicroSim, RemoteConfig, RemoteSim, SimBackendKind, SimConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for trafix-core
///
/// All errors should be handled appropriately. Use pattern matching
/// to handle specific error cases, or use `?` to propagate errors.
///
/// # Example
/// ```ignore
/// match kernel.start_simulation() {
///     Ok(()) => { /* drive the episode */ }
///     Err(Error::BackendUnavailable(msg)) => eprintln!("backend down: {}", msg),
///     Err(Error::ConfigInvalid(msg)) => eprintln!("bad config: {}", msg),
///     Err(e) => return Err(e),
/// }
/// ```
#[derive(Debug, thiserror::Error)]
#[must_use = "errors must be handled or explicitly ignored with let _ = ..."]
#[non_exhaustive]
pub enum Error {
    /// Startup parameters were rejected before any session was opened.
    /// Handle by: fixing the scenario or config; retrying is pointless.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The backing simulator is gone: connection refused, session lost,
    /// or the handle was invalidated mid-episode.
    /// Handle by: tearing the kernel down and starting a fresh one.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// start_simulation was called on a kernel that is already running.
    /// Handle by: tearing down first, or reusing the running kernel.
    #[error("Simulation already started")]
    AlreadyStarted,

    /// Operation invoked outside the phase that permits it, such as
    /// stepping before start or querying after teardown.
    /// Handle by: checking `phase()` before operating on the kernel.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No snapshot exists at the given path.
    /// Handle by: checking the path; the kernel state is unchanged.
    #[error("Snapshot not found: {}", .0.display())]
    SnapshotNotFound(std::path::PathBuf),

    /// The snapshot exists but was rejected: unreadable, malformed, or
    /// an unsupported format version.
    /// Handle by: regenerating the snapshot; the kernel state is unchanged.
    #[error("Snapshot rejected: {0}")]
    SnapshotInvalid(String),

    /// Persisting a snapshot failed on the write side.
    /// Handle by: checking disk space and permissions; the running
    /// simulation is unaffected.
    #[error("Snapshot write failed: {0}")]
    WriteFailed(String),

    /// The backend does not implement this operation, or not in the
    /// current snapshot window.
    /// Handle by: consulting `snapshot_windows()` before relying on
    /// mid-episode load/save.
    #[error("Operation not supported: {0}")]
    Unsupported(String),
}

/// Result type alias for trafix-core operations
pub type Result<T> = std::result::Result<T, Error>;
