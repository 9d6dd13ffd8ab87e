//! Kernel layer
//!
//! [`SimulationKernel`] is the lifecycle contract every backend
//! implements; [`TrafficBackend`] adds the traffic-specific queries.
//! [`MasterKernel`] owns one backend and feeds the sibling kernels
//! ([`VehicleKernel`], [`NetworkKernel`], [`SignalKernel`]) that agent
//! code reads and writes.

mod master;
mod network;
mod signal;
mod simulation;
mod vehicle;

pub use master::MasterKernel;
pub use network::NetworkKernel;
pub use signal::{SignalCommand, SignalKernel};
pub use simulation::{
    KernelPhase, SignalObs, SimClock, SimulationKernel, SnapshotWindow, SnapshotWindows,
    TrafficBackend, VehicleObs, WorldFrame,
};
pub use vehicle::VehicleKernel;
