//! Simulation backends
//!
//! Two [`crate::kernel::TrafficBackend`] implementations share one
//! config surface: [`MicroSim`] runs the built-in car-following model
//! in process, [`RemoteSim`] attaches to an external simulator over
//! TCP. Training code selects one via [`SimBackendKind`] and otherwise
//! cannot tell them apart.

pub mod config;
pub mod micro;
pub mod remote;

pub use config::{SimBackendKind, SimConfig};
pub use micro::MicroSim;
pub use remote::{RemoteConfig, RemoteSim, PROTOCOL_VERSION};
