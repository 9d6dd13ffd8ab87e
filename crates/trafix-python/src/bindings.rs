//! Python type bindings
//!
//! Wrapper types that expose trafix-core functionality to Python.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use pyo3::exceptions::{PyFileNotFoundError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use trafix_core::experiment::{EpisodeReport, Experiment, ExperimentConfig};
use trafix_core::kernel::{
    KernelPhase, MasterKernel, SimClock, SimulationKernel, SnapshotWindows, TrafficBackend,
    WorldFrame,
};
use trafix_core::scenario::{EdgeSpec, InflowSpec, Scenario, SignalColor, SignalPhase, SignalSpec};
use trafix_core::sim::{MicroSim, RemoteConfig, RemoteSim, SimConfig};
use trafix_core::{Error, Result};

/// Map kernel errors onto Python exception types
fn to_py_err(e: Error) -> PyErr {
    match &e {
        Error::ConfigInvalid(_) => PyValueError::new_err(e.to_string()),
        Error::SnapshotNotFound(_) => PyFileNotFoundError::new_err(e.to_string()),
        _ => PyRuntimeError::new_err(e.to_string()),
    }
}

// ============================================================================
// Backend dispatch
// ============================================================================

/// Either backend behind one dispatch point, so the concrete backend
/// type does not leak into the Python signatures
pub(crate) enum EnvKernel {
    Micro(MicroSim),
    Remote(RemoteSim),
}

impl SimulationKernel for EnvKernel {
    fn name(&self) -> &str {
        match self {
            Self::Micro(s) => s.name(),
            Self::Remote(s) => s.name(),
        }
    }

    fn phase(&self) -> KernelPhase {
        match self {
            Self::Micro(s) => s.phase(),
            Self::Remote(s) => s.phase(),
        }
    }

    fn clock(&self) -> SimClock {
        match self {
            Self::Micro(s) => s.clock(),
            Self::Remote(s) => s.clock(),
        }
    }

    fn tick(&self) -> f64 {
        match self {
            Self::Micro(s) => s.tick(),
            Self::Remote(s) => s.tick(),
        }
    }

    fn snapshot_windows(&self) -> SnapshotWindows {
        match self {
            Self::Micro(s) => s.snapshot_windows(),
            Self::Remote(s) => s.snapshot_windows(),
        }
    }

    fn start_simulation(&mut self) -> Result<()> {
        match self {
            Self::Micro(s) => s.start_simulation(),
            Self::Remote(s) => s.start_simulation(),
        }
    }

    fn simulation_step(&mut self) -> Result<()> {
        match self {
            Self::Micro(s) => s.simulation_step(),
            Self::Remote(s) => s.simulation_step(),
        }
    }

    fn update(&mut self) -> Result<()> {
        match self {
            Self::Micro(s) => s.update(),
            Self::Remote(s) => s.update(),
        }
    }

    fn load_simulation(&mut self, path: &Path) -> Result<()> {
        match self {
            Self::Micro(s) => s.load_simulation(path),
            Self::Remote(s) => s.load_simulation(path),
        }
    }

    fn save_simulation(&mut self, path: &Path) -> Result<()> {
        match self {
            Self::Micro(s) => s.save_simulation(path),
            Self::Remote(s) => s.save_simulation(path),
        }
    }

    fn teardown(&mut self) {
        match self {
            Self::Micro(s) => s.teardown(),
            Self::Remote(s) => s.teardown(),
        }
    }
}

impl TrafficBackend for EnvKernel {
    fn world(&self) -> WorldFrame {
        match self {
            Self::Micro(s) => s.world(),
            Self::Remote(s) => s.world(),
        }
    }

    fn edges(&self) -> Vec<EdgeSpec> {
        match self {
            Self::Micro(s) => s.edges(),
            Self::Remote(s) => s.edges(),
        }
    }

    fn set_signal_phase(&mut self, signal_id: &str, phase_index: usize) -> Result<()> {
        match self {
            Self::Micro(s) => s.set_signal_phase(signal_id, phase_index),
            Self::Remote(s) => s.set_signal_phase(signal_id, phase_index),
        }
    }
}

// ============================================================================
// Scenario Bindings
// ============================================================================

/// A declarative road network with initial vehicles, signals, and demand
#[pyclass(name = "Scenario")]
#[derive(Clone)]
pub struct PyScenario {
    pub(crate) inner: Scenario,
}

#[pymethods]
impl PyScenario {
    /// A single open edge with vehicles spread over its first half
    #[staticmethod]
    #[pyo3(signature = (length_m = 500.0, num_vehicles = 10))]
    fn single_lane(length_m: f64, num_vehicles: u32) -> Self {
        Self {
            inner: Scenario::single_lane(length_m, num_vehicles),
        }
    }

    /// A closed ring with evenly spaced vehicles
    #[staticmethod]
    #[pyo3(signature = (circumference_m = 400.0, num_vehicles = 22))]
    fn ring(circumference_m: f64, num_vehicles: u32) -> Self {
        Self {
            inner: Scenario::ring(circumference_m, num_vehicles),
        }
    }

    fn with_name(&self, name: &str) -> Self {
        Self {
            inner: self.inner.clone().with_name(name),
        }
    }

    /// Apply one speed limit to every edge, in m/s
    fn with_speed_limit(&self, limit_mps: f64) -> Self {
        Self {
            inner: self.inner.clone().with_speed_limit(limit_mps),
        }
    }

    /// Add a signal head with a green/yellow/red plan; durations in seconds
    #[pyo3(signature = (id, edge, position_m, green_s = 30.0, yellow_s = 3.0, red_s = 30.0))]
    fn with_signal(
        &self,
        id: &str,
        edge: &str,
        position_m: f64,
        green_s: f64,
        yellow_s: f64,
        red_s: f64,
    ) -> Self {
        let spec = SignalSpec {
            id: id.to_string(),
            edge: edge.to_string(),
            position_m,
            plan: vec![
                SignalPhase::new(SignalColor::Green, green_s),
                SignalPhase::new(SignalColor::Yellow, yellow_s),
                SignalPhase::new(SignalColor::Red, red_s),
            ],
        };
        Self {
            inner: self.inner.clone().with_signal(spec),
        }
    }

    /// Inject a vehicle at the route entry every period_s seconds
    #[pyo3(signature = (period_s, depart_speed_mps = 10.0, max_vehicles = None))]
    fn with_inflow(&self, period_s: f64, depart_speed_mps: f64, max_vehicles: Option<u32>) -> Self {
        Self {
            inner: self.inner.clone().with_inflow(InflowSpec {
                period_s,
                depart_speed_mps,
                max_vehicles,
            }),
        }
    }

    /// Perturb start positions with seeded uniform noise
    fn with_placement_jitter(&self, seed: u64, max_offset_m: f64) -> Self {
        Self {
            inner: self.inner.clone().with_placement_jitter(seed, max_offset_m),
        }
    }

    /// Check the scenario for inconsistencies without starting it
    fn validate(&self) -> PyResult<()> {
        self.inner.validate().map_err(to_py_err)
    }

    #[getter]
    fn name(&self) -> String {
        self.inner.name.clone()
    }

    #[getter]
    fn num_vehicles(&self) -> usize {
        self.inner.vehicles.len()
    }

    #[getter]
    fn edge_ids(&self) -> Vec<String> {
        self.inner.edges.iter().map(|e| e.id.clone()).collect()
    }

    #[getter]
    fn route_length_m(&self) -> f64 {
        self.inner.route_length()
    }

    fn __repr__(&self) -> String {
        format!(
            "Scenario(name='{}', edges={}, vehicles={})",
            self.inner.name,
            self.inner.edges.len(),
            self.inner.vehicles.len()
        )
    }
}

// ============================================================================
// Config Bindings
// ============================================================================

/// Backend-independent simulation settings
#[pyclass(name = "SimConfig")]
#[derive(Clone)]
pub struct PySimConfig {
    pub(crate) inner: SimConfig,
}

#[pymethods]
impl PySimConfig {
    #[new]
    #[pyo3(signature = (backend = "micro", tick_s = 0.1, warmup_steps = 0, seed = 42, step_budget_s = 10.0))]
    fn new(
        backend: &str,
        tick_s: f64,
        warmup_steps: u64,
        seed: u64,
        step_budget_s: f64,
    ) -> PyResult<Self> {
        let base = match backend {
            "micro" => SimConfig::micro(),
            "remote" => SimConfig::remote(),
            other => {
                return Err(PyValueError::new_err(format!(
                    "unknown backend '{}', expected 'micro' or 'remote'",
                    other
                )))
            }
        };
        if !step_budget_s.is_finite() || step_budget_s <= 0.0 {
            return Err(PyValueError::new_err("step_budget_s must be positive"));
        }
        let inner = base
            .with_tick(tick_s)
            .with_warmup(warmup_steps)
            .with_seed(seed)
            .with_step_budget(Duration::from_secs_f64(step_budget_s));
        inner.validate().map_err(to_py_err)?;
        Ok(Self { inner })
    }

    #[getter]
    fn backend(&self) -> String {
        self.inner.backend.to_string()
    }

    #[getter]
    fn tick_s(&self) -> f64 {
        self.inner.tick_s
    }

    #[getter]
    fn warmup_steps(&self) -> u64 {
        self.inner.warmup_steps
    }

    #[getter]
    fn seed(&self) -> u64 {
        self.inner.seed
    }

    #[getter]
    fn step_budget_s(&self) -> f64 {
        self.inner.step_budget.as_secs_f64()
    }

    fn __repr__(&self) -> String {
        format!("SimConfig({})", self.inner)
    }
}

/// Connection settings for a remote simulator
#[pyclass(name = "RemoteConfig")]
#[derive(Clone)]
pub struct PyRemoteConfig {
    pub(crate) inner: RemoteConfig,
}

#[pymethods]
impl PyRemoteConfig {
    #[new]
    #[pyo3(signature = (addr = "127.0.0.1:9555", connect_timeout_s = 5.0, io_timeout_s = 10.0))]
    fn new(addr: &str, connect_timeout_s: f64, io_timeout_s: f64) -> PyResult<Self> {
        for (label, value) in [
            ("connect_timeout_s", connect_timeout_s),
            ("io_timeout_s", io_timeout_s),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(PyValueError::new_err(format!("{} must be positive", label)));
            }
        }
        let inner = RemoteConfig::new(addr)
            .with_connect_timeout(Duration::from_secs_f64(connect_timeout_s))
            .with_io_timeout(Duration::from_secs_f64(io_timeout_s));
        inner.validate().map_err(to_py_err)?;
        Ok(Self { inner })
    }

    #[getter]
    fn addr(&self) -> String {
        self.inner.addr.clone()
    }

    #[getter]
    fn connect_timeout_s(&self) -> f64 {
        self.inner.connect_timeout.as_secs_f64()
    }

    #[getter]
    fn io_timeout_s(&self) -> f64 {
        self.inner.io_timeout.as_secs_f64()
    }

    fn __repr__(&self) -> String {
        format!("RemoteConfig(addr='{}')", self.inner.addr)
    }
}

// ============================================================================
// Environment Bindings
// ============================================================================

/// Simulation environment driving one backend
///
/// All lifecycle methods release the GIL for the duration of the call.
#[pyclass(name = "TrafficEnv")]
pub struct PyTrafficEnv {
    inner: Mutex<MasterKernel<EnvKernel>>,
}

#[pymethods]
impl PyTrafficEnv {
    /// Environment over the in-process car-following model
    #[staticmethod]
    #[pyo3(signature = (scenario, config = None))]
    fn micro(scenario: PyScenario, config: Option<PySimConfig>) -> Self {
        let config = config.map(|c| c.inner).unwrap_or_else(SimConfig::micro);
        let sim = MicroSim::new(config, scenario.inner);
        Self {
            inner: Mutex::new(MasterKernel::new(EnvKernel::Micro(sim))),
        }
    }

    /// Environment attached to an external simulator over TCP
    #[staticmethod]
    #[pyo3(signature = (remote = None, config = None))]
    fn remote(remote: Option<PyRemoteConfig>, config: Option<PySimConfig>) -> Self {
        let config = config.map(|c| c.inner).unwrap_or_else(SimConfig::remote);
        let remote = remote.map(|r| r.inner).unwrap_or_default();
        let sim = RemoteSim::new(config, remote);
        Self {
            inner: Mutex::new(MasterKernel::new(EnvKernel::Remote(sim))),
        }
    }

    /// Start the backend and build the initial view
    fn start(&self, py: Python<'_>) -> PyResult<()> {
        py.allow_threads(|| self.inner.lock().start())
            .map_err(to_py_err)
    }

    /// Advance exactly one tick
    fn step(&self, py: Python<'_>) -> PyResult<()> {
        py.allow_threads(|| self.inner.lock().step())
            .map_err(to_py_err)
    }

    /// Advance several ticks without returning to Python between them
    #[pyo3(signature = (n = 1))]
    fn step_n(&self, py: Python<'_>, n: u64) -> PyResult<()> {
        py.allow_threads(|| {
            let mut master = self.inner.lock();
            for _ in 0..n {
                master.step()?;
            }
            Ok(())
        })
        .map_err(to_py_err)
    }

    /// Re-sync the cached view without advancing time
    fn refresh(&self, py: Python<'_>) -> PyResult<()> {
        py.allow_threads(|| self.inner.lock().refresh())
            .map_err(to_py_err)
    }

    /// Restore a snapshot from a file
    fn load(&self, py: Python<'_>, path: PathBuf) -> PyResult<()> {
        py.allow_threads(|| self.inner.lock().load(&path))
            .map_err(to_py_err)
    }

    /// Persist the live state to a snapshot file
    fn save(&self, py: Python<'_>, path: PathBuf) -> PyResult<()> {
        py.allow_threads(|| self.inner.lock().save(&path))
            .map_err(to_py_err)
    }

    /// Release the backend; the environment cannot step afterwards
    fn teardown(&self, py: Python<'_>) {
        py.allow_threads(|| self.inner.lock().teardown())
    }

    /// Drive a whole episode and return its report
    #[pyo3(signature = (name = "episode", horizon = 1000, warmup_steps = None, step_budget_s = None))]
    fn run_episode(
        &self,
        py: Python<'_>,
        name: &str,
        horizon: u64,
        warmup_steps: Option<u64>,
        step_budget_s: Option<f64>,
    ) -> PyResult<PyEpisodeReport> {
        let mut config = ExperimentConfig::new(name, horizon);
        if let Some(warmup) = warmup_steps {
            config = config.with_warmup(warmup);
        }
        if let Some(budget) = step_budget_s {
            if !budget.is_finite() || budget <= 0.0 {
                return Err(PyValueError::new_err("step_budget_s must be positive"));
            }
            config = config.with_step_budget(Duration::from_secs_f64(budget));
        }

        let report = py
            .allow_threads(|| {
                let mut master = self.inner.lock();
                Experiment::run(&mut *master, &config)
            })
            .map_err(to_py_err)?;
        Ok(PyEpisodeReport { inner: report })
    }

    #[getter]
    fn phase(&self) -> String {
        self.inner.lock().phase().to_string()
    }

    #[getter]
    fn sim_time(&self) -> f64 {
        self.inner.lock().clock().sim_time
    }

    #[getter]
    fn step_count(&self) -> u64 {
        self.inner.lock().clock().step_count
    }

    #[getter]
    fn tick(&self) -> f64 {
        self.inner.lock().tick()
    }

    fn is_running(&self) -> bool {
        self.inner.lock().is_running()
    }

    /// Ids of all vehicles currently in the network, in stable order
    fn vehicle_ids(&self) -> Vec<String> {
        self.inner.lock().vehicle().ids().map(String::from).collect()
    }

    fn num_vehicles(&self) -> usize {
        self.inner.lock().vehicle().len()
    }

    /// Speed of one vehicle in m/s, None if it is not in the network
    fn speed(&self, vehicle_id: &str) -> Option<f64> {
        self.inner.lock().vehicle().speed(vehicle_id)
    }

    /// Position of one vehicle along its edge in meters
    fn position(&self, vehicle_id: &str) -> Option<f64> {
        self.inner.lock().vehicle().position(vehicle_id)
    }

    fn vehicle_edge(&self, vehicle_id: &str) -> Option<String> {
        self.inner
            .lock()
            .vehicle()
            .edge(vehicle_id)
            .map(String::from)
    }

    fn ids_by_edge(&self, edge_id: &str) -> Vec<String> {
        self.inner.lock().vehicle().ids_by_edge(edge_id).to_vec()
    }

    fn mean_speed(&self) -> Option<f64> {
        self.inner.lock().vehicle().mean_speed()
    }

    fn num_departed(&self) -> u64 {
        self.inner.lock().vehicle().num_departed()
    }

    fn num_arrived(&self) -> u64 {
        self.inner.lock().vehicle().num_arrived()
    }

    /// Entry rate over the trailing span in vehicles/hour
    #[pyo3(signature = (span_s = 60.0))]
    fn inflow_rate(&self, span_s: f64) -> f64 {
        self.inner.lock().vehicle().inflow_rate(span_s)
    }

    /// Exit rate over the trailing span in vehicles/hour
    #[pyo3(signature = (span_s = 60.0))]
    fn outflow_rate(&self, span_s: f64) -> f64 {
        self.inner.lock().vehicle().outflow_rate(span_s)
    }

    fn edge_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .network()
            .edge_ids()
            .map(String::from)
            .collect()
    }

    fn edge_length(&self, edge_id: &str) -> Option<f64> {
        self.inner.lock().network().edge_length(edge_id)
    }

    fn speed_limit(&self, edge_id: &str) -> Option<f64> {
        self.inner.lock().network().speed_limit(edge_id)
    }

    fn total_length(&self) -> f64 {
        self.inner.lock().network().total_length()
    }

    fn signal_ids(&self) -> Vec<String> {
        self.inner.lock().signal().ids().map(String::from).collect()
    }

    /// Current color of one signal: 'green', 'yellow', or 'red'
    fn signal_color(&self, signal_id: &str) -> Option<String> {
        self.inner
            .lock()
            .signal()
            .color(signal_id)
            .map(|c| c.to_string())
    }

    fn signal_phase_index(&self, signal_id: &str) -> Option<usize> {
        self.inner.lock().signal().phase_index(signal_id)
    }

    /// Queue a phase change, applied at the top of the next step
    ///
    /// Returns False if the signal id is unknown.
    fn set_signal(&self, signal_id: &str, phase_index: usize) -> bool {
        self.inner.lock().signal_mut().set_state(signal_id, phase_index)
    }

    fn __repr__(&self) -> String {
        let master = self.inner.lock();
        format!(
            "TrafficEnv(backend='{}', phase='{}', step={})",
            master.simulation().name(),
            master.phase(),
            master.clock().step_count
        )
    }
}

// ============================================================================
// Report Bindings
// ============================================================================

/// Aggregate outcome of one episode
#[pyclass(name = "EpisodeReport")]
#[derive(Clone)]
pub struct PyEpisodeReport {
    pub(crate) inner: EpisodeReport,
}

#[pymethods]
impl PyEpisodeReport {
    #[getter]
    fn steps(&self) -> u64 {
        self.inner.steps
    }

    #[getter]
    fn sim_time_s(&self) -> f64 {
        self.inner.sim_time_s
    }

    #[getter]
    fn wall_time_s(&self) -> f64 {
        self.inner.wall_time_s
    }

    #[getter]
    fn mean_speed_mps(&self) -> f64 {
        self.inner.mean_speed_mps
    }

    #[getter]
    fn peak_vehicles(&self) -> usize {
        self.inner.peak_vehicles
    }

    #[getter]
    fn total_departed(&self) -> u64 {
        self.inner.total_departed
    }

    #[getter]
    fn total_arrived(&self) -> u64 {
        self.inner.total_arrived
    }

    #[getter]
    fn completed(&self) -> bool {
        self.inner.completed
    }

    #[getter]
    fn avg_step_wall_s(&self) -> f64 {
        self.inner.avg_step_wall().as_secs_f64()
    }

    fn __repr__(&self) -> String {
        format!(
            "EpisodeReport(steps={}, sim_time_s={:.2}, mean_speed_mps={:.2}, completed={})",
            self.inner.steps, self.inner.sim_time_s, self.inner.mean_speed_mps, self.inner.completed
        )
    }
}
