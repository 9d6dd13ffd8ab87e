//! In-process car-following backend
//!
//! A deliberately small traffic model: vehicles follow the scenario's
//! route under a Gipps-style safe-speed rule with bounded acceleration,
//! signals advance their phase plans by time, and an optional inflow
//! injects vehicles at the route entry. Small enough to step thousands
//! of times per second, real enough to produce stop-and-go waves.
//!
//! Snapshots are versioned JSON documents carrying the full world,
//! geometry included, so a restored simulation needs nothing from the
//! kernel that saved it.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::kernel::{
    KernelPhase, SignalObs, SimClock, SimulationKernel, SnapshotWindow, SnapshotWindows,
    TrafficBackend, VehicleObs, WorldFrame,
};
use crate::scenario::{EdgeSpec, Scenario, SignalColor, DEFAULT_SPEED_LIMIT};
use crate::sim::SimConfig;
use crate::{Error, Result};

/// Snapshot format version written and accepted by this backend
pub const SNAPSHOT_FORMAT: u32 = 1;

/// Maximum acceleration in m/s^2
const MAX_ACCEL: f64 = 1.5;
/// Maximum comfortable deceleration in m/s^2
const MAX_DECEL: f64 = 3.0;
/// Standstill bumper gap in meters
const MIN_GAP: f64 = 2.0;
/// Vehicle length in meters
const VEHICLE_LENGTH: f64 = 5.0;
/// Driver reaction headway in seconds
const HEADWAY_S: f64 = 1.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MicroVehicle {
    id: String,
    /// Index into the route's edge list
    route_idx: usize,
    /// Position along the current edge in meters
    offset_m: f64,
    lane: u32,
    speed_mps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MicroSignal {
    /// Index into the scenario's signal list
    spec_idx: usize,
    route_idx: usize,
    offset_m: f64,
    phase_index: usize,
    time_in_phase_s: f64,
}

/// Full dynamic state of the model
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MicroWorld {
    scenario: Scenario,
    vehicles: Vec<MicroVehicle>,
    signals: Vec<MicroSignal>,
    clock: SimClock,
    /// Vehicles created by the inflow so far, also the id counter
    spawned: u64,
    next_inflow_in_s: f64,
    #[serde(skip)]
    departed_last: Vec<String>,
    #[serde(skip)]
    arrived_last: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MicroSnapshot {
    format: u32,
    world: MicroWorld,
}

/// Gipps-style safe speed against an obstacle `gap_m` ahead
///
/// Following at exactly this speed holds the equilibrium spacing
/// `MIN_GAP + v * HEADWAY_S` and stops with at most `MAX_DECEL`.
fn safe_speed(gap_m: f64, lead_speed_mps: f64) -> f64 {
    if !gap_m.is_finite() {
        return f64::INFINITY;
    }
    let usable = (gap_m - MIN_GAP).max(0.0);
    let bt = MAX_DECEL * HEADWAY_S;
    -bt + (bt * bt + lead_speed_mps * lead_speed_mps + 2.0 * MAX_DECEL * usable).sqrt()
}

/// Cumulative route offset of each route edge's start
fn route_starts(scenario: &Scenario) -> Vec<f64> {
    let mut starts = Vec::with_capacity(scenario.route.edges.len());
    let mut acc = 0.0;
    for id in &scenario.route.edges {
        starts.push(acc);
        acc += scenario.edge(id).map(|e| e.length_m).unwrap_or(0.0);
    }
    starts
}

impl MicroWorld {
    fn build(scenario: &Scenario) -> Result<Self> {
        let starts = route_starts(scenario);

        let mut vehicles = Vec::with_capacity(scenario.vehicles.len());
        for spec in &scenario.vehicles {
            let route_idx = scenario
                .route
                .edges
                .iter()
                .position(|e| e == &spec.edge)
                .ok_or_else(|| {
                    Error::ConfigInvalid(format!("vehicle {} is not on the route", spec.id))
                })?;
            vehicles.push(MicroVehicle {
                id: spec.id.clone(),
                route_idx,
                offset_m: spec.position_m,
                lane: spec.lane,
                speed_mps: spec.speed_mps,
            });
        }
        vehicles.sort_by(|a, b| {
            let pa = starts[a.route_idx] + a.offset_m;
            let pb = starts[b.route_idx] + b.offset_m;
            pa.partial_cmp(&pb).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut signals = Vec::with_capacity(scenario.signals.len());
        for (spec_idx, spec) in scenario.signals.iter().enumerate() {
            let route_idx = scenario
                .route
                .edges
                .iter()
                .position(|e| e == &spec.edge)
                .ok_or_else(|| {
                    Error::ConfigInvalid(format!("signal {} is not on the route", spec.id))
                })?;
            signals.push(MicroSignal {
                spec_idx,
                route_idx,
                offset_m: spec.position_m,
                phase_index: 0,
                time_in_phase_s: 0.0,
            });
        }

        let next_inflow_in_s = scenario.inflow.as_ref().map(|i| i.period_s).unwrap_or(0.0);

        Ok(Self {
            scenario: scenario.clone(),
            vehicles,
            signals,
            clock: SimClock::default(),
            spawned: 0,
            next_inflow_in_s,
            departed_last: Vec::new(),
            arrived_last: Vec::new(),
        })
    }

    /// Advance the model by one tick
    fn step(&mut self, tick_s: f64) {
        self.departed_last.clear();
        self.arrived_last.clear();

        // signal plans run on simulation time
        for sig in &mut self.signals {
            let plan = &self.scenario.signals[sig.spec_idx].plan;
            sig.time_in_phase_s += tick_s;
            while sig.time_in_phase_s >= plan[sig.phase_index].duration_s {
                sig.time_in_phase_s -= plan[sig.phase_index].duration_s;
                sig.phase_index = (sig.phase_index + 1) % plan.len();
            }
        }

        let starts = route_starts(&self.scenario);
        let route_len = self.scenario.route_length();
        let closed = self.scenario.route.closed;
        let route_edge_count = self.scenario.route.edges.len();

        let mut lengths = Vec::with_capacity(route_edge_count);
        let mut limits = Vec::with_capacity(route_edge_count);
        for id in &self.scenario.route.edges {
            match self.scenario.edge(id) {
                Some(e) => {
                    lengths.push(e.length_m);
                    limits.push(e.speed_limit_mps);
                }
                None => {
                    lengths.push(1.0);
                    limits.push(DEFAULT_SPEED_LIMIT);
                }
            }
        }

        // sort by route position so index i + 1 is the leader of i
        self.vehicles.sort_by(|a, b| {
            let pa = starts[a.route_idx] + a.offset_m;
            let pb = starts[b.route_idx] + b.offset_m;
            pa.partial_cmp(&pb).unwrap_or(std::cmp::Ordering::Equal)
        });

        let n = self.vehicles.len();
        let positions: Vec<f64> = self
            .vehicles
            .iter()
            .map(|v| starts[v.route_idx] + v.offset_m)
            .collect();

        // stop lines currently showing non-green
        let blocks: Vec<f64> = self
            .signals
            .iter()
            .filter(|s| {
                let plan = &self.scenario.signals[s.spec_idx].plan;
                plan[s.phase_index].color != SignalColor::Green
            })
            .map(|s| starts[s.route_idx] + s.offset_m)
            .collect();

        // pick new speeds against the old positions, then integrate
        let mut new_speeds = Vec::with_capacity(n);
        for i in 0..n {
            let v = &self.vehicles[i];
            let mut bound = f64::INFINITY;

            if i + 1 < n {
                let gap = positions[i + 1] - positions[i] - VEHICLE_LENGTH;
                bound = bound.min(safe_speed(gap, self.vehicles[i + 1].speed_mps));
            } else if closed {
                let gap = positions[0] + route_len - positions[i] - VEHICLE_LENGTH;
                bound = bound.min(safe_speed(gap, self.vehicles[0].speed_mps));
            }

            for &line in &blocks {
                let dist = if line >= positions[i] {
                    line - positions[i]
                } else if closed {
                    line + route_len - positions[i]
                } else {
                    continue;
                };
                bound = bound.min(safe_speed(dist, 0.0));
            }

            let target = limits[v.route_idx].min(bound);
            let accel = ((target - v.speed_mps) / tick_s).clamp(-MAX_DECEL, MAX_ACCEL);
            new_speeds.push((v.speed_mps + accel * tick_s).max(0.0));
        }

        let mut arrived_idx = Vec::new();
        for (i, v) in self.vehicles.iter_mut().enumerate() {
            v.speed_mps = new_speeds[i];
            v.offset_m += v.speed_mps * tick_s;
            while v.offset_m >= lengths[v.route_idx] {
                v.offset_m -= lengths[v.route_idx];
                v.route_idx += 1;
                if v.route_idx >= route_edge_count {
                    if closed {
                        v.route_idx = 0;
                    } else {
                        arrived_idx.push(i);
                        break;
                    }
                }
            }
        }
        for &i in arrived_idx.iter().rev() {
            let v = self.vehicles.remove(i);
            self.arrived_last.push(v.id);
        }

        if let Some(inflow) = self.scenario.inflow.clone() {
            self.next_inflow_in_s -= tick_s;
            if self.next_inflow_in_s <= 0.0 {
                self.next_inflow_in_s += inflow.period_s;
                let under_cap = inflow.max_vehicles.map_or(true, |m| self.spawned < m as u64);
                let entry_clear = !self
                    .vehicles
                    .iter()
                    .any(|v| v.route_idx == 0 && v.offset_m < VEHICLE_LENGTH + MIN_GAP);
                if under_cap && entry_clear {
                    let id = format!("flow_{}", self.spawned);
                    self.spawned += 1;
                    self.vehicles.push(MicroVehicle {
                        id: id.clone(),
                        route_idx: 0,
                        offset_m: 0.0,
                        lane: 0,
                        speed_mps: inflow.depart_speed_mps.min(limits[0]),
                    });
                    self.departed_last.push(id);
                }
            }
        }

        self.clock.advance(tick_s);
    }

    fn frame(&self) -> WorldFrame {
        let vehicles = self
            .vehicles
            .iter()
            .map(|v| VehicleObs {
                id: v.id.clone(),
                edge: self
                    .scenario
                    .route
                    .edges
                    .get(v.route_idx)
                    .cloned()
                    .unwrap_or_default(),
                lane: v.lane,
                position_m: v.offset_m,
                speed_mps: v.speed_mps,
            })
            .collect();
        let signals = self
            .signals
            .iter()
            .map(|s| {
                let spec = &self.scenario.signals[s.spec_idx];
                SignalObs {
                    id: spec.id.clone(),
                    phase_index: s.phase_index,
                    color: spec.plan[s.phase_index].color,
                }
            })
            .collect();
        WorldFrame {
            clock: self.clock,
            vehicles,
            signals,
            departed: self.departed_last.clone(),
            arrived: self.arrived_last.clone(),
        }
    }

    fn all_ids(&self) -> Vec<String> {
        self.vehicles.iter().map(|v| v.id.clone()).collect()
    }
}

fn read_snapshot(path: &Path) -> Result<MicroWorld> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::SnapshotNotFound(path.to_path_buf()))
        }
        Err(e) => return Err(Error::SnapshotInvalid(format!("cannot open snapshot: {}", e))),
    };
    let snapshot: MicroSnapshot = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| Error::SnapshotInvalid(format!("malformed snapshot: {}", e)))?;
    if snapshot.format != SNAPSHOT_FORMAT {
        return Err(Error::SnapshotInvalid(format!(
            "unsupported snapshot format {} (expected {})",
            snapshot.format, SNAPSHOT_FORMAT
        )));
    }
    snapshot
        .world
        .scenario
        .validate()
        .map_err(|e| Error::SnapshotInvalid(format!("snapshot scenario rejected: {}", e)))?;
    Ok(snapshot.world)
}

/// The in-process car-following backend
///
/// Load window is `Anytime`: a snapshot loaded before start is staged and
/// used instead of the scenario, a snapshot loaded while running replaces
/// the live world on the spot. Save window is `WhileRunning`.
pub struct MicroSim {
    config: SimConfig,
    scenario: Scenario,
    world: Option<MicroWorld>,
    /// Snapshot loaded before start, consumed by `start_simulation`
    staged: Option<MicroWorld>,
    phase: KernelPhase,
    clock: SimClock,
    poisoned: bool,
}

impl MicroSim {
    /// Create an unstarted backend over the given scenario
    pub fn new(config: SimConfig, scenario: Scenario) -> Self {
        Self {
            config,
            scenario,
            world: None,
            staged: None,
            phase: KernelPhase::Uninitialized,
            clock: SimClock::default(),
            poisoned: false,
        }
    }

    /// Get the current configuration
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Invalidate the backend handle underneath the kernel
    ///
    /// Test hook standing in for a crashed simulator process: the phase
    /// stays `Running` but every subsequent backend call fails with
    /// `BackendUnavailable` until teardown.
    pub fn poison_handle(&mut self) {
        self.poisoned = true;
    }

    fn live_world(&self) -> Result<&MicroWorld> {
        if self.phase != KernelPhase::Running {
            return Err(Error::InvalidState(format!(
                "backend call requires a running kernel (phase: {})",
                self.phase
            )));
        }
        if self.poisoned {
            return Err(Error::BackendUnavailable("backend handle lost".into()));
        }
        self.world
            .as_ref()
            .ok_or_else(|| Error::BackendUnavailable("backend handle lost".into()))
    }

    fn live_world_mut(&mut self) -> Result<&mut MicroWorld> {
        if self.phase != KernelPhase::Running {
            return Err(Error::InvalidState(format!(
                "backend call requires a running kernel (phase: {})",
                self.phase
            )));
        }
        if self.poisoned {
            return Err(Error::BackendUnavailable("backend handle lost".into()));
        }
        self.world
            .as_mut()
            .ok_or_else(|| Error::BackendUnavailable("backend handle lost".into()))
    }
}

impl SimulationKernel for MicroSim {
    fn name(&self) -> &str {
        "micro"
    }

    fn phase(&self) -> KernelPhase {
        self.phase
    }

    fn clock(&self) -> SimClock {
        self.clock
    }

    fn tick(&self) -> f64 {
        self.config.tick_s
    }

    fn snapshot_windows(&self) -> SnapshotWindows {
        SnapshotWindows {
            load: SnapshotWindow::Anytime,
            save: SnapshotWindow::WhileRunning,
        }
    }

    fn start_simulation(&mut self) -> Result<()> {
        match self.phase {
            KernelPhase::Running => return Err(Error::AlreadyStarted),
            KernelPhase::Stopped => {
                return Err(Error::InvalidState(
                    "kernel was torn down; build a new one".into(),
                ))
            }
            KernelPhase::Uninitialized => {}
        }
        self.config.validate()?;

        let mut world = match self.staged.take() {
            Some(staged) => staged,
            None => {
                self.scenario.validate()?;
                MicroWorld::build(&self.scenario)?
            }
        };
        // everything present at start enters the network on this epoch
        world.departed_last = world.all_ids();
        self.clock = world.clock;

        tracing::info!(
            scenario = %world.scenario.name,
            vehicles = world.vehicles.len(),
            tick_s = self.config.tick_s,
            "micro kernel started"
        );
        self.world = Some(world);
        self.phase = KernelPhase::Running;
        Ok(())
    }

    fn simulation_step(&mut self) -> Result<()> {
        let tick_s = self.config.tick_s;
        self.live_world_mut()?.step(tick_s);
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        self.clock = self.live_world()?.clock;
        Ok(())
    }

    fn load_simulation(&mut self, path: &Path) -> Result<()> {
        if self.phase == KernelPhase::Stopped {
            return Err(Error::InvalidState("load on a stopped kernel".into()));
        }
        if self.phase == KernelPhase::Running && self.poisoned {
            return Err(Error::BackendUnavailable("backend handle lost".into()));
        }
        if !self
            .snapshot_windows()
            .load
            .allows(self.phase, self.clock.step_count)
        {
            return Err(Error::Unsupported(format!(
                "load not permitted in phase {}",
                self.phase
            )));
        }

        let mut world = read_snapshot(path)?;
        tracing::info!(
            path = %path.display(),
            step_count = world.clock.step_count,
            "snapshot loaded"
        );
        match self.phase {
            KernelPhase::Running => {
                world.departed_last = world.all_ids();
                self.clock = world.clock;
                self.world = Some(world);
            }
            _ => {
                self.staged = Some(world);
            }
        }
        Ok(())
    }

    fn save_simulation(&mut self, path: &Path) -> Result<()> {
        let world = self.live_world()?;
        if !self
            .snapshot_windows()
            .save
            .allows(self.phase, self.clock.step_count)
        {
            return Err(Error::Unsupported(format!(
                "save not permitted in phase {}",
                self.phase
            )));
        }

        let snapshot = MicroSnapshot {
            format: SNAPSHOT_FORMAT,
            world: world.clone(),
        };
        let file =
            File::create(path).map_err(|e| Error::WriteFailed(format!("create failed: {}", e)))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &snapshot)
            .map_err(|e| Error::WriteFailed(format!("encode failed: {}", e)))?;
        writer
            .flush()
            .map_err(|e| Error::WriteFailed(format!("flush failed: {}", e)))?;
        tracing::debug!(path = %path.display(), "snapshot written");
        Ok(())
    }

    fn teardown(&mut self) {
        if self.phase == KernelPhase::Stopped {
            return;
        }
        let steps = self
            .world
            .as_ref()
            .map(|w| w.clock.step_count)
            .unwrap_or(self.clock.step_count);
        self.world = None;
        self.staged = None;
        self.phase = KernelPhase::Stopped;
        tracing::info!(steps, "micro kernel torn down");
    }
}

impl TrafficBackend for MicroSim {
    fn world(&self) -> WorldFrame {
        match &self.world {
            Some(w) => w.frame(),
            None => WorldFrame {
                clock: self.clock,
                ..Default::default()
            },
        }
    }

    fn edges(&self) -> Vec<EdgeSpec> {
        match &self.world {
            Some(w) => w.scenario.edges.clone(),
            None => self.scenario.edges.clone(),
        }
    }

    fn set_signal_phase(&mut self, signal_id: &str, phase_index: usize) -> Result<()> {
        let world = self.live_world_mut()?;
        let pos = world
            .signals
            .iter()
            .position(|s| world.scenario.signals[s.spec_idx].id == signal_id)
            .ok_or_else(|| Error::InvalidState(format!("unknown signal id: {}", signal_id)))?;
        let plan_len = world.scenario.signals[world.signals[pos].spec_idx].plan.len();
        if phase_index >= plan_len {
            return Err(Error::InvalidState(format!(
                "phase {} out of range for signal {} ({} phases)",
                phase_index, signal_id, plan_len
            )));
        }
        let sig = &mut world.signals[pos];
        sig.phase_index = phase_index;
        sig.time_in_phase_s = 0.0;
        Ok(())
    }
}

impl Drop for MicroSim {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{InflowSpec, SignalPhase, SignalSpec, VehicleSpec};

    fn three_vehicle_scenario() -> Scenario {
        let mut scenario = Scenario::single_lane(100.0, 0);
        for (i, pos) in [0.0, 10.0, 20.0].iter().enumerate() {
            scenario.vehicles.push(VehicleSpec {
                id: format!("veh_{}", i),
                edge: "main".into(),
                position_m: *pos,
                lane: 0,
                speed_mps: 0.0,
            });
        }
        scenario
    }

    #[test]
    fn test_lifecycle_guards() {
        let mut sim = MicroSim::new(SimConfig::micro(), Scenario::ring(400.0, 4));

        assert!(matches!(
            sim.simulation_step(),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(sim.update(), Err(Error::InvalidState(_))));

        sim.start_simulation().unwrap();
        assert!(matches!(sim.start_simulation(), Err(Error::AlreadyStarted)));

        sim.teardown();
        assert_eq!(sim.phase(), KernelPhase::Stopped);
        assert!(matches!(
            sim.simulation_step(),
            Err(Error::InvalidState(_))
        ));

        // teardown is idempotent
        sim.teardown();
        assert_eq!(sim.phase(), KernelPhase::Stopped);
    }

    #[test]
    fn test_update_folds_clock() {
        let mut sim = MicroSim::new(SimConfig::micro(), Scenario::ring(400.0, 4));
        sim.start_simulation().unwrap();

        sim.simulation_step().unwrap();
        sim.simulation_step().unwrap();
        // the cached clock only moves on update
        assert_eq!(sim.step_count(), 0);

        sim.update().unwrap();
        assert_eq!(sim.step_count(), 2);
        assert!((sim.sim_time() - 0.2).abs() < 1e-12);

        // update with no intervening step is a no-op
        sim.update().unwrap();
        assert_eq!(sim.step_count(), 2);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mid_episode.json");
        let scenario = three_vehicle_scenario();

        let mut a = MicroSim::new(SimConfig::micro(), scenario.clone());
        a.start_simulation().unwrap();
        for _ in 0..5 {
            a.simulation_step().unwrap();
        }
        a.update().unwrap();
        a.save_simulation(&path).unwrap();
        let saved = a.world();

        let mut b = MicroSim::new(SimConfig::micro(), scenario);
        b.start_simulation().unwrap();
        b.load_simulation(&path).unwrap();
        b.update().unwrap();
        let restored = b.world();

        assert_eq!(restored.clock, saved.clock);
        assert_eq!(restored.vehicles.len(), saved.vehicles.len());
        for (r, s) in restored.vehicles.iter().zip(saved.vehicles.iter()) {
            assert_eq!(r.id, s.id);
            assert_eq!(r.position_m, s.position_m);
            assert_eq!(r.speed_mps, s.speed_mps);
        }
    }

    #[test]
    fn test_load_staged_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume.json");
        let scenario = Scenario::ring(400.0, 8);

        let mut a = MicroSim::new(SimConfig::micro(), scenario.clone());
        a.start_simulation().unwrap();
        for _ in 0..10 {
            a.simulation_step().unwrap();
        }
        a.save_simulation(&path).unwrap();

        let mut b = MicroSim::new(SimConfig::micro(), scenario);
        b.load_simulation(&path).unwrap();
        assert_eq!(b.phase(), KernelPhase::Uninitialized);

        b.start_simulation().unwrap();
        b.update().unwrap();
        assert_eq!(b.step_count(), 10);
        assert!((b.sim_time() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_load_missing_leaves_state_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut sim = MicroSim::new(SimConfig::micro(), Scenario::ring(400.0, 6));
        sim.start_simulation().unwrap();
        for _ in 0..3 {
            sim.simulation_step().unwrap();
        }
        sim.update().unwrap();
        let before = sim.world();

        let err = sim.load_simulation(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, Error::SnapshotNotFound(_)));

        let after = sim.world();
        assert_eq!(after.clock, before.clock);
        assert_eq!(after.vehicles.len(), before.vehicles.len());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.json");
        std::fs::write(&path, "definitely not a snapshot").unwrap();

        let mut sim = MicroSim::new(SimConfig::micro(), Scenario::ring(400.0, 4));
        sim.start_simulation().unwrap();
        assert!(matches!(
            sim.load_simulation(&path),
            Err(Error::SnapshotInvalid(_))
        ));
    }

    #[test]
    fn test_load_rejects_unknown_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("good.json");
        let hacked = dir.path().join("future.json");

        let mut sim = MicroSim::new(SimConfig::micro(), Scenario::ring(400.0, 4));
        sim.start_simulation().unwrap();
        sim.save_simulation(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&hacked, text.replacen("\"format\": 1", "\"format\": 99", 1)).unwrap();

        assert!(matches!(
            sim.load_simulation(&hacked),
            Err(Error::SnapshotInvalid(_))
        ));
    }

    #[test]
    fn test_poisoned_handle_fails_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut sim = MicroSim::new(SimConfig::micro(), Scenario::ring(400.0, 4));
        sim.start_simulation().unwrap();
        sim.simulation_step().unwrap();

        sim.poison_handle();
        assert_eq!(sim.phase(), KernelPhase::Running);
        assert!(matches!(
            sim.simulation_step(),
            Err(Error::BackendUnavailable(_))
        ));
        assert!(matches!(sim.update(), Err(Error::BackendUnavailable(_))));
        assert!(matches!(
            sim.save_simulation(&dir.path().join("x.json")),
            Err(Error::BackendUnavailable(_))
        ));

        sim.teardown();
        assert_eq!(sim.phase(), KernelPhase::Stopped);
    }

    #[test]
    fn test_save_does_not_disturb_simulation() {
        let dir = tempfile::tempdir().unwrap();
        let mut sim = MicroSim::new(SimConfig::micro(), Scenario::ring(400.0, 8));
        sim.start_simulation().unwrap();
        for _ in 0..4 {
            sim.simulation_step().unwrap();
        }
        sim.update().unwrap();

        let before = sim.world();
        sim.save_simulation(&dir.path().join("snap.json")).unwrap();
        let after = sim.world();

        assert_eq!(after.clock, before.clock);
        for (a, b) in after.vehicles.iter().zip(before.vehicles.iter()) {
            assert_eq!(a.position_m, b.position_m);
            assert_eq!(a.speed_mps, b.speed_mps);
        }
    }

    #[test]
    fn test_ring_reaches_equilibrium() {
        // 22 vehicles on a 400m ring: equilibrium speed follows from the
        // spacing rule, gap = MIN_GAP + v * HEADWAY_S
        let mut sim = MicroSim::new(SimConfig::micro(), Scenario::ring(400.0, 22));
        sim.start_simulation().unwrap();
        for _ in 0..1000 {
            sim.simulation_step().unwrap();
        }
        let frame = sim.world();
        assert_eq!(frame.vehicles.len(), 22);

        let spacing = 400.0 / 22.0;
        let expected = spacing - VEHICLE_LENGTH - MIN_GAP;
        for v in &frame.vehicles {
            assert!(
                (v.speed_mps - expected).abs() < 1.0,
                "vehicle {} at {} m/s, expected about {}",
                v.id,
                v.speed_mps,
                expected
            );
        }
    }

    #[test]
    fn test_open_corridor_drains() {
        let mut sim = MicroSim::new(SimConfig::micro(), Scenario::single_lane(50.0, 2));
        sim.start_simulation().unwrap();

        let mut arrived = Vec::new();
        for _ in 0..200 {
            sim.simulation_step().unwrap();
            arrived.extend(sim.world().arrived);
        }
        assert_eq!(arrived.len(), 2);
        assert!(sim.world().vehicles.is_empty());
    }

    #[test]
    fn test_inflow_spawns_periodically() {
        // tick of 0.25 divides the period exactly, so the injection
        // schedule is not at the mercy of accumulated rounding
        let scenario = Scenario::single_lane(500.0, 0).with_inflow(InflowSpec {
            period_s: 1.0,
            depart_speed_mps: 10.0,
            max_vehicles: None,
        });
        let mut sim = MicroSim::new(SimConfig::micro().with_tick(0.25), scenario);
        sim.start_simulation().unwrap();

        let mut departed = 0;
        for _ in 0..40 {
            sim.simulation_step().unwrap();
            departed += sim.world().departed.len();
        }
        // one injection per second over 10 seconds
        assert_eq!(departed, 10);
        assert_eq!(sim.world().vehicles.len(), 10);
    }

    #[test]
    fn test_inflow_respects_cap() {
        let scenario = Scenario::single_lane(500.0, 0).with_inflow(InflowSpec {
            period_s: 1.0,
            depart_speed_mps: 10.0,
            max_vehicles: Some(3),
        });
        let mut sim = MicroSim::new(SimConfig::micro().with_tick(0.25), scenario);
        sim.start_simulation().unwrap();
        for _ in 0..40 {
            sim.simulation_step().unwrap();
        }
        assert_eq!(sim.world().vehicles.len(), 3);
    }

    #[test]
    fn test_red_signal_holds_vehicle() {
        let mut scenario = Scenario::single_lane(200.0, 0).with_signal(SignalSpec {
            id: "sig_0".into(),
            edge: "main".into(),
            position_m: 100.0,
            plan: vec![SignalPhase::new(SignalColor::Red, 1e6)],
        });
        scenario.vehicles.push(VehicleSpec {
            id: "probe".into(),
            edge: "main".into(),
            position_m: 0.0,
            lane: 0,
            speed_mps: 0.0,
        });

        let mut sim = MicroSim::new(SimConfig::micro(), scenario);
        sim.start_simulation().unwrap();
        for _ in 0..400 {
            sim.simulation_step().unwrap();
        }

        let frame = sim.world();
        let probe = &frame.vehicles[0];
        assert!(probe.speed_mps < 0.2, "still moving at {}", probe.speed_mps);
        assert!(
            probe.position_m < 100.0 && probe.position_m > 50.0,
            "stopped at {}",
            probe.position_m
        );
    }

    #[test]
    fn test_signal_phase_advances_with_time() {
        let scenario = Scenario::single_lane(200.0, 1).with_signal(SignalSpec {
            id: "sig_0".into(),
            edge: "main".into(),
            position_m: 150.0,
            plan: vec![
                SignalPhase::new(SignalColor::Green, 1.0),
                SignalPhase::new(SignalColor::Red, 1.0),
            ],
        });
        let mut sim = MicroSim::new(SimConfig::micro(), scenario);
        sim.start_simulation().unwrap();

        assert_eq!(sim.world().signals[0].color, SignalColor::Green);
        // 1.5s of simulation time lands in the middle of the red phase
        for _ in 0..15 {
            sim.simulation_step().unwrap();
        }
        assert_eq!(sim.world().signals[0].color, SignalColor::Red);
    }

    #[test]
    fn test_set_signal_phase_validation() {
        let scenario = Scenario::single_lane(200.0, 1).with_signal(SignalSpec {
            id: "sig_0".into(),
            edge: "main".into(),
            position_m: 150.0,
            plan: vec![
                SignalPhase::new(SignalColor::Green, 30.0),
                SignalPhase::new(SignalColor::Red, 30.0),
            ],
        });
        let mut sim = MicroSim::new(SimConfig::micro(), scenario);
        sim.start_simulation().unwrap();

        sim.set_signal_phase("sig_0", 1).unwrap();
        assert_eq!(sim.world().signals[0].color, SignalColor::Red);
        assert_eq!(sim.world().signals[0].phase_index, 1);

        assert!(matches!(
            sim.set_signal_phase("ghost", 0),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            sim.set_signal_phase("sig_0", 7),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_start_rejects_invalid_scenario() {
        let mut scenario = Scenario::single_lane(100.0, 1);
        scenario.vehicles[0].position_m = 500.0;
        let mut sim = MicroSim::new(SimConfig::micro(), scenario);
        assert!(matches!(
            sim.start_simulation(),
            Err(Error::ConfigInvalid(_))
        ));
        assert_eq!(sim.phase(), KernelPhase::Uninitialized);
    }
}
