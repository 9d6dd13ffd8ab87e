//! Declarative scenario model
//!
//! A [`Scenario`] describes everything a backend needs to build a world:
//! edges, the route over them, seeded vehicles, signal plans, and an
//! optional inflow. Scenarios are plain data and serialize into snapshots,
//! so a restored simulation carries its own geometry.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default speed limit for preset scenarios, in m/s
pub const DEFAULT_SPEED_LIMIT: f64 = 30.0;

/// A directed road segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    /// Edge id, unique within the scenario
    pub id: String,
    /// Length in meters
    pub length_m: f64,
    /// Speed limit in m/s
    pub speed_limit_mps: f64,
    /// Number of lanes
    pub lanes: u32,
}

/// The single route vehicles follow, as an ordered list of edge ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSpec {
    /// Edge ids in travel order
    pub edges: Vec<String>,
    /// Whether the last edge feeds back into the first (ring road)
    pub closed: bool,
}

/// Color shown by a signal head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalColor {
    Green,
    Yellow,
    Red,
}

impl std::fmt::Display for SignalColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Green => write!(f, "green"),
            Self::Yellow => write!(f, "yellow"),
            Self::Red => write!(f, "red"),
        }
    }
}

/// One phase of a signal plan
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalPhase {
    /// Color shown during the phase
    pub color: SignalColor,
    /// Phase duration in seconds
    pub duration_s: f64,
}

impl SignalPhase {
    pub fn new(color: SignalColor, duration_s: f64) -> Self {
        Self { color, duration_s }
    }
}

/// A signal head with a cyclic phase plan
///
/// The head sits at a stop line on one edge of the route. Vehicles treat a
/// non-green head ahead of them as a stationary obstacle at the stop line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSpec {
    /// Signal id, unique within the scenario
    pub id: String,
    /// Edge the stop line is on
    pub edge: String,
    /// Stop line position along the edge, in meters
    pub position_m: f64,
    /// Cyclic phase plan; the plan starts at index 0
    pub plan: Vec<SignalPhase>,
}

/// A vehicle present when the simulation starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleSpec {
    /// Vehicle id, unique within the scenario
    pub id: String,
    /// Edge the vehicle starts on
    pub edge: String,
    /// Start position along the edge, in meters
    pub position_m: f64,
    /// Lane index
    pub lane: u32,
    /// Initial speed in m/s
    pub speed_mps: f64,
}

/// Periodic demand at the route entry
///
/// A vehicle is injected at the start of the route every `period_s`
/// seconds of simulation time, provided the entry is clear. A blocked
/// entry drops that slot rather than queueing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InflowSpec {
    /// Seconds between injection attempts
    pub period_s: f64,
    /// Speed injected vehicles enter with, in m/s
    pub depart_speed_mps: f64,
    /// Stop injecting after this many vehicles, if set
    pub max_vehicles: Option<u32>,
}

/// A complete scenario: network, route, demand, signals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name for logs
    pub name: String,
    /// All edges in the network
    pub edges: Vec<EdgeSpec>,
    /// The route vehicles follow
    pub route: RouteSpec,
    /// Vehicles present at start
    pub vehicles: Vec<VehicleSpec>,
    /// Signal heads
    pub signals: Vec<SignalSpec>,
    /// Optional periodic inflow at the route entry
    pub inflow: Option<InflowSpec>,
}

impl Scenario {
    /// A single open edge with `num_vehicles` spread over its first half
    ///
    /// Vehicles drain out at the far end and count as arrived. Pair with
    /// an inflow to keep the corridor populated.
    pub fn single_lane(length_m: f64, num_vehicles: u32) -> Self {
        let mut vehicles = Vec::with_capacity(num_vehicles as usize);
        // leave the second half empty so the platoon has room to run
        let spacing = (length_m / 2.0) / (num_vehicles.max(1) as f64);
        for i in 0..num_vehicles {
            vehicles.push(VehicleSpec {
                id: format!("veh_{}", i),
                edge: "main".into(),
                position_m: i as f64 * spacing,
                lane: 0,
                speed_mps: 0.0,
            });
        }
        Self {
            name: "single_lane".into(),
            edges: vec![EdgeSpec {
                id: "main".into(),
                length_m,
                speed_limit_mps: DEFAULT_SPEED_LIMIT,
                lanes: 1,
            }],
            route: RouteSpec {
                edges: vec!["main".into()],
                closed: false,
            },
            vehicles,
            signals: Vec::new(),
            inflow: None,
        }
    }

    /// A closed ring of four equal edges with evenly spaced vehicles
    pub fn ring(circumference_m: f64, num_vehicles: u32) -> Self {
        let edge_len = circumference_m / 4.0;
        let edges: Vec<EdgeSpec> = (0..4)
            .map(|i| EdgeSpec {
                id: format!("ring_{}", i),
                length_m: edge_len,
                speed_limit_mps: DEFAULT_SPEED_LIMIT,
                lanes: 1,
            })
            .collect();
        let route = RouteSpec {
            edges: edges.iter().map(|e| e.id.clone()).collect(),
            closed: true,
        };

        let mut vehicles = Vec::with_capacity(num_vehicles as usize);
        let spacing = circumference_m / (num_vehicles.max(1) as f64);
        for i in 0..num_vehicles {
            let route_pos = i as f64 * spacing;
            let edge_idx = ((route_pos / edge_len) as usize).min(3);
            vehicles.push(VehicleSpec {
                id: format!("veh_{}", i),
                edge: format!("ring_{}", edge_idx),
                position_m: route_pos - edge_idx as f64 * edge_len,
                lane: 0,
                speed_mps: 0.0,
            });
        }

        Self {
            name: "ring".into(),
            edges,
            route,
            vehicles,
            signals: Vec::new(),
            inflow: None,
        }
    }

    /// Set the scenario name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Apply one speed limit to every edge
    pub fn with_speed_limit(mut self, limit_mps: f64) -> Self {
        for edge in &mut self.edges {
            edge.speed_limit_mps = limit_mps;
        }
        self
    }

    /// Add a signal head
    pub fn with_signal(mut self, signal: SignalSpec) -> Self {
        self.signals.push(signal);
        self
    }

    /// Add a periodic inflow at the route entry
    pub fn with_inflow(mut self, inflow: InflowSpec) -> Self {
        self.inflow = Some(inflow);
        self
    }

    /// Perturb start positions with seeded uniform noise
    ///
    /// The same seed always yields the same placement. Positions are
    /// clamped to their edge, so jitter never pushes a vehicle off the
    /// network.
    pub fn with_placement_jitter(mut self, seed: u64, max_offset_m: f64) -> Self {
        if max_offset_m <= 0.0 {
            return self;
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        for vehicle in &mut self.vehicles {
            let len = self
                .edges
                .iter()
                .find(|e| e.id == vehicle.edge)
                .map(|e| e.length_m)
                .unwrap_or(f64::MAX);
            let offset: f64 = rng.gen_range(-max_offset_m..max_offset_m);
            vehicle.position_m = (vehicle.position_m + offset).clamp(0.0, len);
        }
        self
    }

    /// Look up an edge by id
    pub fn edge(&self, id: &str) -> Option<&EdgeSpec> {
        self.edges.iter().find(|e| e.id == id)
    }

    /// Total length of the route in meters
    pub fn route_length(&self) -> f64 {
        self.route
            .edges
            .iter()
            .filter_map(|id| self.edge(id))
            .map(|e| e.length_m)
            .sum()
    }

    /// Check internal consistency
    ///
    /// Every reference must resolve and every quantity must be physical;
    /// the first violation is reported as `ConfigInvalid`.
    pub fn validate(&self) -> Result<()> {
        if self.edges.is_empty() {
            return Err(Error::ConfigInvalid("scenario has no edges".into()));
        }
        let mut edge_ids = std::collections::HashSet::new();
        for edge in &self.edges {
            if edge.id.is_empty() {
                return Err(Error::ConfigInvalid("edge with empty id".into()));
            }
            if !edge_ids.insert(edge.id.as_str()) {
                return Err(Error::ConfigInvalid(format!("duplicate edge id: {}", edge.id)));
            }
            if !(edge.length_m.is_finite() && edge.length_m > 0.0) {
                return Err(Error::ConfigInvalid(format!(
                    "edge {} has non-positive length {}",
                    edge.id, edge.length_m
                )));
            }
            if !(edge.speed_limit_mps.is_finite() && edge.speed_limit_mps > 0.0) {
                return Err(Error::ConfigInvalid(format!(
                    "edge {} has non-positive speed limit {}",
                    edge.id, edge.speed_limit_mps
                )));
            }
            if edge.lanes == 0 {
                return Err(Error::ConfigInvalid(format!("edge {} has zero lanes", edge.id)));
            }
        }

        if self.route.edges.is_empty() {
            return Err(Error::ConfigInvalid("route is empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for id in &self.route.edges {
            if self.edge(id).is_none() {
                return Err(Error::ConfigInvalid(format!("route references unknown edge: {}", id)));
            }
            if !seen.insert(id.as_str()) {
                return Err(Error::ConfigInvalid(format!("route repeats edge: {}", id)));
            }
        }

        let mut vehicle_ids = std::collections::HashSet::new();
        for vehicle in &self.vehicles {
            if !vehicle_ids.insert(vehicle.id.as_str()) {
                return Err(Error::ConfigInvalid(format!(
                    "duplicate vehicle id: {}",
                    vehicle.id
                )));
            }
            if !self.route.edges.iter().any(|e| e == &vehicle.edge) {
                return Err(Error::ConfigInvalid(format!(
                    "vehicle {} starts on edge {} which is not on the route",
                    vehicle.id, vehicle.edge
                )));
            }
            let edge = self.edge(&vehicle.edge).ok_or_else(|| {
                Error::ConfigInvalid(format!("vehicle {} references unknown edge", vehicle.id))
            })?;
            if !(0.0..=edge.length_m).contains(&vehicle.position_m) {
                return Err(Error::ConfigInvalid(format!(
                    "vehicle {} at {}m is outside edge {} (length {}m)",
                    vehicle.id, vehicle.position_m, edge.id, edge.length_m
                )));
            }
            if vehicle.lane >= edge.lanes {
                return Err(Error::ConfigInvalid(format!(
                    "vehicle {} on lane {} but edge {} has {} lanes",
                    vehicle.id, vehicle.lane, edge.id, edge.lanes
                )));
            }
            if !(vehicle.speed_mps.is_finite() && vehicle.speed_mps >= 0.0) {
                return Err(Error::ConfigInvalid(format!(
                    "vehicle {} has invalid speed {}",
                    vehicle.id, vehicle.speed_mps
                )));
            }
        }

        let mut signal_ids = std::collections::HashSet::new();
        for signal in &self.signals {
            if !signal_ids.insert(signal.id.as_str()) {
                return Err(Error::ConfigInvalid(format!(
                    "duplicate signal id: {}",
                    signal.id
                )));
            }
            if !self.route.edges.iter().any(|e| e == &signal.edge) {
                return Err(Error::ConfigInvalid(format!(
                    "signal {} is on edge {} which is not on the route",
                    signal.id, signal.edge
                )));
            }
            let edge = self.edge(&signal.edge).ok_or_else(|| {
                Error::ConfigInvalid(format!("signal {} references unknown edge", signal.id))
            })?;
            if !(0.0..=edge.length_m).contains(&signal.position_m) {
                return Err(Error::ConfigInvalid(format!(
                    "signal {} at {}m is outside edge {} (length {}m)",
                    signal.id, signal.position_m, edge.id, edge.length_m
                )));
            }
            if signal.plan.is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "signal {} has an empty phase plan",
                    signal.id
                )));
            }
            for (i, phase) in signal.plan.iter().enumerate() {
                if !(phase.duration_s.is_finite() && phase.duration_s > 0.0) {
                    return Err(Error::ConfigInvalid(format!(
                        "signal {} phase {} has non-positive duration {}",
                        signal.id, i, phase.duration_s
                    )));
                }
            }
        }

        if let Some(inflow) = &self.inflow {
            if !(inflow.period_s.is_finite() && inflow.period_s > 0.0) {
                return Err(Error::ConfigInvalid(format!(
                    "inflow period must be positive, got {}",
                    inflow.period_s
                )));
            }
            if !(inflow.depart_speed_mps.is_finite() && inflow.depart_speed_mps >= 0.0) {
                return Err(Error::ConfigInvalid(format!(
                    "inflow depart speed must be non-negative, got {}",
                    inflow.depart_speed_mps
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        Scenario::ring(400.0, 22).validate().unwrap();
        Scenario::single_lane(500.0, 10).validate().unwrap();
    }

    #[test]
    fn test_ring_positions_cover_circumference() {
        let scenario = Scenario::ring(400.0, 8);
        assert_eq!(scenario.route_length(), 400.0);
        assert_eq!(scenario.vehicles.len(), 8);

        // even spacing: consecutive route positions differ by C / n
        let edge_len = 100.0;
        let route_pos: Vec<f64> = scenario
            .vehicles
            .iter()
            .map(|v| {
                let idx = scenario
                    .route
                    .edges
                    .iter()
                    .position(|e| e == &v.edge)
                    .unwrap();
                idx as f64 * edge_len + v.position_m
            })
            .collect();
        for pair in route_pos.windows(2) {
            assert!((pair[1] - pair[0] - 50.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_vehicle_off_edge_rejected() {
        let mut scenario = Scenario::single_lane(100.0, 1);
        scenario.vehicles[0].position_m = 150.0;
        let err = scenario.validate().unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn test_route_unknown_edge_rejected() {
        let mut scenario = Scenario::single_lane(100.0, 1);
        scenario.route.edges.push("ghost".into());
        assert!(matches!(
            scenario.validate(),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_duplicate_vehicle_id_rejected() {
        let mut scenario = Scenario::single_lane(100.0, 2);
        scenario.vehicles[1].id = scenario.vehicles[0].id.clone();
        assert!(matches!(
            scenario.validate(),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_empty_signal_plan_rejected() {
        let scenario = Scenario::single_lane(100.0, 1).with_signal(SignalSpec {
            id: "sig_0".into(),
            edge: "main".into(),
            position_m: 80.0,
            plan: Vec::new(),
        });
        assert!(matches!(
            scenario.validate(),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_jitter_is_seeded() {
        let base = Scenario::ring(400.0, 10);
        let a = base.clone().with_placement_jitter(7, 2.0);
        let b = base.clone().with_placement_jitter(7, 2.0);
        let c = base.clone().with_placement_jitter(8, 2.0);

        let pos = |s: &Scenario| s.vehicles.iter().map(|v| v.position_m).collect::<Vec<_>>();
        assert_eq!(pos(&a), pos(&b));
        assert_ne!(pos(&a), pos(&c));
        a.validate().unwrap();
    }

    #[test]
    fn test_jitter_stays_on_edge() {
        let scenario = Scenario::single_lane(100.0, 20).with_placement_jitter(3, 50.0);
        for v in &scenario.vehicles {
            assert!((0.0..=100.0).contains(&v.position_m));
        }
    }
}
