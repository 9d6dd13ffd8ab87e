//! Vehicle query surface
//!
//! Rebuilt from the world frame after every step. Ids keep a stable
//! order across frames (survivors first, in their previous order, then
//! new arrivals), so observation vectors built from `ids()` stay aligned
//! between consecutive steps.

use std::collections::{HashMap, VecDeque};

use crate::kernel::{VehicleObs, WorldFrame};

/// How far back the departure/arrival rate windows can reach, in seconds
const RATE_HISTORY_S: f64 = 600.0;

/// Per-vehicle state and network-level flow counters
#[derive(Debug)]
pub struct VehicleKernel {
    tick_s: f64,
    obs: Vec<VehicleObs>,
    index: HashMap<String, usize>,
    by_edge: HashMap<String, Vec<String>>,
    num_departed: u64,
    num_arrived: u64,
    departed_per_tick: VecDeque<u32>,
    arrived_per_tick: VecDeque<u32>,
    history_cap: usize,
}

fn rate_per_hour(history: &VecDeque<u32>, tick_s: f64, span_s: f64) -> f64 {
    if span_s <= 0.0 || tick_s <= 0.0 {
        return 0.0;
    }
    let want = (span_s / tick_s).ceil() as usize;
    let ticks = want.min(history.len());
    if ticks == 0 {
        return 0.0;
    }
    let total: u64 = history.iter().rev().take(ticks).map(|&c| c as u64).sum();
    total as f64 * 3600.0 / (ticks as f64 * tick_s)
}

impl VehicleKernel {
    pub fn new(tick_s: f64) -> Self {
        let history_cap = if tick_s > 0.0 {
            (RATE_HISTORY_S / tick_s).ceil() as usize
        } else {
            1
        };
        Self {
            tick_s,
            obs: Vec::new(),
            index: HashMap::new(),
            by_edge: HashMap::new(),
            num_departed: 0,
            num_arrived: 0,
            departed_per_tick: VecDeque::new(),
            arrived_per_tick: VecDeque::new(),
            history_cap: history_cap.max(1),
        }
    }

    /// Absorb one world frame
    ///
    /// `reset` starts a fresh observation epoch: ordering, totals, and
    /// rate history are discarded first. The master passes `reset` after
    /// start and after a snapshot load.
    pub fn update(&mut self, frame: &WorldFrame, reset: bool) {
        if reset {
            self.obs.clear();
            self.index.clear();
            self.num_departed = 0;
            self.num_arrived = 0;
            self.departed_per_tick.clear();
            self.arrived_per_tick.clear();
        }

        let incoming: HashMap<&str, &VehicleObs> =
            frame.vehicles.iter().map(|v| (v.id.as_str(), v)).collect();

        let mut obs = Vec::with_capacity(frame.vehicles.len());
        let mut index = HashMap::with_capacity(frame.vehicles.len());
        for old in &self.obs {
            if let Some(v) = incoming.get(old.id.as_str()) {
                index.insert(old.id.clone(), obs.len());
                obs.push((*v).clone());
            }
        }
        for v in &frame.vehicles {
            if !index.contains_key(&v.id) {
                index.insert(v.id.clone(), obs.len());
                obs.push(v.clone());
            }
        }
        self.obs = obs;
        self.index = index;

        self.by_edge.clear();
        for v in &self.obs {
            self.by_edge
                .entry(v.edge.clone())
                .or_default()
                .push(v.id.clone());
        }

        self.num_departed += frame.departed.len() as u64;
        self.num_arrived += frame.arrived.len() as u64;
        self.departed_per_tick.push_back(frame.departed.len() as u32);
        self.arrived_per_tick.push_back(frame.arrived.len() as u32);
        while self.departed_per_tick.len() > self.history_cap {
            self.departed_per_tick.pop_front();
        }
        while self.arrived_per_tick.len() > self.history_cap {
            self.arrived_per_tick.pop_front();
        }
    }

    /// Ids of all vehicles currently in the network, in stable order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.obs.iter().map(|v| v.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.obs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.obs.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Full observation for one vehicle
    pub fn get(&self, id: &str) -> Option<&VehicleObs> {
        self.index.get(id).map(|&i| &self.obs[i])
    }

    pub fn speed(&self, id: &str) -> Option<f64> {
        self.get(id).map(|v| v.speed_mps)
    }

    pub fn position(&self, id: &str) -> Option<f64> {
        self.get(id).map(|v| v.position_m)
    }

    pub fn edge(&self, id: &str) -> Option<&str> {
        self.get(id).map(|v| v.edge.as_str())
    }

    pub fn lane(&self, id: &str) -> Option<u32> {
        self.get(id).map(|v| v.lane)
    }

    /// Ids on the given edge, in stable order; empty for unknown edges
    pub fn ids_by_edge(&self, edge: &str) -> &[String] {
        self.by_edge.get(edge).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Mean speed over all vehicles, `None` when the network is empty
    pub fn mean_speed(&self) -> Option<f64> {
        if self.obs.is_empty() {
            return None;
        }
        let sum: f64 = self.obs.iter().map(|v| v.speed_mps).sum();
        Some(sum / self.obs.len() as f64)
    }

    /// Vehicles that entered since the epoch began
    pub fn num_departed(&self) -> u64 {
        self.num_departed
    }

    /// Vehicles that left since the epoch began
    pub fn num_arrived(&self) -> u64 {
        self.num_arrived
    }

    /// Entry rate over the trailing `span_s` seconds, in vehicles/hour
    pub fn inflow_rate(&self, span_s: f64) -> f64 {
        rate_per_hour(&self.departed_per_tick, self.tick_s, span_s)
    }

    /// Exit rate over the trailing `span_s` seconds, in vehicles/hour
    pub fn outflow_rate(&self, span_s: f64) -> f64 {
        rate_per_hour(&self.arrived_per_tick, self.tick_s, span_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::SimClock;
    use approx::assert_relative_eq;

    fn obs(id: &str, edge: &str, position_m: f64, speed_mps: f64) -> VehicleObs {
        VehicleObs {
            id: id.into(),
            edge: edge.into(),
            lane: 0,
            position_m,
            speed_mps,
        }
    }

    fn frame(vehicles: Vec<VehicleObs>, departed: &[&str], arrived: &[&str]) -> WorldFrame {
        WorldFrame {
            clock: SimClock::default(),
            vehicles,
            signals: Vec::new(),
            departed: departed.iter().map(|s| s.to_string()).collect(),
            arrived: arrived.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_queries() {
        let mut kernel = VehicleKernel::new(0.1);
        kernel.update(
            &frame(
                vec![obs("a", "e1", 10.0, 5.0), obs("b", "e1", 30.0, 7.0), obs("c", "e2", 2.0, 0.0)],
                &["a", "b", "c"],
                &[],
            ),
            true,
        );

        assert_eq!(kernel.len(), 3);
        assert_eq!(kernel.speed("a"), Some(5.0));
        assert_eq!(kernel.position("b"), Some(30.0));
        assert_eq!(kernel.edge("c"), Some("e2"));
        assert_eq!(kernel.lane("a"), Some(0));
        assert_eq!(kernel.speed("ghost"), None);
        assert_eq!(kernel.ids_by_edge("e1"), &["a".to_string(), "b".to_string()]);
        assert!(kernel.ids_by_edge("e9").is_empty());
        assert_relative_eq!(kernel.mean_speed().unwrap(), 4.0);
    }

    #[test]
    fn test_id_order_is_stable() {
        let mut kernel = VehicleKernel::new(0.1);
        kernel.update(
            &frame(
                vec![obs("a", "e1", 0.0, 0.0), obs("b", "e1", 5.0, 0.0), obs("c", "e1", 9.0, 0.0)],
                &["a", "b", "c"],
                &[],
            ),
            true,
        );

        // b leaves, d joins; the frame reports vehicles in its own order
        kernel.update(
            &frame(
                vec![obs("d", "e1", 1.0, 0.0), obs("c", "e1", 10.0, 1.0), obs("a", "e1", 0.5, 0.5)],
                &["d"],
                &["b"],
            ),
            false,
        );

        let ids: Vec<&str> = kernel.ids().collect();
        assert_eq!(ids, vec!["a", "c", "d"]);
        assert!(!kernel.contains("b"));
    }

    #[test]
    fn test_flow_counters_and_rates() {
        let mut kernel = VehicleKernel::new(0.1);
        kernel.update(&frame(vec![], &[], &[]), true);
        for _ in 0..10 {
            kernel.update(&frame(vec![], &["x"], &[]), false);
        }

        assert_eq!(kernel.num_departed(), 10);
        assert_eq!(kernel.num_arrived(), 0);
        // 10 entries over the trailing second
        assert_relative_eq!(kernel.inflow_rate(1.0), 36_000.0);
        assert_relative_eq!(kernel.outflow_rate(1.0), 0.0);
    }

    #[test]
    fn test_rate_window_is_trailing() {
        let mut kernel = VehicleKernel::new(1.0);
        kernel.update(&frame(vec![], &[], &[]), true);
        // burst of 5, then 5 quiet ticks
        for _ in 0..5 {
            kernel.update(&frame(vec![], &["x"], &[]), false);
        }
        for _ in 0..5 {
            kernel.update(&frame(vec![], &[], &[]), false);
        }

        assert_relative_eq!(kernel.inflow_rate(5.0), 0.0);
        // the 11-tick window sees the whole burst
        assert_relative_eq!(kernel.inflow_rate(11.0), 5.0 * 3600.0 / 11.0);
    }

    #[test]
    fn test_reset_clears_epoch() {
        let mut kernel = VehicleKernel::new(0.1);
        kernel.update(&frame(vec![obs("a", "e1", 0.0, 1.0)], &["a"], &[]), true);
        assert_eq!(kernel.num_departed(), 1);

        kernel.update(&frame(vec![obs("z", "e1", 0.0, 1.0)], &["z"], &[]), true);
        assert_eq!(kernel.num_departed(), 1);
        let ids: Vec<&str> = kernel.ids().collect();
        assert_eq!(ids, vec!["z"]);
    }
}
