//! Master kernel
//!
//! Owns the simulation backend and keeps the sibling kernels (vehicle,
//! network, signal) in sync with it. Agent code talks to the siblings;
//! only the master touches the backend, so one step produces exactly
//! one frame absorption and queued signal commands are flushed at a
//! well-defined point.

use std::path::Path;

use crate::kernel::{
    KernelPhase, NetworkKernel, SignalKernel, SimClock, TrafficBackend, VehicleKernel, WorldFrame,
};
use crate::{Error, Result};

/// Backend plus the query kernels derived from its frames
///
/// The step cycle is: flush queued signal commands, advance the
/// backend one tick, absorb the new frame into the vehicle and signal
/// kernels. `refresh` re-syncs the cached clock without advancing.
pub struct MasterKernel<B: TrafficBackend> {
    sim: B,
    vehicle: VehicleKernel,
    network: NetworkKernel,
    signal: SignalKernel,
    last_step: Option<u64>,
}

impl<B: TrafficBackend> MasterKernel<B> {
    pub fn new(sim: B) -> Self {
        let vehicle = VehicleKernel::new(sim.tick());
        Self {
            sim,
            vehicle,
            network: NetworkKernel::default(),
            signal: SignalKernel::default(),
            last_step: None,
        }
    }

    /// Start the backend and build the initial view
    pub fn start(&mut self) -> Result<()> {
        self.sim.start_simulation()?;
        self.network.rebuild(self.sim.edges());
        self.absorb_frame(true);
        Ok(())
    }

    /// Advance one tick
    ///
    /// Runs the full cycle: flush queued signal commands, advance the
    /// backend, fold its cached clock, absorb the new frame.
    pub fn step(&mut self) -> Result<()> {
        self.flush_signal_commands()?;
        self.sim.simulation_step()?;
        self.sim.update()?;
        self.absorb_frame(false);
        Ok(())
    }

    /// Re-sync the cached view without advancing time
    pub fn refresh(&mut self) -> Result<()> {
        self.sim.update()?;
        self.absorb_frame(false);
        Ok(())
    }

    /// Restore a snapshot; observers start a fresh epoch if one is live
    pub fn load(&mut self, path: &Path) -> Result<()> {
        self.sim.load_simulation(path)?;
        if self.sim.phase() == KernelPhase::Running {
            self.network.rebuild(self.sim.edges());
            self.absorb_frame(true);
        }
        Ok(())
    }

    /// Persist the live state to a snapshot file
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.sim.save_simulation(path)
    }

    /// Release the backend; the master can no longer step afterwards
    ///
    /// Pending signal commands are dropped, not flushed.
    pub fn teardown(&mut self) {
        self.signal.take_pending();
        self.sim.teardown();
    }

    fn flush_signal_commands(&mut self) -> Result<()> {
        for cmd in self.signal.take_pending() {
            match self.sim.set_signal_phase(&cmd.id, cmd.phase_index) {
                Ok(()) => {}
                Err(Error::InvalidState(reason)) => {
                    tracing::warn!(
                        signal = cmd.id.as_str(),
                        %reason,
                        "signal command rejected, skipping"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn absorb_frame(&mut self, reset: bool) {
        let frame = self.sim.world();
        // a refresh lands on the frame the last step already absorbed;
        // counting its departures twice would skew the flow kernels
        if !reset && self.last_step == Some(frame.clock.step_count) {
            return;
        }
        self.last_step = Some(frame.clock.step_count);
        self.vehicle.update(&frame, reset);
        self.signal.update(&frame);
    }

    pub fn simulation(&self) -> &B {
        &self.sim
    }

    pub fn simulation_mut(&mut self) -> &mut B {
        &mut self.sim
    }

    pub fn vehicle(&self) -> &VehicleKernel {
        &self.vehicle
    }

    pub fn network(&self) -> &NetworkKernel {
        &self.network
    }

    pub fn signal(&self) -> &SignalKernel {
        &self.signal
    }

    pub fn signal_mut(&mut self) -> &mut SignalKernel {
        &mut self.signal
    }

    /// Latest frame straight from the backend cache
    pub fn world(&self) -> WorldFrame {
        self.sim.world()
    }

    pub fn phase(&self) -> KernelPhase {
        self.sim.phase()
    }

    pub fn clock(&self) -> SimClock {
        self.sim.clock()
    }

    pub fn tick(&self) -> f64 {
        self.sim.tick()
    }

    pub fn is_running(&self) -> bool {
        self.sim.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{Scenario, SignalColor, SignalPhase, SignalSpec};
    use crate::sim::{MicroSim, SimConfig};

    fn master_for(scenario: Scenario) -> MasterKernel<MicroSim> {
        MasterKernel::new(MicroSim::new(SimConfig::micro(), scenario))
    }

    #[test]
    fn test_start_populates_siblings() {
        let mut master = master_for(Scenario::single_lane(100.0, 3));
        master.start().unwrap();

        assert_eq!(master.vehicle().len(), 3);
        assert_eq!(master.vehicle().num_departed(), 3);
        assert_eq!(master.network().edge_length("main"), Some(100.0));
        assert_eq!(master.phase(), KernelPhase::Running);
    }

    #[test]
    fn test_step_advances_and_refreshes_view() {
        let mut master = master_for(Scenario::single_lane(200.0, 2));
        master.start().unwrap();
        let before = master.vehicle().position("veh_1").unwrap();

        master.step().unwrap();

        assert_eq!(master.clock().step_count, 1);
        assert!(master.vehicle().position("veh_1").unwrap() > before);
    }

    #[test]
    fn test_refresh_does_not_advance_or_double_count() {
        let mut master = master_for(Scenario::single_lane(200.0, 2));
        master.start().unwrap();
        master.step().unwrap();
        let departed = master.vehicle().num_departed();

        master.refresh().unwrap();

        assert_eq!(master.clock().step_count, 1);
        assert_eq!(master.vehicle().num_departed(), departed);
    }

    #[test]
    fn test_signal_commands_flush_on_step() {
        let scenario = Scenario::single_lane(200.0, 1).with_signal(SignalSpec {
            id: "s1".into(),
            edge: "main".into(),
            position_m: 150.0,
            plan: vec![
                SignalPhase::new(SignalColor::Green, 30.0),
                SignalPhase::new(SignalColor::Red, 30.0),
            ],
        });
        let mut master = master_for(scenario);
        master.start().unwrap();
        assert_eq!(master.signal().color("s1"), Some(SignalColor::Green));

        assert!(master.signal_mut().set_state("s1", 1));
        master.step().unwrap();

        assert_eq!(master.signal().phase_index("s1"), Some(1));
        assert_eq!(master.signal().color("s1"), Some(SignalColor::Red));
    }

    #[test]
    fn test_rejected_signal_command_does_not_fail_step() {
        let scenario = Scenario::single_lane(200.0, 1).with_signal(SignalSpec {
            id: "s1".into(),
            edge: "main".into(),
            position_m: 150.0,
            plan: vec![
                SignalPhase::new(SignalColor::Green, 30.0),
                SignalPhase::new(SignalColor::Red, 30.0),
            ],
        });
        let mut master = master_for(scenario);
        master.start().unwrap();

        // id is known to the kernel, but the phase index is out of range
        assert!(master.signal_mut().set_state("s1", 99));
        master.step().unwrap();

        assert_eq!(master.signal().phase_index("s1"), Some(0));
    }

    #[test]
    fn test_load_resets_observer_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mid.json");

        let mut master = master_for(Scenario::single_lane(200.0, 2));
        master.start().unwrap();
        for _ in 0..5 {
            master.step().unwrap();
        }
        master.save(&path).unwrap();
        for _ in 0..5 {
            master.step().unwrap();
        }
        assert_eq!(master.clock().step_count, 10);

        master.load(&path).unwrap();

        assert_eq!(master.clock().step_count, 5);
        assert_eq!(master.vehicle().len(), 2);
        assert_eq!(master.vehicle().num_departed(), 2);
    }

    #[test]
    fn test_teardown_propagates_to_backend() {
        let mut master = master_for(Scenario::single_lane(100.0, 1));
        master.start().unwrap();
        master.teardown();

        assert_eq!(master.phase(), KernelPhase::Stopped);
        assert!(master.step().is_err());
    }
}
