//! Episode runner
//!
//! Drives a master kernel for a fixed horizon, watches the wall-clock
//! cost of every step, and streams per-step records to any number of
//! subscribers. The simulation itself is synchronous; the runner adds
//! the around-the-loop concerns so agent code does not have to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;

use crate::kernel::{MasterKernel, TrafficBackend};
use crate::sim::SimConfig;
use crate::{Error, Result};

/// Settings for one episode
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    /// Label used in logs and the worker thread name
    pub name: Arc<str>,
    /// Measured steps per episode
    pub horizon: u64,
    /// Steps driven before measurement starts
    pub warmup_steps: u64,
    /// Wall-clock allowance per step; exceeding it aborts the episode
    pub step_budget: Duration,
}

impl ExperimentConfig {
    pub fn new(name: impl Into<Arc<str>>, horizon: u64) -> Self {
        Self {
            name: name.into(),
            horizon,
            warmup_steps: 0,
            step_budget: Duration::from_secs(10),
        }
    }

    /// Inherit warmup and step budget from a backend config
    pub fn for_sim(name: impl Into<Arc<str>>, sim: &SimConfig, horizon: u64) -> Self {
        Self {
            name: name.into(),
            horizon,
            warmup_steps: sim.warmup_steps,
            step_budget: sim.step_budget,
        }
    }

    pub fn with_warmup(mut self, steps: u64) -> Self {
        self.warmup_steps = steps;
        self
    }

    pub fn with_step_budget(mut self, budget: Duration) -> Self {
        self.step_budget = budget;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.horizon == 0 {
            return Err(Error::ConfigInvalid(
                "experiment horizon must be at least one step".to_string(),
            ));
        }
        if self.step_budget.is_zero() {
            return Err(Error::ConfigInvalid(
                "step budget must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// One step's worth of summary state, cheap enough to stream every tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepRecord {
    pub step_count: u64,
    pub sim_time_s: f64,
    pub num_vehicles: usize,
    pub mean_speed_mps: f64,
}

impl StepRecord {
    pub fn capture<B: TrafficBackend>(master: &MasterKernel<B>) -> Self {
        let clock = master.clock();
        Self {
            step_count: clock.step_count,
            sim_time_s: clock.sim_time,
            num_vehicles: master.vehicle().len(),
            mean_speed_mps: master.vehicle().mean_speed().unwrap_or(0.0),
        }
    }
}

/// Aggregate outcome of an episode
///
/// `mean_speed_mps` averages the per-step mean speeds over steps where
/// at least one vehicle was present; `speed_samples` counts those steps.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EpisodeReport {
    pub steps: u64,
    pub sim_time_s: f64,
    pub wall_time_s: f64,
    pub mean_speed_mps: f64,
    pub speed_samples: u64,
    pub peak_vehicles: usize,
    pub total_departed: u64,
    pub total_arrived: u64,
    pub completed: bool,
}

impl EpisodeReport {
    pub fn update(&mut self, record: &StepRecord, step_wall: Duration) {
        self.steps += 1;
        self.sim_time_s = record.sim_time_s;
        self.wall_time_s += step_wall.as_secs_f64();
        self.peak_vehicles = self.peak_vehicles.max(record.num_vehicles);
        if record.num_vehicles > 0 {
            self.speed_samples += 1;
            let n = self.speed_samples as f64;
            self.mean_speed_mps += (record.mean_speed_mps - self.mean_speed_mps) / n;
        }
    }

    pub fn avg_step_wall(&self) -> Duration {
        if self.steps == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.wall_time_s / self.steps as f64)
    }
}

/// Fan-out of step records to bounded in-process channels
///
/// Publishing never blocks the step loop: a full subscriber drops the
/// record, a disconnected one is pruned. Subscribe with a capacity of
/// at least one.
#[derive(Default)]
pub struct RecordFanout {
    senders: Vec<Sender<StepRecord>>,
}

impl RecordFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, capacity: usize) -> Receiver<StepRecord> {
        let (tx, rx) = bounded(capacity);
        self.senders.push(tx);
        rx
    }

    pub fn receiver_count(&self) -> usize {
        self.senders.len()
    }

    pub fn publish(&mut self, record: StepRecord) {
        self.senders.retain(|tx| match tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::trace!("record subscriber full, dropping step record");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

fn drive<B: TrafficBackend>(
    master: &mut MasterKernel<B>,
    config: &ExperimentConfig,
    fanout: &mut RecordFanout,
    stop: Option<&AtomicBool>,
    shared: Option<&Mutex<EpisodeReport>>,
) -> Result<EpisodeReport> {
    config.validate()?;
    if !master.is_running() {
        master.start()?;
    }
    for _ in 0..config.warmup_steps {
        master.step()?;
    }

    let mut report = EpisodeReport::default();
    for _ in 0..config.horizon {
        if stop.map(|s| s.load(Ordering::Relaxed)).unwrap_or(false) {
            tracing::info!(experiment = config.name.as_ref(), "stop requested");
            break;
        }

        let started = Instant::now();
        master.step()?;
        let wall = started.elapsed();

        let record = StepRecord::capture(master);
        report.update(&record, wall);
        if let Some(shared) = shared {
            *shared.lock() = report;
        }
        fanout.publish(record);

        if wall > config.step_budget {
            report.total_departed = master.vehicle().num_departed();
            report.total_arrived = master.vehicle().num_arrived();
            if let Some(shared) = shared {
                *shared.lock() = report;
            }
            master.teardown();
            tracing::error!(
                experiment = config.name.as_ref(),
                step = record.step_count,
                wall_ms = wall.as_millis() as u64,
                "step exceeded budget, aborting episode"
            );
            return Err(Error::BackendUnavailable(format!(
                "step {} took {:?}, budget is {:?}",
                record.step_count, wall, config.step_budget
            )));
        }
    }

    report.total_departed = master.vehicle().num_departed();
    report.total_arrived = master.vehicle().num_arrived();
    report.completed = true;
    if let Some(shared) = shared {
        *shared.lock() = report;
    }
    tracing::info!(
        experiment = config.name.as_ref(),
        steps = report.steps,
        sim_time_s = report.sim_time_s,
        "episode finished"
    );
    Ok(report)
}

/// Episode entry points
///
/// `run` drives the caller's master kernel in place. `spawn` moves the
/// kernel to a worker thread and hands back a handle with live stats;
/// `join` returns the kernel so a follow-up episode can reuse it.
pub struct Experiment;

impl Experiment {
    pub fn run<B: TrafficBackend>(
        master: &mut MasterKernel<B>,
        config: &ExperimentConfig,
    ) -> Result<EpisodeReport> {
        let mut fanout = RecordFanout::new();
        drive(master, config, &mut fanout, None, None)
    }

    pub fn run_with<B: TrafficBackend>(
        master: &mut MasterKernel<B>,
        config: &ExperimentConfig,
        fanout: &mut RecordFanout,
    ) -> Result<EpisodeReport> {
        drive(master, config, fanout, None, None)
    }

    pub fn spawn<B: TrafficBackend + 'static>(
        master: MasterKernel<B>,
        config: ExperimentConfig,
    ) -> Result<ExperimentHandle<B>> {
        Self::spawn_with(master, config, RecordFanout::new())
    }

    pub fn spawn_with<B: TrafficBackend + 'static>(
        mut master: MasterKernel<B>,
        config: ExperimentConfig,
        mut fanout: RecordFanout,
    ) -> Result<ExperimentHandle<B>> {
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(EpisodeReport::default()));

        let thread_stop = Arc::clone(&stop);
        let thread_stats = Arc::clone(&stats);
        let thread = std::thread::Builder::new()
            .name(format!("experiment-{}", config.name))
            .spawn(move || {
                let result = drive(
                    &mut master,
                    &config,
                    &mut fanout,
                    Some(&thread_stop),
                    Some(&thread_stats),
                );
                (master, result)
            })
            .map_err(|e| Error::BackendUnavailable(format!("worker spawn failed: {e}")))?;

        Ok(ExperimentHandle {
            stop,
            stats,
            thread,
        })
    }
}

/// Control surface for a spawned episode
pub struct ExperimentHandle<B: TrafficBackend> {
    stop: Arc<AtomicBool>,
    stats: Arc<Mutex<EpisodeReport>>,
    thread: JoinHandle<(MasterKernel<B>, Result<EpisodeReport>)>,
}

impl<B: TrafficBackend> ExperimentHandle<B> {
    /// Snapshot of the stats as of the most recent step
    pub fn stats(&self) -> EpisodeReport {
        *self.stats.lock()
    }

    /// Ask the worker to finish after the current step
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the episode and take the kernel back
    pub fn join(self) -> (MasterKernel<B>, Result<EpisodeReport>) {
        match self.thread.join() {
            Ok(pair) => pair,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::Scenario;
    use crate::sim::MicroSim;
    use approx::assert_relative_eq;

    fn micro_master(scenario: Scenario) -> MasterKernel<MicroSim> {
        MasterKernel::new(MicroSim::new(SimConfig::micro(), scenario))
    }

    #[test]
    fn test_run_completes_horizon() {
        let mut master = micro_master(Scenario::single_lane(500.0, 3));
        let config = ExperimentConfig::new("horizon", 50);

        let report = Experiment::run(&mut master, &config).unwrap();

        assert!(report.completed);
        assert_eq!(report.steps, 50);
        assert_relative_eq!(report.sim_time_s, 5.0);
        assert!(report.mean_speed_mps > 0.0);
        assert_eq!(report.peak_vehicles, 3);
        assert_eq!(report.total_departed, 3);
        assert_eq!(master.clock().step_count, 50);
    }

    #[test]
    fn test_warmup_steps_are_not_measured() {
        let mut master = micro_master(Scenario::single_lane(500.0, 2));
        let config = ExperimentConfig::new("warmup", 20).with_warmup(5);

        let report = Experiment::run(&mut master, &config).unwrap();

        assert_eq!(report.steps, 20);
        assert_eq!(master.clock().step_count, 25);
    }

    #[test]
    fn test_zero_horizon_is_config_invalid() {
        let mut master = micro_master(Scenario::single_lane(500.0, 1));
        let config = ExperimentConfig::new("empty", 0);
        assert!(matches!(
            Experiment::run(&mut master, &config),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_tiny_budget_aborts_and_tears_down() {
        let mut master = micro_master(Scenario::single_lane(500.0, 3));
        let config =
            ExperimentConfig::new("deadline", 50).with_step_budget(Duration::from_nanos(1));

        let err = Experiment::run(&mut master, &config);

        assert!(matches!(err, Err(Error::BackendUnavailable(_))));
        assert!(!master.is_running());
    }

    #[test]
    fn test_records_stream_to_subscriber() {
        let mut master = micro_master(Scenario::single_lane(500.0, 2));
        let config = ExperimentConfig::new("stream", 20);
        let mut fanout = RecordFanout::new();
        let rx = fanout.subscribe(64);

        Experiment::run_with(&mut master, &config, &mut fanout).unwrap();

        let records: Vec<StepRecord> = rx.try_iter().collect();
        assert_eq!(records.len(), 20);
        assert_eq!(records[0].step_count, 1);
        assert_eq!(records[19].step_count, 20);
        assert!(records.windows(2).all(|w| w[0].step_count < w[1].step_count));
    }

    #[test]
    fn test_full_subscriber_drops_without_blocking() {
        let mut master = micro_master(Scenario::single_lane(500.0, 1));
        let config = ExperimentConfig::new("backpressure", 10);
        let mut fanout = RecordFanout::new();
        let rx = fanout.subscribe(2);

        Experiment::run_with(&mut master, &config, &mut fanout).unwrap();

        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn test_disconnected_subscriber_is_pruned() {
        let mut fanout = RecordFanout::new();
        let rx = fanout.subscribe(4);
        drop(rx);

        fanout.publish(StepRecord {
            step_count: 1,
            sim_time_s: 0.1,
            num_vehicles: 0,
            mean_speed_mps: 0.0,
        });

        assert_eq!(fanout.receiver_count(), 0);
    }

    #[test]
    fn test_report_averages_only_populated_steps() {
        let mut report = EpisodeReport::default();
        let record = |n: usize, speed: f64| StepRecord {
            step_count: 1,
            sim_time_s: 0.1,
            num_vehicles: n,
            mean_speed_mps: speed,
        };

        report.update(&record(2, 2.0), Duration::from_micros(5));
        report.update(&record(0, 0.0), Duration::from_micros(5));
        report.update(&record(2, 4.0), Duration::from_micros(5));

        assert_eq!(report.steps, 3);
        assert_eq!(report.speed_samples, 2);
        assert_relative_eq!(report.mean_speed_mps, 3.0);
    }

    #[test]
    fn test_spawn_stop_join_returns_kernel() {
        let master = micro_master(Scenario::single_lane(500.0, 2));
        let config = ExperimentConfig::new("spawned", 1_000_000);

        let handle = Experiment::spawn(master, config).unwrap();
        handle.stop();
        let (master, result) = handle.join();

        let report = result.unwrap();
        assert!(report.completed);
        assert!(report.steps < 1_000_000);
        assert!(master.is_running());
    }
}
