//! Simulation configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Simulation backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimBackendKind {
    /// In-process car-following model
    Micro,
    /// Remote simulator attached over TCP
    Remote,
}

impl Default for SimBackendKind {
    fn default() -> Self {
        Self::Micro
    }
}

impl std::fmt::Display for SimBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Micro => write!(f, "micro"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Overall simulation configuration
///
/// The tick is fixed for the lifetime of the kernel; backends that keep
/// their own clock must agree with it at start or refuse to attach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Backend kind
    pub backend: SimBackendKind,
    /// Step length in seconds
    pub tick_s: f64,
    /// Steps to run before the measured episode begins
    pub warmup_steps: u64,
    /// Random seed for placement and anything else that draws
    pub seed: u64,
    /// Wall-clock budget for a single step before the driver gives up
    pub step_budget: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            backend: SimBackendKind::Micro,
            tick_s: 0.1,
            warmup_steps: 0,
            seed: 42,
            step_budget: Duration::from_secs(10),
        }
    }
}

impl SimConfig {
    /// Config for the in-process micro backend
    pub fn micro() -> Self {
        Self::default()
    }

    /// Config for a remote simulator attach
    pub fn remote() -> Self {
        Self {
            backend: SimBackendKind::Remote,
            ..Default::default()
        }
    }

    /// Set the tick length in seconds
    pub fn with_tick(mut self, tick_s: f64) -> Self {
        self.tick_s = tick_s;
        self
    }

    /// Set the warmup step count
    pub fn with_warmup(mut self, steps: u64) -> Self {
        self.warmup_steps = steps;
        self
    }

    /// Set the random seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the per-step wall-clock budget
    pub fn with_step_budget(mut self, budget: Duration) -> Self {
        self.step_budget = budget;
        self
    }

    /// Check parameter ranges
    pub fn validate(&self) -> Result<()> {
        if !(self.tick_s.is_finite() && self.tick_s > 0.0) {
            return Err(Error::ConfigInvalid(format!(
                "tick must be positive, got {}",
                self.tick_s
            )));
        }
        if self.step_budget.is_zero() {
            return Err(Error::ConfigInvalid("step budget must be non-zero".into()));
        }
        Ok(())
    }
}

impl std::fmt::Display for SimConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} backend, tick {}s, seed {}",
            self.backend, self.tick_s, self.seed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SimConfig::default();
        assert_eq!(config.backend, SimBackendKind::Micro);
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_tick_rejected() {
        let config = SimConfig::micro().with_tick(0.0);
        assert!(matches!(config.validate(), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_builders() {
        let config = SimConfig::remote()
            .with_tick(0.5)
            .with_seed(7)
            .with_warmup(100);
        assert_eq!(config.backend, SimBackendKind::Remote);
        assert_eq!(config.tick_s, 0.5);
        assert_eq!(config.seed, 7);
        assert_eq!(config.warmup_steps, 100);
    }

    #[test]
    fn test_display() {
        let config = SimConfig::micro().with_tick(0.25);
        assert_eq!(config.to_string(), "micro backend, tick 0.25s, seed 42");
    }
}
