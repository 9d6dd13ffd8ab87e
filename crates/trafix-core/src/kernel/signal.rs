//! Signal query and command surface
//!
//! Reads come from the latest world frame; writes are queued as
//! commands and flushed to the backend by the master at the top of the
//! next step, so an agent can set several signals before advancing.

use std::collections::HashMap;

use crate::kernel::{SignalObs, WorldFrame};
use crate::scenario::SignalColor;

/// A queued phase change for one signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalCommand {
    pub id: String,
    pub phase_index: usize,
}

/// Traffic signal state as of the last frame, plus the pending command queue
#[derive(Debug, Default)]
pub struct SignalKernel {
    obs: Vec<SignalObs>,
    index: HashMap<String, usize>,
    pending: Vec<SignalCommand>,
}

impl SignalKernel {
    /// Absorb one world frame
    pub fn update(&mut self, frame: &WorldFrame) {
        self.index = frame
            .signals
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
        self.obs = frame.signals.clone();
    }

    /// Signal ids in frame order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.obs.iter().map(|s| s.id.as_str())
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

    pub fn get(&self, id: &str) -> Option<&SignalObs> {
        self.index.get(id).map(|&i| &self.obs[i])
    }

    pub fn color(&self, id: &str) -> Option<SignalColor> {
        self.get(id).map(|s| s.color)
    }

    pub fn phase_index(&self, id: &str) -> Option<usize> {
        self.get(id).map(|s| s.phase_index)
    }

    /// Queue a phase change for the next step
    ///
    /// Unknown ids are dropped with a warning rather than failing the
    /// episode; an agent exploring a large action space will hit them.
    pub fn set_state(&mut self, id: &str, phase_index: usize) -> bool {
        if !self.index.contains_key(id) {
            tracing::warn!(signal = id, "set_state on unknown signal, ignoring");
            return false;
        }
        self.pending.push(SignalCommand {
            id: id.to_owned(),
            phase_index,
        });
        true
    }

    /// Number of commands waiting to be flushed
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drain the queued commands, oldest first
    pub fn take_pending(&mut self) -> Vec<SignalCommand> {
        std::mem::take(&mut self.pending)
    }
}
