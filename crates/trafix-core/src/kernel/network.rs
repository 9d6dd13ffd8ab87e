//! Static road network queries
//!
//! Edge geometry does not change while an episode runs, so this kernel
//! is rebuilt only on start and after a snapshot load.

use std::collections::HashMap;

use crate::scenario::EdgeSpec;

/// Edge lookup over the loaded network
#[derive(Debug, Default)]
pub struct NetworkKernel {
    edges: Vec<EdgeSpec>,
    index: HashMap<String, usize>,
}

impl NetworkKernel {
    /// Replace the network with the backend's current edge list
    pub fn rebuild(&mut self, edges: Vec<EdgeSpec>) {
        self.index = edges
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
        self.edges = edges;
    }

    /// Edge ids in network order
    pub fn edge_ids(&self) -> impl Iterator<Item = &str> {
        self.edges.iter().map(|e| e.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&EdgeSpec> {
        self.index.get(id).map(|&i| &self.edges[i])
    }

    pub fn edge_length(&self, id: &str) -> Option<f64> {
        self.get(id).map(|e| e.length_m)
    }

    pub fn speed_limit(&self, id: &str) -> Option<f64> {
        self.get(id).map(|e| e.speed_limit_mps)
    }

    pub fn num_lanes(&self, id: &str) -> Option<u32> {
        self.get(id).map(|e| e.lanes)
    }

    /// Total lane-independent length of the network, in meters
    pub fn total_length(&self) -> f64 {
        self.edges.iter().map(|e| e.length_m).sum()
    }

    /// Highest speed limit over all edges, useful for normalizing speeds
    pub fn max_speed(&self) -> f64 {
        self.edges
            .iter()
            .map(|e| e.speed_limit_mps)
            .fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(id: &str, length_m: f64, speed_limit_mps: f64) -> EdgeSpec {
        EdgeSpec {
            id: id.into(),
            length_m,
            speed_limit_mps,
            lanes: 1,
        }
    }

    #[test]
    fn test_lookup() {
        let mut kernel = NetworkKernel::default();
        kernel.rebuild(vec![edge("a", 100.0, 13.9), edge("b", 250.0, 30.0)]);

        assert_eq!(kernel.len(), 2);
        assert_eq!(kernel.edge_length("a"), Some(100.0));
        assert_eq!(kernel.speed_limit("b"), Some(30.0));
        assert_eq!(kernel.num_lanes("a"), Some(1));
        assert_eq!(kernel.edge_length("ghost"), None);
        assert_eq!(kernel.total_length(), 350.0);
        assert_eq!(kernel.max_speed(), 30.0);

        let ids: Vec<&str> = kernel.edge_ids().collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_rebuild_replaces() {
        let mut kernel = NetworkKernel::default();
        kernel.rebuild(vec![edge("a", 100.0, 13.9)]);
        kernel.rebuild(vec![edge("x", 50.0, 8.3)]);

        assert_eq!(kernel.len(), 1);
        assert_eq!(kernel.edge_length("a"), None);
        assert_eq!(kernel.edge_length("x"), Some(50.0));
    }

    #[test]
    fn test_empty_network() {
        let kernel = NetworkKernel::default();
        assert!(kernel.is_empty());
        assert_eq!(kernel.total_length(), 0.0);
        assert_eq!(kernel.max_speed(), 0.0);
    }
}
