use std::collections::{BTreeSet, HashMap};

use crate::Node;
use crate::error::WorkflowError;

/// Graph structure for traversal and analysis.
#[derive(Debug, Clone)]
pub struct Graph {
  /// Adjacency list: node_id -> list of downstream node_ids.
  adjacency: HashMap<String, Vec<String>>,
  /// Reverse adjacency: node_id -> list of upstream node_ids.
  reverse_adjacency: HashMap<String, Vec<String>>,
  /// Nodes with no incoming edges, sorted.
  entry_points: Vec<String>,
}

impl Graph {
  /// Build a graph from nodes and edges.
  pub fn new(nodes: &HashMap<String, Node>, edges: &[(String, String)]) -> Self {
    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    let mut reverse_adjacency: HashMap<String, Vec<String>> = HashMap::new();

    // Initialize all nodes
    for node_id in nodes.keys() {
      adjacency.entry(node_id.clone()).or_default();
      reverse_adjacency.entry(node_id.clone()).or_default();
    }

    for (from, to) in edges {
      adjacency.entry(from.clone()).or_default().push(to.clone());
      reverse_adjacency
        .entry(to.clone())
        .or_default()
        .push(from.clone());
    }

    let mut entry_points: Vec<String> = nodes
      .keys()
      .filter(|id| reverse_adjacency.get(*id).is_none_or(|v| v.is_empty()))
      .cloned()
      .collect();
    entry_points.sort();

    Self {
      adjacency,
      reverse_adjacency,
      entry_points,
    }
  }

  /// Get entry points (nodes with no incoming edges).
  pub fn entry_points(&self) -> &[String] {
    &self.entry_points
  }

  /// Get downstream nodes for a given node.
  pub fn downstream(&self, node_id: &str) -> &[String] {
    self
      .adjacency
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Get upstream nodes for a given node.
  pub fn upstream(&self, node_id: &str) -> &[String] {
    self
      .reverse_adjacency
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Order all nodes so every node comes after its upstream nodes.
  ///
  /// Ties are broken lexically so the order is stable across runs.
  pub fn topological_order(&self) -> Result<Vec<String>, WorkflowError> {
    let mut in_degree: HashMap<&str, usize> = self
      .reverse_adjacency
      .iter()
      .map(|(id, upstream)| (id.as_str(), upstream.len()))
      .collect();

    let mut ready: BTreeSet<&str> = in_degree
      .iter()
      .filter(|(_, degree)| **degree == 0)
      .map(|(id, _)| *id)
      .collect();

    let mut order = Vec::with_capacity(in_degree.len());
    while let Some(node_id) = ready.pop_first() {
      order.push(node_id.to_string());
      for next in self.downstream(node_id) {
        if let Some(degree) = in_degree.get_mut(next.as_str()) {
          *degree -= 1;
          if *degree == 0 {
            ready.insert(next.as_str());
          }
        }
      }
    }

    if order.len() != in_degree.len() {
      return Err(WorkflowError::Cycle);
    }

    Ok(order)
  }
}
