use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::graph::Graph;
use crate::node::{InputNode, Node, NodeType, OutputNode, StepNode};
use crate::selector::{Selector, StepOutputSelector, input_selector, step_selector};

/// A compiled workflow ready for execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
  pub workflow_id: String,
  pub name: String,
  pub nodes: HashMap<String, Node>,
  pub edges: Vec<(String, String)>,
}

impl Workflow {
  /// Build a workflow from its nodes, deriving edges from the selectors used
  /// by step parameters and workflow outputs.
  pub fn new(
    workflow_id: impl Into<String>,
    name: impl Into<String>,
    nodes: Vec<Node>,
  ) -> Result<Self, WorkflowError> {
    let nodes: HashMap<String, Node> = nodes
      .into_iter()
      .map(|node| (node.node_id.clone(), node))
      .collect();

    let mut edges = BTreeSet::new();
    for node in nodes.values() {
      for selector in node_dependencies(node) {
        let from = dependency_node_id(&selector).ok_or_else(|| {
          WorkflowError::InvalidSelector(format!(
            "node '{}' depends on a non-data selector",
            node.node_id
          ))
        })?;
        edges.insert((from, node.node_id.clone()));
      }
    }

    let workflow = Self {
      workflow_id: workflow_id.into(),
      name: name.into(),
      nodes,
      edges: edges.into_iter().collect(),
    };
    workflow.validate()?;
    Ok(workflow)
  }

  /// Deserialize a compiled workflow from JSON and validate it.
  pub fn from_json(json: &str) -> Result<Self, WorkflowError> {
    let workflow: Self = serde_json::from_str(json)?;
    workflow.validate()?;
    Ok(workflow)
  }

  /// Build the graph structure for traversal.
  pub fn graph(&self) -> Graph {
    Graph::new(&self.nodes, &self.edges)
  }

  /// Get a node by ID.
  pub fn get_node(&self, node_id: &str) -> Option<&Node> {
    self.nodes.get(node_id)
  }

  /// Get a step by its name.
  pub fn get_step(&self, step_name: &str) -> Option<&StepNode> {
    self
      .nodes
      .get(&step_selector(step_name))
      .and_then(Node::as_step)
  }

  /// Get a workflow input by its name.
  pub fn get_input(&self, name: &str) -> Option<&InputNode> {
    match self.nodes.get(&input_selector(name)).map(|n| &n.node_type) {
      Some(NodeType::Input(input)) => Some(input),
      _ => None,
    }
  }

  /// All step nodes, sorted by step name.
  pub fn step_nodes(&self) -> Vec<&StepNode> {
    let mut steps: Vec<&StepNode> = self.nodes.values().filter_map(Node::as_step).collect();
    steps.sort_by(|a, b| a.name().cmp(b.name()));
    steps
  }

  /// All workflow inputs, sorted by name.
  pub fn input_nodes(&self) -> Vec<&InputNode> {
    let mut inputs: Vec<&InputNode> = self
      .nodes
      .values()
      .filter_map(|node| match &node.node_type {
        NodeType::Input(input) => Some(input),
        _ => None,
      })
      .collect();
    inputs.sort_by(|a, b| a.name.cmp(&b.name));
    inputs
  }

  /// All workflow outputs, sorted by name.
  pub fn output_nodes(&self) -> Vec<&OutputNode> {
    let mut outputs: Vec<&OutputNode> = self
      .nodes
      .values()
      .filter_map(|node| match &node.node_type {
        NodeType::Output(output) => Some(output),
        _ => None,
      })
      .collect();
    outputs.sort_by(|a, b| a.name.cmp(&b.name));
    outputs
  }

  /// Validate the graph structure and every selector in it.
  pub fn validate(&self) -> Result<(), WorkflowError> {
    for node in self.nodes.values() {
      let allow_wildcard = matches!(node.node_type, NodeType::Output(_));
      for selector in node_dependencies(node) {
        self.validate_selector(&selector, allow_wildcard)?;
      }
    }

    for (from, to) in &self.edges {
      if !self.nodes.contains_key(from) || !self.nodes.contains_key(to) {
        return Err(WorkflowError::InvalidEdge {
          from: from.clone(),
          to: to.clone(),
        });
      }
    }

    self.graph().topological_order()?;
    Ok(())
  }

  fn validate_selector(
    &self,
    selector: &Selector,
    allow_wildcard: bool,
  ) -> Result<(), WorkflowError> {
    match selector {
      Selector::Input(name) => self
        .get_input(name)
        .map(|_| ())
        .ok_or_else(|| WorkflowError::NodeNotFound(input_selector(name))),
      Selector::StepOutput(output) => self.validate_step_output(output, allow_wildcard),
      Selector::Step(name) => Err(WorkflowError::InvalidSelector(step_selector(name))),
      Selector::Output(name) => Err(WorkflowError::InvalidSelector(format!(
        "workflow output '{}' cannot be consumed",
        name
      ))),
    }
  }

  fn validate_step_output(
    &self,
    selector: &StepOutputSelector,
    allow_wildcard: bool,
  ) -> Result<(), WorkflowError> {
    let step = self
      .get_step(&selector.step_name)
      .ok_or_else(|| WorkflowError::NodeNotFound(selector.step_selector()))?;

    if selector.is_wildcard() {
      if allow_wildcard {
        return Ok(());
      }
      return Err(WorkflowError::InvalidSelector(selector.to_string()));
    }

    let declared = step
      .manifest
      .actual_outputs()
      .iter()
      .any(|o| o.name == selector.property_name);
    if !declared {
      return Err(WorkflowError::UnknownOutput {
        selector: selector.to_string(),
        step_name: selector.step_name.clone(),
        property_name: selector.property_name.clone(),
      });
    }
    Ok(())
  }
}

/// Selectors a node reads from.
fn node_dependencies(node: &Node) -> Vec<Selector> {
  match &node.node_type {
    NodeType::Input(_) => Vec::new(),
    NodeType::Step(step) => step
      .manifest
      .input_selectors()
      .into_iter()
      .map(|(_, selector)| selector)
      .collect(),
    NodeType::Output(output) => Selector::parse(&output.selector).into_iter().collect(),
  }
}

/// Node id of the node producing the data a selector points at.
fn dependency_node_id(selector: &Selector) -> Option<String> {
  match selector {
    Selector::Input(name) => Some(input_selector(name)),
    Selector::StepOutput(output) => Some(output.step_selector()),
    Selector::Step(_) | Selector::Output(_) => None,
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::node::{OutputDefinition, StepManifest};

  fn step(name: &str, inputs: &[(&str, serde_json::Value)], outputs: &[&str]) -> Node {
    Node::step(StepNode {
      manifest: StepManifest {
        name: name.to_string(),
        block_type: name.to_string(),
        inputs: inputs
          .iter()
          .map(|(k, v)| (k.to_string(), v.clone()))
          .collect(),
        outputs: outputs.iter().map(|o| OutputDefinition::new(*o)).collect(),
      },
      batch_oriented: true,
    })
  }

  fn detection_workflow() -> Workflow {
    Workflow::new(
      "wf-1",
      "Detection",
      vec![
        Node::input("image", true),
        step("detect", &[("image", json!("$inputs.image"))], &["predictions"]),
        step(
          "crop",
          &[
            ("image", json!("$inputs.image")),
            ("predictions", json!("$steps.detect.predictions")),
          ],
          &["crops"],
        ),
        Node::output("crops", "$steps.crop.crops"),
      ],
    )
    .unwrap()
  }

  #[test]
  fn test_edges_are_derived_from_selectors() {
    let workflow = detection_workflow();

    assert_eq!(
      workflow.edges,
      vec![
        ("$inputs.image".to_string(), "$steps.crop".to_string()),
        ("$inputs.image".to_string(), "$steps.detect".to_string()),
        ("$steps.crop".to_string(), "$outputs.crops".to_string()),
        ("$steps.detect".to_string(), "$steps.crop".to_string()),
      ]
    );

    let graph = workflow.graph();
    assert_eq!(graph.entry_points(), &["$inputs.image".to_string()]);
    assert_eq!(
      graph.topological_order().unwrap(),
      vec!["$inputs.image", "$steps.detect", "$steps.crop", "$outputs.crops"]
    );
  }

  #[test]
  fn test_lookup_helpers() {
    let workflow = detection_workflow();

    let names: Vec<&str> = workflow.step_nodes().iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["crop", "detect"]);
    assert_eq!(workflow.input_nodes().len(), 1);
    assert_eq!(workflow.output_nodes()[0].selector, "$steps.crop.crops");
    assert!(workflow.get_step("detect").is_some());
    assert!(workflow.get_step("missing").is_none());
    assert!(workflow.get_input("image").unwrap().batch_oriented);
  }

  #[test]
  fn test_unknown_step_reference() {
    let result = Workflow::new(
      "wf",
      "Broken",
      vec![
        Node::input("image", true),
        step("crop", &[("predictions", json!("$steps.detect.predictions"))], &["crops"]),
      ],
    );

    assert!(matches!(result, Err(WorkflowError::NodeNotFound(id)) if id == "$steps.detect"));
  }

  #[test]
  fn test_undeclared_output_reference() {
    let result = Workflow::new(
      "wf",
      "Broken",
      vec![
        Node::input("image", true),
        step("detect", &[("image", json!("$inputs.image"))], &["predictions"]),
        Node::output("result", "$steps.detect.boxes"),
      ],
    );

    assert!(matches!(
      result,
      Err(WorkflowError::UnknownOutput { property_name, .. }) if property_name == "boxes"
    ));
  }

  #[test]
  fn test_wildcard_only_allowed_for_outputs() {
    let as_output = Workflow::new(
      "wf",
      "Wildcard",
      vec![
        Node::input("image", true),
        step("detect", &[("image", json!("$inputs.image"))], &["predictions"]),
        Node::output("all", "$steps.detect.*"),
      ],
    );
    assert!(as_output.is_ok());

    let as_step_input = Workflow::new(
      "wf",
      "Wildcard",
      vec![
        Node::input("image", true),
        step("detect", &[("image", json!("$inputs.image"))], &["predictions"]),
        step("crop", &[("predictions", json!("$steps.detect.*"))], &["crops"]),
      ],
    );
    assert!(matches!(as_step_input, Err(WorkflowError::InvalidSelector(_))));
  }

  #[test]
  fn test_cycle_is_rejected() {
    let result = Workflow::new(
      "wf",
      "Cycle",
      vec![
        step("a", &[("x", json!("$steps.b.out"))], &["out"]),
        step("b", &[("x", json!("$steps.a.out"))], &["out"]),
      ],
    );

    assert!(matches!(result, Err(WorkflowError::Cycle)));
  }

  #[test]
  fn test_from_json_validates() {
    let workflow = detection_workflow();
    let json = serde_json::to_string(&workflow).unwrap();

    let parsed = Workflow::from_json(&json).unwrap();
    assert_eq!(parsed, workflow);

    let mut broken = workflow.clone();
    broken
      .edges
      .push(("$steps.ghost".to_string(), "$steps.crop".to_string()));
    let json = serde_json::to_string(&broken).unwrap();
    assert!(matches!(
      Workflow::from_json(&json),
      Err(WorkflowError::InvalidEdge { .. })
    ));

    assert!(matches!(
      Workflow::from_json("{ not json"),
      Err(WorkflowError::Parse(_))
    ));
  }
}
