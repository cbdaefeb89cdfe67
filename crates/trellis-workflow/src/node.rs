use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::selector::{Selector, input_selector, output_selector, step_selector};

/// An output property declared by a step's block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDefinition {
  pub name: String,
  /// Kinds are informational (documentation/validation), never enforced at runtime.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub kind: Vec<String>,
}

impl OutputDefinition {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      kind: Vec::new(),
    }
  }

  pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
    self.kind.push(kind.into());
    self
  }
}

/// Compiled manifest of a single step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepManifest {
  pub name: String,
  /// Identifier of the block implementing this step.
  pub block_type: String,
  /// Step parameters. String values that parse as selectors are data
  /// dependencies, everything else is passed to the block as a literal.
  #[serde(default)]
  pub inputs: HashMap<String, serde_json::Value>,
  #[serde(default)]
  pub outputs: Vec<OutputDefinition>,
}

impl StepManifest {
  /// Outputs the block actually produces for this configuration.
  pub fn actual_outputs(&self) -> &[OutputDefinition] {
    &self.outputs
  }

  /// Selectors referenced by the step parameters, in parameter-name order.
  pub fn input_selectors(&self) -> Vec<(&str, Selector)> {
    let mut selectors: Vec<(&str, Selector)> = self
      .inputs
      .iter()
      .filter_map(|(name, value)| {
        value
          .as_str()
          .and_then(Selector::parse)
          .map(|selector| (name.as_str(), selector))
      })
      .collect();
    selectors.sort_by(|a, b| a.0.cmp(b.0));
    selectors
  }
}

/// A step in the compiled execution graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepNode {
  pub manifest: StepManifest,
  /// Whether the step produces one result per batch element rather than
  /// one result per run.
  pub batch_oriented: bool,
}

impl StepNode {
  pub fn name(&self) -> &str {
    &self.manifest.name
  }

  pub fn is_batch_oriented(&self) -> bool {
    self.batch_oriented
  }
}

/// A workflow input (`$inputs.<name>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputNode {
  pub name: String,
  /// Batch inputs are supplied as a JSON array, one element per batch item.
  pub batch_oriented: bool,
}

/// A requested workflow output (`$outputs.<name>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputNode {
  pub name: String,
  pub selector: String,
}

/// A node in the compiled execution graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
  pub node_id: String,
  pub node_type: NodeType,
}

/// The type of a compiled node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeType {
  Input(InputNode),
  Step(StepNode),
  Output(OutputNode),
}

impl Node {
  pub fn input(name: impl Into<String>, batch_oriented: bool) -> Self {
    let name = name.into();
    Self {
      node_id: input_selector(&name),
      node_type: NodeType::Input(InputNode {
        name,
        batch_oriented,
      }),
    }
  }

  pub fn step(step: StepNode) -> Self {
    Self {
      node_id: step_selector(step.name()),
      node_type: NodeType::Step(step),
    }
  }

  pub fn output(name: impl Into<String>, selector: impl Into<String>) -> Self {
    let name = name.into();
    Self {
      node_id: output_selector(&name),
      node_type: NodeType::Output(OutputNode {
        name,
        selector: selector.into(),
      }),
    }
  }

  pub fn as_step(&self) -> Option<&StepNode> {
    match &self.node_type {
      NodeType::Step(step) => Some(step),
      _ => None,
    }
  }

  pub fn is_step(&self) -> bool {
    matches!(self.node_type, NodeType::Step(_))
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::selector::StepOutputSelector;

  #[test]
  fn test_node_ids_are_selectors() {
    assert_eq!(Node::input("image", true).node_id, "$inputs.image");
    assert_eq!(Node::output("result", "$steps.a.b").node_id, "$outputs.result");

    let step = StepNode {
      manifest: StepManifest {
        name: "detect".to_string(),
        block_type: "object_detection".to_string(),
        inputs: HashMap::new(),
        outputs: vec![OutputDefinition::new("predictions")],
      },
      batch_oriented: true,
    };
    let node = Node::step(step);
    assert_eq!(node.node_id, "$steps.detect");
    assert!(node.is_step());
    assert_eq!(node.as_step().map(|s| s.name()), Some("detect"));
  }

  #[test]
  fn test_input_selectors_skip_literals() {
    let manifest = StepManifest {
      name: "crop".to_string(),
      block_type: "crop".to_string(),
      inputs: HashMap::from([
        ("image".to_string(), json!("$inputs.image")),
        ("predictions".to_string(), json!("$steps.detect.predictions")),
        ("padding".to_string(), json!(4)),
        ("mode".to_string(), json!("center")),
      ]),
      outputs: vec![OutputDefinition::new("crops").with_kind("image")],
    };

    let selectors = manifest.input_selectors();
    assert_eq!(
      selectors,
      vec![
        ("image", Selector::Input("image".to_string())),
        (
          "predictions",
          Selector::StepOutput(StepOutputSelector::new("detect", "predictions"))
        ),
      ]
    );
    assert_eq!(manifest.actual_outputs()[0].kind, vec!["image".to_string()]);
  }
}
