use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
  #[error("node not found: {0}")]
  NodeNotFound(String),

  #[error("edge references unknown node: from={from}, to={to}")]
  InvalidEdge { from: String, to: String },

  #[error("invalid selector: {0}")]
  InvalidSelector(String),

  #[error("selector '{selector}' references undeclared output '{property_name}' of step '{step_name}'")]
  UnknownOutput {
    selector: String,
    step_name: String,
    property_name: String,
  },

  #[error("workflow graph contains a cycle")]
  Cycle,

  #[error("failed to parse workflow: {0}")]
  Parse(#[from] serde_json::Error),
}
