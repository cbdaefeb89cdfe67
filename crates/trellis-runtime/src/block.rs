//! Blocks: the implementations behind workflow steps.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::batch_index::DynamicBatchIndex;

/// Input handed to a block for one invocation.
#[derive(Debug, Clone)]
pub struct BlockInput {
  /// Execution ID this invocation belongs to.
  pub execution_id: String,
  /// Step being executed.
  pub step_name: String,
  /// Batch elements covered by this invocation. Empty for non-batch steps.
  pub indices: Vec<DynamicBatchIndex>,
  /// Resolved parameters. For batch-oriented steps, batch parameters are
  /// arrays aligned with `indices`; everything else is passed as-is.
  pub parameters: Map<String, Value>,
}

impl BlockInput {
  pub fn parameter(&self, name: &str) -> Option<&Value> {
    self.parameters.get(name)
  }

  /// Value of a batch parameter for the `position`-th element of this invocation.
  pub fn batch_parameter(&self, name: &str, position: usize) -> Option<&Value> {
    self
      .parameters
      .get(name)
      .and_then(Value::as_array)
      .and_then(|values| values.get(position))
  }
}

/// Failure reported by a block.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct BlockError {
  pub message: String,
}

impl BlockError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

/// A unit of computation behind a workflow step.
///
/// Batch-oriented steps must return a JSON array aligned with
/// [`BlockInput::indices`]. Each element is a mapping of output properties,
/// or a list of such mappings when the block expands one element into many
/// (e.g. one crop per detection). Non-batch steps return a single mapping.
#[async_trait]
pub trait Block: Send + Sync {
  async fn run(&self, input: BlockInput) -> Result<Value, BlockError>;
}

/// Blocks available to a runtime, keyed by block type.
#[derive(Clone, Default)]
pub struct BlockRegistry {
  blocks: HashMap<String, Arc<dyn Block>>,
}

impl BlockRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a block, replacing any previous block of the same type.
  pub fn register(&mut self, block_type: impl Into<String>, block: impl Block + 'static) {
    self.blocks.insert(block_type.into(), Arc::new(block));
  }

  pub fn get(&self, block_type: &str) -> Option<Arc<dyn Block>> {
    self.blocks.get(block_type).cloned()
  }

  pub fn contains(&self, block_type: &str) -> bool {
    self.blocks.contains_key(block_type)
  }
}

impl fmt::Debug for BlockRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut block_types: Vec<&String> = self.blocks.keys().collect();
    block_types.sort();
    f.debug_struct("BlockRegistry")
      .field("block_types", &block_types)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  struct Echo;

  #[async_trait]
  impl Block for Echo {
    async fn run(&self, input: BlockInput) -> Result<Value, BlockError> {
      Ok(Value::Object(input.parameters))
    }
  }

  #[tokio::test]
  async fn test_registry_lookup() {
    let mut registry = BlockRegistry::new();
    registry.register("echo", Echo);

    assert!(registry.contains("echo"));
    assert!(registry.get("missing").is_none());

    let block = registry.get("echo").unwrap();
    let input = BlockInput {
      execution_id: "exec".to_string(),
      step_name: "step".to_string(),
      indices: Vec::new(),
      parameters: Map::from_iter([("x".to_string(), json!(1))]),
    };
    assert_eq!(block.run(input).await.unwrap(), json!({"x": 1}));
    assert_eq!(format!("{:?}", registry), "BlockRegistry { block_types: [\"echo\"] }");
  }

  #[test]
  fn test_batch_parameter() {
    let input = BlockInput {
      execution_id: "exec".to_string(),
      step_name: "step".to_string(),
      indices: vec![DynamicBatchIndex::root(0), DynamicBatchIndex::root(1)],
      parameters: Map::from_iter([
        ("image".to_string(), json!(["a", "b"])),
        ("threshold".to_string(), json!(0.5)),
      ]),
    };

    assert_eq!(input.batch_parameter("image", 1), Some(&json!("b")));
    assert_eq!(input.batch_parameter("threshold", 0), None);
    assert_eq!(input.parameter("threshold"), Some(&json!(0.5)));
  }
}
