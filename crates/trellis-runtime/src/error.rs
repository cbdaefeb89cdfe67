//! Runtime error types.

use std::collections::BTreeSet;

use trellis_workflow::WorkflowError;

use crate::batch_index::DynamicBatchIndex;
use crate::block::BlockError;

/// Ways a block's outputs can break the shape the cache expects.
#[derive(Debug, thiserror::Error)]
pub enum OutputContractError {
  /// Outputs and indices differ in length.
  #[error("outputs misaligned with indices: {indices} indices, {outputs} outputs")]
  Misaligned { indices: usize, outputs: usize },

  /// Some elements are nested lists while others are plain mappings.
  #[error("batch output shape mismatch: elements must be all mappings or all lists of mappings")]
  ShapeMismatch,

  /// An element that should be a mapping has another JSON type.
  #[error("output for batch element {index} is {found}, expected a mapping")]
  NotAMapping {
    index: DynamicBatchIndex,
    found: &'static str,
  },

  /// Non-batch outputs are not a mapping.
  #[error("non-batch output is {found}, expected a mapping")]
  NonBatchNotAMapping { found: &'static str },

  /// A mapping does not carry exactly the step's output properties.
  #[error(
    "step '{step_name}' did not produce required outputs. expected: {expected:?}, got: {actual:?}"
  )]
  PropertiesMismatch {
    step_name: String,
    expected: BTreeSet<String>,
    actual: BTreeSet<String>,
  },
}

/// Errors raised by the execution cache.
///
/// Every variant except [`CacheError::BlockContract`] is an
/// internal-consistency error: the compiled graph handed to the runtime
/// disagrees with the cache, which is an engine bug rather than a user error.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  /// The step was never registered in the cache.
  #[error("execution engine error: step '{step_name}' is not registered in the execution cache")]
  UnknownStep { step_name: String },

  /// The selector does not point at a registered or declared step output.
  #[error("execution engine error: output '{selector}' is not registered in the execution cache")]
  UnregisteredSelector { selector: String },

  /// Batch-mode access to a non-batch step or the other way round.
  #[error(
    "execution engine error: {operation} is not supported for step '{step_name}' (batch-oriented: {batch_oriented})"
  )]
  ModeMismatch {
    step_name: String,
    operation: &'static str,
    batch_oriented: bool,
  },

  /// The block implementing a step returned malformed outputs.
  #[error("block implementing step '{step_name}' violated its output contract: {source}")]
  BlockContract {
    step_name: String,
    #[source]
    source: OutputContractError,
  },
}

impl CacheError {
  /// Whether this error points at an engine bug rather than a misbehaving block.
  pub fn is_internal(&self) -> bool {
    !matches!(self, Self::BlockContract { .. })
  }
}

/// Errors that can occur during runtime execution.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
  /// Execution was cancelled.
  #[error("execution cancelled")]
  Cancelled,

  /// The compiled workflow is invalid.
  #[error(transparent)]
  Workflow(#[from] WorkflowError),

  /// Reading or writing the execution cache failed.
  #[error(transparent)]
  Cache(#[from] CacheError),

  /// No block is registered for a step's block type.
  #[error("no block registered for type '{block_type}' used by step '{step_name}'")]
  BlockNotFound {
    step_name: String,
    block_type: String,
  },

  /// A block failed while running.
  #[error("block execution failed for step '{step_name}': {source}")]
  BlockExecution {
    step_name: String,
    #[source]
    source: BlockError,
  },

  /// A workflow input is missing or has the wrong shape.
  #[error("invalid workflow input '{name}': {message}")]
  InvalidInput { name: String, message: String },

  /// Failed to assemble a step's parameters.
  #[error("input resolution failed for step '{step_name}': {message}")]
  InputResolution { step_name: String, message: String },

  /// A block returned something other than the envelope its step requires.
  #[error("invalid output from step '{step_name}': {message}")]
  InvalidOutput { step_name: String, message: String },

  /// The runtime configuration is unusable.
  #[error("invalid runtime config: {message}")]
  InvalidConfig { message: String },

  /// The workflow graph cannot be executed.
  #[error("invalid graph: {message}")]
  InvalidGraph { message: String },
}
