//! Trellis
//!
//! A workflow execution engine for composable inference pipelines. A
//! compiled [`Workflow`] is a graph of batch-oriented and scalar steps; the
//! [`Runtime`] runs it step by step, storing every output in an
//! [`ExecutionCache`] addressed by selectors and [`DynamicBatchIndex`]es.
//!
//! The member crates can be used directly; this crate re-exports their
//! public API.

pub use trellis_runtime::{
  BatchStepCache, Block, BlockError, BlockInput, BlockRegistry, CacheError, DynamicBatchIndex,
  ExecutionCache, InvokeResult, NonBatchStepCache, OutputContractError, Runtime, RuntimeConfig,
  RuntimeError, StepResult,
};
pub use trellis_workflow::{
  Graph, InputNode, Node, NodeType, OutputDefinition, OutputNode, Selector, StepManifest,
  StepNode, StepOutputSelector, Workflow, WorkflowError, selector,
};
