//! Workflow runtime.
//!
//! The [`Runtime`] struct is the main entry point for executing workflows.
//! It owns a compiled workflow and the blocks implementing its steps, and
//! provides `invoke(inputs, cancel)` to run the full graph against a fresh
//! [`ExecutionCache`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use trellis_workflow::selector::{input_selector, step_selector};
use trellis_workflow::{StepNode, Workflow};

use crate::batch_index::DynamicBatchIndex;
use crate::block::{Block, BlockInput, BlockRegistry};
use crate::cache::ExecutionCache;
use crate::error::RuntimeError;
use crate::input::{InputResolver, WorkflowInputs, is_batch_selector};
use crate::result::{InvokeResult, StepResult, collect_outputs};

/// Handle for a spawned block invocation.
type InvocationHandle = tokio::task::JoinHandle<Result<Invocation, RuntimeError>>;

/// Output of one block invocation, waiting to be registered.
struct Invocation {
  step_name: String,
  batch_oriented: bool,
  indices: Vec<DynamicBatchIndex>,
  output: Value,
}

/// Configuration for the runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
  /// Maximum number of batch elements handed to a block per invocation.
  /// `None` runs every live element in one invocation.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub batch_chunk_size: Option<usize>,
}

/// The workflow runtime.
///
/// Handles graph traversal, scheduling and input assembly, and records
/// every step's outputs in the execution cache.
pub struct Runtime {
  workflow: Workflow,
  blocks: BlockRegistry,
  config: RuntimeConfig,
}

impl Runtime {
  /// Create a new runtime for the given workflow.
  pub fn new(
    workflow: Workflow,
    blocks: BlockRegistry,
    config: RuntimeConfig,
  ) -> Result<Self, RuntimeError> {
    if config.batch_chunk_size == Some(0) {
      return Err(RuntimeError::InvalidConfig {
        message: "batch_chunk_size must be greater than zero".to_string(),
      });
    }

    let runtime = Self {
      workflow,
      blocks,
      config,
    };
    runtime.validate_workflow()?;
    Ok(runtime)
  }

  /// Execute the workflow with the given inputs.
  #[instrument(
    name = "runtime_invoke",
    skip(self, inputs, cancel),
    fields(
      workflow_id = %self.workflow.workflow_id,
    )
  )]
  pub async fn invoke(
    &self,
    inputs: Map<String, Value>,
    cancel: CancellationToken,
  ) -> Result<InvokeResult, RuntimeError> {
    let execution_id = uuid::Uuid::new_v4().to_string();

    info!(
      execution_id = %execution_id,
      workflow_id = %self.workflow.workflow_id,
      "workflow_started"
    );

    let result = self.run(inputs, &execution_id, &cancel).await;

    match &result {
      Ok(_) => {
        info!(execution_id = %execution_id, "workflow_completed");
      }
      Err(e) => {
        error!(execution_id = %execution_id, error = %e, "workflow_failed");
      }
    }

    result
  }

  /// Get a reference to the workflow.
  pub fn workflow(&self) -> &Workflow {
    &self.workflow
  }

  pub fn config(&self) -> &RuntimeConfig {
    &self.config
  }

  async fn run(
    &self,
    inputs: Map<String, Value>,
    execution_id: &str,
    cancel: &CancellationToken,
  ) -> Result<InvokeResult, RuntimeError> {
    let inputs = WorkflowInputs::new(&self.workflow, inputs)?;
    let mut cache = ExecutionCache::init(&self.workflow);
    let mut lineage: HashMap<String, Vec<DynamicBatchIndex>> = HashMap::new();
    let mut step_results: HashMap<String, StepResult> = HashMap::new();

    self
      .run_execution_loop(
        &inputs,
        &mut cache,
        &mut lineage,
        &mut step_results,
        execution_id,
        cancel,
      )
      .await?;

    let outputs = collect_outputs(&self.workflow, &inputs, &cache, &lineage)?;

    Ok(InvokeResult {
      execution_id: execution_id.to_string(),
      outputs,
      step_results,
    })
  }

  /// Run ready steps layer by layer until every step has completed.
  ///
  /// Blocks of one layer run concurrently. Their outputs are registered in
  /// the cache only once the whole layer has finished.
  async fn run_execution_loop(
    &self,
    inputs: &WorkflowInputs,
    cache: &mut ExecutionCache,
    lineage: &mut HashMap<String, Vec<DynamicBatchIndex>>,
    step_results: &mut HashMap<String, StepResult>,
    execution_id: &str,
    cancel: &CancellationToken,
  ) -> Result<(), RuntimeError> {
    let mut completed: HashSet<String> = self
      .workflow
      .input_nodes()
      .into_iter()
      .map(|input| input_selector(&input.name))
      .collect();

    loop {
      if cancel.is_cancelled() {
        warn!(execution_id = %execution_id, "workflow cancelled");
        return Err(RuntimeError::Cancelled);
      }

      let ready = self.find_ready_steps(&completed);
      if ready.is_empty() {
        break;
      }

      info!(
        execution_id = %execution_id,
        ready_steps = ?ready.iter().map(|s| s.name()).collect::<Vec<_>>(),
        "executing layer of ready steps"
      );

      let handles = {
        let resolver = InputResolver {
          inputs,
          cache: &*cache,
          lineage: &*lineage,
        };
        self.execute_ready_steps(&ready, &resolver, step_results, execution_id)?
      };

      // Wait for all invocations
      let results = tokio::select! {
        results = futures::future::join_all(handles) => results,
        _ = cancel.cancelled() => {
          warn!(execution_id = %execution_id, "workflow cancelled during step execution");
          return Err(RuntimeError::Cancelled);
        }
      };

      // Register outputs
      for result in results {
        let invocation = result
          .map_err(|e| RuntimeError::InvalidGraph {
            message: format!("block join error: {}", e),
          })?
          .map_err(|e| {
            error!(execution_id = %execution_id, error = %e, "step_failed");
            e
          })?;
        register_invocation(cache, lineage, step_results, invocation)?;
      }

      for step in ready {
        if step.is_batch_oriented() {
          lineage.entry(step.name().to_string()).or_default();
        }
        info!(
          execution_id = %execution_id,
          step_name = %step.name(),
          "step_completed"
        );
        completed.insert(step_selector(step.name()));
      }
    }

    Ok(())
  }

  /// Find steps that are ready to execute (all upstream nodes completed).
  fn find_ready_steps(&self, completed: &HashSet<String>) -> Vec<&StepNode> {
    let graph = self.workflow.graph();

    self
      .workflow
      .step_nodes()
      .into_iter()
      .filter(|step| {
        let node_id = step_selector(step.name());
        !completed.contains(&node_id)
          && graph
            .upstream(&node_id)
            .iter()
            .all(|up| completed.contains(up))
      })
      .collect()
  }

  /// Spawn block invocations for every ready step.
  fn execute_ready_steps(
    &self,
    ready: &[&StepNode],
    resolver: &InputResolver<'_>,
    step_results: &mut HashMap<String, StepResult>,
    execution_id: &str,
  ) -> Result<Vec<InvocationHandle>, RuntimeError> {
    let mut handles = Vec::new();

    for step in ready {
      let block = self.block_for(step)?;
      let mut summary = StepResult {
        step_name: step.name().to_string(),
        batch_oriented: step.is_batch_oriented(),
        ..StepResult::default()
      };

      let invocations: Vec<(Vec<DynamicBatchIndex>, Map<String, Value>)> = if step
        .is_batch_oriented()
      {
        let plan = resolver.resolve_batch(step)?;
        summary.skipped = plan.skipped;
        if plan.skipped > 0 {
          info!(
            execution_id = %execution_id,
            step_name = %step.name(),
            skipped = plan.skipped,
            "batch elements skipped"
          );
        }
        plan
          .chunks(self.config.batch_chunk_size)
          .into_iter()
          .map(|chunk| (chunk.indices, chunk.parameters))
          .collect()
      } else {
        vec![(Vec::new(), resolver.resolve_non_batch(step)?)]
      };

      summary.invocations = invocations.len();
      step_results.insert(summary.step_name.clone(), summary);

      for (indices, parameters) in invocations {
        let input = BlockInput {
          execution_id: execution_id.to_string(),
          step_name: step.name().to_string(),
          indices,
          parameters,
        };

        info!(
          execution_id = %execution_id,
          step_name = %step.name(),
          batch_size = input.indices.len(),
          "step_started"
        );

        handles.push(tokio::spawn(execute_block(
          block.clone(),
          input,
          step.is_batch_oriented(),
        )));
      }
    }

    Ok(handles)
  }

  fn block_for(&self, step: &StepNode) -> Result<Arc<dyn Block>, RuntimeError> {
    self
      .blocks
      .get(&step.manifest.block_type)
      .ok_or_else(|| RuntimeError::BlockNotFound {
        step_name: step.name().to_string(),
        block_type: step.manifest.block_type.clone(),
      })
  }

  /// Validate the workflow against the registered blocks.
  fn validate_workflow(&self) -> Result<(), RuntimeError> {
    self.workflow.validate()?;

    for step in self.workflow.step_nodes() {
      self.block_for(step)?;

      let batch_parameters: Vec<&str> = step
        .manifest
        .input_selectors()
        .into_iter()
        .filter(|(_, selector)| is_batch_selector(&self.workflow, selector) == Some(true))
        .map(|(name, _)| name)
        .collect();

      if step.is_batch_oriented() && batch_parameters.is_empty() {
        return Err(RuntimeError::InvalidGraph {
          message: format!(
            "batch-oriented step '{}' has no batch-oriented parameter",
            step.name()
          ),
        });
      }
      if !step.is_batch_oriented() && !batch_parameters.is_empty() {
        return Err(RuntimeError::InvalidGraph {
          message: format!(
            "non-batch step '{}' consumes batch data through {:?}",
            step.name(),
            batch_parameters
          ),
        });
      }
    }

    Ok(())
  }
}

/// Run one block invocation.
#[instrument(
  name = "block_execute",
  skip(block, input, batch_oriented),
  fields(
    execution_id = %input.execution_id,
    step_name = %input.step_name,
  )
)]
async fn execute_block(
  block: Arc<dyn Block>,
  input: BlockInput,
  batch_oriented: bool,
) -> Result<Invocation, RuntimeError> {
  let step_name = input.step_name.clone();
  let indices = input.indices.clone();

  let output = block
    .run(input)
    .await
    .map_err(|source| RuntimeError::BlockExecution {
      step_name: step_name.clone(),
      source,
    })?;

  Ok(Invocation {
    step_name,
    batch_oriented,
    indices,
    output,
  })
}

fn register_invocation(
  cache: &mut ExecutionCache,
  lineage: &mut HashMap<String, Vec<DynamicBatchIndex>>,
  step_results: &mut HashMap<String, StepResult>,
  invocation: Invocation,
) -> Result<(), RuntimeError> {
  let Invocation {
    step_name,
    batch_oriented,
    indices,
    output,
  } = invocation;

  if !batch_oriented {
    cache.register_non_batch_step_outputs(&step_name, output)?;
    return Ok(());
  }

  let Value::Array(outputs) = output else {
    return Err(RuntimeError::InvalidOutput {
      step_name,
      message: format!(
        "batch-oriented block must return a list, got {}",
        crate::step_cache::json_type_name(&output)
      ),
    });
  };

  let registered = cache.register_batch_of_step_outputs(&step_name, &indices, outputs)?;
  if let Some(summary) = step_results.get_mut(&step_name) {
    summary.indices.extend(registered.iter().cloned());
  }
  lineage.entry(step_name).or_default().extend(registered);
  Ok(())
}

#[cfg(test)]
mod tests {
  use async_trait::async_trait;
  use serde_json::json;
  use trellis_workflow::{Node, OutputDefinition, StepManifest};

  use super::*;
  use crate::block::BlockError;

  struct Noop;

  #[async_trait]
  impl Block for Noop {
    async fn run(&self, _input: BlockInput) -> Result<Value, BlockError> {
      Ok(json!({}))
    }
  }

  fn step(name: &str, batch: bool, inputs: &[(&str, Value)]) -> Node {
    Node::step(StepNode {
      manifest: StepManifest {
        name: name.to_string(),
        block_type: "noop".to_string(),
        inputs: inputs
          .iter()
          .map(|(k, v)| (k.to_string(), v.clone()))
          .collect(),
        outputs: vec![OutputDefinition::new("value")],
      },
      batch_oriented: batch,
    })
  }

  fn registry() -> BlockRegistry {
    let mut blocks = BlockRegistry::new();
    blocks.register("noop", Noop);
    blocks
  }

  #[test]
  fn test_rejects_zero_chunk_size() {
    let workflow = Workflow::new("wf", "Zero chunk", vec![Node::input("image", true)]).unwrap();
    let config = RuntimeConfig {
      batch_chunk_size: Some(0),
    };

    assert!(matches!(
      Runtime::new(workflow, registry(), config),
      Err(RuntimeError::InvalidConfig { .. })
    ));
  }

  #[test]
  fn test_rejects_missing_block() {
    let workflow = Workflow::new(
      "wf",
      "Missing block",
      vec![
        Node::input("image", true),
        step("detect", true, &[("image", json!("$inputs.image"))]),
      ],
    )
    .unwrap();

    let result = Runtime::new(workflow, BlockRegistry::new(), RuntimeConfig::default());
    assert!(matches!(
      result,
      Err(RuntimeError::BlockNotFound { step_name, block_type })
        if step_name == "detect" && block_type == "noop"
    ));
  }

  #[test]
  fn test_batch_orientation_must_match_parameters() {
    let batch_without_batch_input = Workflow::new(
      "wf",
      "No batch parameter",
      vec![
        Node::input("threshold", false),
        step("detect", true, &[("threshold", json!("$inputs.threshold"))]),
      ],
    )
    .unwrap();
    assert!(matches!(
      Runtime::new(batch_without_batch_input, registry(), RuntimeConfig::default()),
      Err(RuntimeError::InvalidGraph { .. })
    ));

    let scalar_with_batch_input = Workflow::new(
      "wf",
      "Batch parameter in scalar step",
      vec![
        Node::input("image", true),
        step("summary", false, &[("image", json!("$inputs.image"))]),
      ],
    )
    .unwrap();
    assert!(matches!(
      Runtime::new(scalar_with_batch_input, registry(), RuntimeConfig::default()),
      Err(RuntimeError::InvalidGraph { .. })
    ));
  }

  #[test]
  fn test_runtime_config_serde() {
    let config: RuntimeConfig = serde_json::from_value(json!({})).unwrap();
    assert_eq!(config, RuntimeConfig::default());

    let config: RuntimeConfig = serde_json::from_value(json!({"batch_chunk_size": 8})).unwrap();
    assert_eq!(config.batch_chunk_size, Some(8));
    assert_eq!(serde_json::to_value(RuntimeConfig::default()).unwrap(), json!({}));
  }
}
