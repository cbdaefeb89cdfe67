//! Execution result types.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use trellis_workflow::{OutputNode, Selector, StepOutputSelector, Workflow};

use crate::batch_index::DynamicBatchIndex;
use crate::cache::ExecutionCache;
use crate::error::RuntimeError;
use crate::input::WorkflowInputs;

/// Summary of one step's execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
  pub step_name: String,
  pub batch_oriented: bool,
  /// Number of block invocations (chunks for batch-oriented steps).
  pub invocations: usize,
  /// Batch elements written to the cache, after nested expansion.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub indices: Vec<DynamicBatchIndex>,
  /// Batch elements skipped because an input was missing or null.
  #[serde(default)]
  pub skipped: usize,
}

/// Result of a complete workflow invocation.
#[derive(Debug, Serialize, Deserialize)]
pub struct InvokeResult {
  /// Unique execution ID.
  pub execution_id: String,
  /// One entry per top-level batch element, keyed by output name. A
  /// workflow without batch inputs yields a single entry.
  pub outputs: Vec<Map<String, Value>>,
  /// Per-step summaries, keyed by step name.
  pub step_results: HashMap<String, StepResult>,
}

/// Assemble the workflow outputs from a finished run.
pub(crate) fn collect_outputs(
  workflow: &Workflow,
  inputs: &WorkflowInputs,
  cache: &ExecutionCache,
  lineage: &HashMap<String, Vec<DynamicBatchIndex>>,
) -> Result<Vec<Map<String, Value>>, RuntimeError> {
  let entries = inputs.batch_size().unwrap_or(1);
  let mut outputs = vec![Map::new(); entries];

  for output in workflow.output_nodes() {
    let values = match Selector::parse(&output.selector) {
      Some(Selector::Input(name)) => (0..entries)
        .map(|i| {
          let value = if inputs.is_batch(&name) {
            inputs.batch_value(&name, &DynamicBatchIndex::root(i))
          } else {
            inputs.scalar(&name)
          };
          value.cloned().unwrap_or(Value::Null)
        })
        .collect(),
      Some(Selector::StepOutput(selector)) => {
        step_output_values(cache, lineage, &selector, entries)?
      }
      _ => return Err(unsupported_output(output)),
    };

    for (entry, value) in outputs.iter_mut().zip(values) {
      entry.insert(output.name.clone(), value);
    }
  }

  Ok(outputs)
}

fn step_output_values(
  cache: &ExecutionCache,
  lineage: &HashMap<String, Vec<DynamicBatchIndex>>,
  selector: &StepOutputSelector,
  entries: usize,
) -> Result<Vec<Value>, RuntimeError> {
  let step_name = &selector.step_name;

  if !cache.step_outputs_batches(step_name)? {
    let value = if selector.is_wildcard() {
      mapping(cache.get_all_non_batch_step_outputs(step_name)?)
    } else {
      cache
        .get_non_batch_output(&selector.to_string())?
        .cloned()
        .unwrap_or(Value::Null)
    };
    return Ok(vec![value; entries]);
  }

  let indices = lineage.get(step_name).map(Vec::as_slice).unwrap_or(&[]);
  let values: Vec<Value> = if selector.is_wildcard() {
    cache
      .get_all_batch_step_outputs(step_name, indices, None)?
      .into_iter()
      .map(mapping)
      .collect()
  } else {
    cache
      .get_batch_output(&selector.to_string(), indices, None)?
      .into_iter()
      .map(|value| value.cloned().unwrap_or(Value::Null))
      .collect()
  };
  let written: Vec<(&DynamicBatchIndex, Value)> = indices.iter().zip(values).collect();

  Ok(
    (0..entries)
      .map(|i| nest(&DynamicBatchIndex::root(i), &written))
      .collect(),
  )
}

/// Value stored under `prefix`, or the nested list of everything stored
/// below it. Gaps in a list are `null`.
fn nest(prefix: &DynamicBatchIndex, written: &[(&DynamicBatchIndex, Value)]) -> Value {
  let below: Vec<&(&DynamicBatchIndex, Value)> = written
    .iter()
    .filter(|(index, _)| index.starts_with(prefix))
    .collect();

  if let Some((_, value)) = below.iter().find(|(index, _)| *index == prefix) {
    return value.clone();
  }

  let depth = prefix.depth();
  let Some(width) = below
    .iter()
    .filter_map(|(index, _)| index.as_slice().get(depth))
    .max()
    .map(|last| last + 1)
  else {
    return Value::Null;
  };

  let owned: Vec<(&DynamicBatchIndex, Value)> = below
    .into_iter()
    .map(|(index, value)| (*index, value.clone()))
    .collect();
  Value::Array(
    (0..width)
      .map(|sub| nest(&prefix.child(sub), &owned))
      .collect(),
  )
}

fn mapping(outputs: BTreeMap<String, Option<Value>>) -> Value {
  Value::Object(
    outputs
      .into_iter()
      .map(|(name, value)| (name, value.unwrap_or(Value::Null)))
      .collect(),
  )
}

fn unsupported_output(output: &OutputNode) -> RuntimeError {
  RuntimeError::InvalidGraph {
    message: format!(
      "output '{}' must reference a workflow input or a step output, got '{}'",
      output.name, output.selector
    ),
  }
}
