//! Step input assembly.
//!
//! Resolves each step parameter against the workflow inputs and the
//! execution cache, then lines batch parameters up on the step's dynamic
//! batch indices.
//!
//! # Lineage
//! A batch-oriented step runs at the indices of its deepest batch parameter.
//! Shallower parameters are broadcast: the value for `(1, 3)` of a depth-1
//! parameter is its value at `(1,)`.
//!
//! # Skipped elements
//! An element is live only if every batch parameter has a non-null value
//! for it. Dead elements never reach the block, nothing is registered for
//! them, and steps further down see them as missing too.

use std::collections::{BTreeSet, HashMap};

use serde_json::{Map, Value};
use trellis_workflow::{Selector, StepNode, Workflow};

use crate::batch_index::DynamicBatchIndex;
use crate::cache::ExecutionCache;
use crate::error::RuntimeError;
use crate::step_cache::json_type_name;

/// Workflow inputs supplied to one invocation.
#[derive(Debug)]
pub(crate) struct WorkflowInputs {
  batch: HashMap<String, Vec<Value>>,
  scalar: HashMap<String, Value>,
  batch_size: Option<usize>,
}

impl WorkflowInputs {
  /// Check `supplied` against the workflow's declared inputs.
  ///
  /// Batch inputs must be arrays, all of the same length.
  pub(crate) fn new(workflow: &Workflow, mut supplied: Map<String, Value>) -> Result<Self, RuntimeError> {
    let mut batch = HashMap::new();
    let mut scalar = HashMap::new();
    let mut batch_size: Option<usize> = None;

    for input in workflow.input_nodes() {
      let value = supplied
        .remove(&input.name)
        .ok_or_else(|| RuntimeError::InvalidInput {
          name: input.name.clone(),
          message: "no value supplied".to_string(),
        })?;

      if !input.batch_oriented {
        scalar.insert(input.name.clone(), value);
        continue;
      }

      let Value::Array(elements) = value else {
        return Err(RuntimeError::InvalidInput {
          name: input.name.clone(),
          message: format!("batch input must be a list, got {}", json_type_name(&value)),
        });
      };
      match batch_size {
        Some(size) if size != elements.len() => {
          return Err(RuntimeError::InvalidInput {
            name: input.name.clone(),
            message: format!(
              "batch input has {} elements, other batch inputs have {}",
              elements.len(),
              size
            ),
          });
        }
        _ => batch_size = Some(elements.len()),
      }
      batch.insert(input.name.clone(), elements);
    }

    Ok(Self {
      batch,
      scalar,
      batch_size,
    })
  }

  /// Number of top-level batch elements, `None` when no input is batch-oriented.
  pub(crate) fn batch_size(&self) -> Option<usize> {
    self.batch_size
  }

  pub(crate) fn root_indices(&self) -> Vec<DynamicBatchIndex> {
    (0..self.batch_size.unwrap_or(0))
      .map(DynamicBatchIndex::root)
      .collect()
  }

  pub(crate) fn is_batch(&self, name: &str) -> bool {
    self.batch.contains_key(name)
  }

  pub(crate) fn scalar(&self, name: &str) -> Option<&Value> {
    self.scalar.get(name)
  }

  /// Value of a batch input for the top-level element `index` belongs to.
  pub(crate) fn batch_value(&self, name: &str, index: &DynamicBatchIndex) -> Option<&Value> {
    let position = *index.as_slice().first()?;
    self.batch.get(name)?.get(position)
  }
}

/// Whether a selector produces batch data, judged from the compiled graph.
/// `None` for selectors that do not point at data.
pub(crate) fn is_batch_selector(workflow: &Workflow, selector: &Selector) -> Option<bool> {
  match selector {
    Selector::Input(name) => workflow.get_input(name).map(|i| i.batch_oriented),
    Selector::StepOutput(output) => workflow
      .get_step(&output.step_name)
      .map(StepNode::is_batch_oriented),
    Selector::Step(_) | Selector::Output(_) => None,
  }
}

/// One invocation's worth of a batch step.
#[derive(Debug, Clone)]
pub(crate) struct BatchChunk {
  pub(crate) indices: Vec<DynamicBatchIndex>,
  pub(crate) parameters: Map<String, Value>,
}

/// Resolved inputs of a batch step over its live elements.
#[derive(Debug, Default)]
pub(crate) struct BatchPlan {
  /// Live elements, sorted.
  pub(crate) indices: Vec<DynamicBatchIndex>,
  /// Elements skipped because a batch parameter was missing or null.
  pub(crate) skipped: usize,
  batch_parameters: Vec<(String, Vec<Value>)>,
  scalar_parameters: Map<String, Value>,
}

impl BatchPlan {
  /// Split the plan into invocations of at most `chunk_size` elements.
  pub(crate) fn chunks(&self, chunk_size: Option<usize>) -> Vec<BatchChunk> {
    if self.indices.is_empty() {
      return Vec::new();
    }
    let chunk_size = chunk_size.unwrap_or(self.indices.len()).max(1);

    (0..self.indices.len())
      .step_by(chunk_size)
      .map(|start| {
        let end = (start + chunk_size).min(self.indices.len());
        let mut parameters = self.scalar_parameters.clone();
        for (name, values) in &self.batch_parameters {
          parameters.insert(name.clone(), Value::Array(values[start..end].to_vec()));
        }
        BatchChunk {
          indices: self.indices[start..end].to_vec(),
          parameters,
        }
      })
      .collect()
  }
}

/// Where a batch parameter's values come from.
enum BatchSource<'a> {
  Input(&'a str),
  StepOutput {
    selector: String,
    lineage: &'a [DynamicBatchIndex],
  },
}

impl BatchSource<'_> {
  fn lineage_depth(&self) -> Option<usize> {
    match self {
      Self::Input(_) => Some(1),
      Self::StepOutput { lineage, .. } => lineage.first().map(DynamicBatchIndex::depth),
    }
  }
}

/// Resolves step parameters for one invocation.
pub(crate) struct InputResolver<'a> {
  pub(crate) inputs: &'a WorkflowInputs,
  pub(crate) cache: &'a ExecutionCache,
  /// Indices registered so far by each batch step.
  pub(crate) lineage: &'a HashMap<String, Vec<DynamicBatchIndex>>,
}

impl<'a> InputResolver<'a> {
  /// Parameters of a non-batch step.
  pub(crate) fn resolve_non_batch(&self, step: &StepNode) -> Result<Map<String, Value>, RuntimeError> {
    let mut parameters = Map::new();
    for (name, value) in sorted_parameters(step) {
      let resolved = match value.as_str().and_then(Selector::parse) {
        None => value.clone(),
        Some(Selector::Input(input)) if !self.inputs.is_batch(&input) => self
          .inputs
          .scalar(&input)
          .cloned()
          .unwrap_or(Value::Null),
        Some(Selector::StepOutput(output)) if !self.cache.step_outputs_batches(&output.step_name)? => {
          self
            .cache
            .get_non_batch_output(&output.to_string())?
            .cloned()
            .unwrap_or(Value::Null)
        }
        Some(selector) => {
          return Err(resolution_error(
            step,
            format!("parameter '{}' cannot consume {:?} in a non-batch step", name, selector),
          ));
        }
      };
      parameters.insert(name.clone(), resolved);
    }
    Ok(parameters)
  }

  /// Parameters of a batch step, aligned on its live elements.
  pub(crate) fn resolve_batch(&self, step: &StepNode) -> Result<BatchPlan, RuntimeError> {
    let mut scalar_parameters = Map::new();
    let mut sources: Vec<(String, BatchSource<'a>)> = Vec::new();

    for (name, value) in sorted_parameters(step) {
      match value.as_str().and_then(Selector::parse) {
        None => {
          scalar_parameters.insert(name.clone(), value.clone());
        }
        Some(Selector::Input(input)) => {
          if self.inputs.is_batch(&input) {
            let (input_name, _) = self
              .inputs
              .batch
              .get_key_value(&input)
              .ok_or_else(|| resolution_error(step, format!("unknown input '{}'", input)))?;
            sources.push((name.clone(), BatchSource::Input(input_name.as_str())));
          } else {
            let scalar = self.inputs.scalar(&input).cloned().unwrap_or(Value::Null);
            scalar_parameters.insert(name.clone(), scalar);
          }
        }
        Some(Selector::StepOutput(output)) => {
          if self.cache.step_outputs_batches(&output.step_name)? {
            let lineage = self
              .lineage
              .get(&output.step_name)
              .map(Vec::as_slice)
              .unwrap_or(&[]);
            sources.push((
              name.clone(),
              BatchSource::StepOutput {
                selector: output.to_string(),
                lineage,
              },
            ));
          } else {
            let scalar = self
              .cache
              .get_non_batch_output(&output.to_string())?
              .cloned()
              .unwrap_or(Value::Null);
            scalar_parameters.insert(name.clone(), scalar);
          }
        }
        Some(selector) => {
          return Err(resolution_error(
            step,
            format!("parameter '{}' uses unsupported selector {:?}", name, selector),
          ));
        }
      }
    }

    if sources.is_empty() {
      return Err(resolution_error(
        step,
        "batch-oriented step has no batch parameters".to_string(),
      ));
    }

    let candidates = self.step_indices(&sources);

    let mut columns: Vec<(String, Vec<Option<Value>>)> = Vec::with_capacity(sources.len());
    for (name, source) in &sources {
      columns.push((name.clone(), self.source_values(source, &candidates)?));
    }

    let mut plan = BatchPlan {
      scalar_parameters,
      batch_parameters: columns
        .iter()
        .map(|(name, _)| (name.clone(), Vec::new()))
        .collect(),
      ..BatchPlan::default()
    };

    for (position, index) in candidates.into_iter().enumerate() {
      let live = columns
        .iter()
        .all(|(_, values)| matches!(&values[position], Some(v) if !v.is_null()));
      if !live {
        plan.skipped += 1;
        continue;
      }
      for ((_, values), (_, target)) in columns.iter_mut().zip(plan.batch_parameters.iter_mut()) {
        if let Some(value) = values[position].take() {
          target.push(value);
        }
      }
      plan.indices.push(index);
    }

    Ok(plan)
  }

  /// Indices a batch step runs at: the union of the indices of its deepest
  /// sources. A source with no elements at all leaves nothing to run.
  fn step_indices(&self, sources: &[(String, BatchSource<'_>)]) -> Vec<DynamicBatchIndex> {
    let depths: Vec<Option<usize>> = sources.iter().map(|(_, s)| s.lineage_depth()).collect();
    if depths.iter().any(Option::is_none) {
      return Vec::new();
    }
    let max_depth = depths.iter().flatten().copied().max().unwrap_or(0);

    let mut indices = BTreeSet::new();
    for (_, source) in sources {
      if source.lineage_depth() != Some(max_depth) {
        continue;
      }
      match source {
        BatchSource::Input(_) => indices.extend(self.inputs.root_indices()),
        BatchSource::StepOutput { lineage, .. } => indices.extend(lineage.iter().cloned()),
      }
    }
    indices.into_iter().collect()
  }

  fn source_values(
    &self,
    source: &BatchSource<'_>,
    indices: &[DynamicBatchIndex],
  ) -> Result<Vec<Option<Value>>, RuntimeError> {
    match source {
      BatchSource::Input(name) => Ok(
        indices
          .iter()
          .map(|index| self.inputs.batch_value(name, index).cloned())
          .collect(),
      ),
      BatchSource::StepOutput { selector, lineage } => {
        let depth = lineage.first().map(DynamicBatchIndex::depth).unwrap_or(0);
        let keys: Vec<DynamicBatchIndex> = indices.iter().map(|i| i.prefix(depth)).collect();
        let values = self.cache.get_batch_output(selector, &keys, None)?;
        Ok(values.into_iter().map(|v| v.cloned()).collect())
      }
    }
  }
}

fn sorted_parameters(step: &StepNode) -> Vec<(&String, &Value)> {
  let mut parameters: Vec<(&String, &Value)> = step.manifest.inputs.iter().collect();
  parameters.sort_by(|a, b| a.0.cmp(b.0));
  parameters
}

fn resolution_error(step: &StepNode, message: String) -> RuntimeError {
  RuntimeError::InputResolution {
    step_name: step.name().to_string(),
    message,
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;
  use trellis_workflow::{Node, OutputDefinition, StepManifest};

  use super::*;

  fn idx<const N: usize>(path: [usize; N]) -> DynamicBatchIndex {
    DynamicBatchIndex::from(path)
  }

  fn step(name: &str, batch: bool, inputs: &[(&str, Value)], outputs: &[&str]) -> StepNode {
    StepNode {
      manifest: StepManifest {
        name: name.to_string(),
        block_type: name.to_string(),
        inputs: inputs
          .iter()
          .map(|(k, v)| (k.to_string(), v.clone()))
          .collect(),
        outputs: outputs.iter().map(|o| OutputDefinition::new(*o)).collect(),
      },
      batch_oriented: batch,
    }
  }

  fn workflow(steps: Vec<StepNode>) -> Workflow {
    let mut nodes = vec![Node::input("image", true), Node::input("threshold", false)];
    nodes.extend(steps.into_iter().map(Node::step));
    Workflow::new("wf", "Input test", nodes).unwrap()
  }

  fn inputs(workflow: &Workflow) -> WorkflowInputs {
    let supplied = Map::from_iter([
      ("image".to_string(), json!(["img0", "img1"])),
      ("threshold".to_string(), json!(0.4)),
    ]);
    WorkflowInputs::new(workflow, supplied).unwrap()
  }

  #[test]
  fn test_workflow_inputs_validation() {
    let wf = workflow(Vec::new());

    let missing = WorkflowInputs::new(&wf, Map::from_iter([("image".to_string(), json!([]))]));
    assert!(matches!(missing, Err(RuntimeError::InvalidInput { name, .. }) if name == "threshold"));

    let not_a_list = WorkflowInputs::new(
      &wf,
      Map::from_iter([
        ("image".to_string(), json!("img")),
        ("threshold".to_string(), json!(0.4)),
      ]),
    );
    assert!(matches!(not_a_list, Err(RuntimeError::InvalidInput { name, .. }) if name == "image"));

    let ok = inputs(&wf);
    assert_eq!(ok.batch_size(), Some(2));
    assert_eq!(ok.root_indices(), vec![idx([0]), idx([1])]);
    assert_eq!(ok.batch_value("image", &idx([1, 4])), Some(&json!("img1")));
  }

  #[test]
  fn test_mismatched_batch_lengths() {
    let wf = Workflow::new(
      "wf",
      "Two batches",
      vec![Node::input("a", true), Node::input("b", true)],
    )
    .unwrap();

    let result = WorkflowInputs::new(
      &wf,
      Map::from_iter([
        ("a".to_string(), json!([1, 2])),
        ("b".to_string(), json!([1])),
      ]),
    );
    assert!(matches!(result, Err(RuntimeError::InvalidInput { .. })));
  }

  #[test]
  fn test_batch_plan_from_inputs() {
    let detect = step(
      "detect",
      true,
      &[
        ("image", json!("$inputs.image")),
        ("confidence", json!("$inputs.threshold")),
        ("model", json!("yolo")),
      ],
      &["predictions"],
    );
    let wf = workflow(vec![detect.clone()]);
    let inputs = inputs(&wf);
    let cache = ExecutionCache::init(&wf);
    let lineage = HashMap::new();
    let resolver = InputResolver {
      inputs: &inputs,
      cache: &cache,
      lineage: &lineage,
    };

    let plan = resolver.resolve_batch(&detect).unwrap();
    assert_eq!(plan.indices, vec![idx([0]), idx([1])]);
    assert_eq!(plan.skipped, 0);

    let chunks = plan.chunks(None);
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].parameters["image"], json!(["img0", "img1"]));
    assert_eq!(chunks[0].parameters["confidence"], json!(0.4));
    assert_eq!(chunks[0].parameters["model"], json!("yolo"));

    let chunks = plan.chunks(Some(1));
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[1].indices, vec![idx([1])]);
    assert_eq!(chunks[1].parameters["image"], json!(["img1"]));
  }

  #[test]
  fn test_broadcast_and_skip() {
    let crop = step(
      "crop",
      true,
      &[("image", json!("$inputs.image"))],
      &["crops"],
    );
    let classify = step(
      "classify",
      true,
      &[
        ("crop", json!("$steps.crop.crops")),
        ("image", json!("$inputs.image")),
      ],
      &["label"],
    );
    let wf = workflow(vec![crop, classify.clone()]);
    let inputs = inputs(&wf);
    let mut cache = ExecutionCache::init(&wf);
    let registered = cache
      .register_batch_of_step_outputs(
        "crop",
        &[idx([0]), idx([1])],
        vec![
          json!([{"crops": "c00"}, {"crops": null}]),
          json!([{"crops": "c10"}]),
        ],
      )
      .unwrap();
    let lineage = HashMap::from([("crop".to_string(), registered)]);
    let resolver = InputResolver {
      inputs: &inputs,
      cache: &cache,
      lineage: &lineage,
    };

    let plan = resolver.resolve_batch(&classify).unwrap();
    assert_eq!(plan.indices, vec![idx([0, 0]), idx([1, 0])]);
    assert_eq!(plan.skipped, 1);

    let chunk = &plan.chunks(None)[0];
    assert_eq!(chunk.parameters["crop"], json!(["c00", "c10"]));
    assert_eq!(chunk.parameters["image"], json!(["img0", "img1"]));
  }

  #[test]
  fn test_empty_upstream_leaves_nothing_to_run() {
    let detect = step("detect", true, &[("image", json!("$inputs.image"))], &["predictions"]);
    let crop = step(
      "crop",
      true,
      &[
        ("image", json!("$inputs.image")),
        ("predictions", json!("$steps.detect.predictions")),
      ],
      &["crops"],
    );
    let wf = workflow(vec![detect, crop.clone()]);
    let inputs = inputs(&wf);
    let cache = ExecutionCache::init(&wf);
    let lineage = HashMap::from([("detect".to_string(), Vec::new())]);
    let resolver = InputResolver {
      inputs: &inputs,
      cache: &cache,
      lineage: &lineage,
    };

    let plan = resolver.resolve_batch(&crop).unwrap();
    assert!(plan.indices.is_empty());
    assert!(plan.chunks(Some(4)).is_empty());
  }

  #[test]
  fn test_non_batch_parameters() {
    let config = step(
      "config",
      false,
      &[("threshold", json!("$inputs.threshold")), ("name", json!("cfg"))],
      &["value"],
    );
    let report = step("report", false, &[("value", json!("$steps.config.value"))], &["text"]);
    let wf = workflow(vec![config.clone(), report.clone()]);
    let inputs = inputs(&wf);
    let mut cache = ExecutionCache::init(&wf);
    let lineage = HashMap::new();

    {
      let resolver = InputResolver {
        inputs: &inputs,
        cache: &cache,
        lineage: &lineage,
      };
      let parameters = resolver.resolve_non_batch(&config).unwrap();
      assert_eq!(parameters["threshold"], json!(0.4));
      assert_eq!(parameters["name"], json!("cfg"));
    }

    cache
      .register_non_batch_step_outputs("config", json!({"value": 7}))
      .unwrap();
    let resolver = InputResolver {
      inputs: &inputs,
      cache: &cache,
      lineage: &lineage,
    };
    let parameters = resolver.resolve_non_batch(&report).unwrap();
    assert_eq!(parameters["value"], json!(7));
  }

  #[test]
  fn test_non_batch_step_rejects_batch_input() {
    let summary = step("summary", false, &[("image", json!("$inputs.image"))], &["text"]);
    let wf = workflow(vec![summary.clone()]);
    let inputs = inputs(&wf);
    let cache = ExecutionCache::init(&wf);
    let lineage = HashMap::new();
    let resolver = InputResolver {
      inputs: &inputs,
      cache: &cache,
      lineage: &lineage,
    };

    assert!(matches!(
      resolver.resolve_non_batch(&summary),
      Err(RuntimeError::InputResolution { .. })
    ));
  }

  #[test]
  fn test_is_batch_selector() {
    let detect = step("detect", true, &[("image", json!("$inputs.image"))], &["predictions"]);
    let wf = workflow(vec![detect]);

    assert_eq!(is_batch_selector(&wf, &Selector::Input("image".to_string())), Some(true));
    assert_eq!(is_batch_selector(&wf, &Selector::Input("threshold".to_string())), Some(false));
    assert_eq!(
      is_batch_selector(&wf, &Selector::parse("$steps.detect.predictions").unwrap()),
      Some(true)
    );
    assert_eq!(is_batch_selector(&wf, &Selector::Step("detect".to_string())), None);
  }
}
