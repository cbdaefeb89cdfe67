//! Execution cache.
//!
//! Owns the outputs of every step for the duration of one workflow run. The
//! cache is built from the compiled workflow with an empty store per step,
//! filled as steps complete, and dropped when the run ends.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value;
use tracing::debug;
use trellis_workflow::selector::WILDCARD_PROPERTY;
use trellis_workflow::{OutputDefinition, StepOutputSelector, Workflow};

use crate::batch_index::DynamicBatchIndex;
use crate::error::CacheError;
use crate::step_cache::{BatchStepCache, NonBatchStepCache};

/// Store backing a single step. The variant is fixed when the step is
/// registered and doubles as the step's batch-compatibility flag.
#[derive(Debug)]
enum StepCache {
  Batch(BatchStepCache),
  NonBatch(NonBatchStepCache),
}

impl StepCache {
  fn is_batch(&self) -> bool {
    matches!(self, Self::Batch(_))
  }

  fn is_property_defined(&self, property_name: &str) -> bool {
    match self {
      Self::Batch(cache) => cache.is_property_defined(property_name),
      Self::NonBatch(cache) => cache.is_property_defined(property_name),
    }
  }
}

/// Registry of step outputs for one workflow run.
#[derive(Debug, Default)]
pub struct ExecutionCache {
  steps: HashMap<String, StepCache>,
  step_outputs_registered: HashSet<String>,
}

impl ExecutionCache {
  pub fn new() -> Self {
    Self::default()
  }

  /// Create a cache with an empty store for every step of the workflow.
  pub fn init(workflow: &Workflow) -> Self {
    let mut cache = Self::new();
    for step in workflow.step_nodes() {
      cache.register_step(
        step.name(),
        step.is_batch_oriented(),
        step.manifest.actual_outputs(),
      );
    }
    cache
  }

  /// Register a step with the store kind matching its batch orientation.
  /// Registering a known step again has no effect.
  pub fn register_step(
    &mut self,
    step_name: &str,
    compatible_with_batches: bool,
    outputs: &[OutputDefinition],
  ) {
    if self.contains_step(step_name) {
      return;
    }
    let step_cache = if compatible_with_batches {
      StepCache::Batch(BatchStepCache::new(step_name, outputs))
    } else {
      StepCache::NonBatch(NonBatchStepCache::new(step_name, outputs))
    };
    debug!(
      step_name = %step_name,
      compatible_with_batches,
      "step registered in execution cache"
    );
    self.steps.insert(step_name.to_string(), step_cache);
  }

  /// Store outputs of a batch-oriented step and return the indices written,
  /// after nested expansion.
  pub fn register_batch_of_step_outputs(
    &mut self,
    step_name: &str,
    indices: &[DynamicBatchIndex],
    outputs: Vec<Value>,
  ) -> Result<Vec<DynamicBatchIndex>, CacheError> {
    let cache = match self.step_mut(step_name)? {
      StepCache::Batch(cache) => cache,
      StepCache::NonBatch(_) => {
        return Err(CacheError::ModeMismatch {
          step_name: step_name.to_string(),
          operation: "registering batch outputs",
          batch_oriented: false,
        });
      }
    };

    let registered =
      cache
        .register_outputs(indices, outputs)
        .map_err(|source| CacheError::BlockContract {
          step_name: step_name.to_string(),
          source,
        })?;

    debug!(
      step_name = %step_name,
      requested = indices.len(),
      registered = registered.len(),
      "batch outputs registered"
    );
    self.step_outputs_registered.insert(step_name.to_string());
    Ok(registered)
  }

  /// Store (replacing) the outputs of a non-batch step.
  pub fn register_non_batch_step_outputs(
    &mut self,
    step_name: &str,
    outputs: Value,
  ) -> Result<(), CacheError> {
    let cache = match self.step_mut(step_name)? {
      StepCache::NonBatch(cache) => cache,
      StepCache::Batch(_) => {
        return Err(CacheError::ModeMismatch {
          step_name: step_name.to_string(),
          operation: "registering non-batch outputs",
          batch_oriented: true,
        });
      }
    };

    cache
      .register_outputs(outputs)
      .map_err(|source| CacheError::BlockContract {
        step_name: step_name.to_string(),
        source,
      })?;

    debug!(step_name = %step_name, "non-batch outputs registered");
    self.step_outputs_registered.insert(step_name.to_string());
    Ok(())
  }

  /// Values of a batch step output for each index.
  pub fn get_batch_output(
    &self,
    selector: &str,
    batch_elements_indices: &[DynamicBatchIndex],
    mask: Option<&HashSet<DynamicBatchIndex>>,
  ) -> Result<Vec<Option<&Value>>, CacheError> {
    let output = self.registered_selector(selector)?;
    match self.step(&output.step_name)? {
      StepCache::Batch(cache) => {
        Ok(cache.get_outputs(&output.property_name, batch_elements_indices, mask))
      }
      StepCache::NonBatch(_) => Err(CacheError::ModeMismatch {
        step_name: output.step_name,
        operation: "batch output lookup",
        batch_oriented: false,
      }),
    }
  }

  /// Value of a non-batch step output.
  pub fn get_non_batch_output(&self, selector: &str) -> Result<Option<&Value>, CacheError> {
    let output = self.registered_selector(selector)?;
    match self.step(&output.step_name)? {
      StepCache::NonBatch(cache) => Ok(cache.get_outputs(&output.property_name)),
      StepCache::Batch(_) => Err(CacheError::ModeMismatch {
        step_name: output.step_name,
        operation: "non-batch output lookup",
        batch_oriented: true,
      }),
    }
  }

  /// Every output of a batch step for each index.
  pub fn get_all_batch_step_outputs(
    &self,
    step_name: &str,
    batch_elements_indices: &[DynamicBatchIndex],
    mask: Option<&HashSet<DynamicBatchIndex>>,
  ) -> Result<Vec<BTreeMap<String, Option<Value>>>, CacheError> {
    match self.step(step_name)? {
      StepCache::Batch(cache) => Ok(cache.get_all_outputs(batch_elements_indices, mask)),
      StepCache::NonBatch(_) => Err(CacheError::ModeMismatch {
        step_name: step_name.to_string(),
        operation: "batch lookup of all outputs",
        batch_oriented: false,
      }),
    }
  }

  /// Every output of a non-batch step.
  pub fn get_all_non_batch_step_outputs(
    &self,
    step_name: &str,
  ) -> Result<BTreeMap<String, Option<Value>>, CacheError> {
    match self.step(step_name)? {
      StepCache::NonBatch(cache) => Ok(cache.get_all_outputs()),
      StepCache::Batch(_) => Err(CacheError::ModeMismatch {
        step_name: step_name.to_string(),
        operation: "non-batch lookup of all outputs",
        batch_oriented: true,
      }),
    }
  }

  /// Whether the step produces batch outputs.
  pub fn step_outputs_batches(&self, step_name: &str) -> Result<bool, CacheError> {
    Ok(self.step(step_name)?.is_batch())
  }

  /// Whether `selector` names a step output that is declared or has been
  /// written. Never fails: malformed selectors and unknown steps yield `false`.
  pub fn is_value_registered(&self, selector: &str) -> bool {
    let Ok(output) = selector.parse::<StepOutputSelector>() else {
      return false;
    };
    if output.property_name == WILDCARD_PROPERTY {
      return false;
    }
    self
      .steps
      .get(&output.step_name)
      .is_some_and(|cache| cache.is_property_defined(&output.property_name))
  }

  /// Whether any output registration for the step has succeeded.
  pub fn is_step_output_registered(&self, step_name: &str) -> Result<bool, CacheError> {
    self.step(step_name)?;
    Ok(self.step_outputs_registered.contains(step_name))
  }

  pub fn contains_step(&self, step_name: &str) -> bool {
    self.steps.contains_key(step_name)
  }

  fn step(&self, step_name: &str) -> Result<&StepCache, CacheError> {
    self
      .steps
      .get(step_name)
      .ok_or_else(|| CacheError::UnknownStep {
        step_name: step_name.to_string(),
      })
  }

  fn step_mut(&mut self, step_name: &str) -> Result<&mut StepCache, CacheError> {
    self
      .steps
      .get_mut(step_name)
      .ok_or_else(|| CacheError::UnknownStep {
        step_name: step_name.to_string(),
      })
  }

  fn registered_selector(&self, selector: &str) -> Result<StepOutputSelector, CacheError> {
    if !self.is_value_registered(selector) {
      return Err(CacheError::UnregisteredSelector {
        selector: selector.to_string(),
      });
    }
    selector
      .parse()
      .map_err(|_| CacheError::UnregisteredSelector {
        selector: selector.to_string(),
      })
  }
}
