//! Per-step output stores.
//!
//! [`BatchStepCache`] keeps one value per dynamic batch index and output
//! property; [`NonBatchStepCache`] keeps a single mapping written once per
//! run.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde_json::{Map, Value};
use trellis_workflow::OutputDefinition;

use crate::batch_index::{DynamicBatchIndex, MaskFilter};
use crate::error::OutputContractError;

/// Outputs of a batch-oriented step, keyed by property then batch index.
#[derive(Debug)]
pub struct BatchStepCache {
  step_name: String,
  declared_outputs: BTreeSet<String>,
  content: HashMap<String, HashMap<DynamicBatchIndex, Value>>,
}

impl BatchStepCache {
  pub fn new(step_name: impl Into<String>, outputs: &[OutputDefinition]) -> Self {
    Self {
      step_name: step_name.into(),
      declared_outputs: outputs.iter().map(|o| o.name.clone()).collect(),
      content: HashMap::new(),
    }
  }

  pub fn step_name(&self) -> &str {
    &self.step_name
  }

  /// Register outputs produced for `indices`.
  ///
  /// Each output is either a mapping (one result for its index) or a list of
  /// mappings, in which case index `i` expands into `i.child(0)`,
  /// `i.child(1)`, ... All outputs of one call must use the same form. The
  /// call is validated as a whole before anything is written.
  ///
  /// Returns the indices actually written, after expansion.
  pub fn register_outputs(
    &mut self,
    indices: &[DynamicBatchIndex],
    outputs: Vec<Value>,
  ) -> Result<Vec<DynamicBatchIndex>, OutputContractError> {
    if indices.len() != outputs.len() {
      return Err(OutputContractError::Misaligned {
        indices: indices.len(),
        outputs: outputs.len(),
      });
    }

    let nested = outputs.iter().filter(|o| o.is_array()).count();
    if nested > 0 && nested != outputs.len() {
      return Err(OutputContractError::ShapeMismatch);
    }

    let mut entries = Vec::with_capacity(outputs.len());
    for (index, output) in indices.iter().zip(outputs) {
      match output {
        Value::Array(elements) => {
          for (position, element) in elements.into_iter().enumerate() {
            let child = index.child(position);
            let mapping = into_mapping(&child, element)?;
            entries.push((child, mapping));
          }
        }
        other => {
          let mapping = into_mapping(index, other)?;
          entries.push((index.clone(), mapping));
        }
      }
    }

    let required = self.known_properties();
    for (_, mapping) in &entries {
      let actual: BTreeSet<String> = mapping.keys().cloned().collect();
      if actual != required {
        return Err(OutputContractError::PropertiesMismatch {
          step_name: self.step_name.clone(),
          expected: required,
          actual,
        });
      }
    }

    let mut registered = Vec::with_capacity(entries.len());
    for (index, mapping) in entries {
      for (property_name, value) in mapping {
        self
          .content
          .entry(property_name)
          .or_default()
          .insert(index.clone(), value);
      }
      registered.push(index);
    }

    Ok(registered)
  }

  /// Values of one property for each index.
  ///
  /// `None` marks an index that was never written or is excluded by `mask`;
  /// a block that wrote `null` yields `Some(Value::Null)`.
  pub fn get_outputs(
    &self,
    property_name: &str,
    indices: &[DynamicBatchIndex],
    mask: Option<&HashSet<DynamicBatchIndex>>,
  ) -> Vec<Option<&Value>> {
    let filter = MaskFilter::new(mask);
    let values = self.content.get(property_name);
    indices
      .iter()
      .map(|index| {
        if !filter.admits(index) {
          return None;
        }
        values.and_then(|v| v.get(index))
      })
      .collect()
  }

  /// Every known property for each index, with the same masking rule as
  /// [`BatchStepCache::get_outputs`].
  pub fn get_all_outputs(
    &self,
    indices: &[DynamicBatchIndex],
    mask: Option<&HashSet<DynamicBatchIndex>>,
  ) -> Vec<BTreeMap<String, Option<Value>>> {
    let filter = MaskFilter::new(mask);
    let properties = self.known_properties();
    indices
      .iter()
      .map(|index| {
        let admitted = filter.admits(index);
        properties
          .iter()
          .map(|property_name| {
            let value = admitted
              .then(|| self.content.get(property_name).and_then(|v| v.get(index)))
              .flatten()
              .cloned();
            (property_name.clone(), value)
          })
          .collect()
      })
      .collect()
  }

  pub fn is_property_defined(&self, property_name: &str) -> bool {
    self.content.contains_key(property_name) || self.declared_outputs.contains(property_name)
  }

  /// Registered property names, or the declared outputs before the first write.
  fn known_properties(&self) -> BTreeSet<String> {
    if self.content.is_empty() {
      return self.declared_outputs.clone();
    }
    self.content.keys().cloned().collect()
  }
}

/// Outputs of a step that runs once per workflow run.
#[derive(Debug)]
pub struct NonBatchStepCache {
  step_name: String,
  declared_outputs: BTreeSet<String>,
  content: Map<String, Value>,
}

impl NonBatchStepCache {
  pub fn new(step_name: impl Into<String>, outputs: &[OutputDefinition]) -> Self {
    Self {
      step_name: step_name.into(),
      declared_outputs: outputs.iter().map(|o| o.name.clone()).collect(),
      content: Map::new(),
    }
  }

  pub fn step_name(&self) -> &str {
    &self.step_name
  }

  /// Replace the step's outputs. A second call discards the first, nothing
  /// is merged.
  pub fn register_outputs(&mut self, outputs: Value) -> Result<(), OutputContractError> {
    match outputs {
      Value::Object(mapping) => {
        self.content = mapping;
        Ok(())
      }
      other => Err(OutputContractError::NonBatchNotAMapping {
        found: json_type_name(&other),
      }),
    }
  }

  pub fn get_outputs(&self, property_name: &str) -> Option<&Value> {
    self.content.get(property_name)
  }

  /// Declared and registered properties with their current values; `None`
  /// for properties the step has not written.
  pub fn get_all_outputs(&self) -> BTreeMap<String, Option<Value>> {
    self
      .declared_outputs
      .iter()
      .chain(self.content.keys())
      .map(|property_name| {
        (
          property_name.clone(),
          self.content.get(property_name).cloned(),
        )
      })
      .collect()
  }

  pub fn is_property_defined(&self, property_name: &str) -> bool {
    self.content.contains_key(property_name) || self.declared_outputs.contains(property_name)
  }
}

fn into_mapping(
  index: &DynamicBatchIndex,
  value: Value,
) -> Result<Map<String, Value>, OutputContractError> {
  match value {
    Value::Object(mapping) => Ok(mapping),
    other => Err(OutputContractError::NotAMapping {
      index: index.clone(),
      found: json_type_name(&other),
    }),
  }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "a boolean",
    Value::Number(_) => "a number",
    Value::String(_) => "a string",
    Value::Array(_) => "a list",
    Value::Object(_) => "a mapping",
  }
}
