//! Selector grammar.
//!
//! Selectors are dotted references into the workflow graph:
//!
//! - `$inputs.<name>`: a workflow input
//! - `$steps.<step>`: a step as a whole
//! - `$steps.<step>.<property>`: one output property of a step
//! - `$outputs.<name>`: a requested workflow output
//!
//! `$steps.<step>.*` selects every output of a step and is only meaningful
//! for workflow outputs.

use std::fmt;
use std::str::FromStr;

use crate::error::WorkflowError;

pub const INPUTS_PREFIX: &str = "$inputs";
pub const STEPS_PREFIX: &str = "$steps";
pub const OUTPUTS_PREFIX: &str = "$outputs";

/// Property name selecting every output of a step.
pub const WILDCARD_PROPERTY: &str = "*";

/// A parsed selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
  Input(String),
  Step(String),
  StepOutput(StepOutputSelector),
  Output(String),
}

impl Selector {
  /// Parse a selector, returning `None` for anything that is not one.
  ///
  /// Non-selectors are not an error: step parameters that fail to parse are
  /// treated as literal values.
  pub fn parse(value: &str) -> Option<Self> {
    let mut chunks = value.split('.');
    let prefix = chunks.next()?;
    let chunks: Vec<&str> = chunks.collect();
    if chunks.iter().any(|c| c.is_empty()) {
      return None;
    }

    match (prefix, chunks.as_slice()) {
      (INPUTS_PREFIX, [name]) => Some(Self::Input(name.to_string())),
      (STEPS_PREFIX, [step]) => Some(Self::Step(step.to_string())),
      (STEPS_PREFIX, [step, property]) => Some(Self::StepOutput(StepOutputSelector::new(
        *step, *property,
      ))),
      (OUTPUTS_PREFIX, [name]) => Some(Self::Output(name.to_string())),
      _ => None,
    }
  }
}

/// Reference to one output property of a step, e.g. `$steps.detect.predictions`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepOutputSelector {
  pub step_name: String,
  pub property_name: String,
}

impl StepOutputSelector {
  pub fn new(step_name: impl Into<String>, property_name: impl Into<String>) -> Self {
    Self {
      step_name: step_name.into(),
      property_name: property_name.into(),
    }
  }

  /// Whether this selects every output of the step.
  pub fn is_wildcard(&self) -> bool {
    self.property_name == WILDCARD_PROPERTY
  }

  /// The selector of the step this output belongs to.
  pub fn step_selector(&self) -> String {
    step_selector(&self.step_name)
  }
}

impl FromStr for StepOutputSelector {
  type Err = WorkflowError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match Selector::parse(s) {
      Some(Selector::StepOutput(selector)) => Ok(selector),
      _ => Err(WorkflowError::InvalidSelector(s.to_string())),
    }
  }
}

impl fmt::Display for StepOutputSelector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}.{}", STEPS_PREFIX, self.step_name, self.property_name)
  }
}

/// Whether `value` is a `$steps.<step>.<property>` selector.
pub fn is_step_output_selector(value: &str) -> bool {
  matches!(Selector::parse(value), Some(Selector::StepOutput(_)))
}

pub fn input_selector(name: &str) -> String {
  format!("{}.{}", INPUTS_PREFIX, name)
}

pub fn step_selector(step_name: &str) -> String {
  format!("{}.{}", STEPS_PREFIX, step_name)
}

pub fn output_selector(name: &str) -> String {
  format!("{}.{}", OUTPUTS_PREFIX, name)
}
