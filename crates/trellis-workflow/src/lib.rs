//! Trellis Workflow
//!
//! This crate provides the compiled execution graph consumed by the Trellis
//! runtime. A compiled workflow is a validated set of nodes where:
//!
//! - Inputs (`$inputs.*`) are either batch-oriented or scalar
//! - Steps (`$steps.*`) carry a manifest with their block type, parameters
//!   and declared outputs, plus their batch orientation
//! - Outputs (`$outputs.*`) name the step outputs returned to the caller
//! - Edges are derived from the selectors nodes read from
//!
//! Turning a user-facing workflow definition into this form is the job of the
//! compiler and lives outside this crate.

mod error;
mod graph;
mod node;
pub mod selector;
mod workflow;

pub use error::WorkflowError;
pub use graph::Graph;
pub use node::{InputNode, Node, NodeType, OutputDefinition, OutputNode, StepManifest, StepNode};
pub use selector::{Selector, StepOutputSelector};
pub use workflow::Workflow;
