//! Trellis Runtime
//!
//! This crate provides the workflow runtime for Trellis: the execution cache
//! that holds every step's outputs during a run, the dynamic batch indices
//! that address those outputs, and the [`Runtime`] that schedules blocks and
//! feeds the cache.
//!
//! The lowest-level primitives are [`BatchStepCache`] and
//! [`NonBatchStepCache`]. [`ExecutionCache`] routes selector-based reads and
//! writes to them, and [`Runtime`] drives the cache from a compiled
//! [`trellis_workflow::Workflow`].

mod batch_index;
mod block;
mod cache;
mod error;
mod input;
mod result;
mod runtime;
mod step_cache;

pub use batch_index::DynamicBatchIndex;
pub use block::{Block, BlockError, BlockInput, BlockRegistry};
pub use cache::ExecutionCache;
pub use error::{CacheError, OutputContractError, RuntimeError};
pub use result::{InvokeResult, StepResult};
pub use runtime::{Runtime, RuntimeConfig};
pub use step_cache::{BatchStepCache, NonBatchStepCache};
