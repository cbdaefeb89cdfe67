//! Dynamic batch indices.
//!
//! Every batch element carries the path it took through nested batch
//! expansions: `(2,)` is the third top-level element, `(2, 0)` the first
//! item produced when a step expanded `(2,)` into several outputs.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of one batch element across nested batch expansions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DynamicBatchIndex(Vec<usize>);

impl DynamicBatchIndex {
  pub fn new(path: Vec<usize>) -> Self {
    Self(path)
  }

  /// Index of a top-level batch element.
  pub fn root(position: usize) -> Self {
    Self(vec![position])
  }

  /// Index of the `sub_index`-th item this element expanded into.
  pub fn child(&self, sub_index: usize) -> Self {
    let mut path = Vec::with_capacity(self.0.len() + 1);
    path.extend_from_slice(&self.0);
    path.push(sub_index);
    Self(path)
  }

  /// Truncate to at most `depth` levels.
  pub fn prefix(&self, depth: usize) -> Self {
    Self(self.0[..depth.min(self.0.len())].to_vec())
  }

  pub fn starts_with(&self, prefix: &DynamicBatchIndex) -> bool {
    self.0.starts_with(&prefix.0)
  }

  /// Number of nesting levels.
  pub fn depth(&self) -> usize {
    self.0.len()
  }

  pub fn as_slice(&self) -> &[usize] {
    &self.0
  }

  /// Whether the element is live under `mask`.
  ///
  /// The index is truncated to the length of the mask entries and looked up;
  /// masks mixing entry lengths admit the index if any length matches. No
  /// mask admits everything, an empty mask admits nothing.
  pub fn is_admitted_by(&self, mask: Option<&HashSet<DynamicBatchIndex>>) -> bool {
    MaskFilter::new(mask).admits(self)
  }

  fn is_admitted_at(&self, mask: &HashSet<DynamicBatchIndex>, depth: usize) -> bool {
    if depth > self.0.len() {
      return false;
    }
    mask.contains(&self.prefix(depth))
  }
}

/// Admission check for filtering many indices against one mask, with the
/// distinct entry lengths computed once.
pub(crate) struct MaskFilter<'a> {
  mask: Option<(&'a HashSet<DynamicBatchIndex>, BTreeSet<usize>)>,
}

impl<'a> MaskFilter<'a> {
  pub(crate) fn new(mask: Option<&'a HashSet<DynamicBatchIndex>>) -> Self {
    Self {
      mask: mask.map(|m| (m, m.iter().map(DynamicBatchIndex::depth).collect())),
    }
  }

  pub(crate) fn admits(&self, index: &DynamicBatchIndex) -> bool {
    match &self.mask {
      None => true,
      Some((mask, depths)) => depths.iter().any(|d| index.is_admitted_at(mask, *d)),
    }
  }
}

impl From<Vec<usize>> for DynamicBatchIndex {
  fn from(path: Vec<usize>) -> Self {
    Self(path)
  }
}

impl<const N: usize> From<[usize; N]> for DynamicBatchIndex {
  fn from(path: [usize; N]) -> Self {
    Self(path.to_vec())
  }
}

impl fmt::Display for DynamicBatchIndex {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "(")?;
    for (i, position) in self.0.iter().enumerate() {
      if i > 0 {
        write!(f, ", ")?;
      }
      write!(f, "{}", position)?;
    }
    if self.0.len() == 1 {
      write!(f, ",")?;
    }
    write!(f, ")")
  }
}
