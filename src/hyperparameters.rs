//! Description of the flat hyperparameter vector of a model.
//!
//! The hyperparameters of every model are exchanged as a single flat vector
//! laid out as: likelihood block(s), then kernel block(s), then the mean value.
//! Each contiguous block is described by a [`HyperBlock`].

use std::fmt;
use std::ops::Range;

#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Named contiguous block of the flat hyperparameter vector
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct HyperBlock {
    /// Block name used to attach priors (ie "sn", "sf", "ell", "mean")
    pub name: String,
    /// Position of the block in the flat hyperparameter vector
    pub range: Range<usize>,
    /// Whether the block stores the log of the natural parameter value
    pub logged: bool,
}

impl HyperBlock {
    /// Constructor
    pub fn new(name: &str, range: Range<usize>, logged: bool) -> Self {
        HyperBlock {
            name: name.to_string(),
            range,
            logged,
        }
    }

    /// Block size
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// Whether the block is empty
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Same block moved `offset` positions further in the flat vector
    pub fn shifted(&self, offset: usize) -> Self {
        HyperBlock {
            name: self.name.clone(),
            range: (self.range.start + offset)..(self.range.end + offset),
            logged: self.logged,
        }
    }
}

impl fmt::Display for HyperBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = if self.logged {
            format!("log({})", self.name)
        } else {
            self.name.clone()
        };
        write!(f, "{}[{}..{}]", name, self.range.start, self.range.end)
    }
}

/// Lays out likelihood, kernel and mean blocks in the model flat vector.
pub(crate) fn layout(likelihood: Vec<HyperBlock>, kernel: Vec<HyperBlock>) -> Vec<HyperBlock> {
    let nlik: usize = likelihood.iter().map(|b| b.len()).sum();
    let nkern: usize = kernel.iter().map(|b| b.len()).sum();
    let mut blocks = likelihood;
    blocks.extend(kernel.iter().map(|b| b.shifted(nlik)));
    blocks.push(HyperBlock::new("mean", (nlik + nkern)..(nlik + nkern + 1), false));
    blocks
}
