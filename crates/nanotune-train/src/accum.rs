//! Gradient accumulation across micro-batches.

use std::collections::BTreeMap;

use nanotune_core::{NanoTuneError, Result};
use nanotune_tensor::{ops, MemoryCategory, Tensor};

/// Parameter-name-keyed accumulator tensors, shaped like their parameters.
#[derive(Debug, Default)]
pub struct GradientAccumulator {
    entries: BTreeMap<String, Tensor>,
}

impl GradientAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Element-wise add `grad` into the accumulator for `name`, allocating a
    /// Gradients-category buffer on first sight.
    pub fn add(&mut self, name: &str, grad: &Tensor) -> Result<()> {
        match self.entries.get_mut(name) {
            Some(acc) => {
                if acc.shape() != grad.shape() {
                    return Err(NanoTuneError::shape(
                        &format!("accumulator {}", name),
                        acc.shape(),
                        grad.shape(),
                    ));
                }
                ops::add_assign(acc, grad)
            }
            None => {
                self.entries
                    .insert(name.to_string(), grad.duplicate(MemoryCategory::Gradients)?);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries.get(name)
    }

    /// Accumulated gradients in ascending name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries.
    pub fn zero(&mut self) {
        self.entries.clear();
    }
}
