//! Name-keyed store of intermediate tensors for the backward path.
//!
//! The cache owns its saved tensors for the duration of one forward pass;
//! `clear()` between training steps is mandatory to bound memory.

use std::collections::HashMap;

use nanotune_core::{NanoTuneError, Result};
use nanotune_tensor::Tensor;

#[derive(Debug, Default)]
pub struct ActivationCache {
    entries: HashMap<String, Tensor>,
}

impl ActivationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save a tensor under a hierarchical name (e.g. "layer3.out-proj.pre").
    /// Saving twice under the same name replaces the previous entry.
    pub fn save(&mut self, name: impl Into<String>, tensor: Tensor) -> Result<()> {
        self.entries.insert(name.into(), tensor);
        Ok(())
    }

    /// Fetch a cached tensor; `MissingActivation` if absent.
    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.entries
            .get(name)
            .ok_or_else(|| NanoTuneError::MissingActivation(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries, releasing their bytes back to the accountant.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanotune_tensor::{MemoryAccountant, MemoryCategory};
    use std::sync::Arc;

    #[test]
    fn test_save_get_clear() {
        let acc = Arc::new(MemoryAccountant::new());
        let mut cache = ActivationCache::new();
        let t = Tensor::ones(&[4], MemoryCategory::Activations, &acc).unwrap();
        cache.save("layer0.out-proj.pre", t).unwrap();

        assert!(cache.contains("layer0.out-proj.pre"));
        assert_eq!(cache.get("layer0.out-proj.pre").unwrap().numel(), 4);
        assert!(matches!(
            cache.get("layer1.out-proj.pre"),
            Err(NanoTuneError::MissingActivation(_))
        ));

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(
            acc.snapshot().category(MemoryCategory::Activations).current,
            0
        );
    }
}
