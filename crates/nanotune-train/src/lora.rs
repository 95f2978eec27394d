//! Low-rank adapters fused onto the frozen quantized model.
//!
//! Each adapter is a trainable pair A [in_dim, r], B [r, out_dim] with
//! scaling alpha / r. A is initialized from a scaled normal
//! (std = 1/sqrt(in_dim)) and B from zeros, so the adapter contributes
//! exactly nothing until the first optimizer step.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use nanotune_core::{LoraConfig, NanoTuneError, Result, TargetModule};
use nanotune_model::{layer_kind, ForwardHooks, LayerKind, QuantizedModel};
use nanotune_tensor::{ops, MemoryAccountant, MemoryCategory, Tensor};

use crate::cache::ActivationCache;

/// One trainable low-rank pair attached to a named projection point.
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    pub name: String,
    /// Down projection [in_dim, rank].
    pub a: Tensor,
    /// Up projection [rank, out_dim], zero-initialized.
    pub b: Tensor,
    pub scaling: f32,
    pub dropout: f32,
}

impl LoraAdapter {
    pub fn new(
        name: impl Into<String>,
        in_dim: usize,
        out_dim: usize,
        config: &LoraConfig,
        rng: &mut StdRng,
        accountant: &Arc<MemoryAccountant>,
    ) -> Result<Self> {
        let std = 1.0 / (in_dim as f32).sqrt();
        let a = Tensor::randn(
            &[in_dim, config.rank],
            std,
            rng,
            MemoryCategory::ModelWeights,
            accountant,
        )?;
        let b = Tensor::zeros(
            &[config.rank, out_dim],
            MemoryCategory::ModelWeights,
            accountant,
        )?;
        Ok(Self {
            name: name.into(),
            a,
            b,
            scaling: config.scaling(),
            dropout: config.dropout,
        })
    }

    pub fn in_dim(&self) -> usize {
        self.a.shape()[0]
    }

    pub fn rank(&self) -> usize {
        self.a.shape()[1]
    }

    pub fn out_dim(&self) -> usize {
        self.b.shape()[1]
    }

    pub fn param_count(&self) -> usize {
        (self.in_dim() + self.out_dim()) * self.rank()
    }

    /// Adapter input after (optional) inverted dropout. The mask is drawn
    /// from a name-derived seed so a checkpoint-recompute replay reproduces
    /// it exactly.
    fn dropped_input(&self, x: &Tensor, dropout_seed: Option<u64>) -> Result<Tensor> {
        let seed = match dropout_seed {
            Some(s) if self.dropout > 0.0 => s,
            _ => return Ok(x.clone()),
        };
        let mut rng = StdRng::seed_from_u64(seed ^ fnv1a(&self.name));
        let keep = 1.0 - self.dropout;
        let data: Vec<f32> = x
            .data_f32()?
            .iter()
            .map(|&v| {
                if rng.gen::<f32>() < keep {
                    v / keep
                } else {
                    0.0
                }
            })
            .collect();
        Tensor::from_vec(data, x.shape(), x.category(), x.accountant())
    }

    /// Adapter delta: scaling * (x · A) · B.
    pub fn delta(&self, x: &Tensor) -> Result<Tensor> {
        if x.shape().last() != Some(&self.in_dim()) {
            return Err(NanoTuneError::shape(
                &format!("adapter {} input", self.name),
                &[self.in_dim()],
                x.shape(),
            ));
        }
        let xa = ops::matmul(x, &self.a)?;
        let xab = ops::matmul(&xa, &self.b)?;
        ops::scale(&xab, self.scaling)
    }
}

/// FNV-1a hash of a name, for per-adapter dropout streams.
fn fnv1a(s: &str) -> u64 {
    let mut h = 0xcbf29ce484222325u64;
    for b in s.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

/// Adapter set keyed by name. Iteration order is the ascending name order
/// the checkpoint format requires.
#[derive(Debug, Default)]
pub struct LoraSet {
    adapters: BTreeMap<String, LoraAdapter>,
}

impl LoraSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters for every configured target module present in the
    /// model's layer schedule. Targets with no matching projection in this
    /// architecture (attention-*, moe-experts) are skipped.
    pub fn for_model(
        model: &QuantizedModel,
        config: &LoraConfig,
        seed: u64,
    ) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut set = Self::new();
        for layer in 0..model.num_layers() {
            for target in &config.target_modules {
                let suffix = match (layer_kind(layer), target) {
                    (LayerKind::StateSpace, TargetModule::StateInProj) => "in-proj",
                    (LayerKind::StateSpace, TargetModule::StateXProj) => "x-proj",
                    (LayerKind::StateSpace, TargetModule::StateOutProj) => "out-proj",
                    (LayerKind::Moe, TargetModule::MoeRouter) => "router",
                    _ => continue,
                };
                let (in_dim, out_dim) = model.projection_dims(layer, suffix)?;
                let name = format!("layer{}.{}", layer, suffix);
                let adapter = LoraAdapter::new(
                    &name,
                    in_dim,
                    out_dim,
                    config,
                    &mut rng,
                    model.accountant(),
                )?;
                set.attach(adapter)?;
            }
        }
        Ok(set)
    }

    pub fn attach(&mut self, adapter: LoraAdapter) -> Result<()> {
        if self.adapters.contains_key(&adapter.name) {
            return Err(NanoTuneError::InvalidConfig(format!(
                "adapter '{}' already attached",
                adapter.name
            )));
        }
        self.adapters.insert(adapter.name.clone(), adapter);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&LoraAdapter> {
        self.adapters.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut LoraAdapter> {
        self.adapters.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Adapters in ascending name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &LoraAdapter)> {
        self.adapters.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut LoraAdapter)> {
        self.adapters.iter_mut()
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn total_params(&self) -> usize {
        self.adapters.values().map(|a| a.param_count()).sum()
    }
}

/// Forward hooks wiring the adapter set and activation cache into the model.
pub struct TrainHooks<'a> {
    pub adapters: &'a LoraSet,
    pub cache: &'a mut ActivationCache,
    /// When false (checkpointed forward with recompute), pre-activations are
    /// not saved; a backward-time replay re-enables caching.
    pub cache_enabled: bool,
    /// Dropout seed for this training step; None disables dropout
    /// (evaluation and plain forward passes).
    pub dropout_seed: Option<u64>,
}

impl ForwardHooks for TrainHooks<'_> {
    fn adapt(&mut self, name: &str, input: &Tensor, base: Tensor) -> Result<Tensor> {
        let adapter = match self.adapters.get(name) {
            Some(a) => a,
            None => return Ok(base),
        };
        let x = adapter.dropped_input(input, self.dropout_seed)?;
        if self.cache_enabled {
            self.cache.save(format!("{}.pre", name), x.clone())?;
        }
        let delta = adapter.delta(&x)?;
        ops::add(&base, &delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanotune_core::ModelConfig;

    fn acc() -> Arc<MemoryAccountant> {
        Arc::new(MemoryAccountant::new())
    }

    fn adapter(in_dim: usize, out_dim: usize, rank: usize) -> (LoraAdapter, Arc<MemoryAccountant>) {
        let a = acc();
        let config = LoraConfig {
            rank,
            alpha: 2.0 * rank as f32,
            dropout: 0.0,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        (
            LoraAdapter::new("layer0.out-proj", in_dim, out_dim, &config, &mut rng, &a).unwrap(),
            a,
        )
    }

    #[test]
    fn test_zero_init_contributes_nothing() {
        let (ad, a) = adapter(8, 4, 2);
        let mut rng = StdRng::seed_from_u64(9);
        let x = Tensor::randn(&[3, 8], 1.0, &mut rng, MemoryCategory::Activations, &a).unwrap();
        let delta = ad.delta(&x).unwrap();
        // B = 0 so the adapter output is exactly zero, bit for bit.
        assert!(delta.data_f32().unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_param_count() {
        let (ad, _a) = adapter(8, 4, 2);
        assert_eq!(ad.param_count(), (8 + 4) * 2);
        assert_eq!(ad.scaling, 2.0);
    }

    #[test]
    fn test_a_init_scale() {
        let (ad, _acc) = adapter(1024, 4, 8);
        let data = ad.a.data_f32().unwrap();
        let std_expected = 1.0 / (1024.0f32).sqrt();
        let var: f32 =
            data.iter().map(|&x| x * x).sum::<f32>() / data.len() as f32;
        assert!(
            (var.sqrt() - std_expected).abs() < std_expected * 0.2,
            "std {} vs expected {}",
            var.sqrt(),
            std_expected
        );
    }

    #[test]
    fn test_delta_shape_mismatch() {
        let (ad, a) = adapter(8, 4, 2);
        let x = Tensor::zeros(&[3, 7], MemoryCategory::Activations, &a).unwrap();
        assert!(ad.delta(&x).is_err());
    }

    #[test]
    fn test_dropout_replay_is_deterministic() {
        let (mut ad, a) = adapter(16, 4, 2);
        ad.dropout = 0.5;
        let mut rng = StdRng::seed_from_u64(11);
        let x = Tensor::randn(&[4, 16], 1.0, &mut rng, MemoryCategory::Activations, &a).unwrap();
        let d1 = ad.dropped_input(&x, Some(99)).unwrap();
        let d2 = ad.dropped_input(&x, Some(99)).unwrap();
        assert_eq!(d1.data_f32().unwrap(), d2.data_f32().unwrap());
        let d3 = ad.dropped_input(&x, Some(100)).unwrap();
        assert_ne!(d1.data_f32().unwrap(), d3.data_f32().unwrap());
    }

    #[test]
    fn test_for_model_attaches_schedule_targets() {
        let mut config = ModelConfig::tiny();
        config.num_layers = 4;
        let accountant = acc();
        let model = QuantizedModel::new_random(config, 1, accountant).unwrap();
        let lora = LoraConfig {
            rank: 4,
            alpha: 8.0,
            dropout: 0.0,
            target_modules: vec![TargetModule::StateOutProj, TargetModule::MoeRouter],
        };
        let set = LoraSet::for_model(&model, &lora, 2).unwrap();
        assert_eq!(
            set.names(),
            vec![
                "layer0.out-proj",
                "layer1.out-proj",
                "layer2.out-proj",
                "layer3.router"
            ]
        );
        assert!(set.total_params() > 0);
    }

    #[test]
    fn test_hooks_pass_through_unknown_names() {
        let a = acc();
        let set = LoraSet::new();
        let mut cache = ActivationCache::new();
        let mut hooks = TrainHooks {
            adapters: &set,
            cache: &mut cache,
            cache_enabled: true,
            dropout_seed: None,
        };
        let x = Tensor::ones(&[2, 2], MemoryCategory::Activations, &a).unwrap();
        let base = Tensor::ones(&[2, 3], MemoryCategory::Activations, &a).unwrap();
        let out = hooks.adapt("layer0.out-proj", &x, base.clone()).unwrap();
        assert_eq!(out.data_f32().unwrap(), base.data_f32().unwrap());
        assert_eq!(cache.len(), 0);
    }
}
